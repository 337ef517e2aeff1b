pub mod config;
pub mod error;
pub mod extractor;
pub mod http;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod tool;
pub mod traits;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{EngineConfig, ServiceConfig, RESOURCE_PREFIX};
pub use error::{ConfigError, ErrorBody, ErrorDetail, ErrorKind, ExtractionError, JobFailure};
pub use extractor::{parse_engine_output, Pdffigures2Engine};
pub use http::router;
pub use models::{
    BoundingBox, DocumentReference, DocumentSummary, ExtractedRegion, ExtractionResult,
    ExtractionStats, FigureKind, JobStage, JobStatus, RawEngineOutput, RawRegion,
};
pub use normalize::{normalize, resource_url, NormalizedOutput};
pub use orchestrator::{ExtractionJob, JobOrchestrator};
pub use tool::{RpcRequest, RpcResponse, EXTRACT_TOOL_NAME};
pub use traits::FigureEngine;
pub use workspace::{validate_document, Workspace, WorkspaceManager};
