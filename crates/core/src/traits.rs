use crate::{ExtractionError, RawEngineOutput};
use async_trait::async_trait;
use std::path::Path;

/// An external figure/table detector.
///
/// `output_dir` is owned by the caller's workspace; implementations may clear
/// and repopulate it on every call.
#[async_trait]
pub trait FigureEngine: Send + Sync {
    async fn invoke(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<RawEngineOutput, ExtractionError>;

    fn name(&self) -> &str;
}
