//! HTTP front ends: the synchronous extraction endpoint, the JSON-RPC tool
//! endpoint, and the read-only resource server for published artifacts.

use crate::config::RESOURCE_PREFIX;
use crate::error::{ErrorBody, ErrorKind, ExtractionError, JobFailure};
use crate::models::DocumentReference;
use crate::orchestrator::JobOrchestrator;
use crate::tool::{self, RpcRequest, RpcResponse};
use crate::traits::FigureEngine;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Multipart framing and form fields on top of the document itself.
const BODY_OVERHEAD_BYTES: usize = 1024 * 1024;

pub fn router<E>(orchestrator: Arc<JobOrchestrator<E>>) -> Router
where
    E: FigureEngine + 'static,
{
    let config = orchestrator.config();
    let body_limit = usize::try_from(config.max_document_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_OVERHEAD_BYTES);
    let resources = ServeDir::new(config.artifact_root());

    let api = Router::new()
        .route("/health", get(health::<E>))
        .route("/extract", post(extract::<E>));

    Router::new()
        .route("/", get(root))
        .nest("/api", api)
        .route("/mcp", post(tool_call::<E>))
        .nest_service(&format!("/{RESOURCE_PREFIX}"), resources)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "PDF Figure Extraction Server",
        "api_base": "/api",
        "mcp_endpoint": "/mcp",
        "resources": format!("/{RESOURCE_PREFIX}"),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    active_jobs: usize,
    max_concurrent_jobs: usize,
}

async fn health<E>(State(orchestrator): State<Arc<JobOrchestrator<E>>>) -> Json<HealthResponse>
where
    E: FigureEngine + 'static,
{
    Json(HealthResponse {
        status: "healthy",
        service: "figure-extraction-server",
        active_jobs: orchestrator.active_jobs(),
        max_concurrent_jobs: orchestrator.config().max_concurrent_jobs,
    })
}

async fn extract<E>(
    State(orchestrator): State<Arc<JobOrchestrator<E>>>,
    request: Request,
) -> Response
where
    E: FigureEngine + 'static,
{
    let reference = match read_submission(request).await {
        Ok(reference) => reference,
        Err(error) => return error_response(&error, ErrorBody::from(&error)),
    };

    match orchestrator.run(reference).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(failure) => failure.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct UrlForm {
    pdf_url: Option<String>,
}

/// Reads `file` and/or `pdf_url` from a multipart or url-encoded form.
async fn read_submission(request: Request) -> Result<DocumentReference, ExtractionError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|rejection| ExtractionError::input(rejection.body_text()))?;

        let mut upload = None;
        let mut url = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|error| ExtractionError::input(format!("malformed multipart body: {error}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let filename = field.file_name().unwrap_or_default().to_string();
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|error| ExtractionError::input(format!("cannot read upload: {error}")))?;

                    // Browsers submit an unnamed, empty part when no file was chosen.
                    if filename.is_empty() && bytes.is_empty() {
                        continue;
                    }
                    let filename = if filename.is_empty() {
                        "document.pdf".to_string()
                    } else {
                        filename
                    };
                    upload = Some((filename, bytes.to_vec()));
                }
                "pdf_url" => {
                    let value = field
                        .text()
                        .await
                        .map_err(|error| ExtractionError::input(format!("cannot read pdf_url: {error}")))?;
                    url = Some(value);
                }
                _ => {}
            }
        }

        return DocumentReference::from_parts(upload, url);
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(form) = Form::<UrlForm>::from_request(request, &())
            .await
            .map_err(|rejection| ExtractionError::input(rejection.body_text()))?;
        return DocumentReference::from_parts(None, form.pdf_url);
    }

    Err(ExtractionError::input(
        "expected a multipart/form-data or application/x-www-form-urlencoded body",
    ))
}

async fn tool_call<E>(State(orchestrator): State<Arc<JobOrchestrator<E>>>, body: Bytes) -> Response
where
    E: FigureEngine + 'static,
{
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return Json(RpcResponse::parse_error(format!("invalid json-rpc request: {error}")))
                .into_response()
        }
    };

    match tool::dispatch(&orchestrator, request).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InputError => StatusCode::BAD_REQUEST,
        ErrorKind::BackpressureError => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::EngineError => StatusCode::BAD_GATEWAY,
        ErrorKind::EngineTimeoutError => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::StorageError | ErrorKind::EngineOutputError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &ExtractionError, body: ErrorBody) -> Response {
    let status = status_for(error.kind());
    let mut response = (status, Json(body)).into_response();
    if error.kind() == ErrorKind::BackpressureError {
        response
            .headers_mut()
            .insert(RETRY_AFTER, axum::http::HeaderValue::from_static("1"));
    }
    response
}

impl IntoResponse for JobFailure {
    fn into_response(self) -> Response {
        error_response(&self.error, self.to_body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::models::ExtractionResult;
    use crate::test_support::{FakeEngine, PDF, PNG_SIGNATURE};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "figure-extract-test-boundary";

    fn app(root: &Path, engine: FakeEngine) -> Result<(Router, Arc<JobOrchestrator<FakeEngine>>), ExtractionError> {
        let mut config = ServiceConfig::default()
            .with_output_root(root)
            .with_public_base_url("http://figures.test")
            .expect("static url");
        config.max_concurrent_jobs = 1;
        config.download_timeout = Duration::from_secs(2);
        let orchestrator = Arc::new(JobOrchestrator::new(Arc::new(config), engine)?);
        Ok((router(orchestrator.clone()), orchestrator))
    }

    fn multipart_body(file: Option<(&str, &[u8])>, pdf_url: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some((filename, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/pdf\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        if let Some(url) = pdf_url {
            body.extend_from_slice(
                format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"pdf_url\"\r\n\r\n{url}\r\n")
                    .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(file: Option<(&str, &[u8])>, pdf_url: Option<&str>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/api/extract")
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(multipart_body(file, pdf_url)))
            .expect("request")
    }

    async fn body_json(response: Response) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn serve_pdf() -> std::io::Result<String> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let documents = Router::new()
            .route(
                "/paper.pdf",
                get(|| async { ([(CONTENT_TYPE, "application/pdf")], PDF) }),
            )
            .route("/missing.pdf", get(|| async { StatusCode::NOT_FOUND }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, documents).await;
        });
        Ok(format!("http://{address}"))
    }

    #[tokio::test]
    async fn upload_returns_regions_with_resource_urls() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempdir()?;
        let (app, _) = app(root.path(), FakeEngine::default())?;

        let response = app
            .clone()
            .oneshot(multipart_request(Some(("paper.pdf", PDF)), None))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);

        let result: ExtractionResult = serde_json::from_value(body_json(response).await?)?;
        assert_eq!(result.regions.len(), 2);
        assert_eq!(result.stats.tables, 1);
        assert_eq!(result.stats.figures, 1);

        for region in &result.regions {
            let url = region.render_url.as_deref().expect("render url");
            let path = url.strip_prefix("http://figures.test").expect("public base");
            assert!(path.starts_with("/resources/"));

            let image = app
                .clone()
                .oneshot(HttpRequest::builder().uri(path).body(Body::empty())?)
                .await?;
            assert_eq!(image.status(), StatusCode::OK);
            let bytes = image.into_body().collect().await?.to_bytes();
            assert!(bytes.starts_with(PNG_SIGNATURE));
        }
        Ok(())
    }

    #[tokio::test]
    async fn both_or_neither_source_is_bad_request() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempdir()?;
        let engine = FakeEngine::default();
        let calls = engine.calls.clone();
        let (app, _) = app(root.path(), engine)?;

        let both = app
            .clone()
            .oneshot(multipart_request(
                Some(("paper.pdf", PDF)),
                Some("https://example.org/paper.pdf"),
            ))
            .await?;
        assert_eq!(both.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(both).await?["error"]["kind"], "InputError");

        let neither = app.clone().oneshot(multipart_request(None, None)).await?;
        assert_eq!(neither.status(), StatusCode::BAD_REQUEST);

        let json_body = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/extract")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))?,
            )
            .await?;
        assert_eq!(json_body.status(), StatusCode::BAD_REQUEST);

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(root.path().join("work"))?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn empty_file_part_defers_to_url() -> Result<(), Box<dyn std::error::Error>> {
        let base = serve_pdf().await?;
        let root = tempdir()?;
        let engine = FakeEngine::default();
        let calls = engine.calls.clone();
        let (app, _) = app(root.path(), engine)?;

        let response = app
            .oneshot(multipart_request(Some(("", &b""[..])), Some(&format!("{base}/paper.pdf"))))
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let result: ExtractionResult = serde_json::from_value(body_json(response).await?)?;
        assert_eq!(result.document.file_name, "paper.pdf");
        assert_eq!(result.regions.len(), 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_upload_creates_no_artifacts() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempdir()?;
        let (app, _) = app(root.path(), FakeEngine::default())?;

        let response = app
            .oneshot(multipart_request(Some(("paper.pdf", &b"PK\x03\x04 zip archive"[..])), None))
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await?;
        assert_eq!(body["error"]["kind"], "InputError");
        assert!(body["error"]["jobId"].is_string());
        assert!(!root.path().join("artifacts").exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_remote_document_skips_engine() -> Result<(), Box<dyn std::error::Error>> {
        let base = serve_pdf().await?;
        let root = tempdir()?;
        let engine = FakeEngine::default();
        let calls = engine.calls.clone();
        let (app, _) = app(root.path(), engine)?;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/extract")
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(format!("pdf_url={base}/missing.pdf")))?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await?["error"]["kind"], "InputError");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn sync_and_tool_entry_points_agree() -> Result<(), Box<dyn std::error::Error>> {
        let base = serve_pdf().await?;
        let url = format!("{base}/paper.pdf");
        let root = tempdir()?;
        let (app, _) = app(root.path(), FakeEngine::default())?;

        let sync = app.clone().oneshot(multipart_request(None, Some(url.as_str()))).await?;
        assert_eq!(sync.status(), StatusCode::OK);
        let sync: ExtractionResult = serde_json::from_value(body_json(sync).await?)?;

        let rpc = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": { "name": tool::EXTRACT_TOOL_NAME, "arguments": { "pdf_url": url } }
        });
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(rpc.to_string()))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await?;
        assert_eq!(body["id"], 7);
        assert_eq!(body["result"]["isError"], false);
        let tool: ExtractionResult =
            serde_json::from_value(body["result"]["structuredContent"].clone())?;

        let shape = |result: &ExtractionResult| {
            result
                .regions
                .iter()
                .map(|region| (region.fig_type, region.name.clone(), region.page, region.caption.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&sync), shape(&tool));
        assert_eq!(sync.stats, tool.stats);
        assert_ne!(sync.job_id, tool.job_id);
        Ok(())
    }

    #[tokio::test]
    async fn saturated_service_answers_429() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempdir()?;
        let (app, orchestrator) = app(
            root.path(),
            FakeEngine::default().with_delay(Duration::from_millis(500)),
        )?;

        let busy = {
            let app = app.clone();
            tokio::spawn(async move { app.oneshot(multipart_request(Some(("a.pdf", PDF)), None)).await })
        };
        while orchestrator.active_jobs() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let rejected = app
            .clone()
            .oneshot(multipart_request(Some(("b.pdf", PDF)), None))
            .await?;
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(rejected.headers().contains_key(RETRY_AFTER));
        assert_eq!(body_json(rejected).await?["error"]["kind"], "BackpressureError");

        assert_eq!(busy.await??.status(), StatusCode::OK);

        let health = app
            .oneshot(HttpRequest::builder().uri("/api/health").body(Body::empty())?)
            .await?;
        let health = body_json(health).await?;
        assert_eq!(health["activeJobs"], 0);
        assert_eq!(health["maxConcurrentJobs"], 1);
        Ok(())
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_for(ErrorKind::InputError), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::EngineTimeoutError), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::EngineError), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::EngineOutputError), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
