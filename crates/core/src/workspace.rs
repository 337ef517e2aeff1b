use crate::config::ServiceConfig;
use crate::error::ExtractionError;
use crate::models::{DocumentReference, DocumentSummary};
use lopdf::Document;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use url::Url;
use walkdir::WalkDir;

const PDF_SIGNATURE: &[u8] = b"%PDF-";
const SIGNATURE_WINDOW: usize = 1024;
const WORKSPACE_PREFIX: &str = "job-";
const ACCEPTED_CONTENT_TYPES: [&str; 4] = [
    "application/pdf",
    "application/x-pdf",
    "application/octet-stream",
    "binary/octet-stream",
];

/// Isolated directory for one job. Removed when dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    input_path: PathBuf,
    engine_dir: PathBuf,
    document: DocumentSummary,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    /// Scratch area handed to the engine for figures and JSON data.
    pub fn engine_dir(&self) -> &Path {
        &self.engine_dir
    }

    pub fn document(&self) -> &DocumentSummary {
        &self.document
    }

    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

pub struct WorkspaceManager {
    config: Arc<ServiceConfig>,
    /// Absolute, so paths handed to the engine survive its own working directory.
    work_root: PathBuf,
    client: Client,
}

impl WorkspaceManager {
    /// Creates the work root and removes workspaces left behind by a previous
    /// process.
    pub fn new(config: Arc<ServiceConfig>) -> Result<Self, ExtractionError> {
        let work_root = config.work_root();
        fs::create_dir_all(&work_root)
            .map_err(|error| ExtractionError::storage("cannot create work root", error))?;

        let work_root = fs::canonicalize(&work_root)
            .map_err(|error| ExtractionError::storage("cannot resolve work root", error))?;

        let removed = sweep_stale_workspaces(&work_root);
        if removed > 0 {
            info!(work_root = %work_root.display(), removed, "removed stale job workspaces");
        }

        Ok(Self {
            config,
            work_root,
            client: Client::new(),
        })
    }

    /// Materializes `reference` inside a fresh workspace for `job_id`.
    ///
    /// The document is fetched and validated before any directory is created,
    /// so rejected input leaves nothing on disk.
    pub async fn resolve(
        &self,
        job_id: &str,
        reference: DocumentReference,
    ) -> Result<Workspace, ExtractionError> {
        let (filename, bytes) = match reference {
            DocumentReference::LocalUpload { bytes, filename } => (filename, bytes),
            DocumentReference::RemoteUrl(url) => self.fetch_remote(&url).await?,
        };

        validate_document(&bytes, self.config.max_document_bytes)?;

        let checksum = digest_bytes(&bytes);
        let size_bytes = bytes.len() as u64;
        let (bytes, page_count) = tokio::task::spawn_blocking(move || {
            let pages = count_pages(&bytes);
            (bytes, pages)
        })
        .await
        .map_err(|error| ExtractionError::Storage(format!("document inspection failed: {error}")))?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{WORKSPACE_PREFIX}{job_id}-"))
            .tempdir_in(&self.work_root)
            .map_err(|error| ExtractionError::storage("cannot allocate workspace", error))?;

        let input_name = format!("{}-{job_id}.pdf", sanitize_stem(&filename));
        let input_path = dir.path().join(&input_name);
        let engine_dir = dir.path().join("engine");

        tokio::fs::write(&input_path, &bytes)
            .await
            .map_err(|error| ExtractionError::storage("cannot write input document", error))?;

        debug!(
            job_id,
            workspace = %dir.path().display(),
            input = %input_path.display(),
            size_bytes,
            "workspace ready"
        );

        Ok(Workspace {
            dir,
            input_path,
            engine_dir,
            document: DocumentSummary {
                file_name: filename,
                checksum,
                size_bytes,
                page_count,
            },
        })
    }

    async fn fetch_remote(&self, raw_url: &str) -> Result<(String, Vec<u8>), ExtractionError> {
        let url = Url::parse(raw_url)
            .map_err(|error| ExtractionError::input(format!("invalid document url '{raw_url}': {error}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExtractionError::input(format!(
                "unsupported document url scheme '{}'",
                url.scheme()
            )));
        }

        let limit = self.config.download_timeout;
        let max_bytes = self.config.max_document_bytes;
        debug!(url = %url, timeout_secs = limit.as_secs(), "downloading document");

        let download = async {
            let mut response = self
                .client
                .get(url.clone())
                .timeout(limit)
                .send()
                .await
                .map_err(|error| download_error(&url, error))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ExtractionError::input(format!(
                    "document url {url} returned {status}"
                )));
            }

            if let Some(content_type) = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
            {
                let essence = content_type
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase();
                if !ACCEPTED_CONTENT_TYPES.contains(&essence.as_str()) {
                    return Err(ExtractionError::input(format!(
                        "document url {url} served '{essence}', expected a pdf"
                    )));
                }
            }

            if response.content_length().is_some_and(|length| length > max_bytes) {
                return Err(too_large(max_bytes));
            }

            let mut body = Vec::new();
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|error| download_error(&url, error))?
            {
                if (body.len() + chunk.len()) as u64 > max_bytes {
                    return Err(too_large(max_bytes));
                }
                body.extend_from_slice(&chunk);
            }

            Ok::<_, ExtractionError>(body)
        };

        let body = match tokio::time::timeout(limit, download).await {
            Ok(body) => body?,
            Err(_) => {
                return Err(ExtractionError::input(format!(
                    "timed out downloading {url} after {}s",
                    limit.as_secs()
                )))
            }
        };

        Ok((file_name_from_url(&url), body))
    }
}

fn download_error(url: &Url, error: reqwest::Error) -> ExtractionError {
    if error.is_timeout() {
        ExtractionError::input(format!("timed out downloading {url}"))
    } else {
        ExtractionError::input(format!("document url {url} is unreachable: {error}"))
    }
}

fn too_large(max_bytes: u64) -> ExtractionError {
    ExtractionError::input(format!("document exceeds the {max_bytes} byte limit"))
}

/// Rejects payloads that are empty, oversized, or not PDF documents.
pub fn validate_document(bytes: &[u8], max_bytes: u64) -> Result<(), ExtractionError> {
    if bytes.is_empty() {
        return Err(ExtractionError::input("uploaded document is empty"));
    }

    if bytes.len() as u64 > max_bytes {
        return Err(too_large(max_bytes));
    }

    let window = &bytes[..bytes.len().min(SIGNATURE_WINDOW)];
    let has_signature = window
        .windows(PDF_SIGNATURE.len())
        .any(|candidate| candidate == PDF_SIGNATURE);

    if !has_signature {
        return Err(ExtractionError::input("document is not a pdf"));
    }

    Ok(())
}

fn count_pages(bytes: &[u8]) -> Option<u32> {
    match Document::load_mem(bytes) {
        Ok(document) => u32::try_from(document.get_pages().len()).ok(),
        Err(error) => {
            warn!(%error, "could not read page count, continuing without it");
            None
        }
    }
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// File stem reduced to `[A-Za-z0-9_-]`, used to build artifact names.
pub fn sanitize_stem(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();

    let mut cleaned = String::with_capacity(stem.len());
    for character in stem.chars() {
        if character.is_ascii_alphanumeric() || character == '-' || character == '_' {
            cleaned.push(character);
        } else if !cleaned.ends_with('_') {
            cleaned.push('_');
        }
    }

    let cleaned: String = cleaned.trim_matches('_').chars().take(64).collect();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

fn file_name_from_url(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("document");

    if last.to_ascii_lowercase().ends_with(".pdf") {
        last.to_string()
    } else {
        format!("{last}.pdf")
    }
}

fn sweep_stale_workspaces(work_root: &Path) -> usize {
    let mut removed = 0;

    for entry in WalkDir::new(work_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        let is_workspace = entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(WORKSPACE_PREFIX));

        if !is_workspace {
            continue;
        }

        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(error) => warn!(path = %entry.path().display(), %error, "cannot remove stale workspace"),
        }
    }

    removed
}
