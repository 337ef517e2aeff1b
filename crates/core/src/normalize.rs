use crate::config::RESOURCE_PREFIX;
use crate::error::ExtractionError;
use crate::models::{ExtractedRegion, ExtractionStats, FigureKind, RawEngineOutput};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

/// Regions with public URLs, plus the local files those URLs will point at
/// once published.
#[derive(Debug, Clone)]
pub struct NormalizedOutput {
    pub regions: Vec<ExtractedRegion>,
    pub stats: ExtractionStats,
    pending: Vec<PendingArtifact>,
}

#[derive(Debug, Clone)]
struct PendingArtifact {
    region: usize,
    source: PathBuf,
    file_name: String,
}

/// `<base>/resources/<file name>`
pub fn resource_url(public_base_url: &Url, file_name: &str) -> String {
    format!(
        "{}/{}/{}",
        public_base_url.as_str().trim_end_matches('/'),
        RESOURCE_PREFIX,
        file_name
    )
}

/// Rewrites local artifact paths to resource URLs under `public_base_url`.
///
/// A region whose artifact is missing or unreadable keeps its data with no
/// URL. Repeated `(kind, name)` pairs get `-2`, `-3`, ... suffixes.
pub fn normalize(raw: RawEngineOutput, public_base_url: &Url) -> NormalizedOutput {
    let mut seen: HashMap<(FigureKind, String), usize> = HashMap::new();
    let mut regions = Vec::with_capacity(raw.regions.len());
    let mut pending = Vec::new();

    let artifact_dir = match fs::canonicalize(&raw.artifact_dir) {
        Ok(dir) => Some(dir),
        Err(error) => {
            warn!(path = %raw.artifact_dir.display(), %error, "engine artifact directory unavailable");
            None
        }
    };

    for region in raw.regions {
        let occurrences = seen.entry((region.kind, region.name.clone())).or_insert(0);
        *occurrences += 1;
        let name = if *occurrences == 1 {
            region.name
        } else {
            format!("{}-{}", region.name, occurrences)
        };

        let artifact = region
            .render_path
            .as_deref()
            .and_then(|path| readable_artifact(path, artifact_dir.as_deref(), &name));

        let render_url = artifact.as_ref().map(|(_, file_name)| resource_url(public_base_url, file_name));
        if let Some((source, file_name)) = artifact {
            pending.push(PendingArtifact {
                region: regions.len(),
                source,
                file_name,
            });
        }

        regions.push(ExtractedRegion {
            caption: region.caption,
            caption_boundary: region.caption_boundary,
            fig_type: region.kind,
            image_text: region.image_text,
            name,
            page: region.page,
            region_boundary: region.region_boundary,
            render_dpi: region.render_dpi,
            render_url,
        });
    }

    let stats = ExtractionStats::from_regions(&regions);
    NormalizedOutput {
        regions,
        stats,
        pending,
    }
}

/// Only regular files that resolve inside `artifact_dir` are eligible for
/// publication.
fn readable_artifact(path: &Path, artifact_dir: Option<&Path>, region_name: &str) -> Option<(PathBuf, String)> {
    let file_name = path.file_name().and_then(|name| name.to_str())?.to_string();

    let resolved = match fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(error) => {
            warn!(region = region_name, path = %path.display(), %error, "artifact missing or unreadable");
            return None;
        }
    };

    if !artifact_dir.is_some_and(|dir| resolved.starts_with(dir)) {
        warn!(
            region = region_name,
            path = %resolved.display(),
            "artifact lies outside the engine output directory"
        );
        return None;
    }

    match fs::File::open(&resolved).and_then(|file| file.metadata()) {
        Ok(metadata) if metadata.is_file() => Some((resolved, file_name)),
        Ok(_) => {
            warn!(region = region_name, path = %path.display(), "artifact is not a regular file");
            None
        }
        Err(error) => {
            warn!(region = region_name, path = %path.display(), %error, "artifact missing or unreadable");
            None
        }
    }
}

impl NormalizedOutput {
    /// Moves every artifact into `artifact_root`. Regions whose artifact cannot
    /// be moved lose their URL.
    pub fn publish(mut self, artifact_root: &Path) -> Result<Self, ExtractionError> {
        if self.pending.is_empty() {
            return Ok(self);
        }

        fs::create_dir_all(artifact_root)
            .map_err(|error| ExtractionError::storage("cannot create artifact directory", error))?;

        for artifact in std::mem::take(&mut self.pending) {
            let target = artifact_root.join(&artifact.file_name);
            match move_file(&artifact.source, &target) {
                Ok(()) => debug!(target = %target.display(), "published artifact"),
                Err(error) => {
                    warn!(
                        source = %artifact.source.display(),
                        target = %target.display(),
                        %error,
                        "cannot publish artifact"
                    );
                    if let Some(region) = self.regions.get_mut(artifact.region) {
                        region.render_url = None;
                    }
                }
            }
        }

        self.stats = ExtractionStats::from_regions(&self.regions);
        Ok(self)
    }
}

fn move_file(source: &Path, target: &Path) -> std::io::Result<()> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(source, target)?;
            fs::remove_file(source)
        }
    }
}
