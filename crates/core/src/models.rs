use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Where the document for one job comes from. Consumed once per job.
#[derive(Clone)]
pub enum DocumentReference {
    LocalUpload { bytes: Vec<u8>, filename: String },
    RemoteUrl(String),
}

impl DocumentReference {
    /// Builds a reference from the two optional inputs of the extraction
    /// endpoint. Exactly one of them must be present.
    pub fn from_parts(
        upload: Option<(String, Vec<u8>)>,
        url: Option<String>,
    ) -> Result<Self, crate::ExtractionError> {
        let url = url.map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

        match (upload, url) {
            (Some(_), Some(_)) => Err(crate::ExtractionError::input(
                "cannot provide both 'file' and 'pdf_url'",
            )),
            (None, None) => Err(crate::ExtractionError::input(
                "either 'file' or 'pdf_url' must be provided",
            )),
            (Some((filename, bytes)), None) => Ok(Self::LocalUpload { bytes, filename }),
            (None, Some(url)) => Ok(Self::RemoteUrl(url)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::LocalUpload { filename, bytes } => format!("upload:{filename} ({} bytes)", bytes.len()),
            Self::RemoteUrl(url) => format!("url:{url}"),
        }
    }
}

impl fmt::Debug for DocumentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FigureKind {
    Figure,
    Table,
}

impl fmt::Display for FigureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Figure => f.write_str("Figure"),
            Self::Table => f.write_str("Table"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// A region as reported by the engine, before its artifact is published.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRegion {
    pub kind: FigureKind,
    pub name: String,
    pub caption: String,
    pub caption_boundary: BoundingBox,
    pub region_boundary: BoundingBox,
    /// 1-indexed.
    pub page: u32,
    pub render_dpi: u32,
    pub image_text: Vec<String>,
    pub render_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RawEngineOutput {
    pub regions: Vec<RawRegion>,
    pub artifact_dir: PathBuf,
    pub elapsed_ms: u64,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRegion {
    pub caption: String,
    pub caption_boundary: BoundingBox,
    pub fig_type: FigureKind,
    #[serde(default)]
    pub image_text: Vec<String>,
    pub name: String,
    pub page: u32,
    pub region_boundary: BoundingBox,
    pub render_dpi: u32,
    #[serde(rename = "renderURL", default)]
    pub render_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStats {
    pub total_regions: usize,
    pub figures: usize,
    pub tables: usize,
    pub per_page: BTreeMap<u32, usize>,
    pub missing_artifacts: usize,
}

impl ExtractionStats {
    pub fn from_regions(regions: &[ExtractedRegion]) -> Self {
        let mut stats = Self {
            total_regions: regions.len(),
            ..Self::default()
        };

        for region in regions {
            match region.fig_type {
                FigureKind::Figure => stats.figures += 1,
                FigureKind::Table => stats.tables += 1,
            }
            *stats.per_page.entry(region.page).or_insert(0) += 1;
            if region.render_url.is_none() {
                stats.missing_artifacts += 1;
            }
        }

        stats
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub file_name: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub page_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub job_id: String,
    pub document: DocumentSummary,
    pub regions: Vec<ExtractedRegion>,
    pub stats: ExtractionStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Pending,
    Resolving,
    Extracting,
    Normalizing,
    Done,
    Failed,
}

impl JobStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn status(self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Resolving | Self::Extracting | Self::Normalizing => JobStatus::Running,
            Self::Done => JobStatus::Succeeded,
            Self::Failed => JobStatus::Failed,
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Extracting => "extracting",
            Self::Normalizing => "normalizing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn region(kind: FigureKind, page: u32, render_url: Option<&str>) -> ExtractedRegion {
        ExtractedRegion {
            caption: "Fig. 1. Overview.".to_string(),
            caption_boundary: BoundingBox { x1: 1.0, y1: 2.0, x2: 3.0, y2: 4.0 },
            fig_type: kind,
            image_text: vec!["axis".to_string()],
            name: "1".to_string(),
            page,
            region_boundary: BoundingBox { x1: 5.0, y1: 6.0, x2: 7.0, y2: 8.0 },
            render_dpi: 300,
            render_url: render_url.map(str::to_string),
        }
    }

    #[test]
    fn region_serializes_with_engine_field_names() {
        let value = serde_json::to_value(region(
            FigureKind::Table,
            1,
            Some("http://localhost:5001/resources/a.png"),
        ))
        .expect("region should serialize");

        assert_eq!(value["figType"], "Table");
        assert_eq!(value["renderURL"], "http://localhost:5001/resources/a.png");
        assert_eq!(value["captionBoundary"]["x2"], 3.0);
        assert_eq!(value["regionBoundary"]["y1"], 6.0);
        assert_eq!(value["renderDpi"], 300);
        assert_eq!(value["imageText"][0], "axis");
    }

    #[test]
    fn missing_render_url_is_omitted() {
        let value = serde_json::to_value(region(FigureKind::Figure, 1, None))
            .expect("region should serialize");
        assert!(value.get("renderURL").is_none());
    }

    #[test]
    fn stats_count_kinds_pages_and_missing_artifacts() {
        let regions = vec![
            region(FigureKind::Figure, 1, Some("u")),
            region(FigureKind::Table, 1, None),
            region(FigureKind::Figure, 3, Some("v")),
        ];

        let stats = ExtractionStats::from_regions(&regions);
        assert_eq!(stats.total_regions, 3);
        assert_eq!(stats.figures, 2);
        assert_eq!(stats.tables, 1);
        assert_eq!(stats.per_page.get(&1), Some(&2));
        assert_eq!(stats.per_page.get(&3), Some(&1));
        assert_eq!(stats.missing_artifacts, 1);
    }

    #[test]
    fn reference_requires_exactly_one_source() {
        let both = DocumentReference::from_parts(
            Some(("a.pdf".to_string(), b"%PDF-1.4".to_vec())),
            Some("https://example.org/a.pdf".to_string()),
        );
        assert_eq!(both.map(|_| ()).unwrap_err().kind(), ErrorKind::InputError);

        let neither = DocumentReference::from_parts(None, Some("   ".to_string()));
        assert_eq!(neither.map(|_| ()).unwrap_err().kind(), ErrorKind::InputError);

        let url = DocumentReference::from_parts(None, Some("https://example.org/a.pdf".to_string()))
            .expect("url reference");
        assert!(matches!(url, DocumentReference::RemoteUrl(_)));
    }

    #[test]
    fn stage_maps_to_status() {
        assert_eq!(JobStage::Pending.status(), JobStatus::Pending);
        assert_eq!(JobStage::Extracting.status(), JobStatus::Running);
        assert_eq!(JobStage::Done.status(), JobStatus::Succeeded);
        assert!(JobStage::Failed.is_terminal());
        assert!(!JobStage::Normalizing.is_terminal());
    }
}
