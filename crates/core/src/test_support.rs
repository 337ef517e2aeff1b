use crate::models::{BoundingBox, DocumentReference, FigureKind, RawEngineOutput, RawRegion};
use crate::traits::FigureEngine;
use crate::ExtractionError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PDF: &[u8] = b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\n%%EOF\n";
pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

pub fn upload(filename: &str) -> DocumentReference {
    DocumentReference::LocalUpload {
        bytes: PDF.to_vec(),
        filename: filename.to_string(),
    }
}

/// Writes one "Table I" and one "Fig. 1" artifact for page 1 of any input.
#[derive(Default)]
pub struct FakeEngine {
    pub calls: Arc<AtomicUsize>,
    delay: Duration,
    failure: Mutex<Option<ExtractionError>>,
}

impl FakeEngine {
    pub fn failing(error: ExtractionError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl FigureEngine for FakeEngine {
    async fn invoke(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<RawEngineOutput, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        if let Some(error) = self.failure.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(error);
        }

        let stem = input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("document")
            .to_string();
        let figures = output_dir.join("figures");
        tokio::fs::create_dir_all(&figures)
            .await
            .map_err(|error| ExtractionError::storage("fake engine", error))?;

        let mut regions = Vec::new();
        for (kind, name, caption) in [
            (FigureKind::Table, "I", "Table I. Accuracy by dataset."),
            (FigureKind::Figure, "1", "Fig. 1. System overview."),
        ] {
            let path = figures.join(format!("{stem}-{kind}{name}-1.png"));
            tokio::fs::write(&path, PNG_SIGNATURE)
                .await
                .map_err(|error| ExtractionError::storage("fake engine", error))?;

            regions.push(RawRegion {
                kind,
                name: name.to_string(),
                caption: caption.to_string(),
                caption_boundary: BoundingBox { x1: 72.0, y1: 90.0, x2: 540.0, y2: 110.0 },
                region_boundary: BoundingBox { x1: 72.0, y1: 120.0, x2: 540.0, y2: 400.0 },
                page: 1,
                render_dpi: 300,
                image_text: vec!["Method".to_string(), "Score".to_string()],
                render_path: Some(path),
            });
        }

        Ok(RawEngineOutput {
            regions,
            artifact_dir: figures,
            elapsed_ms: self.delay.as_millis() as u64,
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}
