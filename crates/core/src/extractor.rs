use crate::config::EngineConfig;
use crate::error::ExtractionError;
use crate::models::{BoundingBox, FigureKind, RawEngineOutput, RawRegion};
use crate::traits::FigureEngine;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

const DIAGNOSTIC_TAIL_BYTES: usize = 4096;
const FIGURES_DIR: &str = "figures";
const DATA_DIR: &str = "data";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EngineFigure {
    #[serde(default)]
    caption: String,
    caption_boundary: BoundingBox,
    fig_type: FigureKind,
    #[serde(default)]
    image_text: Vec<String>,
    name: String,
    page: u32,
    region_boundary: BoundingBox,
    render_dpi: u32,
    #[serde(rename = "renderURL", default)]
    render_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EngineDocument {
    Many(Vec<EngineFigure>),
    One(EngineFigure),
}

/// Runs a pdffigures2-compatible command line as a child process.
///
/// The command receives `<input> -m <figure prefix> -d <data prefix> --dpi <dpi>`
/// after the configured arguments and must write `<data prefix><input stem>.json`.
pub struct Pdffigures2Engine {
    config: EngineConfig,
}

impl Pdffigures2Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn command(&self, input: &Path, figures_dir: &Path, data_dir: &Path) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(input)
            .arg("-m")
            .arg(dir_prefix(figures_dir))
            .arg("-d")
            .arg(dir_prefix(data_dir))
            .arg("--dpi")
            .arg(self.config.dpi.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &self.config.working_dir {
            command.current_dir(working_dir);
        }

        command
    }

    async fn run(&self, mut command: Command) -> Result<(ExitStatus, Vec<u8>), ExtractionError> {
        let mut child = command.spawn().map_err(|error| ExtractionError::Engine {
            exit_code: None,
            diagnostics: format!("failed to start '{}': {error}", self.config.program),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = tokio::time::timeout(self.config.timeout, async {
            let (status, _stdout, stderr) =
                tokio::join!(child.wait(), drain(stdout), drain(stderr));
            (status, stderr)
        })
        .await;

        match outcome {
            Ok((status, stderr)) => {
                let status = status.map_err(|error| ExtractionError::Engine {
                    exit_code: None,
                    diagnostics: format!("failed to wait for engine: {error}"),
                })?;
                Ok((status, stderr))
            }
            Err(_) => {
                if let Err(error) = child.start_kill() {
                    warn!(%error, "failed to kill timed out engine");
                }
                match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
                    Ok(_) => debug!("timed out engine terminated"),
                    Err(_) => warn!(
                        grace_secs = self.config.kill_grace.as_secs(),
                        "engine did not exit within grace period after kill"
                    ),
                }
                Err(ExtractionError::EngineTimeout {
                    limit: self.config.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl FigureEngine for Pdffigures2Engine {
    async fn invoke(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<RawEngineOutput, ExtractionError> {
        let input = absolute(input)?;
        let output_dir = absolute(output_dir)?;
        let figures_dir = output_dir.join(FIGURES_DIR);
        let data_dir = output_dir.join(DATA_DIR);
        reset_output_dir(&output_dir, &[&figures_dir, &data_dir]).await?;

        let started = Instant::now();
        debug!(input = %input.display(), program = %self.config.program, "starting engine");

        let (status, stderr) = self
            .run(self.command(&input, &figures_dir, &data_dir))
            .await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !status.success() {
            let diagnostics = diagnostic_tail(&stderr);
            warn!(
                exit_code = ?status.code(),
                elapsed_ms,
                stderr = %diagnostics,
                "engine exited abnormally"
            );
            return Err(ExtractionError::Engine {
                exit_code: status.code(),
                diagnostics,
            });
        }

        let data_path = data_dir.join(format!("{}.json", file_stem(&input)?));
        let payload = tokio::fs::read(&data_path).await.map_err(|error| {
            ExtractionError::EngineOutput(format!(
                "cannot read {}: {error}",
                data_path.display()
            ))
        })?;

        let regions = parse_engine_output(&payload, &figures_dir, self.config.zero_based_pages)?;
        info!(elapsed_ms, region_count = regions.len(), "engine finished");

        Ok(RawEngineOutput {
            regions,
            artifact_dir: figures_dir,
            elapsed_ms,
        })
    }

    fn name(&self) -> &str {
        &self.config.program
    }
}

/// Parses the engine's figure JSON and converts pages to 1-indexed.
///
/// Only the file name of a reported render path is kept; it is always looked
/// up inside `figures_dir`.
pub fn parse_engine_output(
    payload: &[u8],
    figures_dir: &Path,
    zero_based_pages: bool,
) -> Result<Vec<RawRegion>, ExtractionError> {
    let document: EngineDocument = serde_json::from_slice(payload)
        .map_err(|error| ExtractionError::EngineOutput(format!("invalid figure data: {error}")))?;

    let figures = match document {
        EngineDocument::Many(figures) => figures,
        EngineDocument::One(figure) => vec![figure],
    };

    figures
        .into_iter()
        .map(|figure| {
            let page = if zero_based_pages {
                figure.page.saturating_add(1)
            } else if figure.page == 0 {
                return Err(ExtractionError::EngineOutput(format!(
                    "{} {} reports page 0 but pages are configured as 1-indexed",
                    figure.fig_type, figure.name
                )));
            } else {
                figure.page
            };

            Ok(RawRegion {
                kind: figure.fig_type,
                name: figure.name,
                caption: figure.caption,
                caption_boundary: figure.caption_boundary,
                region_boundary: figure.region_boundary,
                page,
                render_dpi: figure.render_dpi,
                image_text: figure.image_text,
                render_path: figure
                    .render_url
                    .as_deref()
                    .and_then(|value| confine_render_path(value, figures_dir)),
            })
        })
        .collect()
}

fn confine_render_path(value: &str, figures_dir: &Path) -> Option<PathBuf> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Path::new(value).file_name().map(|name| figures_dir.join(name))
}

fn absolute(path: &Path) -> Result<PathBuf, ExtractionError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|error| ExtractionError::storage("cannot resolve current directory", error))
}

/// Clears partial output from an earlier attempt before re-running.
async fn reset_output_dir(output_dir: &Path, children: &[&Path]) -> Result<(), ExtractionError> {
    if tokio::fs::try_exists(output_dir).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(output_dir)
            .await
            .map_err(|error| ExtractionError::storage("cannot clear engine output", error))?;
    }

    for child in children {
        tokio::fs::create_dir_all(child)
            .await
            .map_err(|error| ExtractionError::storage("cannot create engine output", error))?;
    }

    Ok(())
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(error) = pipe.read_to_end(&mut buffer).await {
            debug!(%error, "engine pipe closed early");
        }
    }
    buffer
}

fn diagnostic_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(DIAGNOSTIC_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

fn dir_prefix(dir: &Path) -> String {
    format!("{}{}", dir.display(), std::path::MAIN_SEPARATOR)
}

fn file_stem(input: &Path) -> Result<&str, ExtractionError> {
    input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| ExtractionError::Storage(format!("input has no file name: {}", input.display())))
}
