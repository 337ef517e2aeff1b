//! Client side of the service: upload a local PDF, then pull down every
//! rendered figure the service published for it.

use anyhow::{bail, Context};
use figure_extract_core::ExtractionResult;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

pub async fn fetch(input: &Path, service_url: &str, download_dir: &Path) -> anyhow::Result<ExtractionResult> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("cannot read {}", input.display()))?;
    let file_name = input
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("document.pdf")
        .to_string();

    let endpoint = Url::parse(service_url)
        .with_context(|| format!("invalid service url '{service_url}'"))?
        .join("api/extract")?;

    let part = Part::bytes(bytes)
        .file_name(file_name.clone())
        .mime_str("application/pdf")?;
    let form = Form::new().part("file", part);

    let client = Client::new();
    info!(%endpoint, file = %file_name, "uploading document");
    let response = client.post(endpoint.clone()).multipart(form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("{endpoint} answered {status}: {body}");
    }
    let result: ExtractionResult = response.json().await.context("unexpected response body")?;

    tokio::fs::create_dir_all(download_dir)
        .await
        .with_context(|| format!("cannot create {}", download_dir.display()))?;

    let mut downloaded = 0usize;
    for region in &result.regions {
        let Some(render_url) = region.render_url.as_deref() else {
            warn!(region = %region.name, "region has no rendered image");
            continue;
        };
        let Some(target_name) = download_name(render_url) else {
            warn!(url = render_url, "cannot derive a file name");
            continue;
        };

        let response = client.get(render_url).send().await?;
        if !response.status().is_success() {
            warn!(url = render_url, status = %response.status(), "image download failed");
            continue;
        }
        let image = response.bytes().await?;
        let target = download_dir.join(&target_name);
        tokio::fs::write(&target, &image)
            .await
            .with_context(|| format!("cannot write {}", target.display()))?;
        downloaded += 1;
    }

    info!(
        job_id = %result.job_id,
        regions = result.regions.len(),
        downloaded,
        dir = %download_dir.display(),
        "figures downloaded"
    );
    Ok(result)
}

/// Last non-empty path segment of `url`, if it is a plain file name.
fn download_name(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.filter(|segment| !segment.is_empty()).last()?;
    if name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}
