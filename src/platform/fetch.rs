use anyhow::{Context, Result};
use tracing::debug;

/// A downloaded resource
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Download `url`, giving up once the body exceeds `max_bytes`.
///
/// Returns `Ok(None)` when the resource is too large; the partial body is
/// discarded. Transport errors are returned as errors.
pub async fn fetch_limited(
    client: &reqwest::Client,
    url: &str,
    max_bytes: usize,
) -> Result<Option<Fetched>> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("Fetching {} failed with status {}", url, status);
    }

    if let Some(len) = response.content_length() {
        if len > max_bytes as u64 {
            debug!("Skipping {}: declared size {} over limit", url, len);
            return Ok(None);
        }
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.context("Failed to read body")? {
        if bytes.len() + chunk.len() > max_bytes {
            debug!("Skipping {}: body exceeded {} bytes", url, max_bytes);
            return Ok(None);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(Some(Fetched {
        bytes,
        content_type,
    }))
}

/// Last path segment of a URL, without query or fragment
pub fn file_name(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .map(str::to_string)
}
