//! The fetch itself, as run inside the sandbox by the helper process.
//!
//! Everything here assumes it is already isolated: the helper applies
//! rlimits and (on Linux) no-new-privs plus Landlock before calling
//! [`fetch_document`].

use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::policy::FetchRequest;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Connect timeout, capped by the configured download timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported scheme '{0}' (only http/https)")]
    SchemeNotAllowed(String),

    #[error("host '{0}' is not in the allowed domains")]
    DomainNotAllowed(String),

    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download timed out after {0}s")]
    TimedOut(u64),
}

/// Whether `host` ends with one of `allowed`, compared case-insensitively.
/// An empty list allows every host. Entries are plain suffixes, so
/// `example.com` also admits `myexample.com`; write `.example.com` to
/// require a subdomain boundary.
pub fn host_allowed(host: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let host = host.trim_end_matches('.').to_lowercase();
    allowed.iter().any(|domain| {
        let domain = domain.trim().to_lowercase();
        !domain.is_empty() && host.ends_with(&domain)
    })
}

/// Parse `url` and check it against the scheme and domain allow-lists.
pub fn validate_url(url: &str, allowed: &[String]) -> Result<reqwest::Url, FetchError> {
    let parsed = reqwest::Url::parse(url.trim()).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    check_url(&parsed, allowed)?;
    Ok(parsed)
}

fn check_url(url: &reqwest::Url, allowed: &[String]) -> Result<(), FetchError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(FetchError::SchemeNotAllowed(scheme.to_string())),
    }

    let host = url.host_str().ok_or_else(|| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: "missing host".to_string(),
    })?;

    if !host_allowed(host, allowed) {
        return Err(FetchError::DomainNotAllowed(host.to_string()));
    }
    Ok(())
}

fn build_client(request: &FetchRequest) -> Result<reqwest::Client, FetchError> {
    let allowed = request.allowed_domains.clone();
    let redirect = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if let Err(e) = check_url(attempt.url(), &allowed) {
            attempt.error(e.to_string())
        } else {
            attempt.follow()
        }
    });

    let download_timeout = Duration::from_secs(request.download_timeout_secs);
    let client = reqwest::Client::builder()
        .user_agent(request.user_agent.as_str())
        .timeout(download_timeout)
        .connect_timeout(download_timeout.min(Duration::from_secs(CONNECT_TIMEOUT_SECS)))
        .redirect(redirect)
        .build()?;
    Ok(client)
}

/// Download `request.url` to `request.output_path`, returning the byte count.
///
/// The whole fetch is bounded by `sandbox_timeout_secs`. On any failure the
/// partial output file is removed.
pub async fn fetch_document(request: &FetchRequest) -> Result<u64, FetchError> {
    let url = validate_url(&request.url, &request.allowed_domains)?;

    let result = tokio::time::timeout(
        Duration::from_secs(request.sandbox_timeout_secs),
        download_to(url, request),
    )
    .await
    .unwrap_or(Err(FetchError::TimedOut(request.sandbox_timeout_secs)));

    if result.is_err() {
        remove_partial(&request.output_path).await;
    }
    result
}

async fn download_to(url: reqwest::Url, request: &FetchRequest) -> Result<u64, FetchError> {
    let client = build_client(request)?;
    let limit = request.max_file_size_bytes;

    let response = client.get(url).header("Accept", "*/*").send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }

    if let Some(size) = response.content_length()
        && size > limit
    {
        return Err(FetchError::TooLarge { size, limit });
    }

    if let Some(parent) = request.output_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(&request.output_path).await?;

    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(FetchError::TooLarge {
                size: written,
                limit,
            });
        }
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!("Failed to remove partial file {}: {}", path.display(), e),
    }
}
