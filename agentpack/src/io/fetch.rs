//! Package downloads with an explicit retry policy.
//!
//! The [`Fetcher`] trait decouples vendoring from the transport. Tests use
//! scripted fetchers that return canned bytes or failures without touching
//! the network.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::error::DownloadError;

/// How many times to try a download and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Abstraction over download transports.
pub trait Fetcher {
    /// Fetch the full body at `url`.
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Blocking HTTP fetcher.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("agentpack/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    #[instrument(skip(self))]
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {url} returned {status}"));
        }
        let body = response
            .bytes()
            .with_context(|| format!("read body of {url}"))?;
        debug!(bytes = body.len(), "download complete");
        Ok(body.to_vec())
    }
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fetch `url`, retrying per `policy`.
///
/// When `expected_sha256` is set, a body with a different hash counts as a
/// failed attempt. Every failed attempt's reason is kept in the returned
/// [`DownloadError`].
pub fn fetch_with_retry<F: Fetcher + ?Sized>(
    fetcher: &F,
    package: &str,
    url: &str,
    expected_sha256: Option<&str>,
    policy: &RetryPolicy,
) -> std::result::Result<Vec<u8>, DownloadError> {
    let mut attempts = Vec::new();
    for attempt in 1..=policy.max_attempts {
        match fetcher.fetch(url) {
            Ok(body) => match expected_sha256 {
                Some(expected) => {
                    let actual = sha256_hex(&body);
                    if actual.eq_ignore_ascii_case(expected) {
                        return Ok(body);
                    }
                    attempts.push(format!(
                        "attempt {attempt}: sha256 mismatch (expected {expected}, got {actual})"
                    ));
                }
                None => return Ok(body),
            },
            Err(err) => attempts.push(format!("attempt {attempt}: {err:#}")),
        }
        warn!(package, url, attempt, max_attempts = policy.max_attempts, "download attempt failed");
        if attempt < policy.max_attempts && !policy.backoff.is_zero() {
            thread::sleep(policy.backoff);
        }
    }
    Err(DownloadError {
        package: package.to_string(),
        url: url.to_string(),
        attempts,
    })
}
