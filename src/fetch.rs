//! Retrying snapshot fetcher.
//!
//! Each attempt yields an explicit `Result<SourceSnapshot, FetchError>`;
//! the loop retries only when the error says it is retryable. The wait
//! before retry `k` (0-based) is `min(initial · 2^k, max)`, so the default
//! schedule is 5, 10, 20, 40, 60 minutes. Waiting goes through a [`Clock`]
//! so tests can observe the schedule without sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::FetchConfig;
use crate::models::SourceSnapshot;
use crate::release::sha256_hex;
use crate::source::{Download, SnapshotSource};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchError {
    pub retryable: bool,
    pub message: String,
}

impl FetchError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FetchError {}

/// Time source for the retry loop.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Wait before retry `k`: `min(initial · 2^k, max)`.
pub fn backoff_delay(config: &FetchConfig, k: u32) -> Duration {
    let factor = 1u64.checked_shl(k).unwrap_or(u64::MAX);
    let secs = config
        .initial_backoff_secs
        .saturating_mul(factor)
        .min(config.max_backoff_secs);
    Duration::from_secs(secs)
}

pub async fn fetch(
    source: &dyn SnapshotSource,
    config: &FetchConfig,
    clock: &dyn Clock,
) -> Result<SourceSnapshot, FetchError> {
    let attempts = config.max_retries + 1;
    let mut last: Option<FetchError> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let wait = backoff_delay(config, attempt - 1);
            clock.sleep(wait).await;
        }

        match try_once(source, clock).await {
            Ok(snapshot) => {
                tracing::info!(
                    source = %source.describe(),
                    version = %snapshot.version,
                    bytes = snapshot.payload.len(),
                    attempt = attempt + 1,
                    "snapshot fetched"
                );
                return Ok(snapshot);
            }
            Err(e) if !e.retryable => {
                tracing::error!(attempt = attempt + 1, error = %e, "fetch failed, not retryable");
                return Err(e);
            }
            Err(e) => {
                if attempt + 1 < attempts {
                    let wait = backoff_delay(config, attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        wait_secs = wait.as_secs(),
                        error = %e,
                        "fetch failed, will retry"
                    );
                } else {
                    tracing::warn!(attempt = attempt + 1, error = %e, "fetch failed");
                }
                last = Some(e);
            }
        }
    }

    let last = last.map(|e| e.message).unwrap_or_default();
    Err(FetchError::fatal(format!(
        "fetch failed after {} attempts: {}",
        attempts, last
    )))
}

async fn try_once(
    source: &dyn SnapshotSource,
    clock: &dyn Clock,
) -> Result<SourceSnapshot, FetchError> {
    let Download {
        bytes,
        checksum,
        version,
        url,
    } = source.download().await?;

    let checksum = match checksum {
        Some(raw) => {
            let expected = parse_checksum(&raw)?;
            verify_checksum(&bytes, &expected)?;
            Some(expected)
        }
        None => {
            tracing::debug!(url = %url, "no checksum published, skipping verification");
            None
        }
    };

    Ok(SourceSnapshot {
        payload: bytes,
        version,
        checksum,
        source_url: url,
        fetched_at: clock.now(),
    })
}

/// Accepts bare hex or `sha256sum` output (`<hex>  <name>`). Empty or
/// non-hex content is not retryable.
pub fn parse_checksum(raw: &str) -> Result<String, FetchError> {
    let token = raw.split_whitespace().next().unwrap_or("");
    if token.is_empty() {
        return Err(FetchError::fatal("published checksum is empty"));
    }
    if token.len() != 64 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(FetchError::fatal(format!(
            "published checksum is not a SHA-256 hex digest: {:?}",
            token
        )));
    }
    Ok(token.to_ascii_lowercase())
}

/// A mismatch is retryable: the download may have been truncated.
pub fn verify_checksum(payload: &[u8], expected: &str) -> Result<(), FetchError> {
    let actual = sha256_hex(payload);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(FetchError::retryable(format!(
            "checksum mismatch: expected {}, got {}",
            expected, actual
        )))
    }
}
