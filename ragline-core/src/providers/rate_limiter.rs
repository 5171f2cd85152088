//! Rate limit hints from provider responses.
//!
//! Providers signal throttling with HTTP 429 plus a `retry-after` header (or a
//! provider-specific reset header). The parsed delay feeds
//! `LlmError::RateLimited`, which `with_retry` honors.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Fallback delay when the provider throttles without a usable hint.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Upper bound on any server-supplied delay.
pub const MAX_RETRY_AFTER_SECS: u64 = 3600;

/// Parse a retry delay from response headers.
///
/// Accepts delta-seconds (integer or fractional) and HTTP dates. Hints are
/// capped at [`MAX_RETRY_AFTER_SECS`]; a date in the past means retry now.
/// Returns `None` when no relevant header is present.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers
        .get("retry-after")
        .or_else(|| headers.get("anthropic-ratelimit-input-tokens-reset"))
        .or_else(|| headers.get("x-ratelimit-reset-tokens"))
        .and_then(|v| v.to_str().ok())?
        .trim();
    let ceiling = Duration::from_secs(MAX_RETRY_AFTER_SECS);

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs).min(ceiling));
    }

    // Fractional seconds, e.g. "0.5s" or "1.2"
    if let Ok(secs) = value.trim_end_matches('s').parse::<f64>()
        && secs >= 0.0
    {
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(ceiling);
        return Some(delay.min(ceiling));
    }

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        let delay = (date.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        return Some(delay.min(ceiling));
    }

    Some(Duration::from_secs(DEFAULT_RETRY_AFTER_SECS))
}

/// Extract "try again in Xs" from an OpenAI-style error body.
pub fn retry_after_from_body(body: &str) -> Option<u64> {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("error")?
        .get("message")?
        .as_str()?
        .to_string();
    let tail = message.rsplit("in ").next()?;
    let number: String = tail
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.parse::<f64>().ok().map(|s| s.ceil() as u64)
}

/// Combine header and body hints into whole seconds, rounding up.
pub fn retry_after_secs(headers: &reqwest::header::HeaderMap, body: &str) -> u64 {
    parse_retry_after(headers)
        .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
        .or_else(|| retry_after_from_body(body))
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}
