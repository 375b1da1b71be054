//! Per-request scrape timeout arbitration.
//!
//! Prometheus announces how long it is willing to wait in the
//! `X-Prometheus-Scrape-Timeout-Seconds` header. The effective timeout is
//! that value minus `global.scrape_timeout_offset`, capped by
//! `global.scrape_timeout` when the latter is more restrictive.

use std::time::Duration;

use tracing::{error, warn};

use crate::config::GlobalConfig;

/// Header carrying Prometheus' scrape timeout, in (fractional) seconds.
pub const SCRAPE_TIMEOUT_HEADER: &str = "X-Prometheus-Scrape-Timeout-Seconds";

/// Compute the scrape timeout for a request against the global config.
///
/// Returns `None` when the scrape should run without a deadline.
pub fn scrape_timeout(header: Option<&str>, global: &GlobalConfig) -> Option<Duration> {
    effective_timeout(header, global.scrape_timeout, global.scrape_timeout_offset)
}

/// Compute the effective timeout from the raw header value, the configured
/// server-side timeout and the configured offset.
///
/// A zero `configured` timeout means "not configured". Malformed headers
/// are logged and treated as absent; this never fails.
pub fn effective_timeout(
    header: Option<&str>,
    configured: Duration,
    offset: Duration,
) -> Option<Duration> {
    let mut timeout = Duration::ZERO;

    if let Some(value) = header.filter(|v| !v.is_empty()) {
        if let Some(requested) = parse_header_seconds(value) {
            if offset > requested {
                warn!(
                    offset = ?offset,
                    timeout = ?requested,
                    "global.scrape_timeout_offset is greater than Prometheus' scraping timeout, ignoring"
                );
                timeout = requested;
            } else {
                timeout = requested - offset;
            }
        }
    }

    // If the configured scrape timeout is more restrictive, use that instead.
    if !configured.is_zero() && (timeout.is_zero() || configured < timeout) {
        timeout = configured;
    }

    (!timeout.is_zero()).then_some(timeout)
}

fn parse_header_seconds(value: &str) -> Option<Duration> {
    let seconds: f64 = match value.parse() {
        Ok(seconds) => seconds,
        Err(_) => {
            error!(
                header = value,
                "Failed to parse timeout from Prometheus header: unsupported value"
            );
            return None;
        }
    };

    if seconds.is_nan() || seconds < 0.0 {
        error!(
            header = value,
            "Failed to parse timeout from Prometheus header: unsupported value"
        );
        return None;
    }

    match Duration::try_from_secs_f64(seconds) {
        Ok(timeout) => Some(timeout),
        Err(_) => {
            error!(
                header = value,
                "Failed to parse timeout from Prometheus header: value is out of range"
            );
            None
        }
    }
}
