use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Maximum retry attempts after an initial request attempt.
pub const MAX_RETRIES: u32 = 3;
/// Base delay before the first retry.
pub const BASE_DELAY_MS: u64 = 1000;

fn retryable_text_regex() -> Option<&'static Regex> {
    static CACHED: OnceLock<Option<Regex>> = OnceLock::new();
    CACHED
        .get_or_init(|| {
            Regex::new(
                r"(?i)rate.?limit|overloaded|server.?busy|service.?unavailable|connection.?(refused|reset)",
            )
            .ok()
        })
        .as_ref()
}

/// Whether a non-success response deserves another attempt.
pub fn is_retryable_http_error(status: u16, error_text: &str) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
        || retryable_text_regex().is_some_and(|regex| regex.is_match(error_text))
}

/// Exponential backoff applied before the request is sent; never once a
/// response body has started streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(30));
        self.base_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_and_texts() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_http_error(status, ""), "{status}");
        }
        assert!(is_retryable_http_error(400, "server busy, please try again"));
        assert!(is_retryable_http_error(400, "Connection reset by peer"));
        assert!(!is_retryable_http_error(404, "model 'x' not found"));
    }

    #[test]
    fn default_backoff_doubles_from_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1000));
        assert_eq!(policy.delay(1), Duration::from_millis(2000));
        assert_eq!(policy.delay(2), Duration::from_millis(4000));
        assert_eq!(RetryPolicy::none().delay(5), Duration::ZERO);
    }
}
