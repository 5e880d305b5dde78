//! Retry policy and the per-attempt state transition.
//!
//! - 2xx: `Delivered`
//! - 429, 5xx, timeout, network error: back to `Pending` with a backoff, or
//!   `Failed` once `max_attempts` is reached
//! - anything else (other 4xx, and 1xx/3xx since redirects are not
//!   followed): `Failed`

use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use keel_common::config::AppConfig;
use keel_common::store::{AttemptResolution, NextState};
use keel_common::types::WebhookDelivery;

use crate::client::AttemptResult;

/// How an attempt's outcome is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Retrying cannot change the result
    Permanent,
    /// Worth another attempt after backoff
    Transient,
}

pub fn classify(result: &AttemptResult) -> Outcome {
    match result.response_status {
        Some(status) if (200..300).contains(&status) => Outcome::Success,
        Some(429) => Outcome::Transient,
        Some(status) if status >= 500 => Outcome::Transient,
        Some(_) => Outcome::Permanent,
        None => Outcome::Transient,
    }
}

/// Exponential backoff: `min(base * 2^(n-1), cap)` with ±`jitter` spread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay to randomize, e.g. 0.2 for ±20%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(3600))
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: 0.2,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Duration::from_secs(config.webhook_retry_base_seconds),
            Duration::from_secs(config.webhook_retry_cap_seconds),
        )
    }

    /// Same curve with the random spread removed.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: i32) -> Duration {
        let exponent = (attempt.max(1) - 1).min(31) as u32;
        self.base
            .checked_mul(2u32.pow(exponent))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    pub fn backoff(&self, attempt: i32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread)
    }

    /// Decide where `delivery` goes after the attempt that produced `result`.
    ///
    /// Retries are scheduled from the moment the attempt finished.
    pub fn resolve(&self, delivery: &WebhookDelivery, result: &AttemptResult) -> AttemptResolution {
        let next = match classify(result) {
            Outcome::Success => NextState::Delivered,
            Outcome::Permanent => NextState::Failed,
            Outcome::Transient if delivery.attempt_number < delivery.max_attempts => {
                let finished_at =
                    result.attempted_at + chrono::Duration::milliseconds(result.duration_ms);
                let delay = self.backoff(delivery.attempt_number);
                NextState::Retry {
                    attempt_number: delivery.attempt_number + 1,
                    next_retry_at: finished_at
                        + chrono::Duration::milliseconds(delay.as_millis() as i64),
                }
            }
            Outcome::Transient => NextState::Failed,
        };

        AttemptResolution {
            attempt_number: delivery.attempt_number,
            response_status: result.response_status,
            error_message: result.error_message.clone(),
            duration_ms: result.duration_ms,
            attempted_at: result.attempted_at,
            next,
        }
    }
}

/// Resolve a one-shot attempt that is never retried: `Delivered` on 2xx,
/// otherwise `Failed`.
pub fn settle(attempt_number: i32, result: &AttemptResult) -> AttemptResolution {
    AttemptResolution {
        attempt_number,
        response_status: result.response_status,
        error_message: result.error_message.clone(),
        duration_ms: result.duration_ms,
        attempted_at: result.attempted_at,
        next: if result.is_success() {
            NextState::Delivered
        } else {
            NextState::Failed
        },
    }
}

/// Terminal failure without an HTTP attempt, e.g. the endpoint is gone.
pub fn abandon(delivery: &WebhookDelivery, reason: &str) -> AttemptResolution {
    AttemptResolution {
        attempt_number: delivery.attempt_number,
        response_status: None,
        error_message: Some(reason.to_string()),
        duration_ms: 0,
        attempted_at: Utc::now(),
        next: NextState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use keel_common::types::DeliveryStatus;
    use uuid::Uuid;

    use super::*;

    fn delivery(attempt_number: i32, max_attempts: i32) -> WebhookDelivery {
        WebhookDelivery {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            endpoint_id: Uuid::new_v4(),
            event_type: "backup.completed".to_string(),
            payload: b"{}".to_vec(),
            status: DeliveryStatus::Delivering,
            attempt_number,
            max_attempts,
            next_retry_at: None,
            response_status: None,
            error_message: None,
            duration_ms: None,
            created_at: Utc::now(),
            delivered_at: None,
            claimed_at: Some(Utc::now()),
            lease_id: Some(Uuid::new_v4()),
            lease_expires_at: None,
        }
    }

    fn result(status: Option<i32>, at: DateTime<Utc>) -> AttemptResult {
        AttemptResult {
            response_status: status,
            error_message: status
                .filter(|s| !(200..300).contains(s))
                .map(|s| format!("HTTP {}", s)),
            duration_ms: 250,
            attempted_at: at,
            timed_out: false,
        }
    }

    #[test]
    fn test_classification() {
        let now = Utc::now();
        assert_eq!(classify(&result(Some(200), now)), Outcome::Success);
        assert_eq!(classify(&result(Some(299), now)), Outcome::Success);
        assert_eq!(classify(&result(Some(400), now)), Outcome::Permanent);
        assert_eq!(classify(&result(Some(404), now)), Outcome::Permanent);
        assert_eq!(classify(&result(Some(428), now)), Outcome::Permanent);
        assert_eq!(classify(&result(Some(429), now)), Outcome::Transient);
        assert_eq!(classify(&result(Some(301), now)), Outcome::Permanent);
        assert_eq!(classify(&result(Some(500), now)), Outcome::Transient);
        assert_eq!(classify(&result(Some(503), now)), Outcome::Transient);
        assert_eq!(classify(&result(None, now)), Outcome::Transient);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(120));
        assert_eq!(policy.backoff(7), Duration::from_secs(1920));
        assert_eq!(policy.backoff(8), Duration::from_secs(3600));
        assert_eq!(policy.backoff(40), Duration::from_secs(3600));
        assert_eq!(policy.backoff(i32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::default();
        for attempt in 1..=10 {
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let delay = policy.backoff(attempt).as_secs_f64();
                assert!(delay >= base * 0.8 - 1e-6, "{} < {}", delay, base * 0.8);
                assert!(delay <= base * 1.2 + 1e-6, "{} > {}", delay, base * 1.2);
            }
        }
    }

    #[test]
    fn test_success_is_delivered_and_keeps_attempt_number() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let resolution = policy.resolve(&delivery(3, 5), &result(Some(200), now));

        assert_eq!(resolution.next, NextState::Delivered);
        assert_eq!(resolution.status(), DeliveryStatus::Delivered);
        assert_eq!(resolution.stored_attempt_number(), 3);
        assert_eq!(resolution.delivered_at(), Some(now));
        assert_eq!(resolution.next_retry_at(), None);
    }

    #[test]
    fn test_client_error_fails_without_retry() {
        let policy = RetryPolicy::default();
        let resolution = policy.resolve(&delivery(1, 10), &result(Some(404), Utc::now()));

        assert_eq!(resolution.next, NextState::Failed);
        assert_eq!(resolution.next_retry_at(), None);
        assert_eq!(resolution.error_message.as_deref(), Some("HTTP 404"));
    }

    #[test]
    fn test_transient_schedules_backoff() {
        let policy = RetryPolicy::default().without_jitter();
        let now = Utc::now();
        let resolution = policy.resolve(&delivery(2, 5), &result(Some(503), now));

        assert_eq!(
            resolution.next,
            NextState::Retry {
                attempt_number: 3,
                next_retry_at: now
                    + chrono::Duration::milliseconds(250)
                    + chrono::Duration::seconds(60),
            }
        );
        assert_eq!(resolution.status(), DeliveryStatus::Pending);
        assert_eq!(resolution.stored_attempt_number(), 3);
        // The log records the attempt that ran
        assert_eq!(resolution.attempt_number, 2);
    }

    #[test]
    fn test_last_attempt_exhausts() {
        let policy = RetryPolicy::default();
        let resolution = policy.resolve(&delivery(3, 3), &result(None, Utc::now()));

        assert_eq!(resolution.next, NextState::Failed);
        assert_eq!(resolution.next_retry_at(), None);
        assert_eq!(resolution.stored_attempt_number(), 3);
    }

    #[test]
    fn test_settle_never_retries() {
        let now = Utc::now();
        assert_eq!(settle(1, &result(Some(503), now)).next, NextState::Failed);
        assert_eq!(settle(1, &result(None, now)).next, NextState::Failed);
        assert_eq!(settle(1, &result(Some(202), now)).next, NextState::Delivered);
    }

    #[test]
    fn test_abandon_is_terminal() {
        let resolution = abandon(&delivery(2, 5), "Endpoint is disabled");
        assert_eq!(resolution.next, NextState::Failed);
        assert_eq!(resolution.attempt_number, 2);
        assert_eq!(resolution.error_message.as_deref(), Some("Endpoint is disabled"));
    }
}
