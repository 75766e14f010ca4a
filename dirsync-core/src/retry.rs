use std::future::Future;
use std::time::Duration;

/// Failure categories derived from an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    Timeout,
    FileInvalid,
    Permission,
    ServerError,
    Unknown,
}

const CONNECTION_MARKERS: &[&str] = &[
    "not connected",
    "connection",
    "connect",
    "refused",
    "reset",
    "broken pipe",
    "closed",
    "no server address",
];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout"];
const FILE_INVALID_MARKERS: &[&str] = &[
    "not found",
    "no such file",
    "not a regular file",
    "too large",
    "exceeds",
    "invalid file",
];
const PERMISSION_MARKERS: &[&str] = &["permission", "access denied", "forbidden", "unauthorized"];
const SERVER_MARKERS: &[&str] = &["server error", "internal", "database", "storage"];

pub fn classify_failure(message: &str) -> FailureKind {
    let message = message.to_ascii_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|marker| message.contains(marker));
    // Timeout wins over connection: "connection timed out" is a timeout.
    if contains_any(TIMEOUT_MARKERS) {
        FailureKind::Timeout
    } else if contains_any(FILE_INVALID_MARKERS) {
        FailureKind::FileInvalid
    } else if contains_any(PERMISSION_MARKERS) {
        FailureKind::Permission
    } else if contains_any(CONNECTION_MARKERS) {
        FailureKind::Connection
    } else if contains_any(SERVER_MARKERS) {
        FailureKind::ServerError
    } else {
        FailureKind::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    max_connection_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_connection_retries: 1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, max_connection_retries: u32) -> Self {
        Self {
            max_retries,
            max_connection_retries,
        }
    }

    /// How many retries `kind` gets after the first attempt.
    pub fn retry_budget(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::FileInvalid | FailureKind::Permission => 0,
            FailureKind::Connection => self.max_connection_retries,
            _ => self.max_retries,
        }
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay(&self, kind: FailureKind, retry: u32) -> Duration {
        let n = u64::from(retry.min(16));
        let ms = match kind {
            FailureKind::Connection => 5_000 + 3_000 * n,
            FailureKind::Timeout => 3_000 + 2_000 * n,
            FailureKind::ServerError => 2_000u64.saturating_mul(1 << n),
            _ => 1_000u64.saturating_mul(1 << n),
        };
        Duration::from_millis(ms)
    }

    /// Runs `operation` until it succeeds or its failure category runs out of retries.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let kind = classify_failure(&err.to_string());
                    if retry >= self.retry_budget(kind) {
                        tracing::warn!(operation = label, ?kind, attempts = retry + 1, error = %err, "giving up");
                        return Err(err);
                    }
                    let delay = self.delay(kind, retry);
                    tracing::info!(
                        operation = label,
                        ?kind,
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classifies_messages_by_content() {
        assert_eq!(
            classify_failure("connection closed by server without a reply"),
            FailureKind::Connection
        );
        assert_eq!(
            classify_failure("not connected to server"),
            FailureKind::Connection
        );
        assert_eq!(
            classify_failure("connection timed out to 10.0.0.1:9090"),
            FailureKind::Timeout
        );
        assert_eq!(
            classify_failure("file too large: 200 bytes exceeds limit of 100"),
            FailureKind::FileInvalid
        );
        assert_eq!(classify_failure("Access denied"), FailureKind::Permission);
        assert_eq!(
            classify_failure("Database error: disk I/O"),
            FailureKind::ServerError
        );
        assert_eq!(classify_failure("something odd"), FailureKind::Unknown);
    }

    #[test]
    fn delay_schedule_per_category() {
        let policy = RetryPolicy::default();
        let ms = |kind, n| policy.delay(kind, n).as_millis();
        assert_eq!(ms(FailureKind::Connection, 0), 5_000);
        assert_eq!(ms(FailureKind::Connection, 1), 8_000);
        assert_eq!(ms(FailureKind::Timeout, 0), 3_000);
        assert_eq!(ms(FailureKind::Timeout, 2), 7_000);
        assert_eq!(ms(FailureKind::ServerError, 0), 2_000);
        assert_eq!(ms(FailureKind::ServerError, 2), 8_000);
        assert_eq!(ms(FailureKind::Unknown, 0), 1_000);
        assert_eq!(ms(FailureKind::Unknown, 3), 8_000);
    }

    #[test]
    fn retry_budget_per_category() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retry_budget(FailureKind::FileInvalid), 0);
        assert_eq!(policy.retry_budget(FailureKind::Permission), 0);
        assert_eq!(policy.retry_budget(FailureKind::Connection), 1);
        assert_eq!(policy.retry_budget(FailureKind::Timeout), 3);
        assert_eq!(policy.retry_budget(FailureKind::Unknown), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::default()
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permission denied".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failures_retry_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::default()
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("connection reset".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_failures_retry_three_times_then_succeed() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = RetryPolicy::default()
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err("weird".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }
}
