//! Retry with exponential backoff, and terminal-failure persistence.
//!
//! [`RetryPolicy`] is a plain value: every [`RetryPolicy::execute`] call owns its
//! attempt counter, so one policy can be shared by any number of concurrent tasks.
//! Backoff sleeps are `tokio::time::sleep` raced against a [`CancelToken`].
//!
//! Failures that end a call (retries exhausted, or a fatal error on any attempt)
//! are written through an [`ErrorRecorder`]. Cancellation is logged only.

mod classify;

use std::{fmt::Display, future::Future, time::Duration};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

pub use classify::{Classify, FATAL_CODES, classify_message};

use crate::{
    cancel::CancelToken,
    models::logs::FailureClass,
    sync_errors::{ErrorRecorder, FailureReport},
};

/// Backoff parameters. `delay = min(base_delay * 2^(attempt-1), max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Where a failure came from; persisted as the `context` JSON of a sync error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryContext {
    pub operation: String,
    pub fields: IndexMap<String, Value>,
}

impl RetryContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            fields: IndexMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("operation".into(), Value::String(self.operation.clone()));
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }
}

/// Why [`RetryPolicy::execute`] gave up. `last` is the final underlying error.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },

    #[error("{operation} failed fatally on attempt {attempt}: {last}")]
    Fatal {
        operation: String,
        attempt: u32,
        last: E,
    },

    #[error("{operation} cancelled after {attempts} attempts")]
    Cancelled {
        operation: String,
        attempts: u32,
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Attempts actually made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
            RetryError::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Fatal { last, .. } => Some(last),
            RetryError::Cancelled { last, .. } => last,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Backoff before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails fatally, runs out of attempts, or
    /// `cancel` trips during a backoff sleep.
    ///
    /// `op` receives the 1-based attempt number. Terminal failures are persisted
    /// through `recorder` off the async worker; a recorder error is logged and does
/// not change the result.
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &RetryContext,
        recorder: &dyn ErrorRecorder,
        cancel: &CancelToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max = self.attempts();
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                debug!(operation = %ctx.operation, attempt, "retry loop cancelled before attempt");
                return Err(RetryError::Cancelled {
                    operation: ctx.operation.clone(),
                    attempts: attempt,
                    last: None,
                });
            }
            attempt += 1;

            let err = match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            match err.failure_class() {
                FailureClass::Fatal => {
                    error!(operation = %ctx.operation, attempt, error = %err, "fatal error, not retrying");
                    persist_async(recorder, ctx, &err, attempt).await;
                    return Err(RetryError::Fatal {
                        operation: ctx.operation.clone(),
                        attempt,
                        last: err,
                    });
                }
                FailureClass::Transient if attempt >= max => {
                    error!(operation = %ctx.operation, attempts = attempt, error = %err, "retries exhausted");
                    persist_async(recorder, ctx, &err, attempt).await;
                    return Err(RetryError::Exhausted {
                        operation: ctx.operation.clone(),
                        attempts: attempt,
                        last: err,
                    });
                }
                FailureClass::Transient => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = %ctx.operation,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            warn!(operation = %ctx.operation, attempt, "backoff interrupted by cancellation");
                            return Err(RetryError::Cancelled {
                                operation: ctx.operation.clone(),
                                attempts: attempt,
                                last: Some(err),
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Logs and records `error`, then hands back `fallback`. For paths where a
/// degraded answer beats an error.
pub fn handle_with_fallback<T, E>(
    error: &E,
    ctx: &RetryContext,
    recorder: &dyn ErrorRecorder,
    fallback: T,
) -> T
where
    E: Classify + Display,
{
    warn!(operation = %ctx.operation, error = %error, "using fallback value");
    persist(recorder, ctx, error, 1);
    fallback
}

fn report_for<E: Classify + Display>(ctx: &RetryContext, err: &E, attempts: u32) -> FailureReport {
    FailureReport {
        error_type: err.error_type(),
        message: err.to_string(),
        classification: err.failure_class(),
        operation: ctx.operation.clone(),
        context: ctx.to_json(),
        attempts,
    }
}

fn persist<E: Classify + Display>(
    recorder: &dyn ErrorRecorder,
    ctx: &RetryContext,
    err: &E,
    attempts: u32,
) {
    if let Err(e) = recorder.record(&report_for(ctx, err, attempts)) {
        error!(operation = %ctx.operation, error = %e, "failed to persist sync error");
    }
}

async fn persist_async<E: Classify + Display>(
    recorder: &dyn ErrorRecorder,
    ctx: &RetryContext,
    err: &E,
    attempts: u32,
) {
    if let Err(e) = recorder.record_async(report_for(ctx, err, attempts)).await {
        error!(operation = %ctx.operation, error = %e, "failed to persist sync error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use name_source::FetchError;
    use proptest::prelude::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemRecorder(Mutex<Vec<FailureReport>>);

    impl ErrorRecorder for MemRecorder {
        fn record(&self, report: &FailureReport) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    /// Refuses blocking writes, so only `record_async` can persist.
    #[derive(Default)]
    struct AsyncOnly(Mutex<Vec<FailureReport>>);

    #[async_trait::async_trait]
    impl ErrorRecorder for AsyncOnly {
        fn record(&self, _report: &FailureReport) -> anyhow::Result<()> {
            anyhow::bail!("blocking write from async code")
        }

        async fn record_async(&self, report: FailureReport) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(report);
            Ok(())
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn default_backoff_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(6), Duration::from_secs(30));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn delay_is_monotone_and_capped(attempt in 1u32..200, base_ms in 1u64..5_000, cap_ms in 1u64..60_000) {
            let p = RetryPolicy::new(3, Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
            prop_assert!(p.delay_for(attempt) <= p.max_delay);
            prop_assert!(p.delay_for(attempt) <= p.delay_for(attempt + 1));
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let rec = MemRecorder::default();
        let ctx = RetryContext::new("fetch_name").with("product_id", "42");
        let out = fast()
            .execute(&ctx, &rec, &CancelToken::never(), |attempt| async move {
                if attempt < 3 {
                    Err(FetchError::Transient("503".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 3);
        assert!(rec.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn async_loops_persist_through_the_async_recorder() {
        let rec = AsyncOnly::default();
        let out: Result<(), _> = fast()
            .execute(&RetryContext::new("fetch_name"), &rec, &CancelToken::never(), |_| async {
                Err(FetchError::Transient("503".into()))
            })
            .await;
        assert!(matches!(out, Err(RetryError::Exhausted { attempts: 3, .. })));

        let logged = rec.0.lock().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].attempts, 3);
    }

    #[tokio::test]
    async fn fatal_aborts_without_consuming_attempts() {
        let rec = MemRecorder::default();
        let mut calls = 0;
        let out: Result<(), _> = fast()
            .execute(&RetryContext::new("fetch_name"), &rec, &CancelToken::never(), |_| {
                calls += 1;
                async { Err(FetchError::Fatal("401 Unauthorized".into())) }
            })
            .await;
        assert!(matches!(out, Err(RetryError::Fatal { attempt: 1, .. })));
        assert_eq!(calls, 1);

        let logged = rec.0.lock().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].classification, FailureClass::Fatal);
        assert_eq!(logged[0].attempts, 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt_makes_no_calls() {
        let rec = MemRecorder::default();
        let (handle, token) = CancelToken::new();
        handle.cancel();
        let mut calls = 0;
        let out: Result<(), _> = fast()
            .execute(&RetryContext::new("fetch_name"), &rec, &token, |_| {
                calls += 1;
                async { Err(FetchError::Transient("timeout".into())) }
            })
            .await;
        assert!(matches!(out, Err(RetryError::Cancelled { attempts: 0, last: None, .. })));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_running_backoff() {
        let rec = MemRecorder::default();
        let (handle, token) = CancelToken::new();
        let slow = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let started = std::time::Instant::now();

        let out: Result<(), _> = slow
            .execute(&RetryContext::new("fetch_name"), &rec, &token, |attempt| {
                if attempt == 1 {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        handle.cancel();
                    });
                }
                async { Err(FetchError::Transient("timeout".into())) }
            })
            .await;

        match out {
            Err(RetryError::Cancelled { attempts, last, .. }) => {
                assert_eq!(attempts, 1);
                assert!(last.is_some());
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(rec.0.lock().unwrap().is_empty());
    }

    #[test]
    fn fallback_records_and_returns_value() {
        let rec = MemRecorder::default();
        let ctx = RetryContext::new("bulk_update").with("item", 7);
        let err = anyhow::anyhow!("connection refused");
        assert_eq!(handle_with_fallback(&err, &ctx, &rec, 0usize), 0);

        let logged = rec.0.lock().unwrap();
        assert_eq!(logged[0].context, serde_json::json!({"operation": "bulk_update", "item": 7}));
        assert_eq!(logged[0].classification, FailureClass::Transient);
    }
}
