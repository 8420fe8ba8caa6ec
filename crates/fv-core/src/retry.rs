use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::CoreError;

/// Cooperative cancellation handle (spec §5: "every long-running operation
/// accepts a cancellation handle; at each suspension point... cancellation is
/// checked"). Cheap to clone; flips once, never resets.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Retry a fallible operation with exponential backoff, checking `cancel` at
/// every suspension point (before each attempt and during each backoff sleep).
///
/// - `max_attempts`: Total attempts (including the first).
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
pub fn retry<F, T>(
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    cancel: &CancelToken,
    mut f: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Result<T, CoreError>,
{
    let mut last_err = None;
    let mut delay = base_delay;

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(CoreError::Timeout {
                operation: label.to_string(),
                elapsed_secs: 0,
            });
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) => {
                let retryable = e.is_transient();
                if attempt < max_attempts && retryable {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    thread::sleep(delay);
                    delay *= 2;
                    last_err = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retry_succeeds_first_try() {
        let cancel = CancelToken::new();
        let result = retry(3, Duration::from_millis(1), "test", &cancel, || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let cancel = CancelToken::new();
        let count = Cell::new(0);
        let result = retry(3, Duration::from_millis(1), "test", &cancel, || {
            let c = count.get() + 1;
            count.set(c);
            if c < 3 {
                return Err(CoreError::Timeout {
                    operation: "x".into(),
                    elapsed_secs: 1,
                });
            }
            Ok(c)
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn retry_stops_immediately_on_non_transient_error() {
        let cancel = CancelToken::new();
        let count = Cell::new(0);
        let result: Result<i32, CoreError> = retry(3, Duration::from_millis(1), "test", &cancel, || {
            count.set(count.get() + 1);
            Err(CoreError::AuthFailed {
                provider_id: "p".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn retry_honors_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<i32, CoreError> = retry(3, Duration::from_millis(1), "test", &cancel, || Ok(1));
        assert!(result.is_err());
    }
}
