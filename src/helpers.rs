//! Boot-time helpers.

use std::fmt::Display;
use std::future::Future;

use crate::config::Startup;

/// Run `operation` until it succeeds, at most `startup.attempts` times,
/// waiting `startup.delay()` between attempts.
///
/// The last error is returned once attempts are exhausted.
pub async fn retry<T, E, F, Fut>(startup: &Startup, name: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = startup.attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                tracing::warn!(
                    dependency = name,
                    attempt,
                    attempts,
                    error = %err,
                    "startup dependency unavailable, retrying"
                );
                tokio::time::sleep(startup.delay()).await;
                attempt += 1;
            },
            Err(err) => {
                tracing::error!(dependency = name, attempts, error = %err, "startup dependency failed");
                return Err(err);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn startup(attempts: u32) -> Startup {
        Startup {
            attempts,
            delay_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = &AtomicU32::new(0);
        let result = retry(&startup(3), "flaky", || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err("down"),
                n => Ok(n),
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = retry(&startup(4), "dead", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let calls = &AtomicU32::new(0);
        let _ = retry(&startup(0), "once", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("down")
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
