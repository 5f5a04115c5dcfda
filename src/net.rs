//! Bounded retry with exponential backoff for transport failures.

use crate::error::Result;
use rand::{thread_rng, Rng};
use std::future::Future;
use std::time::Duration;

const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub base: Duration,
}

impl Backoff {
    pub fn none() -> Self {
        Self {
            retries: 0,
            base: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2*base, 4*base...
    /// plus up to half a base of jitter, capped at 30s.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << (attempt.clamp(1, 6) - 1));
        let jitter = if base_ms >= 2 {
            thread_rng().gen_range(0..=base_ms / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter).min(MAX_DELAY)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            retries: 3,
            base: Duration::from_millis(300),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the retry
/// budget is spent. `proceed` is consulted before every retry; returning
/// `false` gives up early with the last error.
pub async fn with_backoff<T, F, Fut, P>(
    backoff: Backoff,
    label: &str,
    mut op: F,
    mut proceed: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut() -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < backoff.retries && proceed() => {
                attempt += 1;
                let wait = backoff.delay(attempt);
                log::warn!(
                    "[net] {label} failed: {e}; retry={attempt}/{} backoff={}ms",
                    backoff.retries,
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::cell::Cell;

    fn fast(retries: u32) -> Backoff {
        Backoff {
            retries,
            base: Duration::from_millis(1),
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let b = Backoff {
            retries: 10,
            base: Duration::from_millis(300),
        };
        let d1 = b.delay(1).as_millis();
        let d3 = b.delay(3).as_millis();
        assert!((300..=450).contains(&d1), "{d1}");
        assert!((1200..=1350).contains(&d3), "{d3}");
        assert!(b.delay(30) <= MAX_DELAY);
    }

    #[tokio::test]
    async fn retries_transport_then_succeeds() {
        let calls = Cell::new(0);
        let out = with_backoff(
            fast(3),
            "test",
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(SyncError::transport("reset"))
                    } else {
                        Ok(n)
                    }
                }
            },
            || true,
        )
        .await;
        assert_eq!(out, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = Cell::new(0);
        let out: Result<()> = with_backoff(
            fast(2),
            "test",
            || {
                calls.set(calls.get() + 1);
                async { Err(SyncError::transport("down")) }
            },
            || true,
        )
        .await;
        assert!(out.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn validation_is_not_retried() {
        let calls = Cell::new(0);
        let out: Result<()> = with_backoff(
            fast(5),
            "test",
            || {
                calls.set(calls.get() + 1);
                async { Err(SyncError::validation("bad shape")) }
            },
            || true,
        )
        .await;
        assert!(matches!(out, Err(SyncError::Validation(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn proceed_false_stops_early() {
        let calls = Cell::new(0);
        let _: Result<()> = with_backoff(
            fast(5),
            "test",
            || {
                calls.set(calls.get() + 1);
                async { Err(SyncError::transport("down")) }
            },
            || false,
        )
        .await;
        assert_eq!(calls.get(), 1);
    }
}
