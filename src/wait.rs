// ABOUTME: Bounded poll-until-condition loops used instead of fixed sleeps
// ABOUTME: Shows a spinner while waiting and reports the last probe error on timeout

use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::Timeouts;
use crate::error::SetupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn from_secs(timeout_secs: u64, timeouts: &Timeouts) -> Self {
        Self::new(Duration::from_secs(timeout_secs), timeouts.poll_interval())
    }
}

/// Calls `probe` every `policy.interval` until it yields `Some`.
///
/// Probe errors count as "not yet"; the most recent one is included in the
/// [`SetupError::Timeout`] returned once `policy.timeout` has elapsed.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    policy: PollPolicy,
    mut probe: F,
) -> Result<T, SetupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} ({elapsed})") {
        spinner.set_style(style);
    }
    spinner.set_message(format!("Waiting for {}", what));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        attempts += 1;
        match probe().await {
            Ok(Some(value)) => {
                spinner.finish_and_clear();
                debug!("{} ready after {} attempt(s)", what, attempts);
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => {
                debug!("{} not ready: {:#}", what, e);
                last_error = Some(e);
            }
        }

        if Instant::now() + policy.interval > deadline {
            spinner.finish_and_clear();
            let mut msg = format!(
                "{} not reached within {}s ({} attempts)",
                what,
                policy.timeout.as_secs(),
                attempts
            );
            if let Some(e) = last_error {
                msg.push_str(&format!("; last error: {:#}", e));
            }
            return Err(SetupError::Timeout(msg));
        }

        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(timeout_ms: u64) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(timeout_ms), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_returns_once_condition_holds() {
        let calls = Cell::new(0);
        let value = poll_until("counter", fast(1_000), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { Ok(if n >= 3 { Some(n) } else { None }) }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_times_out_with_last_error() {
        let err = poll_until::<(), _, _>("liveness of main", fast(30), || async {
            Err(anyhow::anyhow!("connection refused"))
        })
        .await
        .unwrap_err();

        match err {
            SetupError::Timeout(msg) => {
                assert!(msg.starts_with("liveness of main not reached"));
                assert!(msg.ends_with("last error: connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_zero_timeout_probes_once() {
        let calls = Cell::new(0);
        let result = poll_until::<(), _, _>("nothing", fast(0), || {
            calls.set(calls.get() + 1);
            async { Ok(None) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_policy_from_timeouts() {
        let policy = PollPolicy::from_secs(30, &Timeouts::default());
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.interval, Duration::from_secs(1));
    }
}
