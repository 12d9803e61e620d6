//! Blocking-wait primitive.
//!
//! # Responsibilities
//! - Turn asynchronous event arrival into straight-line waits for scenarios
//! - Enforce an optional deadline on every wait
//!
//! # Design Decisions
//! - One reusable predicate-plus-signal utility; every higher-level
//!   `wait_for_*` is a thin condition check over it, never a bespoke loop
//! - Callbacks that change awaited state call `Notify::notify_waiters`; the
//!   waiter side re-checks its predicate on each wakeup, so spurious wakeups
//!   and multiple conditions sharing one signal are both fine
//! - A `None` deadline blocks unboundedly, relying on the external
//!   test-runner watchdog

use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::error::{HarnessError, Result};

/// Default deadline applied to harness waits unless overridden.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Block until `ready` returns true, waking on `signal`.
///
/// The predicate is checked before arming the waiter and again after the
/// waiter is armed, so a notification racing the check is never lost.
/// `what` names the awaited milestone in timeout errors.
pub async fn wait_until<F>(
    signal: &Notify,
    what: &'static str,
    deadline: Option<Duration>,
    mut ready: F,
) -> Result<()>
where
    F: FnMut() -> bool,
{
    let expires = deadline.map(|d| Instant::now() + d);
    loop {
        let notified = signal.notified();
        if ready() {
            return Ok(());
        }
        tracing::trace!(what, "waiting");
        match expires {
            Some(at) => timeout_at(at, notified)
                .await
                .map_err(|_| HarnessError::WaitTimeout { what })?,
            None => notified.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn returns_immediately_when_condition_already_holds() {
        let signal = Notify::new();
        wait_until(&signal, "nothing", Some(Duration::from_millis(10)), || true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wakes_on_notify() {
        let signal = Arc::new(Notify::new());
        let flag = Arc::new(AtomicBool::new(false));

        let bg_signal = Arc::clone(&signal);
        let bg_flag = Arc::clone(&flag);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bg_flag.store(true, Ordering::SeqCst);
            bg_signal.notify_waiters();
        });

        wait_until(&signal, "flag", Some(Duration::from_secs(5)), || {
            flag.load(Ordering::SeqCst)
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn reports_timeout_with_milestone_name() {
        let signal = Notify::new();
        let err = wait_until(&signal, "never", Some(Duration::from_millis(20)), || false)
            .await
            .unwrap_err();
        match err {
            HarnessError::WaitTimeout { what } => assert_eq!(what, "never"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
