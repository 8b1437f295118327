//! Host process environment.
//!
//! The session manager consults the environment for the process and user identity used in
//! hazard detection, the clock used for idle timeouts, and the sleep used between
//! reconnect rounds.

use async_trait::async_trait;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Presence of this file forces the soft reconnect policy.
pub const SOFT_POLICY_FLAG_FILE: &str = "/lib/init/rw/libnss-ldap.bind_policy_soft";

/// Process-level facts the engine depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostEnvironment: Send + Sync {
    /// Current process id.
    fn process_id(&self) -> u32;

    /// Current effective user id.
    fn effective_uid(&self) -> u32;

    /// Monotonic clock reading.
    fn now(&self) -> Instant;

    /// Returns true when the host has forced the soft reconnect policy.
    fn soft_policy_forced(&self) -> bool;

    /// Suspends the current operation.
    async fn sleep(&self, duration: Duration);
}

/// Environment of the running process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

#[async_trait]
impl HostEnvironment for SystemEnvironment {
    fn process_id(&self) -> u32 {
        std::process::id()
    }

    fn effective_uid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn soft_policy_forced(&self) -> bool {
        Path::new(SOFT_POLICY_FLAG_FILE).exists()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Ignores SIGPIPE for its lifetime and restores the previous disposition on drop.
///
/// A write to a connection the server already closed must fail with `EPIPE` instead of
/// killing the host process.
#[derive(Debug)]
pub struct SigpipeGuard {
    previous: Option<SigAction>,
}

impl SigpipeGuard {
    /// Installs `SIG_IGN` for SIGPIPE.
    #[must_use]
    pub fn install() -> Self {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: SIG_IGN runs no handler code, so no async-signal-safety requirement applies.
        let previous = match unsafe { sigaction(Signal::SIGPIPE, &ignore) } {
            Ok(previous) => Some(previous),
            Err(errno) => {
                debug!("failed to ignore SIGPIPE: {errno}");
                None
            }
        };
        Self { previous }
    }
}

impl Drop for SigpipeGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // SAFETY: restores exactly the disposition that was installed before the guard.
            if let Err(errno) = unsafe { sigaction(Signal::SIGPIPE, &previous) } {
                debug!("failed to restore SIGPIPE disposition: {errno}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_environment_reports_process() {
        let env = SystemEnvironment;
        assert_eq!(env.process_id(), std::process::id());
        assert_eq!(env.effective_uid(), nix::unistd::geteuid().as_raw());
        let earlier = env.now();
        assert!(env.now() >= earlier);
    }

    #[test]
    fn sigpipe_guard_ignores_while_held() {
        let outer = SigpipeGuard::install();
        assert!(outer.previous.is_some());

        let inner = SigpipeGuard::install();
        let seen = inner.previous.as_ref().map(SigAction::handler);
        assert!(matches!(seen, Some(SigHandler::SigIgn)));
        drop(inner);
        drop(outer);
    }

    #[tokio::test]
    async fn system_sleep_waits() {
        let env = SystemEnvironment;
        let start = Instant::now();
        env.sleep(Duration::from_millis(5)).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
