//! Non-fatal error reporting.
//!
//! Every runtime call made by the backend goes through [`ErrorReporter::check`].
//! The reporter logs the explicit failure of the call, then drains the
//! runtime's trailing error slot and logs that too. The two can be unrelated:
//! the trailing slot usually holds the failure of an earlier asynchronous
//! kernel launch. Nothing here panics or aborts.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::runtime::Runtime;

/// Logs and counts backend failures.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    failures: AtomicUsize,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the outcome of the runtime call `op` and return it unchanged.
    pub fn check<T>(&self, runtime: &dyn Runtime, op: &'static str, status: Result<T>) -> Result<T> {
        let trailing = runtime.take_last_error();
        if let Err(e) = &status {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(op, backend = runtime.name(), error = %e, "device call failed");
        }
        if let Some(e) = trailing {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(op, backend = runtime.name(), error = %e, "pending device error");
        }
        status
    }

    /// Report a failure that did not come from a runtime call.
    pub fn report(&self, op: &'static str, error: &crate::BackendError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(op, error = %error, "backend operation failed");
    }

    /// Number of failures logged so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::runtime::HostRuntime;

    #[test]
    fn test_success_is_silent() {
        let runtime = HostRuntime::new(1);
        let reporter = ErrorReporter::new();
        assert_eq!(reporter.check(&runtime, "noop", Ok(3)), Ok(3));
        assert_eq!(reporter.failures(), 0);
    }

    #[test]
    fn test_explicit_failure_passes_through() {
        let runtime = HostRuntime::new(1);
        let reporter = ErrorReporter::new();
        let status: Result<()> = Err(BackendError::InvalidDevice { index: 3, count: 1 });
        let out = reporter.check(&runtime, "set_device", status.clone());
        assert_eq!(out, status);
        assert_eq!(reporter.failures(), 1);
    }

    #[test]
    fn test_trailing_error_reported_independently() {
        let runtime = HostRuntime::new(1);
        let reporter = ErrorReporter::new();
        runtime.fail_next_launch("injected");
        let ptr = runtime.alloc(0, crate::runtime::ElementKind::F32, 4).unwrap();
        // the launch itself is accepted; its failure is pending
        assert!(runtime.fill(ptr, 4, 0.0, 1).is_ok());

        let status: Result<()> = Err(BackendError::InvalidPointer(crate::runtime::DevicePtr(1)));
        let out = reporter.check(&runtime, "free", status);
        assert!(out.is_err());
        assert_eq!(reporter.failures(), 2);

        // slot was drained
        assert_eq!(reporter.check(&runtime, "noop", Ok(())), Ok(()));
        assert_eq!(reporter.failures(), 2);
    }

    #[test]
    fn test_trailing_error_does_not_change_success() {
        let runtime = HostRuntime::new(1);
        let reporter = ErrorReporter::new();
        runtime.fail_next_launch("injected");
        let ptr = runtime.alloc(0, crate::runtime::ElementKind::F32, 1).unwrap();
        runtime.fill(ptr, 1, 1.0, 1).unwrap();
        assert_eq!(reporter.check(&runtime, "alloc", Ok(ptr)), Ok(ptr));
        assert_eq!(reporter.failures(), 1);
    }
}
