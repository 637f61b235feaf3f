//! Scoped completion of WinRT request deferrals
//!
//! A request handler takes a deferral before it hands the request off to the
//! pump. Windows holds the ATT transaction open until `Complete` is called,
//! so every path out of the handler (answered, dropped unanswered, unwinding)
//! must complete it exactly once.

use tracing::warn;

/// A native `Deferral`
pub trait Deferral: Send {
    fn complete(&self) -> bless_core::Result<()>;
}

/// Completes the wrapped deferral when dropped
pub struct DeferralGuard<D: Deferral> {
    deferral: Option<D>,
}

impl<D: Deferral> DeferralGuard<D> {
    pub fn new(deferral: D) -> Self {
        Self {
            deferral: Some(deferral),
        }
    }

    /// Complete now rather than at end of scope
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(deferral) = self.deferral.take() {
            if let Err(e) = deferral.complete() {
                warn!("Failed to complete deferral: {}", e);
            }
        }
    }
}

impl<D: Deferral> Drop for DeferralGuard<D> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bless_core::BackendError;

    #[derive(Clone, Default)]
    struct Counting {
        completions: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Deferral for Counting {
        fn complete(&self) -> bless_core::Result<()> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BackendError::native("Complete", "E_FAIL").into());
            }
            Ok(())
        }
    }

    impl Counting {
        fn count(&self) -> usize {
            self.completions.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_explicit_completion_is_not_repeated_on_drop() {
        let deferral = Counting::default();
        let guard = DeferralGuard::new(deferral.clone());
        guard.complete();
        assert_eq!(deferral.count(), 1);
    }

    #[test]
    fn test_drop_completes() {
        let deferral = Counting::default();
        {
            let _guard = DeferralGuard::new(deferral.clone());
        }
        assert_eq!(deferral.count(), 1);
    }

    #[test]
    fn test_panic_completes() {
        let deferral = Counting::default();
        let guard = DeferralGuard::new(deferral.clone());
        let result = catch_unwind(AssertUnwindSafe(move || {
            let _guard = guard;
            panic!("callback failed");
        }));
        assert!(result.is_err());
        assert_eq!(deferral.count(), 1);
    }

    #[test]
    fn test_failed_completion_is_attempted_once() {
        let deferral = Counting {
            fail: true,
            ..Counting::default()
        };
        DeferralGuard::new(deferral.clone()).complete();
        assert_eq!(deferral.count(), 1);
    }

    #[test]
    fn test_completes_when_event_is_rejected() {
        let deferral = Counting::default();
        let (sink, rx) = crate::bridge::EventSink::channel("test");
        drop(rx);
        assert!(!sink.push(DeferralGuard::new(deferral.clone())));
        assert_eq!(deferral.count(), 1);
    }
}
