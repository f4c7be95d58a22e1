//! Cancellation plumbing
//!
//! A [`CancellationSignal`] is a sticky broadcast flag with on-cancel
//! listener hooks. The batch driver derives one child signal per package so
//! that per-package listeners never collide; the planner registers a
//! listener per daemon call and detaches it as soon as the call returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

struct Listener {
    id: u64,
    f: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

fn cancel_inner(inner: &Inner) {
    if inner.cancelled.swap(true, Ordering::SeqCst) {
        return;
    }
    // Take the listeners under the lock, invoke them outside it.
    let listeners = {
        let mut guard = inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
    };
    for listener in listeners {
        (listener.f)();
    }
}

/// Sticky cancellation flag with listener hooks and child derivation.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        cancel_inner(&self.inner);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a hook to run on cancellation. If the signal is already
    /// cancelled the hook runs immediately. Dropping the returned guard
    /// detaches the hook; hooks must not outlive the operation they guard.
    pub fn add_listener(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerGuard {
        if self.is_cancelled() {
            f();
            return ListenerGuard { registration: None };
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            listeners.push(Listener { id, f: Box::new(f) });
        }
        // Cancellation may have raced the registration; settle it now.
        if self.is_cancelled() {
            let listeners = {
                let mut guard = self
                    .inner
                    .listeners
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *guard)
            };
            for listener in listeners {
                (listener.f)();
            }
        }
        ListenerGuard {
            registration: Some((Arc::downgrade(&self.inner), id)),
        }
    }

    /// Derive a signal that is cancelled when `self` is, but can also be
    /// cancelled independently. The link is weak; dropping every clone of
    /// the child detaches it from the parent.
    pub fn child(&self) -> CancellationSignal {
        let child = CancellationSignal::new();
        let weak: Weak<Inner> = Arc::downgrade(&child.inner);
        let guard = self.add_listener(move || {
            if let Some(inner) = weak.upgrade() {
                cancel_inner(&inner);
            }
        });
        // The child keeps its parent registration alive for its own
        // lifetime.
        guard.forget_into(&child);
        child
    }
}

/// Detaches a cancellation listener when dropped.
pub struct ListenerGuard {
    registration: Option<(Weak<Inner>, u64)>,
}

impl ListenerGuard {
    /// Tie this registration to a child signal's lifetime instead of a
    /// lexical scope.
    fn forget_into(mut self, child: &CancellationSignal) {
        if let Some(reg) = self.registration.take() {
            let mut holders = child
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            // Parked as a no-op listener entry: it drops (and thereby
            // detaches from the parent) together with the child.
            let guard = ListenerGuard {
                registration: Some(reg),
            };
            holders.push(Listener {
                id: u64::MAX,
                f: Box::new(move || {
                    let _ = &guard;
                }),
            });
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some((weak, id)) = self.registration.take() {
            if let Some(inner) = weak.upgrade() {
                let mut listeners = inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
                listeners.retain(|l| l.id != id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_is_sticky_and_idempotent() {
        let signal = CancellationSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel();
        signal.cancel();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_listener_runs_on_cancel() {
        let signal = CancellationSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _guard = signal.add_listener(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        signal.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // A second cancel does not replay listeners.
        signal.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_on_cancelled_signal_fires_immediately() {
        let signal = CancellationSignal::new();
        signal.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _guard = signal.add_listener(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_listener_does_not_fire() {
        let signal = CancellationSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let guard = signal.add_listener(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        drop(guard);
        signal.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationSignal::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent_or_sibling() {
        let parent = CancellationSignal::new();
        let a = parent.child();
        let b = parent.child();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[test]
    fn test_child_created_after_cancel_is_cancelled() {
        let parent = CancellationSignal::new();
        parent.cancel();
        let child = parent.child();
        assert!(child.is_cancelled());
    }
}
