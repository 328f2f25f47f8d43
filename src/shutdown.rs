//! Cooperative cancellation shared by both channel pipelines.
//!
//! A [`ShutdownToken`] is the only cancellation primitive of the run. Triggering it sets
//! a flag that every wait predicate checks, then wakes every registered listener so a
//! thread that started waiting before the flag was set re-evaluates its predicate.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Something holding blocked threads that must be woken on shutdown.
pub trait ShutdownListener: Send + Sync {
    /// Wake every thread blocked on this listener so it re-checks its predicate.
    fn wake_all(&self);
}

struct Inner {
    triggered: AtomicBool,
    listeners: Mutex<Vec<Weak<dyn ShutdownListener>>>,
}

/// Cloneable handle to the run-wide stop flag.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    /// Create an untriggered token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Request shutdown and broadcast a wake to every live listener.
    ///
    /// Idempotent; only the first call logs.
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested, waking all pipeline stages");
        }
        self.wake_listeners();
    }

    /// Register a listener to be woken when the token triggers.
    ///
    /// A listener registered after the token already triggered is woken immediately.
    pub fn register(&self, listener: Weak<dyn ShutdownListener>) {
        {
            let mut listeners = self.inner.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.push(listener.clone());
        }
        if self.is_triggered() {
            if let Some(listener) = listener.upgrade() {
                listener.wake_all();
            }
        }
    }

    /// Number of listeners still alive.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }

    fn wake_listeners(&self) {
        // Upgrade under the lock, wake outside it: a listener's wake takes its own mutex.
        let live: Vec<Arc<dyn ShutdownListener>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        debug!(listeners = live.len(), "Broadcasting shutdown wake");
        for listener in live {
            listener.wake_all();
        }
    }
}

impl std::fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        wakes: AtomicUsize,
    }

    impl ShutdownListener for CountingListener {
        fn wake_all(&self) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn trigger_wakes_registered_listeners() {
        let token = ShutdownToken::new();
        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn ShutdownListener> = Arc::<CountingListener>::downgrade(&listener);
        token.register(weak);

        assert!(!token.is_triggered());
        token.trigger();
        assert!(token.is_triggered());
        assert_eq!(listener.wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_the_flag() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        clone.trigger();
        assert!(token.is_triggered());
    }

    #[test]
    fn late_registration_is_woken_immediately() {
        let token = ShutdownToken::new();
        token.trigger();

        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn ShutdownListener> = Arc::<CountingListener>::downgrade(&listener);
        token.register(weak);
        assert_eq!(listener.wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_listeners_are_pruned() {
        let token = ShutdownToken::new();
        {
            let listener = Arc::new(CountingListener::default());
            let weak: Weak<dyn ShutdownListener> = Arc::<CountingListener>::downgrade(&listener);
            token.register(weak);
            assert_eq!(token.listener_count(), 1);
        }
        assert_eq!(token.listener_count(), 0);
        token.trigger();
    }
}
