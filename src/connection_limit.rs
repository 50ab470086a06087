//! Connection Limiting
//!
//! Optional cap on concurrent client connections. The relay is unbounded
//! unless `RELAY_MAX_CONNECTIONS` is set; the limiter still counts active
//! connections in both modes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tracks active connections and enforces an optional cap.
#[derive(Clone)]
pub struct ConnectionLimiter {
    inner: Arc<LimiterInner>,
}

struct LimiterInner {
    active: AtomicUsize,
    /// None means unlimited.
    cap: Option<usize>,
}

impl ConnectionLimiter {
    /// Creates a limiter. `None` admits every connection.
    pub fn new(cap: Option<usize>) -> Self {
        ConnectionLimiter {
            inner: Arc::new(LimiterInner {
                active: AtomicUsize::new(0),
                cap,
            }),
        }
    }

    /// Creates a limiter that never rejects.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Tries to take a connection slot.
    ///
    /// The returned guard releases the slot when dropped.
    pub fn try_acquire(&self) -> Option<ConnectionSlot> {
        let Some(cap) = self.inner.cap else {
            self.inner.active.fetch_add(1, Ordering::SeqCst);
            return Some(ConnectionSlot {
                inner: self.inner.clone(),
            });
        };

        self.inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < cap).then_some(current + 1)
            })
            .ok()
            .map(|_| ConnectionSlot {
                inner: self.inner.clone(),
            })
    }

    /// Returns the current number of active connections.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Returns the configured cap, if any.
    pub fn cap(&self) -> Option<usize> {
        self.inner.cap
    }
}

/// RAII guard for one admitted connection.
pub struct ConnectionSlot {
    inner: Arc<LimiterInner>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unlimited_never_rejects() {
        let limiter = ConnectionLimiter::unlimited();
        let slots: Vec<_> = (0..1000).filter_map(|_| limiter.try_acquire()).collect();
        assert_eq!(slots.len(), 1000);
        assert_eq!(limiter.active_count(), 1000);
        drop(slots);
        assert_eq!(limiter.active_count(), 0);
    }

    #[test]
    fn test_cap_rejects_at_limit() {
        let limiter = ConnectionLimiter::new(Some(2));

        let _s1 = limiter.try_acquire().expect("Should allow first");
        let _s2 = limiter.try_acquire().expect("Should allow second");
        assert!(limiter.try_acquire().is_none(), "Should reject at limit");
    }

    #[test]
    fn test_slot_releases_on_drop() {
        let limiter = ConnectionLimiter::new(Some(1));

        {
            let _slot = limiter.try_acquire().expect("Should allow");
            assert_eq!(limiter.active_count(), 1);
        }

        assert_eq!(limiter.active_count(), 0);
        let _slot = limiter.try_acquire().expect("Should allow after release");
    }

    #[test]
    fn test_cap_is_thread_safe() {
        let limiter = ConnectionLimiter::new(Some(10));
        let barrier = Arc::new(std::sync::Barrier::new(20));
        let mut handles = vec![];

        for _ in 0..20 {
            let limiter = limiter.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let slot = limiter.try_acquire();
                barrier.wait();
                slot.is_some()
            }));
        }

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 10);
        assert_eq!(limiter.active_count(), 0);
    }

    #[test]
    fn test_slot_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ConnectionSlot>();
    }
}
