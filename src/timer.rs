//! Keyed single-shot timeouts.
//!
//! At most one timeout per [`TimeoutKind`] is pending. Scheduling a kind again
//! replaces the pending one.

use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::trace;

/// Class of a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// No discovery traffic came back in time.
    Discovery,
    /// The sensor token did not come back in time.
    Sensor,
}

struct Scheduled {
    generation: u64,
    handle: AbortHandle,
}

type ScheduledMap = Arc<Mutex<HashMap<TimeoutKind, Scheduled>>>;

/// Per-kind delayed callbacks with cancel/replace semantics.
pub struct TimeoutScheduler {
    node_id: NodeId,
    next_generation: AtomicU64,
    scheduled: ScheduledMap,
}

impl TimeoutScheduler {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            next_generation: AtomicU64::new(0),
            scheduled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `action` after `delay` after cancelling every pending timeout,
    /// whatever its kind.
    ///
    /// A `None` delay stands for an infinite timeout: nothing is scheduled.
    pub fn schedule_exclusive<F>(&self, kind: TimeoutKind, delay: Option<Duration>, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut scheduled = self.scheduled.lock();
        for (_, pending) in scheduled.drain() {
            pending.handle.abort();
        }
        self.arm(&mut scheduled, kind, delay, action);
    }

    /// Run `action` after `delay`, replacing any pending timeout of `kind`,
    /// but only if none of `blockers` is pending. Returns whether the timeout
    /// was armed; a `None` delay cancels the pending one and arms nothing.
    pub fn schedule_unless<F>(
        &self,
        kind: TimeoutKind,
        delay: Option<Duration>,
        blockers: &[TimeoutKind],
        action: F,
    ) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut scheduled = self.scheduled.lock();
        if blockers.iter().any(|b| scheduled.contains_key(b)) {
            trace!(node_id = self.node_id, ?kind, "Timeout not armed, blocked");
            return false;
        }
        self.arm(&mut scheduled, kind, delay, action)
    }

    fn arm<F>(
        &self,
        scheduled: &mut HashMap<TimeoutKind, Scheduled>,
        kind: TimeoutKind,
        delay: Option<Duration>,
        action: F,
    ) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = scheduled.remove(&kind) {
            previous.handle.abort();
        }
        let Some(delay) = delay else {
            return false;
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let map = self.scheduled.clone();
        let node_id = self.node_id;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut scheduled = map.lock();
                match scheduled.get(&kind) {
                    Some(current) if current.generation == generation => {
                        scheduled.remove(&kind);
                    }
                    // Replaced or cancelled while firing.
                    _ => return,
                }
            }
            trace!(node_id, ?kind, "Timeout fired");
            action.await;
        });

        scheduled.insert(
            kind,
            Scheduled {
                generation,
                handle: handle.abort_handle(),
            },
        );
        trace!(node_id = self.node_id, ?kind, ?delay, "Timeout armed");
        true
    }

    /// Cancel the pending timeout of `kind`.
    pub fn cancel(&self, kind: TimeoutKind) {
        if let Some(pending) = self.scheduled.lock().remove(&kind) {
            pending.handle.abort();
            trace!(node_id = self.node_id, ?kind, "Timeout cancelled");
        }
    }

    /// Cancel every pending timeout.
    pub fn cancel_all(&self) {
        for (_, pending) in self.scheduled.lock().drain() {
            pending.handle.abort();
        }
    }

    /// Whether a timeout of `kind` is pending.
    pub fn is_active(&self, kind: TimeoutKind) -> bool {
        self.scheduled.lock().contains_key(&kind)
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(count: &Arc<AtomicUsize>, by: usize) -> impl Future<Output = ()> + Send + 'static {
        let count = count.clone();
        async move {
            count.fetch_add(by, Ordering::SeqCst);
        }
    }

    const SHORT: Duration = Duration::from_millis(30);
    const SETTLE: Duration = Duration::from_millis(150);

    #[tokio::test]
    async fn test_timeout_fires_once() {
        let timers = TimeoutScheduler::new(1);
        let fired = counter();

        timers.schedule_exclusive(TimeoutKind::Sensor, Some(SHORT), bump(&fired, 1));
        assert!(timers.is_active(TimeoutKind::Sensor));

        tokio::time::sleep(SETTLE).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_active(TimeoutKind::Sensor));
    }

    #[tokio::test]
    async fn test_schedule_replaces_pending() {
        let timers = TimeoutScheduler::new(1);
        let fired = counter();

        timers.schedule_unless(TimeoutKind::Sensor, Some(SHORT), &[], bump(&fired, 1));
        timers.schedule_unless(TimeoutKind::Sensor, Some(SHORT), &[], bump(&fired, 10));

        tokio::time::sleep(SETTLE).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_cancel_and_infinite_delay() {
        let timers = TimeoutScheduler::new(1);
        let fired = counter();

        timers.schedule_exclusive(TimeoutKind::Discovery, Some(SHORT), bump(&fired, 1));
        timers.cancel(TimeoutKind::Discovery);

        timers.schedule_exclusive(TimeoutKind::Sensor, Some(SHORT), bump(&fired, 1));
        timers.schedule_exclusive(TimeoutKind::Sensor, None, bump(&fired, 1));
        assert!(!timers.is_active(TimeoutKind::Sensor));

        tokio::time::sleep(SETTLE).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exclusive_cancels_other_kinds() {
        let timers = TimeoutScheduler::new(1);
        let fired = counter();

        timers.schedule_unless(TimeoutKind::Sensor, Some(SHORT), &[], bump(&fired, 1));
        timers.schedule_exclusive(TimeoutKind::Discovery, Some(SHORT), bump(&fired, 10));
        assert!(!timers.is_active(TimeoutKind::Sensor));

        // Blocked while discovery is pending.
        let armed = timers.schedule_unless(
            TimeoutKind::Sensor,
            Some(SHORT),
            &[TimeoutKind::Discovery],
            bump(&fired, 100),
        );
        assert!(!armed);

        tokio::time::sleep(SETTLE).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);

        let armed = timers.schedule_unless(
            TimeoutKind::Sensor,
            Some(SHORT),
            &[TimeoutKind::Discovery],
            bump(&fired, 100),
        );
        assert!(armed);
        timers.cancel_all();
        tokio::time::sleep(SETTLE).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
