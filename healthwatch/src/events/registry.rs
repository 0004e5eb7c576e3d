//! Ordered, per-kind observer registry with per-listener isolation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::types::Event;
use crate::error::panic_message;

/// A callback invoked for every published event of the kind it was registered for.
pub type Listener<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// Identifier of a single registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of a single [`ListenerRegistry::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Listeners that returned `Ok`.
    pub delivered: usize,
    /// Listeners that returned an error or panicked.
    pub failed: usize,
    /// Listeners that exceeded the time budget.
    pub timed_out: usize,
}

impl DeliveryReport {
    pub fn total(&self) -> usize {
        self.delivered + self.failed + self.timed_out
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.timed_out == 0
    }
}

struct Inner<E: Event> {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<E::Kind, Vec<(SubscriptionId, Listener<E>)>>>,
}

impl<E: Event> Inner<E> {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|(entry_id, _)| *entry_id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }
}

/// Mapping from event kind to an ordered list of listeners.
///
/// Cloning a registry yields another handle to the same listener set.
pub struct ListenerRegistry<E: Event> {
    inner: Arc<Inner<E>>,
    listener_timeout: Duration,
}

impl<E: Event> Clone for ListenerRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            listener_timeout: self.listener_timeout,
        }
    }
}

impl<E: Event> fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.inner.listeners.read();
        let counts: HashMap<_, _> = listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &counts)
            .field("listener_timeout", &self.listener_timeout)
            .finish()
    }
}

impl<E: Event> ListenerRegistry<E> {
    /// Create an empty registry. Each listener invocation is limited to `listener_timeout`.
    pub fn new(listener_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                listeners: RwLock::new(HashMap::new()),
            }),
            listener_timeout,
        }
    }

    /// Register `listener` for events of `kind`.
    ///
    /// The returned [`Subscription`] can revoke the registration later; dropping
    /// it leaves the listener registered.
    pub fn subscribe<F>(&self, kind: E::Kind, listener: F) -> Subscription<E>
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_many(&[kind], listener)
    }

    /// Register one listener for several kinds at once.
    pub fn subscribe_many<F>(&self, kinds: &[E::Kind], listener: F) -> Subscription<E>
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let listener: Listener<E> = Arc::new(listener);
        let mut ids = Vec::with_capacity(kinds.len());
        let mut listeners = self.inner.listeners.write();
        for kind in kinds {
            let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
            listeners
                .entry(*kind)
                .or_default()
                .push((id, Arc::clone(&listener)));
            debug!("Registered listener {} for {:?}", id, kind);
            ids.push(id);
        }

        Subscription {
            registry: Arc::downgrade(&self.inner),
            ids,
        }
    }

    /// Remove a single registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.inner
            .listeners
            .read()
            .get(&kind)
            .map_or(0, |entries| entries.len())
    }

    /// Deliver `event` to every listener registered for its kind, in
    /// registration order.
    ///
    /// Each listener runs on the blocking pool and is awaited for at most the
    /// configured time budget before the next one is notified. Errors, panics
    /// and timeouts are logged and counted; they never reach the caller.
    pub async fn publish(&self, event: E) -> DeliveryReport {
        let kind = event.kind();
        // Snapshot so listeners may (un)subscribe while being notified.
        let listeners: Vec<(SubscriptionId, Listener<E>)> = self
            .inner
            .listeners
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut report = DeliveryReport::default();
        for (id, listener) in listeners {
            let event = event.clone();
            let handle = tokio::task::spawn_blocking(move || listener(&event));

            match tokio::time::timeout(self.listener_timeout, handle).await {
                Ok(Ok(Ok(()))) => report.delivered += 1,
                Ok(Ok(Err(e))) => {
                    warn!("Listener {} failed handling {:?}: {:#}", id, kind, e);
                    report.failed += 1;
                }
                Ok(Err(join_err)) => {
                    if join_err.is_panic() {
                        warn!(
                            "Listener {} panicked handling {:?}: {}",
                            id,
                            kind,
                            panic_message(join_err.into_panic())
                        );
                    } else {
                        warn!("Listener {} was cancelled handling {:?}", id, kind);
                    }
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(
                        "Listener {} exceeded its {:?} budget handling {:?}, continuing",
                        id, self.listener_timeout, kind
                    );
                    report.timed_out += 1;
                }
            }
        }

        report
    }
}

/// Revocable handle to one or more registrations in a [`ListenerRegistry`].
///
/// Holds only a weak reference, so it does not keep the registry alive.
pub struct Subscription<E: Event> {
    registry: Weak<Inner<E>>,
    ids: Vec<SubscriptionId>,
}

impl<E: Event> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("ids", &self.ids).finish()
    }
}

impl<E: Event> Subscription<E> {
    pub fn ids(&self) -> &[SubscriptionId] {
        &self.ids
    }

    /// Whether the registry this subscription belongs to still exists.
    pub fn is_attached(&self) -> bool {
        self.registry.strong_count() > 0
    }

    /// Remove every registration held by this handle. Returns how many were removed.
    pub fn revoke(self) -> usize {
        match self.registry.upgrade() {
            Some(inner) => self.ids.iter().filter(|id| inner.remove(**id)).count(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::events::{MonitorEvent, MonitorEventKind};

    fn registry() -> ListenerRegistry<MonitorEvent> {
        ListenerRegistry::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_delivery_follows_registration_order() {
        let registry = registry();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = order.clone();
            registry.subscribe(MonitorEventKind::StallDetected, move |_| {
                order.lock().push(n);
                Ok(())
            });
        }

        let report = registry.publish(MonitorEvent::StallDetected).await;
        assert_eq!(report.delivered, 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_only_matching_kind_is_notified() {
        let registry = registry();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        registry.subscribe(MonitorEventKind::HighCpuUsage, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = registry.publish(MonitorEvent::HighMemoryUsage).await;
        assert_eq!(report.total(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_and_panic_are_isolated() {
        let registry = registry();
        let reached = Arc::new(AtomicUsize::new(0));

        registry.subscribe(MonitorEventKind::HighCpuUsage, |_| {
            Err(anyhow::anyhow!("listener broke"))
        });
        registry.subscribe(MonitorEventKind::HighCpuUsage, |_| panic!("listener panicked"));
        let r = reached.clone();
        registry.subscribe(MonitorEventKind::HighCpuUsage, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = registry.publish(MonitorEvent::HighCpuUsage).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert!(!report.is_clean());
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_listener_is_timed_out() {
        let registry = ListenerRegistry::new(Duration::from_millis(20));
        let reached = Arc::new(AtomicUsize::new(0));

        registry.subscribe(MonitorEventKind::StallDetected, |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        let r = reached.clone();
        registry.subscribe(MonitorEventKind::StallDetected, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = registry.publish(MonitorEvent::StallDetected).await;
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revoke_removes_all_registrations() {
        let registry = registry();
        let subscription = registry.subscribe_many(
            &[MonitorEventKind::HighCpuUsage, MonitorEventKind::HighMemoryUsage],
            |_| Ok(()),
        );
        let keep = registry.subscribe(MonitorEventKind::HighCpuUsage, |_| Ok(()));

        assert_eq!(registry.listener_count(MonitorEventKind::HighCpuUsage), 2);
        assert_eq!(subscription.revoke(), 2);
        assert_eq!(registry.listener_count(MonitorEventKind::HighCpuUsage), 1);
        assert_eq!(registry.listener_count(MonitorEventKind::HighMemoryUsage), 0);

        assert!(registry.unsubscribe(keep.ids()[0]));
        assert!(!registry.unsubscribe(keep.ids()[0]));
    }

    #[test]
    fn test_revoke_after_registry_dropped() {
        let registry = registry();
        let subscription = registry.subscribe(MonitorEventKind::StallDetected, |_| Ok(()));
        drop(registry);
        assert!(!subscription.is_attached());
        assert_eq!(subscription.revoke(), 0);
    }
}
