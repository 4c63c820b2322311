//! Observable, persisted collection of deployment records.
//!
//! Mutations and listener notifications are ordered by a single critical
//! section: every mutation enqueues its event while holding the state lock,
//! and a serial drain delivers queued events with the lock released, so
//! listeners may call back into the store without deadlocking.

use super::{PropertyStore, Result, StoreConfig};
use crate::deploy::DeploymentRecord;
use crate::env::props::DEPLOYMENTS_KEY;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// A record appeared
    Added(DeploymentRecord),
    /// A record was replaced
    Updated {
        /// Previous value
        old: DeploymentRecord,
        /// New value
        new: DeploymentRecord,
    },
    /// A record was removed
    Removed(DeploymentRecord),
}

impl DeploymentEvent {
    /// Application name the event is about.
    pub fn name(&self) -> &str {
        match self {
            DeploymentEvent::Added(record)
            | DeploymentEvent::Removed(record)
            | DeploymentEvent::Updated { new: record, .. } => &record.name,
        }
    }
}

/// Listener callback. Errors are logged and do not stop delivery.
pub type DeploymentListener = Arc<dyn Fn(&DeploymentEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct State {
    records: Vec<DeploymentRecord>,
    listeners: Vec<(ListenerId, DeploymentListener)>,
    next_listener: u64,
    queue: VecDeque<(Vec<DeploymentListener>, DeploymentEvent)>,
}

impl State {
    fn publish(&mut self, event: DeploymentEvent) {
        let listeners = self.listeners.iter().map(|(_, l)| l.clone()).collect();
        self.queue.push_back((listeners, event));
    }
}

struct Shared {
    state: Mutex<State>,
    dispatching: Mutex<()>,
    props: Arc<dyn PropertyStore>,
    debounce: Duration,
    persist_scheduled: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn dispatch(&self) {
        loop {
            let guard = match self.dispatching.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // Another caller is draining and will pick up our events
                Err(TryLockError::WouldBlock) => return,
            };

            loop {
                let next = lock(&self.state).queue.pop_front();
                let Some((listeners, event)) = next else { break };
                for listener in listeners {
                    if let Err(e) = listener(&event) {
                        error!("Deployment listener failed for {}: {:#}", event.name(), e);
                    }
                }
            }

            drop(guard);
            if lock(&self.state).queue.is_empty() {
                return;
            }
        }
    }

    fn schedule_persist(self: &Arc<Self>) {
        if self.debounce.is_zero() {
            self.persist_logged();
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.persist_logged();
            return;
        };
        if self.persist_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(shared.debounce).await;
            shared.persist_scheduled.store(false, Ordering::SeqCst);
            shared.persist_logged();
        });
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            error!("Failed to persist deployment records: {}", e);
        }
    }

    fn persist(&self) -> Result<()> {
        let records = lock(&self.state).records.clone();
        if records.is_empty() {
            return self.props.put(DEPLOYMENTS_KEY, None);
        }
        let raw = serde_json::to_string(&records)?;
        self.props.put(DEPLOYMENTS_KEY, Some(&raw))?;
        debug!("Persisted {} deployment records", records.len());
        Ok(())
    }
}

/// Keyed, persisted, observable collection of [`DeploymentRecord`]s.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct DeploymentStore {
    shared: Arc<Shared>,
}

impl DeploymentStore {
    /// Hydrate the store from persisted records.
    ///
    /// Decoding is fail-soft: records that do not decode are dropped with a
    /// warning, and an unreadable list yields an empty store.
    pub fn load(props: Arc<dyn PropertyStore>, config: &StoreConfig) -> Self {
        let records = Self::decode(props.as_ref());
        debug!("Loaded {} deployment records", records.len());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    records,
                    ..Default::default()
                }),
                dispatching: Mutex::new(()),
                props,
                debounce: config.debounce(),
                persist_scheduled: AtomicBool::new(false),
            }),
        }
    }

    fn decode(props: &dyn PropertyStore) -> Vec<DeploymentRecord> {
        let Some(raw) = props.get(DEPLOYMENTS_KEY) else {
            return Vec::new();
        };
        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(values) => values,
            Err(e) => {
                error!("Discarding unreadable deployment record list: {}", e);
                return Vec::new();
            }
        };

        let mut records: Vec<DeploymentRecord> = Vec::new();
        for value in values {
            match serde_json::from_value::<DeploymentRecord>(value) {
                Ok(record) => {
                    records.retain(|r| r.name != record.name);
                    records.push(record);
                }
                Err(e) => warn!("Dropping unreadable deployment record: {}", e),
            }
        }
        records
    }

    /// Insert or replace the record with the same name. Returns the previous value.
    ///
    /// Writing a record identical to the current one notifies nobody.
    pub fn create_or_update(&self, record: DeploymentRecord) -> Option<DeploymentRecord> {
        let old = {
            let mut state = lock(&self.shared.state);
            match state.records.iter().position(|r| r.name == record.name) {
                Some(index) if state.records[index] == record => return Some(record),
                Some(index) => {
                    let old = std::mem::replace(&mut state.records[index], record.clone());
                    state.publish(DeploymentEvent::Updated {
                        old: old.clone(),
                        new: record,
                    });
                    Some(old)
                }
                None => {
                    state.records.push(record.clone());
                    state.publish(DeploymentEvent::Added(record));
                    None
                }
            }
        };
        self.shared.dispatch();
        self.shared.schedule_persist();
        old
    }

    /// Apply `change` to the named record atomically. Returns the new value.
    pub fn modify(
        &self,
        name: &str,
        change: impl FnOnce(&mut DeploymentRecord),
    ) -> Option<DeploymentRecord> {
        let new = {
            let mut state = lock(&self.shared.state);
            let index = state.records.iter().position(|r| r.name == name)?;
            let mut new = state.records[index].clone();
            change(&mut new);
            if new == state.records[index] {
                return Some(new);
            }
            let old = std::mem::replace(&mut state.records[index], new.clone());
            state.publish(DeploymentEvent::Updated {
                old,
                new: new.clone(),
            });
            new
        };
        self.shared.dispatch();
        self.shared.schedule_persist();
        Some(new)
    }

    /// Remove the named record. Returns it if it existed.
    pub fn remove(&self, name: &str) -> Option<DeploymentRecord> {
        let removed = {
            let mut state = lock(&self.shared.state);
            let index = state.records.iter().position(|r| r.name == name)?;
            let removed = state.records.remove(index);
            state.publish(DeploymentEvent::Removed(removed.clone()));
            removed
        };
        self.shared.dispatch();
        self.shared.schedule_persist();
        Some(removed)
    }

    /// Current value of a record.
    pub fn get(&self, name: &str) -> Option<DeploymentRecord> {
        lock(&self.shared.state)
            .records
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    /// All records in insertion order.
    pub fn records(&self) -> Vec<DeploymentRecord> {
        lock(&self.shared.state).records.clone()
    }

    /// Register a listener.
    ///
    /// The listener first receives an `Added` event for every current record,
    /// in insertion order, and only then live events.
    pub fn add_listener(&self, listener: DeploymentListener) -> ListenerId {
        let id = {
            let mut state = lock(&self.shared.state);
            let id = ListenerId(state.next_listener);
            state.next_listener += 1;
            state.listeners.push((id, listener.clone()));
            let replay: Vec<_> = state
                .records
                .iter()
                .map(|r| (vec![listener.clone()], DeploymentEvent::Added(r.clone())))
                .collect();
            state.queue.extend(replay);
            id
        };
        self.shared.dispatch();
        id
    }

    /// Unregister a listener. Events already queued for it are still delivered.
    pub fn remove_listener(&self, id: ListenerId) {
        lock(&self.shared.state).listeners.retain(|(l, _)| *l != id);
    }

    /// Write the current records immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the property store cannot persist the list.
    pub fn flush(&self) -> Result<()> {
        self.shared.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::RunState;
    use crate::store::MemoryPropertyStore;

    fn store_with(props: Arc<MemoryPropertyStore>) -> DeploymentStore {
        DeploymentStore::load(
            props,
            &StoreConfig {
                persist_debounce_ms: 0,
                ..Default::default()
            },
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<DeploymentEvent>>>, DeploymentListener) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener: DeploymentListener = Arc::new(move |event: &DeploymentEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        (events, listener)
    }

    #[test]
    fn test_replay_precedes_live_events() {
        let store = store_with(Arc::new(MemoryPropertyStore::new()));
        for name in ["a", "b", "c"] {
            store.create_or_update(DeploymentRecord::new(name, RunState::Running, "s"));
        }

        let (events, listener) = recorder();
        store.add_listener(listener);
        store.create_or_update(DeploymentRecord::new("d", RunState::Running, "s"));

        let events = events.lock().unwrap();
        let names: Vec<_> = events.iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert!(events.iter().all(|e| matches!(e, DeploymentEvent::Added(_))));
    }

    #[test]
    fn test_update_and_remove_events() {
        let store = store_with(Arc::new(MemoryPropertyStore::new()));
        let (events, listener) = recorder();
        store.add_listener(listener);

        let first = DeploymentRecord::new("a", RunState::Running, "s");
        assert!(store.create_or_update(first.clone()).is_none());
        assert!(store.create_or_update(first.clone()).is_some());
        let second = first.redeployed(RunState::Debugging, "s");
        assert_eq!(store.create_or_update(second.clone()), Some(first.clone()));
        assert_eq!(store.remove("a"), Some(second.clone()));
        assert_eq!(store.remove("a"), None);

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                DeploymentEvent::Added(first.clone()),
                DeploymentEvent::Updated {
                    old: first,
                    new: second.clone()
                },
                DeploymentEvent::Removed(second),
            ]
        );
    }

    #[test]
    fn test_listener_may_reenter_store() {
        let store = store_with(Arc::new(MemoryPropertyStore::new()));
        let inner = store.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.add_listener(Arc::new(move |event: &DeploymentEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(event.name().to_string());
            if event.name() == "a" && matches!(event, DeploymentEvent::Added(_)) {
                inner.create_or_update(DeploymentRecord::new("b", RunState::Running, "s"));
            }
            Ok(())
        }));

        store.create_or_update(DeploymentRecord::new("a", RunState::Running, "s"));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        assert!(store.get("b").is_some());
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let store = store_with(Arc::new(MemoryPropertyStore::new()));
        store.add_listener(Arc::new(|_: &DeploymentEvent| -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }));
        let (events, listener) = recorder();
        store.add_listener(listener);

        store.create_or_update(DeploymentRecord::new("a", RunState::Running, "s"));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_modify_publishes_update() {
        let store = store_with(Arc::new(MemoryPropertyStore::new()));
        store.create_or_update(DeploymentRecord::new("a", RunState::Running, "s"));
        let (events, listener) = recorder();
        store.add_listener(listener);

        let new = store
            .modify("a", |r| {
                r.system_properties.insert("k".into(), "v".into());
            })
            .unwrap();
        assert_eq!(new.system_properties["k"], "v");
        assert!(store.modify("missing", |_| {}).is_none());
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_persist_and_reload() {
        let props = Arc::new(MemoryPropertyStore::new());
        let store = store_with(props.clone());
        let record = DeploymentRecord::new("a", RunState::Running, "s").with_system_property("k", "v");
        store.create_or_update(record.clone());

        let reloaded = store_with(props);
        assert_eq!(reloaded.records(), vec![record]);
    }

    #[test]
    fn test_load_drops_unreadable_records() {
        let props = Arc::new(MemoryPropertyStore::new());
        let good = DeploymentRecord::new("good", RunState::Inactive, "s");
        let raw = format!(
            "[{}, {{\"name\": \"bad\", \"desiredRunState\": \"SLEEPING\"}}, 42]",
            serde_json::to_string(&good).unwrap()
        );
        props.put(DEPLOYMENTS_KEY, Some(&raw)).unwrap();

        assert_eq!(store_with(props.clone()).records(), vec![good]);

        props.put(DEPLOYMENTS_KEY, Some("not a list")).unwrap();
        assert!(store_with(props).records().is_empty());
    }

    #[tokio::test]
    async fn test_debounced_persist() {
        let props = Arc::new(MemoryPropertyStore::new());
        let store = DeploymentStore::load(
            props.clone(),
            &StoreConfig {
                persist_debounce_ms: 20,
                ..Default::default()
            },
        );
        store.create_or_update(DeploymentRecord::new("a", RunState::Running, "s"));
        store.create_or_update(DeploymentRecord::new("b", RunState::Running, "s"));
        assert!(props.get(DEPLOYMENTS_KEY).is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let persisted: Vec<DeploymentRecord> =
            serde_json::from_str(&props.get(DEPLOYMENTS_KEY).unwrap()).unwrap();
        assert_eq!(persisted.len(), 2);
    }
}
