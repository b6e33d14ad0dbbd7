//! Selector-based observers.
//!
//! Observers never see every commit, only the commits that changed what
//! they selected. Two kinds of selector exist:
//!
//! - **Projection**: a function of the committed [`Snapshot`] (state,
//!   derived values, loading and error maps); the result is compared with
//!   `PartialEq` against the previous one.
//! - **Keys**: a list of names, each resolving to a state field, a derived
//!   value, an action, or an action's loading flag (`loading:<action>`) or
//!   last error (`error:<action>`). Fields compare by value, derived values
//!   and errors by identity, actions never change.
//!
//! # Execution Order
//!
//! ```text
//! commit
//!  → registry lock
//!  → recompute every selection, collect listeners whose selection changed
//!  → publish snapshot to watchers
//!  → registry unlock
//!  → call listeners   ← outside the lock, may subscribe/unsubscribe freely
//! ```
//!
//! Subscribing takes the same lock, so a new observer either sees a commit
//! as its initial selection or gets notified about it, never neither.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use smallvec::SmallVec;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::core::extract_panic_message;
use crate::derived::ErasedValue;
use crate::error::{ActionError, StoreError};
use crate::snapshot::Snapshot;

type Notification = Box<dyn FnOnce() + Send>;

/// Prefix of keys selecting an action's loading flag.
pub const LOADING_KEY_PREFIX: &str = "loading:";
/// Prefix of keys selecting an action's last error.
pub const ERROR_KEY_PREFIX: &str = "error:";

// =============================================================================
// Key selections
// =============================================================================

/// Current value of one selected key.
#[derive(Clone)]
pub enum SelectedValue {
    /// A field of the state, as JSON.
    Field(serde_json::Value),
    /// A derived value.
    Derived(Arc<dyn Any + Send + Sync>),
    /// An action handle (stable for the lifetime of the store).
    Action(Arc<str>),
    /// Whether an action has any invocation in flight.
    Loading(bool),
    /// An action's entry in the Error Map.
    Error(Option<ActionError>),
    /// Nothing available for this key in the snapshot.
    Missing,
}

impl PartialEq for SelectedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SelectedValue::Field(a), SelectedValue::Field(b)) => a == b,
            (SelectedValue::Derived(a), SelectedValue::Derived(b)) => Arc::ptr_eq(a, b),
            (SelectedValue::Action(a), SelectedValue::Action(b)) => a == b,
            (SelectedValue::Loading(a), SelectedValue::Loading(b)) => a == b,
            (SelectedValue::Error(a), SelectedValue::Error(b)) => a == b,
            (SelectedValue::Missing, SelectedValue::Missing) => true,
            _ => false,
        }
    }
}

impl std::fmt::Debug for SelectedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectedValue::Field(v) => f.debug_tuple("Field").field(v).finish(),
            SelectedValue::Derived(_) => f.write_str("Derived(..)"),
            SelectedValue::Action(name) => f.debug_tuple("Action").field(name).finish(),
            SelectedValue::Loading(loading) => f.debug_tuple("Loading").field(loading).finish(),
            SelectedValue::Error(error) => f.debug_tuple("Error").field(error).finish(),
            SelectedValue::Missing => f.write_str("Missing"),
        }
    }
}

/// The values selected by a key observer, in key order.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct KeySelection {
    entries: SmallVec<[(Arc<str>, SelectedValue); 4]>,
}

impl KeySelection {
    /// The selected value for a key.
    pub fn get(&self, key: &str) -> Option<&SelectedValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v)
    }

    /// Deserialize a selected state field.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get(key)? {
            SelectedValue::Field(value) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }

    /// A selected derived value.
    pub fn derived<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        match self.get(key)? {
            SelectedValue::Derived(value) => value.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// A selected loading flag (`loading:<action>` keys).
    pub fn loading(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            SelectedValue::Loading(loading) => Some(*loading),
            _ => None,
        }
    }

    /// A selected error (`error:<action>` keys). `None` if the key was not
    /// selected or the action has no error recorded.
    pub fn error(&self, key: &str) -> Option<&ActionError> {
        match self.get(key)? {
            SelectedValue::Error(error) => error.as_ref(),
            _ => None,
        }
    }

    /// Iterate over (key, value) pairs in selector order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SelectedValue)> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// Number of selected keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no keys were selected.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a selector key reads from. Resolved once, at subscribe time.
#[derive(Debug, Clone)]
pub(crate) enum KeySource {
    Derived(Arc<str>),
    Action(Arc<str>),
    Field(Arc<str>),
    Loading { key: Arc<str>, action: Arc<str> },
    Error { key: Arc<str>, action: Arc<str> },
}

impl KeySource {
    fn name(&self) -> &Arc<str> {
        match self {
            KeySource::Derived(n) | KeySource::Action(n) | KeySource::Field(n) => n,
            KeySource::Loading { key, .. } | KeySource::Error { key, .. } => key,
        }
    }
}

/// Serializes a state into its JSON field view.
pub(crate) type FieldsFn<S> = fn(&S) -> Option<serde_json::Value>;

pub(crate) fn state_fields<S: serde::Serialize>(state: &S) -> Option<serde_json::Value> {
    match serde_json::to_value(state) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "state could not be serialized for key selection");
            None
        }
    }
}

/// Lazily computed JSON view of a snapshot's state, shared by all key observers.
fn snapshot_fields<'a, S>(snapshot: &'a Snapshot<S>, to_json: FieldsFn<S>) -> Option<&'a serde_json::Value> {
    snapshot
        .fields
        .get_or_init(|| to_json(&snapshot.state))
        .as_ref()
}

pub(crate) fn select_keys<S>(
    snapshot: &Snapshot<S>,
    sources: &[KeySource],
    to_json: FieldsFn<S>,
) -> KeySelection {
    let entries = sources
        .iter()
        .map(|source| {
            let value = match source {
                KeySource::Derived(name) => snapshot
                    .derived
                    .get_erased(name)
                    .map(|v: &ErasedValue| SelectedValue::Derived(v.clone()))
                    .unwrap_or(SelectedValue::Missing),
                KeySource::Action(name) => SelectedValue::Action(name.clone()),
                KeySource::Field(name) => snapshot_fields(snapshot, to_json)
                    .and_then(|fields| fields.get(name.as_ref()))
                    .map(|v| SelectedValue::Field(v.clone()))
                    .unwrap_or(SelectedValue::Missing),
                KeySource::Loading { action, .. } => {
                    SelectedValue::Loading(snapshot.is_loading(action, None))
                }
                KeySource::Error { action, .. } => {
                    SelectedValue::Error(snapshot.error(action).cloned())
                }
            };
            (source.name().clone(), value)
        })
        .collect();
    KeySelection { entries }
}

/// Resolve selector keys: `loading:`/`error:` keys of known actions first,
/// then derived names, action names and state fields.
pub(crate) fn resolve_keys<S, K, I>(
    keys: I,
    snapshot: &Snapshot<S>,
    is_action: impl Fn(&str) -> bool,
    to_json: FieldsFn<S>,
) -> Result<Vec<KeySource>, StoreError>
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    keys.into_iter()
        .map(|key| {
            let key = key.as_ref();
            let name: Arc<str> = Arc::from(key);
            if let Some(action) = key.strip_prefix(LOADING_KEY_PREFIX).filter(|a| is_action(*a)) {
                Ok(KeySource::Loading {
                    key: name,
                    action: Arc::from(action),
                })
            } else if let Some(action) = key.strip_prefix(ERROR_KEY_PREFIX).filter(|a| is_action(*a)) {
                Ok(KeySource::Error {
                    key: name,
                    action: Arc::from(action),
                })
            } else if snapshot.derived.get_erased(key).is_some() {
                Ok(KeySource::Derived(name))
            } else if is_action(key) {
                Ok(KeySource::Action(name))
            } else if snapshot_fields(snapshot, to_json)
                .and_then(|v| v.as_object())
                .is_some_and(|fields| fields.contains_key(key))
            {
                Ok(KeySource::Field(name))
            } else {
                Err(StoreError::UnknownSelectorKey {
                    key: key.to_string(),
                })
            }
        })
        .collect()
}

// =============================================================================
// Observers
// =============================================================================

/// An observer as stored in the registry.
pub(crate) trait Observer<S>: Send {
    /// Recompute the selection; if it changed, return the notification to run.
    fn check(&mut self, snapshot: &Snapshot<S>) -> Option<Notification>;
}

pub(crate) struct ProjectionObserver<S, T> {
    select: Box<dyn Fn(&Snapshot<S>) -> T + Send + Sync>,
    last: T,
    listener: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<S, T> ProjectionObserver<S, T>
where
    T: PartialEq + Clone + Send + 'static,
{
    pub fn new(
        select: Box<dyn Fn(&Snapshot<S>) -> T + Send + Sync>,
        listener: Arc<dyn Fn(&T) + Send + Sync>,
        initial: &Snapshot<S>,
    ) -> Self {
        let last = select(initial);
        Self {
            select,
            last,
            listener,
        }
    }
}

impl<S, T> Observer<S> for ProjectionObserver<S, T>
where
    T: PartialEq + Clone + Send + 'static,
{
    fn check(&mut self, snapshot: &Snapshot<S>) -> Option<Notification> {
        let next = match catch_unwind(AssertUnwindSafe(|| (self.select)(snapshot))) {
            Ok(next) => next,
            Err(panic_info) => {
                error!(panic = %extract_panic_message(&panic_info), "selector panicked");
                return None;
            }
        };
        if next == self.last {
            return None;
        }
        self.last = next.clone();
        let listener = self.listener.clone();
        Some(Box::new(move || listener(&next)))
    }
}

pub(crate) struct KeyObserver<S> {
    sources: Vec<KeySource>,
    to_json: FieldsFn<S>,
    last: KeySelection,
    listener: Arc<dyn Fn(&KeySelection) + Send + Sync>,
}

impl<S> KeyObserver<S> {
    pub fn new(
        sources: Vec<KeySource>,
        to_json: FieldsFn<S>,
        listener: Arc<dyn Fn(&KeySelection) + Send + Sync>,
        initial: &Snapshot<S>,
    ) -> Self {
        let last = select_keys(initial, &sources, to_json);
        Self {
            sources,
            to_json,
            last,
            listener,
        }
    }
}

impl<S> Observer<S> for KeyObserver<S> {
    fn check(&mut self, snapshot: &Snapshot<S>) -> Option<Notification> {
        let next = select_keys(snapshot, &self.sources, self.to_json);
        if next == self.last {
            return None;
        }
        self.last = next.clone();
        let listener = self.listener.clone();
        Some(Box::new(move || listener(&next)))
    }
}

// =============================================================================
// Registry
// =============================================================================

struct RegistryInner<S> {
    observers: BTreeMap<u64, Box<dyn Observer<S>>>,
    next_id: u64,
}

/// Holds the current snapshot and every observer of one store.
pub(crate) struct ObserverRegistry<S> {
    inner: Mutex<RegistryInner<S>>,
    snapshots: watch::Sender<Snapshot<S>>,
}

impl<S: Send + Sync + 'static> ObserverRegistry<S> {
    pub fn new(initial: Snapshot<S>) -> Self {
        let (snapshots, _) = watch::channel(initial);
        Self {
            inner: Mutex::new(RegistryInner {
                observers: BTreeMap::new(),
                next_id: 1,
            }),
            snapshots,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<S>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("observer registry mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// The last committed snapshot.
    pub fn current(&self) -> Snapshot<S> {
        self.snapshots.borrow().clone()
    }

    /// A receiver that sees every committed snapshot.
    pub fn watch(&self) -> watch::Receiver<Snapshot<S>> {
        self.snapshots.subscribe()
    }

    /// Register an observer built from the current snapshot.
    ///
    /// `build` runs under the registry lock, so no commit can slip between
    /// reading the initial selection and registering.
    pub fn register<F>(&self, build: F) -> u64
    where
        F: FnOnce(&Snapshot<S>) -> Box<dyn Observer<S>>,
    {
        let mut inner = self.lock();
        let observer = build(&self.snapshots.borrow());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.observers.insert(id, observer);
        id
    }

    /// Remove an observer. Returns false if it was already gone.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().observers.remove(&id).is_some()
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.lock().observers.len()
    }

    /// Publish a committed snapshot and notify observers whose selection changed.
    pub fn publish(&self, snapshot: Snapshot<S>) {
        let notifications: Vec<Notification> = {
            let mut inner = self.lock();
            let pending = inner
                .observers
                .values_mut()
                .filter_map(|observer| observer.check(&snapshot))
                .collect();
            self.snapshots.send_replace(snapshot);
            pending
        };

        for notify in notifications {
            if let Err(panic_info) = catch_unwind(AssertUnwindSafe(notify)) {
                error!(panic = %extract_panic_message(&panic_info), "listener panicked");
            }
        }
    }
}

/// Type-erased removal, so `Subscription` need not name the state type.
pub(crate) trait ObserverRemoval: Send + Sync {
    fn remove_observer(&self, id: u64);
}

impl<S: Send + Sync + 'static> ObserverRemoval for ObserverRegistry<S> {
    fn remove_observer(&self, id: u64) {
        self.remove(id);
    }
}

// =============================================================================
// Subscription handle
// =============================================================================

/// Handle to a registered observer.
///
/// Dropping the handle unsubscribes. Unsubscribing twice, or after the store
/// is gone, is a no-op.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Option<Weak<dyn ObserverRemoval>>,
}

impl Subscription {
    pub(crate) fn new(id: u64, registry: Weak<dyn ObserverRemoval>) -> Self {
        Self {
            id,
            registry: Some(registry),
        }
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.remove_observer(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived::DerivedValues;
    use crate::snapshot::{ErrorMap, LoadingMap};
    use serde::Serialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, Default, Serialize)]
    struct Profile {
        name: String,
        age: u32,
    }

    fn snapshot(state: Profile, version: u64) -> Snapshot<Profile> {
        Snapshot::new(
            Arc::new(state),
            DerivedValues::default(),
            Arc::new(LoadingMap::default()),
            Arc::new(ErrorMap::default()),
            version,
        )
    }

    fn registry() -> Arc<ObserverRegistry<Profile>> {
        Arc::new(ObserverRegistry::new(snapshot(Profile::default(), 0)))
    }

    #[test]
    fn test_projection_fires_only_on_change() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        registry
            .register(|snap| {
                Box::new(ProjectionObserver::new(
                    Box::new(|s: &Snapshot<Profile>| s.state.age),
                    Arc::new(move |_: &u32| {
                        calls_clone.fetch_add(1, Ordering::SeqCst);
                    }),
                    snap,
                ))
            });

        registry.publish(snapshot(Profile { name: "a".into(), age: 0 }, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry.publish(snapshot(Profile { name: "a".into(), age: 1 }, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_selection_isolation() {
        let registry = registry();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let seen_clone = seen.clone();

        let current = registry.current();
        let sources = resolve_keys(["name"], &current, |_| false, state_fields::<Profile>).unwrap();
        registry
            .register(|snap| {
                Box::new(KeyObserver::new(
                    sources,
                    state_fields::<Profile>,
                    Arc::new(move |sel: &KeySelection| {
                        let name: String = sel.field("name").unwrap();
                        seen_clone.lock().unwrap().push(name);
                    }),
                    snap,
                ))
            });

        registry.publish(snapshot(Profile { name: String::new(), age: 40 }, 1));
        registry.publish(snapshot(Profile { name: "Lin".into(), age: 40 }, 2));

        assert_eq!(*seen.lock().unwrap(), vec!["Lin".to_string()]);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let registry = registry();
        let current = registry.current();
        let result = resolve_keys(["nope"], &current, |_| false, state_fields::<Profile>);
        assert!(matches!(result, Err(StoreError::UnknownSelectorKey { key }) if key == "nope"));
    }

    #[test]
    fn test_loading_and_error_keys() {
        let registry = registry();
        let current = registry.current();
        let sources = resolve_keys(
            ["loading:save", "error:save"],
            &current,
            |k| k == "save",
            state_fields::<Profile>,
        )
        .unwrap();

        let mut loading = LoadingMap::default();
        loading.start(&Arc::from("save"), &Arc::from("default"));
        let busy = Snapshot::new(
            Arc::new(Profile::default()),
            DerivedValues::default(),
            Arc::new(loading),
            Arc::new(ErrorMap::default()),
            1,
        );
        let selection = select_keys(&busy, &sources, state_fields::<Profile>);
        assert_eq!(selection.loading("loading:save"), Some(true));
        assert!(selection.error("error:save").is_none());
        assert_ne!(selection, select_keys(&current, &sources, state_fields::<Profile>));

        let unknown = resolve_keys(["loading:nope"], &current, |k| k == "save", state_fields::<Profile>);
        assert!(matches!(unknown, Err(StoreError::UnknownSelectorKey { key }) if key == "loading:nope"));
    }

    #[test]
    fn test_action_keys_resolve_before_fields() {
        let registry = registry();
        let current = registry.current();
        let sources =
            resolve_keys(["age", "bump"], &current, |k| k == "bump", state_fields::<Profile>)
                .unwrap();
        let selection = select_keys(&current, &sources, state_fields::<Profile>);
        assert_eq!(selection.len(), 2);
        assert_eq!(selection.get("bump"), Some(&SelectedValue::Action(Arc::from("bump"))));
        assert_eq!(selection.field::<u32>("age"), Some(0));
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let registry = registry();
        let id = registry.register(|snap| {
            Box::new(ProjectionObserver::new(
                Box::new(|s: &Snapshot<Profile>| s.state.age),
                Arc::new(|_: &u32| {}),
                snap,
            ))
        });
        assert_eq!(registry.len(), 1);

        let weak: Weak<dyn ObserverRemoval> = Arc::downgrade(&registry) as Weak<ObserverRegistry<Profile>>;
        let subscription = Subscription::new(id, weak);
        drop(subscription);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_listener_panic_does_not_poison_publish() {
        let registry = registry();
        registry
            .register(|snap| {
                Box::new(ProjectionObserver::new(
                    Box::new(|s: &Snapshot<Profile>| s.state.age),
                    Arc::new(|_: &u32| panic!("listener bug")),
                    snap,
                ))
            });

        registry.publish(snapshot(Profile { name: String::new(), age: 9 }, 1));
        assert_eq!(registry.current().version(), 1);
    }

    #[test]
    fn test_watch_receives_published_snapshots() {
        let registry = registry();
        let rx = registry.watch();
        registry.publish(snapshot(Profile { name: "x".into(), age: 2 }, 7));
        assert_eq!(rx.borrow().version(), 7);
    }
}
