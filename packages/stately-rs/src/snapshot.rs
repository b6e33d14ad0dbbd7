//! Committed snapshots of a store.
//!
//! A [`Snapshot`] bundles everything an observer can see at one instant:
//! the state, the derived values computed from it, the loading map and the
//! error map. The dispatch loop builds a new snapshot for every commit and
//! publishes it whole, so no reader ever sees a state from one transition
//! next to a loading flag from another.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};

use crate::derived::DerivedValues;
use crate::error::ActionError;

// =============================================================================
// Loading Map
// =============================================================================

/// Which actions (and operation ids) are currently in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingMap {
    entries: BTreeMap<Arc<str>, BTreeSet<Arc<str>>>,
}

impl LoadingMap {
    /// Returns true if the action is loading.
    ///
    /// With `operation_id = None`, any operation id counts.
    pub fn is_loading(&self, action: &str, operation_id: Option<&str>) -> bool {
        match (self.entries.get(action), operation_id) {
            (Some(ids), Some(id)) => ids.contains(id),
            (Some(ids), None) => !ids.is_empty(),
            (None, _) => false,
        }
    }

    /// Operation ids currently loading for an action.
    pub fn operation_ids(&self, action: &str) -> impl Iterator<Item = &str> {
        self.entries
            .get(action)
            .into_iter()
            .flat_map(|ids| ids.iter().map(|id| id.as_ref()))
    }

    /// Returns true if nothing is loading.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn start(&mut self, action: &Arc<str>, operation_id: &Arc<str>) -> bool {
        self.entries
            .entry(action.clone())
            .or_default()
            .insert(operation_id.clone())
    }

    pub(crate) fn finish(&mut self, action: &str, operation_id: &str) -> bool {
        let Some(ids) = self.entries.get_mut(action) else {
            return false;
        };
        let removed = ids.remove(operation_id);
        if ids.is_empty() {
            self.entries.remove(action);
        }
        removed
    }
}

// =============================================================================
// Error Map
// =============================================================================

/// The last error recorded for an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    /// The error.
    pub error: ActionError,
    /// Operation id of the failed invocation.
    pub operation_id: Arc<str>,
    /// When the invocation failed.
    pub occurred_at: DateTime<Utc>,
}

/// Last error per action name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorMap {
    entries: BTreeMap<Arc<str>, ErrorRecord>,
}

impl ErrorMap {
    /// The last error of an action, if any.
    pub fn get(&self, action: &str) -> Option<&ErrorRecord> {
        self.entries.get(action)
    }

    /// Returns true if no action has an error recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over recorded errors.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ErrorRecord)> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v))
    }

    pub(crate) fn record(&mut self, action: &Arc<str>, record: ErrorRecord) {
        self.entries.insert(action.clone(), record);
    }

    pub(crate) fn clear(&mut self, action: &str) -> bool {
        self.entries.remove(action).is_some()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// One committed, immutable view of a store.
///
/// Cheap to clone: every part is behind an `Arc`.
pub struct Snapshot<S> {
    pub(crate) state: Arc<S>,
    pub(crate) derived: DerivedValues,
    pub(crate) loading: Arc<LoadingMap>,
    pub(crate) errors: Arc<ErrorMap>,
    pub(crate) version: u64,
    /// JSON view of the state, filled lazily by key selectors.
    pub(crate) fields: Arc<OnceLock<Option<serde_json::Value>>>,
}

impl<S> Snapshot<S> {
    pub(crate) fn new(
        state: Arc<S>,
        derived: DerivedValues,
        loading: Arc<LoadingMap>,
        errors: Arc<ErrorMap>,
        version: u64,
    ) -> Self {
        Self {
            state,
            derived,
            loading,
            errors,
            version,
            fields: Arc::new(OnceLock::new()),
        }
    }

    /// The committed state.
    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    /// Derived values computed from this state.
    pub fn derived(&self) -> &DerivedValues {
        &self.derived
    }

    /// A derived value by name.
    pub fn derived_value<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.derived.get(name)
    }

    /// The loading map.
    pub fn loading(&self) -> &LoadingMap {
        &self.loading
    }

    /// Returns true if the action (optionally a specific operation id) is loading.
    pub fn is_loading(&self, action: &str, operation_id: Option<&str>) -> bool {
        self.loading.is_loading(action, operation_id)
    }

    /// The error map.
    pub fn errors(&self) -> &ErrorMap {
        &self.errors
    }

    /// The last error of an action.
    pub fn error(&self, action: &str) -> Option<&ActionError> {
        self.errors.get(action).map(|r| &r.error)
    }

    /// Commit counter; increases by one with every commit.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl<S> Clone for Snapshot<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            derived: self.derived.clone(),
            loading: self.loading.clone(),
            errors: self.errors.clone(),
            version: self.version,
            fields: self.fields.clone(),
        }
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for Snapshot<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .field("state", &self.state)
            .field("loading", &self.loading)
            .field("errors", &self.errors.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn test_loading_map_tracks_operation_ids() {
        let mut loading = LoadingMap::default();
        assert!(!loading.is_loading("fetch", None));

        assert!(loading.start(&name("fetch"), &name("a")));
        assert!(loading.start(&name("fetch"), &name("b")));
        assert!(!loading.start(&name("fetch"), &name("a")));

        assert!(loading.is_loading("fetch", None));
        assert!(loading.is_loading("fetch", Some("a")));
        assert!(!loading.is_loading("fetch", Some("c")));
        assert_eq!(loading.operation_ids("fetch").collect::<Vec<_>>(), vec!["a", "b"]);

        assert!(loading.finish("fetch", "a"));
        assert!(loading.is_loading("fetch", None));
        assert!(loading.finish("fetch", "b"));
        assert!(!loading.is_loading("fetch", None));
        assert!(loading.is_empty());
        assert!(!loading.finish("fetch", "b"));
    }

    #[test]
    fn test_error_map_record_and_clear() {
        let mut errors = ErrorMap::default();
        let action = name("save");
        errors.record(
            &action,
            ErrorRecord {
                error: ActionError::failed("save", anyhow::anyhow!("disk full")),
                operation_id: name("default"),
                occurred_at: Utc::now(),
            },
        );
        assert!(errors.get("save").is_some());
        assert_eq!(errors.iter().count(), 1);
        assert!(errors.clear("save"));
        assert!(!errors.clear("save"));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_snapshot_accessors() {
        let snapshot = Snapshot::new(
            Arc::new(5u32),
            DerivedValues::default(),
            Arc::new(LoadingMap::default()),
            Arc::new(ErrorMap::default()),
            3,
        );
        assert_eq!(**snapshot.state(), 5);
        assert_eq!(snapshot.version(), 3);
        assert!(!snapshot.is_loading("anything", None));
        assert!(snapshot.error("anything").is_none());

        let copy = snapshot.clone();
        assert!(Arc::ptr_eq(copy.state(), snapshot.state()));
    }
}
