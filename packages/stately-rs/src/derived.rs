//! Memoized derived state.
//!
//! A derived value is declared as a dependency extractor plus a compute
//! function. At every commit the engine extracts the dependencies again and
//! compares them with the previous ones; compute runs only when they
//! differ. Unchanged values keep the same `Arc`, so observers comparing by
//! identity see no change.
//!
//! ```ignore
//! Store::builder(Todos::default)
//!     .derived(DerivedDescriptor::new(
//!         "open_count",
//!         |state: &Todos, _props: &()| state.items.clone(),
//!         |items: &Vec<Todo>| items.iter().filter(|t| !t.done).count(),
//!     ))
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use crate::core::extract_panic_message;

/// Type-erased derived value.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Derived values of one snapshot, by name.
///
/// Cloning shares the map.
#[derive(Clone, Default)]
pub struct DerivedValues {
    values: Arc<HashMap<Arc<str>, ErasedValue>>,
}

impl DerivedValues {
    /// A derived value by name, if it exists and has type `T`.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.values.get(name)?.clone().downcast::<T>().ok()
    }

    pub(crate) fn get_erased(&self, name: &str) -> Option<&ErasedValue> {
        self.values.get(name)
    }

    /// Names of all available derived values.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_ref())
    }

    /// Number of derived values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no derived values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for DerivedValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// One registered derived value, erased over its dependency and value types.
pub(crate) trait DerivedSlot<S, P>: Send {
    fn name(&self) -> &Arc<str>;

    /// Re-extract dependencies and recompute if they changed.
    ///
    /// Returns the new value when it was recomputed.
    fn refresh(&mut self, state: &S, props: &P) -> Option<ErasedValue>;
}

struct Memo<S, P, D, T> {
    name: Arc<str>,
    deps: Box<dyn Fn(&S, &P) -> D + Send + Sync>,
    compute: Box<dyn Fn(&D) -> T + Send + Sync>,
    last_deps: Option<D>,
}

impl<S, P, D, T> DerivedSlot<S, P> for Memo<S, P, D, T>
where
    D: PartialEq + Send + 'static,
    T: Send + Sync + 'static,
{
    fn name(&self) -> &Arc<str> {
        &self.name
    }

    fn refresh(&mut self, state: &S, props: &P) -> Option<ErasedValue> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let deps = (self.deps)(state, props);
            if self.last_deps.as_ref() == Some(&deps) {
                return None;
            }
            let value = (self.compute)(&deps);
            Some((deps, value))
        }));

        match outcome {
            Ok(Some((deps, value))) => {
                trace!(derived = %self.name, "recomputed");
                self.last_deps = Some(deps);
                Some(Arc::new(value) as ErasedValue)
            }
            Ok(None) => None,
            Err(panic_info) => {
                // Keep the last good value; the next commit retries.
                error!(
                    derived = %self.name,
                    panic = %extract_panic_message(&panic_info),
                    "derived computation panicked"
                );
                None
            }
        }
    }
}

/// Declaration of a derived value, as passed to the store builder.
pub struct DerivedDescriptor<S, P> {
    pub(crate) slot: Box<dyn DerivedSlot<S, P>>,
}

impl<S: 'static, P: 'static> DerivedDescriptor<S, P> {
    /// Declare a derived value from a dependency extractor and a compute function.
    pub fn new<D, T>(
        name: impl Into<String>,
        deps: impl Fn(&S, &P) -> D + Send + Sync + 'static,
        compute: impl Fn(&D) -> T + Send + Sync + 'static,
    ) -> Self
    where
        D: PartialEq + Send + 'static,
        T: Send + Sync + 'static,
    {
        let name: String = name.into();
        Self {
            slot: Box::new(Memo {
                name: Arc::from(name),
                deps: Box::new(deps),
                compute: Box::new(compute),
                last_deps: None,
            }),
        }
    }

    /// The declared name.
    pub fn name(&self) -> &str {
        self.slot.name()
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Keeps derived values in step with committed state.
///
/// Owned by the dispatch loop; refreshed eagerly on every commit.
pub(crate) struct DerivedEngine<S, P> {
    slots: Vec<Box<dyn DerivedSlot<S, P>>>,
    current: DerivedValues,
}

impl<S, P> DerivedEngine<S, P> {
    /// Build the engine and compute every value once.
    pub fn new(descriptors: Vec<DerivedDescriptor<S, P>>, state: &S, props: &P) -> Self {
        let mut engine = Self {
            slots: descriptors.into_iter().map(|d| d.slot).collect(),
            current: DerivedValues::default(),
        };
        engine.refresh(state, props);
        engine
    }

    /// Recompute values whose dependencies changed.
    ///
    /// Returns the (possibly unchanged) set of values. When nothing changed
    /// the previous map is shared as is.
    pub fn refresh(&mut self, state: &S, props: &P) -> DerivedValues {
        let mut updates: Vec<(Arc<str>, ErasedValue)> = Vec::new();
        for slot in &mut self.slots {
            if let Some(value) = slot.refresh(state, props) {
                updates.push((slot.name().clone(), value));
            }
        }

        if !updates.is_empty() {
            let mut values = (*self.current.values).clone();
            values.extend(updates);
            self.current = DerivedValues {
                values: Arc::new(values),
            };
        }
        self.current.clone()
    }

    /// The values as of the last refresh.
    pub fn values(&self) -> DerivedValues {
        self.current.clone()
    }
}
