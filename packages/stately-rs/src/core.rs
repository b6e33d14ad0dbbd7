//! Core types shared by every part of the store.
//!
//! # Overview
//!
//! A store holds one [`State`] value and changes it only through actions.
//! Action arguments and results cross the dispatch loop type-erased, as
//! [`ActionArgs`] and [`ActionValue`], and are downcast again at the edges
//! where the concrete type is known.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

/// Operation id used for every invocation of a non-parallel action.
pub const DEFAULT_OPERATION_ID: &str = "default";

/// A value that can live inside a store.
///
/// **Note**: This trait is automatically implemented for any type that is
/// `Clone + Send + Sync + 'static`. You don't need to implement it manually.
///
/// Effects receive a private clone of the current state to modify; the clone
/// is committed as the next snapshot only if the effect succeeds.
pub trait State: Clone + Send + Sync + 'static {}

// Blanket implementation for any type that meets the requirements
impl<T: Clone + Send + Sync + 'static> State for T {}

/// External inputs of a store, replaced as a whole by `Store::set_props`.
///
/// Automatically implemented for any `Send + Sync + 'static` type.
pub trait Props: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Props for T {}

/// Identifier of a store instance, carried in every log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(Uuid);

impl StoreId {
    /// Create a new random store ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one invocation of an async action.
///
/// Monotonic per process, so ordering by id is ordering by admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationId(u64);

impl InvocationId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inv-{}", self.0)
    }
}

// =============================================================================
// Type-erased payloads
// =============================================================================

/// Type-erased action arguments.
///
/// Cloning shares the underlying value.
#[derive(Clone)]
pub struct ActionArgs {
    type_id: TypeId,
    type_name: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
}

impl ActionArgs {
    /// Wrap a concrete argument value.
    pub fn new<A: Any + Send + Sync>(args: A) -> Self {
        Self {
            type_id: TypeId::of::<A>(),
            type_name: std::any::type_name::<A>(),
            payload: Arc::new(args),
        }
    }

    /// Downcast to the concrete argument type.
    pub fn downcast_ref<A: Any>(&self) -> Option<&A> {
        self.payload.downcast_ref()
    }

    /// The `TypeId` of the wrapped value.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for ActionArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionArgs")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Type-erased value produced by an action.
///
/// Async actions produce their operation's result; sync actions produce the
/// newly committed state as an `Arc<S>`.
#[derive(Clone)]
pub struct ActionValue {
    type_name: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
}

impl ActionValue {
    /// Wrap a concrete value.
    pub fn new<R: Any + Send + Sync>(value: R) -> Self {
        Self {
            type_name: std::any::type_name::<R>(),
            payload: Arc::new(value),
        }
    }

    /// Downcast to the concrete value type.
    pub fn downcast_ref<R: Any>(&self) -> Option<&R> {
        self.payload.downcast_ref()
    }

    /// The type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for ActionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionValue")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn extract_panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_args_downcast() {
        let args = ActionArgs::new(42u32);
        assert_eq!(args.downcast_ref::<u32>(), Some(&42));
        assert!(args.downcast_ref::<i64>().is_none());
        assert_eq!(args.type_id(), TypeId::of::<u32>());
        assert_eq!(args.type_name(), "u32");
    }

    #[test]
    fn test_action_value_clone_shares_payload() {
        let value = ActionValue::new(String::from("done"));
        let copy = value.clone();
        assert!(std::ptr::eq(
            value.downcast_ref::<String>().unwrap(),
            copy.downcast_ref::<String>().unwrap()
        ));
    }

    #[test]
    fn test_invocation_ids_are_monotonic() {
        let a = InvocationId::next();
        let b = InvocationId::next();
        assert!(b > a);
    }

    #[test]
    fn test_extract_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(extract_panic_message(&payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(extract_panic_message(&payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(extract_panic_message(&payload), "unknown panic");
    }
}
