//! Conflict resolution for overlapping calls to the same async action.
//!
//! Every async invocation occupies a *slot*: the action name plus an
//! operation id. Non-parallel actions always use [`DEFAULT_OPERATION_ID`],
//! so all their calls share one slot. `Parallel` actions derive the id from
//! the call arguments, so calls with different ids never meet.
//!
//! | Policy     | Slot idle | Slot busy                                   |
//! |------------|-----------|---------------------------------------------|
//! | `KeepAll`  | run       | queue; run in call order                    |
//! | `KeepLast` | run       | replace the queued call (only newest waits) |
//! | `Ignore`   | run       | drop silently                               |
//! | `Reject`   | run       | fail with a conflict error                  |
//! | `Parallel` | run       | same id: queue (`KeepAll`)                  |
//!
//! [`DEFAULT_OPERATION_ID`]: crate::DEFAULT_OPERATION_ID

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Rule governing overlapping calls to the same action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Every call runs; later calls wait for earlier ones.
    #[default]
    KeepAll,
    /// Only the most recent waiting call survives.
    KeepLast,
    /// Calls made while one is active are dropped.
    Ignore,
    /// Calls made while one is active fail with a conflict error.
    Reject,
    /// Calls are scoped by operation id; same-id calls behave like `KeepAll`.
    Parallel,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::KeepAll => write!(f, "keep_all"),
            ConflictPolicy::KeepLast => write!(f, "keep_last"),
            ConflictPolicy::Ignore => write!(f, "ignore"),
            ConflictPolicy::Reject => write!(f, "reject"),
            ConflictPolicy::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_all" => Ok(ConflictPolicy::KeepAll),
            "keep_last" => Ok(ConflictPolicy::KeepLast),
            "ignore" => Ok(ConflictPolicy::Ignore),
            "reject" => Ok(ConflictPolicy::Reject),
            "parallel" => Ok(ConflictPolicy::Parallel),
            other => Err(anyhow::anyhow!("unknown conflict policy `{}`", other)),
        }
    }
}

/// What happens to a new call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Start immediately.
    RunNow,
    /// Wait behind the active invocation and any earlier waiters.
    Queue,
    /// Wait, displacing whatever was waiting.
    ReplaceQueued,
    /// Discard without a transition.
    Drop,
    /// Fail with a conflict error.
    Reject,
}

impl ConflictPolicy {
    /// Decide what to do with a call given whether its slot is busy.
    pub fn decide(self, slot_busy: bool) -> Decision {
        if !slot_busy {
            return Decision::RunNow;
        }
        match self {
            ConflictPolicy::KeepAll | ConflictPolicy::Parallel => Decision::Queue,
            ConflictPolicy::KeepLast => Decision::ReplaceQueued,
            ConflictPolicy::Ignore => Decision::Drop,
            ConflictPolicy::Reject => Decision::Reject,
        }
    }
}

/// Concurrency scope of an invocation: action name plus operation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    /// Action name.
    pub action: Arc<str>,
    /// Operation id (the default id for non-parallel actions).
    pub operation_id: Arc<str>,
}

impl SlotKey {
    /// Create a slot key.
    pub fn new(action: Arc<str>, operation_id: Arc<str>) -> Self {
        Self {
            action,
            operation_id,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.action, self.operation_id)
    }
}

/// Result of admitting a call to the resolver.
///
/// Calls handed back (`RunNow`, `Superseded`, `Dropped`, `Rejected`) are
/// owned by the caller again; queued calls stay inside the resolver.
#[derive(Debug)]
pub enum Admission<T> {
    /// The slot is now busy with this call; start it.
    RunNow(T),
    /// The call is waiting.
    Queued,
    /// The call is waiting and displaced these earlier waiters.
    Superseded(Vec<T>),
    /// The call was discarded.
    Dropped(T),
    /// The call must fail with a conflict error.
    Rejected(T),
}

#[derive(Debug)]
struct Slot<T> {
    busy: bool,
    waiting: VecDeque<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            busy: false,
            waiting: VecDeque::new(),
        }
    }
}

/// Tracks busy slots and their waiting calls.
///
/// The resolver owns waiting calls; the dispatcher owns running ones. A slot
/// is busy from `admit` returning `RunNow` until `release` finds nothing
/// left to run.
#[derive(Debug)]
pub struct ConflictResolver<T> {
    slots: HashMap<SlotKey, Slot<T>>,
}

impl<T> Default for ConflictResolver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConflictResolver<T> {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Admit a new call under `policy`.
    pub fn admit(&mut self, key: SlotKey, policy: ConflictPolicy, call: T) -> Admission<T> {
        let slot = self.slots.entry(key).or_default();
        match policy.decide(slot.busy) {
            Decision::RunNow => {
                slot.busy = true;
                Admission::RunNow(call)
            }
            Decision::Queue => {
                slot.waiting.push_back(call);
                Admission::Queued
            }
            Decision::ReplaceQueued => {
                let displaced: Vec<T> = slot.waiting.drain(..).collect();
                slot.waiting.push_back(call);
                if displaced.is_empty() {
                    Admission::Queued
                } else {
                    Admission::Superseded(displaced)
                }
            }
            Decision::Drop => Admission::Dropped(call),
            Decision::Reject => Admission::Rejected(call),
        }
    }

    /// Mark the active invocation of `key` as settled.
    ///
    /// Returns the next waiting call, which becomes active, or `None` if the
    /// slot is now idle.
    pub fn release(&mut self, key: &SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key)?;
        match slot.waiting.pop_front() {
            Some(next) => Some(next),
            None => {
                self.slots.remove(key);
                None
            }
        }
    }

    /// Returns true if the slot has an active invocation.
    pub fn is_busy(&self, key: &SlotKey) -> bool {
        self.slots.get(key).map(|s| s.busy).unwrap_or(false)
    }

    /// Number of calls waiting in a slot.
    pub fn waiting(&self, key: &SlotKey) -> usize {
        self.slots.get(key).map(|s| s.waiting.len()).unwrap_or(0)
    }

    /// Returns true if no slot is busy.
    pub fn is_idle(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove every waiting call (used on dispose).
    pub fn drain(&mut self) -> Vec<T> {
        self.slots
            .drain()
            .flat_map(|(_, slot)| slot.waiting.into_iter())
            .collect()
    }
}
