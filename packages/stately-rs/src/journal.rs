//! Transition journal for optimistic rollback.
//!
//! While an optimistic update is outstanding, every committed transition is
//! recorded with the state it started from and a closure that re-applies it.
//! Rolling back one invocation rebuilds the state from just before its
//! optimistic effect and replays everything committed since, minus that
//! effect:
//!
//! ```text
//! s0 ─[opt like]─► s1 ─[inc]─► s2 ─[opt like #2]─► s3
//!
//! like fails:
//! s0 ─[inc]─► s1' ─[opt like #2]─► s2'
//! ```
//!
//! Other invocations' work survives the rollback, and a rollback that
//! already happened is never undone by a later one.
//!
//! Entries older than the oldest outstanding optimistic update can never be
//! replayed again and are trimmed after each settlement. With no optimistic
//! update outstanding the journal is empty and records nothing.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use tracing::{trace, warn};

use crate::core::State;
use crate::effect::apply_effect;
use crate::error::EffectPhase;

/// Re-applies one committed effect to a draft.
pub(crate) type Replay<S> = Arc<dyn Fn(&mut S) -> Result<()> + Send + Sync>;

struct JournalEntry<S> {
    seq: u64,
    action: Arc<str>,
    phase: EffectPhase,
    /// State the transition started from.
    before: Arc<S>,
    replay: Replay<S>,
}

/// Committed transitions since the oldest outstanding optimistic update.
pub(crate) struct Journal<S> {
    entries: VecDeque<JournalEntry<S>>,
    next_seq: u64,
}

impl<S: State> Journal<S> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Returns true while some optimistic update may still be rolled back.
    pub fn is_active(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Number of journaled transitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Journal an optimistic effect. Returns the handle to revert it with.
    pub fn open(&mut self, action: &Arc<str>, before: &Arc<S>, replay: Replay<S>) -> u64 {
        self.push(action, EffectPhase::Optimistic, before, replay)
    }

    /// Journal any other committed effect, if an optimistic update is outstanding.
    ///
    /// `replay` is only called when the transition is actually recorded.
    pub fn record(
        &mut self,
        action: &Arc<str>,
        phase: EffectPhase,
        before: &Arc<S>,
        replay: impl FnOnce() -> Replay<S>,
    ) {
        if self.is_active() {
            self.push(action, phase, before, replay());
        }
    }

    fn push(&mut self, action: &Arc<str>, phase: EffectPhase, before: &Arc<S>, replay: Replay<S>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(JournalEntry {
            seq,
            action: action.clone(),
            phase,
            before: before.clone(),
            replay,
        });
        seq
    }

    /// Undo the optimistic effect `seq` and replay every later transition.
    ///
    /// Returns the rebuilt state, or `None` if `seq` is not journaled. A
    /// transition that fails on replay is skipped and logged.
    pub fn revert(&mut self, seq: u64) -> Option<Arc<S>> {
        let pos = self.entries.iter().position(|entry| entry.seq == seq)?;
        let removed = self.entries.remove(pos)?;

        let mut state = removed.before;
        for entry in self.entries.iter_mut().skip(pos) {
            entry.before = state.clone();
            let replay = entry.replay.clone();
            match apply_effect(&entry.action, entry.phase, &*state, |draft| replay(draft)) {
                Ok(next) => state = Arc::new(next),
                Err(e) => warn!(
                    action = %entry.action,
                    phase = %entry.phase,
                    error = %e,
                    "transition could not be replayed after rollback, skipped"
                ),
            }
        }
        trace!(action = %removed.action, replayed = self.entries.len() - pos, "optimistic update reverted");
        Some(state)
    }

    /// Drop entries older than `oldest`, the oldest outstanding optimistic
    /// update. With `None` nothing is outstanding and everything goes.
    pub fn trim(&mut self, oldest: Option<u64>) {
        match oldest {
            None => self.entries.clear(),
            Some(oldest) => {
                while self.entries.front().is_some_and(|entry| entry.seq < oldest) {
                    self.entries.pop_front();
                }
            }
        }
    }
}
