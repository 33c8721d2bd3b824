//! Table-driven finite-state machine.
//!
//! A [`Fsm`] holds a current state and a transition table. Every state owns
//! the set of states it may move to, plus optional entry and exit effects
//! which run while a transition is applied. The machine is cyclic: any state
//! reachable from the table may be visited again, there is no terminal state.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::error::{Error, ErrorKind, Result};

/// An effect invoked while a transition is applied.
///
/// The arguments are the state being left and the state being entered. A
/// returned message marks the effect as failed.
pub type Effect<S> = Box<dyn Fn(S, S) -> core::result::Result<(), String> + Send + Sync>;

struct StateEntry<S> {
    edges: Vec<S>,
    on_enter: Option<Effect<S>>,
    on_exit: Option<Effect<S>>,
}

impl<S> Default for StateEntry<S> {
    fn default() -> Self {
        Self {
            edges: Vec::new(),
            on_enter: None,
            on_exit: None,
        }
    }
}

/// A builder for a [`Fsm`].
pub struct FsmBuilder<S> {
    initial: S,
    entries: HashMap<S, StateEntry<S>>,
}

impl<S> FsmBuilder<S>
where
    S: Copy + Eq + Hash + Debug,
{
    /// Declares the transitions admitted out of a state.
    ///
    /// Calling this more than once for the same state extends its edges.
    #[must_use]
    pub fn edges(mut self, from: S, to: &[S]) -> Self {
        let entry = self.entries.entry(from).or_default();
        for state in to {
            if !entry.edges.contains(state) {
                entry.edges.push(*state);
            }
        }
        self
    }

    /// Sets the effect invoked after a transition into a state is committed.
    #[must_use]
    pub fn on_enter<F>(mut self, state: S, effect: F) -> Self
    where
        F: Fn(S, S) -> core::result::Result<(), String> + Send + Sync + 'static,
    {
        self.entries.entry(state).or_default().on_enter = Some(Box::new(effect));
        self
    }

    /// Sets the effect invoked before a transition out of a state is committed.
    #[must_use]
    pub fn on_exit<F>(mut self, state: S, effect: F) -> Self
    where
        F: Fn(S, S) -> core::result::Result<(), String> + Send + Sync + 'static,
    {
        self.entries.entry(state).or_default().on_exit = Some(Box::new(effect));
        self
    }

    /// Builds the [`Fsm`].
    #[must_use]
    pub fn build(self) -> Fsm<S> {
        Fsm {
            current: self.initial,
            entries: self.entries,
        }
    }
}

/// A cyclic finite-state machine.
pub struct Fsm<S> {
    current: S,
    entries: HashMap<S, StateEntry<S>>,
}

impl<S: Debug> Debug for Fsm<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fsm")
            .field("current", &self.current)
            .field("states", &self.entries.len())
            .finish()
    }
}

impl<S> Fsm<S>
where
    S: Copy + Eq + Hash + Debug,
{
    /// Creates a [`FsmBuilder`] with the given initial state.
    #[must_use]
    pub fn builder(initial: S) -> FsmBuilder<S> {
        FsmBuilder {
            initial,
            entries: HashMap::new(),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn current(&self) -> S {
        self.current
    }

    /// Checks whether the machine is in the given state.
    #[must_use]
    pub fn is(&self, state: S) -> bool {
        self.current == state
    }

    /// Checks whether a transition towards the given state is admissible.
    #[must_use]
    pub fn can_transition(&self, to: S) -> bool {
        to != self.current
            && self
                .entries
                .get(&self.current)
                .is_some_and(|entry| entry.edges.contains(&to))
    }

    /// Applies a transition towards the given state.
    ///
    /// The exit effect of the current state runs first: when it fails, the
    /// machine stays in its current state. The entry effect of the new state
    /// runs after the transition is committed, so its failure is surfaced
    /// while the machine is already in the new state.
    pub fn transition(&mut self, to: S) -> Result<()> {
        let from = self.current;

        if to == from {
            return Err(Error::new(
                ErrorKind::AlreadyInState,
                format!("the machine is already in `{from:?}`"),
            ));
        }

        if !self.can_transition(to) {
            return Err(Error::new(
                ErrorKind::InvalidTransition,
                format!("no transition from `{from:?}` to `{to:?}`"),
            ));
        }

        if let Some(effect) = self.entries.get(&from).and_then(|entry| entry.on_exit.as_ref()) {
            if let Err(message) = effect(from, to) {
                return Err(Error::new(
                    ErrorKind::Callback,
                    format!("exit effect of `{from:?}` failed: {message}"),
                ));
            }
        }

        self.current = to;

        if let Some(effect) = self.entries.get(&to).and_then(|entry| entry.on_enter.as_ref()) {
            if let Err(message) = effect(from, to) {
                return Err(Error::new(
                    ErrorKind::Callback,
                    format!("entry effect of `{to:?}` failed: {message}"),
                ));
            }
        }

        Ok(())
    }
}
