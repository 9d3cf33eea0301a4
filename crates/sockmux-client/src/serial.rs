use crate::context::RequestContext;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Declares that requests for any of `related_commands`, grouped under
/// `identity`, run at most one at a time; later submissions wait in FIFO
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSignal {
    identity: String,
    primary_command: i32,
    related_commands: Vec<i32>,
}

impl SerialSignal {
    pub fn new(
        identity: impl Into<String>,
        primary_command: i32,
        related_commands: Vec<i32>,
    ) -> Self {
        Self {
            identity: identity.into(),
            primary_command,
            related_commands,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn primary_command(&self) -> i32 {
        self.primary_command
    }

    pub fn related_commands(&self) -> &[i32] {
        &self.related_commands
    }
}

#[derive(Debug)]
pub(crate) enum Acquire {
    /// No signal covers this command.
    Unguarded,
    /// The identity was idle; the caller may send now.
    Acquired,
    /// Another related request is in flight; the context was parked.
    Queued,
}

#[derive(Default)]
struct GateState {
    in_flight: bool,
    waiting: VecDeque<Arc<RequestContext>>,
}

/// Per-identity at-most-one-in-flight bookkeeping. Not internally locked;
/// the request queue mutates it under its own state lock.
pub(crate) struct SerialGate {
    signals: Vec<SerialSignal>,
    states: HashMap<String, GateState>,
}

impl SerialGate {
    pub(crate) fn new() -> Self {
        Self {
            signals: Vec::new(),
            states: HashMap::new(),
        }
    }

    pub(crate) fn add_signal(&mut self, signal: SerialSignal) {
        debug!(
            event = "serial_signal_added",
            identity = signal.identity(),
            commands = ?signal.related_commands()
        );
        self.signals.push(signal);
    }

    fn identity_for(&self, command: i32) -> Option<&str> {
        self.signals
            .iter()
            .find(|signal| signal.related_commands().contains(&command))
            .map(SerialSignal::identity)
    }

    pub(crate) fn try_acquire(&mut self, context: &Arc<RequestContext>) -> Acquire {
        let Some(identity) = self.identity_for(context.command()).map(str::to_string) else {
            return Acquire::Unguarded;
        };
        let state = self.states.entry(identity.clone()).or_default();
        if state.in_flight {
            state.waiting.push_back(context.clone());
            debug!(
                event = "serial_gate_queued",
                identity = identity.as_str(),
                command = context.command(),
                waiting = state.waiting.len()
            );
            Acquire::Queued
        } else {
            state.in_flight = true;
            Acquire::Acquired
        }
    }

    /// Called on every terminal transition of an in-flight context for a
    /// guarded command. Returns the next waiting context, keeping the gate
    /// held for it; the gate opens only when the wait list drains.
    pub(crate) fn on_complete(&mut self, command: i32) -> Option<Arc<RequestContext>> {
        let identity = self.identity_for(command)?.to_string();
        let state = self.states.get_mut(&identity)?;
        match state.waiting.pop_front() {
            Some(next) => {
                debug!(
                    event = "serial_gate_released",
                    identity = identity.as_str(),
                    next_command = next.command()
                );
                Some(next)
            }
            None => {
                state.in_flight = false;
                None
            }
        }
    }

    /// Drops parked contexts matching the predicate (cancellation, timeout of
    /// a never-sent context). Does not touch the in-flight slot.
    pub(crate) fn remove_waiting(
        &mut self,
        mut predicate: impl FnMut(&Arc<RequestContext>) -> bool,
    ) -> Vec<Arc<RequestContext>> {
        let mut removed = Vec::new();
        for state in self.states.values_mut() {
            let mut kept = VecDeque::with_capacity(state.waiting.len());
            for context in state.waiting.drain(..) {
                if predicate(&context) {
                    removed.push(context);
                } else {
                    kept.push_back(context);
                }
            }
            state.waiting = kept;
        }
        removed
    }
}
