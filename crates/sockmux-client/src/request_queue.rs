use crate::cache::CacheManager;
use crate::context::{RequestContext, FLAG_CHECK_CONNECT_STATUS};
use crate::handler::RequestError;
use crate::interceptor::{InterceptorChain, SendIntercept};
use crate::serial::{Acquire, SerialGate, SerialSignal};
use sockmux_core::{Connection, Packet};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Where unmatched inbound packets go. Injected at construction so the queue
/// never holds a back-reference to the router that owns it.
pub trait NotifySink: Send + Sync {
    fn route(&self, command: i32, packet: &Packet);
}

struct QueueState {
    pending: Vec<Arc<RequestContext>>,
    gate: SerialGate,
}

enum Outcome {
    Success {
        context: Arc<RequestContext>,
        packet: Packet,
    },
    Failure {
        context: Arc<RequestContext>,
        error: RequestError,
    },
}

/// The dispatch engine: owns pending contexts, schedules timeouts, applies
/// the serialization gate, runs the interceptor chain, writes packets, and
/// matches inbound packets back to their contexts.
///
/// All decide-to-send work happens under one state lock; handler callbacks
/// always run outside it.
pub struct RequestQueue {
    connection: Arc<dyn Connection>,
    chain: Arc<InterceptorChain>,
    cache: Arc<CacheManager>,
    notify: Arc<dyn NotifySink>,
    state: Mutex<QueueState>,
    // handed to timer tasks so an orphaned timer can not keep the queue alive
    weak_self: Weak<RequestQueue>,
}

impl RequestQueue {
    pub fn new(
        connection: Arc<dyn Connection>,
        chain: Arc<InterceptorChain>,
        cache: Arc<CacheManager>,
        notify: Arc<dyn NotifySink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            connection,
            chain,
            cache,
            notify,
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                gate: SerialGate::new(),
            }),
            weak_self: weak_self.clone(),
        })
    }

    pub fn interceptor_chain(&self) -> &Arc<InterceptorChain> {
        &self.chain
    }

    pub fn add_serial_signal(&self, signal: SerialSignal) {
        let mut state = self.state.lock().expect("queue lock");
        state.gate.add_signal(signal);
    }

    /// Registers a context as pending and tries to send it. Connection-status
    /// failures resolve immediately and never start a timer; gated contexts
    /// park in their identity's FIFO with the timer already running.
    pub fn add_request_context(&self, context: Arc<RequestContext>) {
        if context.has_flag(FLAG_CHECK_CONNECT_STATUS) && !self.connection.is_connected() {
            warn!(
                event = "request_rejected_not_connected",
                command = context.command(),
                context_id = context.id()
            );
            context
                .handler()
                .on_failure(context.command(), &RequestError::NotConnected);
            return;
        }

        let outcomes = {
            let mut state = self.state.lock().expect("queue lock");
            state.pending.push(context.clone());
            self.start_timeout_timer(&context);

            match state.gate.try_acquire(&context) {
                Acquire::Queued => Vec::new(),
                Acquire::Unguarded | Acquire::Acquired => {
                    self.dispatch_locked(&mut state, context)
                }
            }
        };
        run_outcomes(outcomes);
    }

    /// Cancels timers and drops contexts without invoking handlers.
    pub fn remove_request_contexts(&self, contexts: Vec<Arc<RequestContext>>) {
        let outcomes = {
            let mut state = self.state.lock().expect("queue lock");
            let mut outcomes = Vec::new();
            for context in contexts {
                let Some(removed) = remove_pending(&mut state, context.id()) else {
                    continue;
                };
                removed.cancel_timeout_timer();
                debug!(
                    event = "request_cancelled",
                    command = removed.command(),
                    context_id = removed.id()
                );
                if removed.is_in_flight() {
                    if let Some(next) = state.gate.on_complete(removed.command()) {
                        outcomes.extend(self.dispatch_locked(&mut state, next));
                    }
                } else {
                    state.gate.remove_waiting(|ctx| ctx.id() == removed.id());
                }
            }
            outcomes
        };
        run_outcomes(outcomes);
    }

    /// All pending contexts matching a predicate; used to locate contexts by
    /// tag or handler identity.
    pub fn get_request_contexts(
        &self,
        filter: impl Fn(&RequestContext) -> bool,
    ) -> Vec<Arc<RequestContext>> {
        let state = self.state.lock().expect("queue lock");
        state
            .pending
            .iter()
            .filter(|ctx| filter(ctx))
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().expect("queue lock").pending.len()
    }

    /// Entry point for every packet the connection delivers, in arrival
    /// order. A match resolves the oldest in-flight context for the command;
    /// anything else fans out as a notification.
    pub fn on_packet(&self, command: i32, packet: &Packet) {
        self.cache.on_receive_observed(command);

        let (matched, outcomes) = {
            let mut state = self.state.lock().expect("queue lock");
            let position = state
                .pending
                .iter()
                .position(|ctx| ctx.command() == command && ctx.is_in_flight());
            match position {
                Some(position) => {
                    let context = state.pending.remove(position);
                    context.cancel_timeout_timer();
                    // the cache must see this response before the gate hands
                    // the next related context to the pre-send pipeline
                    self.chain.run_post_receive(command, packet);
                    let mut outcomes = Vec::new();
                    if let Some(next) = state.gate.on_complete(command) {
                        outcomes.extend(self.dispatch_locked(&mut state, next));
                    }
                    (Some(context), outcomes)
                }
                None => (None, Vec::new()),
            }
        };

        match matched {
            Some(context) => {
                if context.stale_served() {
                    debug!(
                        event = "refresh_response_absorbed",
                        command,
                        context_id = context.id()
                    );
                } else {
                    debug!(
                        event = "response_matched",
                        command,
                        context_id = context.id()
                    );
                    context
                        .handler()
                        .on_success(command, Some(context.request_body()), packet);
                }
            }
            None => {
                debug!(event = "unmatched_packet", command);
                self.notify.route(command, packet);
            }
        }
        run_outcomes(outcomes);
    }

    fn start_timeout_timer(&self, context: &Arc<RequestContext>) {
        let weak_queue = self.weak_self.clone();
        let id = context.id();
        let command = context.command();
        let timeout = context.read_timeout();
        context.set_timeout_task(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(queue) = weak_queue.upgrade() {
                queue.on_timeout(id, command);
            }
        }));
    }

    fn on_timeout(&self, id: u64, command: i32) {
        let (timed_out, outcomes) = {
            let mut state = self.state.lock().expect("queue lock");
            let Some(context) = remove_pending(&mut state, id) else {
                // lost the race against a response or cancellation
                return;
            };
            let mut outcomes = Vec::new();
            if context.is_in_flight() {
                if let Some(next) = state.gate.on_complete(command) {
                    outcomes.extend(self.dispatch_locked(&mut state, next));
                }
            } else {
                state.gate.remove_waiting(|ctx| ctx.id() == id);
            }
            (context, outcomes)
        };

        warn!(
            event = "request_timeout",
            command,
            context_id = timed_out.id(),
            secs = timed_out.read_timeout().as_secs()
        );
        if !timed_out.stale_served() {
            timed_out.handler().on_failure(
                command,
                &RequestError::Timeout {
                    secs: timed_out.read_timeout().as_secs(),
                },
            );
        }
        run_outcomes(outcomes);
    }

    /// Runs the pre-send pipeline for a context and, when a resolution frees
    /// the serialization gate, keeps dispatching released contexts until one
    /// is actually in flight or the wait list drains.
    fn dispatch_locked(
        &self,
        state: &mut QueueState,
        context: Arc<RequestContext>,
    ) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        let mut current = Some(context);

        while let Some(context) = current.take() {
            match self.chain.run_pre_send(&context) {
                SendIntercept::Continue => {
                    if self.write_packet(state, &context, &mut outcomes, &mut current) {
                        break;
                    }
                }
                SendIntercept::Serve(packet) => {
                    remove_pending(state, context.id());
                    context.cancel_timeout_timer();
                    outcomes.push(Outcome::Success {
                        context: context.clone(),
                        packet,
                    });
                    current = state.gate.on_complete(context.command());
                }
                SendIntercept::ServeStale(packet) => {
                    context.mark_stale_served();
                    outcomes.push(Outcome::Success {
                        context: context.clone(),
                        packet,
                    });
                    if self.write_packet(state, &context, &mut outcomes, &mut current) {
                        break;
                    }
                }
                SendIntercept::Reject(error) => {
                    remove_pending(state, context.id());
                    context.cancel_timeout_timer();
                    outcomes.push(Outcome::Failure {
                        context: context.clone(),
                        error,
                    });
                    current = state.gate.on_complete(context.command());
                }
            }
        }
        outcomes
    }

    /// Writes a context's packet to the connection. Returns true when the
    /// context is in flight and the dispatch loop should stop.
    fn write_packet(
        &self,
        state: &mut QueueState,
        context: &Arc<RequestContext>,
        outcomes: &mut Vec<Outcome>,
        current: &mut Option<Arc<RequestContext>>,
    ) -> bool {
        self.cache.on_send_observed(context.command());
        match self.connection.send_packet(context.request_packet().clone()) {
            Ok(()) => {
                context.mark_in_flight();
                debug!(
                    event = "request_sent",
                    command = context.command(),
                    context_id = context.id()
                );
                true
            }
            Err(err) => {
                warn!(
                    event = "request_write_failed",
                    command = context.command(),
                    context_id = context.id(),
                    error = %err
                );
                remove_pending(state, context.id());
                context.cancel_timeout_timer();
                if !context.stale_served() {
                    outcomes.push(Outcome::Failure {
                        context: context.clone(),
                        error: RequestError::NotConnected,
                    });
                }
                *current = state.gate.on_complete(context.command());
                false
            }
        }
    }
}

fn remove_pending(state: &mut QueueState, id: u64) -> Option<Arc<RequestContext>> {
    let position = state.pending.iter().position(|ctx| ctx.id() == id)?;
    Some(state.pending.remove(position))
}

fn run_outcomes(outcomes: Vec<Outcome>) {
    for outcome in outcomes {
        match outcome {
            Outcome::Success { context, packet } => {
                context.handler().on_success(
                    context.command(),
                    Some(context.request_body()),
                    &packet,
                );
            }
            Outcome::Failure { context, error } => {
                context.handler().on_failure(context.command(), &error);
            }
        }
    }
}
