use crate::context::RequestContext;
use crate::handler::RequestError;
use sockmux_core::Packet;
use std::sync::{Arc, RwLock};

/// Outcome of a pre-send hook.
#[derive(Debug, Clone)]
pub enum SendIntercept {
    /// Let the rest of the chain run, then write to the connection.
    Continue,
    /// Resolve the context with this packet; nothing reaches the connection.
    Serve(Packet),
    /// Resolve the context with this packet now, but still send the request
    /// so the response can refresh whatever produced the stale value.
    ServeStale(Packet),
    /// Resolve the context as failed; nothing reaches the connection.
    Reject(RequestError),
}

/// Outcome of a post-receive hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveIntercept {
    Continue,
    Stop,
}

/// Cross-cutting hooks around the request/response lifecycle. Both hooks
/// default to pass-through so an interceptor can implement only one side.
pub trait Interceptor: Send + Sync {
    fn pre_send(&self, _context: &RequestContext) -> SendIntercept {
        SendIntercept::Continue
    }

    fn post_receive(&self, _command: i32, _packet: &Packet) -> ReceiveIntercept {
        ReceiveIntercept::Continue
    }
}

/// Insertion-ordered interceptor list. The first non-`Continue` result
/// short-circuits the remainder of the chain for that event.
pub struct InterceptorChain {
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self {
            interceptors: RwLock::new(Vec::new()),
        }
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors
            .write()
            .expect("interceptor lock")
            .push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.read().expect("interceptor lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn run_pre_send(&self, context: &RequestContext) -> SendIntercept {
        let interceptors = self
            .interceptors
            .read()
            .expect("interceptor lock")
            .clone();
        for interceptor in interceptors {
            match interceptor.pre_send(context) {
                SendIntercept::Continue => continue,
                other => return other,
            }
        }
        SendIntercept::Continue
    }

    pub fn run_post_receive(&self, command: i32, packet: &Packet) {
        let interceptors = self
            .interceptors
            .read()
            .expect("interceptor lock")
            .clone();
        for interceptor in interceptors {
            if interceptor.post_receive(command, packet) == ReceiveIntercept::Stop {
                break;
            }
        }
    }
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::new()
    }
}
