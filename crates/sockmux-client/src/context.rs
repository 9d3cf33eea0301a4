use crate::handler::ResponseHandler;
use sockmux_core::Packet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Caller-supplied correlation key for cancellation and subscriptions.
pub type Tag = String;

/// This context is an outbound request expecting a response (as opposed to a
/// pure subscription registration).
pub const FLAG_REQUEST: u32 = 1 << 0;
/// Fail fast with `RequestError::NotConnected` if the connection is down at
/// submission time.
pub const FLAG_CHECK_CONNECT_STATUS: u32 = 1 << 1;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

/// One outstanding exchange. A context is in exactly one of pending,
/// resolved, timed-out, or cancelled; the queue guarantees the first terminal
/// transition wins and the timer is torn down on the other paths.
pub struct RequestContext {
    id: u64,
    tag: Option<Tag>,
    command: i32,
    request_body: Vec<u8>,
    flags: u32,
    read_timeout: Duration,
    request_packet: Packet,
    handler: Arc<dyn ResponseHandler>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
    in_flight: AtomicBool,
    stale_served: AtomicBool,
}

impl RequestContext {
    pub fn new(
        tag: Option<Tag>,
        command: i32,
        request_body: Vec<u8>,
        flags: u32,
        read_timeout: Duration,
        request_packet: Packet,
        handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst),
            tag,
            command,
            request_body,
            flags,
            read_timeout,
            request_packet,
            handler,
            timeout_task: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            stale_served: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn command(&self) -> i32 {
        self.command
    }

    pub fn request_body(&self) -> &[u8] {
        &self.request_body
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn request_packet(&self) -> &Packet {
        &self.request_packet
    }

    pub fn handler(&self) -> &Arc<dyn ResponseHandler> {
        &self.handler
    }

    pub(crate) fn mark_in_flight(&self) {
        self.in_flight.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Marks that a stale cached response already resolved this context; the
    /// eventual network response must not invoke the handler again.
    pub(crate) fn mark_stale_served(&self) {
        self.stale_served.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stale_served(&self) -> bool {
        self.stale_served.load(Ordering::SeqCst)
    }

    pub(crate) fn set_timeout_task(&self, task: JoinHandle<()>) {
        let mut guard = self.timeout_task.lock().expect("timeout task lock");
        *guard = Some(task);
    }

    /// Idempotent; called on every terminal transition except the timeout
    /// itself.
    pub(crate) fn cancel_timeout_timer(&self) {
        let task = {
            let mut guard = self.timeout_task.lock().expect("timeout task lock");
            guard.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("command", &self.command)
            .field("flags", &self.flags)
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}
