use sockmux_core::Packet;
use std::sync::Arc;
use thiserror::Error;

/// Per-request failures. These are the only values a `ResponseHandler` ever
/// sees on the failure path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("not connected")]
    NotConnected,
    #[error("no response within {secs}s")]
    Timeout { secs: u64 },
}

/// Receives the outcome of one exchange, or of a notification fan-out (where
/// `request_body` is `None`).
pub trait ResponseHandler: Send + Sync {
    fn on_success(&self, command: i32, request_body: Option<&[u8]>, packet: &Packet);

    fn on_failure(&self, command: i32, error: &RequestError);
}

/// What `cancel` and `unsubscribe` accept: a tag, matched by equality, or a
/// handler, matched by `Arc` pointer identity.
#[derive(Clone)]
pub enum IdentityKey {
    Tag(String),
    Handler(Arc<dyn ResponseHandler>),
}

impl IdentityKey {
    pub fn matches_tag(&self, tag: Option<&str>) -> bool {
        match self {
            IdentityKey::Tag(key) => tag == Some(key.as_str()),
            IdentityKey::Handler(_) => false,
        }
    }

    pub fn matches_handler(&self, handler: &Arc<dyn ResponseHandler>) -> bool {
        match self {
            IdentityKey::Tag(_) => false,
            IdentityKey::Handler(key) => Arc::ptr_eq(key, handler),
        }
    }
}

impl From<&str> for IdentityKey {
    fn from(tag: &str) -> Self {
        IdentityKey::Tag(tag.to_string())
    }
}

impl From<String> for IdentityKey {
    fn from(tag: String) -> Self {
        IdentityKey::Tag(tag)
    }
}

impl From<Arc<dyn ResponseHandler>> for IdentityKey {
    fn from(handler: Arc<dyn ResponseHandler>) -> Self {
        IdentityKey::Handler(handler)
    }
}
