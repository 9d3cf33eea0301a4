use crate::handler::{IdentityKey, ResponseHandler};
use sockmux_core::Packet;
use std::sync::{Arc, RwLock};
use tracing::debug;

pub const FLAG_SUBSCRIBE_DEFAULT: u32 = 0;

struct Subscription {
    tag: Option<String>,
    command: i32,
    #[allow(dead_code)]
    flags: u32,
    handler: Arc<dyn ResponseHandler>,
}

/// One-to-many delivery of unsolicited inbound packets: every subscriber of a
/// command sees every routed packet for it. No buffering; with zero
/// subscribers the packet is dropped. Notifications have no failure path.
pub struct NotifyRouter {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl NotifyRouter {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(
        &self,
        tag: Option<String>,
        command: i32,
        flags: u32,
        handler: Arc<dyn ResponseHandler>,
    ) {
        let mut subscriptions = self.subscriptions.write().expect("subscription lock");
        subscriptions.push(Subscription {
            tag,
            command,
            flags,
            handler,
        });
        debug!(event = "subscribed", command, total = subscriptions.len());
    }

    /// Removes every subscription whose tag or handler matches the key.
    pub fn unsubscribe(&self, key: &IdentityKey) {
        let mut subscriptions = self.subscriptions.write().expect("subscription lock");
        let before = subscriptions.len();
        subscriptions.retain(|sub| {
            !(key.matches_tag(sub.tag.as_deref()) || key.matches_handler(&sub.handler))
        });
        let removed = before - subscriptions.len();
        if removed > 0 {
            debug!(event = "unsubscribed", removed);
        }
    }

    pub fn subscriber_count(&self, command: i32) -> usize {
        self.subscriptions
            .read()
            .expect("subscription lock")
            .iter()
            .filter(|sub| sub.command == command)
            .count()
    }

    /// Fans an unmatched inbound packet out to every subscriber of its
    /// command. Handlers run outside the table lock.
    pub fn route(&self, command: i32, packet: &Packet) {
        let handlers = {
            let subscriptions = self.subscriptions.read().expect("subscription lock");
            subscriptions
                .iter()
                .filter(|sub| sub.command == command)
                .map(|sub| sub.handler.clone())
                .collect::<Vec<_>>()
        };

        if handlers.is_empty() {
            debug!(event = "notification_dropped", command);
            return;
        }

        debug!(
            event = "notification_routed",
            command,
            subscribers = handlers.len()
        );
        for handler in handlers {
            handler.on_success(command, None, packet);
        }
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RequestError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recording {
        received: Mutex<Vec<(i32, Vec<u8>)>>,
        failures: AtomicUsize,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.received.lock().expect("lock").len()
        }
    }

    impl ResponseHandler for Recording {
        fn on_success(&self, command: i32, request_body: Option<&[u8]>, packet: &Packet) {
            assert!(request_body.is_none(), "notifications carry no request body");
            self.received
                .lock()
                .expect("lock")
                .push((command, packet.body().to_vec()));
        }

        fn on_failure(&self, _command: i32, _error: &RequestError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn routes_to_every_subscriber_of_the_command() {
        let router = NotifyRouter::new();
        let a = Recording::new();
        let b = Recording::new();
        let other = Recording::new();
        router.subscribe(None, 70, FLAG_SUBSCRIBE_DEFAULT, a.clone());
        router.subscribe(None, 70, FLAG_SUBSCRIBE_DEFAULT, b.clone());
        router.subscribe(None, 71, FLAG_SUBSCRIBE_DEFAULT, other.clone());

        router.route(70, &Packet::new(70, b"tick".to_vec()));

        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
        assert_eq!(other.count(), 0);
    }

    #[test]
    fn zero_subscribers_drops_the_packet() {
        let router = NotifyRouter::new();
        router.route(70, &Packet::new(70, Vec::new()));
        assert_eq!(router.subscriber_count(70), 0);
    }

    #[test]
    fn unsubscribe_by_tag_removes_all_matching() {
        let router = NotifyRouter::new();
        let handler = Recording::new();
        router.subscribe(
            Some("prices".to_string()),
            70,
            FLAG_SUBSCRIBE_DEFAULT,
            handler.clone(),
        );
        router.subscribe(
            Some("prices".to_string()),
            71,
            FLAG_SUBSCRIBE_DEFAULT,
            handler.clone(),
        );
        router.subscribe(
            Some("orders".to_string()),
            70,
            FLAG_SUBSCRIBE_DEFAULT,
            handler.clone(),
        );

        router.unsubscribe(&IdentityKey::from("prices"));

        assert_eq!(router.subscriber_count(70), 1);
        assert_eq!(router.subscriber_count(71), 0);
    }

    #[test]
    fn unsubscribe_by_handler_identity() {
        let router = NotifyRouter::new();
        let keep = Recording::new();
        let drop = Recording::new();
        router.subscribe(None, 70, FLAG_SUBSCRIBE_DEFAULT, keep.clone());
        router.subscribe(None, 70, FLAG_SUBSCRIBE_DEFAULT, drop.clone());

        let key = IdentityKey::Handler(drop.clone());
        router.unsubscribe(&key);

        router.route(70, &Packet::new(70, Vec::new()));
        assert_eq!(keep.count(), 1);
        assert_eq!(drop.count(), 0);
    }
}
