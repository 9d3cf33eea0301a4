use async_trait::async_trait;
use sockmux_client::{
    CacheEntry, Config, ExpirePolicy, IdentityKey, MuxSocket, RequestError, ResponseHandler,
    SerialSignal,
};
use sockmux_core::{Connection, ConnectionError, JsonPacketCodec, Packet, PacketCodec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-process transport: records every accepted packet and, when scripted,
/// echoes a response for a command straight back into the inbound channel.
struct TestConnection {
    connected: AtomicBool,
    sent: Mutex<Vec<Packet>>,
    replies: Mutex<HashMap<i32, Vec<u8>>>,
    inbound: mpsc::UnboundedSender<(i32, Packet)>,
}

impl TestConnection {
    fn new(inbound: mpsc::UnboundedSender<(i32, Packet)>) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            inbound,
        })
    }

    fn reply_with(&self, command: i32, body: &[u8]) {
        self.replies
            .lock()
            .expect("replies lock")
            .insert(command, body.to_vec());
    }

    fn sent_commands(&self) -> Vec<i32> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .map(Packet::command)
            .collect()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

#[async_trait]
impl Connection for TestConnection {
    async fn connect(&self) -> Result<(), ConnectionError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_packet(&self, packet: Packet) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let command = packet.command();
        self.sent.lock().expect("sent lock").push(packet);
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .get(&command)
            .cloned();
        if let Some(body) = reply {
            let _ = self.inbound.send((command, Packet::new(command, body)));
        }
        Ok(())
    }
}

struct Recording {
    successes: Mutex<Vec<(i32, Vec<u8>)>>,
    failures: Mutex<Vec<RequestError>>,
}

impl Recording {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            successes: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        })
    }

    fn success_count(&self) -> usize {
        self.successes.lock().expect("lock").len()
    }

    fn failure_count(&self) -> usize {
        self.failures.lock().expect("lock").len()
    }
}

impl ResponseHandler for Recording {
    fn on_success(&self, command: i32, _request_body: Option<&[u8]>, packet: &Packet) {
        self.successes
            .lock()
            .expect("lock")
            .push((command, packet.body().to_vec()));
    }

    fn on_failure(&self, _command: i32, error: &RequestError) {
        self.failures.lock().expect("lock").push(error.clone());
    }
}

fn client() -> (MuxSocket, Arc<TestConnection>) {
    let config = Config::builder()
        .host("127.0.0.1")
        .port(9102)
        .build()
        .expect("config");
    let codec: Arc<dyn PacketCodec> = Arc::new(JsonPacketCodec::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = TestConnection::new(tx);
    let socket = MuxSocket::with_connection(config, codec, connection.clone(), rx);
    (socket, connection)
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uncached_requests_always_reach_the_connection() {
    let (socket, connection) = client();
    connection.reply_with(20, b"resp");
    let handler = Recording::new();

    socket.request(None, 20, b"q", handler.clone());
    wait_until("first response", || handler.success_count() == 1).await;

    socket.request(None, 20, b"q", handler.clone());
    wait_until("second response", || handler.success_count() == 2).await;

    assert_eq!(connection.sent_commands(), vec![20, 20]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn counter_cache_serves_limit_hits_then_refetches() {
    let (socket, connection) = client();
    connection.reply_with(100, b"cached");
    socket
        .cache_manager()
        .register(CacheEntry::counter(100, ExpirePolicy::NotUsable, 1).expect("entry"));
    let handler = Recording::new();

    // first request round-trips and fills the cache
    socket.request(None, 100, b"q", handler.clone());
    wait_until("network response", || handler.success_count() == 1).await;
    assert_eq!(connection.sent_count(), 1);

    // second is served from cache, zero network writes
    socket.request(None, 100, b"q", handler.clone());
    wait_until("cache hit", || handler.success_count() == 2).await;
    assert_eq!(connection.sent_count(), 1);

    // counter exhausted, third goes to the network again
    socket.request(None, 100, b"q", handler.clone());
    wait_until("refetch", || handler.success_count() == 3).await;
    assert_eq!(connection.sent_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sending_a_conflicting_command_invalidates_the_cache() {
    let (socket, connection) = client();
    connection.reply_with(100, b"list");
    connection.reply_with(200, b"created");
    socket.cache_manager().register(
        CacheEntry::use_until_send(100, ExpirePolicy::NotUsable, vec![200]).expect("entry"),
    );
    let handler = Recording::new();

    socket.request(None, 100, b"q", handler.clone());
    wait_until("fill", || handler.success_count() == 1).await;

    // cache hit while no conflicting traffic
    socket.request(None, 100, b"q", handler.clone());
    wait_until("hit", || handler.success_count() == 2).await;
    assert_eq!(connection.sent_commands(), vec![100]);

    // traffic on the conflicting command expires the entry
    socket.request(None, 200, b"create", handler.clone());
    wait_until("conflict", || handler.success_count() == 3).await;

    socket.request(None, 100, b"q", handler.clone());
    wait_until("refetch", || handler.success_count() == 4).await;
    assert_eq!(connection.sent_commands(), vec![100, 200, 100]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_entry_serves_once_and_still_refreshes_over_the_network() {
    let (socket, connection) = client();
    connection.reply_with(100, b"fresh");
    socket.cache_manager().register(CacheEntry::relative_millis(
        100,
        ExpirePolicy::UseAndRefresh,
        Duration::from_millis(250),
    ));
    let handler = Recording::new();

    socket.request(None, 100, b"q", handler.clone());
    wait_until("fill", || handler.success_count() == 1).await;
    assert_eq!(connection.sent_count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    // stale serve resolves immediately AND the refresh still goes out
    let stale_handler = Recording::new();
    socket.request(None, 100, b"q", stale_handler.clone());
    wait_until("stale serve", || stale_handler.success_count() == 1).await;
    wait_until("refresh write", || connection.sent_count() == 2).await;

    // the refresh response must not re-invoke the handler
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(stale_handler.success_count(), 1);
    assert_eq!(stale_handler.failure_count(), 0);

    // but it refreshed the cache: next lookup is a fresh hit, no write
    let hit_handler = Recording::new();
    socket.request(None, 100, b"q", hit_handler.clone());
    wait_until("fresh hit", || hit_handler.success_count() == 1).await;
    assert_eq!(connection.sent_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serial_signal_orders_related_requests() {
    let (socket, connection) = client();
    socket.add_serial_signal(SerialSignal::new("order-flow", 30, vec![30, 31]));
    let handler = Recording::new();

    socket.request(None, 30, b"list", handler.clone());
    socket.request(None, 31, b"types", handler.clone());

    // only the first related command is on the wire
    wait_until("first send", || connection.sent_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connection.sent_commands(), vec![30]);

    // resolving the first releases the second
    connection
        .inbound
        .send((30, Packet::new(30, b"orders".to_vec())))
        .expect("inject response");
    wait_until("second send", || connection.sent_count() == 2).await;
    assert_eq!(connection.sent_commands(), vec![30, 31]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_by_tag_prevents_send_and_any_callback() {
    let (socket, connection) = client();
    socket.add_serial_signal(SerialSignal::new("order-flow", 30, vec![30, 31]));
    let first = Recording::new();
    let parked = Recording::new();

    socket.request(Some("keep".to_string()), 30, b"a", first.clone());
    socket.request(Some("drop".to_string()), 31, b"b", parked.clone());
    wait_until("first send", || connection.sent_count() == 1).await;

    socket.cancel(&IdentityKey::from("drop"));

    connection
        .inbound
        .send((30, Packet::new(30, Vec::new())))
        .expect("inject response");
    wait_until("first response", || first.success_count() == 1).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connection.sent_commands(), vec![30]);
    assert_eq!(parked.success_count(), 0);
    assert_eq!(parked.failure_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmatched_packets_reach_exactly_the_commands_subscribers() {
    let (socket, connection) = client();
    let prices = Recording::new();
    let prices_too = Recording::new();
    let orders = Recording::new();

    socket.subscribe(Some("prices".to_string()), 70, prices.clone());
    socket.subscribe(None, 70, prices_too.clone());
    socket.subscribe(None, 71, orders.clone());

    connection
        .inbound
        .send((70, Packet::new(70, b"tick".to_vec())))
        .expect("inject notification");

    wait_until("fan out", || {
        prices.success_count() == 1 && prices_too.success_count() == 1
    })
    .await;
    assert_eq!(orders.success_count(), 0);

    socket.unsubscribe(&IdentityKey::from("prices"));
    connection
        .inbound
        .send((70, Packet::new(70, b"tick2".to_vec())))
        .expect("inject notification");

    wait_until("second fan out", || prices_too.success_count() == 2).await;
    assert_eq!(prices.success_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_resolves_failure_and_late_response_becomes_notification() {
    let (socket, connection) = client();
    let handler = Recording::new();
    let listener = Recording::new();
    socket.subscribe(None, 40, listener.clone());

    // the facade enforces the read-timeout floor, so drive the queue with a
    // hand-built context to get a test-sized deadline
    let queue = socket.request_queue().clone();
    let context = Arc::new(sockmux_client::RequestContext::new(
        None,
        40,
        b"q".to_vec(),
        sockmux_client::FLAG_REQUEST | sockmux_client::FLAG_CHECK_CONNECT_STATUS,
        Duration::from_millis(60),
        Packet::new(40, b"q".to_vec()),
        handler.clone(),
    ));
    queue.add_request_context(context);
    wait_until("send", || connection.sent_count() == 1).await;

    wait_until("timeout", || handler.failure_count() == 1).await;
    assert_eq!(
        handler.failures.lock().expect("lock").as_slice(),
        &[RequestError::Timeout { secs: 0 }]
    );

    // the response shows up after the deadline: routed as a notification
    connection
        .inbound
        .send((40, Packet::new(40, b"late".to_vec())))
        .expect("inject late response");
    wait_until("late fan out", || listener.success_count() == 1).await;
    assert_eq!(handler.success_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_each_appear_whole_exactly_once() {
    let (socket, connection) = client();
    let socket = Arc::new(socket);
    let handler = Recording::new();

    let mut tasks = Vec::new();
    for i in 0..32 {
        let socket = socket.clone();
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            let body = format!("req-{i}");
            socket.request(None, 500 + i, body.as_bytes(), handler);
        }));
    }
    for task in tasks {
        task.await.expect("request task");
    }

    wait_until("all sends", || connection.sent_count() == 32).await;

    let sent = connection.sent.lock().expect("sent lock");
    let mut commands = sent.iter().map(Packet::command).collect::<Vec<_>>();
    commands.sort_unstable();
    assert_eq!(commands, (500..532).collect::<Vec<_>>());
    for packet in sent.iter() {
        let expected = format!("req-{}", packet.command() - 500);
        assert_eq!(packet.body_utf8(), Some(expected.as_str()));
    }
}
