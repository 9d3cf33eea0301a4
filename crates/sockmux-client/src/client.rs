use crate::cache::CacheManager;
use crate::cache_interceptor::CacheInterceptor;
use crate::config::Config;
use crate::context::{RequestContext, Tag, FLAG_CHECK_CONNECT_STATUS, FLAG_REQUEST};
use crate::handler::{IdentityKey, ResponseHandler};
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::request_queue::{NotifySink, RequestQueue};
use crate::router::{NotifyRouter, FLAG_SUBSCRIBE_DEFAULT};
use crate::serial::SerialSignal;
use sockmux_core::{
    Connection, ConnectionError, Packet, PacketCodec, TcpConnection, TcpConnectionConfig,
    DEFAULT_MAX_FRAME_BYTES,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

impl NotifySink for NotifyRouter {
    fn route(&self, command: i32, packet: &Packet) {
        NotifyRouter::route(self, command, packet);
    }
}

/// Composition root and caller-facing surface of the client: one connection,
/// one request queue, one notification router, one cache, wired together.
pub struct MuxSocket {
    config: Config,
    codec: Arc<dyn PacketCodec>,
    connection: Arc<dyn Connection>,
    queue: Arc<RequestQueue>,
    router: Arc<NotifyRouter>,
    cache: Arc<CacheManager>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MuxSocket {
    /// A client over the built-in TCP transport. Must be called within a
    /// tokio runtime; the inbound pump starts immediately.
    pub fn new(config: Config, codec: Arc<dyn PacketCodec>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = TcpConnectionConfig {
            host: config.host.clone(),
            port: config.port,
            heartbeat_interval: Some(Duration::from_secs(config.heartbeat_secs)),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        };
        let connection = Arc::new(TcpConnection::new(transport, codec.clone(), inbound_tx));
        Self::assemble(config, codec, connection, inbound_rx)
    }

    /// A client over a caller-supplied transport; the caller keeps the
    /// sending side of `inbound` and feeds it every received packet.
    pub fn with_connection(
        config: Config,
        codec: Arc<dyn PacketCodec>,
        connection: Arc<dyn Connection>,
        inbound: mpsc::UnboundedReceiver<(i32, Packet)>,
    ) -> Self {
        Self::assemble(config, codec, connection, inbound)
    }

    fn assemble(
        config: Config,
        codec: Arc<dyn PacketCodec>,
        connection: Arc<dyn Connection>,
        mut inbound: mpsc::UnboundedReceiver<(i32, Packet)>,
    ) -> Self {
        let router = Arc::new(NotifyRouter::new());
        let cache = Arc::new(CacheManager::new());
        let chain = Arc::new(InterceptorChain::new());
        chain.add_interceptor(Arc::new(CacheInterceptor::new(cache.clone())));

        let queue = RequestQueue::new(connection.clone(), chain, cache.clone(), router.clone());

        // single consumer keeps inbound processing sequential, in arrival
        // order
        let pump_queue = queue.clone();
        let pump = tokio::spawn(async move {
            while let Some((command, packet)) = inbound.recv().await {
                pump_queue.on_packet(command, &packet);
            }
            debug!(event = "inbound_pump_stopped");
        });

        Self {
            config,
            codec,
            connection,
            queue,
            router,
            cache,
            pump: Mutex::new(Some(pump)),
        }
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Submits one exchange. The outcome arrives exclusively through
    /// `handler`; this call never blocks on the network.
    pub fn request(
        &self,
        tag: Option<Tag>,
        command: i32,
        body: &[u8],
        handler: Arc<dyn ResponseHandler>,
    ) {
        let packet = self.codec.build_request_packet(command, body);
        let context = Arc::new(RequestContext::new(
            tag,
            command,
            body.to_vec(),
            FLAG_REQUEST | FLAG_CHECK_CONNECT_STATUS,
            Duration::from_secs(self.config.read_timeout_secs),
            packet,
            handler,
        ));
        self.queue.add_request_context(context);
    }

    /// Best-effort removal of every pending context whose tag or handler
    /// matches; their handlers are never invoked afterwards.
    pub fn cancel(&self, key: &IdentityKey) {
        let contexts = self.queue.get_request_contexts(|ctx| {
            key.matches_tag(ctx.tag()) || key.matches_handler(ctx.handler())
        });
        self.queue.remove_request_contexts(contexts);
    }

    pub fn subscribe(&self, tag: Option<Tag>, command: i32, handler: Arc<dyn ResponseHandler>) {
        self.router
            .subscribe(tag, command, FLAG_SUBSCRIBE_DEFAULT, handler);
    }

    pub fn unsubscribe(&self, key: &IdentityKey) {
        self.router.unsubscribe(key);
    }

    pub fn add_serial_signal(&self, signal: SerialSignal) {
        self.queue.add_serial_signal(signal);
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.queue.interceptor_chain().add_interceptor(interceptor);
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn interceptor_chain(&self) -> &Arc<InterceptorChain> {
        self.queue.interceptor_chain()
    }

    pub fn request_queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for MuxSocket {
    fn drop(&mut self) {
        let pump = {
            let mut guard = self.pump.lock().expect("pump lock");
            guard.take()
        };
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}
