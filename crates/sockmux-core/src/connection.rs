use crate::packet::{FrameDecoder, Packet, PacketCodec, DEFAULT_MAX_FRAME_BYTES};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("not connected")]
    NotConnected,
}

/// The transport capability the dispatch engine is written against.
///
/// Inbound packets are not part of this trait: a connection is handed an
/// unbounded `(command, Packet)` sender at construction and forwards every
/// decoded frame through it in arrival order.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self) -> Result<(), ConnectionError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Enqueue a packet for the writer. Serialization onto the socket is the
    /// writer task's job; callers never interleave partial writes.
    fn send_packet(&self, packet: Packet) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone)]
pub struct TcpConnectionConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Option<Duration>,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl TcpConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            heartbeat_interval: None,
            write_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

struct LiveConnection {
    writer_tx: mpsc::UnboundedSender<Packet>,
    tasks: Vec<JoinHandle<()>>,
}

/// TCP transport: one reader task feeding the inbound channel, one writer
/// task draining the outbound queue, an optional heartbeat task.
pub struct TcpConnection {
    config: TcpConnectionConfig,
    codec: Arc<dyn PacketCodec>,
    inbound: mpsc::UnboundedSender<(i32, Packet)>,
    connected: Arc<AtomicBool>,
    live: Mutex<Option<LiveConnection>>,
}

impl TcpConnection {
    pub fn new(
        config: TcpConnectionConfig,
        codec: Arc<dyn PacketCodec>,
        inbound: mpsc::UnboundedSender<(i32, Packet)>,
    ) -> Self {
        Self {
            config,
            codec,
            inbound,
            connected: Arc::new(AtomicBool::new(false)),
            live: Mutex::new(None),
        }
    }

    fn spawn_heartbeat(
        &self,
        interval: Duration,
        writer_tx: mpsc::UnboundedSender<Packet>,
    ) -> Option<JoinHandle<()>> {
        let packet = self.codec.heartbeat_packet()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if writer_tx.send(packet.clone()).is_err() {
                    break;
                }
                debug!(event = "heartbeat_sent", command = packet.command());
            }
        }))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }

        let stream =
            TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Packet>();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(writer_loop(
            write_half,
            writer_rx,
            self.codec.clone(),
            self.config.write_timeout,
            self.connected.clone(),
        )));
        tasks.push(tokio::spawn(reader_loop(
            read_half,
            self.codec.clone(),
            self.config.max_frame_bytes,
            self.inbound.clone(),
            self.connected.clone(),
        )));
        if let Some(interval) = self.config.heartbeat_interval {
            if let Some(task) = self.spawn_heartbeat(interval, writer_tx.clone()) {
                tasks.push(task);
            }
        }

        let mut live = self.live.lock().expect("connection state lock");
        *live = Some(LiveConnection { writer_tx, tasks });
        self.connected.store(true, Ordering::SeqCst);
        info!(
            event = "connected",
            host = %self.config.host,
            port = self.config.port
        );
        Ok(())
    }

    async fn disconnect(&self) {
        let live = {
            let mut guard = self.live.lock().expect("connection state lock");
            guard.take()
        };
        self.connected.store(false, Ordering::SeqCst);
        if let Some(live) = live {
            for task in live.tasks {
                task.abort();
            }
            info!(event = "disconnected", host = %self.config.host);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_packet(&self, packet: Packet) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let guard = self.live.lock().expect("connection state lock");
        let Some(live) = guard.as_ref() else {
            return Err(ConnectionError::NotConnected);
        };
        live.writer_tx
            .send(packet)
            .map_err(|_| ConnectionError::NotConnected)
    }
}

async fn writer_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    codec: Arc<dyn PacketCodec>,
    write_timeout: Duration,
    connected: Arc<AtomicBool>,
) {
    while let Some(packet) = rx.recv().await {
        let mut frame = match codec.encode(&packet) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "frame_encode_error", command = packet.command(), error = %err);
                continue;
            }
        };
        frame.push(b'\n');
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "write_error", error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "write_timeout");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

async fn reader_loop(
    mut reader: OwnedReadHalf,
    codec: Arc<dyn PacketCodec>,
    max_frame_bytes: usize,
    inbound: mpsc::UnboundedSender<(i32, Packet)>,
    connected: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new(codec, max_frame_bytes);
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(event = "read_eof");
                break;
            }
            Ok(read) => read,
            Err(err) => {
                warn!(event = "read_error", error = %err);
                break;
            }
        };
        let report = decoder.push_chunk(&buf[..read]);
        for err in report.errors {
            warn!(event = "frame_decode_error", error = %err);
        }
        for packet in report.packets {
            if inbound.send((packet.command(), packet)).is_err() {
                return;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}
