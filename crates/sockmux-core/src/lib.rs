pub mod connection;
pub mod packet;

pub use connection::{Connection, ConnectionError, TcpConnection, TcpConnectionConfig};
pub use packet::{
    DecodeReport, FrameDecoder, FrameError, JsonPacketCodec, Packet, PacketCodec,
    DEFAULT_MAX_FRAME_BYTES,
};
