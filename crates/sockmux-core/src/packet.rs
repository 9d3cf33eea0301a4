use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// One protocol frame: an integer command code plus an opaque body.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    command: i32,
    body: Vec<u8>,
}

impl Packet {
    pub fn new(command: i32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            body: body.into(),
        }
    }

    pub fn command(&self) -> i32 {
        self.command
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("command", &self.command)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Builds outbound packets and translates packets to and from single wire
/// frames. Frames are newline-delimited on the transport; `encode` and
/// `decode` deal with one frame's bytes, delimiter excluded.
pub trait PacketCodec: Send + Sync {
    fn build_request_packet(&self, command: i32, body: &[u8]) -> Packet;

    /// The keep-alive frame, if the protocol has one.
    fn heartbeat_packet(&self) -> Option<Packet> {
        None
    }

    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, FrameError>;

    fn decode(&self, frame: &[u8]) -> Result<Packet, FrameError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonFrame {
    command: i32,
    #[serde(default)]
    body: String,
}

/// Default codec: one JSON object per frame, UTF-8 bodies only.
pub struct JsonPacketCodec {
    max_frame_bytes: usize,
    heartbeat_command: Option<i32>,
}

impl JsonPacketCodec {
    pub fn new() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            heartbeat_command: None,
        }
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn with_heartbeat_command(mut self, command: i32) -> Self {
        self.heartbeat_command = Some(command);
        self
    }
}

impl Default for JsonPacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec for JsonPacketCodec {
    fn build_request_packet(&self, command: i32, body: &[u8]) -> Packet {
        Packet::new(command, body)
    }

    fn heartbeat_packet(&self) -> Option<Packet> {
        self.heartbeat_command
            .map(|command| Packet::new(command, Vec::new()))
    }

    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, FrameError> {
        let body = packet
            .body_utf8()
            .ok_or_else(|| FrameError::Encode("body is not valid utf-8".to_string()))?;
        let frame = JsonFrame {
            command: packet.command(),
            body: body.to_string(),
        };
        let encoded =
            serde_json::to_vec(&frame).map_err(|err| FrameError::Encode(err.to_string()))?;
        if encoded.len() > self.max_frame_bytes {
            return Err(FrameError::OversizedFrame {
                size: encoded.len(),
                max: self.max_frame_bytes,
            });
        }
        Ok(encoded)
    }

    fn decode(&self, frame: &[u8]) -> Result<Packet, FrameError> {
        if frame.len() > self.max_frame_bytes {
            return Err(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
        }
        let parsed: JsonFrame =
            serde_json::from_slice(frame).map_err(|err| FrameError::Decode(err.to_string()))?;
        Ok(Packet::new(parsed.command, parsed.body.into_bytes()))
    }
}

#[derive(Debug)]
pub struct DecodeReport {
    pub packets: Vec<Packet>,
    pub errors: Vec<FrameError>,
}

impl Default for DecodeReport {
    fn default() -> Self {
        Self {
            packets: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Incremental frame splitter for the read side of a connection. Bytes are
/// pushed as they arrive; complete newline-delimited frames are decoded with
/// the codec. A malformed frame is reported and skipped, the stream
/// continues.
pub struct FrameDecoder {
    codec: Arc<dyn PacketCodec>,
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(codec: Arc<dyn PacketCodec>, max_frame_bytes: usize) -> Self {
        Self {
            codec,
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut frame = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if frame.ends_with(b"\n") {
                frame.pop();
            }
            if frame.ends_with(b"\r") {
                frame.pop();
            }
            if frame.is_empty() {
                continue;
            }
            self.decode_raw_frame(&frame, &mut report);
        }

        if !self.pending.is_empty() && self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    fn decode_raw_frame(&self, frame: &[u8], report: &mut DecodeReport) {
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match self.codec.decode(frame) {
            Ok(packet) => report.packets.push(packet),
            Err(err) => report.errors.push(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Arc<dyn PacketCodec> {
        Arc::new(JsonPacketCodec::new())
    }

    #[test]
    fn encode_decode_round_trip() {
        let codec = JsonPacketCodec::new();
        let packet = codec.build_request_packet(30, br#"{"pageSize":"10000"}"#);

        let frame = codec.encode(&packet).expect("encode");
        let decoded = codec.decode(&frame).expect("decode");

        assert_eq!(decoded.command(), 30);
        assert_eq!(decoded.body_utf8(), Some(r#"{"pageSize":"10000"}"#));
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let codec = JsonPacketCodec::new().with_max_frame_bytes(32);
        let packet = Packet::new(1, "x".repeat(128).into_bytes());
        let result = codec.encode(&packet);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn encoder_rejects_non_utf8_body() {
        let codec = JsonPacketCodec::new();
        let packet = Packet::new(1, vec![0xff, 0xfe]);
        assert!(matches!(codec.encode(&packet), Err(FrameError::Encode(_))));
    }

    #[test]
    fn heartbeat_packet_uses_configured_command() {
        let codec = JsonPacketCodec::new().with_heartbeat_command(0);
        let packet = codec.heartbeat_packet().expect("heartbeat");
        assert_eq!(packet.command(), 0);
        assert!(packet.body().is_empty());

        assert!(JsonPacketCodec::new().heartbeat_packet().is_none());
    }

    #[test]
    fn decoder_recovers_after_malformed_line() {
        let json_codec = JsonPacketCodec::new();
        let mut valid_a = json_codec.encode(&Packet::new(1, b"a".to_vec())).unwrap();
        valid_a.push(b'\n');
        let malformed = b"{\"not\":\"valid\"\n".to_vec();
        let mut valid_b = json_codec.encode(&Packet::new(2, b"b".to_vec())).unwrap();
        valid_b.push(b'\n');

        let mut chunk = Vec::new();
        chunk.extend_from_slice(&valid_a);
        chunk.extend_from_slice(&malformed);
        chunk.extend_from_slice(&valid_b);

        let mut decoder = FrameDecoder::new(codec(), DEFAULT_MAX_FRAME_BYTES);
        let report = decoder.push_chunk(&chunk);

        assert_eq!(report.packets.len(), 2);
        assert_eq!(report.packets[0].command(), 1);
        assert_eq!(report.packets[1].command(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn decoder_buffers_partial_frames_across_chunks() {
        let json_codec = JsonPacketCodec::new();
        let mut frame = json_codec.encode(&Packet::new(7, b"hello".to_vec())).unwrap();
        frame.push(b'\n');
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut decoder = FrameDecoder::new(codec(), DEFAULT_MAX_FRAME_BYTES);
        let first = decoder.push_chunk(head);
        assert!(first.packets.is_empty());
        assert!(first.errors.is_empty());

        let second = decoder.push_chunk(tail);
        assert_eq!(second.packets.len(), 1);
        assert_eq!(second.packets[0].command(), 7);
    }

    #[test]
    fn decoder_rejects_oversized_line_and_continues() {
        let oversized = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(2_000));
        let json_codec = JsonPacketCodec::new();
        let mut valid = json_codec.encode(&Packet::new(3, b"ok".to_vec())).unwrap();
        valid.push(b'\n');

        let mut chunk = oversized.into_bytes();
        chunk.extend_from_slice(&valid);

        let mut decoder = FrameDecoder::new(codec(), 1_024);
        let report = decoder.push_chunk(&chunk);

        assert_eq!(report.packets.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::OversizedFrame { .. }));
    }
}
