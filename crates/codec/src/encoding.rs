//! Wire Encodings
//!
//! The textual JSON encoding is always available. The binary encoding is a
//! pluggable pack/unpack capability supplied by the embedder; initializing it
//! can fail at runtime (e.g. a native library is missing), in which case the
//! codec logs the failure and falls back to JSON for the rest of the
//! connection. The fallback is never fatal.

use std::sync::Arc;

use crate::compression::{CompressionMode, StreamInflater, inflate_message};
use crate::error::CodecError;
use crate::payload::{ReceivePayload, SendPayload};

/// Wire encoding for gateway payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Binary,
}

impl Encoding {
    /// Value used in the gateway URL query string.
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Binary => "etf",
        }
    }
}

/// Pluggable binary pack/unpack capability.
pub trait BinaryPacker: Send + Sync {
    fn pack(&self, payload: &SendPayload) -> Result<Vec<u8>, CodecError>;
    fn unpack(&self, bytes: &[u8]) -> Result<ReceivePayload, CodecError>;
}

/// Fallible constructor for the binary packer, invoked once per connection.
pub type PackerFactory = Arc<dyn Fn() -> Result<Box<dyn BinaryPacker>, CodecError> + Send + Sync>;

/// An encoded outbound frame, tagged for the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Per-connection frame codec.
///
/// Owns the effective encoding (after any fallback), the optional binary
/// packer, and the streaming inflate context. One instance per connection;
/// a reconnect gets a fresh codec.
pub struct FrameCodec {
    encoding: Encoding,
    packer: Option<Box<dyn BinaryPacker>>,
    mode: CompressionMode,
    inflater: Option<StreamInflater>,
}

impl FrameCodec {
    pub fn new(
        encoding: Encoding,
        mode: CompressionMode,
        packer_factory: Option<&PackerFactory>,
    ) -> Self {
        let (encoding, packer) = match (encoding, packer_factory) {
            (Encoding::Binary, Some(factory)) => match factory() {
                Ok(packer) => (Encoding::Binary, Some(packer)),
                Err(err) => {
                    tracing::warn!(
                        "binary packer failed to initialize, falling back to json encoding: {err}"
                    );
                    (Encoding::Json, None)
                }
            },
            (Encoding::Binary, None) => {
                tracing::warn!("binary encoding configured without a packer, falling back to json");
                (Encoding::Json, None)
            }
            (Encoding::Json, _) => (Encoding::Json, None),
        };

        let inflater = matches!(mode, CompressionMode::Stream).then(StreamInflater::new);

        FrameCodec {
            encoding,
            packer,
            mode,
            inflater,
        }
    }

    /// The effective encoding after any fallback.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn compression(&self) -> CompressionMode {
        self.mode
    }

    /// Encode an outbound payload.
    pub fn encode(&self, payload: &SendPayload) -> Result<EncodedFrame, CodecError> {
        match (&self.packer, self.encoding) {
            (Some(packer), Encoding::Binary) => Ok(EncodedFrame::Binary(packer.pack(payload)?)),
            _ => Ok(EncodedFrame::Text(serde_json::to_string(payload)?)),
        }
    }

    /// Decode an inbound frame.
    ///
    /// Returns `Ok(None)` when a streaming-mode frame has not yet reached a
    /// flush point, or when a binary frame arrives without any way to handle
    /// it (logged, not fatal).
    pub fn decode(
        &mut self,
        bytes: &[u8],
        is_binary: bool,
    ) -> Result<Option<ReceivePayload>, CodecError> {
        // Text frames never carry transport compression.
        if !is_binary {
            return self.decode_message(bytes).map(Some);
        }
        // The binary encoding is itself a binary frame and never pairs with
        // transport compression.
        if self.encoding == Encoding::Binary {
            return self.decode_message(bytes).map(Some);
        }
        match self.mode {
            CompressionMode::PerMessage => {
                let inflated = inflate_message(bytes)?;
                self.decode_message(&inflated).map(Some)
            }
            CompressionMode::Stream => {
                let Some(inflater) = self.inflater.as_mut() else {
                    return Ok(None);
                };
                match inflater.push(bytes)? {
                    Some(message) => self.decode_message(&message).map(Some),
                    None => Ok(None),
                }
            }
            CompressionMode::None => {
                tracing::debug!(
                    "received a binary frame we are unable to decompress (len: {})",
                    bytes.len()
                );
                Ok(None)
            }
        }
    }

    fn decode_message(&self, bytes: &[u8]) -> Result<ReceivePayload, CodecError> {
        match (&self.packer, self.encoding) {
            (Some(packer), Encoding::Binary) => packer.unpack(bytes),
            _ => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Opcode;
    use flate2::{Compress, Compression, FlushCompress};
    use serde_json::json;

    /// Test packer that frames payloads as JSON behind a one-byte tag.
    struct TaggedPacker;

    impl BinaryPacker for TaggedPacker {
        fn pack(&self, payload: &SendPayload) -> Result<Vec<u8>, CodecError> {
            let mut out = vec![0xb1];
            out.extend(serde_json::to_vec(payload)?);
            Ok(out)
        }

        fn unpack(&self, bytes: &[u8]) -> Result<ReceivePayload, CodecError> {
            if bytes.first() != Some(&0xb1) {
                return Err(CodecError::Pack("missing tag byte".to_string()));
            }
            Ok(serde_json::from_slice(&bytes[1..])?)
        }
    }

    fn working_factory() -> PackerFactory {
        Arc::new(|| Ok(Box::new(TaggedPacker) as Box<dyn BinaryPacker>))
    }

    fn broken_factory() -> PackerFactory {
        Arc::new(|| {
            Err(CodecError::PackerUnavailable(
                "native module not found".to_string(),
            ))
        })
    }

    #[test]
    fn test_json_roundtrip() {
        let mut codec = FrameCodec::new(Encoding::Json, CompressionMode::None, None);
        let frame = codec
            .encode(&SendPayload::new(Opcode::Heartbeat, json!(7)))
            .unwrap();
        let EncodedFrame::Text(text) = frame else {
            panic!("json encoding must produce text frames");
        };

        let decoded = codec.decode(text.as_bytes(), false).unwrap().unwrap();
        assert_eq!(decoded.op, Opcode::Heartbeat);
        assert_eq!(decoded.d, json!(7));
    }

    #[test]
    fn test_binary_packer_roundtrip() {
        let factory = working_factory();
        let mut codec = FrameCodec::new(Encoding::Binary, CompressionMode::None, Some(&factory));
        assert_eq!(codec.encoding(), Encoding::Binary);

        let frame = codec
            .encode(&SendPayload::new(Opcode::Identify, json!({"token": "t"})))
            .unwrap();
        let EncodedFrame::Binary(bytes) = frame else {
            panic!("binary encoding must produce binary frames");
        };

        // Binary-encoded frames arrive as binary websocket messages.
        let mut inbound = vec![0xb1];
        inbound.extend(serde_json::to_vec(&json!({"op": 11})).unwrap());
        assert!(codec.decode(&inbound, true).unwrap().is_some());
        assert_eq!(bytes[0], 0xb1);
    }

    #[test]
    fn test_packer_failure_falls_back_to_json() {
        let factory = broken_factory();
        let mut codec = FrameCodec::new(Encoding::Binary, CompressionMode::None, Some(&factory));
        // Fallback happened, not a fatal error.
        assert_eq!(codec.encoding(), Encoding::Json);

        // Subsequent encode/decode use the JSON path.
        let frame = codec
            .encode(&SendPayload::new(Opcode::Heartbeat, json!(null)))
            .unwrap();
        assert!(matches!(frame, EncodedFrame::Text(_)));
        let decoded = codec.decode(br#"{"op":11}"#, false).unwrap().unwrap();
        assert_eq!(decoded.op, Opcode::HeartbeatAck);
    }

    #[test]
    fn test_binary_requested_without_factory_falls_back() {
        let codec = FrameCodec::new(Encoding::Binary, CompressionMode::None, None);
        assert_eq!(codec.encoding(), Encoding::Json);
    }

    #[test]
    fn test_stream_mode_returns_none_until_flush_point() {
        let mut codec = FrameCodec::new(Encoding::Json, CompressionMode::Stream, None);
        let message = serde_json::to_vec(&json!({"op": 11, "d": null})).unwrap();

        let mut compress = Compress::new(Compression::default(), true);
        let mut frame = Vec::with_capacity(message.len() + 64);
        compress
            .compress_vec(&message, &mut frame, FlushCompress::Sync)
            .unwrap();

        let split = frame.len() - 4;
        assert!(codec.decode(&frame[..split], true).unwrap().is_none());
        let decoded = codec.decode(&frame[split..], true).unwrap().unwrap();
        assert_eq!(decoded.op, Opcode::HeartbeatAck);
    }

    #[test]
    fn test_per_message_inflate_decodes_one_shot() {
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let mut codec = FrameCodec::new(Encoding::Json, CompressionMode::PerMessage, None);
        let message = serde_json::to_vec(&json!({"op": 0, "s": 1, "t": "READY", "d": {}})).unwrap();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&message).unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = codec.decode(&compressed, true).unwrap().unwrap();
        assert_eq!(decoded.op, Opcode::Dispatch);
        assert_eq!(decoded.event_name(), Some("READY"));
    }

    #[test]
    fn test_unhandled_binary_frame_is_dropped_not_fatal() {
        let mut codec = FrameCodec::new(Encoding::Json, CompressionMode::None, None);
        assert!(codec.decode(&[0x01, 0x02, 0x03], true).unwrap().is_none());
    }
}
