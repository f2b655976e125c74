//! Frame Codec
//!
//! Encodes and decodes gateway payloads to and from wire bytes.
//!
//! The wire format is a configuration choice: a textual JSON encoding that is
//! always available, and a binary encoding backed by a pluggable packer that
//! may fail to initialize at runtime. When the packer is unavailable the codec
//! falls back to JSON and keeps going; the fallback is logged, never fatal.
//!
//! Inbound frames may additionally be compressed in one of three mutually
//! exclusive modes: uncompressed passthrough, per-message one-shot inflate,
//! or a continuous zlib stream where a `00 00 FF FF` trailer marks the point
//! at which a complete message can be read out of the inflate context.

pub mod compression;
pub mod encoding;
pub mod error;
pub mod payload;

pub use compression::{CompressionMode, StreamInflater, ZLIB_FLUSH_SUFFIX, inflate_message};
pub use encoding::{BinaryPacker, EncodedFrame, Encoding, FrameCodec, PackerFactory};
pub use error::CodecError;
pub use payload::{Opcode, ReceivePayload, SendPayload};
