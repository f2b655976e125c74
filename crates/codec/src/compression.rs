//! Inbound Decompression
//!
//! Three mutually exclusive modes, selected by configuration:
//!
//! - `None`: binary frames are handed to the encoding layer untouched.
//! - `PerMessage`: each binary frame is a complete zlib stream, inflated in
//!   one shot. Used for a single large identify-time payload; failures are
//!   per-message errors, not connection-fatal.
//! - `Stream`: all frames belong to one zlib stream spanning the connection.
//!   Bytes accumulate in a persistent inflate context; a complete message is
//!   available only when a frame ends with the 4-byte sync-flush trailer.

use std::io::Read;

use flate2::read::ZlibDecoder;
use flate2::{Decompress, FlushDecompress, Status};

use crate::error::CodecError;

/// zlib sync-flush trailer marking a decompressible boundary.
pub const ZLIB_FLUSH_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const INFLATE_CHUNK_SIZE: usize = 32 * 1024;

/// Decompression mode for inbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    None,
    PerMessage,
    Stream,
}

/// One-shot inflate of a complete zlib message.
pub fn inflate_message(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(bytes.len() * 4);
    ZlibDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|err| CodecError::Inflate(err.to_string()))?;
    Ok(out)
}

/// Persistent inflate context for `CompressionMode::Stream`.
///
/// Bytes are appended across the lifetime of a connection; output is taken
/// only at flush points. A fresh inflater must be created for each new
/// connection since the zlib stream does not survive a reconnect.
pub struct StreamInflater {
    inflate: Decompress,
    buffer: Vec<u8>,
}

impl StreamInflater {
    pub fn new() -> Self {
        StreamInflater {
            inflate: Decompress::new(true),
            buffer: Vec::with_capacity(INFLATE_CHUNK_SIZE),
        }
    }

    /// Feed a frame into the inflate context.
    ///
    /// Returns `Ok(None)` until a frame ends with [`ZLIB_FLUSH_SUFFIX`]; at
    /// that flush point the accumulated decompressed message is returned and
    /// the accumulator starts over.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        let at_flush_point = chunk.len() >= 4 && chunk[chunk.len() - 4..] == ZLIB_FLUSH_SUFFIX;

        let mut consumed = 0usize;
        while consumed < chunk.len() {
            if self.buffer.capacity() == self.buffer.len() {
                self.buffer.reserve(INFLATE_CHUNK_SIZE);
            }
            let in_before = self.inflate.total_in();
            let status = self
                .inflate
                .decompress_vec(&chunk[consumed..], &mut self.buffer, FlushDecompress::Sync)
                .map_err(|err| CodecError::Inflate(err.to_string()))?;
            consumed += (self.inflate.total_in() - in_before) as usize;

            if matches!(status, Status::StreamEnd) {
                break;
            }
            // No input consumed and output space left: the decoder is stuck,
            // bail instead of spinning.
            if self.inflate.total_in() == in_before && self.buffer.len() < self.buffer.capacity() {
                return Err(CodecError::Inflate(
                    "inflate made no progress on remaining input".to_string(),
                ));
            }
        }

        if !at_flush_point {
            return Ok(None);
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.buffer)))
    }
}

impl Default for StreamInflater {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::{Compress, Compression, FlushCompress};
    use std::io::Write;

    /// Compress with a sync flush so output ends in the flush trailer,
    /// the way a streaming-compression peer frames its messages.
    fn sync_flush_compress(compress: &mut Compress, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 64);
        compress
            .compress_vec(data, &mut out, FlushCompress::Sync)
            .unwrap();
        out
    }

    #[test]
    fn test_one_shot_inflate_roundtrip() {
        let message = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(message).unwrap();
        let compressed = encoder.finish().unwrap();

        let inflated = inflate_message(&compressed).unwrap();
        assert_eq!(inflated, message);
    }

    #[test]
    fn test_one_shot_inflate_rejects_garbage() {
        assert!(inflate_message(&[0x12, 0x34, 0x56]).is_err());
    }

    #[test]
    fn test_stream_inflate_yields_nothing_before_flush_point() {
        let mut compress = Compress::new(Compression::default(), true);
        let frame = sync_flush_compress(&mut compress, b"hello gateway");
        assert!(frame.ends_with(&ZLIB_FLUSH_SUFFIX));

        let mut inflater = StreamInflater::new();
        // Feed everything except the trailer: no flush point, no output.
        let split = frame.len() - 4;
        assert!(inflater.push(&frame[..split]).unwrap().is_none());
        // The remainder ends with the trailer: exactly one message comes out.
        let message = inflater.push(&frame[split..]).unwrap().unwrap();
        assert_eq!(message, b"hello gateway");
    }

    #[test]
    fn test_stream_inflate_whole_frame_at_flush_point() {
        let mut compress = Compress::new(Compression::default(), true);
        let frame = sync_flush_compress(&mut compress, b"one complete message");

        let mut inflater = StreamInflater::new();
        let message = inflater.push(&frame).unwrap().unwrap();
        assert_eq!(message, b"one complete message");
    }

    #[test]
    fn test_stream_inflate_context_survives_across_messages() {
        let mut compress = Compress::new(Compression::default(), true);
        let first = sync_flush_compress(&mut compress, b"first");
        let second = sync_flush_compress(&mut compress, b"second");

        let mut inflater = StreamInflater::new();
        assert_eq!(inflater.push(&first).unwrap().unwrap(), b"first");
        // The second frame shares the deflate context with the first; a fresh
        // inflater would fail here, the persistent one must not.
        assert_eq!(inflater.push(&second).unwrap().unwrap(), b"second");
    }

    #[test]
    fn test_stream_inflate_error_is_recoverable() {
        let mut inflater = StreamInflater::new();
        // Not a zlib stream at all.
        let result = inflater.push(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0xff, 0xff]);
        assert!(result.is_err());
    }
}
