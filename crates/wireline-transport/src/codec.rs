//! Frame encoding and incremental decoding.
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! [version: 1][flags: 1][stream id: 1 or 2][opcode: 1][length: 4][body]
//! ```
//!
//! The stream id field is 1 byte under the legacy version and 2 bytes under
//! the extended version. Responses may carry the direction bit (0x80) in the
//! version byte; the decoder masks it off.

use wireline_core::{Error, ProtocolVersion, Result};

use crate::protocol::{Frame, Opcode};

/// Direction bit set on server-to-client frames.
const DIRECTION_MASK: u8 = 0x80;

/// Stateful frame codec bound to one connection.
///
/// Decoding is incremental: `feed` appends whatever bytes arrived, and
/// `next_frame` yields complete frames as they become available, holding
/// partial input across calls. Frames never straddle a codec instance, so the
/// buffer compacts itself once consumed bytes accumulate.
#[derive(Debug)]
pub struct FrameCodec {
    version: ProtocolVersion,
    max_frame_size: usize,
    buf: Vec<u8>,
    pos: usize,
}

impl FrameCodec {
    pub fn new(version: ProtocolVersion, max_frame_size: usize) -> Self {
        Self {
            version,
            max_frame_size,
            buf: Vec::new(),
            pos: 0,
        }
    }

    // ==================== Encoding ====================

    /// Encode one frame. Fails if the stream id is outside the negotiated
    /// version's range or the body exceeds the frame size cap.
    pub fn encode(&self, stream_id: i32, opcode: Opcode, body: &[u8]) -> Result<Vec<u8>> {
        let max = self.version.max_stream_id();
        if stream_id < 0 || stream_id > max {
            return Err(Error::InvalidStreamId { id: stream_id, max });
        }
        if body.len() > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                declared: body.len(),
                max: self.max_frame_size,
            });
        }

        let mut out = Vec::with_capacity(self.version.header_len() + body.len());
        out.push(self.version.wire_byte());
        out.push(0); // flags
        match self.version {
            ProtocolVersion::Legacy => out.push(stream_id as u8),
            ProtocolVersion::Extended => out.extend_from_slice(&(stream_id as u16).to_be_bytes()),
        }
        out.push(opcode.to_u8());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        Ok(out)
    }

    // ==================== Decoding ====================

    /// Append raw bytes received from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        // Compact before growing once half the buffer is dead space.
        if self.pos > 0 && self.pos * 2 >= self.buf.len() {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame, if one has fully arrived.
    ///
    /// A declared body length above the configured maximum is unrecoverable:
    /// the byte stream can no longer be trusted, so the error is returned
    /// before any of the oversized frame is consumed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let header_len = self.version.header_len();
        let avail = &self.buf[self.pos..];
        if avail.len() < header_len {
            return Ok(None);
        }

        // version byte: tolerate the direction bit on responses
        let _version = avail[0] & !DIRECTION_MASK;
        let _flags = avail[1];
        let (stream_id, off) = match self.version {
            ProtocolVersion::Legacy => (i32::from(avail[2] as i8), 3),
            ProtocolVersion::Extended => {
                (i32::from(i16::from_be_bytes([avail[2], avail[3]])), 4)
            }
        };
        let opcode = Opcode::from_u8(avail[off]);
        let body_len =
            u32::from_be_bytes([avail[off + 1], avail[off + 2], avail[off + 3], avail[off + 4]])
                as usize;

        if body_len > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                declared: body_len,
                max: self.max_frame_size,
            });
        }
        if avail.len() < header_len + body_len {
            return Ok(None);
        }

        let body = avail[header_len..header_len + body_len].to_vec();
        self.pos += header_len + body_len;
        Ok(Some(Frame {
            stream_id,
            opcode,
            body,
        }))
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(version: ProtocolVersion) -> FrameCodec {
        FrameCodec::new(version, 1024 * 1024)
    }

    #[test]
    fn test_encode_extended_header_layout() {
        let codec = codec(ProtocolVersion::Extended);
        let bytes = codec.encode(258, Opcode::Query, b"abc").unwrap();
        assert_eq!(
            bytes,
            vec![0x04, 0x00, 0x01, 0x02, 0x07, 0x00, 0x00, 0x00, 0x03, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_encode_legacy_header_layout() {
        let codec = codec(ProtocolVersion::Legacy);
        let bytes = codec.encode(5, Opcode::Options, &[]).unwrap();
        assert_eq!(bytes, vec![0x02, 0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_rejects_out_of_range_stream_id() {
        let legacy = codec(ProtocolVersion::Legacy);
        assert!(matches!(
            legacy.encode(128, Opcode::Query, &[]),
            Err(Error::InvalidStreamId { id: 128, max: 127 })
        ));

        let extended = codec(ProtocolVersion::Extended);
        assert!(extended.encode(32_767, Opcode::Query, &[]).is_ok());
        assert!(extended.encode(32_768, Opcode::Query, &[]).is_err());
        assert!(extended.encode(-1, Opcode::Query, &[]).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let codec = FrameCodec::new(ProtocolVersion::Extended, 16);
        assert!(codec.encode(0, Opcode::Query, &[0u8; 16]).is_ok());
        assert!(matches!(
            codec.encode(0, Opcode::Query, &[0u8; 17]),
            Err(Error::FrameTooLarge {
                declared: 17,
                max: 16
            })
        ));
    }

    #[test]
    fn test_decode_across_arbitrary_split_boundaries() {
        let codec_ref = codec(ProtocolVersion::Extended);
        let frame_a = codec_ref.encode(7, Opcode::Query, b"hello").unwrap();
        let frame_b = codec_ref.encode(8, Opcode::Result, b"").unwrap();
        let mut wire = frame_a;
        wire.extend_from_slice(&frame_b);

        // Every split point, including one byte at a time.
        for chunk in 1..=wire.len() {
            let mut decoder = codec(ProtocolVersion::Extended);
            let mut frames = Vec::new();
            for piece in wire.chunks(chunk) {
                decoder.feed(piece);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    frames.push(frame);
                }
            }
            assert_eq!(frames.len(), 2, "chunk size {chunk}");
            assert_eq!(frames[0].stream_id, 7);
            assert_eq!(frames[0].opcode, Opcode::Query);
            assert_eq!(frames[0].body, b"hello");
            assert_eq!(frames[1].stream_id, 8);
            assert_eq!(frames[1].opcode, Opcode::Result);
            assert!(frames[1].body.is_empty());
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_decode_tolerates_direction_bit() {
        let mut decoder = codec(ProtocolVersion::Extended);
        let mut bytes = decoder.encode(1, Opcode::Ready, &[]).unwrap();
        bytes[0] |= 0x80;
        decoder.feed(&bytes);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Ready);
        assert_eq!(frame.stream_id, 1);
    }

    #[test]
    fn test_oversized_declared_length_is_an_error() {
        let mut decoder = FrameCodec::new(ProtocolVersion::Extended, 16);
        // Header declaring a 17-byte body against a 16-byte cap.
        decoder.feed(&[0x04, 0x00, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x11]);
        assert!(matches!(
            decoder.next_frame(),
            Err(Error::FrameTooLarge {
                declared: 17,
                max: 16
            })
        ));
    }

    #[test]
    fn test_partial_header_yields_nothing() {
        let mut decoder = codec(ProtocolVersion::Extended);
        decoder.feed(&[0x04, 0x00, 0x00]);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 3);
    }
}
