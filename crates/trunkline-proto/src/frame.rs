//! Frame codec.
//!
//! Every frame starts with a fixed six-byte header:
//! `type:u8 | length:u32_le | parity:u8`, where the parity byte is chosen so
//! that the XOR of all six header bytes is zero. The payload of a
//! `Request`-typed frame begins with an eight-byte little-endian request id;
//! the remainder is opaque to this layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, Result};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 6;

/// Maximum payload length a frame may declare.
pub const MAX_PAYLOAD_LEN: u32 = 1 << 28;

/// Length of the request-id prefix of a `Request` payload.
pub const REQUEST_ID_LEN: usize = 8;

/// Kind of a frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake/authentication traffic, only valid before a connection is
    /// established.
    Authentication = 1,
    /// Multiplexed request traffic; payload starts with a request id.
    Request = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameType::Authentication),
            2 => Ok(FrameType::Request),
            _ => Err(ProtoError::InvalidFrameType { value }),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind.
    pub frame_type: FrameType,
    /// Payload length in bytes, header excluded.
    pub length: u32,
}

impl FrameHeader {
    /// Creates a header after checking the payload length cap.
    pub fn new(frame_type: FrameType, length: u32) -> Result<Self> {
        if length > MAX_PAYLOAD_LEN {
            return Err(ProtoError::PayloadTooLarge {
                size: length as u64,
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(FrameHeader { frame_type, length })
    }

    /// Encodes the header, computing the parity byte.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = self.frame_type as u8;
        raw[1..5].copy_from_slice(&self.length.to_le_bytes());
        raw[5] = raw[0] ^ raw[1] ^ raw[2] ^ raw[3] ^ raw[4];
        raw
    }

    /// Decodes and validates a header.
    ///
    /// Checks parity first so that a corrupted type or length byte is
    /// reported as corruption rather than as a semantic error.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let parity = raw.iter().fold(0u8, |acc, b| acc ^ b);
        if parity != 0 {
            return Err(ProtoError::ParityMismatch);
        }
        let frame_type = FrameType::try_from(raw[0])?;
        let length = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
        if length > MAX_PAYLOAD_LEN {
            return Err(ProtoError::PayloadTooLarge {
                size: length as u64,
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(FrameHeader { frame_type, length })
    }
}

/// One header+payload unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub frame_type: FrameType,
    /// Payload bytes, header excluded. For `Request` frames this includes
    /// the leading request id.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame, checking the payload length cap.
    pub fn new(frame_type: FrameType, payload: Bytes) -> Result<Self> {
        if payload.len() as u64 > MAX_PAYLOAD_LEN as u64 {
            return Err(ProtoError::PayloadTooLarge {
                size: payload.len() as u64,
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Frame {
            frame_type,
            payload,
        })
    }

    /// Creates a `Request` frame addressed to `request_id`.
    pub fn request(request_id: u64, body: &[u8]) -> Result<Self> {
        let mut payload = BytesMut::with_capacity(REQUEST_ID_LEN + body.len());
        payload.put_u64_le(request_id);
        payload.put_slice(body);
        Frame::new(FrameType::Request, payload.freeze())
    }

    /// Creates an `Authentication` frame.
    pub fn authentication(payload: Bytes) -> Result<Self> {
        Frame::new(FrameType::Authentication, payload)
    }

    /// Request id of a `Request` frame, if the payload is long enough to
    /// carry one.
    pub fn request_id(&self) -> Option<u64> {
        if self.frame_type != FrameType::Request || self.payload.len() < REQUEST_ID_LEN {
            return None;
        }
        let mut raw = [0u8; REQUEST_ID_LEN];
        raw.copy_from_slice(&self.payload[..REQUEST_ID_LEN]);
        Some(u64::from_le_bytes(raw))
    }

    /// Payload past the request id of a `Request` frame.
    pub fn body(&self) -> Bytes {
        if self.frame_type == FrameType::Request && self.payload.len() >= REQUEST_ID_LEN {
            self.payload.slice(REQUEST_ID_LEN..)
        } else {
            self.payload.clone()
        }
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Appends the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let header = FrameHeader {
            frame_type: self.frame_type,
            length: self.payload.len() as u32,
        };
        dst.reserve(self.encoded_len());
        dst.put_slice(&header.encode());
        dst.put_slice(&self.payload);
    }

    /// Encodes the frame into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst);
        dst.freeze()
    }
}

/// Incremental frame decoder.
///
/// Feed it a receive buffer; it returns `Ok(None)` while more bytes are
/// needed and consumes exactly one frame per `Ok(Some(_))`. A validated
/// header is cached between calls so parity is checked once per frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Option<FrameHeader>,
}

impl FrameDecoder {
    /// Creates a decoder with no partial state.
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Attempts to decode one frame from the front of `src`.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_LEN];
                raw.copy_from_slice(&src[..HEADER_LEN]);
                let header = FrameHeader::decode(&raw)?;
                src.advance(HEADER_LEN);
                self.pending = Some(header);
                header
            }
        };

        if src.len() < header.length as usize {
            src.reserve(header.length as usize - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(header.length as usize).freeze();
        Ok(Some(Frame {
            frame_type: header.frame_type,
            payload,
        }))
    }

    /// True if a header has been consumed but its payload has not.
    pub fn mid_frame(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(FrameType::Request, 517).unwrap();
        let raw = header.encode();
        assert_eq!(raw.iter().fold(0u8, |acc, b| acc ^ b), 0);
        assert_eq!(FrameHeader::decode(&raw).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_bad_parity() {
        let mut raw = FrameHeader::new(FrameType::Request, 8).unwrap().encode();
        raw[2] ^= 0x40;
        assert_eq!(FrameHeader::decode(&raw), Err(ProtoError::ParityMismatch));
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        // Hand-build a header with a valid parity byte but type 9.
        let mut raw = [9u8, 0, 0, 0, 0, 0];
        raw[5] = raw[0] ^ raw[1] ^ raw[2] ^ raw[3] ^ raw[4];
        assert_eq!(
            FrameHeader::decode(&raw),
            Err(ProtoError::InvalidFrameType { value: 9 })
        );
    }

    #[test]
    fn test_header_rejects_oversize() {
        let length = MAX_PAYLOAD_LEN + 1;
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = FrameType::Request as u8;
        raw[1..5].copy_from_slice(&length.to_le_bytes());
        raw[5] = raw[0] ^ raw[1] ^ raw[2] ^ raw[3] ^ raw[4];
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(ProtoError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_request_frame_carries_id() {
        let frame = Frame::request(0xDEAD_BEEF, b"body").unwrap();
        assert_eq!(frame.request_id(), Some(0xDEAD_BEEF));
        assert_eq!(&frame.body()[..], b"body");
    }

    #[test]
    fn test_decoder_roundtrip() {
        let frame = Frame::request(23, b"hello").unwrap();
        let mut buf = BytesMut::from(&frame.encode()[..]);
        let mut decoder = FrameDecoder::new();
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_short_read() {
        let frame = Frame::request(1, &[0u8; 32]).unwrap();
        let encoded = frame.encode();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        // Drip the frame in three-byte chunks; only the final chunk yields it.
        let mut produced = Vec::new();
        for chunk in encoded.chunks(3) {
            buf.extend_from_slice(chunk);
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                produced.push(frame);
            }
        }
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0], frame);
    }

    #[test]
    fn test_decoder_consumes_back_to_back_frames() {
        let first = Frame::request(1, b"one").unwrap();
        let second = Frame::request(2, b"two").unwrap();
        let mut buf = BytesMut::new();
        first.encode_into(&mut buf);
        second.encode_into(&mut buf);

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), second);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_empty_payload_frame() {
        let frame = Frame::new(FrameType::Authentication, Bytes::new()).unwrap();
        let mut buf = BytesMut::from(&frame.encode()[..]);
        let decoded = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Authentication);
        assert!(decoded.payload.is_empty());
    }
}
