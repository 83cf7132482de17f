//! Payload reader/writer.
//!
//! All multi-byte integers on the wire are little-endian. Arrays and strings
//! are length-prefixed with a `u32_le`. The writer copies every value,
//! length words included, into its own buffer at append time, so nothing it
//! emits can dangle once the caller's locals go away.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, Result};

/// Append-only payload builder backed by an owned buffer.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        PayloadWriter::default()
    }

    /// Creates a writer over a caller-supplied buffer, typically drawn from
    /// a pool. Existing contents are kept.
    pub fn from_buf(buf: BytesMut) -> Self {
        PayloadWriter { buf }
    }

    /// Creates a writer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        PayloadWriter {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    /// Appends a length-prefixed array. The length word is computed here and
    /// written into the owned buffer immediately.
    pub fn put_array(&mut self, bytes: &[u8]) {
        self.buf.put_u32_le(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) {
        self.put_array(value.as_bytes());
    }

    /// Appends raw bytes with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freezes the accumulated payload.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Returns the underlying buffer, e.g. for returning it to a pool.
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}

/// Cursor over a received payload with truncation-checked accessors.
#[derive(Debug, Clone)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        PayloadReader { buf }
    }

    fn check(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ProtoError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        self.check(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn take_u16(&mut self) -> Result<u16> {
        self.check(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn take_u32(&mut self) -> Result<u32> {
        self.check(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn take_u64(&mut self) -> Result<u64> {
        self.check(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn take_i64(&mut self) -> Result<i64> {
        self.check(8)?;
        Ok(self.buf.get_i64_le())
    }

    /// Takes a length-prefixed array without copying the contents.
    pub fn take_array(&mut self) -> Result<Bytes> {
        let len = self.take_u32()? as usize;
        self.check(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Takes exactly `len` raw bytes with no length prefix.
    pub fn take_exact(&mut self, len: usize) -> Result<Bytes> {
        self.check(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Takes a length-prefixed UTF-8 string.
    pub fn take_str(&mut self) -> Result<String> {
        let raw = self.take_array()?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::InvalidUtf8)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Remaining bytes as a slice of the payload, consuming them.
    pub fn take_rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }

    /// Fails unless the payload has been fully consumed.
    pub fn expect_end(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(ProtoError::TrailingBytes {
                count: self.buf.remaining(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_roundtrip() {
        let mut writer = PayloadWriter::new();
        writer.put_u8(7);
        writer.put_u32(1234);
        writer.put_u64(u64::MAX);
        writer.put_array(b"abc");
        writer.put_str("hello");

        let mut reader = PayloadReader::new(writer.into_bytes());
        assert_eq!(reader.take_u8().unwrap(), 7);
        assert_eq!(reader.take_u32().unwrap(), 1234);
        assert_eq!(reader.take_u64().unwrap(), u64::MAX);
        assert_eq!(&reader.take_array().unwrap()[..], b"abc");
        assert_eq!(reader.take_str().unwrap(), "hello");
        reader.expect_end().unwrap();
    }

    #[test]
    fn test_reader_truncated_integer() {
        let mut reader = PayloadReader::new(Bytes::from_static(&[1, 2]));
        assert_eq!(
            reader.take_u32(),
            Err(ProtoError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_reader_truncated_array() {
        let mut writer = PayloadWriter::new();
        writer.put_u32(100); // claims 100 bytes, supplies none
        let mut reader = PayloadReader::new(writer.into_bytes());
        assert!(matches!(
            reader.take_array(),
            Err(ProtoError::Truncated { needed: 100, .. })
        ));
    }

    #[test]
    fn test_reader_trailing_bytes() {
        let mut writer = PayloadWriter::new();
        writer.put_u8(1);
        writer.put_u8(2);
        let mut reader = PayloadReader::new(writer.into_bytes());
        reader.take_u8().unwrap();
        assert_eq!(reader.expect_end(), Err(ProtoError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn test_writer_owns_length_words() {
        // The length prefix must live in the writer's buffer, not in the
        // caller's frame: mutating the source after append changes nothing.
        let mut source = vec![1u8, 2, 3, 4];
        let mut writer = PayloadWriter::new();
        writer.put_array(&source);
        source.clear();

        let mut reader = PayloadReader::new(writer.into_bytes());
        assert_eq!(&reader.take_array().unwrap()[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut writer = PayloadWriter::new();
        writer.put_array(&[0xFF, 0xFE]);
        let mut reader = PayloadReader::new(writer.into_bytes());
        assert_eq!(reader.take_str(), Err(ProtoError::InvalidUtf8));
    }
}
