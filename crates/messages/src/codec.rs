//! Length-prefixed field framing for the wire format.
//!
//! All integers are little-endian; variable-length fields carry a `u32`
//! length prefix. Decoding is total: truncated input, unknown discriminators
//! and trailing garbage surface as [`CodecError`], never as a panic.

use thiserror::Error;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("trailing bytes after message")]
    TrailingBytes,

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),
}

/// Sequential writer for wire fields.
#[derive(Default)]
pub(crate) struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Append raw bytes with no length prefix (fixed-width fields).
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append a u32-length-prefixed byte field.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u32::MAX as usize);
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential reader over wire fields.
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let bytes = self.read_raw(1)?;
        Ok(bytes[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.read_raw(4)?;
        Ok(u32::from_le_bytes(
            bytes.try_into().map_err(|_| CodecError::UnexpectedEnd)?,
        ))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.read_raw(8)?;
        Ok(u64::from_le_bytes(
            bytes.try_into().map_err(|_| CodecError::UnexpectedEnd)?,
        ))
    }

    /// Read exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < len {
            return Err(CodecError::UnexpectedEnd);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read a fixed-width field into an array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let bytes = self.read_raw(N)?;
        bytes.try_into().map_err(|_| CodecError::UnexpectedEnd)
    }

    /// Read a u32-length-prefixed byte field.
    ///
    /// The claimed length is bounds-checked against the remaining input
    /// before any allocation happens.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_u32()? as usize;
        self.read_raw(len)
    }

    /// Finish decoding; any unread bytes are an error.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_fields() {
        let mut writer = FieldWriter::new();
        writer.put_u8(7);
        writer.put_u32(0xdead_beef);
        writer.put_u64(42);
        writer.put_bytes(b"payload");
        writer.put_raw(&[1, 2, 3]);
        let bytes = writer.into_bytes();

        let mut reader = FieldReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_bytes().unwrap(), b"payload");
        assert_eq!(reader.read_array::<3>().unwrap(), [1, 2, 3]);
        reader.finish().unwrap();
    }

    #[test]
    fn test_truncated_input() {
        let mut reader = FieldReader::new(&[1, 2]);
        assert_eq!(reader.read_u32(), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn test_claimed_length_beyond_input() {
        // Length prefix claims 4 GiB; must fail without allocating.
        let mut writer = FieldWriter::new();
        writer.put_u32(u32::MAX);
        let bytes = writer.into_bytes();

        let mut reader = FieldReader::new(&bytes);
        assert_eq!(reader.read_bytes(), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let reader = FieldReader::new(&[0]);
        assert_eq!(reader.finish(), Err(CodecError::TrailingBytes));
    }
}
