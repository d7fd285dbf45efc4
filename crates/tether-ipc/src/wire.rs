//! Field-tagged binary encoding.
//!
//! Every field is a one-byte tag followed by its value. Fixed-width values are little-endian;
//! strings and byte strings carry a `u32` length prefix. The tags make the format
//! self-describing enough to catch reader/writer skew (a `u32` read where a string was written
//! fails with [`DecodeError::TagMismatch`] instead of misparsing the rest of the message).
//!
//! Messages stored in linear memory are framed by a `u32` total length, so a reader only needs
//! the message's address.

use tether_mem::{LinearMemory, MemoryError, ModuleAllocator, ModuleError};
use thiserror::Error;

/// Upper bound on a single message, checked before any allocation on decode.
pub const MAX_MESSAGE_BYTES: usize = 16 << 20;

const TAG_U32: u8 = 1;
const TAG_U64: u8 = 2;
const TAG_F32: u8 = 3;
const TAG_F64: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_BYTES: u8 = 6;

const LEN_PREFIX_BYTES: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of message")]
    UnexpectedEof,
    #[error("expected field tag {expected}, found {found}")]
    TagMismatch { expected: u8, found: u8 },
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("message of {len} bytes exceeds the {MAX_MESSAGE_BYTES}-byte limit")]
    OversizedMessage { len: usize },
    #[error("{0} unread bytes after the last field")]
    TrailingBytes(usize),
    #[error("invalid {field} value {value}")]
    InvalidValue { field: &'static str, value: u64 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WireBuilder {
    buf: Vec<u8>,
}

impl WireBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.buf.push(TAG_U32);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_i32(&mut self, v: i32) -> &mut Self {
        self.push_u32(v as u32)
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        self.buf.push(TAG_U64);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_f32(&mut self, v: f32) -> &mut Self {
        self.buf.push(TAG_F32);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_f64(&mut self, v: f64) -> &mut Self {
        self.buf.push(TAG_F64);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_str(&mut self, v: &str) -> &mut Self {
        self.push_len_prefixed(TAG_STR, v.as_bytes())
    }

    pub fn push_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.push_len_prefixed(TAG_BYTES, v)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Copy the message into a freshly allocated module message buffer, length-prefixed.
    ///
    /// The caller owns the returned pointer and frees it with `dealloc_message`.
    pub fn write_to_module(&self, module: &dyn ModuleAllocator) -> Result<u32, ModuleError> {
        let len = u32::try_from(self.buf.len()).map_err(|_| MemoryError::OutOfMemory {
            len: self.buf.len(),
        })?;
        let ptr = module.alloc_message(LEN_PREFIX_BYTES + len)?;
        let memory = module.memory();
        let written = memory
            .write_u32(ptr, len)
            .and_then(|()| memory.write(ptr + LEN_PREFIX_BYTES, &self.buf));
        if let Err(err) = written {
            module.dealloc_message(ptr)?;
            return Err(err.into());
        }
        Ok(ptr)
    }

    fn push_len_prefixed(&mut self, tag: u8, v: &[u8]) -> &mut Self {
        self.buf.push(tag);
        self.buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(v);
        self
    }
}

/// Copy the length-prefixed message at `ptr` out of linear memory.
pub fn read_message(memory: &LinearMemory, ptr: u32) -> Result<Vec<u8>, DecodeError> {
    let len = memory.read_u32(ptr)? as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(DecodeError::OversizedMessage { len });
    }
    Ok(memory.read_vec(ptr + LEN_PREFIX_BYTES, len)?)
}

#[derive(Debug, Clone)]
pub struct WireParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireParser<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(DecodeError::OversizedMessage { len: bytes.len() });
        }
        Ok(Self { bytes, pos: 0 })
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    /// Tag of the next field, without consuming it.
    pub fn peek_tag(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.expect_tag(TAG_U32)?;
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.expect_tag(TAG_U64)?;
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        self.expect_tag(TAG_F32)?;
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        self.expect_tag(TAG_F64)?;
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn read_str(&mut self) -> Result<&'a str, DecodeError> {
        self.expect_tag(TAG_STR)?;
        let bytes = self.take_len_prefixed()?;
        core::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        self.expect_tag(TAG_BYTES)?;
        self.take_len_prefixed()
    }

    /// Fails if any bytes are left unread.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    fn expect_tag(&mut self, expected: u8) -> Result<(), DecodeError> {
        let found = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        if found != expected {
            return Err(DecodeError::TagMismatch { expected, found });
        }
        self.pos += 1;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take_len_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = u32::from_le_bytes(self.take_array()?) as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_decode_in_order() {
        let mut b = WireBuilder::new();
        b.push_u32(7)
            .push_str("computeSum")
            .push_f64(1.5)
            .push_bytes(&[1, 2, 3])
            .push_i32(-2)
            .push_u64(u64::MAX)
            .push_f32(0.25);
        let bytes = b.finish();

        let mut p = WireParser::new(&bytes).unwrap();
        assert_eq!(p.read_u32().unwrap(), 7);
        assert_eq!(p.read_str().unwrap(), "computeSum");
        assert_eq!(p.read_f64().unwrap(), 1.5);
        assert_eq!(p.read_bytes().unwrap(), &[1, 2, 3]);
        assert_eq!(p.read_i32().unwrap(), -2);
        assert_eq!(p.read_u64().unwrap(), u64::MAX);
        assert_eq!(p.read_f32().unwrap(), 0.25);
        p.finish().unwrap();
    }

    #[test]
    fn reader_writer_skew_is_detected() {
        let mut b = WireBuilder::new();
        b.push_str("x");
        let bytes = b.finish();
        let mut p = WireParser::new(&bytes).unwrap();
        assert_eq!(
            p.read_u32(),
            Err(DecodeError::TagMismatch {
                expected: TAG_U32,
                found: TAG_STR
            })
        );
    }

    #[test]
    fn truncated_and_trailing_input() {
        let mut b = WireBuilder::new();
        b.push_bytes(&[0; 10]);
        let bytes = b.finish();

        let mut p = WireParser::new(&bytes[..8]).unwrap();
        assert_eq!(p.read_bytes(), Err(DecodeError::UnexpectedEof));

        let mut p = WireParser::new(&[]).unwrap();
        assert_eq!(p.read_u32(), Err(DecodeError::UnexpectedEof));

        let mut extra = bytes.clone();
        extra.push(0);
        let mut p = WireParser::new(&extra).unwrap();
        p.read_bytes().unwrap();
        assert_eq!(p.finish(), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let bytes = [TAG_STR, 2, 0, 0, 0, 0xC3, 0x28];
        let mut p = WireParser::new(&bytes).unwrap();
        assert_eq!(p.read_str(), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn oversized_length_prefix_in_memory_is_rejected() {
        let memory = LinearMemory::new(4096).unwrap();
        memory.write_u32(64, u32::MAX).unwrap();
        assert!(matches!(
            read_message(&memory, 64),
            Err(DecodeError::OversizedMessage { .. })
        ));
    }
}
