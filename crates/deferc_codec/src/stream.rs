//! Variable-length integer streams.
//!
//! Unsigned values use LEB128; signed values are zig-zag mapped first so that
//! small negative program points stay one byte long.

use crate::error::CodecError;

/// Append-only byte sink.
#[derive(Debug, Default, Clone)]
pub struct TypeWriter {
    buffer: Vec<u8>,
}

impl TypeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_uv(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buffer.push(byte);
                return;
            }
            self.buffer.push(byte | 0x80);
        }
    }

    pub fn put_sv(&mut self, value: i64) {
        self.put_uv(((value << 1) ^ (value >> 63)) as u64);
    }

    /// Append bytes without a length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_uv(bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }
}

/// Cursor over an encoded byte buffer.
#[derive(Debug, Clone)]
pub struct TypeReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> TypeReader<'a> {
    pub fn new(bytes: &'a [u8], position: usize) -> Self {
        Self { bytes, position }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(CodecError::Truncated(self.position))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_uv(&mut self) -> Result<u64, CodecError> {
        let start = self.position;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.get_u8()?;
            // the tenth byte carries only the top bit of a u64
            if shift == 63 && byte > 1 {
                return Err(CodecError::Overflow(start));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn get_uv_u32(&mut self) -> Result<u32, CodecError> {
        let start = self.position;
        u32::try_from(self.get_uv()?).map_err(|_| CodecError::Overflow(start))
    }

    pub fn get_sv(&mut self) -> Result<i64, CodecError> {
        let raw = self.get_uv()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    pub fn get_sv_i32(&mut self) -> Result<i32, CodecError> {
        let start = self.position;
        i32::try_from(self.get_sv()?).map_err(|_| CodecError::Overflow(start))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.get_uv()? as usize;
        self.take(len)
    }
}
