//! Shared plumbing for length-prefixed and delimited packets.
//!
//! Binary codecs read fields through a [`ByteReader`] cursor; running out of
//! input yields [`CodecError::Truncated`], which the session layer treats as
//! "keep the buffer, wait for the next read". The reframing loop lives in
//! each codec's `parse_packets`: parse one packet, continue on the residual
//! tail until the buffer is drained.

use crate::error::{CodecError, Result};

/// Cursor over a byte slice with typed reads.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Slice of everything not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Consume bytes up to and including the first occurrence of `delim`.
    pub fn take_until(&mut self, delim: u8) -> Result<&'a [u8]> {
        match self.rest().iter().position(|&b| b == delim) {
            Some(idx) => self.take(idx + 1),
            None => Err(CodecError::Truncated { needed: 1 }),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16_be(&mut self) -> Result<i16> {
        Ok(self.read_u16_be()? as i16)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        Ok(self.read_u32_le()? as i32)
    }

    pub fn read_i32_be(&mut self) -> Result<i32> {
        Ok(self.read_u32_be()? as i32)
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_u64_be(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_f32_le(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32_le()?))
    }
}

/// Verify a stored checksum against the computed one.
pub fn verify_checksum(got: u16, computed: u16) -> Result<()> {
    if got != computed {
        return Err(CodecError::Checksum { got, computed });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_endianness() {
        let data = [0x12, 0x00, 0x01, 0x02, 0x03, 0x04];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_u16_le().unwrap(), 0x0012);
        assert_eq!(r.read_u32_be().unwrap(), 0x01020304);
        assert!(r.is_empty());
    }

    #[test]
    fn test_reader_truncation() {
        let mut r = ByteReader::new(&[0x01]);
        let err = r.read_u32_le().unwrap_err();
        assert_eq!(err, CodecError::Truncated { needed: 3 });
        // the failed read consumes nothing
        assert_eq!(r.read_u8().unwrap(), 0x01);
    }

    #[test]
    fn test_take_until() {
        let mut r = ByteReader::new(b"line one\nrest");
        assert_eq!(r.take_until(b'\n').unwrap(), b"line one\n");
        assert_eq!(r.rest(), b"rest");
        assert!(r.take_until(b'\n').unwrap_err().is_truncated());
    }

    #[test]
    fn test_verify_checksum() {
        assert!(verify_checksum(0x1234, 0x1234).is_ok());
        assert_eq!(
            verify_checksum(0x1234, 0x4321).unwrap_err(),
            CodecError::Checksum { got: 0x1234, computed: 0x4321 }
        );
    }
}
