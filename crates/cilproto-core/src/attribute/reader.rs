//! Bounds-checked cursor over an attribute blob.
//!
//! IL2CPP stores 32-bit integers inside attribute blobs with its own
//! compressed encoding; everything else is raw little-endian.

use crate::error::{Error, Result};
use bytes::Buf;

/// Cursor over a borrowed byte slice that fails on underrun instead of panicking.
#[derive(Debug, Clone)]
pub struct BlobReader<'a> {
    buf: &'a [u8],
    len: usize,
}

impl<'a> BlobReader<'a> {
    /// Creates a reader positioned at the start of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            buf: data,
            len: data.len(),
        }
    }

    /// Current byte offset from the start of the blob
    pub fn offset(&self) -> usize {
        self.len - self.buf.remaining()
    }

    /// Number of unread bytes
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn require(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::malformed_blob(
                self.offset(),
                format!(
                    "need {} byte(s) for {}, {} remaining",
                    n,
                    what,
                    self.buf.remaining()
                ),
            ));
        }
        Ok(())
    }

    /// Reads one byte
    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    /// Reads one signed byte
    pub fn read_i8(&mut self) -> Result<i8> {
        self.require(1, "i8")?;
        Ok(self.buf.get_i8())
    }

    /// Reads a boolean stored as one byte
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a little-endian u16
    pub fn read_u16_le(&mut self) -> Result<u16> {
        self.require(2, "u16")?;
        Ok(self.buf.get_u16_le())
    }

    /// Reads a little-endian i16
    pub fn read_i16_le(&mut self) -> Result<i16> {
        self.require(2, "i16")?;
        Ok(self.buf.get_i16_le())
    }

    /// Reads a little-endian u32
    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.require(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    /// Reads a little-endian u64
    pub fn read_u64_le(&mut self) -> Result<u64> {
        self.require(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    /// Reads a little-endian i64
    pub fn read_i64_le(&mut self) -> Result<i64> {
        self.require(8, "i64")?;
        Ok(self.buf.get_i64_le())
    }

    /// Reads a little-endian f32
    pub fn read_f32_le(&mut self) -> Result<f32> {
        self.require(4, "f32")?;
        Ok(self.buf.get_f32_le())
    }

    /// Reads a little-endian f64
    pub fn read_f64_le(&mut self) -> Result<f64> {
        self.require(8, "f64")?;
        Ok(self.buf.get_f64_le())
    }

    /// Borrows the next `n` bytes and advances past them
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.require(n, "byte run")?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Reads an IL2CPP compressed unsigned integer.
    ///
    /// | Lead byte | Encoding |
    /// |---|---|
    /// | `0x00..=0x7F` | the byte itself |
    /// | `0xF0` | raw little-endian u32 follows |
    /// | `0xFE` | `u32::MAX - 1` |
    /// | `0xFF` | `u32::MAX` |
    /// | `11xxxxxx` | 29-bit big-endian value, 3 more bytes |
    /// | `10xxxxxx` | 14-bit big-endian value, 1 more byte |
    pub fn read_compressed_u32(&mut self) -> Result<u32> {
        let lead = self.read_u8()?;
        match lead {
            0x00..=0x7F => Ok(u32::from(lead)),
            0x80..=0xBF => {
                let low = self.read_u8()?;
                Ok(u32::from(lead & 0x3F) << 8 | u32::from(low))
            }
            0xF0 => self.read_u32_le(),
            0xFE => Ok(u32::MAX - 1),
            0xFF => Ok(u32::MAX),
            0xC0..=0xFF => {
                let rest = self.read_bytes(3)?;
                Ok(u32::from(lead & 0x3F) << 24
                    | u32::from(rest[0]) << 16
                    | u32::from(rest[1]) << 8
                    | u32::from(rest[2]))
            }
        }
    }

    /// Reads an IL2CPP compressed signed integer.
    ///
    /// `u32::MAX` is the sentinel for `i32::MIN`; every other value is
    /// zig-zag style with the sign in the low bit.
    pub fn read_compressed_i32(&mut self) -> Result<i32> {
        let raw = self.read_compressed_u32()?;
        if raw == u32::MAX {
            return Ok(i32::MIN);
        }

        let magnitude = (raw >> 1) as i32;
        if raw & 1 == 1 {
            Ok(-(magnitude + 1))
        } else {
            Ok(magnitude)
        }
    }
}
