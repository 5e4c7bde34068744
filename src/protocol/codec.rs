//! Packet envelope codec
//!
//! Cursor-based binary reader and writer over fixed buffers. Every
//! payload starts with a one-byte type tag followed by typed fields.
//!
//! # Wire format
//!
//! - All multi-byte integers are **big-endian**, on both ends.
//! - Strings are length-prefixed: a `u32` byte count followed by that
//!   many UTF-8 bytes. Never null-terminated.
//!
//! The writer works over the session's reusable outgoing buffer and
//! tracks its position so the caller can truncate the send to the real
//! payload length. The reader works over a received buffer of known
//! length; reading past the end is [`LinkError::TruncatedPacket`].

use crate::error::{LinkError, Result};

/// Cursor writer over a fixed byte buffer.
///
/// # Examples
///
/// ```
/// use packetlink::protocol::codec::PacketWriter;
///
/// let mut buf = [0u8; 64];
/// let mut writer = PacketWriter::new(&mut buf);
/// writer.write_u8(0)?;
/// writer.write_i32(17)?;
/// writer.write_str("hello")?;
/// assert_eq!(writer.position(), 1 + 4 + 4 + 5);
/// # Ok::<(), packetlink::error::LinkError>(())
/// ```
pub struct PacketWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

macro_rules! write_fixed {
    ($(#[$doc:meta] $name:ident: $ty:ty),* $(,)?) => {
        $(
            #[$doc]
            pub fn $name(&mut self, value: $ty) -> Result<()> {
                self.write_raw(&value.to_be_bytes())
            }
        )*
    };
}

macro_rules! read_fixed {
    ($(#[$doc:meta] $name:ident: $ty:ty),* $(,)?) => {
        $(
            #[$doc]
            pub fn $name(&mut self) -> Result<$ty> {
                const N: usize = std::mem::size_of::<$ty>();
                let bytes = self.read_raw(N)?;
                let mut fixed = [0u8; N];
                fixed.copy_from_slice(bytes);
                Ok(<$ty>::from_be_bytes(fixed))
            }
        )*
    };
}

impl<'a> PacketWriter<'a> {
    /// Create a writer with its cursor at the start of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        PacketWriter { buf, pos: 0 }
    }

    /// Total bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left behind the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Copy raw bytes at the cursor.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(LinkError::BufferOverflow {
                needed: bytes.len(),
                available: self.remaining(),
            });
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    write_fixed! {
        /// Write a `u8`.
        write_u8: u8,
        /// Write an `i8`.
        write_i8: i8,
        /// Write a big-endian `u16`.
        write_u16: u16,
        /// Write a big-endian `i16`.
        write_i16: i16,
        /// Write a big-endian `u32`.
        write_u32: u32,
        /// Write a big-endian `i32`.
        write_i32: i32,
        /// Write a big-endian `u64`.
        write_u64: u64,
        /// Write a big-endian `i64`.
        write_i64: i64,
        /// Write a big-endian IEEE-754 `f32`.
        write_f32: f32,
        /// Write a big-endian IEEE-754 `f64`.
        write_f64: f64,
    }

    /// Write a length-prefixed UTF-8 string: `u32` byte count, then the
    /// bytes.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        let needed = 4 + bytes.len();
        if needed > self.remaining() {
            return Err(LinkError::BufferOverflow {
                needed,
                available: self.remaining(),
            });
        }
        self.write_u32(bytes.len() as u32)?;
        self.write_raw(bytes)
    }
}

/// Cursor reader over a received buffer of known length.
///
/// The leading type tag is consumed by the dispatch layer before the
/// remaining stream is handed to a type-specific decoder, so decoders
/// start at their first field.
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a reader with its cursor at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        PacketReader { buf, pos: 0 }
    }

    /// Total bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left behind the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Borrow `count` raw bytes at the cursor.
    pub fn read_raw(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.remaining() {
            return Err(LinkError::TruncatedPacket {
                needed: count,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    read_fixed! {
        /// Read a `u8`.
        read_u8: u8,
        /// Read an `i8`.
        read_i8: i8,
        /// Read a big-endian `u16`.
        read_u16: u16,
        /// Read a big-endian `i16`.
        read_i16: i16,
        /// Read a big-endian `u32`.
        read_u32: u32,
        /// Read a big-endian `i32`.
        read_i32: i32,
        /// Read a big-endian `u64`.
        read_u64: u64,
        /// Read a big-endian `i64`.
        read_i64: i64,
        /// Read a big-endian IEEE-754 `f32`.
        read_f32: f32,
        /// Read a big-endian IEEE-754 `f64`.
        read_f64: f64,
    }

    /// Read a length-prefixed UTF-8 string written by
    /// [`PacketWriter::write_str`].
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_raw(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_roundtrip() {
        let mut buf = [0u8; 128];
        let mut w = PacketWriter::new(&mut buf);
        w.write_u8(0xAB).unwrap();
        w.write_i32(-12345).unwrap();
        w.write_u16(65535).unwrap();
        w.write_i64(i64::MIN).unwrap();
        w.write_f32(1.5).unwrap();
        w.write_f64(-2.25).unwrap();
        let len = w.position();

        let mut r = PacketReader::new(&buf[..len]);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_i32().unwrap(), -12345);
        assert_eq!(r.read_u16().unwrap(), 65535);
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert_eq!(r.read_f64().unwrap(), -2.25);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = [0u8; 8];
        let mut w = PacketWriter::new(&mut buf);
        w.write_u32(0x0102_0304).unwrap();
        assert_eq!(&buf[..4], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = [0u8; 64];
        let mut w = PacketWriter::new(&mut buf);
        w.write_str("héllo wörld").unwrap();
        let len = w.position();

        let mut r = PacketReader::new(&buf[..len]);
        assert_eq!(r.read_string().unwrap(), "héllo wörld");
    }

    #[test]
    fn test_empty_string() {
        let mut buf = [0u8; 8];
        let mut w = PacketWriter::new(&mut buf);
        w.write_str("").unwrap();
        assert_eq!(w.position(), 4);

        let mut r = PacketReader::new(&buf[..4]);
        assert_eq!(r.read_string().unwrap(), "");
    }

    #[test]
    fn test_writer_overflow() {
        let mut buf = [0u8; 3];
        let mut w = PacketWriter::new(&mut buf);
        let err = w.write_u32(1).unwrap_err();
        assert!(matches!(
            err,
            LinkError::BufferOverflow {
                needed: 4,
                available: 3
            }
        ));
        // a failed write leaves the cursor where it was
        assert_eq!(w.position(), 0);
    }

    #[test]
    fn test_writer_string_overflow_leaves_cursor() {
        let mut buf = [0u8; 6];
        let mut w = PacketWriter::new(&mut buf);
        assert!(w.write_str("too long").is_err());
        assert_eq!(w.position(), 0);
    }

    #[test]
    fn test_reader_truncated() {
        let buf = [0u8; 2];
        let mut r = PacketReader::new(&buf);
        let err = r.read_u32().unwrap_err();
        assert!(matches!(
            err,
            LinkError::TruncatedPacket {
                needed: 4,
                available: 2
            }
        ));
    }

    #[test]
    fn test_reader_string_length_beyond_buffer() {
        // length prefix claims 100 bytes, only 2 follow
        let mut buf = [0u8; 6];
        {
            let mut w = PacketWriter::new(&mut buf);
            w.write_u32(100).unwrap();
        }
        let mut r = PacketReader::new(&buf);
        assert!(matches!(
            r.read_string(),
            Err(LinkError::TruncatedPacket { needed: 100, .. })
        ));
    }

    #[test]
    fn test_reader_invalid_utf8() {
        let mut buf = [0u8; 8];
        {
            let mut w = PacketWriter::new(&mut buf);
            w.write_u32(2).unwrap();
            w.write_raw(&[0xFF, 0xFE]).unwrap();
        }
        let mut r = PacketReader::new(&buf[..6]);
        assert!(matches!(r.read_string(), Err(LinkError::Utf8(_))));
    }
}
