//! Primitive codec: fixed-width integers, floats and the string shapes used
//! by the framing layers, with endianness threaded through every call.

use crate::error::{Error, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Byte order of the stream being read or written.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Endianness {
    Little,
    Big,
}

/// Width of the length prefix in front of a length-prefixed byte string.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PrefixWidth {
    One,
    Two,
    Four,
    Eight,
}

pub struct Reader<R> {
    inner: R,
    pub endian: Endianness,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R, endian: Endianness) -> Self {
        Reader { inner, endian }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.inner.read_u8()?)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.inner.read_i8()?)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(match self.endian {
            Endianness::Little => self.inner.read_u16::<LittleEndian>()?,
            Endianness::Big => self.inner.read_u16::<BigEndian>()?,
        })
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(match self.endian {
            Endianness::Little => self.inner.read_i16::<LittleEndian>()?,
            Endianness::Big => self.inner.read_i16::<BigEndian>()?,
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(match self.endian {
            Endianness::Little => self.inner.read_u32::<LittleEndian>()?,
            Endianness::Big => self.inner.read_u32::<BigEndian>()?,
        })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(match self.endian {
            Endianness::Little => self.inner.read_i32::<LittleEndian>()?,
            Endianness::Big => self.inner.read_i32::<BigEndian>()?,
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(match self.endian {
            Endianness::Little => self.inner.read_u64::<LittleEndian>()?,
            Endianness::Big => self.inner.read_u64::<BigEndian>()?,
        })
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(match self.endian {
            Endianness::Little => self.inner.read_i64::<LittleEndian>()?,
            Endianness::Big => self.inner.read_i64::<BigEndian>()?,
        })
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(match self.endian {
            Endianness::Little => self.inner.read_f32::<LittleEndian>()?,
            Endianness::Big => self.inner.read_f32::<BigEndian>()?,
        })
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(match self.endian {
            Endianness::Little => self.inner.read_f64::<LittleEndian>()?,
            Endianness::Big => self.inner.read_f64::<BigEndian>()?,
        })
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Exact signature match. Consumes `expected.len()` bytes and reports
    /// whether they equal `expected`.
    pub fn read_signature(&mut self, expected: &[u8]) -> Result<bool> {
        Ok(self.read_bytes(expected.len())? == expected)
    }

    /// Length-prefixed byte string with a configurable prefix width.
    pub fn read_prefixed_bytes(&mut self, width: PrefixWidth) -> Result<Vec<u8>> {
        let len = match width {
            PrefixWidth::One => usize::from(self.read_u8()?),
            PrefixWidth::Two => usize::from(self.read_u16()?),
            PrefixWidth::Four => self.read_u32()? as usize,
            PrefixWidth::Eight => {
                let len = self.read_u64()?;
                usize::try_from(len)
                    .map_err(|_| Error::CorruptBlock(format!("string length {len} overflows")))?
            }
        };
        self.read_bytes(len)
    }

    /// 4-byte length then bytes, no terminator.
    pub fn read_sized_string(&mut self) -> Result<String> {
        let bytes = self.read_prefixed_bytes(PrefixWidth::Four)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// 1-byte length then bytes.
    pub fn read_short_string(&mut self) -> Result<String> {
        let bytes = self.read_prefixed_bytes(PrefixWidth::One)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Fixed-length field, zero padding stripped.
    pub fn read_fixed_string(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Probes for end of stream. Returns the number of bytes that could
    /// still be read (capped at `limit`), consuming them.
    pub fn remaining(&mut self, limit: usize) -> Result<usize> {
        let mut buf = vec![0u8; limit];
        let mut total = 0;
        loop {
            let n = self.inner.read(&mut buf[total..])?;
            if n == 0 || total + n >= limit {
                return Ok(total + n);
            }
            total += n;
        }
    }
}

pub struct Writer<W> {
    inner: W,
    pub endian: Endianness,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W, endian: Endianness) -> Self {
        Writer { inner, endian }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        Ok(self.inner.write_u8(v)?)
    }

    pub fn write_i8(&mut self, v: i8) -> Result<()> {
        Ok(self.inner.write_i8(v)?)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        Ok(match self.endian {
            Endianness::Little => self.inner.write_u16::<LittleEndian>(v)?,
            Endianness::Big => self.inner.write_u16::<BigEndian>(v)?,
        })
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        Ok(match self.endian {
            Endianness::Little => self.inner.write_i16::<LittleEndian>(v)?,
            Endianness::Big => self.inner.write_i16::<BigEndian>(v)?,
        })
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        Ok(match self.endian {
            Endianness::Little => self.inner.write_u32::<LittleEndian>(v)?,
            Endianness::Big => self.inner.write_u32::<BigEndian>(v)?,
        })
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        Ok(match self.endian {
            Endianness::Little => self.inner.write_i32::<LittleEndian>(v)?,
            Endianness::Big => self.inner.write_i32::<BigEndian>(v)?,
        })
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        Ok(match self.endian {
            Endianness::Little => self.inner.write_u64::<LittleEndian>(v)?,
            Endianness::Big => self.inner.write_u64::<BigEndian>(v)?,
        })
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        Ok(match self.endian {
            Endianness::Little => self.inner.write_i64::<LittleEndian>(v)?,
            Endianness::Big => self.inner.write_i64::<BigEndian>(v)?,
        })
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        Ok(match self.endian {
            Endianness::Little => self.inner.write_f32::<LittleEndian>(v)?,
            Endianness::Big => self.inner.write_f32::<BigEndian>(v)?,
        })
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        Ok(match self.endian {
            Endianness::Little => self.inner.write_f64::<LittleEndian>(v)?,
            Endianness::Big => self.inner.write_f64::<BigEndian>(v)?,
        })
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        Ok(self.inner.write_all(bytes)?)
    }

    pub fn write_prefixed_bytes(&mut self, width: PrefixWidth, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        match width {
            PrefixWidth::One => {
                let len = u8::try_from(len)
                    .map_err(|_| Error::CorruptBlock(format!("string of {len} bytes too long")))?;
                self.write_u8(len)?;
            }
            PrefixWidth::Two => {
                let len = u16::try_from(len)
                    .map_err(|_| Error::CorruptBlock(format!("string of {len} bytes too long")))?;
                self.write_u16(len)?;
            }
            PrefixWidth::Four => {
                let len = u32::try_from(len)
                    .map_err(|_| Error::CorruptBlock(format!("string of {len} bytes too long")))?;
                self.write_u32(len)?;
            }
            PrefixWidth::Eight => self.write_u64(len as u64)?,
        }
        self.write_bytes(bytes)
    }

    pub fn write_sized_string(&mut self, s: &str) -> Result<()> {
        self.write_prefixed_bytes(PrefixWidth::Four, s.as_bytes())
    }

    pub fn write_short_string(&mut self, s: &str) -> Result<()> {
        self.write_prefixed_bytes(PrefixWidth::One, s.as_bytes())
    }

    pub fn write_fixed_string(&mut self, s: &str, len: usize) -> Result<()> {
        let bytes = s.as_bytes();
        if bytes.len() > len {
            return Err(Error::CorruptBlock(format!(
                "string '{s}' longer than its {len}-byte field"
            )));
        }
        self.write_bytes(bytes)?;
        for _ in bytes.len()..len {
            self.write_u8(0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn integers_respect_endianness() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut le = Reader::new(Cursor::new(data), Endianness::Little);
        assert_eq!(le.read_u32().unwrap(), 0x0403_0201);
        let mut be = Reader::new(Cursor::new(data), Endianness::Big);
        assert_eq!(be.read_u32().unwrap(), 0x0102_0304);
    }

    #[test]
    fn short_read_is_end_of_stream() {
        let mut r = Reader::new(Cursor::new([0x01u8, 0x02]), Endianness::Little);
        match r.read_u32() {
            Err(Error::EndOfStream) => {}
            other => panic!("expected EndOfStream, got {other:?}"),
        }
    }

    #[test]
    fn sized_string_round_trip() {
        let mut w = Writer::new(Vec::new(), Endianness::Little);
        w.write_sized_string("NiNode").unwrap();
        let bytes = w.into_inner();
        assert_eq!(&bytes[..4], &[6, 0, 0, 0]);
        let mut r = Reader::new(Cursor::new(bytes), Endianness::Little);
        assert_eq!(r.read_sized_string().unwrap(), "NiNode");
    }

    #[test]
    fn fixed_string_zero_padded() {
        let mut w = Writer::new(Vec::new(), Endianness::Little);
        w.write_fixed_string("ab", 4).unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes, vec![b'a', b'b', 0, 0]);
        let mut r = Reader::new(Cursor::new(bytes), Endianness::Little);
        assert_eq!(r.read_fixed_string(4).unwrap(), "ab");
    }

    #[test]
    fn prefixed_bytes_widths() {
        let mut w = Writer::new(Vec::new(), Endianness::Big);
        w.write_prefixed_bytes(PrefixWidth::Two, b"xyz").unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes, vec![0, 3, b'x', b'y', b'z']);
        let mut r = Reader::new(Cursor::new(bytes), Endianness::Big);
        assert_eq!(r.read_prefixed_bytes(PrefixWidth::Two).unwrap(), b"xyz");
    }

    #[test]
    fn floats_round_trip() {
        let mut w = Writer::new(Vec::new(), Endianness::Little);
        w.write_f32(1.5).unwrap();
        w.write_f64(-2.25).unwrap();
        let mut r = Reader::new(Cursor::new(w.into_inner()), Endianness::Little);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert_eq!(r.read_f64().unwrap(), -2.25);
    }
}
