//! Bounds-checked positional reader over a byte slice.

use crate::error::{IoError, IoResult};
use crate::Endian;

/// A reader for rite binary payloads.
///
/// Every read checks the remaining length before advancing, so a truncated or
/// corrupt compiled unit surfaces as an [`IoError`] instead of a panic. The
/// byte order of multi-byte reads is fixed when the reader is created (the
/// loader picks it from the binary ident).
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> BinaryReader<'a> {
    /// Creates a new reader over the given data.
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
        }
    }

    /// Gets the current position in the reader.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Gets the total length of the underlying data.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether the underlying data is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// The byte order this reader was created with.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Sets the position in the reader.
    pub fn set_position(&mut self, position: usize) -> IoResult<()> {
        if position > self.data.len() {
            return Err(IoError::invalid_data(
                "set_position",
                "position out of bounds",
            ));
        }
        self.pos = position;
        Ok(())
    }

    /// Ensures that `amount` more bytes can be read.
    fn ensure(&self, amount: usize) -> IoResult<()> {
        if self.pos + amount > self.data.len() {
            return Err(IoError::end_of_stream(
                self.pos + amount - self.data.len(),
                "binary reader",
            ));
        }
        Ok(())
    }

    /// Peeks at the next byte without advancing.
    pub fn peek(&self) -> IoResult<u8> {
        self.ensure(1)?;
        Ok(self.data[self.pos])
    }

    /// Reads an unsigned byte.
    pub fn read_u8(&mut self) -> IoResult<u8> {
        self.ensure(1)?;
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Reads a 16-bit unsigned integer.
    pub fn read_u16(&mut self) -> IoResult<u16> {
        self.ensure(2)?;
        let bytes: [u8; 2] = self.data[self.pos..self.pos + 2].try_into().unwrap();
        self.pos += 2;
        Ok(match self.endian {
            Endian::Big => u16::from_be_bytes(bytes),
            Endian::Little => u16::from_le_bytes(bytes),
        })
    }

    /// Reads a 32-bit unsigned integer.
    pub fn read_u32(&mut self) -> IoResult<u32> {
        self.ensure(4)?;
        let bytes: [u8; 4] = self.data[self.pos..self.pos + 4].try_into().unwrap();
        self.pos += 4;
        Ok(match self.endian {
            Endian::Big => u32::from_be_bytes(bytes),
            Endian::Little => u32::from_le_bytes(bytes),
        })
    }

    /// Reads exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> IoResult<&'a [u8]> {
        self.ensure(len)?;
        let s = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }

    /// Reads a fixed 4-byte identifier (section or binary ident).
    pub fn read_ident(&mut self) -> IoResult<[u8; 4]> {
        let s = self.read_bytes(4)?;
        Ok([s[0], s[1], s[2], s[3]])
    }

    /// Skips forward to the next multiple of `align` bytes, relative to the
    /// start of the data.
    pub fn align(&mut self, align: usize) -> IoResult<()> {
        debug_assert!(align.is_power_of_two());
        let rem = self.pos & (align - 1);
        if rem != 0 {
            self.ensure(align - rem)?;
            self.pos += align - rem;
        }
        Ok(())
    }

    /// Returns a sub-reader over the next `len` bytes and advances past them.
    pub fn sub_reader(&mut self, len: usize) -> IoResult<BinaryReader<'a>> {
        let bytes = self.read_bytes(len)?;
        Ok(BinaryReader::new(bytes, self.endian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_integers_big_endian() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a];
        let mut r = BinaryReader::new(&data, Endian::Big);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u16().unwrap(), 0x5678);
        assert_eq!(r.read_u8().unwrap(), 0x9a);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_read_integers_little_endian() {
        let data = [0x78, 0x56, 0x34, 0x12];
        let mut r = BinaryReader::new(&data, Endian::Little);
        assert_eq!(r.read_u32().unwrap(), 0x12345678);
    }

    #[test]
    fn test_end_of_stream() {
        let data = [0x01];
        let mut r = BinaryReader::new(&data, Endian::Big);
        assert!(r.read_u32().is_err());
        // A failed read must not advance the position.
        assert_eq!(r.position(), 0);
        assert_eq!(r.read_u8().unwrap(), 1);
    }

    #[test]
    fn test_align() {
        let data = [0u8; 8];
        let mut r = BinaryReader::new(&data, Endian::Big);
        r.read_u8().unwrap();
        r.align(4).unwrap();
        assert_eq!(r.position(), 4);
        r.align(4).unwrap();
        assert_eq!(r.position(), 4);
    }

    #[test]
    fn test_sub_reader() {
        let data = [1, 2, 3, 4, 5];
        let mut r = BinaryReader::new(&data, Endian::Big);
        let mut sub = r.sub_reader(3).unwrap();
        assert_eq!(sub.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert!(sub.read_u8().is_err());
        assert_eq!(r.read_u8().unwrap(), 4);
    }
}
