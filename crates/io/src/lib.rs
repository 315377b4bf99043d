//! Binary I/O primitives for the rite compiled-unit format.
//!
//! This crate provides the byte-level reading and writing layer used by the
//! RiteVM bytecode loader and dumper: a bounds-checked positional reader, a
//! growable binary writer, and the CRC-16/CCITT checksum the rite binary
//! header carries.
//!
//! The rite format stores multi-byte integers big-endian by default but
//! permits little-endian payloads (selected by the binary ident), so both the
//! reader and the writer carry an explicit [`Endian`] instead of hard-coding
//! one byte order.

pub mod crc;
pub mod error;
pub mod reader;
pub mod writer;

pub use crc::crc16_ccitt;
pub use error::{IoError, IoResult};
pub use reader::BinaryReader;
pub use writer::BinaryWriter;

/// Byte order of multi-byte integers in a rite payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Big-endian payload (binary ident `"RITE"`).
    Big,
    /// Little-endian payload (binary ident `"RITL"`).
    Little,
}

impl Endian {
    /// The byte order of the machine running this code.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }
}
