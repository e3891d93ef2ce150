//! Raw capture file layout.
//!
//! A raw trace is a self-describing header followed by blocks of records.
//! Every structure is little-endian:
//!
//! ```text
//! header:   magic "RTRC", platform[16], cpu[16], register_count: u32
//!           register_count x { name[16], bit_size: u32 }
//! block:    magic "BLCK", writer_id: u32, thread_id: u32, frame_count: u32
//! record:   magic "FRAM", seq: u64, ip: u64, clock: u64,
//!           mask: ceil(nregs/64) x u64, changed register bytes in bank order
//!       or: magic "MEMW", seq: u64, ip: u64, address: u64, size: u32,
//!           text_len: u8, text, payload[size]
//! ```
//!
//! Fixed 16-byte name fields are NUL padded.

use crate::cpu::{RegisterBank, RegisterInfo, NAME_FIELD_SIZE};
use crate::error::{TraceError, TraceResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Magic of the raw capture file header
pub const FILE_MAGIC: u32 = 0x4352_5452; // "RTRC"
/// Magic of a writer block
pub const BLOCK_MAGIC: u32 = 0x4B43_4C42; // "BLCK"
/// Magic of a CPU instruction record
pub const FRAME_MAGIC: u32 = 0x4D41_5246; // "FRAM"
/// Magic of an external memory write record
pub const MEM_WRITE_MAGIC: u32 = 0x574D_454D; // "MEMW"

/// Number of 64-bit mask words covering `num_registers` changed-register bits
pub fn mask_words(num_registers: usize) -> usize {
    (num_registers + 63) / 64
}

/// Writes a NUL-padded fixed-size name field
pub fn write_name_field<W: Write>(writer: &mut W, name: &str) -> std::io::Result<()> {
    debug_assert!(name.len() < NAME_FIELD_SIZE);
    let mut field = [0u8; NAME_FIELD_SIZE];
    field[..name.len()].copy_from_slice(name.as_bytes());
    writer.write_all(&field)
}

/// Reads a NUL-padded fixed-size name field
pub fn read_name_field<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut field = [0u8; NAME_FIELD_SIZE];
    reader.read_exact(&mut field)?;
    let len = field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_SIZE);
    Ok(String::from_utf8_lossy(&field[..len]).into_owned())
}

/// Writes the raw capture file header for `bank`
pub fn write_file_header<W: Write>(writer: &mut W, bank: &RegisterBank) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(FILE_MAGIC)?;
    write_name_field(writer, bank.platform_name())?;
    write_name_field(writer, bank.cpu_name())?;
    writer.write_u32::<LittleEndian>(bank.num_registers() as u32)?;
    for reg in bank.registers() {
        write_name_field(writer, &reg.name)?;
        writer.write_u32::<LittleEndian>(reg.bit_size)?;
    }
    Ok(())
}

/// Parsed raw capture file header
#[derive(Debug)]
pub struct FileHeader {
    /// Platform name the trace was recorded on
    pub platform_name: String,
    /// CPU name of the register bank used
    pub cpu_name: String,
    /// Registers in file order
    pub registers: Vec<RegisterInfo>,
}

/// Reads and validates the raw capture file header
pub fn read_file_header<R: Read>(reader: &mut R) -> TraceResult<FileHeader> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != FILE_MAGIC {
        return Err(TraceError::BadMagic(magic));
    }
    let platform_name = read_name_field(reader)?;
    let cpu_name = read_name_field(reader)?;
    let count = reader.read_u32::<LittleEndian>()?;
    let mut registers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_name_field(reader)?;
        let bit_size = reader.read_u32::<LittleEndian>()?;
        registers.push(RegisterInfo { name, bit_size });
    }
    Ok(FileHeader {
        platform_name,
        cpu_name,
        registers,
    })
}

/// Header of one writer block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Writer that produced the block
    pub writer_id: u32,
    /// Emulated thread id of the writer (0 = IRQ, 1 = APC)
    pub thread_id: u32,
    /// Number of records following the header
    pub frame_count: u32,
}

/// On-disk size of a block header, including the magic
pub const BLOCK_HEADER_SIZE: usize = 16;

impl BlockHeader {
    /// Serializes the header, magic first
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(BLOCK_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.writer_id)?;
        writer.write_u32::<LittleEndian>(self.thread_id)?;
        writer.write_u32::<LittleEndian>(self.frame_count)
    }

    /// Deserializes the fields following an already-consumed block magic
    pub fn read_after_magic<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            writer_id: reader.read_u32::<LittleEndian>()?,
            thread_id: reader.read_u32::<LittleEndian>()?,
            frame_count: reader.read_u32::<LittleEndian>()?,
        })
    }
}
