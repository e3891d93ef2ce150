//! Register bank description and instruction classification.
//!
//! Both are supplied by the platform/decoding collaborators: the trace
//! subsystem never interprets instruction semantics itself, it only records
//! register bytes laid out the way the bank describes them and asks the
//! classifier whether an instruction transfers control.

use crate::error::{TraceError, TraceResult};

/// Maximum length of a register, CPU or platform name stored in trace files.
pub const NAME_FIELD_SIZE: usize = 16;

/// One named register of the traced CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    /// Register name, at most 15 bytes so it fits the NUL-padded file field
    pub name: String,
    /// Width in bits, must be a multiple of 8
    pub bit_size: u32,
}

impl RegisterInfo {
    /// Width in bytes as stored in a frame snapshot
    pub fn byte_size(&self) -> u32 {
        self.bit_size / 8
    }
}

/// Ordered register set of the traced CPU.
///
/// The order defines the byte layout of a full frame snapshot: register `i`
/// occupies `byte_size(i)` bytes at `data_offset(i)`, with no padding.
#[derive(Debug, Clone)]
pub struct RegisterBank {
    platform_name: String,
    cpu_name: String,
    registers: Vec<RegisterInfo>,
    offsets: Vec<u32>,
    frame_size: u32,
}

impl RegisterBank {
    /// Builds a bank from its ordered register list.
    ///
    /// Fails if any name does not fit the trace file name field or a register
    /// width is not a whole number of bytes.
    pub fn new(
        platform_name: &str,
        cpu_name: &str,
        registers: Vec<RegisterInfo>,
    ) -> TraceResult<Self> {
        for name in [platform_name, cpu_name] {
            if name.len() >= NAME_FIELD_SIZE {
                return Err(TraceError::NameTooLong(name.to_string()));
            }
        }
        let mut offsets = Vec::with_capacity(registers.len());
        let mut frame_size = 0u32;
        for reg in &registers {
            if reg.name.len() >= NAME_FIELD_SIZE {
                return Err(TraceError::NameTooLong(reg.name.clone()));
            }
            if reg.bit_size == 0 || reg.bit_size % 8 != 0 {
                return Err(TraceError::UnknownRegister(reg.name.clone()));
            }
            offsets.push(frame_size);
            frame_size = frame_size.saturating_add(reg.byte_size());
        }
        Ok(Self {
            platform_name: platform_name.to_string(),
            cpu_name: cpu_name.to_string(),
            registers,
            offsets,
            frame_size,
        })
    }

    /// Platform the bank belongs to
    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    /// CPU the bank describes
    pub fn cpu_name(&self) -> &str {
        &self.cpu_name
    }

    /// Ordered register descriptors
    pub fn registers(&self) -> &[RegisterInfo] {
        &self.registers
    }

    /// Number of registers in the bank
    pub fn num_registers(&self) -> usize {
        self.registers.len()
    }

    /// Byte offset of register `index` inside a full frame snapshot
    pub fn data_offset(&self, index: usize) -> u32 {
        self.offsets[index]
    }

    /// Size in bytes of one full frame snapshot
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Finds a register index by name
    pub fn find(&self, name: &str) -> Option<usize> {
        self.registers.iter().position(|r| r.name == name)
    }

    /// Borrows the bytes of register `index` out of a full snapshot
    pub fn register_bytes<'a>(&self, snapshot: &'a [u8], index: usize) -> &'a [u8] {
        let start = self.offsets[index] as usize;
        let end = start + self.registers[index].byte_size() as usize;
        &snapshot[start..end]
    }
}

/// Control-flow classification of one instruction address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Instruction does not enter or leave a function
    Plain,
    /// Function call; the static target may be unknown (indirect call)
    Call {
        /// Call target when the decoder can compute it statically
        target: Option<u64>,
    },
    /// Function return
    Return,
}

/// Decoder-side classification of recorded instruction pointers.
///
/// Implemented by the decoding subsystem; the builder uses it to grow and
/// collapse the call tree while indexing a trace.
pub trait InstructionClassifier {
    /// Classifies the instruction at `ip`
    fn classify(&self, ip: u64) -> ControlFlow;
}

/// Classifier that never reports a call or return.
///
/// Indexing with it yields one root call frame per context, which is all a
/// trace without decoder support can offer.
#[derive(Debug, Default)]
pub struct NoControlFlow;

impl InstructionClassifier for NoControlFlow {
    fn classify(&self, _ip: u64) -> ControlFlow {
        ControlFlow::Plain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> RegisterBank {
        RegisterBank::new(
            "TestPlatform",
            "TestCPU",
            vec![
                RegisterInfo {
                    name: "R0".to_string(),
                    bit_size: 64,
                },
                RegisterInfo {
                    name: "R1".to_string(),
                    bit_size: 32,
                },
                RegisterInfo {
                    name: "CR".to_string(),
                    bit_size: 8,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn offsets_follow_bank_order() {
        let bank = bank();
        assert_eq!(bank.frame_size(), 13);
        assert_eq!(bank.data_offset(0), 0);
        assert_eq!(bank.data_offset(1), 8);
        assert_eq!(bank.data_offset(2), 12);
        assert_eq!(bank.find("R1"), Some(1));
        assert_eq!(bank.find("R7"), None);
    }

    #[test]
    fn register_bytes_views_the_right_slice() {
        let bank = bank();
        let snapshot: Vec<u8> = (0..13).collect();
        assert_eq!(bank.register_bytes(&snapshot, 1), &[8, 9, 10, 11]);
        assert_eq!(bank.register_bytes(&snapshot, 2), &[12]);
    }

    #[test]
    fn oversized_names_are_rejected() {
        let result = RegisterBank::new(
            "TestPlatform",
            "TestCPU",
            vec![RegisterInfo {
                name: "ThisRegisterNameIsTooLong".to_string(),
                bit_size: 32,
            }],
        );
        assert!(matches!(result, Err(TraceError::NameTooLong(_))));
    }
}
