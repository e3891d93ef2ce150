//! Reconstruction of externally written memory at any point in the trace.
//!
//! The indexed file stores, per byte address, the list of external writes
//! that hit it. A [`MemorySlice`] materializes those lists for an address
//! range once, after which rewinding to any sequence number is a cheap
//! in-memory operation. Bytes never touched by an external write read as
//! zero, the state emulated memory starts in.

use crate::data_file::DataFile;
use crate::error::TraceResult;
use crate::TraceFrameId;

/// One byte of reconstructed memory and its write history.
#[derive(Debug, Clone)]
pub struct MemoryCell {
    address: u64,
    /// External writes hitting this byte, in increasing sequence order
    history: Vec<(TraceFrameId, u8)>,
    value: u8,
    /// `value` is valid for rewind points in `[window_start, window_end)`
    window_start: TraceFrameId,
    window_end: TraceFrameId,
}

impl MemoryCell {
    fn new(address: u64, history: Vec<(TraceFrameId, u8)>) -> Self {
        let mut cell = Self {
            address,
            history,
            value: 0,
            window_start: 0,
            window_end: 0,
        };
        cell.recompute(0);
        cell
    }

    /// Byte address the cell reconstructs
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Value at the current rewind point
    pub fn value(&self) -> u8 {
        self.value
    }

    /// True when at least one external write hit this byte
    pub fn has_history(&self) -> bool {
        !self.history.is_empty()
    }

    /// Sequence numbers of all writes to this byte
    pub fn write_points(&self) -> impl Iterator<Item = TraceFrameId> + '_ {
        self.history.iter().map(|&(seq, _)| seq)
    }

    /// Moves the cell to the state right after step `seq` executed.
    ///
    /// Rewinding within the current validity window is free; anything else
    /// rescans the history, which stays short for any one byte. Returns
    /// whether the resolved write changed, so a display can skip repaints.
    pub fn rewind(&mut self, seq: TraceFrameId) -> bool {
        if seq >= self.window_start && seq < self.window_end {
            return false;
        }
        let before = self.window_start;
        self.recompute(seq);
        self.window_start != before
    }

    fn recompute(&mut self, seq: TraceFrameId) {
        let mut value = 0;
        let mut start = 0;
        let mut end = TraceFrameId::MAX;
        for &(write_seq, write_value) in &self.history {
            if write_seq <= seq {
                value = write_value;
                start = write_seq;
            } else {
                end = write_seq;
                break;
            }
        }
        self.value = value;
        self.window_start = start;
        self.window_end = end;
    }
}

/// A contiguous range of reconstructed memory.
#[derive(Debug, Clone)]
pub struct MemorySlice {
    start: u64,
    cells: Vec<MemoryCell>,
    current: TraceFrameId,
}

impl MemorySlice {
    /// First address the slice covers
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Number of bytes the slice covers
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True for a zero-length slice
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Rewind point the slice currently reflects
    pub fn current_seq(&self) -> TraceFrameId {
        self.current
    }

    /// Cell backing `address`, when the slice covers it
    pub fn cell(&self, address: u64) -> Option<&MemoryCell> {
        let index = address.checked_sub(self.start)? as usize;
        self.cells.get(index)
    }

    /// Value of `address` at the current rewind point, zero outside the slice
    pub fn byte(&self, address: u64) -> u8 {
        self.cell(address).map(|cell| cell.value()).unwrap_or(0)
    }

    /// The whole range as bytes at the current rewind point
    pub fn bytes(&self) -> Vec<u8> {
        self.cells.iter().map(|cell| cell.value()).collect()
    }

    /// Moves every cell to the state right after step `seq` executed
    pub fn rewind(&mut self, seq: TraceFrameId) {
        if seq == self.current {
            return;
        }
        for cell in &mut self.cells {
            cell.rewind(seq);
        }
        self.current = seq;
    }
}

impl DataFile {
    /// Materializes the write history of addresses `start..end`.
    ///
    /// The returned slice is positioned at sequence number 0, before any
    /// external write took effect.
    pub fn memory_slice(&self, start: u64, end: u64) -> TraceResult<MemorySlice> {
        let mut cells = Vec::with_capacity(end.saturating_sub(start) as usize);
        for address in start..end {
            let history = match self.memory_page(address) {
                Some(page) => {
                    let offset = page.offsets[(address - page.base_address) as usize];
                    self.read_memory_list(offset)?
                }
                None => Vec::new(),
            };
            cells.push(MemoryCell::new(address, history));
        }
        Ok(MemorySlice {
            start,
            cells,
            current: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DataBuilder;
    use crate::cpu::{NoControlFlow, RegisterBank, RegisterInfo};
    use crate::raw_reader::{RawFrame, RawPayload, RawTraceVisitor};

    fn bank() -> RegisterBank {
        RegisterBank::new(
            "TestPlatform",
            "TestCPU",
            vec![RegisterInfo {
                name: "R0".to_string(),
                bit_size: 64,
            }],
        )
        .unwrap()
    }

    /// Builds a file whose only records are the given external writes.
    fn file_with_writes(writes: &[(TraceFrameId, u64, &[u8])]) -> DataFile {
        let bank = bank();
        let mut builder = DataBuilder::new(&bank, &NoControlFlow);
        builder.start_context(0, 7, 0, writes.first().map(|w| w.0).unwrap_or(0));
        for &(seq, address, data) in writes {
            builder.consume_frame(&RawFrame {
                writer_id: 0,
                thread_id: 7,
                seq,
                ip: 0,
                clock: 0,
                payload: RawPayload::MemoryWrite {
                    address,
                    text: "dma",
                    data,
                },
            });
        }
        DataFile::from_index(bank, builder.finish())
    }

    #[test]
    fn rewind_reflects_write_history() {
        let file = file_with_writes(&[(5, 0x2000, &[0xFF]), (9, 0x2000, &[0x00])]);
        let mut slice = file.memory_slice(0x2000, 0x2001).unwrap();

        // before the first write the byte reads as unwritten memory
        slice.rewind(0);
        assert_eq!(slice.byte(0x2000), 0);

        slice.rewind(6);
        assert_eq!(slice.byte(0x2000), 0xFF);

        slice.rewind(9);
        assert_eq!(slice.byte(0x2000), 0x00);

        // rewinding back works the same as forwards
        slice.rewind(5);
        assert_eq!(slice.byte(0x2000), 0xFF);
        slice.rewind(4);
        assert_eq!(slice.byte(0x2000), 0);
    }

    #[test]
    fn rewind_is_idempotent_within_a_window() {
        let file = file_with_writes(&[(5, 0x2000, &[0xAA])]);
        let mut slice = file.memory_slice(0x2000, 0x2001).unwrap();
        for seq in [6, 7, 8, 6, 100] {
            slice.rewind(seq);
            assert_eq!(slice.byte(0x2000), 0xAA);
        }
        assert_eq!(slice.current_seq(), 100);
    }

    #[test]
    fn untouched_bytes_read_zero_and_carry_no_history() {
        let file = file_with_writes(&[(3, 0x2000, &[0x11, 0x22])]);
        let mut slice = file.memory_slice(0x1FFF, 0x2003).unwrap();
        slice.rewind(10);

        assert_eq!(slice.bytes(), vec![0x00, 0x11, 0x22, 0x00]);
        assert!(!slice.cell(0x1FFF).unwrap().has_history());
        assert!(slice.cell(0x2000).unwrap().has_history());
        assert_eq!(
            slice.cell(0x2001).unwrap().write_points().collect::<Vec<_>>(),
            vec![3]
        );
        // outside the slice
        assert!(slice.cell(0x3000).is_none());
        assert_eq!(slice.byte(0x3000), 0);
    }

    #[test]
    fn multi_byte_writes_split_per_address() {
        let file = file_with_writes(&[(1, 0x2FFE, &[0x01, 0x02, 0x03, 0x04])]);
        let mut slice = file.memory_slice(0x2FFE, 0x3002).unwrap();
        slice.rewind(1);
        // the write straddles a page boundary, all four bytes land
        assert_eq!(slice.bytes(), vec![0x01, 0x02, 0x03, 0x04]);
    }
}
