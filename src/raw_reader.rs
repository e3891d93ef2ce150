//! Ingestion of raw capture files.
//!
//! The reader replays a recorded stream in file order, undoing the capture
//! side's delta encoding: every writer gets a zeroed reference buffer and
//! each instruction record patches only the registers its mask names, so the
//! visitor always sees full snapshots. Damage mid-stream truncates the scan
//! with a warning instead of failing it; everything up to the last complete
//! record is delivered.

use crate::cpu::RegisterBank;
use crate::error::{TraceError, TraceResult};
use crate::format::{self, BlockHeader};
use crate::{TaskObserver, TraceFrameId};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Payload of one replayed record.
#[derive(Debug, PartialEq, Eq)]
pub enum RawPayload<'a> {
    /// Full register snapshot after applying the record's delta
    Cpu(&'a [u8]),
    /// External memory write, delivered exactly as recorded
    MemoryWrite {
        /// First byte address written
        address: u64,
        /// Tag naming the source of the write
        text: &'a str,
        /// Written bytes
        data: &'a [u8],
    },
}

/// One replayed record with its stream identity.
#[derive(Debug)]
pub struct RawFrame<'a> {
    /// Writer that recorded the step
    pub writer_id: u32,
    /// Emulated thread id of that writer
    pub thread_id: u32,
    /// Global sequence number
    pub seq: TraceFrameId,
    /// Instruction pointer at the step
    pub ip: u64,
    /// Capture clock value (zero for external writes)
    pub clock: u64,
    /// Snapshot or write descriptor
    pub payload: RawPayload<'a>,
}

/// Visitor driven by [`RawTraceReader::scan`].
///
/// `consume_frame` is called in increasing sequence order within each
/// context; sequence numbers may have gaps.
pub trait RawTraceVisitor {
    /// A new context (writer) appeared, located at its first record
    fn start_context(&mut self, writer_id: u32, thread_id: u32, ip: u64, seq: TraceFrameId);

    /// One replayed record
    fn consume_frame(&mut self, frame: &RawFrame<'_>);

    /// A context ended, located at its last seen record
    fn end_context(&mut self, writer_id: u32, ip: u64, seq: TraceFrameId, num_frames: u32);
}

struct ScanContext {
    thread_id: u32,
    /// Reconstructed snapshot; delta decode mirrors delta encode
    ref_data: Vec<u8>,
    num_frames: u32,
    last_seq: TraceFrameId,
    last_ip: u64,
}

/// Reader over one raw capture file.
pub struct RawTraceReader {
    file: BufReader<File>,
    bank: RegisterBank,
    platform_name: String,
    cpu_name: String,
    post_header_offset: u64,
    file_size: u64,
}

impl RawTraceReader {
    /// Opens a raw capture file and validates it against the live bank.
    ///
    /// The whole file is rejected when the magic is wrong or when any stored
    /// register differs from `bank` in name, order or byte size.
    pub fn open(path: &Path, bank: &RegisterBank) -> TraceResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut file = BufReader::new(file);
        let header = format::read_file_header(&mut file)?;

        if header.registers.len() != bank.num_registers() {
            return Err(TraceError::RegisterMismatch {
                name: "<count>".to_string(),
                file_size: header.registers.len() as u32,
                bank_size: bank.num_registers() as u32,
            });
        }
        for (stored, live) in header.registers.iter().zip(bank.registers()) {
            if stored.name != live.name {
                return Err(TraceError::UnknownRegister(stored.name.clone()));
            }
            if stored.byte_size() != live.byte_size() {
                return Err(TraceError::RegisterMismatch {
                    name: stored.name.clone(),
                    file_size: stored.byte_size(),
                    bank_size: live.byte_size(),
                });
            }
        }

        let post_header_offset = file.stream_position()?;
        log::info!(
            "trace: opened capture for platform '{}', cpu '{}', {} registers",
            header.platform_name,
            header.cpu_name,
            header.registers.len()
        );
        Ok(Self {
            file,
            bank: bank.clone(),
            platform_name: header.platform_name,
            cpu_name: header.cpu_name,
            post_header_offset,
            file_size,
        })
    }

    /// Platform name stored in the file header
    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    /// CPU name stored in the file header
    pub fn cpu_name(&self) -> &str {
        &self.cpu_name
    }

    /// The validated register bank this reader decodes with
    pub fn bank(&self) -> &RegisterBank {
        &self.bank
    }

    /// Replays the whole stream into `visitor`.
    ///
    /// Stops early on an unrecognized block or record magic, on truncation
    /// and on cancellation, always delivering what was parsed so far and
    /// firing `end_context` once per open context.
    pub fn scan<V: RawTraceVisitor>(
        &mut self,
        visitor: &mut V,
        observer: &mut dyn TaskObserver,
    ) -> TraceResult<()> {
        self.file.seek(SeekFrom::Start(self.post_header_offset))?;
        let mut pos = self.post_header_offset;
        let mut contexts: HashMap<u32, ScanContext> = HashMap::new();
        let frame_size = self.bank.frame_size() as usize;
        let mask_words = format::mask_words(self.bank.num_registers());

        'blocks: while pos < self.file_size {
            observer.progress(pos, self.file_size);
            if observer.is_cancelled() {
                log::info!("trace: scan cancelled at offset {pos}");
                break;
            }

            let magic = match self.file.read_u32::<LittleEndian>() {
                Ok(magic) => magic,
                Err(err) => {
                    truncation_warning(&err, pos, self.file_size)?;
                    break;
                }
            };
            if magic != format::BLOCK_MAGIC {
                warn_bad_magic("block", pos, self.file_size);
                break;
            }
            let header = match BlockHeader::read_after_magic(&mut self.file) {
                Ok(header) => header,
                Err(err) => {
                    truncation_warning(&err, pos, self.file_size)?;
                    break;
                }
            };
            pos += format::BLOCK_HEADER_SIZE as u64;

            let context = contexts
                .entry(header.writer_id)
                .or_insert_with(|| ScanContext {
                    thread_id: header.thread_id,
                    ref_data: vec![0; frame_size],
                    num_frames: 0,
                    last_seq: 0,
                    last_ip: 0,
                });

            for _ in 0..header.frame_count {
                match read_record(
                    &mut self.file,
                    &self.bank,
                    mask_words,
                    header,
                    context,
                    visitor,
                    &mut pos,
                    self.file_size,
                ) {
                    Ok(true) => {}
                    Ok(false) => break 'blocks,
                    Err(err) => {
                        truncation_warning(&err, pos, self.file_size)?;
                        break 'blocks;
                    }
                }
            }
        }

        // close every context that delivered records at its last location
        let mut ids: Vec<u32> = contexts.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let context = &contexts[&id];
            if context.num_frames > 0 {
                visitor.end_context(id, context.last_ip, context.last_seq, context.num_frames);
            }
        }
        Ok(())
    }
}

/// Reads one record; `Ok(false)` means an unrecognized magic stopped the scan.
#[allow(clippy::too_many_arguments)]
fn read_record<V: RawTraceVisitor>(
    file: &mut BufReader<File>,
    bank: &RegisterBank,
    mask_words: usize,
    header: BlockHeader,
    context: &mut ScanContext,
    visitor: &mut V,
    pos: &mut u64,
    file_size: u64,
) -> std::io::Result<bool> {
    let record_start = *pos;
    let magic = file.read_u32::<LittleEndian>()?;
    match magic {
        format::FRAME_MAGIC => {
            let seq = file.read_u64::<LittleEndian>()?;
            let ip = file.read_u64::<LittleEndian>()?;
            let clock = file.read_u64::<LittleEndian>()?;
            let mut mask = vec![0u64; mask_words];
            for word in mask.iter_mut() {
                *word = file.read_u64::<LittleEndian>()?;
            }
            let mut consumed = 28 + mask_words as u64 * 8;
            for i in 0..bank.num_registers() {
                if mask[i / 64] & (1u64 << (i & 63)) == 0 {
                    continue;
                }
                let offset = bank.data_offset(i) as usize;
                let size = bank.registers()[i].byte_size() as usize;
                file.read_exact(&mut context.ref_data[offset..offset + size])?;
                consumed += size as u64;
            }
            *pos = record_start + consumed;

            if context.num_frames == 0 {
                visitor.start_context(header.writer_id, context.thread_id, ip, seq);
            }
            visitor.consume_frame(&RawFrame {
                writer_id: header.writer_id,
                thread_id: context.thread_id,
                seq,
                ip,
                clock,
                payload: RawPayload::Cpu(&context.ref_data),
            });
            context.last_seq = seq;
            context.last_ip = ip;
            context.num_frames += 1;
            Ok(true)
        }
        format::MEM_WRITE_MAGIC => {
            let seq = file.read_u64::<LittleEndian>()?;
            let ip = file.read_u64::<LittleEndian>()?;
            let address = file.read_u64::<LittleEndian>()?;
            let size = file.read_u32::<LittleEndian>()?;
            let text_len = file.read_u8()?;
            let mut text = vec![0u8; text_len as usize];
            file.read_exact(&mut text)?;
            let mut data = vec![0u8; size as usize];
            file.read_exact(&mut data)?;
            // magic 4 + seq 8 + ip 8 + address 8 + size 4 + text_len 1
            *pos = record_start + 33 + text_len as u64 + size as u64;

            let text = String::from_utf8_lossy(&text).into_owned();
            if context.num_frames == 0 {
                visitor.start_context(header.writer_id, context.thread_id, ip, seq);
            }
            visitor.consume_frame(&RawFrame {
                writer_id: header.writer_id,
                thread_id: context.thread_id,
                seq,
                ip,
                clock: 0,
                payload: RawPayload::MemoryWrite {
                    address,
                    text: &text,
                    data: &data,
                },
            });
            context.last_seq = seq;
            context.last_ip = ip;
            context.num_frames += 1;
            Ok(true)
        }
        _ => {
            warn_bad_magic("record", record_start, file_size);
            Ok(false)
        }
    }
}

/// Downgrades EOF to a truncation warning; real I/O errors propagate.
fn truncation_warning(err: &std::io::Error, pos: u64, file_size: u64) -> TraceResult<()> {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        log::warn!(
            "trace: file truncated at offset {pos} ({:.2}% of file), stopping scan",
            percentage(pos, file_size)
        );
        Ok(())
    } else {
        Err(TraceError::Io(std::io::Error::new(err.kind(), err.to_string())))
    }
}

fn warn_bad_magic(what: &str, pos: u64, file_size: u64) {
    log::warn!(
        "trace: invalid {what} header at offset {pos} ({:.2}% of file), stopping scan",
        percentage(pos, file_size)
    );
}

fn percentage(pos: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (pos as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::RegisterInfo;
    use crate::writer::TraceSink;
    use std::io::Write;

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
            ],
        )
        .unwrap()
    }

    fn frame(r0: u64, r1: u32) -> Vec<u8> {
        let mut data = vec![0u8; 12];
        data[..8].copy_from_slice(&r0.to_le_bytes());
        data[8..].copy_from_slice(&r1.to_le_bytes());
        data
    }

    /// Records a small capture and returns the file path.
    fn record(dir: &tempfile::TempDir, frames: &[(u64, u64, u32)]) -> std::path::PathBuf {
        let path = dir.path().join("trace.raw");
        let file = std::fs::File::create(&path).unwrap();
        let sink = TraceSink::create(&bank(), file).unwrap();
        let writer = sink.create_writer(7);
        for &(ip, r0, r1) in frames {
            writer.add_frame(ip, &frame(r0, r1));
        }
        drop(sink);
        path
    }

    #[derive(Default)]
    struct Collector {
        started: Vec<(u32, u32)>,
        ended: Vec<(u32, u32)>,
        snapshots: Vec<(TraceFrameId, u64, Vec<u8>)>,
        writes: Vec<(TraceFrameId, u64, Vec<u8>, String)>,
    }

    impl RawTraceVisitor for Collector {
        fn start_context(&mut self, writer_id: u32, thread_id: u32, _ip: u64, _seq: TraceFrameId) {
            self.started.push((writer_id, thread_id));
        }
        fn consume_frame(&mut self, frame: &RawFrame<'_>) {
            match frame.payload {
                RawPayload::Cpu(data) => {
                    self.snapshots.push((frame.seq, frame.ip, data.to_vec()));
                }
                RawPayload::MemoryWrite {
                    address,
                    text,
                    data,
                } => {
                    self.writes
                        .push((frame.seq, address, data.to_vec(), text.to_string()));
                }
            }
        }
        fn end_context(&mut self, writer_id: u32, _ip: u64, _seq: TraceFrameId, num_frames: u32) {
            self.ended.push((writer_id, num_frames));
        }
    }

    #[test]
    fn scan_reconstructs_full_snapshots_from_deltas() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = record(
            &dir,
            &[(0x1000, 1, 10), (0x1004, 1, 20), (0x1008, 2, 20)],
        );
        let mut reader = RawTraceReader::open(&path, &bank()).unwrap();
        assert_eq!(reader.platform_name(), "TestPlatform");

        let mut collector = Collector::default();
        reader.scan(&mut collector, &mut ()).unwrap();
        assert_eq!(collector.started, vec![(0, 7)]);
        assert_eq!(collector.ended, vec![(0, 3)]);
        assert_eq!(collector.snapshots.len(), 3);
        // second frame changed only R1, yet the snapshot is complete
        assert_eq!(collector.snapshots[1].2, frame(1, 20));
        assert_eq!(collector.snapshots[2].2, frame(2, 20));
        // sequence numbers increase along the writer
        assert!(collector.snapshots.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn memory_writes_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("trace.raw");
        let file = std::fs::File::create(&path).unwrap();
        let sink = TraceSink::create(&bank(), file).unwrap();
        let writer = sink.create_interrupt_writer("DmaIrq");
        writer.add_frame(0x2000, &frame(5, 5));
        writer.add_memory_write(0x2000, 0x8000, &[0xAA, 0xBB], "dma");
        drop(sink);

        let mut reader = RawTraceReader::open(&path, &bank()).unwrap();
        let mut collector = Collector::default();
        reader.scan(&mut collector, &mut ()).unwrap();
        assert_eq!(collector.writes.len(), 1);
        let (seq, address, data, text) = &collector.writes[0];
        assert_eq!(*seq, 1);
        assert_eq!(*address, 0x8000);
        assert_eq!(data, &vec![0xAA, 0xBB]);
        assert_eq!(text, "dma");
    }

    #[test]
    fn register_mismatch_rejects_the_whole_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = record(&dir, &[(0x1000, 1, 1)]);
        let other = RegisterBank::new(
            "TestPlatform",
            "TestCPU",
            vec![
                RegisterInfo {
                    name: "R0".to_string(),
                    bit_size: 32, // recorded as 64-bit
                },
                RegisterInfo {
                    name: "R1".to_string(),
                    bit_size: 32,
                },
            ],
        )
        .unwrap();
        let result = RawTraceReader::open(&path, &other);
        assert!(matches!(result, Err(TraceError::RegisterMismatch { .. })));
    }

    #[test]
    fn truncated_file_returns_complete_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        let frames: Vec<(u64, u64, u32)> =
            (0..100).map(|i| (0x1000 + i * 4, i, i as u32)).collect();
        let path = record(&dir, &frames);

        // chop the file mid-stream
        let bytes = std::fs::read(&path).unwrap();
        let cut = dir.path().join("cut.raw");
        std::fs::File::create(&cut)
            .unwrap()
            .write_all(&bytes[..bytes.len() - 7])
            .unwrap();

        let mut reader = RawTraceReader::open(&cut, &bank()).unwrap();
        let mut collector = Collector::default();
        reader.scan(&mut collector, &mut ()).unwrap();
        assert!(!collector.snapshots.is_empty());
        assert!(collector.snapshots.len() < 100);
        assert_eq!(collector.ended.len(), 1);
    }

    #[test]
    fn memory_write_blocks_scan_to_the_very_end() {
        // enough external writes to fill more than one block; every record
        // must come back, the stream position may not drift off the file
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("trace.raw");
        let file = std::fs::File::create(&path).unwrap();
        let sink = TraceSink::create(&bank(), file).unwrap();
        let writer = sink.create_writer(7);
        const WRITES: u64 = 1900;
        for i in 0..WRITES {
            writer.add_memory_write(0x1000, 0x8000 + i, &[i as u8, (i >> 8) as u8], "dma");
        }
        drop(sink);

        let mut reader = RawTraceReader::open(&path, &bank()).unwrap();
        let mut collector = Collector::default();
        reader.scan(&mut collector, &mut ()).unwrap();
        assert_eq!(collector.writes.len(), WRITES as usize);
        assert_eq!(collector.ended, vec![(0, WRITES as u32)]);
        for (i, (seq, address, data, _)) in collector.writes.iter().enumerate() {
            assert_eq!(*seq, i as u64);
            assert_eq!(*address, 0x8000 + i as u64);
            assert_eq!(data, &vec![i as u8, (i >> 8) as u8]);
        }
    }

    #[test]
    fn garbage_inside_a_block_stops_the_scan() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = record(&dir, &[(0x1000, 1, 1), (0x1004, 2, 2)]);
        // forge a block that claims one record but carries junk
        let mut bytes = std::fs::read(&path).unwrap();
        BlockHeader {
            writer_id: 0,
            thread_id: 7,
            frame_count: 1,
        }
        .write_to(&mut bytes)
        .unwrap();
        bytes.extend_from_slice(&[0x55; 8]);
        let noisy = dir.path().join("noisy.raw");
        std::fs::write(&noisy, &bytes).unwrap();

        let mut reader = RawTraceReader::open(&noisy, &bank()).unwrap();
        let mut collector = Collector::default();
        reader.scan(&mut collector, &mut ()).unwrap();
        assert_eq!(collector.snapshots.len(), 2);
        assert_eq!(collector.ended, vec![(0, 2)]);
    }

    #[test]
    fn garbage_after_valid_blocks_stops_the_scan() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = record(&dir, &[(0x1000, 1, 1), (0x1004, 2, 2)]);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0x55; 64]);
        let noisy = dir.path().join("noisy.raw");
        std::fs::write(&noisy, &bytes).unwrap();

        let mut reader = RawTraceReader::open(&noisy, &bank()).unwrap();
        let mut collector = Collector::default();
        reader.scan(&mut collector, &mut ()).unwrap();
        assert_eq!(collector.snapshots.len(), 2);
    }

    struct CancelAfterFirst {
        calls: u32,
    }

    impl TaskObserver for CancelAfterFirst {
        fn progress(&mut self, _done: u64, _total: u64) {
            self.calls += 1;
        }
        fn is_cancelled(&self) -> bool {
            self.calls > 1
        }
    }

    #[test]
    fn cancellation_returns_partial_result() {
        let dir = tempfile::TempDir::new().unwrap();
        // enough frames to span several blocks
        let frames: Vec<(u64, u64, u32)> =
            (0..20_000).map(|i| (0x1000 + i * 4, i, i as u32)).collect();
        let path = record(&dir, &frames);
        let mut reader = RawTraceReader::open(&path, &bank()).unwrap();
        let mut collector = Collector::default();
        reader
            .scan(&mut collector, &mut CancelAfterFirst { calls: 0 })
            .unwrap();
        assert!(!collector.snapshots.is_empty());
        assert!(collector.snapshots.len() < 20_000);
    }
}
