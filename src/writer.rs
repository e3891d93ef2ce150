//! Live capture: trace writers and the shared trace sink.
//!
//! One [`TraceWriter`] exists per recorded execution flow (thread or
//! interrupt handler) and may be driven from its own native thread. Writers
//! delta-encode register snapshots into pooled 64 KiB blocks; full blocks are
//! handed to the [`TraceSink`], which owns the output stream and a single
//! background thread performing the blocking I/O.
//!
//! Failure semantics: the first failed physical write flips a sticky flag and
//! is logged once; every later frame is dropped silently. Recording never
//! interrupts the traced program.

use crate::cpu::RegisterBank;
use crate::error::TraceResult;
use crate::format::{self, BlockHeader, BLOCK_HEADER_SIZE};
use crate::TraceFrameId;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

/// Size of one pooled write block
const BLOCK_SIZE: usize = 64 * 1024;
/// A block is handed off once less than this much room remains
const GUARD_AREA_SIZE: usize = 4 * 1024;
/// Bound of the block queue between writers and the I/O thread
const WRITE_QUEUE_DEPTH: usize = 256;
/// Flush re-check interval while waiting for pending writes to drain
const FLUSH_POLL: std::time::Duration = std::time::Duration::from_micros(50);

/// State shared between the sink, its writers and the I/O thread.
struct SinkShared {
    bank: RegisterBank,
    epoch: Instant,
    sequence: AtomicU64,
    paused: AtomicBool,
    write_failed: AtomicBool,
    pending: AtomicU64,
    /// Handoff queue; the lock also serializes senders
    queue: Mutex<Option<SyncSender<Vec<u8>>>>,
    /// Reusable write blocks
    pool: Mutex<Vec<Vec<u8>>>,
}

impl SinkShared {
    /// Grabs a pooled block or allocates a fresh one
    fn alloc_block(&self) -> Vec<u8> {
        let mut pool = self.pool.lock().unwrap();
        pool.pop().unwrap_or_else(|| Vec::with_capacity(BLOCK_SIZE))
    }

    fn recycle_block(&self, mut block: Vec<u8>) {
        block.clear();
        let mut pool = self.pool.lock().unwrap();
        pool.push(block);
    }

    /// Queues a finished block for the I/O thread.
    ///
    /// Blocks the caller when the queue is full; drops the data silently once
    /// the sink has failed or shut down.
    fn submit_block(&self, block: Vec<u8>) {
        if self.write_failed.load(Ordering::Relaxed) {
            self.recycle_block(block);
            return;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        let queue = self.queue.lock().unwrap();
        let Some(sender) = queue.as_ref() else {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return;
        };
        let mut block = block;
        loop {
            match sender.try_send(block) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    block = back;
                    std::thread::sleep(FLUSH_POLL);
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            }
        }
    }
}

/// Per-flow trace writer.
///
/// Created through [`TraceSink::create_writer`]; all methods are safe to call
/// from the flow's own thread while other writers record concurrently.
pub struct TraceWriter {
    writer_id: u32,
    thread_id: u32,
    name: String,
    shared: Arc<SinkShared>,
    detached: AtomicBool,
    state: Mutex<WriterState>,
}

struct WriterState {
    /// Previous full snapshot, the delta baseline
    prev: Vec<u8>,
    /// Current block, header space already reserved
    block: Vec<u8>,
    /// Scratch changed-register mask, reused across frames
    mask: Vec<u64>,
    frame_count: u32,
}

impl WriterState {
    fn begin_block(&mut self, mut block: Vec<u8>, writer_id: u32, thread_id: u32) -> Vec<u8> {
        block.clear();
        BlockHeader {
            writer_id,
            thread_id,
            frame_count: 0,
        }
        .write_to(&mut block)
        .expect("writing to a Vec cannot fail");
        self.frame_count = 0;
        std::mem::replace(&mut self.block, block)
    }
}

impl TraceWriter {
    /// Name the flow was created with ("Thread7", interrupt name, ...)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id the sink assigned to this writer
    pub fn writer_id(&self) -> u32 {
        self.writer_id
    }

    /// Records one executed instruction.
    ///
    /// `snapshot` must be one full register frame laid out per the sink's
    /// register bank. A zero `ip` marks a step that never executed and is
    /// dropped, as is everything recorded while paused or after detach.
    pub fn add_frame(&self, ip: u64, snapshot: &[u8]) {
        if ip == 0 || !self.accepting() {
            return;
        }
        let seq = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        let clock = self.shared.epoch.elapsed().as_nanos() as u64;

        let bank = &self.shared.bank;
        let num_regs = bank.num_registers();
        let mask_words = format::mask_words(num_regs);
        let mut state = self.state.lock().unwrap();

        // worst case: header + mask + every register changed
        let worst = 28 + mask_words * 8 + bank.frame_size() as usize;
        self.make_room(&mut state, worst);

        let buf = &mut state.block;
        buf.write_u32::<LittleEndian>(format::FRAME_MAGIC).unwrap();
        buf.write_u64::<LittleEndian>(seq).unwrap();
        buf.write_u64::<LittleEndian>(ip).unwrap();
        buf.write_u64::<LittleEndian>(clock).unwrap();

        // changed-register mask, then only the changed bytes in bank order
        state.mask.iter_mut().for_each(|w| *w = 0);
        for i in 0..num_regs {
            let offset = bank.data_offset(i) as usize;
            let size = bank.registers()[i].byte_size() as usize;
            if snapshot[offset..offset + size] != state.prev[offset..offset + size] {
                state.mask[i / 64] |= 1u64 << (i & 63);
            }
        }
        for w in 0..mask_words {
            let word = state.mask[w];
            state.block.write_u64::<LittleEndian>(word).unwrap();
        }
        for i in 0..num_regs {
            if state.mask[i / 64] & (1u64 << (i & 63)) == 0 {
                continue;
            }
            let offset = bank.data_offset(i) as usize;
            let size = bank.registers()[i].byte_size() as usize;
            state
                .block
                .extend_from_slice(&snapshot[offset..offset + size]);
            state.prev[offset..offset + size].copy_from_slice(&snapshot[offset..offset + size]);
        }
        state.frame_count += 1;
    }

    /// Records a memory write performed outside the CPU (DMA, host call).
    ///
    /// `text` is a short tag naming the source of the write; it is truncated
    /// to 255 bytes in the file.
    pub fn add_memory_write(&self, ip: u64, address: u64, data: &[u8], text: &str) {
        if !self.accepting() {
            return;
        }
        let seq = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        let text = &text.as_bytes()[..text.len().min(255)];

        let mut state = self.state.lock().unwrap();
        // magic 4 + seq 8 + ip 8 + address 8 + size 4 + text_len 1
        let worst = 33 + text.len() + data.len();
        self.make_room(&mut state, worst);

        let buf = &mut state.block;
        buf.write_u32::<LittleEndian>(format::MEM_WRITE_MAGIC).unwrap();
        buf.write_u64::<LittleEndian>(seq).unwrap();
        buf.write_u64::<LittleEndian>(ip).unwrap();
        buf.write_u64::<LittleEndian>(address).unwrap();
        buf.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        buf.write_u8(text.len() as u8).unwrap();
        buf.extend_from_slice(text);
        buf.extend_from_slice(data);
        state.frame_count += 1;
    }

    /// Force-emits the current partial block to the sink.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        self.emit_block(&mut state);
    }

    /// Flushes, then severs the writer from the sink.
    ///
    /// Any later `add_frame`/`add_memory_write` call is silently ignored.
    pub fn detach(&self) {
        self.flush();
        self.detached.store(true, Ordering::Release);
    }

    fn accepting(&self) -> bool {
        !self.detached.load(Ordering::Acquire)
            && !self.shared.paused.load(Ordering::Relaxed)
            && !self.shared.write_failed.load(Ordering::Relaxed)
    }

    /// Hands the block off early so the next record always fits.
    fn make_room(&self, state: &mut WriterState, record_size: usize) {
        if state.block.len() + record_size > BLOCK_SIZE - GUARD_AREA_SIZE {
            self.emit_block(state);
        }
    }

    fn emit_block(&self, state: &mut WriterState) {
        if state.frame_count == 0 {
            return;
        }
        let count = state.frame_count;
        let fresh = self.shared.alloc_block();
        let mut full = state.begin_block(fresh, self.writer_id, self.thread_id);
        LittleEndian::write_u32(&mut full[BLOCK_HEADER_SIZE - 4..BLOCK_HEADER_SIZE], count);
        self.shared.submit_block(full);
    }
}

/// Owner of the capture output stream.
///
/// Assigns globally ordered sequence numbers across all writers, pools write
/// blocks and drains them on a dedicated background thread.
pub struct TraceSink {
    shared: Arc<SinkShared>,
    writers: Mutex<Vec<Arc<TraceWriter>>>,
    next_writer_id: AtomicU32,
    io_thread: Option<JoinHandle<()>>,
}

impl TraceSink {
    /// Creates a sink over `output` and records the self-describing header.
    ///
    /// The header (platform, CPU, ordered register descriptors) is written
    /// synchronously so any reader can validate the stream; everything after
    /// it goes through the background thread.
    pub fn create<W>(bank: &RegisterBank, mut output: W) -> TraceResult<Self>
    where
        W: Write + Send + 'static,
    {
        format::write_file_header(&mut output, bank)?;
        log::info!(
            "trace: recording {} registers, {} bytes per full frame",
            bank.num_registers(),
            bank.frame_size()
        );

        let (sender, receiver) = std::sync::mpsc::sync_channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let shared = Arc::new(SinkShared {
            bank: bank.clone(),
            epoch: Instant::now(),
            sequence: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            write_failed: AtomicBool::new(false),
            pending: AtomicU64::new(0),
            queue: Mutex::new(Some(sender)),
            pool: Mutex::new(Vec::new()),
        });

        let thread_shared = Arc::clone(&shared);
        let io_thread = std::thread::Builder::new()
            .name("trace-writer".to_string())
            .spawn(move || Self::write_thread(thread_shared, output, receiver))?;

        Ok(Self {
            shared,
            writers: Mutex::new(Vec::new()),
            next_writer_id: AtomicU32::new(0),
            io_thread: Some(io_thread),
        })
    }

    fn write_thread(shared: Arc<SinkShared>, mut output: impl Write, receiver: Receiver<Vec<u8>>) {
        log::debug!("trace: write thread started");
        let mut written = 0u64;
        let mut next_report = 100u64 * 1024 * 1024;
        for block in receiver {
            if !shared.write_failed.load(Ordering::Relaxed) {
                if let Err(err) = output.write_all(&block) {
                    // sticky: report once, drop everything that follows
                    if !shared.write_failed.swap(true, Ordering::Relaxed) {
                        log::error!("trace: file write error ({err}), check for disk space");
                    }
                } else {
                    written += block.len() as u64;
                    if written >= next_report {
                        log::info!(
                            "trace: written {:.2} MB ({} steps)",
                            written as f64 / (1024.0 * 1024.0),
                            shared.sequence.load(Ordering::Relaxed)
                        );
                        next_report += 100 * 1024 * 1024;
                    }
                }
            }
            shared.recycle_block(block);
            shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
        log::debug!("trace: write thread finished, {written} bytes on disk");
    }

    /// Creates a writer for an emulated thread.
    pub fn create_writer(&self, thread_id: u32) -> Arc<TraceWriter> {
        self.new_writer(thread_id, format!("Thread{thread_id}"))
    }

    /// Creates a writer for short out-of-band code (interrupt handler, APC).
    pub fn create_interrupt_writer(&self, name: &str) -> Arc<TraceWriter> {
        self.new_writer(0, name.to_string())
    }

    fn new_writer(&self, thread_id: u32, name: String) -> Arc<TraceWriter> {
        let writer_id = self.next_writer_id.fetch_add(1, Ordering::Relaxed);
        let mut state = WriterState {
            prev: vec![0; self.shared.bank.frame_size() as usize],
            block: Vec::new(),
            mask: vec![0; format::mask_words(self.shared.bank.num_registers())],
            frame_count: 0,
        };
        let fresh = self.shared.alloc_block();
        state.begin_block(fresh, writer_id, thread_id);
        let writer = Arc::new(TraceWriter {
            writer_id,
            thread_id,
            name,
            shared: Arc::clone(&self.shared),
            detached: AtomicBool::new(false),
            state: Mutex::new(state),
        });
        self.writers.lock().unwrap().push(Arc::clone(&writer));
        writer
    }

    /// Stops accepting new frames; in-flight blocks still drain.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
    }

    /// Resumes accepting frames after a [`pause`](Self::pause).
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
    }

    /// Whether frame recording is currently paused
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    /// Whether a physical write has failed; the condition is sticky
    pub fn has_failed(&self) -> bool {
        self.shared.write_failed.load(Ordering::Relaxed)
    }

    /// Next sequence number the sink would assign, i.e. steps recorded so far
    pub fn steps_recorded(&self) -> TraceFrameId {
        self.shared.sequence.load(Ordering::Relaxed)
    }

    /// Flushes every live writer and blocks until all handed-off blocks hit
    /// the output stream.
    ///
    /// The wait re-checks the pending counter instead of a single
    /// wait/notify round-trip, tolerating missed wakeups.
    pub fn flush(&self) {
        let writers = self.writers.lock().unwrap();
        for writer in writers.iter() {
            writer.flush();
        }
        drop(writers);
        while self.shared.pending.load(Ordering::Acquire) != 0 {
            std::thread::sleep(FLUSH_POLL);
        }
    }

    fn detach_writers(&self) {
        let mut writers = self.writers.lock().unwrap();
        for writer in writers.iter() {
            writer.detach();
        }
        writers.clear();
    }
}

impl Drop for TraceSink {
    fn drop(&mut self) {
        self.detach_writers();
        self.flush();
        // closing the channel stops the I/O thread
        self.shared.queue.lock().unwrap().take();
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
        log::info!("trace: recorded {} steps", self.steps_recorded());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::RegisterInfo;

    /// Write sink backed by a shared Vec, so tests can inspect the output
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Write sink that fails after a given number of bytes
    struct FailingSink {
        room: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if buf.len() > self.room {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            self.room -= buf.len();
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

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

    #[test]
    fn sequence_numbers_are_a_permutation_across_writers() {
        let buffer = SharedBuffer::default();
        let sink = TraceSink::create(&bank(), buffer).unwrap();
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let writer = sink.create_writer(10 + t);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        writer.add_frame(0x1000 + i * 4, &frame(i, i as u32));
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
        sink.flush();
        assert_eq!(sink.steps_recorded(), 2000);
        assert!(!sink.has_failed());
    }

    #[test]
    fn zero_ip_frames_are_dropped() {
        let buffer = SharedBuffer::default();
        let sink = TraceSink::create(&bank(), buffer).unwrap();
        let writer = sink.create_writer(2);
        writer.add_frame(0, &frame(1, 1));
        writer.add_frame(0x1000, &frame(1, 1));
        assert_eq!(sink.steps_recorded(), 1);
    }

    #[test]
    fn paused_sink_accepts_nothing() {
        let buffer = SharedBuffer::default();
        let sink = TraceSink::create(&bank(), buffer).unwrap();
        let writer = sink.create_writer(2);
        sink.pause();
        writer.add_frame(0x1000, &frame(1, 1));
        writer.add_memory_write(0x1000, 0x2000, &[0xFF], "dma");
        sink.resume();
        writer.add_frame(0x1004, &frame(1, 1));
        assert_eq!(sink.steps_recorded(), 1);
    }

    #[test]
    fn detached_writer_is_silently_ignored() {
        let buffer = SharedBuffer::default();
        let sink = TraceSink::create(&bank(), buffer).unwrap();
        let writer = sink.create_writer(2);
        writer.add_frame(0x1000, &frame(1, 1));
        writer.detach();
        writer.add_frame(0x1004, &frame(2, 2));
        assert_eq!(sink.steps_recorded(), 1);
    }

    #[test]
    fn write_failure_is_sticky_and_silent() {
        // room for the header only; the first block write must fail
        let sink = TraceSink::create(&bank(), FailingSink { room: 200 }).unwrap();
        let writer = sink.create_writer(2);
        for i in 0..10_000u64 {
            writer.add_frame(0x1000 + i * 4, &frame(i, 0));
        }
        sink.flush();
        assert!(sink.has_failed());
        // still no panic, further frames just vanish
        writer.add_frame(0x5000, &frame(1, 1));
        sink.flush();
    }
}
