//! Indexed trace file: the random-access query side of the subsystem.
//!
//! A [`DataFile`] holds the arrays a [`DataBuilder`](crate::builder::DataBuilder)
//! produced and answers frame, navigation, call-tree and page queries on top
//! of them. It also round-trips those arrays through a chunked on-disk format
//! so an indexed trace only has to be built once.
//!
//! Frame reconstruction follows the base links the builder laid down: a delta
//! is applied on top of its reconstructed base frame, recursively, with a
//! memoized frame cache keeping repeated queries over the same region cheap.

use crate::builder::{DataBuilder, IndexData};
use crate::cpu::{InstructionClassifier, RegisterBank, RegisterInfo};
use crate::error::{TraceError, TraceResult};
use crate::raw_reader::RawTraceReader;
use crate::{TaskObserver, TraceFrameId, INVALID_TRACE_FRAME_ID};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Magic of an indexed trace file, "XTRC"
pub const DATA_FILE_MAGIC: u32 = 0x4352_5458;
/// Current on-disk format version
pub const DATA_FILE_VERSION: u32 = 1;

/// Addresses covered by one code or memory trace page
pub const PAGE_ADDRESSES: usize = 4096;

/// Fixed size of the context name field on disk
const CONTEXT_NAME_SIZE: usize = 32;

/// Reconstructed frames kept before the cache is dropped wholesale
const FRAME_CACHE_LIMIT: usize = 1 << 20;

const CHUNK_CONTEXTS: u32 = 1;
const CHUNK_ENTRIES: u32 = 2;
const CHUNK_BLOB: u32 = 3;
const CHUNK_CALL_FRAMES: u32 = 4;
const CHUNK_CODE_PAGES: u32 = 5;
const CHUNK_MEMORY_PAGES: u32 = 6;

/// A position inside the trace, in both global and per-context terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationInfo {
    /// Global sequence number
    pub seq: TraceFrameId,
    /// Context the step belongs to
    pub context_id: u32,
    /// Step index within that context
    pub context_seq: u32,
    /// Instruction pointer
    pub ip: u64,
    /// Capture clock value
    pub time: u64,
}

impl LocationInfo {
    /// A location that points nowhere, used for never-reached positions
    pub fn unset() -> Self {
        Self {
            seq: INVALID_TRACE_FRAME_ID,
            context_id: 0,
            context_seq: 0,
            ip: 0,
            time: 0,
        }
    }

    /// True when the location refers to an actual step
    pub fn is_set(&self) -> bool {
        self.seq != INVALID_TRACE_FRAME_ID
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.seq)?;
        writer.write_u32::<LittleEndian>(self.context_id)?;
        writer.write_u32::<LittleEndian>(self.context_seq)?;
        writer.write_u64::<LittleEndian>(self.ip)?;
        writer.write_u64::<LittleEndian>(self.time)
    }

    fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            seq: reader.read_u64::<LittleEndian>()?,
            context_id: reader.read_u32::<LittleEndian>()?,
            context_seq: reader.read_u32::<LittleEndian>()?,
            ip: reader.read_u64::<LittleEndian>()?,
            time: reader.read_u64::<LittleEndian>()?,
        })
    }
}

impl Default for LocationInfo {
    fn default() -> Self {
        Self::unset()
    }
}

/// What kind of execution context a writer recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextType {
    /// Interrupt handler, thread id 0
    Irq,
    /// Asynchronous procedure call, thread id 1
    Apc,
    /// Regular emulated thread
    #[default]
    Thread,
}

impl ContextType {
    /// Thread ids 0 and 1 are reserved for non-thread contexts
    pub fn from_thread_id(thread_id: u32) -> Self {
        match thread_id {
            0 => Self::Irq,
            1 => Self::Apc,
            _ => Self::Thread,
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            Self::Irq => 0,
            Self::Apc => 1,
            Self::Thread => 2,
        }
    }

    fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Irq,
            1 => Self::Apc,
            _ => Self::Thread,
        }
    }
}

/// One recorded execution context.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Kind of context, derived from the thread id
    pub context_type: ContextType,
    /// Context id, equal to the capture-side writer id
    pub id: u32,
    /// Emulated thread id
    pub thread_id: u32,
    /// Display name, "Thread{id}", "IRQ" or "APC"
    pub name: String,
    /// First recorded step
    pub first: LocationInfo,
    /// Last recorded step; its context_seq holds the step count
    pub last: LocationInfo,
    /// Root of the context's call tree, 0 when the context never ran
    pub root_call_frame: u32,
    /// First entry of this context's slice of the code page array
    pub first_code_page: u32,
    /// Number of code pages belonging to this context
    pub num_code_pages: u32,
}

impl Context {
    /// Number of steps recorded in this context
    pub fn num_frames(&self) -> u32 {
        self.last.context_seq
    }
}

/// What a trace entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    /// Sequence number was never assigned a record (gap)
    #[default]
    Invalid,
    /// One emulated CPU instruction
    CpuInstruction,
    /// A write into emulated memory from outside the CPU
    ExternalMemoryWrite,
}

impl FrameKind {
    fn to_u8(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::CpuInstruction => 1,
            Self::ExternalMemoryWrite => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::CpuInstruction,
            2 => Self::ExternalMemoryWrite,
            _ => Self::Invalid,
        }
    }
}

/// Index record of one trace step.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    /// Frame this entry's delta is applied on, or invalid for a zero baseline
    pub base: TraceFrameId,
    /// What the entry describes
    pub kind: FrameKind,
    /// Owning context
    pub context: u32,
    /// Payload position in the blob
    pub offset: u64,
    /// Previous step of the same context
    pub prev_in_context: TraceFrameId,
    /// Next step of the same context
    pub next_in_context: TraceFrameId,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            base: INVALID_TRACE_FRAME_ID,
            kind: FrameKind::Invalid,
            context: 0,
            offset: 0,
            prev_in_context: INVALID_TRACE_FRAME_ID,
            next_in_context: INVALID_TRACE_FRAME_ID,
        }
    }
}

/// One function activation in a context's call tree.
///
/// Frames form a tree per context through `parent`, `first_child` and
/// `next_sibling`, all indices into the call frame arena where 0 is the
/// reserved null frame. A frame whose `leave` is unset never returned.
#[derive(Debug, Clone, Default)]
pub struct CallFrame {
    /// Address of the called function's first instruction, 0 when unknown
    pub function_start: u64,
    /// Location of the call
    pub enter: LocationInfo,
    /// Location of the matching return
    pub leave: LocationInfo,
    /// Enclosing activation
    pub parent: u32,
    /// First call made from this activation
    pub first_child: u32,
    /// Next call made from the same parent
    pub next_sibling: u32,
}

impl CallFrame {
    /// True when `seq` executed inside this activation
    pub fn contains(&self, seq: TraceFrameId) -> bool {
        self.enter.seq <= seq && (!self.leave.is_set() || seq <= self.leave.seq)
    }
}

/// Per-address execution lists of one 4 KiB code range of one context.
#[derive(Debug, Clone)]
pub struct CodeTracePage {
    /// First address the page covers
    pub base_address: u64,
    /// Context the executions belong to
    pub context_id: u32,
    /// Blob offset of each address's execution list, 0 = never executed
    pub offsets: Vec<u64>,
}

/// Per-byte external write lists of one 4 KiB memory range, all contexts.
#[derive(Debug, Clone)]
pub struct MemoryTracePage {
    /// First address the page covers
    pub base_address: u64,
    /// Blob offset of each byte's write list, 0 = never written
    pub offsets: Vec<u64>,
}

/// Payload of a reconstructed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// The sequence number carries no record
    Empty,
    /// Full register snapshot after the instruction, bank layout
    Registers(Vec<u8>),
    /// Descriptor of an external memory write
    MemoryWrite {
        /// First written address
        address: u64,
        /// Short description of the writing device
        text: String,
        /// Written bytes
        data: Vec<u8>,
    },
}

/// One fully reconstructed trace step.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Global sequence number, invalid for the empty sentinel
    pub seq: TraceFrameId,
    /// Owning context
    pub context_id: u32,
    /// Step index within the context
    pub context_seq: u32,
    /// Instruction pointer
    pub ip: u64,
    /// Capture clock value
    pub time: u64,
    /// Reconstructed content
    pub payload: FramePayload,
}

impl Frame {
    /// The sentinel returned for out-of-range or unassigned sequence numbers
    pub fn empty() -> Self {
        Self {
            seq: INVALID_TRACE_FRAME_ID,
            context_id: 0,
            context_seq: 0,
            ip: 0,
            time: 0,
            payload: FramePayload::Empty,
        }
    }

    /// True for the empty sentinel
    pub fn is_empty(&self) -> bool {
        matches!(self.payload, FramePayload::Empty)
    }

    /// Register snapshot bytes, when the frame is a CPU instruction
    pub fn registers(&self) -> Option<&[u8]> {
        match &self.payload {
            FramePayload::Registers(data) => Some(data),
            _ => None,
        }
    }
}

/// Execution counts of one page address split around a pivot step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressHits {
    /// Executions before the pivot, within the queried window
    pub before: u32,
    /// Executions at or after the pivot, within the queried window
    pub after: u32,
}

/// Nearest executions of one page address around a pivot step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSlice {
    /// Last execution before the pivot, invalid when none
    pub before: TraceFrameId,
    /// First execution at or after the pivot, invalid when none
    pub after: TraceFrameId,
}

impl Default for AddressSlice {
    fn default() -> Self {
        Self {
            before: INVALID_TRACE_FRAME_ID,
            after: INVALID_TRACE_FRAME_ID,
        }
    }
}

/// An indexed trace, in memory.
pub struct DataFile {
    bank: RegisterBank,
    contexts: Vec<Context>,
    entries: Vec<Entry>,
    blob: Vec<u8>,
    call_frames: Vec<CallFrame>,
    code_pages: Vec<CodeTracePage>,
    memory_pages: Vec<MemoryTracePage>,
    cache: HashMap<TraceFrameId, Frame>,
}

impl DataFile {
    /// Indexes a raw capture in one pass.
    pub fn build(
        reader: &mut RawTraceReader,
        classifier: &dyn InstructionClassifier,
        observer: &mut dyn TaskObserver,
    ) -> TraceResult<Self> {
        let bank = reader.bank().clone();
        let mut builder = DataBuilder::new(&bank, classifier);
        reader.scan(&mut builder, observer)?;
        Ok(Self::from_index(bank, builder.finish()))
    }

    pub(crate) fn from_index(bank: RegisterBank, data: IndexData) -> Self {
        Self {
            bank,
            contexts: data.contexts,
            entries: data.entries,
            blob: data.blob,
            call_frames: data.call_frames,
            code_pages: data.code_pages,
            memory_pages: data.memory_pages,
            cache: HashMap::new(),
        }
    }

    /// Register bank layout the frames decode with
    pub fn bank(&self) -> &RegisterBank {
        &self.bank
    }

    /// All contexts, indexed by context id; gaps are default records
    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// One context by id
    pub fn context(&self, id: u32) -> Option<&Context> {
        self.contexts.get(id as usize)
    }

    /// Number of sequence numbers the trace spans
    pub fn num_entries(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Index record of one step
    pub fn entry(&self, seq: TraceFrameId) -> Option<&Entry> {
        self.entries.get(seq as usize)
    }

    /// The call frame arena, index 0 is the null frame
    pub fn call_frames(&self) -> &[CallFrame] {
        &self.call_frames
    }

    /// All memory trace pages, sorted by base address
    pub fn memory_pages(&self) -> &[MemoryTracePage] {
        &self.memory_pages
    }

    // ---- frame reconstruction ------------------------------------------

    /// Reconstructs the step at `seq`.
    ///
    /// Out-of-range and unassigned sequence numbers yield the empty
    /// sentinel rather than an error, so navigation code never has to
    /// special-case the ends of the trace.
    pub fn frame(&mut self, seq: TraceFrameId) -> Frame {
        if seq as usize >= self.entries.len() {
            return Frame::empty();
        }
        if let Some(cached) = self.cache.get(&seq) {
            return cached.clone();
        }
        let frame = match self.compile_frame(seq) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("trace: failed to reconstruct frame {seq}: {err}");
                Frame::empty()
            }
        };
        self.manage_cache();
        self.cache.insert(seq, frame.clone());
        frame
    }

    /// Drops the whole cache once it grows past the limit
    fn manage_cache(&mut self) {
        if self.cache.len() >= FRAME_CACHE_LIMIT {
            log::debug!("trace: frame cache limit reached, purging");
            self.cache.clear();
        }
    }

    /// Drops all memoized frames
    pub fn purge_cache(&mut self) {
        self.cache.clear();
    }

    fn compile_frame(&mut self, seq: TraceFrameId) -> TraceResult<Frame> {
        let entry = self.entries[seq as usize];
        match entry.kind {
            FrameKind::Invalid => Ok(Frame::empty()),
            FrameKind::CpuInstruction => {
                // base first, then the delta on top
                let mut data = if entry.base != INVALID_TRACE_FRAME_ID {
                    match self.frame(entry.base).registers() {
                        Some(registers) => registers.to_vec(),
                        None => return Err(TraceError::Truncated(entry.offset)),
                    }
                } else {
                    vec![0u8; self.bank.frame_size() as usize]
                };
                let mut cursor = self.blob_at(entry.offset)?;
                let local_seq = cursor.read_u32::<LittleEndian>()?;
                let ip = cursor.read_u64::<LittleEndian>()?;
                let time = cursor.read_u64::<LittleEndian>()?;
                let count = cursor.read_u16::<LittleEndian>()?;
                for _ in 0..count {
                    let index = cursor.read_u16::<LittleEndian>()? as usize;
                    if index >= self.bank.num_registers() {
                        return Err(TraceError::Truncated(entry.offset));
                    }
                    let offset = self.bank.data_offset(index) as usize;
                    let size = self.bank.registers()[index].byte_size() as usize;
                    cursor.read_exact(&mut data[offset..offset + size])?;
                }
                Ok(Frame {
                    seq,
                    context_id: entry.context,
                    context_seq: local_seq,
                    ip,
                    time,
                    payload: FramePayload::Registers(data),
                })
            }
            FrameKind::ExternalMemoryWrite => {
                let mut cursor = self.blob_at(entry.offset)?;
                let local_seq = cursor.read_u32::<LittleEndian>()?;
                let ip = cursor.read_u64::<LittleEndian>()?;
                let time = cursor.read_u64::<LittleEndian>()?;
                let address = cursor.read_u64::<LittleEndian>()?;
                let size = cursor.read_u32::<LittleEndian>()? as usize;
                let text_len = cursor.read_u8()? as usize;
                let mut text = vec![0u8; text_len];
                cursor.read_exact(&mut text)?;
                let mut data = vec![0u8; size];
                cursor.read_exact(&mut data)?;
                Ok(Frame {
                    seq,
                    context_id: entry.context,
                    context_seq: local_seq,
                    ip,
                    time,
                    payload: FramePayload::MemoryWrite {
                        address,
                        text: String::from_utf8_lossy(&text).into_owned(),
                        data,
                    },
                })
            }
        }
    }

    fn blob_at(&self, offset: u64) -> TraceResult<&[u8]> {
        if offset == 0 {
            return Err(TraceError::Truncated(0));
        }
        self.blob
            .get(offset as usize..)
            .ok_or(TraceError::Truncated(offset))
    }

    // ---- navigation ----------------------------------------------------

    /// Next step of the same context, invalid at the end
    pub fn next_in_context(&self, seq: TraceFrameId) -> TraceFrameId {
        self.entries
            .get(seq as usize)
            .map(|e| e.next_in_context)
            .unwrap_or(INVALID_TRACE_FRAME_ID)
    }

    /// Previous step of the same context, invalid at the start
    pub fn prev_in_context(&self, seq: TraceFrameId) -> TraceFrameId {
        self.entries
            .get(seq as usize)
            .map(|e| e.prev_in_context)
            .unwrap_or(INVALID_TRACE_FRAME_ID)
    }

    /// Walks forwards from `start` until `matches` accepts a frame.
    ///
    /// Progress is reported in context-local steps. Returns the matching
    /// sequence number, or invalid when the context ends or the observer
    /// cancels first.
    pub fn visit_forwards<F>(
        &mut self,
        start: TraceFrameId,
        matches: F,
        observer: &mut dyn TaskObserver,
    ) -> TraceFrameId
    where
        F: FnMut(&Frame) -> bool,
    {
        self.visit(start, matches, observer, |file, seq| {
            file.next_in_context(seq)
        })
    }

    /// Walks backwards from `start` until `matches` accepts a frame.
    pub fn visit_backwards<F>(
        &mut self,
        start: TraceFrameId,
        matches: F,
        observer: &mut dyn TaskObserver,
    ) -> TraceFrameId
    where
        F: FnMut(&Frame) -> bool,
    {
        self.visit(start, matches, observer, |file, seq| {
            file.prev_in_context(seq)
        })
    }

    fn visit<F, S>(
        &mut self,
        start: TraceFrameId,
        mut matches: F,
        observer: &mut dyn TaskObserver,
        step: S,
    ) -> TraceFrameId
    where
        F: FnMut(&Frame) -> bool,
        S: Fn(&Self, TraceFrameId) -> TraceFrameId,
    {
        let total = self
            .entries
            .get(start as usize)
            .and_then(|e| self.contexts.get(e.context as usize))
            .map(|c| c.num_frames() as u64)
            .unwrap_or(0);
        let mut seq = start;
        while seq != INVALID_TRACE_FRAME_ID {
            if observer.is_cancelled() {
                return INVALID_TRACE_FRAME_ID;
            }
            let frame = self.frame(seq);
            if frame.is_empty() {
                return INVALID_TRACE_FRAME_ID;
            }
            observer.progress(frame.context_seq as u64, total);
            if matches(&frame) {
                return seq;
            }
            seq = step(self, seq);
        }
        INVALID_TRACE_FRAME_ID
    }

    // ---- call tree -----------------------------------------------------

    /// Finds the innermost function activation covering `seq`.
    pub fn innermost_call(&self, seq: TraceFrameId) -> TraceResult<&CallFrame> {
        let entry = self
            .entries
            .get(seq as usize)
            .filter(|e| e.kind != FrameKind::Invalid)
            .ok_or(TraceError::NoCallData(0))?;
        let context = self
            .contexts
            .get(entry.context as usize)
            .filter(|c| c.root_call_frame != 0)
            .ok_or(TraceError::NoCallData(entry.context))?;

        // descend into whichever child wraps the step, stop when none does
        let mut current = context.root_call_frame;
        loop {
            let mut child = self.call_frames[current as usize].first_child;
            let mut descended = false;
            while child != 0 {
                let frame = &self.call_frames[child as usize];
                if frame.contains(seq) {
                    current = child;
                    descended = true;
                    break;
                }
                child = frame.next_sibling;
            }
            if !descended {
                return Ok(&self.call_frames[current as usize]);
            }
        }
    }

    // ---- trace pages ---------------------------------------------------

    /// Code page of `context_id` covering `address`, when code there ran
    pub fn code_trace_page(&self, context_id: u32, address: u64) -> Option<&CodeTracePage> {
        let context = self.contexts.get(context_id as usize)?;
        let base = address & !(PAGE_ADDRESSES as u64 - 1);
        let first = context.first_code_page as usize;
        let count = context.num_code_pages as usize;
        self.code_pages
            .get(first..first + count)?
            .iter()
            .find(|page| page.base_address == base)
    }

    /// Code page covering the instruction recorded at `seq`
    pub fn code_trace_page_for(&mut self, seq: TraceFrameId) -> Option<&CodeTracePage> {
        let frame = self.frame(seq);
        if frame.is_empty() {
            return None;
        }
        self.code_trace_page(frame.context_id, frame.ip)
    }

    fn read_seq_list(&self, offset: u64) -> TraceResult<Vec<TraceFrameId>> {
        if offset == 0 {
            return Ok(Vec::new());
        }
        let mut cursor = self.blob_at(offset)?;
        let count = cursor.read_u32::<LittleEndian>()?;
        let mut list = Vec::with_capacity(count as usize);
        for _ in 0..count {
            list.push(cursor.read_u64::<LittleEndian>()?);
        }
        Ok(list)
    }

    pub(crate) fn read_memory_list(&self, offset: u64) -> TraceResult<Vec<(TraceFrameId, u8)>> {
        if offset == 0 {
            return Ok(Vec::new());
        }
        let mut cursor = self.blob_at(offset)?;
        let count = cursor.read_u32::<LittleEndian>()?;
        let mut list = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let seq = cursor.read_u64::<LittleEndian>()?;
            let value = cursor.read_u8()?;
            list.push((seq, value));
        }
        Ok(list)
    }

    /// Memory page covering `address`, when anything there was written
    pub(crate) fn memory_page(&self, address: u64) -> Option<&MemoryTracePage> {
        let base = address & !(PAGE_ADDRESSES as u64 - 1);
        self.memory_pages
            .binary_search_by_key(&base, |page| page.base_address)
            .ok()
            .map(|index| &self.memory_pages[index])
    }

    /// Per-address execution counts of one code page, split around `pivot`.
    ///
    /// Only executions within `[min_seq, max_seq]` are counted; a page that
    /// never executed yields all-zero counts.
    pub fn code_page_histogram(
        &self,
        context_id: u32,
        address: u64,
        pivot: TraceFrameId,
        min_seq: TraceFrameId,
        max_seq: TraceFrameId,
    ) -> TraceResult<Vec<AddressHits>> {
        let mut hits = vec![AddressHits::default(); PAGE_ADDRESSES];
        let page = match self.code_trace_page(context_id, address) {
            Some(page) => page,
            None => return Ok(hits),
        };
        for (index, &offset) in page.offsets.iter().enumerate() {
            for seq in self.read_seq_list(offset)? {
                if seq < min_seq || seq > max_seq {
                    continue;
                }
                if seq < pivot {
                    hits[index].before += 1;
                } else {
                    hits[index].after += 1;
                }
            }
        }
        Ok(hits)
    }

    /// Per-address nearest executions of one code page around `pivot`.
    pub fn code_page_slice(
        &self,
        context_id: u32,
        address: u64,
        pivot: TraceFrameId,
        min_seq: TraceFrameId,
        max_seq: TraceFrameId,
    ) -> TraceResult<Vec<AddressSlice>> {
        let mut slices = vec![AddressSlice::default(); PAGE_ADDRESSES];
        let page = match self.code_trace_page(context_id, address) {
            Some(page) => page,
            None => return Ok(slices),
        };
        for (index, &offset) in page.offsets.iter().enumerate() {
            let slice = &mut slices[index];
            for seq in self.read_seq_list(offset)? {
                if seq < min_seq || seq > max_seq {
                    continue;
                }
                if seq < pivot {
                    if slice.before == INVALID_TRACE_FRAME_ID || seq > slice.before {
                        slice.before = seq;
                    }
                } else if slice.after == INVALID_TRACE_FRAME_ID || seq < slice.after {
                    slice.after = seq;
                }
            }
        }
        Ok(slices)
    }

    // ---- persistence ---------------------------------------------------

    /// Saves the indexed trace to `path`.
    pub fn save(&self, path: &Path) -> TraceResult<()> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_u32::<LittleEndian>(DATA_FILE_MAGIC)?;
        file.write_u32::<LittleEndian>(DATA_FILE_VERSION)?;
        crate::format::write_name_field(&mut file, self.bank.platform_name())?;
        crate::format::write_name_field(&mut file, self.bank.cpu_name())?;
        file.write_u32::<LittleEndian>(self.bank.num_registers() as u32)?;
        for register in self.bank.registers() {
            crate::format::write_name_field(&mut file, &register.name)?;
            file.write_u32::<LittleEndian>(register.byte_size())?;
        }

        self.write_chunk(&mut file, CHUNK_CONTEXTS, |payload| {
            payload.write_u32::<LittleEndian>(self.contexts.len() as u32)?;
            for context in &self.contexts {
                if context.name.len() >= CONTEXT_NAME_SIZE {
                    return Err(TraceError::NameTooLong(context.name.clone()));
                }
                payload.write_u32::<LittleEndian>(context.context_type.to_u32())?;
                payload.write_u32::<LittleEndian>(context.id)?;
                payload.write_u32::<LittleEndian>(context.thread_id)?;
                let mut name = [0u8; CONTEXT_NAME_SIZE];
                name[..context.name.len()].copy_from_slice(context.name.as_bytes());
                payload.write_all(&name)?;
                context.first.write_to(payload)?;
                context.last.write_to(payload)?;
                payload.write_u32::<LittleEndian>(context.root_call_frame)?;
                payload.write_u32::<LittleEndian>(context.first_code_page)?;
                payload.write_u32::<LittleEndian>(context.num_code_pages)?;
            }
            Ok(())
        })?;

        self.write_chunk(&mut file, CHUNK_ENTRIES, |payload| {
            payload.write_u32::<LittleEndian>(self.entries.len() as u32)?;
            for entry in &self.entries {
                payload.write_u64::<LittleEndian>(entry.base)?;
                payload.write_u8(entry.kind.to_u8())?;
                payload.write_u32::<LittleEndian>(entry.context)?;
                payload.write_u64::<LittleEndian>(entry.offset)?;
                payload.write_u64::<LittleEndian>(entry.prev_in_context)?;
                payload.write_u64::<LittleEndian>(entry.next_in_context)?;
            }
            Ok(())
        })?;

        self.write_chunk(&mut file, CHUNK_BLOB, |payload| {
            payload.extend_from_slice(&self.blob);
            Ok(())
        })?;

        self.write_chunk(&mut file, CHUNK_CALL_FRAMES, |payload| {
            payload.write_u32::<LittleEndian>(self.call_frames.len() as u32)?;
            for frame in &self.call_frames {
                payload.write_u64::<LittleEndian>(frame.function_start)?;
                frame.enter.write_to(payload)?;
                frame.leave.write_to(payload)?;
                payload.write_u32::<LittleEndian>(frame.parent)?;
                payload.write_u32::<LittleEndian>(frame.first_child)?;
                payload.write_u32::<LittleEndian>(frame.next_sibling)?;
            }
            Ok(())
        })?;

        self.write_chunk(&mut file, CHUNK_CODE_PAGES, |payload| {
            payload.write_u32::<LittleEndian>(self.code_pages.len() as u32)?;
            for page in &self.code_pages {
                payload.write_u64::<LittleEndian>(page.base_address)?;
                payload.write_u32::<LittleEndian>(page.context_id)?;
                for &offset in &page.offsets {
                    payload.write_u64::<LittleEndian>(offset)?;
                }
            }
            Ok(())
        })?;

        self.write_chunk(&mut file, CHUNK_MEMORY_PAGES, |payload| {
            payload.write_u32::<LittleEndian>(self.memory_pages.len() as u32)?;
            for page in &self.memory_pages {
                payload.write_u64::<LittleEndian>(page.base_address)?;
                for &offset in &page.offsets {
                    payload.write_u64::<LittleEndian>(offset)?;
                }
            }
            Ok(())
        })?;

        file.flush()?;
        Ok(())
    }

    fn write_chunk<W, F>(&self, file: &mut W, id: u32, fill: F) -> TraceResult<()>
    where
        W: Write,
        F: FnOnce(&mut Vec<u8>) -> TraceResult<()>,
    {
        let mut payload = Vec::new();
        fill(&mut payload)?;
        file.write_u32::<LittleEndian>(id)?;
        file.write_u64::<LittleEndian>(payload.len() as u64)?;
        file.write_all(&payload)?;
        Ok(())
    }

    /// Loads an indexed trace from `path`, validating it against `bank`.
    ///
    /// Chunks with an unrecognized id are skipped, so files written by a
    /// newer build with additional chunks still load.
    pub fn load(path: &Path, bank: &RegisterBank) -> TraceResult<Self> {
        let size = std::fs::metadata(path)?.len();
        let mut file = BufReader::new(File::open(path)?);
        let magic = file.read_u32::<LittleEndian>()?;
        if magic != DATA_FILE_MAGIC {
            return Err(TraceError::BadMagic(magic));
        }
        let version = file.read_u32::<LittleEndian>()?;
        if version != DATA_FILE_VERSION {
            return Err(TraceError::UnsupportedVersion(version));
        }
        let _platform = crate::format::read_name_field(&mut file)?;
        let _cpu = crate::format::read_name_field(&mut file)?;
        let num_registers = file.read_u32::<LittleEndian>()? as usize;
        if num_registers != bank.num_registers() {
            return Err(TraceError::RegisterMismatch {
                name: "<count>".to_string(),
                file_size: num_registers as u32,
                bank_size: bank.num_registers() as u32,
            });
        }
        for live in bank.registers() {
            let name = crate::format::read_name_field(&mut file)?;
            let byte_size = file.read_u32::<LittleEndian>()?;
            if name != live.name {
                return Err(TraceError::UnknownRegister(name));
            }
            if byte_size != live.byte_size() {
                return Err(TraceError::RegisterMismatch {
                    name,
                    file_size: byte_size,
                    bank_size: live.byte_size(),
                });
            }
        }

        let mut loaded = Self::from_index(
            bank.clone(),
            IndexData {
                contexts: Vec::new(),
                entries: Vec::new(),
                blob: vec![0],
                call_frames: Vec::new(),
                code_pages: Vec::new(),
                memory_pages: Vec::new(),
            },
        );

        let mut pos = file.stream_position()?;
        while pos < size {
            let id = file.read_u32::<LittleEndian>()?;
            let byte_len = file.read_u64::<LittleEndian>()?;
            match id {
                CHUNK_CONTEXTS => loaded.read_contexts_chunk(&mut file)?,
                CHUNK_ENTRIES => loaded.read_entries_chunk(&mut file)?,
                CHUNK_BLOB => {
                    let mut blob = vec![0u8; byte_len as usize];
                    file.read_exact(&mut blob)?;
                    loaded.blob = blob;
                }
                CHUNK_CALL_FRAMES => loaded.read_call_frames_chunk(&mut file)?,
                CHUNK_CODE_PAGES => loaded.read_code_pages_chunk(&mut file)?,
                CHUNK_MEMORY_PAGES => loaded.read_memory_pages_chunk(&mut file)?,
                unknown => {
                    log::debug!("trace: skipping unknown chunk {unknown:#x} ({byte_len} bytes)");
                    file.seek(SeekFrom::Current(byte_len as i64))?;
                }
            }
            // re-seek from the recorded length so short or over-long chunk
            // bodies cannot desynchronize the chunk walk
            pos = pos + 12 + byte_len;
            file.seek(SeekFrom::Start(pos))?;
        }

        loaded.validate_indices()?;
        log::info!(
            "trace: loaded indexed file with {} entries in {} contexts",
            loaded.entries.len(),
            loaded.contexts.len()
        );
        Ok(loaded)
    }

    /// Checks every cross-array reference of a freshly loaded file.
    ///
    /// Query paths index the arrays directly, so a corrupt file must be
    /// rejected here rather than panic later.
    fn validate_indices(&self) -> TraceResult<()> {
        let frames = self.call_frames.len();
        let pages = self.code_pages.len();
        for context in &self.contexts {
            if context.root_call_frame as usize >= frames.max(1) {
                return Err(TraceError::Corrupt("context root call frame out of range"));
            }
            let first = context.first_code_page as usize;
            let count = context.num_code_pages as usize;
            if count > 0 && first.saturating_add(count) > pages {
                return Err(TraceError::Corrupt("context code page range out of range"));
            }
        }
        for frame in &self.call_frames {
            if frame.parent as usize >= frames
                || frame.first_child as usize >= frames
                || frame.next_sibling as usize >= frames
            {
                return Err(TraceError::Corrupt("call frame link out of range"));
            }
        }
        let num_entries = self.entries.len() as u64;
        let blob = self.blob.len() as u64;
        for entry in &self.entries {
            for link in [entry.base, entry.prev_in_context, entry.next_in_context] {
                if link != INVALID_TRACE_FRAME_ID && link >= num_entries {
                    return Err(TraceError::Corrupt("entry link out of range"));
                }
            }
            if entry.kind != FrameKind::Invalid && (entry.offset == 0 || entry.offset >= blob) {
                return Err(TraceError::Corrupt("entry data offset out of range"));
            }
        }
        for offset in self
            .code_pages
            .iter()
            .flat_map(|p| p.offsets.iter())
            .chain(self.memory_pages.iter().flat_map(|p| p.offsets.iter()))
        {
            if *offset >= blob.max(1) {
                return Err(TraceError::Corrupt("page list offset out of range"));
            }
        }
        Ok(())
    }

    fn read_contexts_chunk<R: Read>(&mut self, file: &mut R) -> TraceResult<()> {
        let count = file.read_u32::<LittleEndian>()?;
        let mut contexts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let context_type = ContextType::from_u32(file.read_u32::<LittleEndian>()?);
            let id = file.read_u32::<LittleEndian>()?;
            let thread_id = file.read_u32::<LittleEndian>()?;
            let mut name = [0u8; CONTEXT_NAME_SIZE];
            file.read_exact(&mut name)?;
            let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
            contexts.push(Context {
                context_type,
                id,
                thread_id,
                name: String::from_utf8_lossy(&name[..len]).into_owned(),
                first: LocationInfo::read_from(file)?,
                last: LocationInfo::read_from(file)?,
                root_call_frame: file.read_u32::<LittleEndian>()?,
                first_code_page: file.read_u32::<LittleEndian>()?,
                num_code_pages: file.read_u32::<LittleEndian>()?,
            });
        }
        self.contexts = contexts;
        Ok(())
    }

    fn read_entries_chunk<R: Read>(&mut self, file: &mut R) -> TraceResult<()> {
        let count = file.read_u32::<LittleEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(Entry {
                base: file.read_u64::<LittleEndian>()?,
                kind: FrameKind::from_u8(file.read_u8()?),
                context: file.read_u32::<LittleEndian>()?,
                offset: file.read_u64::<LittleEndian>()?,
                prev_in_context: file.read_u64::<LittleEndian>()?,
                next_in_context: file.read_u64::<LittleEndian>()?,
            });
        }
        self.entries = entries;
        Ok(())
    }

    fn read_call_frames_chunk<R: Read>(&mut self, file: &mut R) -> TraceResult<()> {
        let count = file.read_u32::<LittleEndian>()?;
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            frames.push(CallFrame {
                function_start: file.read_u64::<LittleEndian>()?,
                enter: LocationInfo::read_from(file)?,
                leave: LocationInfo::read_from(file)?,
                parent: file.read_u32::<LittleEndian>()?,
                first_child: file.read_u32::<LittleEndian>()?,
                next_sibling: file.read_u32::<LittleEndian>()?,
            });
        }
        self.call_frames = frames;
        Ok(())
    }

    fn read_code_pages_chunk<R: Read>(&mut self, file: &mut R) -> TraceResult<()> {
        let count = file.read_u32::<LittleEndian>()?;
        let mut pages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let base_address = file.read_u64::<LittleEndian>()?;
            let context_id = file.read_u32::<LittleEndian>()?;
            let mut offsets = vec![0u64; PAGE_ADDRESSES];
            for offset in offsets.iter_mut() {
                *offset = file.read_u64::<LittleEndian>()?;
            }
            pages.push(CodeTracePage {
                base_address,
                context_id,
                offsets,
            });
        }
        self.code_pages = pages;
        Ok(())
    }

    fn read_memory_pages_chunk<R: Read>(&mut self, file: &mut R) -> TraceResult<()> {
        let count = file.read_u32::<LittleEndian>()?;
        let mut pages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let base_address = file.read_u64::<LittleEndian>()?;
            let mut offsets = vec![0u64; PAGE_ADDRESSES];
            for offset in offsets.iter_mut() {
                *offset = file.read_u64::<LittleEndian>()?;
            }
            pages.push(MemoryTracePage {
                base_address,
                offsets,
            });
        }
        self.memory_pages = pages;
        Ok(())
    }
}

/// Quick description of the register descriptors stored in an indexed file.
///
/// Lets a frontend show what a file was recorded with before committing to
/// a full load against a live bank.
pub fn peek_registers(path: &Path) -> TraceResult<Vec<RegisterInfo>> {
    let mut file = BufReader::new(File::open(path)?);
    let magic = file.read_u32::<LittleEndian>()?;
    if magic != DATA_FILE_MAGIC {
        return Err(TraceError::BadMagic(magic));
    }
    let version = file.read_u32::<LittleEndian>()?;
    if version != DATA_FILE_VERSION {
        return Err(TraceError::UnsupportedVersion(version));
    }
    let _platform = crate::format::read_name_field(&mut file)?;
    let _cpu = crate::format::read_name_field(&mut file)?;
    let count = file.read_u32::<LittleEndian>()?;
    let mut registers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = crate::format::read_name_field(&mut file)?;
        let byte_size = file.read_u32::<LittleEndian>()?;
        registers.push(RegisterInfo {
            name,
            bit_size: byte_size * 8,
        });
    }
    Ok(registers)
}
