//! Turns a raw event sequence into the indexed trace arrays.
//!
//! The builder is the raw reader's visitor. While frames stream through it,
//! it delta-compresses register data against a small hierarchy of reference
//! snapshots, links entries into per-context chains, grows the call tree
//! from the decoder's call/return classification and buckets instruction and
//! memory addresses into trace pages. `finish` flattens everything into the
//! arrays a [`DataFile`](crate::data_file::DataFile) serves queries from.

use crate::cpu::{ControlFlow, InstructionClassifier, RegisterBank};
use crate::data_file::{
    CallFrame, CodeTracePage, Context, ContextType, Entry, FrameKind, LocationInfo,
    MemoryTracePage, PAGE_ADDRESSES,
};
use crate::raw_reader::{RawFrame, RawPayload, RawTraceVisitor};
use crate::{TraceFrameId, INVALID_TRACE_FRAME_ID};
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::BTreeMap;

/// Local steps a reference of a given stack depth stays usable
const RETIRE_SPAN: [u32; 4] = [1024, 256, 64, 16];
/// Local steps after which a reference spawns a child reference
const DESCEND_SPAN: [u32; 4] = [64, 16, 4, u32::MAX];

/// Address mask selecting the page-local index
const PAGE_MASK: u64 = (PAGE_ADDRESSES as u64) - 1;

/// One snapshot frames are delta-encoded against.
struct DeltaReference {
    seq: TraceFrameId,
    data: Vec<u8>,
    descend_at: u32,
    retire_at: u32,
}

/// Per-context compression and call-tree state.
struct DeltaContext {
    local_seq: u32,
    prev_seq: TraceFrameId,
    /// Reference stack, deepest (shortest-lived) on top
    references: Vec<DeltaReference>,
    /// Call-frame stack, context root at the bottom
    call_stack: Vec<u32>,
    /// Call frame whose target was unknown; resolved from the next frame's ip
    pending_function_start: Option<u32>,
}

impl DeltaContext {
    fn new(root_frame: u32) -> Self {
        Self {
            local_seq: 0,
            prev_seq: INVALID_TRACE_FRAME_ID,
            references: Vec::new(),
            call_stack: vec![root_frame],
            pending_function_start: None,
        }
    }

    /// Drops references whose retirement horizon has passed
    fn retire_expired_references(&mut self) {
        while let Some(top) = self.references.last() {
            if self.local_seq < top.retire_at {
                break;
            }
            self.references.pop();
        }
    }
}

/// Accumulated per-address lists of one code or memory page.
struct PageAccumulator<T> {
    lists: Vec<Vec<T>>,
}

impl<T> PageAccumulator<T> {
    fn new() -> Self {
        let mut lists = Vec::with_capacity(PAGE_ADDRESSES);
        lists.resize_with(PAGE_ADDRESSES, Vec::new);
        Self { lists }
    }
}

/// The six arrays a finished build exports.
pub struct IndexData {
    /// Contexts indexed by writer id
    pub contexts: Vec<Context>,
    /// Entries indexed by sequence number
    pub entries: Vec<Entry>,
    /// Packed frame payloads and page lists, offset 0 reserved
    pub blob: Vec<u8>,
    /// Call-frame arena, index 0 reserved as the null frame
    pub call_frames: Vec<CallFrame>,
    /// Code trace pages, contiguous per context
    pub code_pages: Vec<CodeTracePage>,
    /// Memory trace pages, global, sorted by base address
    pub memory_pages: Vec<MemoryTracePage>,
}

/// Visitor that builds the indexed arrays from a raw scan.
pub struct DataBuilder<'a> {
    bank: RegisterBank,
    classifier: &'a dyn InstructionClassifier,
    contexts: Vec<Context>,
    entries: Vec<Entry>,
    blob: Vec<u8>,
    call_frames: Vec<CallFrame>,
    /// Last child of each call frame, for O(1) sibling linking
    last_child: Vec<u32>,
    delta: Vec<Option<DeltaContext>>,
    /// (context, page base) -> per-address executed-at lists
    code_pages: BTreeMap<(u32, u64), PageAccumulator<TraceFrameId>>,
    /// page base -> per-address (seq, value) write lists
    memory_pages: BTreeMap<u64, PageAccumulator<(TraceFrameId, u8)>>,
}

impl<'a> DataBuilder<'a> {
    /// Creates a builder for traces recorded with `bank`.
    pub fn new(bank: &RegisterBank, classifier: &'a dyn InstructionClassifier) -> Self {
        Self {
            bank: bank.clone(),
            classifier,
            contexts: Vec::new(),
            entries: Vec::new(),
            // blob offset 0 means "no data"
            blob: vec![0],
            call_frames: vec![CallFrame::default()],
            last_child: vec![0],
            delta: Vec::new(),
            code_pages: BTreeMap::new(),
            memory_pages: BTreeMap::new(),
        }
    }

    /// Flattens the accumulated state into the exported arrays.
    pub fn finish(mut self) -> IndexData {
        // page lists live in the blob; pages only hold per-address offsets
        let mut code_pages = Vec::new();
        for ((context_id, base_address), accumulator) in std::mem::take(&mut self.code_pages) {
            let mut page = CodeTracePage {
                base_address,
                context_id,
                offsets: vec![0; PAGE_ADDRESSES],
            };
            for (index, list) in accumulator.lists.iter().enumerate() {
                if list.is_empty() {
                    continue;
                }
                page.offsets[index] = self.blob.len() as u64;
                self.blob
                    .write_u32::<LittleEndian>(list.len() as u32)
                    .unwrap();
                for seq in list {
                    self.blob.write_u64::<LittleEndian>(*seq).unwrap();
                }
            }
            if let Some(context) = self.contexts.get_mut(context_id as usize) {
                if context.num_code_pages == 0 {
                    context.first_code_page = code_pages.len() as u32;
                }
                context.num_code_pages += 1;
            }
            code_pages.push(page);
        }

        let mut memory_pages = Vec::new();
        for (base_address, accumulator) in std::mem::take(&mut self.memory_pages) {
            let mut page = MemoryTracePage {
                base_address,
                offsets: vec![0; PAGE_ADDRESSES],
            };
            for (index, list) in accumulator.lists.iter().enumerate() {
                if list.is_empty() {
                    continue;
                }
                page.offsets[index] = self.blob.len() as u64;
                self.blob
                    .write_u32::<LittleEndian>(list.len() as u32)
                    .unwrap();
                for (seq, value) in list {
                    self.blob.write_u64::<LittleEndian>(*seq).unwrap();
                    self.blob.push(*value);
                }
            }
            memory_pages.push(page);
        }

        log::info!(
            "trace: built {} entries, {} contexts, {} call frames, {} code pages, {} memory pages, {} blob bytes",
            self.entries.len(),
            self.contexts.iter().filter(|c| c.first.seq != INVALID_TRACE_FRAME_ID).count(),
            self.call_frames.len() - 1,
            code_pages.len(),
            memory_pages.len(),
            self.blob.len()
        );

        IndexData {
            contexts: self.contexts,
            entries: self.entries,
            blob: self.blob,
            call_frames: self.call_frames,
            code_pages,
            memory_pages,
        }
    }

    fn alloc_context(&mut self, writer_id: u32) -> &mut Context {
        let index = writer_id as usize;
        if index >= self.contexts.len() {
            self.contexts.resize_with(index + 1, Context::default);
            self.delta.resize_with(index + 1, || None);
        }
        &mut self.contexts[index]
    }

    fn alloc_entry(&mut self, seq: TraceFrameId) -> &mut Entry {
        let index = seq as usize;
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, Entry::default);
        }
        &mut self.entries[index]
    }

    fn alloc_call_frame(&mut self, frame: CallFrame) -> u32 {
        let id = self.call_frames.len() as u32;
        self.call_frames.push(frame);
        self.last_child.push(0);
        id
    }

    /// Appends a child under `parent`, keeping sibling order
    fn link_child(&mut self, parent: u32, child: u32) {
        self.call_frames[child as usize].parent = parent;
        let last = self.last_child[parent as usize];
        if last == 0 {
            self.call_frames[parent as usize].first_child = child;
        } else {
            self.call_frames[last as usize].next_sibling = child;
        }
        self.last_child[parent as usize] = child;
    }

    /// Writes the delta payload for `snapshot` and returns the base frame id.
    ///
    /// The payload is `u16` register count followed by `u16` register index +
    /// raw bytes per changed register, compared against the top reference of
    /// the context's hierarchy (or a zero baseline when none is live).
    fn delta_compress(&mut self, writer_id: u32, seq: TraceFrameId, snapshot: &[u8]) -> TraceFrameId {
        let delta = self.delta[writer_id as usize]
            .as_mut()
            .expect("context started before frames arrive");
        delta.retire_expired_references();

        let (base_seq, reference) = match delta.references.last() {
            Some(top) => (top.seq, Some(top.data.as_slice())),
            None => (INVALID_TRACE_FRAME_ID, None),
        };

        // changed-register list against the reference (zeros when none)
        let mut changed = Vec::new();
        for i in 0..self.bank.num_registers() {
            let offset = self.bank.data_offset(i) as usize;
            let size = self.bank.registers()[i].byte_size() as usize;
            let current = &snapshot[offset..offset + size];
            let same = match reference {
                Some(data) => current == &data[offset..offset + size],
                None => current.iter().all(|&b| b == 0),
            };
            if !same {
                changed.push(i as u16);
            }
        }
        self.blob
            .write_u16::<LittleEndian>(changed.len() as u16)
            .unwrap();
        for &index in &changed {
            let offset = self.bank.data_offset(index as usize) as usize;
            let size = self.bank.registers()[index as usize].byte_size() as usize;
            self.blob.write_u16::<LittleEndian>(index).unwrap();
            self.blob.extend_from_slice(&snapshot[offset..offset + size]);
        }

        // descend: periodically capture a fresh reference so reconstruction
        // never replays more deltas than the hierarchy is deep
        let delta = self.delta[writer_id as usize].as_mut().unwrap();
        let depth = delta.references.len();
        let establish = match delta.references.last() {
            None => true,
            Some(top) => delta.local_seq >= top.descend_at && depth < RETIRE_SPAN.len(),
        };
        if establish {
            let local = delta.local_seq;
            let parent_retire = delta
                .references
                .last()
                .map(|r| r.retire_at)
                .unwrap_or(u32::MAX);
            delta.references.push(DeltaReference {
                seq,
                data: snapshot.to_vec(),
                descend_at: local.saturating_add(DESCEND_SPAN[depth]),
                retire_at: parent_retire.min(local.saturating_add(RETIRE_SPAN[depth])),
            });
        }
        base_seq
    }

    /// Writes the shared blob header of one entry, returns its offset.
    fn write_blob_header(&mut self, local_seq: u32, ip: u64, time: u64) -> u64 {
        let offset = self.blob.len() as u64;
        self.blob.write_u32::<LittleEndian>(local_seq).unwrap();
        self.blob.write_u64::<LittleEndian>(ip).unwrap();
        self.blob.write_u64::<LittleEndian>(time).unwrap();
        offset
    }

    fn link_entry(&mut self, writer_id: u32, seq: TraceFrameId, kind: FrameKind, offset: u64, base: TraceFrameId) {
        let prev_seq = {
            let delta = self.delta[writer_id as usize].as_mut().unwrap();
            let prev = delta.prev_seq;
            delta.prev_seq = seq;
            delta.local_seq += 1;
            prev
        };
        let entry = self.alloc_entry(seq);
        entry.base = base;
        entry.kind = kind;
        entry.context = writer_id;
        entry.offset = offset;
        entry.prev_in_context = prev_seq;
        entry.next_in_context = INVALID_TRACE_FRAME_ID;
        if prev_seq != INVALID_TRACE_FRAME_ID {
            self.entries[prev_seq as usize].next_in_context = seq;
        }
    }

    /// Grows or collapses the context's call tree at one instruction.
    fn track_control_flow(&mut self, writer_id: u32, location: LocationInfo) {
        let delta = self.delta[writer_id as usize].as_mut().unwrap();

        // a call with an unknown target starts at whatever executes next
        if let Some(frame_id) = delta.pending_function_start.take() {
            self.call_frames[frame_id as usize].function_start = location.ip;
        }

        match self.classifier.classify(location.ip) {
            ControlFlow::Plain => {}
            ControlFlow::Call { target } => {
                let parent = *self.delta[writer_id as usize]
                    .as_ref()
                    .unwrap()
                    .call_stack
                    .last()
                    .expect("call stack always holds the context root");
                let frame_id = self.alloc_call_frame(CallFrame {
                    function_start: target.unwrap_or(0),
                    enter: location,
                    leave: LocationInfo::unset(),
                    parent: 0,
                    first_child: 0,
                    next_sibling: 0,
                });
                self.link_child(parent, frame_id);
                let delta = self.delta[writer_id as usize].as_mut().unwrap();
                delta.call_stack.push(frame_id);
                if target.is_none() {
                    delta.pending_function_start = Some(frame_id);
                }
            }
            ControlFlow::Return => {
                let delta = self.delta[writer_id as usize].as_mut().unwrap();
                // a return that would pop the root is speculative, leave the
                // tree consistent and ignore it
                if delta.call_stack.len() > 1 {
                    let frame_id = delta.call_stack.pop().unwrap();
                    delta.pending_function_start = None;
                    self.call_frames[frame_id as usize].leave = location;
                }
            }
        }
    }

    fn record_code_address(&mut self, writer_id: u32, ip: u64, seq: TraceFrameId) {
        let base = ip & !PAGE_MASK;
        let page = self
            .code_pages
            .entry((writer_id, base))
            .or_insert_with(PageAccumulator::new);
        page.lists[(ip & PAGE_MASK) as usize].push(seq);
    }

    fn record_memory_write(&mut self, address: u64, seq: TraceFrameId, data: &[u8]) {
        for (i, &value) in data.iter().enumerate() {
            let byte_address = address + i as u64;
            let base = byte_address & !PAGE_MASK;
            let page = self
                .memory_pages
                .entry(base)
                .or_insert_with(PageAccumulator::new);
            page.lists[(byte_address & PAGE_MASK) as usize].push((seq, value));
        }
    }
}

impl RawTraceVisitor for DataBuilder<'_> {
    fn start_context(&mut self, writer_id: u32, thread_id: u32, ip: u64, seq: TraceFrameId) {
        let context_type = ContextType::from_thread_id(thread_id);
        let name = match context_type {
            ContextType::Thread => format!("Thread{thread_id}"),
            ContextType::Irq => "IRQ".to_string(),
            ContextType::Apc => "APC".to_string(),
        };
        let root_frame = self.alloc_call_frame(CallFrame {
            function_start: ip,
            enter: LocationInfo {
                seq,
                context_id: writer_id,
                context_seq: 0,
                ip,
                time: 0,
            },
            leave: LocationInfo::unset(),
            parent: 0,
            first_child: 0,
            next_sibling: 0,
        });
        let context = self.alloc_context(writer_id);
        context.context_type = context_type;
        context.id = writer_id;
        context.thread_id = thread_id;
        context.name = name;
        context.first = LocationInfo {
            seq,
            context_id: writer_id,
            context_seq: 0,
            ip,
            time: 0,
        };
        context.root_call_frame = root_frame;
        self.delta[writer_id as usize] = Some(DeltaContext::new(root_frame));
    }

    fn consume_frame(&mut self, frame: &RawFrame<'_>) {
        let local_seq = self.delta[frame.writer_id as usize]
            .as_ref()
            .expect("context started before frames arrive")
            .local_seq;
        let location = LocationInfo {
            seq: frame.seq,
            context_id: frame.writer_id,
            context_seq: local_seq,
            ip: frame.ip,
            time: frame.clock,
        };
        match frame.payload {
            RawPayload::Cpu(snapshot) => {
                let offset = self.write_blob_header(local_seq, frame.ip, frame.clock);
                let base = self.delta_compress(frame.writer_id, frame.seq, snapshot);
                self.link_entry(frame.writer_id, frame.seq, FrameKind::CpuInstruction, offset, base);
                self.record_code_address(frame.writer_id, frame.ip, frame.seq);
                self.track_control_flow(frame.writer_id, location);
            }
            RawPayload::MemoryWrite {
                address,
                text,
                data,
            } => {
                let offset = self.write_blob_header(local_seq, frame.ip, frame.clock);
                let text = &text.as_bytes()[..text.len().min(255)];
                self.blob.write_u64::<LittleEndian>(address).unwrap();
                self.blob
                    .write_u32::<LittleEndian>(data.len() as u32)
                    .unwrap();
                self.blob.write_u8(text.len() as u8).unwrap();
                self.blob.extend_from_slice(text);
                self.blob.extend_from_slice(data);
                self.link_entry(
                    frame.writer_id,
                    frame.seq,
                    FrameKind::ExternalMemoryWrite,
                    offset,
                    INVALID_TRACE_FRAME_ID,
                );
                self.record_memory_write(address, frame.seq, data);
            }
        }
    }

    fn end_context(&mut self, writer_id: u32, ip: u64, seq: TraceFrameId, num_frames: u32) {
        let context = &mut self.contexts[writer_id as usize];
        context.last = LocationInfo {
            seq,
            context_id: writer_id,
            context_seq: num_frames,
            ip,
            time: 0,
        };
        // the root call frame spans the whole context
        let root = context.root_call_frame as usize;
        if root != 0 && self.call_frames[root].leave.seq == INVALID_TRACE_FRAME_ID {
            self.call_frames[root].leave = context.last;
        }
    }
}
