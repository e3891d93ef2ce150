//! Execution-trace subsystem of a binary recompilation toolkit.
//!
//! The pipeline has four stages, each a module of this crate:
//!
//! * [`writer`] (capture): per-thread [`writer::TraceWriter`]s turn
//!   register bank snapshots into delta-encoded records, a shared
//!   [`writer::TraceSink`] orders them globally and drains them to disk on a
//!   background thread.
//! * [`raw_reader`] (ingestion): replays a recorded stream and reconstructs
//!   full per-context snapshots for a visitor.
//! * [`builder`] (indexing): turns the raw event sequence into randomly
//!   seekable arrays (contexts, entries, data blob, call tree, code and
//!   memory trace pages).
//! * [`data_file`] and [`memory_slice`] (queries): point-in-time register
//!   frames, O(1) context stepping, call-stack lookups and byte-accurate
//!   memory reconstruction at any recorded step.
//!
//! Instruction decoding and the register bank layout are supplied by the
//! platform collaborators through the traits in [`cpu`].

pub mod builder;
pub mod cpu;
pub mod data_file;
pub mod error;
pub mod format;
pub mod memory_slice;
pub mod raw_reader;
pub mod writer;

/// Globally unique, monotonically increasing id of one recorded step.
///
/// The sequence number is the trace's primary ordering and addressing key;
/// it is assigned once per recorded instruction across all concurrently
/// recording flows.
pub type TraceFrameId = u64;

/// Reserved sentinel for "no frame" links and unresolved locations.
pub const INVALID_TRACE_FRAME_ID: TraceFrameId = u64::MAX;

/// Progress and cancellation hook for long scans.
///
/// `Scan`, `Build` and the visit walks consult the observer periodically so a
/// caller can render progress and abort a multi-million-frame operation.
/// Cancellation yields the best-known partial result, never an error.
pub trait TaskObserver {
    /// Called periodically with the amount of work done out of `total`
    fn progress(&mut self, _done: u64, _total: u64) {}

    /// Polled between work items; returning `true` stops the operation
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// No-op observer for callers that do not track progress.
impl TaskObserver for () {}
