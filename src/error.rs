//! Error definitions

/// Errors reported by the trace subsystem.
///
/// Capture-side I/O failures are intentionally absent: once recording has
/// started, a failed disk write flips a sticky flag inside the sink and is
/// reported once through the log, it never interrupts the traced program.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Underlying I/O error while opening, saving or loading
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// File does not carry the expected magic
    #[error("Not a trace file (magic {0:#x})")]
    BadMagic(u32),
    /// Register in the file does not exist in the current register bank
    #[error("Trace uses unknown register '{0}'")]
    UnknownRegister(String),
    /// Register sizes in the file and in the current register bank differ
    #[error("Register '{name}' has {file_size} bytes in the file but {bank_size} in the register bank")]
    RegisterMismatch {
        /// Register name as stored in the file
        name: String,
        /// Byte size recorded in the file
        file_size: u32,
        /// Byte size reported by the register bank
        bank_size: u32,
    },
    /// Register or context name does not fit the fixed-size file field
    #[error("Name '{0}' is too long for the trace file format")]
    NameTooLong(String),
    /// Indexed trace file was written by an incompatible version
    #[error("Unsupported trace file version {0}")]
    UnsupportedVersion(u32),
    /// Indexed file carries an internal reference outside its own arrays
    #[error("Trace file corrupt: {0}")]
    Corrupt(&'static str),
    /// File ended in the middle of a structure that may not be skipped
    #[error("Trace file truncated at offset {0}")]
    Truncated(u64),
    /// Query issued against a context that carries no call-tree data
    #[error("Context {0} has no call frame data")]
    NoCallData(u32),
}

/// Convenience alias used throughout the crate.
pub type TraceResult<T> = Result<T, TraceError>;
