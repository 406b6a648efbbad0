//! Error types for the crash decoder

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the crash decoder
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The target has no register-dump decoder; callers fall back to the
    /// Xtensa decoders.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Unsupported board: '{0}'")]
    UnsupportedBoard(String),

    #[error("Handling of multi-core register dumps not implemented (found {0} cores)")]
    MultiCoreUnsupported(usize),

    #[error("Could not find a 'Core N register dump:' block")]
    NoRegisterDump,

    #[error("Invalid base address: expected 0x{expected:08x}, got 0x{found:08x}")]
    MalformedStackDump { expected: u64, found: u64 },

    #[error("Could not detect the GDB tool path (tried: {})", display_paths(.attempted))]
    ToolNotFound { attempted: Vec<PathBuf> },

    #[error("Could not detect the '.elf' file: {0}")]
    ElfNotFound(PathBuf),

    #[error("Could not recognize stack trace/backtrace")]
    NoBacktraceFound,

    #[error("Could not detect any instruction addresses in the stack trace/backtrace")]
    NoInstructionAddresses,

    #[error("Invalid argument: no addresses to resolve")]
    NoAddresses,

    #[error("GDB exited with {status}: {stderr}")]
    ToolFailed { status: String, stderr: String },

    #[error("User abort")]
    Aborted,

    /// The RSP stub session failed while GDB was attached.
    #[error("RSP stub failed: {0}")]
    StubFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DecodeError {
    /// Whether this error is the result of the caller cancelling the decode.
    pub fn is_abort(&self) -> bool {
        matches!(self, DecodeError::Aborted)
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no candidate paths".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DecodeError>;
