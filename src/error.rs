//! Protocol-level error taxonomy.
//!
//! Everything here renders as an RSP error reply (`E01`; the thread liveness
//! check uses `E00` per the protocol). Checksum failures never reach this
//! layer (the transport NACKs them), and unknown commands are not errors at
//! all (the protocol's "unsupported" signal is an empty reply).

use thiserror::Error;

use crate::proto::wire::WireError;

/// A recognized command that cannot be carried out.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed command arguments")]
    Malformed,

    #[error("no debuggable process")]
    NoProcess,

    #[error("no thread selected")]
    NoThreadSelected,

    #[error("no live guest thread")]
    NoLiveThreads,

    #[error("unknown or dead thread {0:#x}")]
    ThreadNotFound(u64),

    #[error("register {0} is not part of the target description")]
    UnsupportedRegister(u64),

    #[error("invalid guest memory region at {0:#x}")]
    InvalidMemoryRegion(u64),

    #[error("only software breakpoints are supported")]
    UnsupportedBreakpoint,

    #[error("no breakpoint armed at {0:#x}")]
    BreakpointNotSet(u64),

    #[error("step request failed")]
    StepFailed,
}

impl From<WireError> for ProtocolError {
    fn from(_: WireError) -> Self {
        ProtocolError::Malformed
    }
}

impl From<crate::guest::InvalidMemoryRegion> for ProtocolError {
    fn from(e: crate::guest::InvalidMemoryRegion) -> Self {
        ProtocolError::InvalidMemoryRegion(e.address)
    }
}
