//! Messages flowing into the dispatcher.
//!
//! Produced by the session transport (network bytes) and by the CPU
//! collaborator's threads (break/step completion); consumed strictly one at
//! a time by the dispatcher loop.

use std::sync::Arc;

use crate::guest::ExecutionContext;

/// A break or single-step completion reported by the emulated CPU.
#[derive(Clone)]
pub struct ThreadBreak {
    pub context: Arc<dyn ExecutionContext>,
    /// Guest address of the instruction that broke.
    pub address: u64,
    /// The break instruction's immediate, informational only.
    pub opcode: u32,
}

pub enum Message {
    /// 0x03 on the wire: stop everything now.
    BreakIn,
    /// A packet failed its checksum; answer with a bare `-`.
    SendNack,
    /// A well-framed command body.
    Command(String),
    /// Asynchronous stop completion from the guest.
    ThreadBreak(ThreadBreak),
    /// Shut the dispatcher loop down.
    Kill,
}
