//! Guest-side collaborator interfaces.
//!
//! The stub never owns the emulated CPU; it drives it through these traits.
//! Implementations live in the host emulator and are shared with the stub's
//! threads, so everything is `Send + Sync` and mutation happens through
//! `&self` with whatever interior mutability the engine already uses for its
//! own scheduling.

use std::sync::Arc;

use thiserror::Error;

/// Guest memory access outside any mapped range.
#[derive(Debug, Clone, Copy, Error)]
#[error("invalid guest memory region at {address:#x}")]
pub struct InvalidMemoryRegion {
    pub address: u64,
}

/// Entry point handed to the server: yields the debuggable process once the
/// guest is actually running. Both accessors return `None` until then.
pub trait DebugTarget: Send + Sync {
    fn debug_process(&self) -> Option<Arc<dyn DebugProcess>>;
    fn process_metadata(&self) -> Option<Arc<dyn ProcessMetadata>>;
}

/// Execution control and memory access for the guest process.
pub trait DebugProcess: Send + Sync {
    /// Suspend every guest thread.
    fn debug_stop(&self);

    /// Resume every guest thread.
    fn debug_continue(&self);

    /// Resume a single thread, leaving the rest paused.
    fn debug_continue_thread(&self, thread_uid: u64);

    /// Single-step one thread. Returns false if the step could not be
    /// scheduled (dead thread, engine refusal).
    fn debug_step(&self, thread_uid: u64) -> bool;

    /// Invoked from the engine's own thread when a breakpoint or step
    /// completes, before the stop is reported to the debugger.
    fn debug_interrupt(&self, context: &dyn ExecutionContext);

    /// Uids of all live guest threads, in stable enumeration order.
    fn thread_uids(&self) -> Vec<u64>;

    /// Execution context of a live thread, `None` if the uid is stale.
    fn context(&self, thread_uid: u64) -> Option<Arc<dyn ExecutionContext>>;

    fn thread_name(&self, thread_uid: u64) -> Option<String>;

    fn is_thread_paused(&self, thread_uid: u64) -> bool;

    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<(), InvalidMemoryRegion>;

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), InvalidMemoryRegion>;

    /// Drop translated code over a region after the debugger patched it.
    fn invalidate_cache_region(&self, address: u64, size: u64);

    /// Plant a software break instruction. The engine keeps the original
    /// bytes; the stub only tracks which addresses are armed.
    fn install_breakpoint(&self, address: u64, length: u64) -> Result<(), InvalidMemoryRegion>;

    /// Restore the original bytes at a previously armed address.
    fn remove_breakpoint(&self, address: u64, length: u64) -> Result<(), InvalidMemoryRegion>;
}

/// A guest thread's register file as seen by the debugger.
///
/// `pc` is the debug-visible program counter (the engine may run ahead of
/// the architectural PC inside a translated block).
pub trait ExecutionContext: Send + Sync {
    fn thread_uid(&self) -> u64;

    /// True when the thread executes in AArch32 mode.
    fn is_aarch32(&self) -> bool;

    fn x(&self, index: usize) -> u64;
    fn set_x(&self, index: usize, value: u64);

    fn pc(&self) -> u64;
    fn set_pc(&self, value: u64);

    fn pstate(&self) -> u32;
    fn set_pstate(&self, value: u32);

    fn v(&self, index: usize) -> u128;
    fn set_v(&self, index: usize, value: u128);

    fn fpsr(&self) -> u32;
    fn set_fpsr(&self, value: u32);

    fn fpcr(&self) -> u32;
    fn set_fpcr(&self, value: u32);
}

/// One guest memory region, end exclusive.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
}

/// The four named regions reported by `monitor get info`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    pub alias: MemoryRegion,
    pub heap: MemoryRegion,
    pub aslr: MemoryRegion,
    pub stack: MemoryRegion,
}

/// A loaded guest image.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub base_address: u64,
    pub size: u64,
    pub name: String,
}

/// Informational process state, consumed only by the monitor commands.
pub trait ProcessMetadata: Send + Sync {
    fn program_id(&self) -> u64;

    fn is_application(&self) -> bool;

    fn memory_layout(&self) -> MemoryLayout;

    fn loaded_modules(&self) -> Vec<ModuleInfo>;

    /// Human-readable guest call stack for one thread.
    fn guest_stack_trace(&self, thread_uid: u64) -> anyhow::Result<String>;

    /// Human-readable register dump for one thread.
    fn register_printout(&self, thread_uid: u64) -> anyhow::Result<String>;
}
