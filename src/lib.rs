//! GDB Remote Serial Protocol stub server
//!
//! Exposes an emulated multi-threaded guest process to an external debugger
//! (GDB, LLDB, IDA Pro) over a TCP socket. The emulation engine itself stays
//! on the other side of the [`guest`] traits: the host wires up a
//! [`guest::DebugTarget`], starts a [`GdbServer`], and routes the engine's
//! breakpoint/step callbacks into [`GdbServer::break_handler`] and
//! [`GdbServer::step_handler`].
//!
//! Supports AArch64 and AArch32 guest execution contexts, software
//! breakpoints, per-thread vCont resume control, paginated thread-list and
//! target-description transfers, and a set of `monitor` diagnostic commands
//! (`help`, `get info`, `backtrace`, `registers`, `minidump`).

pub mod arch;
pub mod error;
pub mod guest;
pub mod proto;
pub mod stub;

pub use error::ProtocolError;
pub use stub::server::{GdbServer, GdbServerConfig};
pub use stub::{BreakpointTable, Message, MonitorRegistry, ThreadBreak};
