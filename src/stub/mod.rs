//! The live side of the stub: server lifecycle, message dispatch, breakpoint
//! bookkeeping, vCont resolution and monitor commands.

pub mod breakpoints;
pub mod handler;
pub mod message;
pub mod monitor;
pub mod server;
pub mod vcont;

pub use breakpoints::BreakpointTable;
pub use message::{Message, ThreadBreak};
pub use monitor::MonitorRegistry;
pub use server::{GdbServer, GdbServerConfig};
