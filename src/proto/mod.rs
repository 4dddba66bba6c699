//! Wire-level pieces of the Remote Serial Protocol.
//!
//! Everything in here is pure: packet framing and transcoding in [`wire`],
//! the cursor over packet text in [`scan`], and the command grammar in
//! [`command`]. No sockets, no guest state.

pub mod command;
pub mod scan;
pub mod wire;

pub use command::{BreakpointKind, GdbCommand, PendingAction, Query, ThreadId, VContRequest};
pub use scan::TextScanner;
