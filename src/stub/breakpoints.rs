//! Software breakpoint bookkeeping.
//!
//! The table only tracks which addresses are armed; planting the break
//! instruction and restoring the original bytes is the CPU collaborator's
//! job. Shared between the dispatcher (`Z`/`z`, detach) and the transport
//! (disconnect cleanup), hence the `&mut self` + external lock design.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::guest::DebugProcess;

#[derive(Default)]
pub struct BreakpointTable {
    // address -> armed length
    active: HashMap<u64, u64>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a software breakpoint. Arming an already-armed address is a
    /// no-op success; a failed guest memory write reports false.
    pub fn set(&mut self, process: &dyn DebugProcess, address: u64, length: u64) -> bool {
        if self.active.contains_key(&address) {
            return true;
        }

        match process.install_breakpoint(address, length) {
            Ok(()) => {
                debug!("armed breakpoint at {address:#x} ({length} bytes)");
                self.active.insert(address, length);
                true
            }
            Err(e) => {
                warn!("failed to arm breakpoint at {address:#x}: {e}");
                false
            }
        }
    }

    /// Disarms a breakpoint. False when nothing was armed at the address.
    pub fn clear(&mut self, process: &dyn DebugProcess, address: u64, _length: u64) -> bool {
        let Some(length) = self.active.remove(&address) else {
            return false;
        };

        if let Err(e) = process.remove_breakpoint(address, length) {
            warn!("failed to restore breakpoint bytes at {address:#x}: {e}");
        }
        debug!("disarmed breakpoint at {address:#x}");
        true
    }

    /// Disarms everything; invoked on detach and on client disconnect.
    pub fn clear_all(&mut self, process: &dyn DebugProcess) {
        for (address, length) in self.active.drain() {
            if let Err(e) = process.remove_breakpoint(address, length) {
                warn!("failed to restore breakpoint bytes at {address:#x}: {e}");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
