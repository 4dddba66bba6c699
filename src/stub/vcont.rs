//! vCont action resolution.
//!
//! The protocol rule is "the leftmost action matching a thread wins".
//! Processing tokens right-to-left with unconditional overwrites reproduces
//! that exactly, because earlier (leftmost) tokens overwrite whatever later
//! ones put in place. Resolution is pure; the dispatcher applies the result.

use std::collections::HashMap;

use tracing::warn;

use crate::proto::command::{PendingAction, ThreadId, VContRequest};

pub struct ResolvedActions {
    /// One entry per live thread.
    pub actions: HashMap<u64, PendingAction>,
    /// True when an unscoped `c`/`C` token was seen. A continue-all is then
    /// issued instead of per-thread continues.
    pub default_continue: bool,
}

impl ResolvedActions {
    pub fn threads_with(&self, action: PendingAction) -> Vec<u64> {
        let mut uids: Vec<u64> = self
            .actions
            .iter()
            .filter(|(_, a)| **a == action)
            .map(|(uid, _)| *uid)
            .collect();
        uids.sort_unstable();
        uids
    }

    pub fn all_continue(&self) -> bool {
        self.actions.values().all(|a| *a == PendingAction::Continue)
    }
}

pub fn resolve(live_threads: &[u64], requests: &[VContRequest]) -> ResolvedActions {
    let mut actions: HashMap<u64, PendingAction> = live_threads
        .iter()
        .map(|uid| (*uid, PendingAction::None))
        .collect();

    let mut default_continue = false;

    for request in requests.iter().rev() {
        match request.thread {
            Some(ThreadId::Id(uid)) => {
                // Stale ids are dropped silently; the reply is still OK.
                if let Some(slot) = actions.get_mut(&uid) {
                    *slot = request.action;
                }
            }
            Some(ThreadId::Any) => {
                if let Some(first) = live_threads.first() {
                    actions.insert(*first, request.action);
                }
            }
            Some(ThreadId::All) | None => {
                for slot in actions.values_mut() {
                    *slot = request.action;
                }
                if request.action == PendingAction::Continue {
                    default_continue = true;
                } else {
                    warn!("unsupported vCont default action {:?}", request.action);
                }
            }
        }
    }

    ResolvedActions { actions, default_continue }
}
