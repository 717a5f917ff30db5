/*
 *   Copyright (c) 2025 R3BL LLC
 *   All rights reserved.
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! Per-task invoke queue.
//!
//! Every [`Task`](crate::task::Task) owns exactly one `Invoker`: a FIFO of
//! watchers that have fired and are waiting to be run. At most one invoke
//! thread drains a given task's invoker at a time — that mutual exclusion is
//! what guarantees a task's callbacks never run concurrently with each
//! other. The invoker itself only tracks the queue and whether a thread
//! currently owns it; `TaskRunner` decides which thread that is.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::watcher::Watcher;

#[derive(Default)]
struct State {
    pending: VecDeque<Watcher>,
    /// `true` while some invoke thread is actively draining this invoker.
    owned: bool,
}

/// FIFO of fired-but-not-yet-run watchers for a single task, plus the
/// single-owner flag that keeps invocations of that task serialized.
#[derive(Default)]
pub struct Invoker {
    state: Mutex<State>,
}

impl Invoker {
    pub fn new() -> Self { Self::default() }

    /// Appends a fired watcher to the queue.
    pub fn push(&self, watcher: Watcher) { self.state.lock().unwrap().pending.push_back(watcher); }

    /// Pops the next watcher to run, if any.
    pub fn pop(&self) -> Option<Watcher> { self.state.lock().unwrap().pending.pop_front() }

    pub fn has_pending(&self) -> bool { !self.state.lock().unwrap().pending.is_empty() }

    /// Attempts to claim ownership for the calling invoke thread. Returns
    /// `true` if this call claimed it (the caller now owns draining until it
    /// calls [`Self::release`]), `false` if another thread already owns it.
    pub fn try_claim(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.owned {
            false
        } else {
            state.owned = true;
            true
        }
    }

    /// Releases ownership. Returns whether the queue still has pending
    /// watchers — if so, the caller (or another invoke thread) must
    /// re-schedule draining rather than let them sit forever.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.owned = false;
        !state.pending.is_empty()
    }

    pub fn is_owned(&self) -> bool { self.state.lock().unwrap().owned }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Invoker")
            .field("pending_len", &state.pending.len())
            .field("owned", &state.owned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::watcher::{Watcher, WatcherKind, IoFlags};
    use std::sync::Weak;

    fn dummy_watcher() -> Watcher {
        Watcher::new(WatcherKind::Idle, Task::new(Weak::new()), None, IoFlags::empty(), None)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let inv = Invoker::new();
        let a = dummy_watcher();
        let b = dummy_watcher();
        let a_id = a.id();
        let b_id = b.id();
        inv.push(a);
        inv.push(b);
        assert_eq!(inv.pop().unwrap().id(), a_id);
        assert_eq!(inv.pop().unwrap().id(), b_id);
        assert!(inv.pop().is_none());
    }

    #[test]
    fn only_one_claim_succeeds_at_a_time() {
        let inv = Invoker::new();
        assert!(inv.try_claim());
        assert!(!inv.try_claim());
        assert!(!inv.release()); // nothing pending
        assert!(inv.try_claim());
    }

    #[test]
    fn release_reports_leftover_pending_work() {
        let inv = Invoker::new();
        inv.try_claim();
        inv.push(dummy_watcher());
        assert!(inv.release());
    }
}
