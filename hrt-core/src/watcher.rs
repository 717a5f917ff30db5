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

//! Watchers: the sources of events a [`Task`](crate::task::Task) reacts to.
//!
//! A watcher is a tagged union rather than a trait-object hierarchy — the
//! kinds are closed (immediate, idle, I/O, subtask-completion, and the
//! internal removal marker) and the invoke loop needs to match on which one
//! it has, so an enum reads more directly than dynamic dispatch here.
//!
//! Ownership runs watcher-to-task, not the other way around: a `Watcher`
//! holds a strong `Arc<Task>` (so the task can't disappear while something
//! might still fire it), and `Task` only keeps an atomic count of its live
//! watchers rather than a list of strong references back to them. That
//! keeps the graph acyclic without reference-counting games.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;

use crate::task::Task;

bitflags! {
    /// Readiness interest/result mask for an I/O watcher. `Debug`, `Clone`,
    /// `Copy`, `PartialEq`, `Eq`, and `Hash` come from the macro itself.
    pub struct IoFlags: u8 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

/// A watcher callback. Returns `true` to stay armed (fire again on the next
/// matching event), `false` to remove itself after this invocation.
pub type Callback = Box<dyn FnMut(&Arc<Task>, &Watcher) -> bool + Send>;

/// Fired exactly once, after a watcher has been fully removed and will never
/// be invoked again. Used to release resources the watcher's closure held
/// (e.g. closing a duplicated fd) without racing the invoke loop.
pub type DestroyNotify = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    Immediate,
    Idle,
    Io,
    Subtask,
    /// Internal: queued onto a task's invoker so that, once it reaches the
    /// front, the invoke loop re-checks task completability after a prior
    /// watcher removal. Never exposed to embedders.
    RemovalMarker,
}

pub(crate) struct WatcherInner {
    pub kind: WatcherKind,
    pub task: Arc<Task>,
    pub fd: Option<RawFd>,
    pub interest: IoFlags,
    pub subtask: Mutex<Option<Arc<Task>>>,
    pub callback: Mutex<Option<Callback>>,
    pub destroy_notify: Mutex<Option<DestroyNotify>>,
    pub removed: AtomicBool,
    pub id: u64,
}

/// A single registered event source. Cheaply cloneable (`Arc`-backed);
/// clones all refer to the same underlying watcher.
#[derive(Clone)]
pub struct Watcher(pub(crate) Arc<WatcherInner>);

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

impl Watcher {
    /// Builds a real (non-marker) watcher. Reserves a watcher slot on `task`
    /// up front, balanced by a matching [`Task::release_watcher_slot`] call
    /// from either [`Self::remove`] or `WatcherInner`'s `Drop`.
    pub(crate) fn new(
        kind: WatcherKind,
        task: Arc<Task>,
        fd: Option<RawFd>,
        interest: IoFlags,
        callback: Option<Callback>,
    ) -> Self {
        debug_assert_ne!(kind, WatcherKind::RemovalMarker, "use Watcher::removal_marker instead");
        task.reserve_watcher_slot();
        Self::build(kind, task, fd, interest, callback)
    }

    /// A removal marker carries no watcher-count slot of its own — the
    /// runner's invoke loop drains it directly rather than through
    /// [`Self::remove`], so nothing would ever release a reserved slot.
    pub(crate) fn removal_marker(task: Arc<Task>) -> Self {
        Self::build(WatcherKind::RemovalMarker, task, None, IoFlags::empty(), None)
    }

    fn build(kind: WatcherKind, task: Arc<Task>, fd: Option<RawFd>, interest: IoFlags, callback: Option<Callback>) -> Self {
        Watcher(Arc::new(WatcherInner {
            kind,
            task,
            fd,
            interest,
            subtask: Mutex::new(None),
            callback: Mutex::new(callback),
            destroy_notify: Mutex::new(None),
            removed: AtomicBool::new(false),
            id: NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed),
        }))
    }

    pub fn kind(&self) -> WatcherKind { self.0.kind }

    pub fn fd(&self) -> Option<RawFd> { self.0.fd }

    pub fn interest(&self) -> IoFlags { self.0.interest }

    pub fn is_removed(&self) -> bool { self.0.removed.load(Ordering::Acquire) }

    pub fn id(&self) -> u64 { self.0.id }

    pub fn set_destroy_notify(&self, notify: DestroyNotify) {
        *self.0.destroy_notify.lock().unwrap() = Some(notify);
    }

    pub(crate) fn subtask(&self) -> Option<Arc<Task>> { self.0.subtask.lock().unwrap().clone() }

    pub(crate) fn owner_task(&self) -> Arc<Task> { self.0.task.clone() }

    pub(crate) fn downgrade(&self) -> WeakWatcher { WeakWatcher(Arc::downgrade(&self.0)) }

    pub(crate) fn set_subtask(&self, task: Arc<Task>) { *self.0.subtask.lock().unwrap() = Some(task); }

    /// Invokes the callback, if one is present and the watcher isn't already
    /// removed. Returns whether the watcher should stay armed.
    pub(crate) fn invoke(&self, owner: &Arc<Task>) -> bool {
        if self.is_removed() {
            return false;
        }
        let mut guard = self.0.callback.lock().unwrap();
        match guard.as_mut() {
            Some(cb) => cb(owner, self),
            None => false,
        }
    }

    /// Removes this watcher: marks it removed, releases its slot on the
    /// owning task (which re-checks completability), and — if a
    /// destroy-notify is set — enqueues a removal marker so the notify runs
    /// on the task's own invoke thread instead of whichever thread called
    /// `remove`.
    pub fn remove(&self) {
        debug_assert_ne!(self.0.kind, WatcherKind::RemovalMarker, "removal markers are drained, not removed");
        if self.0.removed.swap(true, Ordering::AcqRel) {
            return; // already removed
        }
        let notify = self.0.destroy_notify.lock().unwrap().take();
        let task = &self.0.task;
        task.release_watcher_slot();
        if let Some(notify) = notify {
            task.enqueue_removal_marker(notify);
        }
    }
}

impl Drop for WatcherInner {
    /// Best-effort cleanup for a watcher whose last handle was dropped
    /// without an explicit [`Watcher::remove`] call — e.g. an embedder that
    /// discards the return value of `add_idle` entirely. Still releases the
    /// task's watcher-count slot and still runs the destroy-notify exactly
    /// once, but — unlike the ordinary `remove` path — not necessarily on an
    /// invoke thread, since nothing is draining this task at the moment the
    /// last `Arc` disappears.
    fn drop(&mut self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.kind != WatcherKind::RemovalMarker {
            self.task.release_watcher_slot();
        }
        if let Some(notify) = self.destroy_notify.lock().unwrap().take() {
            notify();
        }
    }
}

/// A non-owning handle to a [`Watcher`], used by the event loop's
/// registration table so a deregistered or dropped watcher doesn't keep its
/// fd entry alive.
#[derive(Clone)]
pub(crate) struct WeakWatcher(Weak<WatcherInner>);

impl WeakWatcher {
    pub(crate) fn upgrade(&self) -> Option<Watcher> { self.0.upgrade().map(Watcher) }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("fd", &self.0.fd)
            .field("interest", &self.0.interest)
            .field("removed", &self.is_removed())
            .finish()
    }
}

impl PartialEq for Watcher {
    fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}

impl Eq for Watcher {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_flags_combine() {
        let both = IoFlags::READ | IoFlags::WRITE;
        assert!(both.contains(IoFlags::READ));
        assert!(both.contains(IoFlags::WRITE));
    }

    #[test]
    fn removal_marker_has_no_callback() {
        let w = Watcher::removal_marker(Task::new(Weak::new()));
        assert_eq!(w.kind(), WatcherKind::RemovalMarker);
        assert!(w.0.callback.lock().unwrap().is_none());
    }

    #[test]
    fn watcher_ids_are_distinct() {
        let task = Task::new(Weak::new());
        let a = Watcher::new(WatcherKind::Idle, task.clone(), None, IoFlags::empty(), None);
        let b = Watcher::new(WatcherKind::Idle, task, None, IoFlags::empty(), None);
        assert_ne!(a.id(), b.id());
    }
}
