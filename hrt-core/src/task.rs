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

//! A [`Task`]: a named bag of arguments, a single result slot, and a set of
//! watchers whose callbacks are guaranteed never to run concurrently with
//! each other. Tasks complete automatically once their last watcher is gone
//! and nothing is blocking completion — see [`Task::try_finalize_completion`].

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;

use thiserror::Error;
use tracing::{debug, trace};

use crate::invoker::Invoker;
use crate::runner::TaskRunner;
use crate::value::Value;
use crate::watcher::{Callback, DestroyNotify, IoFlags, Watcher, WatcherKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("no argument named {0:?}")]
    NotFound(String),
    #[error("argument {name:?} is a {actual}, not a {expected}")]
    WrongType { name: String, expected: &'static str, actual: &'static str },
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Destroy-notify for a [`Task::set_thread_local`] slot, run with the
/// outgoing value when that slot is overwritten or the task completes.
pub type ThreadLocalDestroy = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

pub struct Task {
    id: u64,
    runner: Weak<TaskRunner>,
    pub(crate) invoker: Invoker,
    /// Count of this task's live watchers. A `Watcher` holds a strong
    /// `Arc<Task>` back to here, so the reverse link is deliberately just a
    /// count rather than a `Vec` of strong references — that would make the
    /// two types own each other and never drop.
    watcher_count: AtomicUsize,
    /// Watchers owned by *other* tasks, waiting on this task's completion.
    /// The one exception to "count only": a subtask-completion watcher must
    /// be reachable by value so it can be moved onto its owner's invoker once
    /// this task completes.
    subtask_watchers: Mutex<Vec<Watcher>>,
    args: Mutex<Vec<(String, Value)>>,
    result: Mutex<Option<Value>>,
    completion_blocked: AtomicUsize,
    finalized: AtomicBool,
    completion_callback: Mutex<Option<Box<dyn FnOnce(&Arc<Task>) + Send>>>,
    current_invoke_thread: Mutex<Option<ThreadId>>,
    /// Per-task scratch storage, valid only while a callback of this task is
    /// executing on the current thread (see [`Self::check_in_task_thread`]).
    thread_local_slots: Mutex<Vec<(u64, Box<dyn Any + Send>, Option<ThreadLocalDestroy>)>>,
}

impl Task {
    pub(crate) fn new(runner: Weak<TaskRunner>) -> Arc<Self> {
        Arc::new(Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            runner,
            invoker: Invoker::new(),
            watcher_count: AtomicUsize::new(0),
            subtask_watchers: Mutex::new(Vec::new()),
            args: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            completion_blocked: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
            completion_callback: Mutex::new(None),
            current_invoke_thread: Mutex::new(None),
            thread_local_slots: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 { self.id }

    pub fn runner(&self) -> Option<Arc<TaskRunner>> { self.runner.upgrade() }

    // ---- arguments -----------------------------------------------------

    pub fn add_arg(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.args.lock().unwrap().push((name.into(), value.into()));
    }

    pub fn get_arg(&self, name: &str) -> Result<Value, ArgError> {
        self.args
            .lock()
            .unwrap()
            .iter()
            .rev() // last-added wins, mirroring append-only arg lists
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ArgError::NotFound(name.to_string()))
    }

    pub fn get_arg_str(&self, name: &str) -> Result<Arc<str>, ArgError> {
        match self.get_arg(name)? {
            Value::Str(s) => Ok(s),
            other => Err(ArgError::WrongType { name: name.to_string(), expected: "str", actual: other.type_name() }),
        }
    }

    pub fn get_arg_i32(&self, name: &str) -> Result<i32, ArgError> {
        match self.get_arg(name)? {
            Value::I32(v) => Ok(v),
            other => Err(ArgError::WrongType { name: name.to_string(), expected: "i32", actual: other.type_name() }),
        }
    }

    pub fn get_arg_f64(&self, name: &str) -> Result<f64, ArgError> {
        match self.get_arg(name)? {
            Value::F64(v) => Ok(v),
            other => Err(ArgError::WrongType { name: name.to_string(), expected: "f64", actual: other.type_name() }),
        }
    }

    pub fn get_args(&self) -> Vec<(String, Value)> { self.args.lock().unwrap().clone() }

    // ---- result ----------------------------------------------------------

    pub fn set_result(&self, value: impl Into<Value>) { *self.result.lock().unwrap() = Some(value.into()); }

    pub fn get_result(&self) -> Option<Value> { self.result.lock().unwrap().clone() }

    /// Sets the callback run once, on the invoke thread that performs the
    /// finalizing check, when this task completes. Calling this after the
    /// task has already completed runs `f` immediately.
    pub fn on_complete(self: &Arc<Self>, f: impl FnOnce(&Arc<Task>) + Send + 'static) {
        if self.finalized.load(Ordering::Acquire) {
            f(self);
            return;
        }
        *self.completion_callback.lock().unwrap() = Some(Box::new(f));
    }

    pub fn is_complete(&self) -> bool { self.finalized.load(Ordering::Acquire) }

    // ---- task-local storage ----------------------------------------------

    /// Sets a task-scoped storage slot keyed by a caller-chosen tag. Valid
    /// only while a callback belonging to this task is executing on the
    /// current thread — asserted in debug builds via
    /// [`Self::check_in_task_thread`]. Replacing an existing slot runs its
    /// prior `destroy` (if any) with the old value before installing the new
    /// one.
    pub fn set_thread_local(&self, tag: u64, value: Box<dyn Any + Send>, destroy: Option<ThreadLocalDestroy>) {
        debug_assert!(self.check_in_task_thread(), "set_thread_local called outside this task's callback");
        let mut slots = self.thread_local_slots.lock().unwrap();
        if let Some(pos) = slots.iter().position(|(t, ..)| *t == tag) {
            let (_, old_value, old_destroy) = slots.remove(pos);
            if let Some(old_destroy) = old_destroy {
                old_destroy(old_value);
            }
        }
        slots.push((tag, value, destroy));
    }

    /// Reads back a task-scoped storage slot set by [`Self::set_thread_local`].
    /// Same invoke-thread precondition as the setter.
    pub fn get_thread_local<T: 'static + Clone>(&self, tag: u64) -> Option<T> {
        debug_assert!(self.check_in_task_thread(), "get_thread_local called outside this task's callback");
        self.thread_local_slots
            .lock()
            .unwrap()
            .iter()
            .find(|(t, ..)| *t == tag)
            .and_then(|(_, v, _)| v.downcast_ref::<T>().cloned())
    }

    // ---- completion blocking ----------------------------------------------

    /// Prevents this task from auto-completing even if its watcher count
    /// drops to zero. Must be paired with [`Self::unblock_completion`].
    pub fn block_completion(&self) { self.completion_blocked.fetch_add(1, Ordering::AcqRel); }

    pub fn unblock_completion(self: &Arc<Self>) {
        let prev = self.completion_blocked.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unblock_completion called more often than block_completion");
        if prev == 1 {
            self.try_finalize_completion();
        }
    }

    // ---- watcher registration ----------------------------------------------

    pub fn add_immediate(self: &Arc<Self>, callback: Callback) -> Watcher {
        self.register(Watcher::new(WatcherKind::Immediate, self.clone(), None, IoFlags::empty(), Some(callback)))
    }

    pub fn add_idle(self: &Arc<Self>, callback: Callback) -> Watcher {
        self.register(Watcher::new(WatcherKind::Idle, self.clone(), None, IoFlags::empty(), Some(callback)))
    }

    pub fn add_io(self: &Arc<Self>, fd: RawFd, interest: IoFlags, callback: Callback) -> Watcher {
        self.register(Watcher::new(WatcherKind::Io, self.clone(), Some(fd), interest, Some(callback)))
    }

    /// Watches another task's completion. `callback` runs on this task's
    /// invoke thread once `subtask` completes.
    pub fn add_subtask(self: &Arc<Self>, subtask: &Arc<Task>, callback: Callback) -> Watcher {
        let watcher = Watcher::new(WatcherKind::Subtask, self.clone(), None, IoFlags::empty(), Some(callback));
        watcher.set_subtask(subtask.clone());
        if subtask.is_complete() {
            // Lost the race: subtask already finished before we could
            // register. Fire immediately rather than waiting forever.
            self.push_and_schedule(watcher.clone());
        } else {
            subtask.subtask_watchers.lock().unwrap().push(watcher.clone());
        }
        watcher
    }

    fn register(self: &Arc<Self>, watcher: Watcher) -> Watcher {
        if let Some(runner) = self.runner.upgrade() {
            runner.register_watcher(self, &watcher);
        }
        watcher
    }

    /// Pushes a fired watcher onto this task's invoke queue and schedules an
    /// invoke thread to drain it.
    pub(crate) fn push_and_schedule(self: &Arc<Self>, watcher: Watcher) {
        self.invoker.push(watcher);
        if let Some(runner) = self.runner.upgrade() {
            runner.watcher_pending(self);
        }
    }

    /// Reserves one watcher slot, called from [`Watcher::new`] as it
    /// constructs a watcher bound to this task.
    pub(crate) fn reserve_watcher_slot(&self) { self.watcher_count.fetch_add(1, Ordering::AcqRel); }

    /// Releases one watcher slot (a watcher belonging to this task was just
    /// fully removed) and re-checks completability, since this may have been
    /// the last one holding the task open.
    pub(crate) fn release_watcher_slot(self: &Arc<Self>) {
        let prev = self.watcher_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "watcher slot released more times than reserved");
        trace!(task = self.id, remaining = prev - 1, "watcher slot released");
        self.recheck_completability();
    }

    pub(crate) fn enqueue_removal_marker(self: &Arc<Self>, destroy_notify: DestroyNotify) {
        let marker = Watcher::removal_marker(self.clone());
        marker.set_destroy_notify(destroy_notify);
        self.push_and_schedule(marker);
    }

    /// Fires every watcher another task registered against this task's
    /// completion via [`Self::add_subtask`].
    fn fire_subtask_watchers(self: &Arc<Self>) {
        let watchers = std::mem::take(&mut *self.subtask_watchers.lock().unwrap());
        for watcher in watchers {
            let owner = watcher.owner_task();
            owner.push_and_schedule(watcher);
        }
    }

    /// Called whenever watcher count may have changed; completes the task if
    /// it is now eligible.
    pub(crate) fn recheck_completability(self: &Arc<Self>) { self.try_finalize_completion(); }

    /// Attempts to mark the task complete: true exactly once, the first time
    /// all of (no watchers remain, no invoke thread currently owns this
    /// task's invoker, completion isn't explicitly blocked) hold
    /// simultaneously.
    pub(crate) fn try_finalize_completion(self: &Arc<Self>) -> bool {
        if self.finalized.load(Ordering::Acquire) {
            return false;
        }
        let no_watchers = self.watcher_count.load(Ordering::Acquire) == 0;
        let idle = !self.invoker.is_owned();
        let unblocked = self.completion_blocked.load(Ordering::Acquire) == 0;
        if !(no_watchers && idle && unblocked) {
            return false;
        }
        if self.finalized.swap(true, Ordering::AcqRel) {
            return false; // lost a race with another finalizer
        }
        debug!(task = self.id, "task complete");
        for (_, value, destroy) in self.thread_local_slots.lock().unwrap().drain(..) {
            if let Some(destroy) = destroy {
                destroy(value);
            }
        }
        if let Some(cb) = self.completion_callback.lock().unwrap().take() {
            cb(self);
        }
        self.fire_subtask_watchers();
        if let Some(runner) = self.runner.upgrade() {
            runner.queue_completed(self.clone());
        }
        true
    }

    pub(crate) fn set_current_invoke_thread(&self, thread: Option<ThreadId>) {
        *self.current_invoke_thread.lock().unwrap() = thread;
    }

    /// Returns whether the calling thread is the one currently invoking a
    /// watcher belonging to this task. Intended for debug assertions inside
    /// callbacks that must not be re-entered from elsewhere.
    pub fn check_in_task_thread(&self) -> bool {
        *self.current_invoke_thread.lock().unwrap() == Some(std::thread::current().id())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .field("watcher_count", &self.watcher_count.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan_task() -> Arc<Task> { Task::new(Weak::new()) }

    #[test]
    fn args_last_write_wins_on_duplicate_name() {
        let t = orphan_task();
        t.add_arg("x", 1i32);
        t.add_arg("x", 2i32);
        assert_eq!(t.get_arg("x").unwrap().as_i32(), Some(2));
    }

    #[test]
    fn missing_arg_is_not_found() {
        let t = orphan_task();
        assert_eq!(t.get_arg("missing"), Err(ArgError::NotFound("missing".to_string())));
    }

    #[test]
    fn wrong_type_arg_reports_both_type_names() {
        let t = orphan_task();
        t.add_arg("n", 42i32);
        match t.get_arg_str("n") {
            Err(ArgError::WrongType { expected, actual, .. }) => {
                assert_eq!(expected, "str");
                assert_eq!(actual, "i32");
            }
            other => panic!("expected WrongType, got {other:?}"),
        }
    }

    #[test]
    fn task_with_no_watchers_completes_immediately_on_recheck() {
        let t = orphan_task();
        assert!(!t.is_complete());
        assert!(t.try_finalize_completion());
        assert!(t.is_complete());
    }

    #[test]
    fn block_completion_defers_finalization() {
        let t = orphan_task();
        t.block_completion();
        assert!(!t.try_finalize_completion());
        assert!(!t.is_complete());
        t.unblock_completion();
        assert!(t.is_complete());
    }

    #[test]
    fn on_complete_after_already_complete_runs_immediately() {
        let t = orphan_task();
        assert!(t.try_finalize_completion());
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        t.on_complete(move |_| ran_clone.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn thread_local_roundtrips_while_simulating_an_active_callback() {
        let t = orphan_task();
        t.set_current_invoke_thread(Some(std::thread::current().id()));
        t.set_thread_local(7, Box::new(123i32), None);
        assert_eq!(t.get_thread_local::<i32>(7), Some(123));
        assert_eq!(t.get_thread_local::<i32>(999), None);
        t.set_current_invoke_thread(None);
    }

    #[test]
    fn thread_local_is_isolated_per_task() {
        let a = orphan_task();
        let b = orphan_task();
        let here = Some(std::thread::current().id());
        a.set_current_invoke_thread(here);
        a.set_thread_local(1, Box::new("for-a".to_string()), None);
        a.set_current_invoke_thread(None);

        b.set_current_invoke_thread(here);
        assert_eq!(b.get_thread_local::<String>(1), None, "a different task must not see another task's slot");
        b.set_current_invoke_thread(None);
    }

    #[test]
    fn overwriting_a_thread_local_slot_runs_the_old_destroy_notify() {
        let t = orphan_task();
        t.set_current_invoke_thread(Some(std::thread::current().id()));
        let destroyed = Arc::new(AtomicBool::new(false));
        let destroyed_clone = destroyed.clone();
        t.set_thread_local(1, Box::new(1i32), Some(Box::new(move |_| destroyed_clone.store(true, Ordering::SeqCst))));
        assert!(!destroyed.load(Ordering::SeqCst));
        t.set_thread_local(1, Box::new(2i32), None);
        assert!(destroyed.load(Ordering::SeqCst));
        assert_eq!(t.get_thread_local::<i32>(1), Some(2));
        t.set_current_invoke_thread(None);
    }
}
