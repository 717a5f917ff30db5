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

//! A FIFO of locked buffers draining to one file descriptor.
//!
//! Producers on any thread call [`OutputStream::write`]; draining itself —
//! installing/removing the fd-write watcher and actually calling
//! `send(2)` — only ever happens on the owning task's invoke thread, since
//! it's all driven from a watcher callback on that task.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use hrt_core::buffer::{LockedBuffer, WriteOutcome};
use hrt_core::task::Task;
use hrt_core::watcher::{IoFlags, Watcher};
use tracing::trace;

pub struct OutputStream {
    task: Arc<Task>,
    fd: AtomicI32,
    buffers: Mutex<VecDeque<LockedBuffer>>,
    /// Current buffer plus remaining-bytes cursor. Only ever mutated from
    /// the owning task's invoke thread (inside the write-watcher callback),
    /// but kept behind a `Mutex` since the type is shared across threads.
    cursor: Mutex<Option<(LockedBuffer, usize)>>,
    closed: AtomicBool,
    errored: AtomicBool,
    write_watcher: Mutex<Option<Watcher>>,
    done_notify: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    done_notified: AtomicBool,
}

impl OutputStream {
    /// Creates a stream owned by `task`. Holds a completion block on `task`
    /// until the stream is done, so the task can't complete out from under
    /// a stream that might still have bytes to write.
    pub fn new(task: &Arc<Task>) -> Arc<Self> {
        task.block_completion();
        Arc::new(Self {
            task: task.clone(),
            fd: AtomicI32::new(-1),
            buffers: Mutex::new(VecDeque::new()),
            cursor: Mutex::new(None),
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            write_watcher: Mutex::new(None),
            done_notify: Mutex::new(None),
            done_notified: AtomicBool::new(false),
        })
    }

    /// Appends `buf` to the stream, unless it's already closed or errored
    /// (in which case the write is silently dropped).
    pub fn write(self: &Arc<Self>, buf: LockedBuffer) {
        if self.closed.load(Ordering::Acquire) || self.errored.load(Ordering::Acquire) {
            return;
        }
        self.buffers.lock().unwrap().push_back(buf);
        self.check_write_watcher();
    }

    /// At-most-once transition to closed. If the stream is already fully
    /// drained, this is also the moment it becomes done.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.check_write_watcher();
        self.maybe_notify_done();
    }

    /// Marks the stream permanently errored: implies close, drops whatever
    /// is still queued (on the task thread, via an immediate watcher, so
    /// buffer drop — and any destroy-notify it triggers — is serialized
    /// with the rest of this task's callbacks), and silently discards
    /// further writes from here on.
    pub fn error(self: &Arc<Self>) {
        if self.errored.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.store(true, Ordering::Release);
        let stream = self.clone();
        self.task.add_immediate(Box::new(move |_task, _watcher| {
            stream.buffers.lock().unwrap().clear();
            *stream.cursor.lock().unwrap() = None;
            stream.check_write_watcher();
            stream.maybe_notify_done();
            false
        }));
    }

    /// `-1` pauses the stream (no writes attempted); `>= 0` resumes it. The
    /// stream does not own the fd — whoever sets it is responsible for its
    /// lifetime.
    pub fn set_fd(self: &Arc<Self>, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
        self.check_write_watcher();
    }

    /// One-shot notification that the stream has become done. If the stream
    /// is already done and already notified by the time this is called, the
    /// callback is never invoked — callers that care should check
    /// [`Self::is_done`] first.
    pub fn set_done_notify(self: &Arc<Self>, cb: impl FnOnce() + Send + 'static) {
        *self.done_notify.lock().unwrap() = Some(Box::new(cb));
        self.maybe_notify_done();
    }

    pub fn is_done(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            && self.cursor.lock().unwrap().is_none()
            && self.buffers.lock().unwrap().is_empty()
    }

    pub fn got_error(&self) -> bool { self.errored.load(Ordering::Acquire) }

    fn check_write_watcher(self: &Arc<Self>) {
        let fd = self.fd.load(Ordering::Acquire);
        let errored = self.errored.load(Ordering::Acquire);
        let queue_nonempty = self.cursor.lock().unwrap().is_some() || !self.buffers.lock().unwrap().is_empty();
        let want = queue_nonempty && fd >= 0 && !errored;

        let mut guard = self.write_watcher.lock().unwrap();
        match (want, guard.is_some()) {
            (true, false) => {
                let stream = self.clone();
                let watcher = self.task.add_io(fd, IoFlags::WRITE, Box::new(move |_task, _watcher| stream.on_write_ready()));
                *guard = Some(watcher);
            }
            (false, true) => {
                if let Some(w) = guard.take() {
                    w.remove();
                }
            }
            _ => {}
        }
    }

    /// Runs on the owning task's invoke thread as the fd-write watcher's
    /// callback. Returns whether the watcher should stay armed.
    fn on_write_ready(self: &Arc<Self>) -> bool {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return false;
        }
        loop {
            if self.cursor.lock().unwrap().is_none() {
                match self.buffers.lock().unwrap().pop_front() {
                    Some(buf) => {
                        let len = buf.len();
                        *self.cursor.lock().unwrap() = Some((buf, len));
                    }
                    None => break,
                }
            }

            let outcome = {
                let mut cursor = self.cursor.lock().unwrap();
                let (buf, remaining) = cursor.as_mut().expect("cursor populated above");
                buf.write(fd, remaining)
            };

            match outcome {
                WriteOutcome::Sent(n) => {
                    trace!(bytes = n, "output stream wrote buffer chunk");
                    let buffer_done = matches!(&*self.cursor.lock().unwrap(), Some((_, 0)));
                    if buffer_done {
                        *self.cursor.lock().unwrap() = None;
                        continue;
                    }
                    return true; // buffer partially sent; wait for next writable event
                }
                WriteOutcome::WouldBlock => return true,
                WriteOutcome::Fatal(err) => {
                    trace!(%err, "output stream fd write failed");
                    *self.write_watcher.lock().unwrap() = None;
                    self.error();
                    return false;
                }
            }
        }
        *self.write_watcher.lock().unwrap() = None;
        self.maybe_notify_done();
        false
    }

    fn maybe_notify_done(self: &Arc<Self>) {
        if !self.is_done() {
            return;
        }
        if self.done_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cb) = self.done_notify.lock().unwrap().take() {
            cb();
        }
        self.task.unblock_completion();
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("errored", &self.errored.load(Ordering::Relaxed))
            .field("done", &self.is_done())
            .finish()
    }
}
