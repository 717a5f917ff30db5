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

//! Multiplexes an ordered sequence of [`OutputStream`]s onto a single fd,
//! one at a time, so several producers can share one connection without
//! interleaving their bytes.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use hrt_core::task::Task;

use crate::stream::OutputStream;

pub struct OutputChain {
    task: Arc<Task>,
    fd: AtomicI32,
    streams: Mutex<VecDeque<Arc<OutputStream>>>,
    head: Mutex<Option<Arc<OutputStream>>>,
    empty_notify: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    has_empty_notified: AtomicBool,
    has_ever_had_stream: AtomicBool,
    /// Whether this chain currently holds a completion block on `task`.
    /// Held only while the chain is non-empty (streams queued or a head
    /// active), not for the chain's whole lifetime.
    completion_blocked: AtomicBool,
    errored: AtomicBool,
}

impl OutputChain {
    pub fn new(task: &Arc<Task>) -> Arc<Self> {
        Arc::new(Self {
            task: task.clone(),
            fd: AtomicI32::new(-1),
            streams: Mutex::new(VecDeque::new()),
            head: Mutex::new(None),
            empty_notify: Mutex::new(None),
            has_empty_notified: AtomicBool::new(false),
            has_ever_had_stream: AtomicBool::new(false),
            completion_blocked: AtomicBool::new(false),
            errored: AtomicBool::new(false),
        })
    }

    /// Enqueues `stream`. Must only be called from the chain's own task
    /// thread (i.e. from a callback already running on `task`, or before
    /// the runner has started dispatching any work for it). If the chain is
    /// already errored, `stream` is immediately errored and dropped rather
    /// than enqueued.
    pub fn add_stream(self: &Arc<Self>, stream: Arc<OutputStream>) {
        if self.errored.load(Ordering::Acquire) {
            stream.error();
            return;
        }
        self.has_ever_had_stream.store(true, Ordering::Release);
        self.has_empty_notified.store(false, Ordering::Release);
        self.streams.lock().unwrap().push_back(stream);
        self.block_if_needed();
        self.advance();
    }

    /// Only meaningful from the chain's own task thread. Propagates to the
    /// current head stream only; a future head picks up the new fd when it
    /// is promoted.
    pub fn set_fd(self: &Arc<Self>, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
        let head = self.head.lock().unwrap().clone();
        match head {
            Some(head) => head.set_fd(fd),
            None => self.advance(),
        }
    }

    pub fn set_empty_notify(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.empty_notify.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn is_empty(&self) -> bool { self.streams.lock().unwrap().is_empty() && self.head.lock().unwrap().is_none() }

    pub fn got_error(&self) -> bool { self.errored.load(Ordering::Acquire) }

    fn block_if_needed(&self) {
        if !self.completion_blocked.swap(true, Ordering::AcqRel) {
            self.task.block_completion();
        }
    }

    fn unblock_if_held(self: &Arc<Self>) {
        if self.completion_blocked.swap(false, Ordering::AcqRel) {
            self.task.unblock_completion();
        }
    }

    fn maybe_empty_notify(&self) {
        if !self.has_empty_notified.swap(true, Ordering::AcqRel) {
            if let Some(cb) = self.empty_notify.lock().unwrap().as_ref() {
                cb();
            }
        }
    }

    /// The serialization algorithm: retires a finished head, promotes the
    /// next queued stream, or notices the chain has gone empty. Always runs
    /// on the chain's task thread — called directly from `add_stream`/
    /// `set_fd`, and re-entered via a stream's done-notify or an immediate
    /// watcher, both of which fire on this task.
    fn advance(self: &Arc<Self>) {
        let mut errored_now = false;
        {
            let mut head_guard = self.head.lock().unwrap();
            if let Some(head) = head_guard.as_ref() {
                if head.is_done() {
                    let had_error = head.got_error();
                    head.set_fd(-1);
                    *head_guard = None;
                    errored_now = had_error;
                } else {
                    return; // still draining; wait for its done-notify
                }
            }
        }

        if errored_now {
            self.errored.store(true, Ordering::Release);
            let remaining: Vec<_> = self.streams.lock().unwrap().drain(..).collect();
            for s in remaining {
                s.error();
            }
            self.unblock_if_held();
            self.maybe_empty_notify();
            return;
        }

        let fd = self.fd.load(Ordering::Acquire);
        if fd >= 0 {
            let next = self.streams.lock().unwrap().pop_front();
            if let Some(stream) = next {
                *self.head.lock().unwrap() = Some(stream.clone());
                let chain = self.clone();
                stream.set_done_notify(move || chain.advance());
                if stream.is_done() {
                    let chain = self.clone();
                    self.task.add_immediate(Box::new(move |_task, _watcher| {
                        chain.advance();
                        false
                    }));
                } else {
                    stream.set_fd(fd);
                }
                return;
            }
        }

        if self.is_empty() {
            self.maybe_empty_notify();
            if self.has_ever_had_stream.load(Ordering::Acquire) {
                self.unblock_if_held();
            }
        }
    }
}

impl std::fmt::Debug for OutputChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputChain")
            .field("errored", &self.errored.load(Ordering::Relaxed))
            .field("empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrt_core::buffer::{Buffer, Encoding};
    use hrt_core::runner::{RunnerConfig, TaskRunner};
    use std::io::Read;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn lock_of(bytes: &[u8]) -> hrt_core::buffer::LockedBuffer {
        let mut b = Buffer::create(Encoding::Binary);
        b.append_ascii(bytes);
        b.lock()
    }

    #[test]
    fn orders_bytes_across_streams_in_registration_order() {
        let runner = TaskRunner::new(RunnerConfig { num_invoke_threads: 2 }).unwrap();
        let task = runner.create_task();
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let chain = OutputChain::new(&task);

        let s1 = OutputStream::new(&task);
        s1.write(lock_of(b"one-"));
        s1.close();
        let s2 = OutputStream::new(&task);
        s2.write(lock_of(b"two-"));
        s2.close();

        chain.add_stream(s1);
        chain.add_stream(s2);
        chain.set_fd(a.as_raw_fd());

        let expected = b"one-\0two-\0";
        let mut received = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut b = b;
        b.set_nonblocking(true).unwrap();
        while received.len() < expected.len() && std::time::Instant::now() < deadline {
            let mut chunk = [0u8; 64];
            match b.read(&mut chunk) {
                Ok(n) if n > 0 => received.extend_from_slice(&chunk[..n]),
                _ => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        assert_eq!(received, expected);
        runner.shutdown();
        drop(a);
    }

    #[test]
    fn empty_chain_notifies_and_unblocks_completion() {
        let runner = TaskRunner::new(RunnerConfig { num_invoke_threads: 1 }).unwrap();
        let task = runner.create_task();
        let chain = OutputChain::new(&task);
        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = notified.clone();
        chain.set_empty_notify(move || { notified_clone.fetch_add(1, Ordering::SeqCst); });

        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        chain.set_fd(a.as_raw_fd());

        let zero_len = OutputStream::new(&task);
        zero_len.close();
        chain.add_stream(zero_len);

        std::thread::sleep(Duration::from_millis(100));
        assert!(chain.is_empty());
        assert!(notified.load(Ordering::SeqCst) >= 1);
        runner.shutdown();
    }
}
