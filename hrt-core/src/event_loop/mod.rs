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

//! Abstract binding between watchers and an OS-level readiness poller.
//!
//! [`EventLoop`] is the seam between the scheduling core and whatever
//! mechanism actually learns that a file descriptor became readable or
//! writable. [`mio_backend::MioEventLoop`] is the one concrete
//! implementation shipped here; an embedder could swap in another (e.g. one
//! backed by io_uring) without touching [`crate::runner::TaskRunner`].

pub mod mio_backend;

use std::io;
use std::sync::Arc;

use crate::task::Task;
use crate::watcher::Watcher;

pub use mio_backend::MioEventLoop;

/// Binds armed I/O watchers to OS readiness notifications and drives a
/// blocking reactor loop that fires them.
pub trait EventLoop: Send + Sync {
    /// Begins watching `watcher`'s fd for its interest set.
    fn register_io(&self, task: &Arc<Task>, watcher: &Watcher) -> io::Result<()>;

    /// Re-arms interest after a fired edge-triggered watcher that chose to
    /// stay armed. A level-triggered backend may make this a no-op.
    fn rearm_io(&self, watcher: &Watcher) -> io::Result<()>;

    /// Stops watching `watcher`'s fd. Idempotent.
    fn deregister_io(&self, watcher: &Watcher);

    /// Unblocks a thread currently parked in [`Self::run`], e.g. so it can
    /// notice a shutdown request or pick up a registration made from another
    /// thread.
    fn wake(&self);

    /// Blocks the calling thread, polling for readiness and firing watchers,
    /// until `running` is observed to be cleared by another thread (after a
    /// call to [`Self::wake`]).
    fn run(&self, running: &std::sync::atomic::AtomicBool);
}
