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

//! Task/watcher scheduling core for a concurrent I/O runtime.
//!
//! A [`Task`](task::Task) receives a stream of asynchronous events (timers,
//! fd readiness, completion of other tasks, direct wake-ups) and processes
//! them one at a time; the [`TaskRunner`](runner::TaskRunner) processes many
//! tasks in parallel on a pool of invoke threads while guaranteeing that
//! callbacks belonging to the same task never run concurrently with each
//! other.

pub mod buffer;
pub mod event_loop;
pub mod invoker;
pub mod logging;
pub mod runner;
pub mod task;
pub mod value;
pub mod watcher;

pub use buffer::{Buffer, BufferAllocator, Encoding, LockedBuffer};
pub use runner::{RunnerConfig, TaskRunner};
pub use task::{ArgError, Task, ThreadLocalDestroy};
pub use value::Value;
pub use watcher::{IoFlags, Watcher};
