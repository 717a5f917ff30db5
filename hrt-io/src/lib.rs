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

//! Ordered output chain, built on [`hrt_core`]'s tasks and watchers.
//!
//! An [`OutputStream`](stream::OutputStream) is a FIFO of locked buffers
//! draining to one fd. An [`OutputChain`](chain::OutputChain) multiplexes
//! many such streams onto a single fd, one at a time, in registration
//! order, so several producers can share one connection without
//! interleaving their bytes.

pub mod chain;
pub mod stream;

pub use chain::OutputChain;
pub use stream::OutputStream;
