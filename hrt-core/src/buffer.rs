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

//! Appendable-then-immutable byte buffer with a pluggable allocator.
//!
//! A [`Buffer`] is exclusively owned while it is being built up with
//! [`Buffer::append_ascii`]. Calling [`Buffer::lock`] consumes it and hands
//! back a [`LockedBuffer`], an `Arc`-backed handle that may be shared and
//! sent across threads but never mutated again (aside from [`LockedBuffer::steal`],
//! a one-shot "take the storage out" operation for a single-threaded
//! consumer). Encoding never changes after creation.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

/// Element encoding. Length and capacity below are expressed in elements
/// (bytes for Utf8/Binary, 16-bit code units for Utf16), not necessarily
/// equal to the number of bytes backing the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Utf16,
    Binary,
}

impl Encoding {
    fn unit_size(self) -> usize {
        match self {
            Encoding::Utf16 => 2,
            Encoding::Utf8 | Encoding::Binary => 1,
        }
    }
}

/// Pluggable allocation strategy for buffer storage. The default allocator
/// just grows a `Vec<u8>`; embedders with their own arena/slab allocator can
/// implement this to hand out storage from elsewhere.
pub trait BufferAllocator: Send + Sync {
    fn alloc(&self, capacity_bytes: usize) -> Vec<u8>;
    fn grow(&self, buf: Vec<u8>, new_capacity_bytes: usize) -> Vec<u8>;
}

#[derive(Debug, Default)]
pub struct DefaultAllocator;

impl BufferAllocator for DefaultAllocator {
    fn alloc(&self, capacity_bytes: usize) -> Vec<u8> { Vec::with_capacity(capacity_bytes) }

    fn grow(&self, mut buf: Vec<u8>, new_capacity_bytes: usize) -> Vec<u8> {
        if new_capacity_bytes > buf.capacity() {
            buf.reserve(new_capacity_bytes - buf.capacity());
        }
        buf
    }
}

/// A handle to an allocator plus an optional one-shot destroy-notify, fired
/// exactly once when the last [`Buffer`]/[`LockedBuffer`] referencing this
/// handle drops.
pub struct AllocatorHandle {
    allocator: Arc<dyn BufferAllocator>,
    on_last_drop: Option<Box<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for AllocatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorHandle")
            .field("has_destroy_notify", &self.on_last_drop.is_some())
            .finish()
    }
}

impl AllocatorHandle {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Arc<Self> {
        Arc::new(Self { allocator, on_last_drop: None })
    }

    pub fn with_destroy_notify(
        allocator: Arc<dyn BufferAllocator>,
        notify: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { allocator, on_last_drop: Some(Box::new(notify)) })
    }

    fn noop() -> Arc<Self> { Self::new(Arc::new(DefaultAllocator)) }

    fn default_handle() -> Arc<Self> { Self::new(Arc::new(DefaultAllocator)) }
}

impl Drop for AllocatorHandle {
    fn drop(&mut self) {
        if let Some(notify) = &self.on_last_drop {
            notify();
        }
    }
}

/// An appendable byte container. Only one thread may hold and mutate a
/// `Buffer` at a time — the type itself enforces this, since `append_ascii`
/// takes `&mut self` and there is no way to share an unlocked `Buffer`
/// between threads. [`Buffer::lock`] is the only way to make it shareable.
pub struct Buffer {
    encoding: Encoding,
    data: Vec<u8>,
    len: usize,
    capacity: usize,
    allocator: Arc<AllocatorHandle>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("encoding", &self.encoding)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Buffer {
    pub fn create(encoding: Encoding) -> Self { Self::create_with_allocator(encoding, AllocatorHandle::default_handle()) }

    pub fn create_with_allocator(encoding: Encoding, allocator: Arc<AllocatorHandle>) -> Self {
        Self { encoding, data: Vec::new(), len: 0, capacity: 0, allocator }
    }

    /// Pre-locked buffer backed by non-owned `'static` storage.
    pub fn create_static_utf8(s: &'static str) -> LockedBuffer {
        let bytes = s.as_bytes();
        LockedBuffer(Arc::new(LockedInner {
            encoding: Encoding::Utf8,
            state: Mutex::new(LockedState { bytes: Storage::Static(bytes), len: bytes.len() }),
            allocator: AllocatorHandle::noop(),
        }))
    }

    pub fn encoding(&self) -> Encoding { self.encoding }

    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    fn ensure_capacity(&mut self, additional_elements: usize) {
        let needed_elements = self.len + additional_elements + 1; // +1 for the trailing NUL element
        if needed_elements <= self.capacity {
            return;
        }
        let new_capacity = if self.capacity == 0 {
            needed_elements // exact fit on first write
        } else {
            needed_elements.max(self.capacity * 2)
        };
        let unit = self.encoding.unit_size();
        let grown = self.allocator.allocator.grow(std::mem::take(&mut self.data), new_capacity * unit);
        self.data = grown;
        self.data.resize(new_capacity * unit, 0);
        self.capacity = new_capacity;
    }

    /// Appends `bytes`, widening each byte to a 16-bit code unit on the
    /// `Utf16` path. Precondition: the caller is the sole owner of this
    /// buffer (guaranteed by the type, since `Buffer` cannot be shared).
    pub fn append_ascii(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        let unit = self.encoding.unit_size();
        for (i, &b) in bytes.iter().enumerate() {
            let idx = (self.len + i) * unit;
            match self.encoding {
                Encoding::Utf16 => {
                    self.data[idx..idx + 2].copy_from_slice(&(b as u16).to_le_bytes());
                }
                Encoding::Utf8 | Encoding::Binary => {
                    self.data[idx] = b;
                }
            }
        }
        self.len += bytes.len();
        let nul_idx = self.len * unit;
        self.data[nul_idx..nul_idx + unit].fill(0);
    }

    /// Marks the buffer immutable, handing back a shareable handle. The
    /// storage is truncated to exactly `len` elements plus the trailing NUL —
    /// any extra geometric-growth capacity is dropped here so that
    /// [`LockedBuffer::steal`] yields exactly the appended bytes followed by
    /// one NUL, never leftover capacity.
    pub fn lock(self) -> LockedBuffer {
        let Buffer { encoding, mut data, len, allocator, .. } = self;
        let unit = encoding.unit_size();
        let keep = (len + 1) * unit;
        data.truncate(keep);
        LockedBuffer(Arc::new(LockedInner {
            encoding,
            state: Mutex::new(LockedState { bytes: Storage::Owned(data), len }),
            allocator,
        }))
    }
}

enum Storage {
    Owned(Vec<u8>),
    Static(&'static [u8]),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(v) => v,
            Storage::Static(s) => s,
        }
    }
}

struct LockedState {
    bytes: Storage,
    len: usize,
}

struct LockedInner {
    encoding: Encoding,
    state: Mutex<LockedState>,
    #[allow(dead_code)] // kept alive so the destroy-notify fires when the buffer drops
    allocator: Arc<AllocatorHandle>,
}

/// A locked, immutable, ref-counted, shareable buffer.
#[derive(Clone)]
pub struct LockedBuffer(Arc<LockedInner>);

impl fmt::Debug for LockedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedBuffer").field("encoding", &self.0.encoding).field("len", &self.len()).finish()
    }
}

/// Outcome of a nonblocking send, distinguishing would-block from a fatal
/// error without collapsing to a single boolean (`is_fatal` recovers the
/// spec's two-way contract for callers that only care about that).
#[derive(Debug)]
pub enum WriteOutcome {
    Sent(usize),
    WouldBlock,
    Fatal(std::io::Error),
}

impl WriteOutcome {
    pub fn is_fatal(&self) -> bool { matches!(self, WriteOutcome::Fatal(_)) }
}

impl LockedBuffer {
    pub fn encoding(&self) -> Encoding { self.0.encoding }

    pub fn len(&self) -> usize { self.0.state.lock().unwrap().len }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Returns a copy of the buffer's current bytes (including the trailing
    /// NUL). Stable for the buffer's remaining lifetime unless [`Self::steal`]
    /// is called.
    pub fn peek(&self) -> Vec<u8> { self.0.state.lock().unwrap().bytes.as_slice().to_vec() }

    /// Transfers storage ownership out, leaving the buffer empty. Intended
    /// for a single-threaded consumer; concurrent calls each get a disjoint
    /// (possibly empty) slice of what was there, never a torn read.
    pub fn steal(&self) -> Vec<u8> {
        let mut state = self.0.state.lock().unwrap();
        let taken = std::mem::replace(&mut state.bytes, Storage::Owned(Vec::new()));
        state.len = 0;
        match taken {
            Storage::Owned(v) => v,
            Storage::Static(s) => s.to_vec(),
        }
    }

    /// Nonblocking send of the trailing `*remaining` bytes to `fd`. Returns
    /// `WouldBlock` without changing `*remaining` on EAGAIN/EWOULDBLOCK,
    /// `Fatal` on any other error, and `Sent(n)` after subtracting `n` from
    /// `*remaining` on success. The underlying `send(2)` is issued with
    /// MSG_NOSIGNAL | MSG_DONTWAIT | MSG_MORE semantics (no SIGPIPE,
    /// non-blocking, "more data coming" hint).
    pub fn write(&self, fd: RawFd, remaining: &mut usize) -> WriteOutcome {
        let state = self.0.state.lock().unwrap();
        let all = state.bytes.as_slice();
        let total = all.len();
        debug_assert!(*remaining <= total);
        let start = total - *remaining;
        let slice = &all[start..];
        if slice.is_empty() {
            return WriteOutcome::Sent(0);
        }
        match raw_send::send_nosignal_dontwait_more(fd, slice) {
            raw_send::SendResult::Sent(n) => {
                *remaining -= n;
                WriteOutcome::Sent(n)
            }
            raw_send::SendResult::WouldBlock => WriteOutcome::WouldBlock,
            raw_send::SendResult::Fatal(e) => WriteOutcome::Fatal(e),
        }
    }
}

mod raw_send {
    use std::os::unix::io::RawFd;

    pub enum SendResult {
        Sent(usize),
        WouldBlock,
        Fatal(std::io::Error),
    }

    #[cfg(target_os = "linux")]
    fn flags() -> libc::c_int { libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT | libc::MSG_MORE }

    // MSG_NOSIGNAL and MSG_MORE are Linux extensions; other Unixes rely on
    // SO_NOSIGPIPE (set once at socket-creation time by the caller) instead,
    // so only MSG_DONTWAIT is portable here.
    #[cfg(not(target_os = "linux"))]
    fn flags() -> libc::c_int { libc::MSG_DONTWAIT }

    pub fn send_nosignal_dontwait_more(fd: RawFd, buf: &[u8]) -> SendResult {
        let ret = unsafe {
            libc::send(fd, buf.as_ptr().cast(), buf.len(), flags())
        };
        if ret >= 0 {
            SendResult::Sent(ret as usize)
        } else {
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::WouldBlock => SendResult::WouldBlock,
                std::io::ErrorKind::Interrupted => SendResult::Sent(0),
                _ => SendResult::Fatal(err),
            }
        }
    }
}
