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

//! S3/S4: an ordered chain of streams of varied length multiplexed onto one
//! end of a connected socket pair, including the error-propagation variant.

use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use hrt_core::buffer::{Buffer, Encoding};
use hrt_core::runner::{RunnerConfig, TaskRunner};
use hrt_io::{OutputChain, OutputStream};

/// Deterministic periodic byte sequence of `len` bytes seeded by `seed`.
fn seeded_stream(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

fn locked(bytes: &[u8]) -> hrt_core::buffer::LockedBuffer {
    let mut b = Buffer::create(Encoding::Binary);
    b.append_ascii(bytes);
    b.lock()
}

/// S3 — six streams of varied length, each writing a distinct periodic seed,
/// multiplexed onto one fd. The reader must observe each stream's bytes, in
/// registration order, with no interleaving.
#[test]
fn six_streams_preserve_order_and_content() {
    let runner = TaskRunner::new(RunnerConfig { num_invoke_threads: 4 }).unwrap();
    let task = runner.create_task();
    let (writer_end, mut reader_end) = UnixStream::pair().unwrap();
    writer_end.set_nonblocking(true).unwrap();

    let lengths = [100usize, 15_000, 231, 35_232, 1_234, 0];
    let mut expected = Vec::new();
    let chain = OutputChain::new(&task);
    let mut streams = Vec::new();
    for (seed, &len) in lengths.iter().enumerate() {
        let bytes = seeded_stream(seed as u8, len);
        expected.extend_from_slice(&bytes);
        expected.push(0); // trailing NUL the buffer always carries
        let stream = OutputStream::new(&task);
        stream.write(locked(&bytes));
        stream.close();
        streams.push(stream);
    }
    for stream in streams {
        chain.add_stream(stream);
    }
    chain.set_fd(writer_end.as_raw_fd());

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    reader_end.set_nonblocking(true).unwrap();
    while received.len() < expected.len() && Instant::now() < deadline {
        let mut chunk = [0u8; 4096];
        match reader_end.read(&mut chunk) {
            Ok(n) if n > 0 => received.extend_from_slice(&chunk[..n]),
            _ => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    assert_eq!(received, expected, "bytes must match each stream's generator, in registration order");
    runner.shutdown();
    drop(writer_end);
}

/// S4 — same chain, but the reader end is closed before anything is read.
/// At least one stream, and then the chain, must end up errored; streams
/// added afterward are immediately errored; the chain's task still
/// completes exactly once.
#[test]
fn closed_reader_propagates_error_through_the_chain() {
    let runner = TaskRunner::new(RunnerConfig { num_invoke_threads: 4 }).unwrap();
    let task = runner.create_task();
    let (writer_end, reader_end) = UnixStream::pair().unwrap();
    writer_end.set_nonblocking(true).unwrap();
    drop(reader_end); // nobody will ever read; writes eventually fail

    let chain = OutputChain::new(&task);
    let big = seeded_stream(7, 1_000_000); // large enough to not fit in the socket buffer
    let s1 = OutputStream::new(&task);
    s1.write(locked(&big));
    s1.close();
    chain.add_stream(s1);
    chain.set_fd(writer_end.as_raw_fd());

    let deadline = Instant::now() + Duration::from_secs(10);
    while !chain.got_error() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(chain.got_error(), "chain should have entered the errored state");

    let s2 = OutputStream::new(&task);
    chain.add_stream(s2.clone());
    assert!(s2.got_error(), "streams added after the chain errors are immediately errored");

    assert!(runner.pop_completed_timeout(Duration::from_secs(5)).is_some());
    assert!(runner.pop_completed_timeout(Duration::from_millis(100)).is_none(), "exactly one completion");
    runner.shutdown();
}
