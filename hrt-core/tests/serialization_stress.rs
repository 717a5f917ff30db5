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

//! Stress test for testable property 1: at any instant, at most one invoke
//! thread is running a callback that belongs to a given task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hrt_core::runner::{RunnerConfig, TaskRunner};

/// `(task_index, entered_at_micros, left_at_micros)` — recorded relative to a
/// shared start instant since `Instant::now()` inside the runner is fine (it's
/// the workflow script layer, not this crate, that can't call it).
type Interval = (usize, u128, u128);

#[test]
fn no_two_intervals_for_the_same_task_overlap() {
    const TASKS: usize = 30;
    const WATCHERS_PER_TASK: usize = 6;

    let runner = TaskRunner::new(RunnerConfig { num_invoke_threads: 8 }).unwrap();
    let start = Instant::now();
    let intervals: Arc<Mutex<Vec<Interval>>> = Arc::new(Mutex::new(Vec::new()));
    let remaining = Arc::new(AtomicUsize::new(TASKS * WATCHERS_PER_TASK));

    for task_idx in 0..TASKS {
        let task = runner.create_task();
        for _ in 0..WATCHERS_PER_TASK {
            let intervals = intervals.clone();
            let remaining = remaining.clone();
            task.add_immediate(Box::new(move |_task, _watcher| {
                let entered = start.elapsed().as_micros();
                std::thread::sleep(Duration::from_micros(300));
                let left = start.elapsed().as_micros();
                intervals.lock().unwrap().push((task_idx, entered, left));
                remaining.fetch_sub(1, Ordering::SeqCst);
                false
            }));
        }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while remaining.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(remaining.load(Ordering::SeqCst), 0, "all watchers should have run");

    let recorded = intervals.lock().unwrap();
    let mut by_task: Vec<Vec<(u128, u128)>> = vec![Vec::new(); TASKS];
    for &(task_idx, entered, left) in recorded.iter() {
        by_task[task_idx].push((entered, left));
    }
    for mut spans in by_task {
        spans.sort_unstable();
        for window in spans.windows(2) {
            let (_, prev_left) = window[0];
            let (next_entered, _) = window[1];
            assert!(
                prev_left <= next_entered,
                "overlapping invocations for the same task: {:?} vs {:?}",
                window[0],
                window[1]
            );
        }
    }
    runner.shutdown();
}
