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

//! [`TaskRunner`]: owns a pool of invoke threads plus the reactor thread
//! that drives the event loop, and is the factory for every [`Task`] in a
//! given runtime instance.
//!
//! Tasks never run their callbacks concurrently with themselves: each task
//! has an [`Invoker`](crate::invoker::Invoker) queue, and only one invoke
//! thread at a time may be draining a given task's queue (`Invoker::try_claim`).
//! Across different tasks, callbacks run fully in parallel, one per invoke
//! thread.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info};

use crate::event_loop::{EventLoop, MioEventLoop};
use crate::task::Task;
use crate::watcher::{Watcher, WatcherKind};

/// Tuning knobs for a [`TaskRunner`]. `Default` picks a small fixed-size
/// invoke pool; embedders with more cores to spare can size it up.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of invoke threads draining the shared dispatch queue.
    pub num_invoke_threads: usize,
}

impl Default for RunnerConfig {
    /// Sizes the pool to the available CPU parallelism, falling back to a
    /// single invoke thread if the platform can't report one.
    fn default() -> Self {
        let n = std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1);
        Self { num_invoke_threads: n }
    }
}

pub struct TaskRunner {
    event_loop: Arc<dyn EventLoop>,
    dispatch_tx: Sender<Arc<Task>>,
    dispatch_rx: Receiver<Arc<Task>>,
    completed_tx: Sender<Arc<Task>>,
    completed_rx: Receiver<Arc<Task>>,
    idle: Mutex<VecDeque<(Arc<Task>, Watcher)>>,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    reactor_thread: Mutex<Option<JoinHandle<()>>>,
    reactor_flag: Mutex<Option<Arc<AtomicBool>>>,
    self_weak: Weak<TaskRunner>,
    config: RunnerConfig,
    on_completable: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl TaskRunner {
    /// Builds a runner and starts its invoke threads and reactor thread.
    /// Uses `Arc::new_cyclic` so `self_weak` is available to hand to every
    /// [`Task`] the runner creates, without `Task` holding a strong `Arc`
    /// back to its runner (which would keep the runner alive forever).
    pub fn new(config: RunnerConfig) -> io::Result<Arc<Self>> {
        let event_loop: Arc<dyn EventLoop> = Arc::new(MioEventLoop::new()?);
        let (dispatch_tx, dispatch_rx) = unbounded();
        let (completed_tx, completed_rx) = unbounded();

        let runner = Arc::new_cyclic(|weak| TaskRunner {
            event_loop,
            dispatch_tx,
            dispatch_rx,
            completed_tx,
            completed_rx,
            idle: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
            reactor_thread: Mutex::new(None),
            reactor_flag: Mutex::new(None),
            self_weak: weak.clone(),
            config,
            on_completable: Mutex::new(None),
        });

        runner.spawn_threads();
        Ok(runner)
    }

    fn spawn_threads(self: &Arc<Self>) {
        // The reactor thread's running flag is separate from the invoke
        // threads' because `EventLoop::run` borrows it for the thread's
        // entire lifetime; `shutdown` flips both.
        let reactor_running = Arc::new(AtomicBool::new(true));
        *self.reactor_flag.lock().unwrap() = Some(reactor_running.clone());
        let reactor_runner = self.clone();
        self.reactor_thread
            .lock()
            .unwrap()
            .replace(std::thread::spawn(move || reactor_runner.event_loop.run(&reactor_running)));

        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.config.num_invoke_threads.max(1) {
            let runner = self.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("hrt-invoke-{i}"))
                    .spawn(move || runner.invoke_thread_main())
                    .expect("failed to spawn invoke thread"),
            );
        }
    }

    pub fn create_task(self: &Arc<Self>) -> Arc<Task> { Task::new(self.self_weak.clone()) }

    pub(crate) fn register_watcher(self: &Arc<Self>, task: &Arc<Task>, watcher: &Watcher) {
        match watcher.kind() {
            WatcherKind::Immediate => task.push_and_schedule(watcher.clone()),
            WatcherKind::Idle => self.idle.lock().unwrap().push_back((task.clone(), watcher.clone())),
            WatcherKind::Io => {
                if let Err(err) = self.event_loop.register_io(task, watcher) {
                    tracing::warn!(%err, fd = ?watcher.fd(), "failed to register I/O watcher");
                }
            }
            WatcherKind::Subtask | WatcherKind::RemovalMarker => {
                // Subtask watchers are wired up directly between the two
                // tasks in Task::add_subtask; removal markers never go
                // through registration.
            }
        }
    }

    pub(crate) fn requeue_idle(&self, task: Arc<Task>, watcher: Watcher) {
        self.idle.lock().unwrap().push_back((task, watcher));
    }

    fn pop_idle(&self) -> Option<(Arc<Task>, Watcher)> { self.idle.lock().unwrap().pop_front() }

    /// Schedules `task` for draining: if no invoke thread currently owns its
    /// invoker, claims it and pushes it onto the shared dispatch queue.
    pub(crate) fn watcher_pending(&self, task: &Arc<Task>) {
        if task.invoker.try_claim() {
            let _ = self.dispatch_tx.send(task.clone());
        }
    }

    pub(crate) fn queue_completed(&self, task: Arc<Task>) {
        debug!(task = task.id(), "queuing completed task");
        let _ = self.completed_tx.send(task);
        if let Some(cb) = self.on_completable.lock().unwrap().as_ref() {
            cb();
        }
    }

    /// Registers a wake hint: invoked whenever a task has become completable
    /// and been pushed onto the completed-task queue. This is *not* itself
    /// the completion delivery — it may run on whichever thread finalized
    /// the task (an invoke thread, or any thread that called
    /// [`Task::unblock_completion`] or [`Watcher::remove`](crate::watcher::Watcher::remove)).
    /// The embedder's own runner-thread loop is expected to respond to this
    /// hint by draining [`Self::pop_completed`] until it returns `None`,
    /// mirroring how a binding would wake its own main-context idle source
    /// rather than running user code directly from here.
    pub fn set_on_completable(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.on_completable.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Pops the next completed task, if any, without blocking. Embedders
    /// drain this however suits them — a dedicated thread, a poll loop, etc.
    pub fn pop_completed(&self) -> Option<Arc<Task>> { self.completed_rx.try_recv().ok() }

    /// Blocks up to `timeout` for the next completed task.
    pub fn pop_completed_timeout(&self, timeout: Duration) -> Option<Arc<Task>> {
        self.completed_rx.recv_timeout(timeout).ok()
    }

    fn invoke_thread_main(self: Arc<Self>) {
        loop {
            match self.dispatch_rx.try_recv() {
                Ok(task) => {
                    self.drain(task);
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            if let Some((task, watcher)) = self.pop_idle() {
                task.push_and_schedule(watcher);
                continue;
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            match self.dispatch_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(task) => self.drain(task),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Drains every watcher currently queued for `task`, invoking callbacks
    /// one at a time, then releases ownership. If a watcher fired
    /// concurrently with the drain finishing (a push raced the release),
    /// `Invoker::release` reports leftover work and the task is rescheduled
    /// rather than left stuck with pending work nobody will drain.
    fn drain(self: &Arc<Self>, task: Arc<Task>) {
        task.set_current_invoke_thread(Some(std::thread::current().id()));
        while let Some(watcher) = task.invoker.pop() {
            if watcher.kind() == WatcherKind::RemovalMarker {
                task.recheck_completability();
                continue;
            }
            let stay_armed = watcher.invoke(&task);
            if !stay_armed {
                if !watcher.is_removed() {
                    watcher.remove();
                }
                if watcher.kind() == WatcherKind::Io {
                    self.event_loop.deregister_io(&watcher);
                }
            } else {
                match watcher.kind() {
                    WatcherKind::Io => {
                        if let Err(err) = self.event_loop.rearm_io(&watcher) {
                            tracing::warn!(%err, "failed to rearm I/O watcher");
                        }
                    }
                    WatcherKind::Idle => self.requeue_idle(task.clone(), watcher.clone()),
                    // Immediate watchers that stay armed re-fire as soon as the
                    // runner can schedule them again (spec: "re-started unless
                    // the callback returned false or they were removed") —
                    // pushing back onto this task's own invoker does exactly
                    // that, since nothing else gates an immediate watcher.
                    WatcherKind::Immediate => task.push_and_schedule(watcher.clone()),
                    _ => {}
                }
            }
        }
        task.set_current_invoke_thread(None);
        if task.invoker.release() {
            self.watcher_pending(&task);
        } else {
            task.try_finalize_completion();
        }
    }

    /// Signals shutdown: invoke threads finish their current drain and exit,
    /// the reactor thread's blocking poll is woken and told to stop.
    pub fn shutdown(&self) {
        info!("task runner shutting down");
        self.running.store(false, Ordering::Release);
        if let Some(flag) = self.reactor_flag.lock().unwrap().as_ref() {
            flag.store(false, Ordering::Release);
        }
        self.event_loop.wake();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.reactor_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner").field("running", &self.running.load(Ordering::Relaxed)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc as StdArc;

    #[test]
    fn immediate_watcher_runs_and_task_completes() {
        let runner = TaskRunner::new(RunnerConfig { num_invoke_threads: 2 }).unwrap();
        let task = runner.create_task();
        let ran = StdArc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        task.add_immediate(Box::new(move |_task, _watcher| {
            ran_clone.store(true, Ordering::SeqCst);
            false
        }));
        let completed = runner.pop_completed_timeout(Duration::from_secs(2));
        assert!(completed.is_some());
        assert!(ran.load(Ordering::SeqCst));
        runner.shutdown();
    }

    #[test]
    fn subtask_watcher_fires_after_subtask_completes() {
        let runner = TaskRunner::new(RunnerConfig { num_invoke_threads: 2 }).unwrap();
        let parent = runner.create_task();
        let child = runner.create_task();
        let fired = StdArc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        parent.add_subtask(
            &child,
            Box::new(move |_task, _watcher| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
                false
            }),
        );
        child.add_immediate(Box::new(|task, _watcher| {
            task.set_result(Value::from(1i32));
            false
        }));
        // both tasks should complete: child first, then parent once notified
        let first = runner.pop_completed_timeout(Duration::from_secs(2));
        let second = runner.pop_completed_timeout(Duration::from_secs(2));
        assert!(first.is_some());
        assert!(second.is_some());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        runner.shutdown();
    }

    #[test]
    fn idle_watcher_eventually_fires_when_nothing_else_is_pending() {
        let runner = TaskRunner::new(RunnerConfig { num_invoke_threads: 1 }).unwrap();
        let task = runner.create_task();
        let fired = StdArc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        task.add_idle(Box::new(move |_task, _watcher| {
            fired_clone.store(true, Ordering::SeqCst);
            false
        }));
        std::thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));
        runner.shutdown();
    }
}
