// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-size worker thread pool draining a shared task queue.
//!
//! The reactor thread never blocks on I/O other than polling; once a
//! connection's readiness event names a unit of work (parse + respond, or
//! a blocking DB query), it is boxed up and handed to this pool so the
//! reactor can go back to polling immediately.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool of `n` threads, all draining the same job queue in FIFO order.
pub struct WorkerPool {
    sender: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` worker threads. Panics if `count` is zero.
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "worker pool needs at least one thread");

        let (sender, receiver): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();
        let handles = (0..count)
            .map(|id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("warden-worker-{id}"))
                    .spawn(move || Self::run(receiver))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { sender, handles }
    }

    fn run(receiver: Receiver<Job>) {
        while let Ok(job) = receiver.recv() {
            job();
        }
    }

    /// Queues `job` for the next free worker. Never blocks: the queue is
    /// unbounded, matching the original's fixed-size queue backed by a
    /// condvar that woke exactly one waiter per push.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // The only way this fails is if every worker thread has panicked
        // and dropped its receiver; propagating that as a dropped job
        // matches the original's behavior under a crashed worker.
        let _ = self.sender.send(Box::new(job));
    }

    /// Number of worker threads in the pool.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping `sender` here would require taking it out of `&mut self`;
        // instead we rely on `Sender` being droppable in place once all
        // clones held by threads have also exited their `recv` loop, which
        // happens only after this `Sender` closes. Swap in a disconnected
        // channel to force that.
        let (dead_tx, _dead_rx) = crossbeam_channel::bounded::<Job>(0);
        let _old = std::mem::replace(&mut self.sender, dead_tx);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn every_submitted_job_runs_exactly_once() {
        let pool = WorkerPool::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..200 {
            let count = Arc::clone(&count);
            pool.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(count.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn jobs_run_on_worker_threads_not_the_caller() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        pool.submit(move || {
            tx.send(thread::current().id()).unwrap();
        });
        let ran_on = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn drop_joins_every_worker_thread() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.worker_count(), 3);
        drop(pool);
        // reaching here without hanging demonstrates every thread joined
    }
}
