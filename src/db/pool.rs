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

//! Fixed-size pool of pre-opened `DbHandle`s.
//!
//! A naive semaphore-plus-mutex pairing can check `count < capacity` and
//! then wait on the semaphore as two separate steps, letting two threads
//! both pass the check before either actually waits and handing out the
//! same slot twice under load. A `Mutex` + `Condvar` collapses both into
//! one lock: a waiter blocks *inside* the critical section and is woken
//! only after a handle is actually queued, so there is no window between
//! "I can proceed" and "I hold the resource".

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A fixed-size FIFO pool of `H`, handed out one at a time via
/// [`PooledConnection`] RAII guards.
pub struct DbHandlePool<H> {
    queue: Mutex<VecDeque<H>>,
    available: Condvar,
}

impl<H> DbHandlePool<H> {
    /// Builds a pool pre-populated with `handles`. The pool's capacity is
    /// fixed at `handles.len()`; no new handles are ever opened after this.
    pub fn new(handles: Vec<H>) -> Self {
        Self { queue: Mutex::new(handles.into()), available: Condvar::new() }
    }

    /// Number of handles currently checked in.
    pub fn available_count(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Blocks until a handle is available, then checks it out. Returns a
    /// guard that checks the handle back in on drop.
    pub fn get(&self) -> PooledConnection<'_, H> {
        let mut queue = self.queue.lock().unwrap();
        while queue.is_empty() {
            queue = self.available.wait(queue).unwrap();
        }
        let handle = queue.pop_front().expect("queue non-empty under lock");
        PooledConnection { pool: self, handle: Some(handle) }
    }

    fn release(&self, handle: H) {
        self.queue.lock().unwrap().push_back(handle);
        self.available.notify_one();
    }
}

/// A checked-out handle. Returned to the pool automatically when dropped.
pub struct PooledConnection<'a, H> {
    pool: &'a DbHandlePool<H>,
    handle: Option<H>,
}

impl<H> std::ops::Deref for PooledConnection<'_, H> {
    type Target = H;
    fn deref(&self) -> &H {
        self.handle.as_ref().expect("handle taken only by Drop")
    }
}

impl<H> std::ops::DerefMut for PooledConnection<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.handle.as_mut().expect("handle taken only by Drop")
    }
}

impl<H> Drop for PooledConnection<'_, H> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeHandle;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn get_blocks_until_a_handle_is_released() {
        let pool = Arc::new(DbHandlePool::new(vec![FakeHandle::new()]));
        assert_eq!(pool.available_count(), 1);

        let first = pool.get();
        assert_eq!(pool.available_count(), 0);

        let pool2 = Arc::clone(&pool);
        let got_second = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let got_second2 = Arc::clone(&got_second);
        let handle = thread::spawn(move || {
            let _second = pool2.get();
            got_second2.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!got_second.load(std::sync::atomic::Ordering::SeqCst));

        drop(first);
        handle.join().unwrap();
        assert!(got_second.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn released_handle_is_reused_not_leaked() {
        let pool = DbHandlePool::new(vec![FakeHandle::new(), FakeHandle::new()]);
        {
            let _a = pool.get();
            let _b = pool.get();
            assert_eq!(pool.available_count(), 0);
        }
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn concurrent_get_release_never_exceeds_capacity() {
        let pool = Arc::new(DbHandlePool::new(vec![FakeHandle::new(); 4]));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let guard = pool.get();
                        assert!(pool.available_count() <= 3);
                        drop(guard);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(pool.available_count(), 4);
    }
}
