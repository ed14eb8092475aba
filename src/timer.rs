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

//! Min-heap deadline timer used to evict idle connections.
//!
//! A binary min-heap ordered by expiry, with an auxiliary `id -> index` map
//! kept consistent through every swap so that `adjust`/`cancel` by id are
//! `O(log n)` instead of a linear scan.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What to do when a timer fires. The reactor only ever needs to close a
/// connection by its token, so this is a tagged variant rather than a
/// generic closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Close the connection identified by this slab index / mio token.
    CloseConn(usize),
}

#[derive(Debug)]
struct TimerNode {
    id: usize,
    expires: Instant,
    action: TimerAction,
}

/// A min-heap of `(expiry, id, action)` keyed by `id`.
#[derive(Debug, Default)]
pub struct DeadlineHeap {
    heap: Vec<TimerNode>,
    index_of: HashMap<usize, usize>,
}

impl DeadlineHeap {
    /// Creates an empty heap with room for 64 entries before its first
    /// reallocation.
    pub fn new() -> Self {
        Self { heap: Vec::with_capacity(64), index_of: HashMap::new() }
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// `true` if there are no live timers.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Adds a new timer for `id`, or updates the expiry/action of an
    /// existing one.
    pub fn add(&mut self, id: usize, timeout: Duration, action: TimerAction) {
        if let Some(&i) = self.index_of.get(&id) {
            self.heap[i].expires = Instant::now() + timeout;
            self.heap[i].action = action;
            if !self.heapify_down(i) {
                self.heapify_up(i);
            }
        } else {
            let i = self.heap.len();
            self.index_of.insert(id, i);
            self.heap.push(TimerNode { id, expires: Instant::now() + timeout, action });
            self.heapify_up(i);
        }
    }

    /// Defers `id`'s expiry to `now + timeout`, sifting it into place.
    /// No-op if `id` has no live timer.
    pub fn adjust(&mut self, id: usize, timeout: Duration) {
        let Some(&i) = self.index_of.get(&id) else { return };
        self.heap[i].expires = Instant::now() + timeout;
        if !self.heapify_down(i) {
            self.heapify_up(i);
        }
    }

    /// Cancels `id`'s timer without running its action, if one exists.
    pub fn cancel(&mut self, id: usize) {
        if let Some(&i) = self.index_of.get(&id) {
            self.delete(i);
        }
    }

    /// Removes `id`'s timer and returns its action for the caller to run,
    /// if one exists.
    pub fn do_work(&mut self, id: usize) -> Option<TimerAction> {
        let &i = self.index_of.get(&id)?;
        let action = self.heap[i].action;
        self.delete(i);
        Some(action)
    }

    /// Pops every timer whose expiry has already passed and returns their
    /// actions in expiry order, for the caller (the reactor) to run.
    /// Actions are data rather than closures so popping them never needs
    /// mutable access to anything but this heap.
    pub fn pop_expired(&mut self) -> Vec<TimerAction> {
        let mut fired = Vec::new();
        while let Some(node) = self.heap.first() {
            if node.expires > Instant::now() {
                break;
            }
            fired.push(node.action);
            self.pop();
        }
        fired
    }

    /// Milliseconds until the next expiry, `0` if already due, or `-1` if
    /// the heap is empty. Does not itself pop anything; call
    /// `pop_expired` first.
    pub fn next_timeout_ms(&self) -> i64 {
        match self.heap.first() {
            None => -1,
            Some(node) => {
                let remaining = node.expires.saturating_duration_since(Instant::now());
                remaining.as_millis() as i64
            }
        }
    }

    /// Empties the heap and its index.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.index_of.clear();
    }

    fn pop(&mut self) {
        self.delete(0);
    }

    fn delete(&mut self, idx: usize) {
        let last = self.heap.len() - 1;
        if idx < last {
            self.swap_nodes(idx, last);
            if !self.heapify_down(idx) {
                self.heapify_up(idx);
            }
        }
        let removed = self.heap.pop().expect("delete called on empty heap");
        self.index_of.remove(&removed.id);
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index_of.insert(self.heap[i].id, i);
        self.index_of.insert(self.heap[j].id, j);
    }

    /// Sifts the node at `i` toward the root. The loop guard is `i > 0`,
    /// checked *before* computing the parent index — an unsigned `j >= 0`
    /// guard would always be true and never terminate correctly.
    fn heapify_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Sifts the node at `idx` toward the leaves. Returns whether it moved.
    fn heapify_down(&mut self, idx: usize) -> bool {
        let n = self.heap.len();
        let mut i = idx;
        loop {
            let mut smallest = i;
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            if left < n && self.heap[left].expires < self.heap[smallest].expires {
                smallest = left;
            }
            if right < n && self.heap[right].expires < self.heap[smallest].expires {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap_nodes(i, smallest);
            i = smallest;
        }
        i != idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_always_minimum_expiry() {
        let mut heap = DeadlineHeap::new();
        heap.add(1, Duration::from_millis(500), TimerAction::CloseConn(1));
        heap.add(2, Duration::from_millis(100), TimerAction::CloseConn(2));
        heap.add(3, Duration::from_millis(900), TimerAction::CloseConn(3));
        assert_eq!(heap.heap[0].id, 2);

        heap.adjust(1, Duration::from_millis(10));
        assert_eq!(heap.heap[0].id, 1);
    }

    #[test]
    fn index_map_tracks_every_swap() {
        let mut heap = DeadlineHeap::new();
        for id in 0..20 {
            heap.add(id, Duration::from_millis(1000 - id as u64 * 10), TimerAction::CloseConn(id));
        }
        for (id, &idx) in &heap.index_of {
            assert_eq!(heap.heap[idx].id, *id);
        }
    }

    #[test]
    fn cancel_removes_id_from_both_heap_and_index() {
        let mut heap = DeadlineHeap::new();
        heap.add(1, Duration::from_millis(100), TimerAction::CloseConn(1));
        heap.add(2, Duration::from_millis(200), TimerAction::CloseConn(2));
        heap.cancel(1);
        assert!(heap.index_of.get(&1).is_none());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn clear_empties_heap_and_map() {
        let mut heap = DeadlineHeap::new();
        heap.add(1, Duration::from_millis(100), TimerAction::CloseConn(1));
        heap.clear();
        assert!(heap.is_empty());
        assert!(heap.index_of.is_empty());
    }

    #[test]
    fn earlier_add_pops_before_later_one() {
        let mut heap = DeadlineHeap::new();
        heap.add(10, Duration::from_millis(50), TimerAction::CloseConn(10));
        heap.add(20, Duration::from_millis(5000), TimerAction::CloseConn(20));
        assert_eq!(heap.heap[0].id, 10);
    }

    #[test]
    fn next_timeout_ms_is_negative_one_when_empty() {
        let heap = DeadlineHeap::new();
        assert_eq!(heap.next_timeout_ms(), -1);
    }

    #[test]
    fn pop_expired_drains_only_due_timers_in_expiry_order() {
        let mut heap = DeadlineHeap::new();
        heap.add(1, Duration::from_millis(0), TimerAction::CloseConn(1));
        heap.add(2, Duration::from_millis(0), TimerAction::CloseConn(2));
        heap.add(3, Duration::from_secs(60), TimerAction::CloseConn(3));
        std::thread::sleep(Duration::from_millis(5));
        let fired = heap.pop_expired();
        assert_eq!(fired.len(), 2);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn do_work_removes_and_returns_the_action() {
        let mut heap = DeadlineHeap::new();
        heap.add(7, Duration::from_secs(60), TimerAction::CloseConn(7));
        assert_eq!(heap.do_work(7), Some(TimerAction::CloseConn(7)));
        assert_eq!(heap.do_work(7), None);
    }
}
