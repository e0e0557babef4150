// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer ordering for pre-copy.
//!
//! Two disjoint structures: a FIFO queue of blocks the peer has asked for
//! (`prioritise`), and the pool of remaining blocks ranked by ascending
//! volatility. Cold blocks go first; they are unlikely to dirty again and
//! are therefore the safest early sends.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::storage::VolatilityMonitor;

/// Classifier for a block handed out by [`PriorityBlockOrder::next`].
/// The engine applies its concurrency limit per class so priority sends
/// are never starved by standard ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockClass {
    Priority,
    Standard,
    Dirty,
}

struct OrderState {
    /// Blocks not yet handed out, ranked lazily by volatility.
    pending: BTreeSet<u64>,
    /// FIFO of peer-requested blocks; disjoint from `pending`.
    priority: VecDeque<u64>,
}

/// Produces the next block index to transfer.
pub struct PriorityBlockOrder {
    monitor: Arc<VolatilityMonitor>,
    state: Mutex<OrderState>,
}

impl PriorityBlockOrder {
    pub fn new(monitor: Arc<VolatilityMonitor>) -> Arc<Self> {
        Arc::new(Self {
            monitor,
            state: Mutex::new(OrderState {
                pending: BTreeSet::new(),
                priority: VecDeque::new(),
            }),
        })
    }

    /// Enqueue every block of the device once.
    pub fn add_all(&self) {
        let total = self.monitor.total_blocks();
        let mut state = self.state.lock().unwrap();
        state.pending.extend(0..total);
    }

    /// Move `block` into the priority queue. Idempotent; a no-op for a
    /// block that has already been handed out or removed.
    pub fn prioritise(&self, block: u64) {
        let mut state = self.state.lock().unwrap();
        if state.pending.remove(&block) {
            state.priority.push_back(block);
        }
    }

    /// Drop `block` from both structures; `next()` will not return it.
    pub fn remove(&self, block: u64) {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(&block);
        state.priority.retain(|&b| b != block);
    }

    /// Number of blocks still queued, both classes.
    pub fn remaining(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.pending.len() + state.priority.len()
    }

    /// The next block to send: the head of the priority FIFO if any,
    /// otherwise the lowest-volatility pending block (ties broken by
    /// ascending index).
    pub fn next(&self) -> Option<(u64, BlockClass)> {
        let mut state = self.state.lock().unwrap();
        if let Some(block) = state.priority.pop_front() {
            return Some((block, BlockClass::Priority));
        }
        let coldest = state
            .pending
            .iter()
            .map(|&b| (self.monitor.score(b), b))
            .min()?
            .1;
        state.pending.remove(&coldest);
        Some((coldest, BlockClass::Standard))
    }
}
