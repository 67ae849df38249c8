// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Manager-side view of one worker.
//!
//! Reports overwrite this record wholesale; between reports the manager
//! adjusts it optimistically as it issues directives, so the next decision
//! pass does not re-target curves already ordered to move. A status report
//! racing such an adjustment can drive a count negative; the most recent
//! report is ground truth, so the count is clamped to zero and logged
//! rather than treated as corruption.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use pathline_core::{BlockId, Rank};

use crate::message::StatusReport;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    rank: Rank,
    /// Curves outstanding on this worker.
    ic_count: u32,
    by_block: HashMap<BlockId, u32>,
    loaded: HashSet<BlockId>,
    terminated: u64,
    /// Set by each report, cleared once a decision pass has consumed it.
    just_updated: bool,
    /// Whether this worker has ever reported.
    reported: bool,
}

impl PeerRecord {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            ic_count: 0,
            by_block: HashMap::new(),
            loaded: HashSet::new(),
            terminated: 0,
            just_updated: false,
            reported: false,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn ic_count(&self) -> u32 {
        self.ic_count
    }

    pub fn terminated(&self) -> u64 {
        self.terminated
    }

    pub fn loaded_block_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn has_loaded(&self, block: BlockId) -> bool {
        self.loaded.contains(&block)
    }

    pub fn loaded_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.loaded.iter().copied()
    }

    pub fn backlog_for(&self, block: BlockId) -> u32 {
        self.by_block.get(&block).copied().unwrap_or(0)
    }

    /// Blocks this worker holds curves for but has not loaded.
    pub fn unloaded_backlog(&self) -> impl Iterator<Item = (BlockId, u32)> + '_ {
        self.by_block
            .iter()
            .filter(|(b, n)| **n > 0 && !self.loaded.contains(*b))
            .map(|(b, n)| (*b, *n))
    }

    /// The block with the most curves waiting on this worker.
    pub fn largest_backlog(&self) -> Option<(BlockId, u32)> {
        self.by_block
            .iter()
            .filter(|(_, n)| **n > 0)
            .max_by_key(|(b, n)| (**n, std::cmp::Reverse(b.linear())))
            .map(|(b, n)| (*b, *n))
    }

    pub fn just_updated(&self) -> bool {
        self.just_updated
    }

    pub fn clear_just_updated(&mut self) {
        self.just_updated = false;
    }

    /// Replace everything with the worker's own snapshot.
    pub fn apply_report(&mut self, report: &StatusReport) {
        self.ic_count = report.active_total();
        self.by_block = report.active_by_block.iter().copied().collect();
        self.loaded = report.loaded_blocks.iter().copied().collect();
        self.terminated += report.terminated_delta;
        self.just_updated = true;
        self.reported = true;
    }

    /// Whether this worker has reported at least once.
    pub fn has_reported(&self) -> bool {
        self.reported
    }

    /// Optimistic credit after the manager routes curves toward this worker.
    pub fn credit(&mut self, block: BlockId, count: u32) {
        self.ic_count += count;
        *self.by_block.entry(block).or_insert(0) += count;
    }

    /// Optimistic debit after the manager orders curves away from this
    /// worker. Clamped at zero; see the module docs.
    pub fn debit(&mut self, block: BlockId, count: u32) {
        let held = self.by_block.entry(block).or_insert(0);
        if count > *held {
            warn!(
                rank = self.rank,
                %block,
                held = *held,
                debit = count,
                "backlog count went negative, clamping to zero"
            );
        }
        *held = held.saturating_sub(count);
        if count > self.ic_count {
            warn!(
                rank = self.rank,
                held = self.ic_count,
                debit = count,
                "active count went negative, clamping to zero"
            );
        }
        self.ic_count = self.ic_count.saturating_sub(count);
    }

    /// Mark a load the manager has ordered but not yet seen reported.
    pub fn assume_loaded(&mut self, block: BlockId) {
        self.loaded.insert(block);
    }
}
