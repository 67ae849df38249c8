// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control traffic between managers and workers. Everything here travels
//! as the application body of a status-tagged message.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use pathline_comm::{CommError, CommLayer};
use pathline_core::{BlockId, Rank};

/// Worker snapshot sent to its manager: the authoritative replacement for
/// whatever the manager believed about this worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub worker: Rank,
    /// Active curves by current block, loaded or not.
    pub active_by_block: Vec<(BlockId, u32)>,
    pub loaded_blocks: Vec<BlockId>,
    /// Curves terminated since the previous report.
    pub terminated_delta: u64,
}

impl StatusReport {
    pub fn active_total(&self) -> u32 {
        self.active_by_block.iter().map(|(_, n)| n).sum()
    }
}

/// Manager order to one worker. Workers obey directives in arrival order
/// and never second-guess them; stale directives resolve as no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    /// Ship the local backlog for `block` directly to `dst`, which already
    /// has the block loaded.
    SendToPeer { block: BlockId, dst: Rank },
    /// Load `block` now; the backlog waiting on it becomes runnable.
    ForceLoad { block: BlockId },
    /// Push up to `max` backlog curves for `block` toward idle `dst`.
    OffloadBacklog { block: BlockId, dst: Rank, max: u32 },
    /// Everything everywhere has terminated; drain and exit the loop.
    Terminate,
}

/// Sub-manager rollup sent one level up the manager tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubReport {
    pub manager: Rank,
    /// Active curves across the whole workgroup, pool included.
    pub outstanding: u64,
    /// Terminated total across the workgroup.
    pub terminated: u64,
    /// The workgroup's most backlogged block, for cross-group pairing.
    pub top_block: Option<(BlockId, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerMsg {
    Report(StatusReport),
    Sub(SubReport),
    Directive(Directive),
}

impl SchedulerMsg {
    pub fn encode(&self) -> Result<Bytes, CommError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map(Bytes::from)
            .map_err(|e| CommError::Decode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(msg, _)| msg)
            .map_err(|e| CommError::Decode(e.to_string()))
    }

    pub fn send(&self, comm: &CommLayer, dst: Rank) -> Result<(), CommError> {
        comm.send_status(dst, self.encode()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_survive_the_wire_encoding() {
        let report = SchedulerMsg::Report(StatusReport {
            worker: 3,
            active_by_block: vec![(BlockId::new(1, 0), 7), (BlockId::new(2, 0), 1)],
            loaded_blocks: vec![BlockId::new(1, 0)],
            terminated_delta: 12,
        });
        let decoded = SchedulerMsg::decode(&report.encode().unwrap()).unwrap();
        assert_eq!(decoded, report);

        let directive = SchedulerMsg::Directive(Directive::OffloadBacklog {
            block: BlockId::new(0, 2),
            dst: 5,
            max: 16,
        });
        let decoded = SchedulerMsg::decode(&directive.encode().unwrap()).unwrap();
        assert_eq!(decoded, directive);
    }
}
