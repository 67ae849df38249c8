// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block identity and per-rank residency bookkeeping.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Rank;

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// Fatal: routing decisions assume every block is in the known range.
    #[error("block {0} is outside the known block range")]
    UnknownBlock(BlockId),

    #[error("rank {0} is outside the communicator (world size {1})")]
    UnknownRank(Rank, u32),
}

/// One spatial partition of the dataset at one time step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub timestep: u32,
    pub domain: u32,
}

impl BlockId {
    pub fn new(domain: u32, timestep: u32) -> Self {
        Self { timestep, domain }
    }

    /// Dense ordering key: time-major, then domain.
    pub fn linear(&self) -> u64 {
        ((self.timestep as u64) << 32) | self.domain as u64
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}@t{}", self.domain, self.timestep)
    }
}

/// Block ownership and loaded-state, shared by the engines and the scheduler.
///
/// Ownership is static (exactly one owning rank per block); "loaded" is an
/// independent per-(rank, block) fact. A block must only be marked loaded
/// after its data is actually resident, because routing decisions trust the
/// loaded flags.
#[derive(Debug, Clone, Default)]
pub struct BlockMap {
    owners: HashMap<BlockId, Rank>,
    loaded: HashSet<(Rank, BlockId)>,
    world_size: u32,
}

impl BlockMap {
    pub fn new(world_size: u32) -> Self {
        Self {
            owners: HashMap::new(),
            loaded: HashSet::new(),
            world_size,
        }
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn assign(&mut self, block: BlockId, owner: Rank) -> Result<(), BlockError> {
        if owner >= self.world_size {
            return Err(BlockError::UnknownRank(owner, self.world_size));
        }
        self.owners.insert(block, owner);
        Ok(())
    }

    pub fn owner_of(&self, block: BlockId) -> Result<Rank, BlockError> {
        self.owners
            .get(&block)
            .copied()
            .ok_or(BlockError::UnknownBlock(block))
    }

    pub fn is_known(&self, block: BlockId) -> bool {
        self.owners.contains_key(&block)
    }

    pub fn is_loaded(&self, rank: Rank, block: BlockId) -> bool {
        self.loaded.contains(&(rank, block))
    }

    pub fn mark_loaded(&mut self, rank: Rank, block: BlockId) {
        self.loaded.insert((rank, block));
    }

    pub fn mark_unloaded(&mut self, rank: Rank, block: BlockId) {
        self.loaded.remove(&(rank, block));
    }

    pub fn loaded_count(&self, rank: Rank) -> usize {
        self.loaded.iter().filter(|(r, _)| *r == rank).count()
    }

    pub fn loaded_blocks(&self, rank: Rank) -> Vec<BlockId> {
        let mut blocks: Vec<BlockId> = self
            .loaded
            .iter()
            .filter(|(r, _)| *r == rank)
            .map(|(_, b)| *b)
            .collect();
        blocks.sort();
        blocks
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.owners.keys().copied()
    }
}
