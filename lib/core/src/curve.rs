// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integral curve: the unit of distributed work.
//!
//! A `Curve` is owned by exactly one rank at any instant. Rank-to-rank
//! transfer is a move: the sender encodes the curve into an outgoing bundle
//! and drops its copy, the receiver decodes a fresh instance. Each hop bumps
//! the `sequence` counter and leaves the trajectory recorded so far behind on
//! the sending rank as a *fragment*; reassembly glues fragments back together
//! in sequence order once everything has terminated.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::Rank;

/// Stable identity of a logical curve, preserved across rank transfers.
pub type CurveId = u64;

/// Integration direction from the seed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

/// Advection outcome for one curve.
///
/// Everything except `Ok` and the two `At*Boundary` states is terminal.
/// Boundary exits are ordinary outcomes, not errors: a curve that leaves the
/// dataset is reported terminated, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurveStatus {
    /// Still advancing inside its current block.
    Ok,
    /// Met a termination criterion (max steps, max time, ...).
    TerminatedByCriterion,
    /// Sitting on a spatial block boundary; may continue in a neighbor.
    AtSpatialBoundary,
    /// Left the spatial extent of the dataset entirely.
    ExitedSpatialBoundary,
    /// Sitting on a temporal slice boundary; may continue next time step.
    AtTemporalBoundary,
    /// Ran past the last available time step.
    ExitedTemporalBoundary,
    /// Adaptive step size underflowed.
    StepUnderflow,
    /// Solver produced a non-finite state.
    NumericalError,
}

impl CurveStatus {
    /// True when the curve will never advance again.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            CurveStatus::Ok | CurveStatus::AtSpatialBoundary | CurveStatus::AtTemporalBoundary
        )
    }

    /// True for the two "left the dataset" outcomes.
    pub fn is_boundary_exit(self) -> bool {
        matches!(
            self,
            CurveStatus::ExitedSpatialBoundary | CurveStatus::ExitedTemporalBoundary
        )
    }
}

/// One recorded sample along a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub position: [f64; 3],
    pub time: f64,
}

/// A particle trajectory under active or completed advection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Curve {
    /// Stable across the curve's lifetime and across rank transfers.
    pub id: CurveId,
    pub direction: Direction,
    /// Rank that seeded this curve.
    pub origin: Rank,
    /// Per-hop counter; strictly increases along the path the curve travels.
    pub sequence: u32,
    pub status: CurveStatus,
    /// Blocks that might contain the current position, computed without I/O.
    pub candidate_blocks: Vec<BlockId>,
    /// Samples recorded since the last hop (this fragment's segment).
    pub trajectory: Vec<TrajectoryPoint>,
    /// Opaque solver state (position, velocity, integrator internals).
    /// Transported verbatim, never interpreted by the core.
    pub solver_state: Bytes,
}

impl Curve {
    pub fn new(id: CurveId, direction: Direction, origin: Rank, seed: TrajectoryPoint) -> Self {
        Self {
            id,
            direction,
            origin,
            sequence: 0,
            status: CurveStatus::Ok,
            candidate_blocks: Vec::new(),
            trajectory: vec![seed],
            solver_state: Bytes::new(),
        }
    }

    /// The block this curve is currently assigned to, if any.
    pub fn block(&self) -> Option<BlockId> {
        self.candidate_blocks.first().copied()
    }

    /// Sort key used when ordering the resident work queue: curves whose
    /// block is already loaded sort ahead (negative group) of curves whose
    /// block still needs I/O, tie-broken by block index so that all curves
    /// for one block are advanced before the next block is touched.
    pub fn residency_key(&self, loaded: impl Fn(BlockId) -> bool) -> (i8, u64) {
        match self.block() {
            Some(b) if loaded(b) => (-1, b.linear()),
            Some(b) => (1, b.linear()),
            None => (i8::MAX, u64::MAX),
        }
    }

    /// Split off the trajectory recorded so far as a stay-behind fragment and
    /// prepare `self` for transfer: the fragment keeps the current sequence
    /// number and recorded samples; `self` moves to the next hop carrying
    /// only the joint sample, so the next fragment's first point repeats the
    /// previous fragment's last point. Merging drops that duplicate.
    pub fn split_fragment(&mut self) -> Curve {
        let fragment = Curve {
            trajectory: std::mem::take(&mut self.trajectory),
            solver_state: Bytes::new(),
            candidate_blocks: self.candidate_blocks.clone(),
            ..*self
        };
        if let Some(joint) = fragment.trajectory.last() {
            self.trajectory.push(*joint);
        }
        self.sequence += 1;
        fragment
    }
}
