// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Pathline Engine
//!
//! Drive loops that advance curves on one rank: the sequential engine with
//! its block-residency work ordering, and the sequence reassembly protocol
//! that glues cross-rank fragments back into whole trajectories once
//! everything has terminated.

mod reassembly;
mod sequential;
pub mod testing;

use std::collections::HashMap;

use async_trait::async_trait;
use pathline_comm::CommError;
use pathline_core::{BlockError, BlockId, Curve, CurveStatus};

pub use reassembly::{merge_fragments, ReassemblyProtocol};
pub use sequential::{BatchOutcome, RetainPolicy, SequentialEngine};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Fatal: the engine was driven before `initialize`.
    #[error("engine used before initialize")]
    Uninitialized,

    #[error("block {0} failed to load: {1}")]
    Load(BlockId, String),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Outcome of one pass through a drive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Local work was advanced or handed off.
    Progressed,
    /// Nothing local to do; other ranks are still working.
    Idle,
    /// Every curve everywhere has terminated.
    Finished,
}

/// Abstract drive loop, one per rank. Variants (serial static-domain,
/// manager/worker) are selected by a factory at startup; there is no
/// inheritance hierarchy behind this.
#[async_trait]
pub trait Engine: Send {
    /// Seed the engine. Must be called exactly once, before any iteration.
    async fn initialize(&mut self, seeds: Vec<Curve>) -> Result<(), EngineError>;

    /// Advance local work, exchange curves, and report whether the
    /// distributed computation has converged.
    async fn run_one_iteration(&mut self) -> Result<IterationOutcome, EngineError>;

    /// Prepare for the next time slice: residency marks are dropped, curves
    /// paused at the temporal boundary become eligible again.
    fn reset_for_continuation(&mut self) -> Result<(), EngineError>;

    /// True when some curve is paused at a temporal boundary and another
    /// time slice would let it continue.
    fn check_next_time_step_needed(&self) -> bool;

    /// Take the locally retained fragments (terminated curves and
    /// stay-behind hop segments) for reassembly.
    fn take_fragments(&mut self) -> Vec<Curve>;

    fn stats(&self) -> &RunStats;
}

/// Drive an engine until global convergence.
pub async fn drive_to_completion(engine: &mut dyn Engine) -> Result<(), EngineError> {
    loop {
        if engine.run_one_iteration().await? == IterationOutcome::Finished {
            return Ok(());
        }
    }
}

/// Per-rank run counters, logged at completion. Diagnostics only.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub iterations: u64,
    pub steps: u64,
    pub handoffs: u64,
    pub terminated: u64,
    pub by_status: HashMap<CurveStatus, u64>,
}

impl RunStats {
    pub fn record_terminal(&mut self, status: CurveStatus) {
        self.terminated += 1;
        *self.by_status.entry(status).or_default() += 1;
    }

    pub fn log_summary(&self, rank: pathline_core::Rank) {
        tracing::info!(
            rank,
            iterations = self.iterations,
            steps = self.steps,
            handoffs = self.handoffs,
            terminated = self.terminated,
            "run complete"
        );
    }
}
