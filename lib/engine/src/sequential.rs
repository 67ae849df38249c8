// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-rank advance loop.
//!
//! Locally-held curves split into a *resident* set (block currently loaded)
//! and a *waiting* set (block known but cold). The resident set is sorted so
//! curves sharing an already-loaded block run back to back, amortizing each
//! block load across every curve that needs it. A curve whose new position
//! maps to no known block is terminated as a boundary exit; that is an
//! ordinary outcome, never an error or a retry.
//!
//! The same machinery backs two drive loops: the static-domain serial
//! engine implemented here (curves follow block ownership, synchronous
//! convergence rounds), and the scheduler worker, which retains only
//! blocks it has loaded and routes everything else through its manager.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use pathline_comm::{CommLayer, Delivery, MessageTag, PollMode};
use pathline_core::{
    BlockId, BlockMap, BlockStore, Curve, CurveStatus, Integrator, Locator, ProgressReport, Rank,
};

use crate::{Engine, EngineError, IterationOutcome, RunStats};

/// Which curves this rank keeps advancing itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainPolicy {
    /// Keep curves whose next block this rank owns (static-domain mode).
    OwnedBlocks,
    /// Advance only curves whose block this rank has loaded; everything
    /// else waits in the backlog for a scheduler directive (worker mode).
    /// The engine never loads a block on its own under this policy.
    LoadedBlocks,
}

/// Result of one bounded advance pass.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Advance units consumed.
    pub advanced: usize,
    /// Curves that left for a block another rank owns (static-domain mode
    /// only; the worker policy keeps everything in its backlog). Route them
    /// with [`SequentialEngine::prepare_handoff`] before sending.
    pub departures: Vec<Curve>,
}

pub struct SequentialEngine {
    comm: Arc<CommLayer>,
    blocks: BlockMap,
    integrator: Arc<dyn Integrator>,
    locator: Arc<dyn Locator>,
    store: Arc<dyn BlockStore>,
    retain: RetainPolicy,

    resident: VecDeque<Curve>,
    waiting: Vec<Curve>,
    /// Curves stopped at a temporal boundary whose next slice is not known
    /// yet; they rejoin the waiting set on `reset_for_continuation`.
    paused: Vec<Curve>,
    /// Terminated curves and stay-behind hop segments, kept for reassembly.
    fragments: Vec<Curve>,

    stats: RunStats,
    progress: Option<flume::Sender<ProgressReport>>,
    seeded: u64,
    sent: u64,
    received: u64,
    initialized: bool,
}

impl SequentialEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comm: Arc<CommLayer>,
        blocks: BlockMap,
        integrator: Arc<dyn Integrator>,
        locator: Arc<dyn Locator>,
        store: Arc<dyn BlockStore>,
        retain: RetainPolicy,
        progress: Option<flume::Sender<ProgressReport>>,
    ) -> Self {
        Self {
            comm,
            blocks,
            integrator,
            locator,
            store,
            retain,
            resident: VecDeque::new(),
            waiting: Vec::new(),
            paused: Vec::new(),
            fragments: Vec::new(),
            stats: RunStats::default(),
            progress,
            seeded: 0,
            sent: 0,
            received: 0,
            initialized: false,
        }
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn blocks(&self) -> &BlockMap {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut BlockMap {
        &mut self.blocks
    }

    /// Curves still advancing or waiting on a block locally.
    pub fn active_count(&self) -> usize {
        self.resident.len() + self.waiting.len()
    }

    /// True when `advance_batch` could make progress right now. Under the
    /// worker policy a backlog of cold-block curves is not runnable until
    /// a directive loads one of their blocks, so callers must park rather
    /// than spin on it.
    pub fn has_runnable_work(&self) -> bool {
        if !self.resident.is_empty() {
            return true;
        }
        match self.retain {
            RetainPolicy::OwnedBlocks => !self.waiting.is_empty(),
            RetainPolicy::LoadedBlocks => self
                .waiting
                .iter()
                .any(|c| c.block().is_some_and(|b| self.store.is_loaded(b))),
        }
    }

    pub fn terminated_count(&self) -> u64 {
        self.stats.terminated
    }

    /// Active curves grouped by their current block.
    pub fn active_by_block(&self) -> Vec<(BlockId, u32)> {
        let mut counts = std::collections::BTreeMap::new();
        for curve in self.resident.iter().chain(self.waiting.iter()) {
            if let Some(block) = curve.block() {
                *counts.entry(block).or_insert(0u32) += 1;
            }
        }
        counts.into_iter().collect()
    }

    pub fn comm(&self) -> &Arc<CommLayer> {
        &self.comm
    }

    /// Take ownership of a curve arriving from a seed set or another rank.
    /// Curves with no candidate block terminate immediately as boundary
    /// exits.
    pub fn enqueue(&mut self, mut curve: Curve) {
        if curve.status.is_terminal() {
            self.finalize(curve);
            return;
        }
        if curve.candidate_blocks.is_empty() {
            curve.candidate_blocks = self.locator.candidate_blocks(&curve);
        }
        match curve.block() {
            None => {
                curve.status = boundary_exit_for(curve.status);
                self.finalize(curve);
            }
            Some(block) if curve.status == CurveStatus::AtTemporalBoundary
                && !self.blocks.is_known(block) =>
            {
                // Next time slice is not available yet; park until
                // `reset_for_continuation`.
                self.paused.push(curve);
            }
            Some(block) if self.store.is_loaded(block) => {
                curve.status = CurveStatus::Ok;
                self.resident.push_back(curve);
            }
            Some(_) => {
                curve.status = CurveStatus::Ok;
                self.waiting.push(curve);
            }
        }
    }

    /// Record curves received from another rank and queue them.
    pub fn receive(&mut self, curves: Vec<Curve>) {
        self.received += curves.len() as u64;
        for curve in curves {
            self.enqueue(curve);
        }
    }

    /// Split the trajectory recorded here off as a stay-behind fragment and
    /// return the transferable remainder. The caller must actually send it;
    /// ownership moves with the bundle. A curve that never advanced here
    /// (only the arrival joint on record) passes through whole, leaving no
    /// fragment behind.
    pub fn prepare_handoff(&mut self, mut curve: Curve) -> Curve {
        self.sent += 1;
        if curve.trajectory.len() > 1 {
            let fragment = curve.split_fragment();
            trace!(id = curve.id, sequence = fragment.sequence, "handoff");
            self.fragments.push(fragment);
            self.stats.handoffs += 1;
        }
        curve
    }

    /// Curves in the waiting set grouped by block: the scheduler's view of
    /// a worker's out-of-block backlog.
    pub fn waiting_by_block(&self) -> Vec<(BlockId, u32)> {
        let mut counts = std::collections::BTreeMap::new();
        for curve in &self.waiting {
            if let Some(block) = curve.block() {
                *counts.entry(block).or_insert(0u32) += 1;
            }
        }
        counts.into_iter().collect()
    }

    /// Remove and return every waiting curve bound for `block`, up to
    /// `max` of them.
    pub fn take_waiting_for(&mut self, block: BlockId, max: usize) -> Vec<Curve> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.waiting.len());
        for curve in self.waiting.drain(..) {
            if taken.len() < max && curve.block() == Some(block) {
                taken.push(curve);
            } else {
                kept.push(curve);
            }
        }
        self.waiting = kept;
        taken
    }

    /// Advance up to `max_units` units of work. Pops the highest-priority
    /// curve, ensures its block is loaded, and advances it until it leaves
    /// the block or terminates; repeats until the budget or the local work
    /// runs out.
    pub fn advance_batch(&mut self, max_units: usize) -> Result<BatchOutcome, EngineError> {
        let mut outcome = BatchOutcome::default();

        while outcome.advanced < max_units {
            let Some(mut curve) = self.next_curve()? else {
                break;
            };
            // next_curve loaded the block before handing the curve out.
            let block = curve.block().expect("resident curve has a block");

            loop {
                curve.status = self.integrator.advance(&mut curve, block);
                self.stats.steps += 1;
                outcome.advanced += 1;
                match curve.status {
                    CurveStatus::Ok => {
                        if outcome.advanced >= max_units {
                            // Budget exhausted mid-curve; keep it resident.
                            self.resident.push_front(curve);
                            return Ok(outcome);
                        }
                    }
                    CurveStatus::AtSpatialBoundary | CurveStatus::AtTemporalBoundary => {
                        self.route_boundary_curve(curve, &mut outcome)?;
                        break;
                    }
                    _ => {
                        self.finalize(curve);
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Load a block now and mark it resident, promoting any backlog curves
    /// waiting on it. Workers call this on a force-load directive.
    pub fn load_block(&mut self, block: BlockId) -> Result<(), EngineError> {
        if !self.store.is_loaded(block) {
            debug!(rank = self.rank(), %block, "loading block");
            self.store
                .load(block)
                .map_err(|e| EngineError::Load(block, e.to_string()))?;
        }
        self.blocks.mark_loaded(self.rank(), block);
        Ok(())
    }

    /// Move terminated or force-drained curves straight into the fragment
    /// set, bypassing the work queues. Curves still marked in flight are
    /// stamped terminated so reassembly can claim them.
    pub fn absorb_terminated(&mut self, curves: Vec<Curve>) {
        for mut curve in curves {
            if !curve.status.is_terminal() {
                curve.status = CurveStatus::TerminatedByCriterion;
            }
            self.finalize(curve);
        }
    }

    /// Pop the next curve to advance. Refills and re-sorts the resident
    /// queue from the waiting set when it drains; under the worker policy
    /// only curves whose block is already loaded are promoted, so the
    /// scheduler stays in charge of what gets loaded.
    fn next_curve(&mut self) -> Result<Option<Curve>, EngineError> {
        if self.resident.is_empty() && !self.waiting.is_empty() {
            let store = &self.store;
            self.waiting
                .sort_by_key(|c| c.residency_key(|b| store.is_loaded(b)));
            match self.retain {
                RetainPolicy::OwnedBlocks => {
                    self.resident.extend(self.waiting.drain(..));
                }
                RetainPolicy::LoadedBlocks => {
                    let split = self
                        .waiting
                        .partition_point(|c| c.block().is_some_and(|b| store.is_loaded(b)));
                    self.resident.extend(self.waiting.drain(..split));
                }
            }
        }

        let Some(curve) = self.resident.pop_front() else {
            return Ok(None);
        };
        let block = curve.block().expect("queued curve has a block");
        if !self.store.is_loaded(block) {
            self.load_block(block)?;
        }
        Ok(Some(curve))
    }

    fn route_boundary_curve(
        &mut self,
        mut curve: Curve,
        outcome: &mut BatchOutcome,
    ) -> Result<(), EngineError> {
        curve.candidate_blocks = self.locator.candidate_blocks(&curve);
        let Some(next) = curve.block() else {
            curve.status = boundary_exit_for(curve.status);
            self.finalize(curve);
            return Ok(());
        };

        if curve.status == CurveStatus::AtTemporalBoundary && !self.blocks.is_known(next) {
            self.paused.push(curve);
            return Ok(());
        }

        let keep = match self.retain {
            RetainPolicy::OwnedBlocks => self.blocks.owner_of(next)? == self.rank(),
            RetainPolicy::LoadedBlocks => {
                // Stays in the local backlog either way; a block outside the
                // known range is still fatal.
                self.blocks.owner_of(next)?;
                true
            }
        };
        if keep {
            curve.status = CurveStatus::Ok;
            if self.store.is_loaded(next) {
                self.resident.push_back(curve);
            } else {
                self.waiting.push(curve);
            }
        } else {
            outcome.departures.push(curve);
        }
        Ok(())
    }

    fn finalize(&mut self, curve: Curve) {
        trace!(id = curve.id, status = ?curve.status, "curve terminated");
        self.stats.record_terminal(curve.status);
        self.fragments.push(curve);
        if let Some(progress) = &self.progress {
            let _ = progress.send(ProgressReport {
                resolved: self.stats.terminated as usize,
                total: self.seeded as usize,
            });
        }
    }

    fn require_initialized(&self) -> Result<(), EngineError> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineError::Uninitialized)
        }
    }
}

#[async_trait]
impl Engine for SequentialEngine {
    async fn initialize(&mut self, seeds: Vec<Curve>) -> Result<(), EngineError> {
        self.seeded = seeds.len() as u64;
        for curve in seeds {
            self.enqueue(curve);
        }
        self.initialized = true;
        debug!(
            rank = self.rank(),
            resident = self.resident.len(),
            waiting = self.waiting.len(),
            "engine initialized"
        );
        Ok(())
    }

    /// One synchronous round of the static-domain loop: ingest arrivals,
    /// drain local work, ship departures to their owning ranks, then agree
    /// globally on convergence. Every rank runs the same rounds, so the
    /// closing all-reduce is aligned across the mesh.
    async fn run_one_iteration(&mut self) -> Result<IterationOutcome, EngineError> {
        self.require_initialized()?;
        self.stats.iterations += 1;

        let mode = if self.active_count() == 0 {
            PollMode::Timeout(Duration::from_millis(2))
        } else {
            PollMode::NonBlocking
        };
        let comm = self.comm.clone();
        for delivery in comm.poll(&[MessageTag::CurveTransfer], mode).await? {
            if let Delivery::Curves { curves, .. } = delivery {
                self.receive(curves);
            }
        }

        let outcome = self.advance_batch(usize::MAX)?;

        // Ship each departure to the rank owning its next block, batched by
        // destination.
        let mut by_dst: HashMap<Rank, Vec<Curve>> = HashMap::new();
        for curve in outcome.departures {
            let block = curve.block().expect("departure has a block");
            let dst = self.blocks.owner_of(block)?;
            let transferable = self.prepare_handoff(curve);
            by_dst.entry(dst).or_default().push(transferable);
        }
        for (dst, curves) in by_dst {
            self.comm.send_curves(dst, curves)?;
        }

        let progressed = outcome.advanced > 0;
        let [active, sent, received] = comm
            .allreduce_sum([self.active_count() as u64, self.sent, self.received])
            .await?;
        if active == 0 && sent == received {
            self.stats.log_summary(self.rank());
            return Ok(IterationOutcome::Finished);
        }
        Ok(if progressed {
            IterationOutcome::Progressed
        } else {
            IterationOutcome::Idle
        })
    }

    fn reset_for_continuation(&mut self) -> Result<(), EngineError> {
        self.require_initialized()?;
        let rank = self.rank();
        for block in self.blocks.loaded_blocks(rank) {
            self.store.unload(block);
            self.blocks.mark_unloaded(rank, block);
        }
        // Paused curves rejoin once the caller has extended the block map
        // with the next slice; everything re-sorts on the next round.
        self.waiting.extend(self.resident.drain(..));
        let paused = std::mem::take(&mut self.paused);
        for curve in paused {
            self.enqueue(curve);
        }
        self.sent = 0;
        self.received = 0;
        Ok(())
    }

    fn check_next_time_step_needed(&self) -> bool {
        !self.paused.is_empty()
    }

    fn take_fragments(&mut self) -> Vec<Curve> {
        std::mem::take(&mut self.fragments)
    }

    fn stats(&self) -> &RunStats {
        &self.stats
    }
}

fn boundary_exit_for(status: CurveStatus) -> CurveStatus {
    match status {
        CurveStatus::AtTemporalBoundary => CurveStatus::ExitedTemporalBoundary,
        _ => CurveStatus::ExitedSpatialBoundary,
    }
}
