// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Manager side of the dynamic balancer.
//!
//! A manager never advances curves. It ingests worker reports and homeless
//! curves, runs the decision pass when anything changed, and routes pool
//! curves and directives. The root manager additionally aggregates
//! sub-manager rollups, pairs idle workgroups with busy ones, and declares
//! completion once every seeded curve is accounted for as terminated.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, trace, warn};

use pathline_comm::{CommLayer, Delivery, MessageTag, PollMode};
use pathline_core::{BlockId, Curve, CurveStatus, Locator, PathlineConfig, Rank};
use pathline_engine::{EngineError, IterationOutcome, RunStats};

use crate::cases::{decide, pair_idle_busy, Action, Thresholds};
use crate::message::{Directive, SchedulerMsg, StatusReport, SubReport};
use crate::peer::PeerRecord;

pub struct Manager {
    comm: Arc<CommLayer>,
    locator: Arc<dyn Locator>,
    peers: BTreeMap<Rank, PeerRecord>,
    pool: HashMap<BlockId, Vec<Curve>>,
    fragments: Vec<Curve>,
    stats: RunStats,

    /// Root only: child managers and their latest rollups.
    sub_managers: Vec<Rank>,
    subs: HashMap<Rank, SubReport>,
    /// Non-root only: where rollups go.
    parent: Option<Rank>,
    last_rollup: Option<SubReport>,

    /// Global seed count; only meaningful at the root.
    total: u64,
    overload_factor: f64,
    underload_factor: f64,
    idle_park: Duration,
    rng: StdRng,
    changed: bool,
    done: bool,
}

impl Manager {
    pub fn new(
        comm: Arc<CommLayer>,
        workers: &[Rank],
        sub_managers: Vec<Rank>,
        parent: Option<Rank>,
        locator: Arc<dyn Locator>,
        config: &PathlineConfig,
    ) -> Self {
        let peers = workers.iter().map(|&r| (r, PeerRecord::new(r))).collect();
        // Deterministic per-rank stream; pairing only needs to differ
        // between rounds, not be unpredictable.
        let rng = StdRng::seed_from_u64(0x9e3779b9 ^ comm.rank() as u64);
        Self {
            comm,
            locator,
            peers,
            pool: HashMap::new(),
            fragments: Vec::new(),
            stats: RunStats::default(),
            sub_managers,
            subs: HashMap::new(),
            parent,
            last_rollup: None,
            total: 0,
            overload_factor: config.overload_factor,
            underload_factor: config.underload_factor,
            idle_park: Duration::from_millis(config.idle_park_ms),
            rng,
            changed: false,
            done: false,
        }
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn take_fragments(&mut self) -> Vec<Curve> {
        std::mem::take(&mut self.fragments)
    }

    /// Curves held in the pool, by block.
    fn pool_counts(&self) -> Vec<(BlockId, u32)> {
        let mut counts: Vec<(BlockId, u32)> = self
            .pool
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(b, v)| (*b, v.len() as u32))
            .collect();
        counts.sort();
        counts
    }

    pub fn seed(&mut self, curves: Vec<Curve>) {
        for curve in curves {
            self.ingest_curve(curve);
        }
        self.changed = true;
    }

    fn ingest_curve(&mut self, mut curve: Curve) {
        if curve.status.is_terminal() {
            self.finalize(curve);
            return;
        }
        if curve.candidate_blocks.is_empty() {
            curve.candidate_blocks = self.locator.candidate_blocks(&curve);
        }
        match curve.block() {
            Some(block) => self.pool.entry(block).or_default().push(curve),
            None => {
                curve.status = if curve.status == CurveStatus::AtTemporalBoundary {
                    CurveStatus::ExitedTemporalBoundary
                } else {
                    CurveStatus::ExitedSpatialBoundary
                };
                self.finalize(curve);
            }
        }
    }

    fn finalize(&mut self, curve: Curve) {
        trace!(id = curve.id, status = ?curve.status, "curve terminated at manager");
        self.stats.record_terminal(curve.status);
        self.fragments.push(curve);
    }

    /// One pass of the manager loop.
    pub async fn step(&mut self) -> Result<IterationOutcome, EngineError> {
        if self.done {
            return Ok(IterationOutcome::Finished);
        }
        self.stats.iterations += 1;

        let comm = self.comm.clone();
        let deliveries = comm
            .poll(
                &[MessageTag::Status, MessageTag::CurveTransfer],
                PollMode::Timeout(self.idle_park),
            )
            .await?;
        for delivery in deliveries {
            match delivery {
                Delivery::Curves { curves, .. } => {
                    for curve in curves {
                        self.ingest_curve(curve);
                    }
                    self.changed = true;
                }
                Delivery::Status { body, .. } => match SchedulerMsg::decode(&body)? {
                    SchedulerMsg::Report(report) => self.ingest_report(report),
                    SchedulerMsg::Sub(rollup) => {
                        trace!(from = rollup.manager, outstanding = rollup.outstanding, "rollup");
                        self.subs.insert(rollup.manager, rollup);
                        self.changed = true;
                    }
                    SchedulerMsg::Directive(directive) => self.obey(directive)?,
                },
                Delivery::Block { .. } => {}
            }
        }
        if self.done {
            return Ok(IterationOutcome::Finished);
        }

        let progressed = self.changed;
        // No decision until every worker has reported once; a pass over a
        // partial picture would misroute the whole initial pool.
        if self.changed && self.all_peers_reported() {
            self.changed = false;
            self.run_decision_pass()?;
            self.rebalance_workgroups()?;
            self.send_rollup()?;
        }
        if self.check_completion()? {
            return Ok(IterationOutcome::Finished);
        }
        Ok(if progressed {
            IterationOutcome::Progressed
        } else {
            IterationOutcome::Idle
        })
    }

    fn all_peers_reported(&self) -> bool {
        self.peers.values().all(PeerRecord::has_reported)
    }

    fn ingest_report(&mut self, report: StatusReport) {
        let Some(peer) = self.peers.get_mut(&report.worker) else {
            warn!(worker = report.worker, "report from a rank outside the workgroup");
            return;
        };
        trace!(worker = report.worker, active = report.active_total(), "report");
        peer.apply_report(&report);
        self.changed = true;
    }

    /// Directives arriving at a manager come from its parent: either the
    /// terminal broadcast or a cross-group offload order.
    fn obey(&mut self, directive: Directive) -> Result<(), EngineError> {
        match directive {
            Directive::Terminate => self.broadcast_terminate()?,
            Directive::OffloadBacklog { block, dst, max } => {
                debug!(rank = self.comm.rank(), %block, dst, max, "cross-group offload");
                if !self.ship_pool(block, dst, max as usize)? {
                    // Nothing pooled; delegate to the most backlogged worker.
                    let worker = self
                        .peers
                        .values()
                        .filter(|p| p.backlog_for(block) > 0)
                        .max_by_key(|p| p.backlog_for(block))
                        .map(PeerRecord::rank);
                    if let Some(worker) = worker {
                        let order = Directive::OffloadBacklog { block, dst, max };
                        SchedulerMsg::Directive(order).send(self.comm.as_ref(), worker)?;
                        if let Some(peer) = self.peers.get_mut(&worker) {
                            peer.debit(block, max);
                        }
                    }
                }
            }
            other => {
                warn!(rank = self.comm.rank(), ?other, "unexpected directive at manager");
            }
        }
        Ok(())
    }

    fn run_decision_pass(&mut self) -> Result<(), EngineError> {
        let records: Vec<PeerRecord> = self.peers.values().cloned().collect();
        let mean = records.iter().map(|p| p.ic_count() as f64).sum::<f64>()
            / records.len().max(1) as f64;
        let thresholds = Thresholds::from_mean(mean, self.overload_factor, self.underload_factor);
        let (actions, _slackers) = decide(&records, &self.pool_counts(), &thresholds);

        for action in actions {
            match action {
                Action::Direct { dst, directive } => {
                    SchedulerMsg::Directive(directive).send(self.comm.as_ref(), dst)?;
                    self.book_directive(dst, directive);
                }
                Action::ShipPool { block, dst, count } => {
                    self.ship_pool(block, dst, count as usize)?;
                }
            }
        }
        for peer in self.peers.values_mut() {
            peer.clear_just_updated();
        }
        Ok(())
    }

    /// Optimistic bookkeeping so the next pass does not re-issue orders for
    /// curves already told to move. Reports overwrite this.
    fn book_directive(&mut self, dst: Rank, directive: Directive) {
        match directive {
            Directive::SendToPeer { block, dst: receiver } => {
                let moved = self.peers.get(&dst).map_or(0, |p| p.backlog_for(block));
                if let Some(peer) = self.peers.get_mut(&dst) {
                    peer.debit(block, moved);
                }
                if let Some(peer) = self.peers.get_mut(&receiver) {
                    peer.credit(block, moved);
                }
            }
            Directive::ForceLoad { block } => {
                if let Some(peer) = self.peers.get_mut(&dst) {
                    peer.assume_loaded(block);
                }
            }
            Directive::OffloadBacklog { block, dst: receiver, max } => {
                if let Some(peer) = self.peers.get_mut(&dst) {
                    peer.debit(block, max);
                }
                if let Some(peer) = self.peers.get_mut(&receiver) {
                    peer.credit(block, max);
                }
            }
            Directive::Terminate => {}
        }
    }

    /// Send up to `max` pooled curves for `block` to `dst`. Returns whether
    /// anything moved.
    fn ship_pool(&mut self, block: BlockId, dst: Rank, max: usize) -> Result<bool, EngineError> {
        let Some(mut curves) = self.pool.remove(&block) else {
            return Ok(false);
        };
        if curves.is_empty() {
            return Ok(false);
        }
        if curves.len() > max {
            let rest = curves.split_off(max);
            self.pool.insert(block, rest);
        }
        let count = curves.len() as u32;
        debug!(rank = self.comm.rank(), %block, dst, count, "dispatching pool curves");
        self.comm.send_curves(dst, curves)?;
        if let Some(peer) = self.peers.get_mut(&dst) {
            peer.credit(block, count);
        }
        Ok(true)
    }

    /// Root-only pass pairing idle workgroups with busy ones.
    fn rebalance_workgroups(&mut self) -> Result<(), EngineError> {
        if self.subs.is_empty() {
            return Ok(());
        }
        let mut rollups: Vec<SubReport> = self.subs.values().copied().collect();
        rollups.sort_by_key(|s| s.manager);
        for (busy, idle, block, max) in pair_idle_busy(&rollups, &mut self.rng) {
            debug!(busy, idle, %block, max, "pairing workgroups");
            let order = Directive::OffloadBacklog { block, dst: idle, max };
            SchedulerMsg::Directive(order).send(self.comm.as_ref(), busy)?;
            if let Some(sub) = self.subs.get_mut(&busy) {
                sub.outstanding = sub.outstanding.saturating_sub(max as u64);
            }
        }
        Ok(())
    }

    fn group_outstanding(&self) -> u64 {
        let pooled: u64 = self.pool.values().map(|v| v.len() as u64).sum();
        pooled + self.peers.values().map(|p| p.ic_count() as u64).sum::<u64>()
    }

    fn group_terminated(&self) -> u64 {
        self.stats.terminated + self.peers.values().map(PeerRecord::terminated).sum::<u64>()
    }

    /// Non-root managers roll their group state up when it changed.
    fn send_rollup(&mut self) -> Result<(), EngineError> {
        let Some(parent) = self.parent else {
            return Ok(());
        };
        let top_block = self
            .pool_counts()
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .or_else(|| {
                self.peers
                    .values()
                    .filter_map(PeerRecord::largest_backlog)
                    .max_by_key(|(_, n)| *n)
            });
        let rollup = SubReport {
            manager: self.comm.rank(),
            outstanding: self.group_outstanding(),
            terminated: self.group_terminated(),
            top_block,
        };
        if self.last_rollup != Some(rollup) {
            SchedulerMsg::Sub(rollup).send(self.comm.as_ref(), parent)?;
            self.last_rollup = Some(rollup);
        }
        Ok(())
    }

    /// The root is done when the terminated total accounts for every seed;
    /// conservation makes that imply no curve is active or in flight
    /// anywhere.
    fn check_completion(&mut self) -> Result<bool, EngineError> {
        if self.parent.is_some() {
            return Ok(false);
        }
        let terminated =
            self.group_terminated() + self.subs.values().map(|s| s.terminated).sum::<u64>();
        if terminated < self.total {
            return Ok(false);
        }
        info!(rank = self.comm.rank(), total = self.total, "all curves terminated");
        self.broadcast_terminate()?;
        Ok(true)
    }

    fn broadcast_terminate(&mut self) -> Result<(), EngineError> {
        for &dst in self.peers.keys().chain(self.sub_managers.iter()) {
            SchedulerMsg::Directive(Directive::Terminate).send(self.comm.as_ref(), dst)?;
        }
        self.stats.log_summary(self.comm.rank());
        self.done = true;
        Ok(())
    }
}
