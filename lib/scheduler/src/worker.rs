// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker side of the dynamic balancer.
//!
//! A worker advances bounded batches of curves it has blocks loaded for,
//! keeps the rest as reported backlog, and obeys manager directives. The
//! batch bound keeps status reports frequent; when the held-curve count
//! drops to the latency threshold a report is forced immediately so the
//! manager is not left scheduling against a stale picture.

use std::time::Duration;

use tracing::{debug, trace, warn};

use pathline_comm::{Delivery, MessageTag, PollMode};
use pathline_core::{BlockId, PathlineConfig, Rank};
use pathline_engine::{Engine, EngineError, IterationOutcome, SequentialEngine};

use crate::message::{Directive, SchedulerMsg, StatusReport};

pub struct Worker {
    engine: SequentialEngine,
    manager: Rank,
    batch: usize,
    latency_threshold: usize,
    idle_park: Duration,
    /// Fingerprint of the last report sent, to suppress no-news traffic.
    last_report: Option<(Vec<(BlockId, u32)>, Vec<BlockId>)>,
    terminated_reported: u64,
    done: bool,
}

impl Worker {
    pub fn new(engine: SequentialEngine, manager: Rank, config: &PathlineConfig) -> Self {
        Self {
            engine,
            manager,
            batch: config.worker_batch,
            latency_threshold: config.latency_threshold,
            idle_park: Duration::from_millis(config.idle_park_ms),
            last_report: None,
            terminated_reported: 0,
            done: false,
        }
    }

    pub fn engine(&self) -> &SequentialEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SequentialEngine {
        &mut self.engine
    }

    /// Announce the initial state so the manager's first decision pass sees
    /// every worker.
    pub fn report_now(&mut self) -> Result<(), EngineError> {
        self.send_report(true)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// One pass of the worker loop: ingest, obey, advance, report.
    pub async fn step(&mut self) -> Result<IterationOutcome, EngineError> {
        if self.done {
            return Ok(IterationOutcome::Finished);
        }

        // A backlog of cold-block curves is not runnable until the manager
        // says what to do with it; park on the poll so the directive can
        // actually arrive instead of spinning.
        let mode = if self.engine.has_runnable_work() {
            PollMode::NonBlocking
        } else {
            PollMode::Timeout(self.idle_park)
        };
        let comm = self.engine.comm().clone();
        let deliveries = comm
            .poll(&[MessageTag::Status, MessageTag::CurveTransfer], mode)
            .await?;

        let mut moved = false;
        for delivery in deliveries {
            match delivery {
                Delivery::Curves { curves, .. } => {
                    trace!(rank = self.engine.rank(), n = curves.len(), "curves arrived");
                    self.engine.receive(curves);
                    moved = true;
                }
                Delivery::Status { body, .. } => match SchedulerMsg::decode(&body)? {
                    SchedulerMsg::Directive(directive) => {
                        moved |= self.obey(directive).await?;
                        if self.done {
                            return Ok(IterationOutcome::Finished);
                        }
                    }
                    other => {
                        warn!(rank = self.engine.rank(), ?other, "unexpected message at worker");
                    }
                },
                Delivery::Block { .. } => {}
            }
        }

        let outcome = self.engine.advance_batch(self.batch)?;
        debug_assert!(outcome.departures.is_empty(), "worker policy keeps its backlog");
        moved |= outcome.advanced > 0;

        let force = moved && self.engine.active_count() <= self.latency_threshold;
        self.send_report(force)?;

        Ok(if moved {
            IterationOutcome::Progressed
        } else {
            IterationOutcome::Idle
        })
    }

    /// Returns whether the directive moved anything. Directives built from
    /// stale reports can be no-ops; that is fine.
    async fn obey(&mut self, directive: Directive) -> Result<bool, EngineError> {
        debug!(rank = self.engine.rank(), ?directive, "directive");
        match directive {
            Directive::SendToPeer { block, dst } => self.ship(block, dst, usize::MAX),
            Directive::ForceLoad { block } => {
                self.engine.load_block(block)?;
                Ok(true)
            }
            Directive::OffloadBacklog { block, dst, max } => self.ship(block, dst, max as usize),
            Directive::Terminate => {
                self.drain_in_flight().await?;
                self.done = true;
                Ok(true)
            }
        }
    }

    fn ship(&mut self, block: BlockId, dst: Rank, max: usize) -> Result<bool, EngineError> {
        let curves = self.engine.take_waiting_for(block, max);
        if curves.is_empty() {
            return Ok(false);
        }
        let bundle: Vec<_> = curves
            .into_iter()
            .map(|c| self.engine.prepare_handoff(c))
            .collect();
        trace!(rank = self.engine.rank(), %block, dst, n = bundle.len(), "shipping backlog");
        self.engine.comm().send_curves(dst, bundle)?;
        Ok(true)
    }

    /// The manager only declares completion once every curve is accounted
    /// for, so anything still in flight here is a straggler of the final
    /// exchange; absorb it rather than lose it.
    async fn drain_in_flight(&mut self) -> Result<(), EngineError> {
        let comm = self.engine.comm().clone();
        loop {
            let deliveries = comm
                .poll(&[MessageTag::CurveTransfer], PollMode::NonBlocking)
                .await?;
            if deliveries.is_empty() {
                break;
            }
            for delivery in deliveries {
                if let Delivery::Curves { curves, .. } = delivery {
                    warn!(
                        rank = self.engine.rank(),
                        n = curves.len(),
                        "draining in-flight curves at exit"
                    );
                    self.engine.absorb_terminated(curves);
                }
            }
        }
        Ok(())
    }

    fn send_report(&mut self, force: bool) -> Result<(), EngineError> {
        let active_by_block = {
            let mut counts = self.engine.active_by_block();
            counts.sort();
            counts
        };
        let loaded_blocks = self.engine.blocks().loaded_blocks(self.engine.rank());
        let terminated = self.engine.stats().terminated;
        let changed = self
            .last_report
            .as_ref()
            .is_none_or(|(a, l)| *a != active_by_block || *l != loaded_blocks)
            || terminated != self.terminated_reported;
        if !changed && !force {
            return Ok(());
        }

        let report = StatusReport {
            worker: self.engine.rank(),
            active_by_block: active_by_block.clone(),
            loaded_blocks: loaded_blocks.clone(),
            terminated_delta: terminated - self.terminated_reported,
        };
        SchedulerMsg::Report(report).send(self.engine.comm().as_ref(), self.manager)?;
        self.last_report = Some((active_by_block, loaded_blocks));
        self.terminated_reported = terminated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pathline_comm::{ChannelMesh, CommLayer};
    use pathline_core::{BlockMap, Curve, Direction, TrajectoryPoint};
    use pathline_engine::testing::{OneDimension, ScriptedStore};
    use pathline_engine::RetainPolicy;

    /// A worker on rank 1 with its manager on rank 0, over one unit-wide
    /// domain terminating after 4 samples.
    fn worker_rig() -> (Worker, Vec<Arc<CommLayer>>) {
        let layers: Vec<Arc<CommLayer>> = ChannelMesh::new(2)
            .into_iter()
            .map(|t| Arc::new(CommLayer::new(Arc::new(t), 4096)))
            .collect();
        let world = OneDimension::new(1, 4);
        let mut blocks = BlockMap::new(2);
        blocks.assign(BlockId::new(0, 0), 1).unwrap();
        let engine = SequentialEngine::new(
            layers[1].clone(),
            blocks,
            Arc::new(world.clone()),
            Arc::new(world),
            Arc::new(ScriptedStore::default()),
            RetainPolicy::LoadedBlocks,
            None,
        );
        let worker = Worker::new(engine, 0, &PathlineConfig::default());
        (worker, layers)
    }

    fn seed() -> Curve {
        Curve::new(
            0,
            Direction::Forward,
            1,
            TrajectoryPoint {
                position: [0.1, 0.0, 0.0],
                time: 0.0,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn cold_backlog_parks_the_poll() {
        let (mut worker, _layers) = worker_rig();
        worker.engine_mut().initialize(vec![seed()]).await.unwrap();
        assert_eq!(worker.engine().active_count(), 1);

        // No block is loaded, so nothing is runnable; the step must wait
        // out the park interval instead of returning straight away.
        let before = tokio::time::Instant::now();
        let outcome = worker.step().await.unwrap();
        assert_eq!(outcome, IterationOutcome::Idle);
        assert!(
            before.elapsed() >= Duration::from_millis(10),
            "step returned without parking"
        );
    }

    #[tokio::test]
    async fn parked_worker_hears_the_force_load() {
        let (mut worker, layers) = worker_rig();
        worker.engine_mut().initialize(vec![seed()]).await.unwrap();

        // On this single-threaded runtime the sender task only gets to run
        // while the worker is suspended in its timed poll.
        let manager = layers[0].clone();
        tokio::spawn(async move {
            let order = Directive::ForceLoad {
                block: BlockId::new(0, 0),
            };
            SchedulerMsg::Directive(order).send(manager.as_ref(), 1).unwrap();
        });

        for _ in 0..50 {
            worker.step().await.unwrap();
            if worker.engine().stats().terminated > 0 {
                break;
            }
        }
        assert_eq!(worker.engine().stats().terminated, 1);
        assert_eq!(worker.engine().active_count(), 0);
    }
}
