// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Pathline Scheduler
//!
//! The manager/worker dynamic balancer, plus the factory that picks a drive
//! loop per rank. In manager/worker mode the world is carved into
//! workgroups of `workgroup_size` ranks; the first rank of each group is
//! its manager, rank 0 is the root of a one-level manager tree, and the
//! remaining ranks advance curves. A manager never advances curves itself.

mod cases;
mod manager;
mod message;
mod peer;
mod worker;

use std::sync::Arc;

use async_trait::async_trait;

use pathline_comm::CommLayer;
use pathline_core::{
    BlockMap, BlockStore, Curve, Integrator, Locator, PathlineConfig, ProgressReport, Rank,
};
use pathline_engine::{
    Engine, EngineError, IterationOutcome, RetainPolicy, RunStats, SequentialEngine,
};

pub use cases::{decide, pair_idle_busy, Action, Thresholds};
pub use manager::Manager;
pub use message::{Directive, SchedulerMsg, StatusReport, SubReport};
pub use peer::PeerRecord;
pub use worker::Worker;

/// Which drive loop each rank runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Static-domain mode: every rank advances the curves for blocks it
    /// owns; synchronous convergence rounds.
    Serial,
    /// Dynamic balancing: managers direct, workers advance.
    ManagerWorker,
}

/// How ranks are carved into workgroups.
#[derive(Debug, Clone, Copy)]
pub struct Topology {
    world: u32,
    group: u32,
}

impl Topology {
    pub fn new(world: u32, workgroup_size: usize) -> Self {
        Self {
            world,
            group: (workgroup_size.max(2) as u32).min(world.max(1)),
        }
    }

    pub fn is_manager(&self, rank: Rank) -> bool {
        rank % self.group == 0
    }

    pub fn manager_of(&self, rank: Rank) -> Rank {
        rank - rank % self.group
    }

    pub fn workers_of(&self, manager: Rank) -> Vec<Rank> {
        (manager + 1..(manager + self.group).min(self.world)).collect()
    }

    /// Every manager rank except the root.
    pub fn sub_managers(&self) -> Vec<Rank> {
        (1..self.world).filter(|r| r % self.group == 0).collect()
    }
}

enum Role {
    Manager(Manager),
    Worker(Worker),
}

/// Manager/worker drive loop for one rank, behind the common [`Engine`]
/// interface.
pub struct ManagerWorkerEngine {
    comm: Arc<CommLayer>,
    role: Role,
    initialized: bool,
}

impl ManagerWorkerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comm: Arc<CommLayer>,
        blocks: BlockMap,
        integrator: Arc<dyn Integrator>,
        locator: Arc<dyn Locator>,
        store: Arc<dyn BlockStore>,
        config: &PathlineConfig,
        progress: Option<flume::Sender<ProgressReport>>,
    ) -> Self {
        let topology = Topology::new(comm.world_size(), config.workgroup_size);
        let rank = comm.rank();
        let role = if topology.is_manager(rank) {
            let (subs, parent) = if rank == 0 {
                (topology.sub_managers(), None)
            } else {
                (Vec::new(), Some(0))
            };
            Role::Manager(Manager::new(
                comm.clone(),
                &topology.workers_of(rank),
                subs,
                parent,
                locator,
                config,
            ))
        } else {
            let engine = SequentialEngine::new(
                comm.clone(),
                blocks,
                integrator,
                locator,
                store,
                RetainPolicy::LoadedBlocks,
                progress,
            );
            Role::Worker(Worker::new(engine, topology.manager_of(rank), config))
        };
        Self {
            comm,
            role,
            initialized: false,
        }
    }
}

#[async_trait]
impl Engine for ManagerWorkerEngine {
    async fn initialize(&mut self, seeds: Vec<Curve>) -> Result<(), EngineError> {
        // Every rank learns the global seed count; the root needs it for
        // its completion check.
        let [total, ..] = self
            .comm
            .allreduce_sum([seeds.len() as u64, 0, 0])
            .await?;
        match &mut self.role {
            Role::Manager(manager) => {
                manager.set_total(total);
                manager.seed(seeds);
            }
            Role::Worker(worker) => worker.engine_mut().initialize(seeds).await?,
        }
        // Workers announce themselves before the barrier; managers hold
        // every decision until the whole group has reported once.
        if let Role::Worker(worker) = &mut self.role {
            worker.report_now()?;
        }
        self.comm.barrier().await?;
        self.initialized = true;
        Ok(())
    }

    async fn run_one_iteration(&mut self) -> Result<IterationOutcome, EngineError> {
        if !self.initialized {
            return Err(EngineError::Uninitialized);
        }
        match &mut self.role {
            Role::Manager(manager) => manager.step().await,
            Role::Worker(worker) => worker.step().await,
        }
    }

    fn reset_for_continuation(&mut self) -> Result<(), EngineError> {
        match &mut self.role {
            Role::Manager(_) => Ok(()),
            Role::Worker(worker) => worker.engine_mut().reset_for_continuation(),
        }
    }

    fn check_next_time_step_needed(&self) -> bool {
        match &self.role {
            Role::Manager(_) => false,
            Role::Worker(worker) => worker.engine().check_next_time_step_needed(),
        }
    }

    fn take_fragments(&mut self) -> Vec<Curve> {
        match &mut self.role {
            Role::Manager(manager) => manager.take_fragments(),
            Role::Worker(worker) => worker.engine_mut().take_fragments(),
        }
    }

    fn stats(&self) -> &RunStats {
        match &self.role {
            Role::Manager(manager) => manager.stats(),
            Role::Worker(worker) => worker.engine().stats(),
        }
    }
}

/// Pick the drive loop for this rank. A single-rank world always runs the
/// serial engine; there is nobody to manage.
#[allow(clippy::too_many_arguments)]
pub fn build_engine(
    kind: EngineKind,
    comm: Arc<CommLayer>,
    blocks: BlockMap,
    integrator: Arc<dyn Integrator>,
    locator: Arc<dyn Locator>,
    store: Arc<dyn BlockStore>,
    config: &PathlineConfig,
    progress: Option<flume::Sender<ProgressReport>>,
) -> Box<dyn Engine> {
    match kind {
        EngineKind::ManagerWorker if comm.world_size() > 1 => Box::new(ManagerWorkerEngine::new(
            comm, blocks, integrator, locator, store, config, progress,
        )),
        _ => Box::new(SequentialEngine::new(
            comm,
            blocks,
            integrator,
            locator,
            store,
            RetainPolicy::OwnedBlocks,
            progress,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_carves_groups_of_workgroup_size() {
        let topo = Topology::new(8, 4);
        assert!(topo.is_manager(0));
        assert!(topo.is_manager(4));
        assert!(!topo.is_manager(3));
        assert_eq!(topo.manager_of(6), 4);
        assert_eq!(topo.workers_of(0), vec![1, 2, 3]);
        assert_eq!(topo.workers_of(4), vec![5, 6, 7]);
        assert_eq!(topo.sub_managers(), vec![4]);
    }

    #[test]
    fn short_last_group_gets_the_remaining_ranks() {
        let topo = Topology::new(6, 4);
        assert_eq!(topo.workers_of(4), vec![5]);
    }

    #[test]
    fn workgroup_never_exceeds_the_world() {
        let topo = Topology::new(2, 8);
        assert!(topo.is_manager(0));
        assert!(!topo.is_manager(1));
        assert_eq!(topo.workers_of(0), vec![1]);
        assert!(topo.sub_managers().is_empty());
    }
}
