// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic mock collaborators for tests.
//!
//! [`OneDimension`] is a toy field on the x axis: domain `d` covers
//! `[d, d+1)`, every advance moves a curve `+0.25` in x and records one
//! sample, and a curve terminates by criterion after a fixed sample budget.
//! This is enough to script multi-block, multi-rank journeys with exact
//! expectations and no numerical noise.

use std::collections::HashSet;

use parking_lot::Mutex;

use pathline_core::{BlockId, BlockStore, Curve, CurveStatus, Integrator, Locator, TrajectoryPoint};

const STEP: f64 = 0.25;

/// Toy 1-D field over `domains` unit-wide blocks. Without a time slab the
/// whole field lives at timestep 0; with one, each block covers `slab`
/// units of time and a curve reaching the end of its slab stops at the
/// temporal boundary.
#[derive(Debug, Clone)]
pub struct OneDimension {
    domains: u32,
    /// Terminate by criterion once a curve has recorded this many samples
    /// across all fragments (tracked via `sequence` and local samples).
    max_samples: usize,
    time_slab: Option<f64>,
}

impl OneDimension {
    pub fn new(domains: u32, max_samples: usize) -> Self {
        Self {
            domains,
            max_samples,
            time_slab: None,
        }
    }

    /// Carve time into slabs of the given length, one timestep per slab.
    pub fn with_time_slab(mut self, slab: f64) -> Self {
        self.time_slab = Some(slab);
        self
    }

    fn domain_of(&self, x: f64) -> Option<u32> {
        if x < 0.0 || x >= self.domains as f64 {
            return None;
        }
        Some(x as u32)
    }

    fn timestep_of(&self, time: f64) -> u32 {
        match self.time_slab {
            Some(slab) => (time / slab) as u32,
            None => 0,
        }
    }
}

impl Integrator for OneDimension {
    fn advance(&self, curve: &mut Curve, block: BlockId) -> CurveStatus {
        let last = *curve.trajectory.last().unwrap_or(&TrajectoryPoint {
            position: [0.0; 3],
            time: 0.0,
        });
        let x = last.position[0] + STEP;
        let time = last.time + STEP;
        curve.trajectory.push(TrajectoryPoint {
            position: [x, 0.0, 0.0],
            time,
        });

        // Rough global sample count: hops record at least one sample each.
        let samples = curve.trajectory.len() + curve.sequence as usize;
        if samples >= self.max_samples {
            return CurveStatus::TerminatedByCriterion;
        }
        if let Some(slab) = self.time_slab {
            if time >= slab * (block.timestep + 1) as f64 {
                return CurveStatus::AtTemporalBoundary;
            }
        }
        match self.domain_of(x) {
            Some(d) if d == block.domain => CurveStatus::Ok,
            _ => CurveStatus::AtSpatialBoundary,
        }
    }
}

impl Locator for OneDimension {
    fn candidate_blocks(&self, curve: &Curve) -> Vec<BlockId> {
        let Some(last) = curve.trajectory.last() else {
            return Vec::new();
        };
        match self.domain_of(last.position[0]) {
            Some(d) => vec![BlockId::new(d, self.timestep_of(last.time))],
            None => Vec::new(),
        }
    }
}

/// Block store that records loads; "loading" is instant.
#[derive(Debug, Default)]
pub struct ScriptedStore {
    loaded: Mutex<HashSet<BlockId>>,
    loads: Mutex<u64>,
}

impl ScriptedStore {
    pub fn load_count(&self) -> u64 {
        *self.loads.lock()
    }

    pub fn preload(&self, block: BlockId) {
        self.loaded.lock().insert(block);
    }
}

impl BlockStore for ScriptedStore {
    fn is_loaded(&self, block: BlockId) -> bool {
        self.loaded.lock().contains(&block)
    }

    fn load(&self, block: BlockId) -> anyhow::Result<()> {
        *self.loads.lock() += 1;
        self.loaded.lock().insert(block);
        Ok(())
    }

    fn unload(&self, block: BlockId) {
        self.loaded.lock().remove(&block);
    }
}
