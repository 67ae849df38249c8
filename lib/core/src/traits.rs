// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collaborator contracts consumed by the engines.
//!
//! Numerical integration, spatial search, and block I/O live outside this
//! core; these traits are the seams they plug into.

use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::curve::{Curve, CurveStatus};

/// Numerical integration collaborator.
///
/// `advance` moves the curve one unit of work inside `block` (typically many
/// ODE steps, bounded by a step budget) and reports the outcome. The
/// collaborator appends recorded samples to `curve.trajectory` and keeps its
/// internal state in `curve.solver_state`.
pub trait Integrator: Send + Sync {
    fn advance(&self, curve: &mut Curve, block: BlockId) -> CurveStatus;
}

/// Spatial search collaborator: map a curve's current position to the blocks
/// that might contain it, without performing any I/O. An empty result means
/// the position is outside every known block.
pub trait Locator: Send + Sync {
    fn candidate_blocks(&self, curve: &Curve) -> Vec<BlockId>;
}

/// Block data I/O collaborator. `load` may be slow; the engines sort work so
/// that one load is amortized across every curve waiting on that block.
pub trait BlockStore: Send + Sync {
    fn is_loaded(&self, block: BlockId) -> bool;

    fn load(&self, block: BlockId) -> anyhow::Result<()>;

    fn unload(&self, _block: BlockId) {}
}

/// Periodic progress counts surfaced to a reporting collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub resolved: usize,
    pub total: usize,
}
