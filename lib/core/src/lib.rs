// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Pathline Core
//!
//! Shared data model for the distributed integral-curve advection system:
//! curves, blocks, status taxonomy, collaborator traits, configuration, and
//! logging setup. Every other pathline crate builds on these types.

mod block;
mod config;
mod curve;
pub mod logging;
mod traits;

pub use block::{BlockError, BlockId, BlockMap};
pub use config::{AssemblyPolicy, PathlineConfig};
pub use curve::{Curve, CurveId, CurveStatus, Direction, TrajectoryPoint};
pub use traits::{BlockStore, Integrator, Locator, ProgressReport};

/// One participant process in the distributed computation.
pub type Rank = u32;
