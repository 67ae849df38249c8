// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Run configuration.
//!
//! Loaded from (highest priority first): `PATHLINE_*` environment variables,
//! an optional `pathline.toml`, then built-in defaults.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Where a logical curve's fragments are merged once everything terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyPolicy {
    /// Merge on whichever rank holds the final terminated fragment.
    CurrentProcessor,
    /// Merge on rank `id % world_size`, evening out post-processing load.
    Uniform,
    /// Merge on the rank that seeded the curve.
    ReturnToOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathlineConfig {
    /// Fragment merge placement.
    pub assembly_policy: AssemblyPolicy,
    /// Largest single packet on the wire; bigger payloads fragment.
    pub max_packet_size: usize,
    /// Curve ids reassembled per agreement window.
    pub reassembly_window: usize,
    /// Ranks per manager in manager/worker mode (manager included).
    pub workgroup_size: usize,
    /// Held-curve count at or below which a worker forces an out-of-band
    /// status report so the manager's picture stays fresh.
    pub latency_threshold: usize,
    /// Curves a worker advances between status-report opportunities.
    pub worker_batch: usize,
    /// A worker above `overload_factor * mean` load is an offload candidate.
    pub overload_factor: f64,
    /// A worker below `underload_factor * mean` load is a slacker.
    pub underload_factor: f64,
    /// How long an idle rank parks waiting for traffic, in milliseconds.
    pub idle_park_ms: u64,
}

impl Default for PathlineConfig {
    fn default() -> Self {
        Self {
            assembly_policy: AssemblyPolicy::CurrentProcessor,
            max_packet_size: 64 * 1024,
            reassembly_window: 500,
            workgroup_size: 8,
            latency_threshold: 4,
            worker_batch: 32,
            overload_factor: 1.5,
            underload_factor: 0.5,
            idle_park_ms: 10,
        }
    }
}

impl PathlineConfig {
    /// Layered load: defaults, then `pathline.toml`, then `PATHLINE_*` env.
    pub fn load() -> anyhow::Result<Self> {
        let config = Figment::from(Serialized::defaults(PathlineConfig::default()))
            .merge(Toml::file("pathline.toml"))
            .merge(Env::prefixed("PATHLINE_"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = PathlineConfig::default();
        assert!(cfg.max_packet_size > 0);
        assert!(cfg.reassembly_window > 0);
        assert!(cfg.workgroup_size >= 2);
        assert!(cfg.overload_factor > cfg.underload_factor);
    }
}
