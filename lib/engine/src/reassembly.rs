// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Post-run reassembly of fragmented trajectories.
//!
//! A curve that hopped between ranks left one stay-behind fragment per
//! visited rank, numbered by `sequence`. Once every curve has terminated,
//! the ranks agree per curve id on a final owner and on the total fragment
//! count, ship fragments to the owner, and the owner splices them back
//! into one whole trajectory.
//!
//! The agreement runs in fixed-size windows over the id space so the
//! share vector exchanged per collective stays bounded. Arriving fragments
//! are stashed by id no matter which window is currently being agreed on,
//! so a rank running ahead may ship early without any coordination.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use pathline_comm::{CommError, CommLayer, Delivery, IdShare, MessageTag, PollMode};
use pathline_core::{AssemblyPolicy, Curve, CurveId, Rank};

use crate::EngineError;

/// Splice fragments of one curve back into a whole trajectory.
///
/// Fragments are ordered by `sequence`. Each continuation fragment starts
/// with a repeat of the previous fragment's last sample (the hop joint);
/// that duplicate is dropped. Status and solver state come from the
/// highest-sequence fragment, the one that actually terminated. A single
/// fragment passes through unchanged; an empty set yields `None`.
pub fn merge_fragments(mut fragments: Vec<Curve>) -> Option<Curve> {
    fragments.sort_by_key(|f| f.sequence);
    let mut iter = fragments.into_iter();
    let mut merged = iter.next()?;
    for fragment in iter {
        let mut points = fragment.trajectory.into_iter();
        if let Some(first) = points.next() {
            if merged.trajectory.last() != Some(&first) {
                merged.trajectory.push(first);
            }
            merged.trajectory.extend(points);
        }
        merged.sequence = fragment.sequence;
        merged.status = fragment.status;
        merged.candidate_blocks = fragment.candidate_blocks;
        merged.solver_state = fragment.solver_state;
    }
    Some(merged)
}

/// Windowed owner agreement plus fragment exchange. One instance per rank;
/// `assemble` is a collective and must be entered by every rank.
pub struct ReassemblyProtocol {
    comm: Arc<CommLayer>,
    policy: AssemblyPolicy,
    window: u64,
}

impl ReassemblyProtocol {
    pub fn new(comm: Arc<CommLayer>, policy: AssemblyPolicy, window: u64) -> Self {
        Self {
            comm,
            policy,
            window: window.max(1),
        }
    }

    /// This rank's ownership claim for a curve id it holds fragments of.
    /// `-1` means no claim; claims combine by max across ranks.
    fn claim(&self, id: CurveId, fragments: &[Curve]) -> i64 {
        match self.policy {
            AssemblyPolicy::CurrentProcessor => {
                if fragments.iter().any(|f| f.status.is_terminal()) {
                    self.comm.rank() as i64
                } else {
                    -1
                }
            }
            AssemblyPolicy::Uniform => (id % self.comm.world_size() as u64) as i64,
            AssemblyPolicy::ReturnToOrigin => fragments[0].origin as i64,
        }
    }

    /// Exchange fragments and return the curves this rank ends up owning,
    /// fully merged. Consumes the local fragment set.
    pub async fn assemble(&self, local: Vec<Curve>) -> Result<Vec<Curve>, EngineError> {
        let rank = self.comm.rank();

        let mut stash: HashMap<CurveId, Vec<Curve>> = HashMap::new();
        for fragment in local {
            stash.entry(fragment.id).or_default().push(fragment);
        }

        // Agree on the id range first so every rank walks the same windows.
        let local_end = stash.keys().max().map(|id| id + 1).unwrap_or(0);
        let id_end = self.comm.allreduce(local_end, u64::max).await?;
        debug!(rank, id_end, window = self.window, "reassembly start");

        let mut assembled = Vec::new();
        let mut lo = 0u64;
        while lo < id_end {
            let hi = (lo + self.window).min(id_end);

            let shares: Vec<IdShare> = (lo..hi)
                .map(|id| match stash.get(&id) {
                    Some(fragments) => IdShare {
                        owner: self.claim(id, fragments),
                        fragments: fragments.len() as u32,
                    },
                    None => IdShare::default(),
                })
                .collect();
            let agreed = self.comm.allreduce_shares(shares).await?;

            // Ship everything not owned here, then wait to be made whole.
            let mut owed: Vec<(CurveId, u32)> = Vec::new();
            let mut by_dst: HashMap<Rank, Vec<Curve>> = HashMap::new();
            for (offset, share) in agreed.iter().enumerate() {
                if share.fragments == 0 {
                    continue;
                }
                let id = lo + offset as u64;
                if share.owner < 0 {
                    return Err(EngineError::Comm(CommError::CollectiveMismatch(format!(
                        "no rank claimed curve {id} ({} fragments outstanding)",
                        share.fragments
                    ))));
                }
                let owner = share.owner as Rank;
                if owner == rank {
                    owed.push((id, share.fragments));
                } else if let Some(fragments) = stash.remove(&id) {
                    by_dst.entry(owner).or_default().extend(fragments);
                }
            }
            for (dst, curves) in by_dst {
                self.comm.send_curves(dst, curves)?;
            }

            while owed
                .iter()
                .any(|(id, need)| stash.get(id).map_or(0, Vec::len) < *need as usize)
            {
                let deliveries = self
                    .comm
                    .poll(&[MessageTag::CurveTransfer], PollMode::Blocking)
                    .await?;
                for delivery in deliveries {
                    if let Delivery::Curves { curves, .. } = delivery {
                        for curve in curves {
                            stash.entry(curve.id).or_default().push(curve);
                        }
                    }
                }
            }

            for (id, _) in owed {
                let fragments = stash.remove(&id).unwrap_or_default();
                if let Some(curve) = merge_fragments(fragments) {
                    assembled.push(curve);
                }
            }
            lo = hi;
        }

        if !stash.is_empty() {
            warn!(
                rank,
                leftover = stash.len(),
                "fragments received for ids outside the agreed range"
            );
        }
        self.comm.barrier().await?;
        debug!(rank, assembled = assembled.len(), "reassembly done");
        Ok(assembled)
    }
}
