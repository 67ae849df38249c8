// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The decision pass: an ordered list of heuristics over the current
//! [`PeerRecord`]s and the manager's own curve pool.
//!
//! Each case is a pure function of the records; none of them send anything.
//! Cases run in fixed priority order and each may fire for several workers
//! in one pass, but a worker is targeted by at most one directive per pass
//! so the optimistic bookkeeping stays coherent. Workers matching no case
//! are genuinely idle; that is expected and only logged.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use pathline_core::{BlockId, Rank};

use crate::message::{Directive, SubReport};
use crate::peer::PeerRecord;

/// One scheduling decision. `Direct` goes out as a directive to a worker;
/// `ShipPool` moves curves out of the manager's own pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Direct { dst: Rank, directive: Directive },
    ShipPool { block: BlockId, dst: Rank, count: u32 },
}

/// Load thresholds derived from the mean active-curve count per worker.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub overload: f64,
    pub underload: f64,
}

impl Thresholds {
    pub fn from_mean(mean: f64, overload_factor: f64, underload_factor: f64) -> Self {
        Self {
            overload: mean * overload_factor,
            underload: mean * underload_factor,
        }
    }
}

/// A slacker holds no runnable work: every curve it has is waiting on a
/// block it has not loaded.
fn is_slacker(peer: &PeerRecord, thresholds: &Thresholds) -> bool {
    let runnable: u32 = peer
        .loaded_blocks()
        .map(|block| peer.backlog_for(block))
        .sum();
    runnable == 0 || (peer.ic_count() as f64) < thresholds.underload
}

fn is_overloaded(peer: &PeerRecord, thresholds: &Thresholds) -> bool {
    peer.ic_count() as f64 > thresholds.overload && peer.ic_count() > 0
}

fn is_idle(peer: &PeerRecord) -> bool {
    peer.ic_count() == 0
}

/// Run cases 1 through 5 in priority order and report the leftover
/// slackers (case 6). `pool` is the manager's own backlog by block.
pub fn decide(
    peers: &[PeerRecord],
    pool: &[(BlockId, u32)],
    thresholds: &Thresholds,
) -> (Vec<Action>, Vec<Rank>) {
    let mut actions = Vec::new();
    let mut targeted: HashSet<Rank> = HashSet::new();
    let mut pool_left: Vec<(BlockId, u32)> = pool.iter().copied().filter(|(_, n)| *n > 0).collect();

    // Case 1: a slacker's unloaded backlog goes straight to a peer that
    // already has the block loaded and has capacity.
    for slacker in peers.iter().filter(|p| is_slacker(p, thresholds)) {
        if targeted.contains(&slacker.rank()) {
            continue;
        }
        let hit = slacker.unloaded_backlog().find_map(|(block, _)| {
            peers
                .iter()
                .find(|p| {
                    p.rank() != slacker.rank()
                        && !targeted.contains(&p.rank())
                        && p.has_loaded(block)
                        && !is_overloaded(p, thresholds)
                })
                .map(|p| (block, p.rank()))
        });
        if let Some((block, dst)) = hit {
            actions.push(Action::Direct {
                dst: slacker.rank(),
                directive: Directive::SendToPeer { block, dst },
            });
            targeted.insert(slacker.rank());
        }
    }

    // Case 2: a slacker with nothing runnable and no peer to hand off to
    // loads its biggest backlog block itself.
    for slacker in peers.iter().filter(|p| is_slacker(p, thresholds)) {
        if targeted.contains(&slacker.rank()) {
            continue;
        }
        let runnable: u32 = slacker
            .loaded_blocks()
            .map(|block| slacker.backlog_for(block))
            .sum();
        if runnable > 0 {
            continue;
        }
        if let Some((block, _)) = slacker
            .unloaded_backlog()
            .max_by_key(|(b, n)| (*n, std::cmp::Reverse(b.linear())))
        {
            actions.push(Action::Direct {
                dst: slacker.rank(),
                directive: Directive::ForceLoad { block },
            });
            targeted.insert(slacker.rank());
        }
    }

    // Case 3: pooled curves whose block a slacker already has loaded.
    for entry in pool_left.iter_mut() {
        let (block, count) = *entry;
        let hit = peers.iter().find(|p| {
            is_slacker(p, thresholds) && !targeted.contains(&p.rank()) && p.has_loaded(block)
        });
        if let Some(peer) = hit {
            actions.push(Action::ShipPool {
                block,
                dst: peer.rank(),
                count,
            });
            targeted.insert(peer.rank());
            entry.1 = 0;
        }
    }

    // Case 4: the most populous pooled block nobody has loaded goes to an
    // idle slacker, which is told to load it.
    pool_left.sort_by_key(|(b, n)| (std::cmp::Reverse(*n), b.linear()));
    for entry in pool_left.iter_mut() {
        let (block, count) = *entry;
        if count == 0 {
            continue;
        }
        let hit = peers
            .iter()
            .filter(|p| is_slacker(p, thresholds) && !targeted.contains(&p.rank()))
            .min_by_key(|p| p.ic_count());
        let Some(peer) = hit else {
            break;
        };
        actions.push(Action::ShipPool {
            block,
            dst: peer.rank(),
            count,
        });
        actions.push(Action::Direct {
            dst: peer.rank(),
            directive: Directive::ForceLoad { block },
        });
        targeted.insert(peer.rank());
        entry.1 = 0;
    }

    // Case 5: an overloaded worker pushes part of its backlog toward an
    // idle worker, preferring one that shares the loaded block. Without a
    // sharer any idle worker will do; the next pass force-loads there.
    for busy in peers.iter().filter(|p| is_overloaded(p, thresholds)) {
        if targeted.contains(&busy.rank()) {
            continue;
        }
        // Unloaded backlog first: those curves are certainly shippable,
        // while curves counted against a loaded block may already be
        // mid-advance on the busy worker.
        let shippable: Vec<BlockId> = busy
            .unloaded_backlog()
            .filter(|(_, n)| *n > 1)
            .map(|(b, _)| b)
            .chain(
                busy.loaded_blocks()
                    .filter(|block| busy.backlog_for(*block) > 1),
            )
            .collect();
        let hit = shippable.into_iter().find_map(|block| {
            let candidate = |require_share: bool| {
                peers.iter().find(|p| {
                    p.rank() != busy.rank()
                        && !targeted.contains(&p.rank())
                        && is_idle(p)
                        && (!require_share || p.has_loaded(block))
                })
            };
            candidate(true)
                .or_else(|| candidate(false))
                .map(|p| (block, p.rank()))
        });
        if let Some((block, dst)) = hit {
            let max = busy.backlog_for(block).div_ceil(2);
            actions.push(Action::Direct {
                dst: busy.rank(),
                directive: Directive::OffloadBacklog { block, dst, max },
            });
            targeted.insert(busy.rank());
            targeted.insert(dst);
        }
    }

    // Case 6: record who is left idle with nothing to give them.
    let slackers: Vec<Rank> = peers
        .iter()
        .filter(|p| {
            p.just_updated() && is_slacker(p, thresholds) && !targeted.contains(&p.rank())
        })
        .map(|p| p.rank())
        .collect();
    for rank in &slackers {
        debug!(rank, "worker is a slacker with nothing to schedule");
    }

    (actions, slackers)
}

/// Pair busy workgroups with idle ones for the manager-to-manager pass.
/// Idle candidates are shuffled so the same pairs do not form every round.
pub fn pair_idle_busy<R: Rng>(subs: &[SubReport], rng: &mut R) -> Vec<(Rank, Rank, BlockId, u32)> {
    let mut idle: Vec<Rank> = subs
        .iter()
        .filter(|s| s.outstanding == 0)
        .map(|s| s.manager)
        .collect();
    idle.shuffle(rng);

    let mut busy: Vec<&SubReport> = subs
        .iter()
        .filter(|s| s.outstanding > 0 && s.top_block.is_some())
        .collect();
    busy.sort_by_key(|s| std::cmp::Reverse(s.outstanding));

    busy.into_iter()
        .zip(idle)
        .filter_map(|(sub, idle_manager)| {
            sub.top_block
                .map(|(block, count)| (sub.manager, idle_manager, block, count.div_ceil(2)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusReport;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    const B0: BlockId = BlockId { domain: 0, timestep: 0 };
    const B1: BlockId = BlockId { domain: 1, timestep: 0 };
    const B2: BlockId = BlockId { domain: 2, timestep: 0 };

    fn peer(rank: Rank, active: &[(BlockId, u32)], loaded: &[BlockId]) -> PeerRecord {
        let mut record = PeerRecord::new(rank);
        record.apply_report(&StatusReport {
            worker: rank,
            active_by_block: active.to_vec(),
            loaded_blocks: loaded.to_vec(),
            terminated_delta: 0,
        });
        record
    }

    fn thresholds(peers: &[PeerRecord]) -> Thresholds {
        let mean =
            peers.iter().map(|p| p.ic_count() as f64).sum::<f64>() / peers.len().max(1) as f64;
        Thresholds::from_mean(mean, 1.5, 0.5)
    }

    #[test]
    fn case1_ships_backlog_to_the_peer_with_the_block() {
        let peers = vec![
            peer(1, &[(B1, 6)], &[]),      // slacker, backlog unloaded
            peer(2, &[(B1, 2)], &[B1]),    // has the block, has capacity
        ];
        let (actions, _) = decide(&peers, &[], &thresholds(&peers));
        assert_eq!(
            actions[0],
            Action::Direct {
                dst: 1,
                directive: Directive::SendToPeer { block: B1, dst: 2 }
            }
        );
    }

    #[test]
    fn case2_forces_the_biggest_backlog_block_to_load() {
        let peers = vec![
            peer(1, &[(B1, 2), (B2, 5)], &[]),
            peer(2, &[(B0, 3)], &[B0]),
        ];
        let (actions, _) = decide(&peers, &[], &thresholds(&peers));
        assert_eq!(
            actions[0],
            Action::Direct {
                dst: 1,
                directive: Directive::ForceLoad { block: B2 }
            }
        );
    }

    #[test]
    fn case1_outranks_case2_for_the_same_slacker() {
        // Both apply to worker 1; only the peer-to-peer transfer fires.
        let peers = vec![
            peer(1, &[(B1, 6)], &[]),
            peer(2, &[(B1, 1)], &[B1]),
        ];
        let (actions, _) = decide(&peers, &[], &thresholds(&peers));
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            Action::Direct {
                directive: Directive::SendToPeer { .. },
                ..
            }
        ));
    }

    #[test]
    fn case3_gives_pool_curves_to_a_slacker_with_the_block_loaded() {
        let peers = vec![peer(1, &[], &[B1]), peer(2, &[(B0, 8)], &[B0])];
        let (actions, _) = decide(&peers, &[(B1, 5)], &thresholds(&peers));
        assert!(actions.contains(&Action::ShipPool {
            block: B1,
            dst: 1,
            count: 5
        }));
    }

    #[test]
    fn case4_pairs_the_biggest_pool_block_with_a_force_load() {
        let peers = vec![peer(1, &[], &[]), peer(2, &[(B0, 8)], &[B0])];
        let (actions, _) = decide(&peers, &[(B1, 2), (B2, 9)], &thresholds(&peers));
        assert_eq!(
            actions[0],
            Action::ShipPool {
                block: B2,
                dst: 1,
                count: 9
            }
        );
        assert_eq!(
            actions[1],
            Action::Direct {
                dst: 1,
                directive: Directive::ForceLoad { block: B2 }
            }
        );
    }

    #[test]
    fn case5_offloads_an_overloaded_worker_toward_a_shared_block() {
        let peers = vec![
            peer(1, &[(B0, 20)], &[B0]),
            peer(2, &[], &[B0]),
            peer(3, &[(B1, 4)], &[B1]),
        ];
        let (actions, _) = decide(&peers, &[], &thresholds(&peers));
        let offload = actions.iter().find(|a| {
            matches!(
                a,
                Action::Direct {
                    dst: 1,
                    directive: Directive::OffloadBacklog { block: B0, dst: 2, .. }
                }
            )
        });
        assert!(offload.is_some(), "got {actions:?}");
    }

    #[test]
    fn idle_worker_with_nothing_to_give_is_only_logged() {
        let peers = vec![
            peer(1, &[], &[B2]),
            peer(2, &[(B0, 2)], &[B0]),
            peer(3, &[(B1, 2)], &[B1]),
        ];
        let (actions, slackers) = decide(&peers, &[], &thresholds(&peers));
        assert!(actions.is_empty(), "got {actions:?}");
        assert_eq!(slackers, vec![1]);
    }

    /// Whenever one worker has a backlog and another is idle, some case
    /// fires, whatever the block-overlap configuration.
    #[rstest]
    #[case::idle_has_it_loaded(&[B1], &[])]
    #[case::busy_has_it_loaded(&[], &[B1])]
    #[case::both_loaded(&[B1], &[B1])]
    #[case::nobody_loaded(&[], &[])]
    fn liveness_some_case_always_fires(#[case] idle_loaded: &[BlockId], #[case] busy_loaded: &[BlockId]) {
        let peers = vec![
            peer(1, &[], idle_loaded),
            peer(2, &[(B1, 10)], busy_loaded),
        ];
        let (actions, _) = decide(&peers, &[], &thresholds(&peers));
        assert!(!actions.is_empty(), "no case fired: {actions:?}");
    }

    #[test]
    fn pairing_matches_busiest_with_idle() {
        let subs = vec![
            SubReport { manager: 0, outstanding: 0, terminated: 10, top_block: None },
            SubReport { manager: 4, outstanding: 30, terminated: 2, top_block: Some((B1, 12)) },
            SubReport { manager: 8, outstanding: 0, terminated: 7, top_block: None },
        ];
        let mut rng = StdRng::seed_from_u64(11);
        let pairs = pair_idle_busy(&subs, &mut rng);
        assert_eq!(pairs.len(), 1);
        let (busy, idle, block, max) = pairs[0];
        assert_eq!(busy, 4);
        assert!(idle == 0 || idle == 8);
        assert_eq!(block, B1);
        assert_eq!(max, 6);
    }
}
