// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the communication layer over an in-process mesh.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use pathline_comm::{ChannelMesh, CommLayer, Delivery, MessageTag, PollMode};
use pathline_core::{BlockId, Curve, Direction, TrajectoryPoint};

const SMALL_PACKET: usize = 256;

fn layers(n: u32, max_packet: usize) -> Vec<Arc<CommLayer>> {
    ChannelMesh::new(n)
        .into_iter()
        .map(|t| Arc::new(CommLayer::new(Arc::new(t), max_packet)))
        .collect()
}

fn seed_curve(id: u64, origin: u32) -> Curve {
    let mut curve = Curve::new(
        id,
        Direction::Forward,
        origin,
        TrajectoryPoint {
            position: [id as f64, 0.0, 0.0],
            time: 0.0,
        },
    );
    curve.solver_state = Bytes::from(vec![id as u8; 64]);
    curve
}

#[tokio::test]
async fn curve_transfer_rehydrates_and_moves_ownership() {
    let layers = layers(2, SMALL_PACKET);

    // A bundle large enough to fragment.
    let outgoing: Vec<Curve> = (0..20).map(|id| seed_curve(id, 0)).collect();
    layers[0].send_curves(1, outgoing).unwrap();

    let got = layers[1]
        .poll(&[MessageTag::CurveTransfer], PollMode::Blocking)
        .await
        .unwrap();
    assert_eq!(got.len(), 1);
    let Delivery::Curves { from, curves } = &got[0] else {
        panic!("expected curves, got {:?}", got[0]);
    };
    assert_eq!(*from, 0);
    assert_eq!(curves.len(), 20);
    assert_eq!(curves[7].id, 7);
    assert_eq!(curves[7].solver_state, Bytes::from(vec![7u8; 64]));

    let stats = layers[0].stats();
    assert_eq!(stats.curves_sent, 20);
}

#[tokio::test]
async fn block_transfer_follows_preamble() {
    let layers = layers(2, SMALL_PACKET);
    let block = BlockId::new(3, 1);
    let data = Bytes::from(vec![0xabu8; 4 * SMALL_PACKET + 17]);

    layers[0].send_block(1, block, data.clone()).unwrap();

    let got = layers[1]
        .poll(&[MessageTag::BlockTransfer], PollMode::Blocking)
        .await
        .unwrap();
    assert_eq!(got.len(), 1);
    match &got[0] {
        Delivery::Block {
            from,
            block: b,
            data: d,
        } => {
            assert_eq!(*from, 0);
            assert_eq!(*b, block);
            assert_eq!(*d, data);
        }
        other => panic!("expected block, got {other:?}"),
    }
}

#[tokio::test]
async fn bulk_block_without_preamble_is_fatal() {
    let layers = layers(2, SMALL_PACKET);

    layers[0]
        .send_tagged(1, MessageTag::BlockTransfer, Bytes::from_static(b"orphan"))
        .unwrap();

    let err = layers[1]
        .poll(&[MessageTag::BlockTransfer], PollMode::Blocking)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("posted buffer"), "got: {err}");
}

#[tokio::test]
async fn poll_leaves_unrequested_tags_queued() {
    let layers = layers(2, SMALL_PACKET);

    layers[0].send_status(1, Bytes::from_static(b"report")).unwrap();
    layers[0].send_curves(1, vec![seed_curve(1, 0)]).unwrap();

    let status_only = layers[1]
        .poll(&[MessageTag::Status], PollMode::Blocking)
        .await
        .unwrap();
    assert!(matches!(status_only[..], [Delivery::Status { .. }]));

    // The curve bundle was ingested but stays queued for its own tag.
    let curves = layers[1]
        .poll(&[MessageTag::CurveTransfer], PollMode::NonBlocking)
        .await
        .unwrap();
    assert!(matches!(curves[..], [Delivery::Curves { .. }]));
}

#[tokio::test]
async fn nonblocking_poll_returns_empty_when_idle() {
    let layers = layers(2, SMALL_PACKET);
    let got = layers[1]
        .poll(&MessageTag::ALL, PollMode::NonBlocking)
        .await
        .unwrap();
    assert!(got.is_empty());

    let got = layers[1]
        .poll(&MessageTag::ALL, PollMode::Timeout(Duration::from_millis(5)))
        .await
        .unwrap();
    assert!(got.is_empty());
}

#[tokio::test]
async fn cancel_outstanding_drops_everything() {
    let layers = layers(2, SMALL_PACKET);
    layers[0].send_status(1, Bytes::from_static(b"stale")).unwrap();
    layers[0].send_curves(1, vec![seed_curve(9, 0)]).unwrap();

    layers[1].cancel_outstanding();

    let got = layers[1]
        .poll(&MessageTag::ALL, PollMode::NonBlocking)
        .await
        .unwrap();
    assert!(got.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_releases_all_ranks() {
    let layers = layers(4, SMALL_PACKET);
    let mut handles = Vec::new();
    for layer in layers {
        handles.push(tokio::spawn(async move {
            layer.barrier().await.unwrap();
            layer.rank()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn allreduce_sums_across_ranks() {
    let layers = layers(3, SMALL_PACKET);
    let mut handles = Vec::new();
    for (i, layer) in layers.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            layer.allreduce_sum([i as u64 + 1, 10, 0]).await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), [6, 30, 0]);
    }
}

/// Discrete-event exercise of all four tags under a seeded-random
/// interleaving: every rank keeps sending and polling with receive capacity
/// always re-posted, then everyone meets at a barrier. The test passing at
/// all is the property: no interleaving wedges the mesh.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_interleaving_never_deadlocks() {
    const RANKS: u32 = 4;
    const ROUNDS: usize = 200;

    for seed in [7u64, 1234, 99_999] {
        let layers = layers(RANKS, 64);
        let mut handles = Vec::new();
        for layer in layers {
            handles.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed ^ layer.rank() as u64);
                let mut curves_seen = 0usize;
                for round in 0..ROUNDS {
                    let dst = loop {
                        let d = rng.gen_range(0..RANKS);
                        if d != layer.rank() {
                            break d;
                        }
                    };
                    match rng.gen_range(0..3) {
                        0 => {
                            let body = vec![round as u8; rng.gen_range(1..300)];
                            layer.send_status(dst, body.into()).unwrap();
                        }
                        1 => {
                            let id = (layer.rank() as u64) << 32 | round as u64;
                            layer.send_curves(dst, vec![seed_curve(id, layer.rank())]).unwrap();
                        }
                        _ => {
                            let data = vec![round as u8; rng.gen_range(1..500)];
                            layer
                                .send_block(dst, BlockId::new(round as u32, 0), data.into())
                                .unwrap();
                        }
                    }
                    let got = layer
                        .poll(&MessageTag::ALL, PollMode::Timeout(Duration::from_millis(1)))
                        .await
                        .unwrap();
                    curves_seen += got
                        .iter()
                        .filter(|d| matches!(d, Delivery::Curves { .. }))
                        .count();
                }
                // Final drain so late arrivals are consumed, then sync.
                layer
                    .poll(&MessageTag::ALL, PollMode::Timeout(Duration::from_millis(20)))
                    .await
                    .unwrap();
                layer.barrier().await.unwrap();
                layer.cancel_outstanding();
                curves_seen
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
