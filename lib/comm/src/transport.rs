// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rank-addressable transport abstraction.
//!
//! [`RankTransport`] is the seam between the communication layer and the
//! actual wire. Sends are non-blocking: the transport owns the frame once
//! `send` returns, and reclaims its buffers when the underlying machinery
//! reports completion (the channel transport completes immediately).
//!
//! [`ChannelMesh`] wires `n` ranks together in-process over unbounded flume
//! channels. It backs the test suite, the no-deadlock simulation, and
//! single-machine multi-rank runs; an MPI or TCP transport would implement
//! the same trait.

use async_trait::async_trait;
use bytes::Bytes;
use pathline_core::Rank;

use crate::CommError;

#[async_trait]
pub trait RankTransport: Send + Sync {
    /// This endpoint's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the communicator.
    fn world_size(&self) -> u32;

    /// Queue one frame for `dst`. Non-blocking; the frame is owned by the
    /// transport from here on.
    fn send(&self, dst: Rank, frame: Bytes) -> Result<(), CommError>;

    /// Take one ready frame if any is waiting.
    fn try_recv(&self) -> Option<(Rank, Bytes)>;

    /// Wait for the next frame. Returns `None` when the communicator has
    /// shut down (every peer endpoint dropped).
    async fn recv(&self) -> Option<(Rank, Bytes)>;
}

/// Builder for an in-process full mesh of [`ChannelTransport`] endpoints.
pub struct ChannelMesh;

impl ChannelMesh {
    /// Create `n` connected endpoints; index `i` is rank `i`.
    pub fn new(n: u32) -> Vec<ChannelTransport> {
        assert!(n > 0, "mesh needs at least one rank");
        let mut senders = Vec::with_capacity(n as usize);
        let mut receivers = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let (tx, rx) = flume::unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelTransport {
                rank: rank as Rank,
                world_size: n,
                peers: senders.clone(),
                inbox,
            })
            .collect()
    }
}

/// One rank's endpoint of a [`ChannelMesh`].
pub struct ChannelTransport {
    rank: Rank,
    world_size: u32,
    peers: Vec<flume::Sender<(Rank, Bytes)>>,
    inbox: flume::Receiver<(Rank, Bytes)>,
}

#[async_trait]
impl RankTransport for ChannelTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn send(&self, dst: Rank, frame: Bytes) -> Result<(), CommError> {
        let peer = self
            .peers
            .get(dst as usize)
            .ok_or(CommError::PeerUnreachable(dst))?;
        peer.send((self.rank, frame))
            .map_err(|_| CommError::PeerUnreachable(dst))
    }

    fn try_recv(&self) -> Option<(Rank, Bytes)> {
        self.inbox.try_recv().ok()
    }

    async fn recv(&self) -> Option<(Rank, Bytes)> {
        self.inbox.recv_async().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mesh_delivers_point_to_point() {
        let mut mesh = ChannelMesh::new(3);
        let t2 = mesh.pop().unwrap();
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();

        t0.send(2, Bytes::from_static(b"to-two")).unwrap();
        t1.send(2, Bytes::from_static(b"from-one")).unwrap();

        let (from_a, frame_a) = t2.recv().await.unwrap();
        let (from_b, frame_b) = t2.recv().await.unwrap();
        let mut got = vec![(from_a, frame_a), (from_b, frame_b)];
        got.sort_by_key(|(from, _)| *from);

        assert_eq!(got[0], (0, Bytes::from_static(b"to-two")));
        assert_eq!(got[1], (1, Bytes::from_static(b"from-one")));
        assert!(t0.try_recv().is_none());
    }

    #[test]
    fn send_to_unknown_rank_fails() {
        let mesh = ChannelMesh::new(2);
        assert!(matches!(
            mesh[0].send(5, Bytes::new()),
            Err(CommError::PeerUnreachable(5))
        ));
    }
}
