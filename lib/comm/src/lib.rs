// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Pathline Comm
//!
//! Reliable point-to-point asynchronous messaging between ranks: tag
//! multiplexing, automatic fragmentation and reassembly of oversized
//! payloads, curve-transfer rehydration, block preamble handling, and the
//! small control-plane collectives (barrier, all-reduce) the higher layers
//! need. Transport is abstracted behind [`RankTransport`]; the in-process
//! [`ChannelMesh`] serves tests, simulations, and single-machine multi-rank
//! runs.

mod control;
mod layer;
pub mod packet;
mod tag;
mod transport;

use pathline_core::Rank;

pub use control::IdShare;
pub use layer::{CommLayer, CommStatsSnapshot, Delivery, PollMode};
pub use tag::MessageTag;
pub use transport::{ChannelMesh, ChannelTransport, RankTransport};

#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("packet of {0} bytes is shorter than the packet header")]
    ShortPacket(usize),

    #[error("invalid message tag byte: {0}")]
    InvalidTag(u8),

    #[error("malformed packet header: {0}")]
    MalformedHeader(String),

    #[error("duplicate packet {index}/{count} for message {message_id} from rank {sender}")]
    DuplicatePacket {
        sender: Rank,
        message_id: u64,
        index: u32,
        count: u32,
    },

    /// Fatal internal-consistency error: a completed receive that cannot be
    /// matched to anything we posted.
    #[error("completed receive could not be matched to a posted buffer: {0}")]
    UnmatchedReceive(String),

    #[error("rank {0} is unreachable")]
    PeerUnreachable(Rank),

    #[error("control payload decode failed: {0}")]
    Decode(String),

    /// A collective received a message from a different collective; all
    /// ranks must invoke collectives in the same order.
    #[error("collective protocol violation: {0}")]
    CollectiveMismatch(String),

    #[error("communicator shut down")]
    Shutdown,
}
