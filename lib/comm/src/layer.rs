// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tag-multiplexed messaging layer over a [`RankTransport`].
//!
//! One `CommLayer` lives on each rank. Sends fragment oversized payloads
//! into packets; polls drain the transport, feed the reassembler, and route
//! completed payloads to per-tag queues. Curve-transfer payloads are
//! rehydrated into fresh `Curve` instances on arrival; block transfers are
//! matched against the size announced by their preamble. A bulk block
//! payload with no prior preamble is a fatal internal-consistency error.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use pathline_core::{BlockId, Curve, Rank};

use crate::control::ControlMessage;
use crate::packet::{fragment, Reassembled, Reassembler};
use crate::tag::MessageTag;
use crate::transport::RankTransport;
use crate::CommError;

/// How a poll behaves when nothing is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Return immediately with whatever is ready.
    NonBlocking,
    /// Wait up to the given duration for the first new frame.
    Timeout(Duration),
    /// Wait until at least one new frame arrives.
    Blocking,
}

/// A fully reassembled, tag-routed payload.
#[derive(Debug)]
pub enum Delivery {
    /// Application-level control body (status report or directive).
    Status { from: Rank, body: Bytes },
    /// Curves whose ownership just transferred to this rank.
    Curves { from: Rank, curves: Vec<Curve> },
    /// Bulk block data announced by a preamble.
    Block {
        from: Rank,
        block: BlockId,
        data: Bytes,
    },
}

impl Delivery {
    pub fn tag(&self) -> MessageTag {
        match self {
            Delivery::Status { .. } => MessageTag::Status,
            Delivery::Curves { .. } => MessageTag::CurveTransfer,
            Delivery::Block { .. } => MessageTag::BlockTransfer,
        }
    }
}

/// Diagnostics counters. Not part of the correctness contract.
#[derive(Debug, Default)]
pub(crate) struct CommStats {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    curves_sent: AtomicU64,
    blocks_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommStatsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub curves_sent: u64,
    pub blocks_sent: u64,
}

/// Curve-transfer payload body: `{ sender, curves }`.
#[derive(Serialize, Deserialize)]
struct CurveBundle {
    sender: Rank,
    curves: Vec<Curve>,
}

/// Block-preamble payload body: announces the bulk payload that follows.
#[derive(Serialize, Deserialize)]
struct BlockPreamble {
    block: BlockId,
    payload_size: u64,
}

#[derive(Default)]
struct Queues {
    status: VecDeque<(Rank, Bytes)>,
    curves: VecDeque<(Rank, Vec<Curve>)>,
    blocks: VecDeque<(Rank, BlockId, Bytes)>,
    collective: VecDeque<ControlMessage>,
    /// One-shot expected bulk receive per sender, primed by a preamble.
    expected_block: HashMap<Rank, (BlockId, u64)>,
}

pub struct CommLayer {
    transport: Arc<dyn RankTransport>,
    max_packet: usize,
    next_message_id: AtomicU64,
    reassembler: Mutex<Reassembler>,
    queues: Mutex<Queues>,
    stats: CommStats,
}

impl CommLayer {
    pub fn new(transport: Arc<dyn RankTransport>, max_packet: usize) -> Self {
        assert!(max_packet > 0, "max_packet must be positive");
        Self {
            transport,
            max_packet,
            next_message_id: AtomicU64::new(0),
            reassembler: Mutex::new(Reassembler::new()),
            queues: Mutex::new(Queues::default()),
            stats: CommStats::default(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.transport.world_size()
    }

    /// Queue a tagged payload for `dst`, fragmenting as needed.
    pub fn send_tagged(&self, dst: Rank, tag: MessageTag, payload: Bytes) -> Result<(), CommError> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let len = payload.len();
        let frames = fragment(self.rank(), message_id, tag, payload, self.max_packet)?;
        trace!(dst, ?tag, len, packets = frames.len(), "send");
        for frame in frames {
            self.transport.send(dst, frame)?;
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Transfer curve ownership to `dst`. Taking the curves by value is the
    /// point: the sender's copies are gone once the bundle is issued.
    pub fn send_curves(&self, dst: Rank, curves: Vec<Curve>) -> Result<(), CommError> {
        let count = curves.len() as u64;
        let bundle = CurveBundle {
            sender: self.rank(),
            curves,
        };
        let body = bincode::serde::encode_to_vec(&bundle, bincode::config::standard())
            .map_err(|e| CommError::Decode(e.to_string()))?;
        self.send_tagged(dst, MessageTag::CurveTransfer, body.into())?;
        self.stats.curves_sent.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Ship a block's data: a preamble announcing the size, then the bulk
    /// payload. The receiver uses the preamble to post a right-sized
    /// one-shot receive before the bulk arrives.
    pub fn send_block(&self, dst: Rank, block: BlockId, data: Bytes) -> Result<(), CommError> {
        let preamble = BlockPreamble {
            block,
            payload_size: data.len() as u64,
        };
        let body = bincode::serde::encode_to_vec(&preamble, bincode::config::standard())
            .map_err(|e| CommError::Decode(e.to_string()))?;
        self.send_tagged(dst, MessageTag::BlockPreamble, body.into())?;
        self.send_tagged(dst, MessageTag::BlockTransfer, data)?;
        self.stats.blocks_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send an application control body (status report or directive) on the
    /// status tag.
    pub fn send_status(&self, dst: Rank, body: Bytes) -> Result<(), CommError> {
        self.send_control(dst, ControlMessage::Status(body))
    }

    pub(crate) fn send_control(&self, dst: Rank, msg: ControlMessage) -> Result<(), CommError> {
        let body = bincode::serde::encode_to_vec(&msg, bincode::config::standard())
            .map_err(|e| CommError::Decode(e.to_string()))?;
        self.send_tagged(dst, MessageTag::Status, body.into())
    }

    /// Complete ready receives for the requested tags.
    ///
    /// Always drains everything the transport already has; in `Timeout` or
    /// `Blocking` mode, additionally waits for one new frame when nothing
    /// requested is ready yet. Payloads for tags not in `tags` stay queued
    /// for a later poll.
    pub async fn poll(
        &self,
        tags: &[MessageTag],
        mode: PollMode,
    ) -> Result<Vec<Delivery>, CommError> {
        self.pump_ready()?;
        if !self.has_ready(tags) {
            match mode {
                PollMode::NonBlocking => {}
                PollMode::Timeout(limit) => {
                    if let Ok(pumped) = tokio::time::timeout(limit, self.pump_one()).await {
                        pumped?;
                        self.pump_ready()?;
                    }
                }
                PollMode::Blocking => {
                    while !self.has_ready(tags) {
                        self.pump_one().await?;
                        self.pump_ready()?;
                    }
                }
            }
        }
        Ok(self.take_ready(tags))
    }

    /// Cancel and free all posted receive state: partial reassembly buffers,
    /// queued payloads, and anything still sitting in the transport. Used at
    /// teardown; in-flight data is not salvaged.
    pub fn cancel_outstanding(&self) {
        let dropped_partials = {
            let mut reassembler = self.reassembler.lock();
            let n = reassembler.pending();
            reassembler.clear();
            n
        };
        let mut queues = self.queues.lock();
        queues.status.clear();
        queues.curves.clear();
        queues.blocks.clear();
        queues.collective.clear();
        queues.expected_block.clear();
        drop(queues);
        let mut drained = 0usize;
        while self.transport.try_recv().is_some() {
            drained += 1;
        }
        debug!(dropped_partials, drained, "cancelled outstanding receives");
    }

    pub fn stats(&self) -> CommStatsSnapshot {
        CommStatsSnapshot {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            curves_sent: self.stats.curves_sent.load(Ordering::Relaxed),
            blocks_sent: self.stats.blocks_sent.load(Ordering::Relaxed),
        }
    }

    // ---- internal frame pump ----------------------------------------------

    /// Ingest every frame the transport already holds.
    fn pump_ready(&self) -> Result<(), CommError> {
        while let Some((_, frame)) = self.transport.try_recv() {
            self.ingest(frame)?;
        }
        Ok(())
    }

    /// Await one frame and ingest it.
    async fn pump_one(&self) -> Result<(), CommError> {
        match self.transport.recv().await {
            Some((_, frame)) => self.ingest(frame),
            None => Err(CommError::Shutdown),
        }
    }

    fn ingest(&self, frame: Bytes) -> Result<(), CommError> {
        let Some(done) = self.reassembler.lock().ingest(frame)? else {
            return Ok(());
        };
        self.route(done)
    }

    fn route(&self, done: Reassembled) -> Result<(), CommError> {
        let mut queues = self.queues.lock();
        match done.tag {
            MessageTag::Status => {
                let (msg, _): (ControlMessage, usize) =
                    bincode::serde::decode_from_slice(&done.payload, bincode::config::standard())
                        .map_err(|e| CommError::Decode(e.to_string()))?;
                match msg {
                    ControlMessage::Status(body) => queues.status.push_back((done.sender, body)),
                    collective => queues.collective.push_back(collective),
                }
            }
            MessageTag::CurveTransfer => {
                let (bundle, _): (CurveBundle, usize) =
                    bincode::serde::decode_from_slice(&done.payload, bincode::config::standard())
                        .map_err(|e| CommError::Decode(e.to_string()))?;
                trace!(from = bundle.sender, count = bundle.curves.len(), "curves arrived");
                queues.curves.push_back((bundle.sender, bundle.curves));
            }
            MessageTag::BlockPreamble => {
                let (preamble, _): (BlockPreamble, usize) =
                    bincode::serde::decode_from_slice(&done.payload, bincode::config::standard())
                        .map_err(|e| CommError::Decode(e.to_string()))?;
                queues
                    .expected_block
                    .insert(done.sender, (preamble.block, preamble.payload_size));
            }
            MessageTag::BlockTransfer => {
                let Some((block, announced)) = queues.expected_block.remove(&done.sender) else {
                    return Err(CommError::UnmatchedReceive(format!(
                        "bulk block payload from rank {} without a preamble",
                        done.sender
                    )));
                };
                if done.payload.len() as u64 != announced {
                    return Err(CommError::UnmatchedReceive(format!(
                        "bulk block payload from rank {} is {} bytes, preamble announced {}",
                        done.sender,
                        done.payload.len(),
                        announced
                    )));
                }
                queues.blocks.push_back((done.sender, block, done.payload));
            }
        }
        Ok(())
    }

    // ---- per-tag queue access ---------------------------------------------

    fn has_ready(&self, tags: &[MessageTag]) -> bool {
        let queues = self.queues.lock();
        tags.iter().any(|tag| match tag {
            MessageTag::Status => !queues.status.is_empty(),
            MessageTag::CurveTransfer => !queues.curves.is_empty(),
            MessageTag::BlockTransfer => !queues.blocks.is_empty(),
            MessageTag::BlockPreamble => false, // consumed internally
        })
    }

    fn take_ready(&self, tags: &[MessageTag]) -> Vec<Delivery> {
        let mut queues = self.queues.lock();
        let mut out = Vec::new();
        for tag in tags {
            match tag {
                MessageTag::Status => {
                    out.extend(
                        queues
                            .status
                            .drain(..)
                            .map(|(from, body)| Delivery::Status { from, body }),
                    );
                }
                MessageTag::CurveTransfer => {
                    out.extend(
                        queues
                            .curves
                            .drain(..)
                            .map(|(from, curves)| Delivery::Curves { from, curves }),
                    );
                }
                MessageTag::BlockTransfer => {
                    out.extend(
                        queues
                            .blocks
                            .drain(..)
                            .map(|(from, block, data)| Delivery::Block { from, block, data }),
                    );
                }
                MessageTag::BlockPreamble => {}
            }
        }
        out
    }

    pub(crate) fn pop_collective(&self) -> Option<ControlMessage> {
        self.queues.lock().collective.pop_front()
    }

    /// Pump frames until a collective control message is available. Used by
    /// the barrier and reduce implementations, which are the deliberately
    /// blocking spots in the system.
    pub(crate) async fn next_collective(&self) -> Result<ControlMessage, CommError> {
        loop {
            self.pump_ready()?;
            if let Some(msg) = self.pop_collective() {
                return Ok(msg);
            }
            self.pump_one().await?;
        }
    }
}
