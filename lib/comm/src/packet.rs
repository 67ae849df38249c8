// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet codec for the rank-to-rank wire.
//!
//! Every frame carries a fixed big-endian header followed by one payload
//! chunk:
//! ```text
//! [u32: sender_rank][u64: message_id][u8: tag]
//! [u32: packet_index][u32: packet_count][u32: packet_size][u32: payload_size]
//! ```
//!
//! Payloads larger than the per-tag maximum packet size are split into
//! `packet_count` chunks sharing one `message_id`; the receiver buffers
//! chunks per `(sender_rank, message_id)` and concatenates them in
//! `packet_index` order. Ordering between different messages or senders is
//! never assumed.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use pathline_core::Rank;

use crate::tag::MessageTag;
use crate::CommError;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 4 + 8 + 1 + 4 + 4 + 4 + 4;

/// Hard cap on a reassembled payload (256 MB).
pub const MAX_PAYLOAD_SIZE: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sender: Rank,
    pub message_id: u64,
    pub tag: MessageTag,
    pub packet_index: u32,
    pub packet_count: u32,
    pub packet_size: u32,
    pub payload_size: u32,
}

impl PacketHeader {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sender);
        buf.put_u64(self.message_id);
        buf.put_u8(self.tag.as_u8());
        buf.put_u32(self.packet_index);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.packet_size);
        buf.put_u32(self.payload_size);
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CommError> {
        if frame.len() < HEADER_SIZE {
            return Err(CommError::ShortPacket(frame.len()));
        }

        let sender = u32::from_be_bytes(frame[0..4].try_into().unwrap());
        let message_id = u64::from_be_bytes(frame[4..12].try_into().unwrap());
        let tag = MessageTag::from_u8(frame[12]).ok_or(CommError::InvalidTag(frame[12]))?;
        let packet_index = u32::from_be_bytes(frame[13..17].try_into().unwrap());
        let packet_count = u32::from_be_bytes(frame[17..21].try_into().unwrap());
        let packet_size = u32::from_be_bytes(frame[21..25].try_into().unwrap());
        let payload_size = u32::from_be_bytes(frame[25..29].try_into().unwrap());

        let header = Self {
            sender,
            message_id,
            tag,
            packet_index,
            packet_count,
            packet_size,
            payload_size,
        };
        header.validate(frame.len())?;
        Ok(header)
    }

    fn validate(&self, frame_len: usize) -> Result<(), CommError> {
        if self.packet_count == 0 {
            return Err(CommError::MalformedHeader("packet_count is zero".into()));
        }
        if self.packet_index >= self.packet_count {
            return Err(CommError::MalformedHeader(format!(
                "packet_index {} out of range for packet_count {}",
                self.packet_index, self.packet_count
            )));
        }
        if self.payload_size > MAX_PAYLOAD_SIZE {
            return Err(CommError::MalformedHeader(format!(
                "payload_size {} exceeds maximum {}",
                self.payload_size, MAX_PAYLOAD_SIZE
            )));
        }
        if frame_len != HEADER_SIZE + self.packet_size as usize {
            return Err(CommError::MalformedHeader(format!(
                "frame length {} does not match packet_size {}",
                frame_len, self.packet_size
            )));
        }
        if self.packet_size as u64 > self.payload_size as u64 {
            return Err(CommError::MalformedHeader(format!(
                "packet_size {} exceeds payload_size {}",
                self.packet_size, self.payload_size
            )));
        }
        Ok(())
    }
}

/// Split `payload` into frames of at most `max_packet` payload bytes each.
///
/// An empty payload still produces one frame so the receiver sees the
/// message. Chunks are zero-copy slices of `payload`.
pub fn fragment(
    sender: Rank,
    message_id: u64,
    tag: MessageTag,
    payload: Bytes,
    max_packet: usize,
) -> Result<Vec<Bytes>, CommError> {
    assert!(max_packet > 0, "max_packet must be positive");
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(CommError::MalformedHeader(format!(
            "payload of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let packet_count = payload.len().div_ceil(max_packet).max(1) as u32;
    let mut frames = Vec::with_capacity(packet_count as usize);
    for index in 0..packet_count {
        let start = index as usize * max_packet;
        let end = (start + max_packet).min(payload.len());
        let chunk = payload.slice(start..end);

        let header = PacketHeader {
            sender,
            message_id,
            tag,
            packet_index: index,
            packet_count,
            packet_size: chunk.len() as u32,
            payload_size: payload.len() as u32,
        };
        let mut frame = BytesMut::with_capacity(HEADER_SIZE + chunk.len());
        header.encode_into(&mut frame);
        frame.extend_from_slice(&chunk);
        frames.push(frame.freeze());
    }
    Ok(frames)
}

/// A payload reassembled from one or more packets.
#[derive(Debug)]
pub struct Reassembled {
    pub sender: Rank,
    pub tag: MessageTag,
    pub payload: Bytes,
}

#[derive(Debug)]
struct Partial {
    tag: MessageTag,
    packet_count: u32,
    payload_size: u32,
    received: u32,
    chunks: Vec<Option<Bytes>>,
}

/// Buffers multi-packet messages per `(sender, message_id)` until all
/// `packet_count` pieces have arrived, then concatenates them in
/// `packet_index` order and releases the buffer.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<(Rank, u64), Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame; returns the completed payload if this frame was the
    /// last missing piece.
    pub fn ingest(&mut self, frame: Bytes) -> Result<Option<Reassembled>, CommError> {
        let header = PacketHeader::decode(&frame)?;
        let chunk = frame.slice(HEADER_SIZE..);

        // Single-packet fast path: nothing to buffer.
        if header.packet_count == 1 {
            if chunk.len() != header.payload_size as usize {
                return Err(CommError::MalformedHeader(format!(
                    "single packet of {} bytes announced payload_size {}",
                    chunk.len(),
                    header.payload_size
                )));
            }
            return Ok(Some(Reassembled {
                sender: header.sender,
                tag: header.tag,
                payload: chunk,
            }));
        }

        let key = (header.sender, header.message_id);
        let partial = self.partial.entry(key).or_insert_with(|| Partial {
            tag: header.tag,
            packet_count: header.packet_count,
            payload_size: header.payload_size,
            received: 0,
            chunks: vec![None; header.packet_count as usize],
        });

        if partial.packet_count != header.packet_count
            || partial.payload_size != header.payload_size
            || partial.tag != header.tag
        {
            return Err(CommError::MalformedHeader(format!(
                "packet {} of message {} from rank {} disagrees with earlier packets",
                header.packet_index, header.message_id, header.sender
            )));
        }

        let slot = &mut partial.chunks[header.packet_index as usize];
        if slot.is_some() {
            return Err(CommError::DuplicatePacket {
                sender: header.sender,
                message_id: header.message_id,
                index: header.packet_index,
                count: header.packet_count,
            });
        }
        *slot = Some(chunk);
        partial.received += 1;

        if partial.received < partial.packet_count {
            return Ok(None);
        }

        let partial = self.partial.remove(&key).expect("partial present");
        let mut payload = BytesMut::with_capacity(partial.payload_size as usize);
        for chunk in partial.chunks {
            payload.extend_from_slice(&chunk.expect("all chunks received"));
        }
        if payload.len() != partial.payload_size as usize {
            return Err(CommError::MalformedHeader(format!(
                "reassembled {} bytes but payload_size announced {}",
                payload.len(),
                partial.payload_size
            )));
        }

        Ok(Some(Reassembled {
            sender: header.sender,
            tag: partial.tag,
            payload: payload.freeze(),
        }))
    }

    /// Number of messages still waiting for packets.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Drop all partial buffers; used at shutdown. No salvage is attempted.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload_of(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn reassemble_all(frames: Vec<Bytes>) -> Reassembled {
        let mut reassembler = Reassembler::new();
        let mut out = None;
        for frame in frames {
            if let Some(done) = reassembler.ingest(frame).unwrap() {
                assert!(out.is_none(), "message completed twice");
                out = Some(done);
            }
        }
        assert_eq!(reassembler.pending(), 0);
        out.expect("message never completed")
    }

    #[test]
    fn header_round_trip() {
        let header = PacketHeader {
            sender: 3,
            message_id: 42,
            tag: MessageTag::CurveTransfer,
            packet_index: 1,
            packet_count: 4,
            packet_size: 0,
            payload_size: 100,
        };
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(PacketHeader::decode(&buf.freeze()).unwrap(), header);
    }

    #[rstest]
    #[case::smaller_than_max(100, 1024, 1)]
    #[case::exactly_max(1024, 1024, 1)]
    #[case::one_past_max(1025, 1024, 2)]
    #[case::much_larger(10 * 1024 + 7, 1024, 11)]
    #[case::empty(0, 1024, 1)]
    fn fragmentation_round_trip(
        #[case] payload_len: usize,
        #[case] max_packet: usize,
        #[case] expect_frames: usize,
    ) {
        let payload = payload_of(payload_len);
        let frames = fragment(5, 9, MessageTag::BlockTransfer, payload.clone(), max_packet).unwrap();
        assert_eq!(frames.len(), expect_frames);

        let done = reassemble_all(frames);
        assert_eq!(done.sender, 5);
        assert_eq!(done.tag, MessageTag::BlockTransfer);
        assert_eq!(done.payload, payload);
    }

    #[test]
    fn out_of_order_packets_restore_index_order() {
        let payload = payload_of(4096);
        let mut frames = fragment(0, 1, MessageTag::Status, payload.clone(), 1000).unwrap();
        frames.reverse();

        let done = reassemble_all(frames);
        assert_eq!(done.payload, payload);
    }

    #[test]
    fn interleaved_senders_and_messages_do_not_mix() {
        let a = payload_of(3000);
        let b = payload_of(2500);
        let frames_a = fragment(1, 7, MessageTag::CurveTransfer, a.clone(), 1000).unwrap();
        let frames_b = fragment(2, 7, MessageTag::CurveTransfer, b.clone(), 1000).unwrap();

        let mut reassembler = Reassembler::new();
        let mut done = Vec::new();
        for frame in frames_a.into_iter().zip(frames_b).flat_map(|(x, y)| [x, y]) {
            if let Some(d) = reassembler.ingest(frame).unwrap() {
                done.push(d);
            }
        }
        assert_eq!(done.len(), 2);
        let by_sender = |s: Rank| done.iter().find(|d| d.sender == s).unwrap();
        assert_eq!(by_sender(1).payload, a);
        assert_eq!(by_sender(2).payload, b);
    }

    #[test]
    fn duplicate_packet_is_fatal() {
        let frames = fragment(0, 3, MessageTag::Status, payload_of(2048), 1000).unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.ingest(frames[0].clone()).unwrap();
        let err = reassembler.ingest(frames[0].clone()).unwrap_err();
        assert!(matches!(err, CommError::DuplicatePacket { index: 0, .. }));
    }

    #[test]
    fn invalid_tag_byte_rejected() {
        let mut frame = BytesMut::new();
        PacketHeader {
            sender: 0,
            message_id: 0,
            tag: MessageTag::Status,
            packet_index: 0,
            packet_count: 1,
            packet_size: 0,
            payload_size: 0,
        }
        .encode_into(&mut frame);
        frame[12] = 200; // not a known tag
        assert!(matches!(
            PacketHeader::decode(&frame.freeze()),
            Err(CommError::InvalidTag(200))
        ));
    }

    #[test]
    fn truncated_frame_rejected() {
        assert!(matches!(
            PacketHeader::decode(&[0u8; 5]),
            Err(CommError::ShortPacket(5))
        ));
    }

    #[test]
    fn frame_length_must_match_packet_size() {
        let mut frame = BytesMut::new();
        PacketHeader {
            sender: 0,
            message_id: 0,
            tag: MessageTag::Status,
            packet_index: 0,
            packet_count: 1,
            packet_size: 10, // but no payload bytes follow
            payload_size: 10,
        }
        .encode_into(&mut frame);
        assert!(matches!(
            PacketHeader::decode(&frame.freeze()),
            Err(CommError::MalformedHeader(_))
        ));
    }

    #[test]
    fn clear_drops_partials() {
        let frames = fragment(0, 3, MessageTag::Status, payload_of(2048), 1000).unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.ingest(frames[0].clone()).unwrap();
        assert_eq!(reassembler.pending(), 1);
        reassembler.clear();
        assert_eq!(reassembler.pending(), 0);
    }
}
