// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

/// Message tag families. Tags partition the traffic between ranks; no
/// ordering is assumed across tags or across senders.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    /// Worker status reports, scheduler directives, and the control-plane
    /// collectives (barrier, reduce shares).
    Status = 0,
    /// Bundles of serialized curves changing ownership.
    CurveTransfer = 1,
    /// Bulk block data.
    BlockTransfer = 2,
    /// Announces the size of a following bulk block payload so the receiver
    /// can post a one-shot receive of the right size.
    BlockPreamble = 3,
}

impl MessageTag {
    pub const ALL: [MessageTag; 4] = [
        MessageTag::Status,
        MessageTag::CurveTransfer,
        MessageTag::BlockTransfer,
        MessageTag::BlockPreamble,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageTag::Status),
            1 => Some(MessageTag::CurveTransfer),
            2 => Some(MessageTag::BlockTransfer),
            3 => Some(MessageTag::BlockPreamble),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
