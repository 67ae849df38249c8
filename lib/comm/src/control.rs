// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Pathline Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane messages and the two collectives built on them.
//!
//! Everything here rides the `Status` tag. The collectives are rooted at
//! rank 0 (gather, combine, broadcast) and are the deliberately blocking
//! spots in the system: the startup barrier and the per-window fragment
//! agreement used by reassembly. All ranks must invoke collectives in the
//! same order; a frame from a different collective is a protocol violation
//! and aborts the run.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use pathline_core::Rank;

use crate::layer::CommLayer;
use crate::CommError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ControlMessage {
    /// Application body: status report or directive, opaque at this layer.
    Status(Bytes),
    BarrierArrive(Rank),
    BarrierRelease,
    ReduceShare(Bytes),
    ReduceResult(Bytes),
}

impl ControlMessage {
    fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Status(_) => "status",
            ControlMessage::BarrierArrive(_) => "barrier-arrive",
            ControlMessage::BarrierRelease => "barrier-release",
            ControlMessage::ReduceShare(_) => "reduce-share",
            ControlMessage::ReduceResult(_) => "reduce-result",
        }
    }
}

/// Per-curve-id share contributed to the reassembly agreement window:
/// the rank claiming final ownership (-1 when no claim) and the number of
/// fragments held locally. Combined element-wise as (max, sum).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdShare {
    pub owner: i64,
    pub fragments: u32,
}

impl IdShare {
    pub fn combine(self, other: IdShare) -> IdShare {
        IdShare {
            owner: self.owner.max(other.owner),
            fragments: self.fragments + other.fragments,
        }
    }
}

impl CommLayer {
    /// Block until every rank has arrived. Used once at scheduler start so
    /// no decision is made before all peers have reported.
    pub async fn barrier(&self) -> Result<(), CommError> {
        let world = self.world_size();
        if world <= 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            let mut arrived = 0;
            while arrived < world - 1 {
                match self.next_collective().await? {
                    ControlMessage::BarrierArrive(_) => arrived += 1,
                    other => {
                        return Err(CommError::CollectiveMismatch(format!(
                            "expected barrier-arrive, got {}",
                            other.kind()
                        )));
                    }
                }
            }
            for dst in 1..world {
                self.send_control(dst, ControlMessage::BarrierRelease)?;
            }
            Ok(())
        } else {
            self.send_control(0, ControlMessage::BarrierArrive(self.rank()))?;
            match self.next_collective().await? {
                ControlMessage::BarrierRelease => Ok(()),
                other => Err(CommError::CollectiveMismatch(format!(
                    "expected barrier-release, got {}",
                    other.kind()
                ))),
            }
        }
    }

    /// Rooted all-reduce: rank 0 gathers every rank's value, folds with
    /// `combine`, and broadcasts the result. Blocks until complete.
    pub async fn allreduce<T, F>(&self, local: T, combine: F) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(T, T) -> T,
    {
        let world = self.world_size();
        if world <= 1 {
            return Ok(local);
        }

        if self.rank() == 0 {
            let mut acc = local;
            let mut received = 0;
            while received < world - 1 {
                match self.next_collective().await? {
                    ControlMessage::ReduceShare(bytes) => {
                        acc = combine(acc, decode(&bytes)?);
                        received += 1;
                    }
                    other => {
                        return Err(CommError::CollectiveMismatch(format!(
                            "expected reduce-share, got {}",
                            other.kind()
                        )));
                    }
                }
            }
            let result = encode(&acc)?;
            for dst in 1..world {
                self.send_control(dst, ControlMessage::ReduceResult(result.clone()))?;
            }
            Ok(acc)
        } else {
            self.send_control(0, ControlMessage::ReduceShare(encode(&local)?))?;
            match self.next_collective().await? {
                ControlMessage::ReduceResult(bytes) => decode(&bytes),
                other => Err(CommError::CollectiveMismatch(format!(
                    "expected reduce-result, got {}",
                    other.kind()
                ))),
            }
        }
    }

    /// Global sums of a few counters; the convergence check for the
    /// static-domain drive loop.
    pub async fn allreduce_sum(&self, values: [u64; 3]) -> Result<[u64; 3], CommError> {
        self.allreduce(values, |a, b| {
            [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
        })
        .await
    }

    /// Element-wise (max owner, sum fragments) agreement over one window of
    /// curve ids. Every rank learns, per id, where fragments must be sent
    /// and how many to expect, before any transfer begins.
    pub async fn allreduce_shares(&self, local: Vec<IdShare>) -> Result<Vec<IdShare>, CommError> {
        let len = local.len();
        let combined = self
            .allreduce(local, |a, b| {
                debug_assert_eq!(a.len(), b.len());
                a.into_iter().zip(b).map(|(x, y)| x.combine(y)).collect()
            })
            .await?;
        if combined.len() != len {
            return Err(CommError::CollectiveMismatch(format!(
                "share window length changed from {} to {} during reduce",
                len,
                combined.len()
            )));
        }
        Ok(combined)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, CommError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map(Bytes::from)
        .map_err(|e| CommError::Decode(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CommError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| CommError::Decode(e.to_string()))
}
