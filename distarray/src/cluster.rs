/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The typed remote invocation seam between the coordinator and the
//! worker processes.
//!
//! A [`ClusterView`] executes batches of [`WorkerCall`]s on addressed
//! ranks with barrier semantics: `invoke` returns only after every
//! addressed rank has finished its batch. Every operation the array
//! layer needs on worker memory is a call variant; workers never
//! receive code, only data.

use std::fmt;

use async_trait::async_trait;
use ndarray::ArrayD;
use ndpart::Rank;
use ndpart::TransferEntry;
use ndpart::Window;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::transport::TransportError;

/// Opaque name of one distributed allocation. The same handle refers
/// to one local block on every rank holding a partition of the array.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize
)]
pub struct BlockHandle(pub u64);

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Runtime tag of an array's element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

/// Element types a distributed array can hold.
pub trait Element:
    Copy
    + Send
    + Sync
    + fmt::Debug
    + PartialOrd
    + num_traits::NumAssign
    + Serialize
    + DeserializeOwned
    + 'static
{
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}
impl Element for f64 {
    const DTYPE: DType = DType::F64;
}
impl Element for i32 {
    const DTYPE: DType = DType::I32;
}
impl Element for i64 {
    const DTYPE: DType = DType::I64;
}

/// Binary elementwise operations evaluated on workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl BinaryOp {
    pub fn apply<T: Element>(&self, lhs: T, rhs: T) -> T {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Min => {
                if rhs < lhs {
                    rhs
                } else {
                    lhs
                }
            }
            BinaryOp::Max => {
                if rhs > lhs {
                    rhs
                } else {
                    lhs
                }
            }
        }
    }
}

/// The right-hand operand of an elementwise call: another resident
/// block or a scalar broadcast over the left side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operand<T> {
    Block(BlockHandle),
    Scalar(T),
}

/// One operation on a worker's resident blocks. All windows and
/// indices are in the worker's local block coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum WorkerCall<T: Element> {
    /// Create a zero-initialized block under `handle`.
    Alloc { handle: BlockHandle, shape: Vec<usize> },
    /// Release the block under `handle`.
    Free { handle: BlockHandle },
    /// Install `block` as the entire content of `handle`, creating it
    /// if absent.
    AssignFull { handle: BlockHandle, block: ArrayD<T> },
    /// Write `block` into a window of `handle`.
    AssignWindow {
        handle: BlockHandle,
        window: Window,
        block: ArrayD<T>,
    },
    /// Write a window-sized view of resident block `src` into a
    /// window of `dst`. Both windows must select the same shape.
    AssignWindowFrom {
        dst: BlockHandle,
        dst_window: Window,
        src: BlockHandle,
        src_window: Window,
    },
    /// Set every element of a window of `handle` to `value`.
    FillWindow {
        handle: BlockHandle,
        window: Window,
        value: T,
    },
    /// Write one element.
    AssignAt {
        handle: BlockHandle,
        index: Vec<usize>,
        value: T,
    },
    /// Materialize a window of `src` as the new block `dst`.
    SliceInto {
        src: BlockHandle,
        dst: BlockHandle,
        window: Window,
    },
    /// Duplicate `src` as the new block `dst`.
    CopyInto { src: BlockHandle, dst: BlockHandle },
    /// `dst = op(..op(op(lhs, operands[0]), operands[1])..)`,
    /// elementwise left fold; `dst` is created. Block operands must
    /// match `lhs`'s shape.
    Elementwise {
        dst: BlockHandle,
        lhs: BlockHandle,
        op: BinaryOp,
        operands: Vec<Operand<T>>,
    },
    /// The same left fold written back into `handle`.
    ElementwiseAssign {
        handle: BlockHandle,
        op: BinaryOp,
        operands: Vec<Operand<T>>,
    },
    /// Fold every element of the resident block with `op` and return
    /// the scalar.
    Reduce { handle: BlockHandle, op: BinaryOp },
    /// Execute this rank's part of a transfer plan: issue every send
    /// from `src`'s block, then wait for every receive into `dst`'s
    /// block. Either side may be absent.
    Transfer {
        src: Option<(BlockHandle, Vec<TransferEntry>)>,
        dst: Option<(BlockHandle, Vec<TransferEntry>)>,
    },
    /// Return the whole resident block.
    PullBlock { handle: BlockHandle },
    /// Return one element.
    PullAt { handle: BlockHandle, index: Vec<usize> },
}

/// A worker's answer to one [`WorkerCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum WorkerReply<T: Element> {
    Unit,
    Block(ArrayD<T>),
    Value(T),
}

/// The type of error for cluster invocation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClusterError {
    #[error("rank {0} is not part of this cluster")]
    UnknownRank(Rank),

    #[error("no block {0} resident on rank {1}")]
    NoSuchBlock(BlockHandle, Rank),

    #[error("block shape {got:?} does not match expected {expected:?}")]
    BlockShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("index {index:?} outside block of shape {shape:?}")]
    IndexOutOfBlock { index: Vec<usize>, shape: Vec<usize> },

    #[error("transfer payload of {got} elements does not fit window of {expected}")]
    PayloadSizeMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("worker {rank} failed: {reason}")]
    WorkerFailed { rank: Rank, reason: String },
}

/// Coordinator-side view of the worker processes.
///
/// `invoke` dispatches one batch of calls per addressed rank, runs the
/// batches concurrently, and returns every rank's replies once all
/// batches have completed (barrier semantics). Replies are in the
/// order of the submitted batches, one reply per call.
///
/// `retire` releases a distributed allocation without blocking; the
/// release may be deferred until the next `invoke`. It is safe to call
/// from a destructor.
#[async_trait]
pub trait ClusterView<T: Element>: Send + Sync {
    /// The ranks available for new allocations, in allocation order.
    fn world(&self) -> &[Rank];

    async fn invoke(
        &self,
        calls: Vec<(Rank, Vec<WorkerCall<T>>)>,
    ) -> Result<Vec<(Rank, Vec<WorkerReply<T>>)>, ClusterError>;

    fn retire(&self, handle: BlockHandle, ranks: &[Rank]);
}
