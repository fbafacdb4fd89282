/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Worker-side execution of [`WorkerCall`]s against resident blocks.

use std::collections::HashMap;

use futures::future::try_join_all;
use ndarray::ArrayD;
use ndarray::IxDyn;
use ndarray::SliceInfoElem;
use ndarray::Zip;
use ndpart::Rank;
use ndpart::TransferEntry;
use ndpart::Window;
use ndpart::WindowAxis;
use num_traits::Zero;

use crate::cluster::BinaryOp;
use crate::cluster::BlockHandle;
use crate::cluster::ClusterError;
use crate::cluster::Element;
use crate::cluster::Operand;
use crate::cluster::WorkerCall;
use crate::cluster::WorkerReply;
use crate::transport::Transport;

/// Convert a window into `ndarray` slicing arguments.
pub(crate) fn slice_info(window: &Window) -> Vec<SliceInfoElem> {
    window
        .axes()
        .iter()
        .map(|axis| match *axis {
            WindowAxis::At(index) => SliceInfoElem::Index(index as isize),
            WindowAxis::Span { begin, end, step } => SliceInfoElem::Slice {
                start: begin as isize,
                end: Some(end as isize),
                step: step as isize,
            },
        })
        .collect()
}

/// One rank's resident blocks and the logic evaluating calls against
/// them. All window coordinates arriving here are local to this
/// rank's blocks; the coordinator is responsible for global-to-local
/// translation.
pub(crate) struct WorkerState<T: Element> {
    rank: Rank,
    blocks: HashMap<BlockHandle, ArrayD<T>>,
}

impl<T: Element> WorkerState<T> {
    pub(crate) fn new(rank: Rank) -> Self {
        Self {
            rank,
            blocks: HashMap::new(),
        }
    }

    fn block(&self, handle: BlockHandle) -> Result<&ArrayD<T>, ClusterError> {
        self.blocks
            .get(&handle)
            .ok_or(ClusterError::NoSuchBlock(handle, self.rank))
    }

    fn block_mut(&mut self, handle: BlockHandle) -> Result<&mut ArrayD<T>, ClusterError> {
        let rank = self.rank;
        self.blocks
            .get_mut(&handle)
            .ok_or(ClusterError::NoSuchBlock(handle, rank))
    }

    pub(crate) async fn execute(
        &mut self,
        call: WorkerCall<T>,
        transport: &dyn Transport<T>,
    ) -> Result<WorkerReply<T>, ClusterError> {
        match call {
            WorkerCall::Alloc { handle, shape } => {
                self.blocks
                    .insert(handle, ArrayD::from_elem(IxDyn(&shape), T::zero()));
                Ok(WorkerReply::Unit)
            }
            WorkerCall::Free { handle } => {
                self.blocks
                    .remove(&handle)
                    .ok_or(ClusterError::NoSuchBlock(handle, self.rank))?;
                Ok(WorkerReply::Unit)
            }
            WorkerCall::AssignFull { handle, block } => {
                self.blocks.insert(handle, block);
                Ok(WorkerReply::Unit)
            }
            WorkerCall::AssignWindow {
                handle,
                window,
                block,
            } => {
                if window.shape() != block.shape() {
                    return Err(ClusterError::BlockShapeMismatch {
                        expected: window.shape(),
                        got: block.shape().to_vec(),
                    });
                }
                let info = slice_info(&window);
                self.block_mut(handle)?.slice_mut(&info[..]).assign(&block);
                Ok(WorkerReply::Unit)
            }
            WorkerCall::AssignWindowFrom {
                dst,
                dst_window,
                src,
                src_window,
            } => {
                let src_info = slice_info(&src_window);
                let staged = self.block(src)?.slice(&src_info[..]).to_owned();
                if dst_window.shape() != staged.shape() {
                    return Err(ClusterError::BlockShapeMismatch {
                        expected: dst_window.shape(),
                        got: staged.shape().to_vec(),
                    });
                }
                let dst_info = slice_info(&dst_window);
                self.block_mut(dst)?.slice_mut(&dst_info[..]).assign(&staged);
                Ok(WorkerReply::Unit)
            }
            WorkerCall::FillWindow {
                handle,
                window,
                value,
            } => {
                let info = slice_info(&window);
                self.block_mut(handle)?.slice_mut(&info[..]).fill(value);
                Ok(WorkerReply::Unit)
            }
            WorkerCall::AssignAt {
                handle,
                index,
                value,
            } => {
                let block = self.block_mut(handle)?;
                let shape = block.shape().to_vec();
                let slot = block
                    .get_mut(index.as_slice())
                    .ok_or(ClusterError::IndexOutOfBlock { index, shape })?;
                *slot = value;
                Ok(WorkerReply::Unit)
            }
            WorkerCall::SliceInto { src, dst, window } => {
                let info = slice_info(&window);
                let sliced = self.block(src)?.slice(&info[..]).to_owned();
                self.blocks.insert(dst, sliced);
                Ok(WorkerReply::Unit)
            }
            WorkerCall::CopyInto { src, dst } => {
                let copied = self.block(src)?.clone();
                self.blocks.insert(dst, copied);
                Ok(WorkerReply::Unit)
            }
            WorkerCall::Elementwise {
                dst,
                lhs,
                op,
                operands,
            } => {
                let mut out = self.block(lhs)?.clone();
                self.fold_into(&mut out, op, &operands)?;
                self.blocks.insert(dst, out);
                Ok(WorkerReply::Unit)
            }
            WorkerCall::ElementwiseAssign {
                handle,
                op,
                operands,
            } => {
                // Fold against a copy so an operand naming `handle`
                // itself reads the pre-assignment content.
                let mut out = self.block(handle)?.clone();
                self.fold_into(&mut out, op, &operands)?;
                self.blocks.insert(handle, out);
                Ok(WorkerReply::Unit)
            }
            WorkerCall::Reduce { handle, op } => {
                let block = self.block(handle)?;
                let mut elements = block.iter();
                let first = *elements.next().ok_or(ClusterError::WorkerFailed {
                    rank: self.rank,
                    reason: "reduce over an empty block".into(),
                })?;
                let partial = elements.fold(first, |acc, &x| op.apply(acc, x));
                Ok(WorkerReply::Value(partial))
            }
            WorkerCall::Transfer { src, dst } => {
                self.transfer(src, dst, transport).await?;
                Ok(WorkerReply::Unit)
            }
            WorkerCall::PullBlock { handle } => {
                Ok(WorkerReply::Block(self.block(handle)?.clone()))
            }
            WorkerCall::PullAt { handle, index } => {
                let block = self.block(handle)?;
                let value = *block.get(index.as_slice()).ok_or_else(|| {
                    ClusterError::IndexOutOfBlock {
                        index: index.clone(),
                        shape: block.shape().to_vec(),
                    }
                })?;
                Ok(WorkerReply::Value(value))
            }
        }
    }

    /// Left-fold `operands` into `acc`, elementwise. Block operands
    /// must match `acc`'s shape.
    fn fold_into(
        &self,
        acc: &mut ArrayD<T>,
        op: BinaryOp,
        operands: &[Operand<T>],
    ) -> Result<(), ClusterError> {
        for operand in operands {
            match *operand {
                Operand::Block(handle) => {
                    let block = self.block(handle)?;
                    if acc.shape() != block.shape() {
                        return Err(ClusterError::BlockShapeMismatch {
                            expected: acc.shape().to_vec(),
                            got: block.shape().to_vec(),
                        });
                    }
                    Zip::from(&mut *acc)
                        .and(block)
                        .for_each(|a, &b| *a = op.apply(*a, b));
                }
                Operand::Scalar(value) => acc.mapv_inplace(|a| op.apply(a, value)),
            }
        }
        Ok(())
    }

    /// Execute this rank's share of a transfer plan. Every send is
    /// issued before any receive is awaited; sends never block, so
    /// two ranks exchanging data cannot deadlock.
    async fn transfer(
        &mut self,
        src: Option<(BlockHandle, Vec<TransferEntry>)>,
        dst: Option<(BlockHandle, Vec<TransferEntry>)>,
        transport: &dyn Transport<T>,
    ) -> Result<(), ClusterError> {
        if let Some((handle, sends)) = src {
            let block = self.block(handle)?;
            for entry in &sends {
                let info = slice_info(&entry.window);
                let payload: Vec<T> = block.slice(&info[..]).iter().copied().collect();
                tracing::trace!(
                    rank = self.rank,
                    peer = entry.peer,
                    tag = entry.tag,
                    len = payload.len(),
                    "transfer send"
                );
                transport
                    .send(self.rank, entry.peer, entry.tag, payload)
                    .await?;
            }
        }

        if let Some((handle, recvs)) = dst {
            let pending = recvs
                .iter()
                .map(|entry| transport.recv(entry.peer, self.rank, entry.tag));
            let payloads = try_join_all(pending).await?;

            let block = self.block_mut(handle)?;
            for (entry, payload) in recvs.iter().zip(payloads) {
                let shape = entry.window.shape();
                if payload.len() != entry.window.len() {
                    return Err(ClusterError::PayloadSizeMismatch {
                        expected: entry.window.len(),
                        got: payload.len(),
                    });
                }
                let incoming = ArrayD::from_shape_vec(IxDyn(&shape), payload).map_err(|_| {
                    ClusterError::PayloadSizeMismatch {
                        expected: entry.window.len(),
                        got: 0,
                    }
                })?;
                let info = slice_info(&entry.window);
                block.slice_mut(&info[..]).assign(&incoming);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::transport::LocalTransport;

    fn window_1d(begin: usize, end: usize, step: usize) -> Window {
        Window::new(vec![WindowAxis::Span { begin, end, step }])
    }

    #[tokio::test]
    async fn test_alloc_fill_pull() {
        let transport = LocalTransport::<f64>::new();
        let mut worker = WorkerState::new(0);
        let handle = BlockHandle(0);

        worker
            .execute(
                WorkerCall::Alloc {
                    handle,
                    shape: vec![4],
                },
                &transport,
            )
            .await
            .unwrap();
        worker
            .execute(
                WorkerCall::FillWindow {
                    handle,
                    window: window_1d(1, 3, 1),
                    value: 7.0,
                },
                &transport,
            )
            .await
            .unwrap();
        let reply = worker
            .execute(WorkerCall::PullBlock { handle }, &transport)
            .await
            .unwrap();
        assert_eq!(
            reply,
            WorkerReply::Block(array![0.0, 7.0, 7.0, 0.0].into_dyn())
        );
    }

    #[tokio::test]
    async fn test_strided_slice_into() {
        let transport = LocalTransport::<i32>::new();
        let mut worker = WorkerState::new(0);
        let src = BlockHandle(0);
        let dst = BlockHandle(1);

        worker
            .execute(
                WorkerCall::AssignFull {
                    handle: src,
                    block: array![0, 1, 2, 3, 4, 5, 6].into_dyn(),
                },
                &transport,
            )
            .await
            .unwrap();
        worker
            .execute(
                WorkerCall::SliceInto {
                    src,
                    dst,
                    window: window_1d(1, 7, 2),
                },
                &transport,
            )
            .await
            .unwrap();
        let reply = worker
            .execute(WorkerCall::PullBlock { handle: dst }, &transport)
            .await
            .unwrap();
        assert_eq!(reply, WorkerReply::Block(array![1, 3, 5].into_dyn()));
    }

    #[tokio::test]
    async fn test_window_collapse() {
        // A window with an integer axis collapses that axis, so the
        // assigned block has one dimension less.
        let transport = LocalTransport::<i32>::new();
        let mut worker = WorkerState::new(0);
        let handle = BlockHandle(0);

        worker
            .execute(
                WorkerCall::AssignFull {
                    handle,
                    block: array![[1, 2, 3], [4, 5, 6]].into_dyn(),
                },
                &transport,
            )
            .await
            .unwrap();
        worker
            .execute(
                WorkerCall::AssignWindow {
                    handle,
                    window: Window::new(vec![
                        WindowAxis::At(1),
                        WindowAxis::Span {
                            begin: 0,
                            end: 3,
                            step: 2,
                        },
                    ]),
                    block: array![40, 60].into_dyn(),
                },
                &transport,
            )
            .await
            .unwrap();
        let reply = worker
            .execute(WorkerCall::PullBlock { handle }, &transport)
            .await
            .unwrap();
        assert_eq!(
            reply,
            WorkerReply::Block(array![[1, 2, 3], [40, 5, 60]].into_dyn())
        );
    }

    #[tokio::test]
    async fn test_elementwise_block_and_scalar() {
        let transport = LocalTransport::<f64>::new();
        let mut worker = WorkerState::new(0);
        let a = BlockHandle(0);
        let b = BlockHandle(1);
        let out = BlockHandle(2);

        worker
            .execute(
                WorkerCall::AssignFull {
                    handle: a,
                    block: array![1.0, 2.0, 3.0].into_dyn(),
                },
                &transport,
            )
            .await
            .unwrap();
        worker
            .execute(
                WorkerCall::AssignFull {
                    handle: b,
                    block: array![10.0, 20.0, 30.0].into_dyn(),
                },
                &transport,
            )
            .await
            .unwrap();
        // One call folds a block operand and a scalar operand.
        worker
            .execute(
                WorkerCall::Elementwise {
                    dst: out,
                    lhs: a,
                    op: BinaryOp::Add,
                    operands: vec![Operand::Block(b), Operand::Scalar(1.0)],
                },
                &transport,
            )
            .await
            .unwrap();
        worker
            .execute(
                WorkerCall::ElementwiseAssign {
                    handle: out,
                    op: BinaryOp::Mul,
                    operands: vec![Operand::Scalar(2.0)],
                },
                &transport,
            )
            .await
            .unwrap();
        let reply = worker
            .execute(WorkerCall::PullBlock { handle: out }, &transport)
            .await
            .unwrap();
        assert_eq!(
            reply,
            WorkerReply::Block(array![24.0, 46.0, 68.0].into_dyn())
        );
    }

    #[tokio::test]
    async fn test_reduce_folds_block() {
        let transport = LocalTransport::<i64>::new();
        let mut worker = WorkerState::new(0);
        let handle = BlockHandle(0);

        worker
            .execute(
                WorkerCall::AssignFull {
                    handle,
                    block: array![[3, -1, 4], [1, -5, 9]].into_dyn(),
                },
                &transport,
            )
            .await
            .unwrap();
        let sum = worker
            .execute(
                WorkerCall::Reduce {
                    handle,
                    op: BinaryOp::Add,
                },
                &transport,
            )
            .await
            .unwrap();
        assert_eq!(sum, WorkerReply::Value(11));
        let max = worker
            .execute(
                WorkerCall::Reduce {
                    handle,
                    op: BinaryOp::Max,
                },
                &transport,
            )
            .await
            .unwrap();
        assert_eq!(max, WorkerReply::Value(9));
    }

    #[tokio::test]
    async fn test_transfer_between_two_workers() {
        let transport = LocalTransport::<i32>::new();
        let mut sender = WorkerState::new(0);
        let mut receiver = WorkerState::new(1);
        let src = BlockHandle(0);
        let dst = BlockHandle(1);

        sender
            .execute(
                WorkerCall::AssignFull {
                    handle: src,
                    block: array![1, 2, 3, 4].into_dyn(),
                },
                &transport,
            )
            .await
            .unwrap();
        receiver
            .execute(
                WorkerCall::Alloc {
                    handle: dst,
                    shape: vec![2],
                },
                &transport,
            )
            .await
            .unwrap();

        // Sends are issued eagerly, so sequential execution works.
        sender
            .execute(
                WorkerCall::Transfer {
                    src: Some((
                        src,
                        vec![TransferEntry {
                            peer: 1,
                            window: window_1d(1, 3, 1),
                            tag: 0,
                        }],
                    )),
                    dst: None,
                },
                &transport,
            )
            .await
            .unwrap();
        receiver
            .execute(
                WorkerCall::Transfer {
                    src: None,
                    dst: Some((
                        dst,
                        vec![TransferEntry {
                            peer: 0,
                            window: window_1d(0, 2, 1),
                            tag: 0,
                        }],
                    )),
                },
                &transport,
            )
            .await
            .unwrap();

        let reply = receiver
            .execute(WorkerCall::PullBlock { handle: dst }, &transport)
            .await
            .unwrap();
        assert_eq!(reply, WorkerReply::Block(array![2, 3].into_dyn()));
    }

    #[tokio::test]
    async fn test_missing_block_errors() {
        let transport = LocalTransport::<f64>::new();
        let mut worker = WorkerState::new(0);
        let err = worker
            .execute(
                WorkerCall::PullBlock {
                    handle: BlockHandle(99),
                },
                &transport,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoSuchBlock(BlockHandle(99), 0)));
    }
}
