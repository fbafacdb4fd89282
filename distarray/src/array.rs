/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The coordinator-side distributed array.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use itertools::izip;
use ndarray::ArrayD;
use ndarray::IxDyn;
use ndpart::Decomposition;
use ndpart::IndexExpr;
use ndpart::PartitionError;
use ndpart::Rank;
use ndpart::Window;
use ndpart::WindowAxis;
use ndpart::build_transfer_plan;
use ndpart::resolve_index;
use num_traits::Zero;

use crate::cluster::BinaryOp;
use crate::cluster::BlockHandle;
use crate::cluster::ClusterError;
use crate::cluster::ClusterView;
use crate::cluster::DType;
use crate::cluster::Element;
use crate::cluster::Operand;
use crate::cluster::WorkerCall;
use crate::cluster::WorkerReply;
use crate::worker::slice_info;

/// The type of error for distributed array operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DistArrayError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("shape mismatch: {lhs:?} vs {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("incompatible distribution: axes {lhs:?} vs {rhs:?}")]
    IncompatibleDistribution { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("array is read-only; allocation denied")]
    AllocationDenied,
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0);

/// Process-wide handle allocator. A handle name is never reused
/// within one coordinator process.
fn allocate_handle_name() -> BlockHandle {
    BlockHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

/// Ownership of one distributed allocation. Dropping the last
/// reference retires the handle on every rank holding a partition.
struct RemoteBlocks<T: Element> {
    handle: BlockHandle,
    ranks: Vec<Rank>,
    cluster: Arc<dyn ClusterView<T>>,
}

impl<T: Element> Drop for RemoteBlocks<T> {
    fn drop(&mut self) {
        tracing::trace!(handle = %self.handle, "retiring remote blocks");
        self.cluster.retire(self.handle, &self.ranks);
    }
}

/// The value assigned by [`DistributedArray::set`]: a scalar
/// broadcast over the selection, a coordinator-local block, or
/// another distributed array.
pub enum SetValue<'a, T: Element> {
    Scalar(T),
    Local(&'a ArrayD<T>),
    Dist(&'a DistributedArray<T>),
}

/// One operand of an elementwise fold. Arrays are redistributed to
/// the left side's decomposition before the operation runs; scalars
/// broadcast.
pub enum Rhs<'a, T: Element> {
    Array(&'a DistributedArray<T>),
    Scalar(T),
}

/// An n-dimensional array whose distributed axes are partitioned
/// across cluster workers.
///
/// The array owns a [`Decomposition`] describing which rank holds
/// which block and a shared handle naming the blocks in worker
/// memory. Slicing and redistribution produce new arrays with fresh
/// handles; no operation mutates another array's metadata. Clones
/// share the underlying blocks.
pub struct DistributedArray<T: Element> {
    decomposition: Decomposition,
    blocks: Arc<RemoteBlocks<T>>,
    read_only: bool,
}

impl<T: Element> Clone for DistributedArray<T> {
    fn clone(&self) -> Self {
        Self {
            decomposition: self.decomposition.clone(),
            blocks: Arc::clone(&self.blocks),
            read_only: self.read_only,
        }
    }
}

fn window_from_origin(origin: &[usize], shape: &[usize]) -> Window {
    Window::new(
        izip!(origin, shape)
            .map(|(&begin, &extent)| WindowAxis::Span {
                begin,
                end: begin + extent,
                step: 1,
            })
            .collect(),
    )
}

fn unexpected_reply(rank: Rank) -> DistArrayError {
    ClusterError::WorkerFailed {
        rank,
        reason: "unexpected reply kind".into(),
    }
    .into()
}

impl<T: Element> DistributedArray<T> {
    fn assemble(
        cluster: Arc<dyn ClusterView<T>>,
        decomposition: Decomposition,
        handle: BlockHandle,
    ) -> Self {
        let ranks = decomposition.ranks().to_vec();
        Self {
            decomposition,
            blocks: Arc::new(RemoteBlocks {
                handle,
                ranks,
                cluster,
            }),
            read_only: false,
        }
    }

    fn cluster(&self) -> &Arc<dyn ClusterView<T>> {
        &self.blocks.cluster
    }

    fn handle(&self) -> BlockHandle {
        self.blocks.handle
    }

    fn deny_write(&self) -> Result<(), DistArrayError> {
        if self.read_only {
            Err(DistArrayError::AllocationDenied)
        } else {
            Ok(())
        }
    }

    /// Allocate a zero-filled array under an explicit decomposition.
    pub async fn with_decomposition(
        cluster: Arc<dyn ClusterView<T>>,
        decomposition: Decomposition,
    ) -> Result<Self, DistArrayError> {
        let handle = allocate_handle_name();
        let calls = izip!(decomposition.ranks(), decomposition.partition_shapes())
            .map(|(&rank, shape)| (rank, vec![WorkerCall::Alloc { handle, shape }]))
            .collect();
        cluster.invoke(calls).await?;
        tracing::debug!(handle = %handle, %decomposition, "allocated");
        Ok(Self::assemble(cluster, decomposition, handle))
    }

    /// Allocate a zero-filled array auto-balanced over the cluster's
    /// worker set.
    pub async fn zeros(
        cluster: Arc<dyn ClusterView<T>>,
        shape: Vec<usize>,
        distaxes: Vec<usize>,
    ) -> Result<Self, DistArrayError> {
        let decomposition = Decomposition::balanced_on(shape, distaxes, cluster.world())?;
        Self::with_decomposition(cluster, decomposition).await
    }

    /// Scatter a coordinator-local block across the cluster,
    /// auto-balanced along `distaxes`.
    pub async fn from_local(
        cluster: Arc<dyn ClusterView<T>>,
        block: &ArrayD<T>,
        distaxes: Vec<usize>,
    ) -> Result<Self, DistArrayError> {
        let decomposition =
            Decomposition::balanced_on(block.shape().to_vec(), distaxes, cluster.world())?;
        let handle = allocate_handle_name();
        let calls = izip!(
            decomposition.ranks(),
            decomposition.partition_origins(),
            decomposition.partition_shapes()
        )
        .map(|(&rank, origin, shape)| {
            let info = slice_info(&window_from_origin(&origin, &shape));
            let part = block.slice(&info[..]).to_owned();
            (rank, vec![WorkerCall::AssignFull { handle, block: part }])
        })
        .collect();
        cluster.invoke(calls).await?;
        Ok(Self::assemble(cluster, decomposition, handle))
    }

    pub fn shape(&self) -> &[usize] {
        self.decomposition.shape()
    }

    pub fn num_dim(&self) -> usize {
        self.decomposition.num_dim()
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    pub fn decomposition(&self) -> &Decomposition {
        &self.decomposition
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Mark this reference read-only: operations that would allocate
    /// or mutate through it fail with
    /// [`DistArrayError::AllocationDenied`].
    pub fn into_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn resolve_full_index(&self, index: &[isize]) -> Result<Vec<usize>, DistArrayError> {
        if index.len() != self.num_dim() {
            return Err(PartitionError::InvalidDims {
                expected: self.num_dim(),
                got: index.len(),
            }
            .into());
        }
        index
            .iter()
            .zip(self.shape())
            .map(|(&idx, &extent)| resolve_index(idx, extent).map_err(Into::into))
            .collect()
    }

    /// Read one element. Negative indices count from the end of
    /// their axis.
    pub async fn get(&self, index: &[isize]) -> Result<T, DistArrayError> {
        let resolved = self.resolve_full_index(index)?;
        let (rank, local) = self.decomposition.owner_of(&resolved)?;
        let replies = self
            .cluster()
            .invoke(vec![(
                rank,
                vec![WorkerCall::PullAt {
                    handle: self.handle(),
                    index: local,
                }],
            )])
            .await?;
        match replies.into_iter().next().map(|(_, r)| r) {
            Some(replies) => match replies.into_iter().next() {
                Some(WorkerReply::Value(value)) => Ok(value),
                _ => Err(unexpected_reply(rank)),
            },
            None => Err(unexpected_reply(rank)),
        }
    }

    /// Write one element on its owning rank.
    pub async fn set_at(&self, index: &[isize], value: T) -> Result<(), DistArrayError> {
        self.deny_write()?;
        let resolved = self.resolve_full_index(index)?;
        let (rank, local) = self.decomposition.owner_of(&resolved)?;
        self.cluster()
            .invoke(vec![(
                rank,
                vec![WorkerCall::AssignAt {
                    handle: self.handle(),
                    index: local,
                    value,
                }],
            )])
            .await?;
        Ok(())
    }

    /// Set every element to `value`.
    pub async fn fill(&self, value: T) -> Result<(), DistArrayError> {
        self.deny_write()?;
        let calls = izip!(self.decomposition.ranks(), self.decomposition.partition_shapes())
            .map(|(&rank, shape)| {
                (
                    rank,
                    vec![WorkerCall::FillWindow {
                        handle: self.handle(),
                        window: Window::full(&shape),
                        value,
                    }],
                )
            })
            .collect();
        self.cluster().invoke(calls).await?;
        Ok(())
    }

    /// Materialize a slice as a new distributed array. The derived
    /// decomposition keeps only the contributing ranks; each of them
    /// copies one local window. No cross-rank communication.
    pub async fn slice(&self, args: &[IndexExpr]) -> Result<Self, DistArrayError> {
        let sliced = self.decomposition.slice(args)?;
        let handle = allocate_handle_name();
        let calls = izip!(sliced.decomposition.ranks(), &sliced.windows)
            .map(|(&rank, window)| {
                (
                    rank,
                    vec![WorkerCall::SliceInto {
                        src: self.handle(),
                        dst: handle,
                        window: window.clone(),
                    }],
                )
            })
            .collect();
        self.cluster().invoke(calls).await?;
        Ok(Self::assemble(
            Arc::clone(self.cluster()),
            sliced.decomposition,
            handle,
        ))
    }

    /// Assign into the selection described by `args`.
    pub async fn set(
        &self,
        args: &[IndexExpr],
        value: SetValue<'_, T>,
    ) -> Result<(), DistArrayError> {
        self.deny_write()?;
        let sliced = self.decomposition.slice(args)?;
        match value {
            SetValue::Scalar(scalar) => {
                let calls = izip!(sliced.decomposition.ranks(), &sliced.windows)
                    .map(|(&rank, window)| {
                        (
                            rank,
                            vec![WorkerCall::FillWindow {
                                handle: self.handle(),
                                window: window.clone(),
                                value: scalar,
                            }],
                        )
                    })
                    .collect();
                self.cluster().invoke(calls).await?;
            }
            SetValue::Local(block) => {
                if block.shape() != sliced.decomposition.shape() {
                    return Err(DistArrayError::ShapeMismatch {
                        lhs: sliced.decomposition.shape().to_vec(),
                        rhs: block.shape().to_vec(),
                    });
                }
                let calls = izip!(
                    sliced.decomposition.ranks(),
                    &sliced.windows,
                    sliced.decomposition.partition_origins(),
                    sliced.decomposition.partition_shapes()
                )
                .map(|(&rank, window, origin, shape)| {
                    let info = slice_info(&window_from_origin(&origin, &shape));
                    let part = block.slice(&info[..]).to_owned();
                    (
                        rank,
                        vec![WorkerCall::AssignWindow {
                            handle: self.handle(),
                            window: window.clone(),
                            block: part,
                        }],
                    )
                })
                .collect();
                self.cluster().invoke(calls).await?;
            }
            SetValue::Dist(other) => {
                if other.shape() != sliced.decomposition.shape() {
                    return Err(DistArrayError::ShapeMismatch {
                        lhs: sliced.decomposition.shape().to_vec(),
                        rhs: other.shape().to_vec(),
                    });
                }
                let aligned = other.redistribute_to(&sliced.decomposition).await?;
                let calls = izip!(
                    sliced.decomposition.ranks(),
                    &sliced.windows,
                    sliced.decomposition.partition_shapes()
                )
                .map(|(&rank, window, shape)| {
                    (
                        rank,
                        vec![WorkerCall::AssignWindowFrom {
                            dst: self.handle(),
                            dst_window: window.clone(),
                            src: aligned.handle(),
                            src_window: Window::full(&shape),
                        }],
                    )
                })
                .collect();
                self.cluster().invoke(calls).await?;
            }
        }
        Ok(())
    }

    /// Duplicate this array under the same decomposition.
    pub async fn copy(&self) -> Result<Self, DistArrayError> {
        self.deny_write()?;
        let handle = allocate_handle_name();
        let calls = self
            .decomposition
            .ranks()
            .iter()
            .map(|&rank| {
                (
                    rank,
                    vec![WorkerCall::CopyInto {
                        src: self.handle(),
                        dst: handle,
                    }],
                )
            })
            .collect();
        self.cluster().invoke(calls).await?;
        Ok(Self::assemble(
            Arc::clone(self.cluster()),
            self.decomposition.clone(),
            handle,
        ))
    }

    /// Produce this array's data arranged like `other`'s
    /// decomposition. Identical decompositions short-circuit with no
    /// transfer; otherwise a transfer plan moves every element to its
    /// new owner.
    pub async fn dist_like(&self, other: &Self) -> Result<Self, DistArrayError> {
        self.deny_write()?;
        if self.shape() != other.shape() {
            return Err(DistArrayError::ShapeMismatch {
                lhs: self.shape().to_vec(),
                rhs: other.shape().to_vec(),
            });
        }
        self.redistribute_to(&other.decomposition).await
    }

    async fn redistribute_to(&self, target: &Decomposition) -> Result<Self, DistArrayError> {
        if self.decomposition == *target {
            tracing::debug!(handle = %self.handle(), "redistribution short-circuit");
            return Ok(self.clone());
        }
        if self.shape() != target.shape() {
            return Err(DistArrayError::ShapeMismatch {
                lhs: self.shape().to_vec(),
                rhs: target.shape().to_vec(),
            });
        }
        let mine: BTreeSet<usize> = self.decomposition.distaxes().iter().copied().collect();
        let theirs: BTreeSet<usize> = target.distaxes().iter().copied().collect();
        if mine != theirs {
            return Err(DistArrayError::IncompatibleDistribution {
                lhs: self.decomposition.distaxes().to_vec(),
                rhs: target.distaxes().to_vec(),
            });
        }

        let plan = build_transfer_plan(&self.decomposition, target)?;
        let handle = allocate_handle_name();
        let mut batches: BTreeMap<Rank, Vec<WorkerCall<T>>> = BTreeMap::new();
        for (&rank, shape) in izip!(target.ranks(), target.partition_shapes()) {
            batches
                .entry(rank)
                .or_default()
                .push(WorkerCall::Alloc { handle, shape });
        }
        for rank in plan.participants() {
            let sends = plan.sends.get(&rank).cloned().unwrap_or_default();
            let recvs = plan.recvs.get(&rank).cloned().unwrap_or_default();
            batches.entry(rank).or_default().push(WorkerCall::Transfer {
                src: (!sends.is_empty()).then(|| (self.handle(), sends)),
                dst: (!recvs.is_empty()).then(|| (handle, recvs)),
            });
        }
        self.cluster()
            .invoke(batches.into_iter().collect())
            .await?;
        Ok(Self::assemble(
            Arc::clone(self.cluster()),
            target.clone(),
            handle,
        ))
    }

    /// Left-fold `op` over `self` and `operands`, elementwise, as a
    /// new array decomposed like `self`. Every array operand is
    /// redistributed to `self`'s decomposition first; the whole fold
    /// then runs in one remote invocation per rank.
    pub async fn elementwise(
        &self,
        op: BinaryOp,
        operands: &[Rhs<'_, T>],
    ) -> Result<Self, DistArrayError> {
        let handle = allocate_handle_name();
        let (_aligned, prepared) = self.prepare_operands(operands).await?;
        let calls = self
            .decomposition
            .ranks()
            .iter()
            .map(|&rank| {
                (
                    rank,
                    vec![WorkerCall::Elementwise {
                        dst: handle,
                        lhs: self.handle(),
                        op,
                        operands: prepared.clone(),
                    }],
                )
            })
            .collect();
        self.cluster().invoke(calls).await?;
        Ok(Self::assemble(
            Arc::clone(self.cluster()),
            self.decomposition.clone(),
            handle,
        ))
    }

    /// The same left fold written back into `self`.
    pub async fn elementwise_assign(
        &self,
        op: BinaryOp,
        operands: &[Rhs<'_, T>],
    ) -> Result<(), DistArrayError> {
        self.deny_write()?;
        let (_aligned, prepared) = self.prepare_operands(operands).await?;
        let calls = self
            .decomposition
            .ranks()
            .iter()
            .map(|&rank| {
                (
                    rank,
                    vec![WorkerCall::ElementwiseAssign {
                        handle: self.handle(),
                        op,
                        operands: prepared.clone(),
                    }],
                )
            })
            .collect();
        self.cluster().invoke(calls).await?;
        Ok(())
    }

    /// Align every array operand with `self`'s decomposition. The
    /// returned arrays keep the aligned blocks alive until the
    /// operation has dispatched.
    async fn prepare_operands(
        &self,
        operands: &[Rhs<'_, T>],
    ) -> Result<(Vec<Self>, Vec<Operand<T>>), DistArrayError> {
        let mut aligned = Vec::new();
        let mut prepared = Vec::with_capacity(operands.len());
        for operand in operands {
            match operand {
                Rhs::Scalar(value) => prepared.push(Operand::Scalar(*value)),
                Rhs::Array(other) => {
                    if self.shape() != other.shape() {
                        return Err(DistArrayError::ShapeMismatch {
                            lhs: self.shape().to_vec(),
                            rhs: other.shape().to_vec(),
                        });
                    }
                    let array = other.redistribute_to(&self.decomposition).await?;
                    prepared.push(Operand::Block(array.handle()));
                    aligned.push(array);
                }
            }
        }
        Ok((aligned, prepared))
    }

    /// Fold `op` over every element of the array. Each rank folds its
    /// resident block; the coordinator folds the per-rank partials in
    /// rank-list order.
    pub async fn reduce(&self, op: BinaryOp) -> Result<T, DistArrayError> {
        let calls = self
            .decomposition
            .ranks()
            .iter()
            .map(|&rank| {
                (
                    rank,
                    vec![WorkerCall::Reduce {
                        handle: self.handle(),
                        op,
                    }],
                )
            })
            .collect();
        let replies = self.cluster().invoke(calls).await?;

        let mut partials = Vec::with_capacity(replies.len());
        for (rank, rank_replies) in replies {
            match rank_replies.into_iter().next() {
                Some(WorkerReply::Value(value)) => partials.push(value),
                _ => return Err(unexpected_reply(rank)),
            }
        }
        let mut partials = partials.into_iter();
        let first = match partials.next() {
            Some(value) => value,
            None => {
                return Err(ClusterError::WorkerFailed {
                    rank: 0,
                    reason: "reduce over an array with no partitions".into(),
                }
                .into());
            }
        };
        Ok(partials.fold(first, |acc, x| op.apply(acc, x)))
    }

    /// Pull every partition to the coordinator and assemble the full
    /// array.
    pub async fn gather(&self) -> Result<ArrayD<T>, DistArrayError> {
        let calls = self
            .decomposition
            .ranks()
            .iter()
            .map(|&rank| {
                (
                    rank,
                    vec![WorkerCall::PullBlock {
                        handle: self.handle(),
                    }],
                )
            })
            .collect();
        let replies = self.cluster().invoke(calls).await?;

        let mut out = ArrayD::from_elem(IxDyn(self.shape()), T::zero());
        for ((rank, rank_replies), origin, shape) in izip!(
            replies,
            self.decomposition.partition_origins(),
            self.decomposition.partition_shapes()
        ) {
            let block = match rank_replies.into_iter().next() {
                Some(WorkerReply::Block(block)) => block,
                _ => return Err(unexpected_reply(rank)),
            };
            let info = slice_info(&window_from_origin(&origin, &shape));
            out.slice_mut(&info[..]).assign(&block);
        }
        Ok(out)
    }
}
