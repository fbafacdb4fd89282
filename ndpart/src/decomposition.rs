/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::range::IndexExpr;
use crate::range::ResolvedIndex;
use crate::range::Window;
use crate::range::WindowAxis;
use crate::range::resolve_args;

/// Identifier of one worker process in the cluster.
pub type Rank = usize;

/// The type of error for partition and routing operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PartitionError {
    #[error("invalid dims: expected {expected}, got {got}")]
    InvalidDims { expected: usize, got: usize },

    #[error("axis {axis} out of range for {ndims}-dimensional shape")]
    AxisOutOfRange { axis: usize, ndims: usize },

    #[error("index {index} out of range for axis of extent {extent}")]
    IndexOutOfRange { index: isize, extent: usize },

    #[error("empty range: {begin}..{end} (step {step})")]
    EmptyRange {
        begin: usize,
        end: usize,
        step: usize,
    },

    #[error("step must be nonzero")]
    ZeroStep,

    #[error("invalid offsets for axis {axis}: {reason}")]
    InvalidOffsets { axis: usize, reason: String },

    #[error("rank list length {got} does not match partition count {expected}")]
    RankCountMismatch { expected: usize, got: usize },

    #[error("duplicate rank {rank} in rank list")]
    DuplicateRank { rank: Rank },

    #[error("shape mismatch: {lhs:?} vs {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("at least one distributed axis is required")]
    NoDistributedAxes,
}

/// Describes how an array's distributed axes are partitioned into
/// contiguous blocks and which worker rank owns which block.
///
/// For every distributed axis there is a strictly increasing offset
/// sequence starting at 0; partition `i` covers
/// `[offsets[i], offsets[i+1])`, the last partition extending to the
/// axis extent. The flattened rank list has one entry per combination
/// of per-axis partition indices, in row-major order with the last
/// distributed axis varying fastest.
///
/// A decomposition is immutable once constructed; slicing and
/// redistribution derive new decompositions rather than mutating
/// existing ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decomposition {
    shape: Vec<usize>,
    distaxes: Vec<usize>,
    offsets: Vec<Vec<usize>>,
    ranks: Vec<Rank>,
}

impl Decomposition {
    /// Create a decomposition from explicit per-axis offsets and a
    /// rank list, validating every structural invariant.
    pub fn new(
        shape: Vec<usize>,
        distaxes: Vec<usize>,
        offsets: Vec<Vec<usize>>,
        ranks: Vec<Rank>,
    ) -> Result<Self, PartitionError> {
        for (i, &extent) in shape.iter().enumerate() {
            if extent == 0 {
                return Err(PartitionError::InvalidOffsets {
                    axis: i,
                    reason: "axis extent must be positive".into(),
                });
            }
        }
        for (i, &axis) in distaxes.iter().enumerate() {
            if axis >= shape.len() {
                return Err(PartitionError::AxisOutOfRange {
                    axis,
                    ndims: shape.len(),
                });
            }
            if i > 0 && distaxes[i - 1] >= axis {
                return Err(PartitionError::InvalidOffsets {
                    axis,
                    reason: "distributed axes must be sorted and unique".into(),
                });
            }
        }
        if offsets.len() != distaxes.len() {
            return Err(PartitionError::InvalidDims {
                expected: distaxes.len(),
                got: offsets.len(),
            });
        }
        for (&axis, offsets_sa) in distaxes.iter().zip(&offsets) {
            if offsets_sa.first() != Some(&0) {
                return Err(PartitionError::InvalidOffsets {
                    axis,
                    reason: "first offset must be 0".into(),
                });
            }
            if !offsets_sa.windows(2).all(|w| w[0] < w[1]) {
                return Err(PartitionError::InvalidOffsets {
                    axis,
                    reason: "offsets must be strictly increasing".into(),
                });
            }
            let last = offsets_sa[offsets_sa.len() - 1];
            if last >= shape[axis] {
                return Err(PartitionError::InvalidOffsets {
                    axis,
                    reason: format!(
                        "last offset {} leaves an empty partition for extent {}",
                        last, shape[axis]
                    ),
                });
            }
        }
        let num_partitions: usize = offsets.iter().map(Vec::len).product();
        if ranks.len() != num_partitions {
            return Err(PartitionError::RankCountMismatch {
                expected: num_partitions,
                got: ranks.len(),
            });
        }
        let mut seen = ranks.clone();
        seen.sort_unstable();
        if let Some(w) = seen.windows(2).find(|w| w[0] == w[1]) {
            return Err(PartitionError::DuplicateRank { rank: w[0] });
        }

        Ok(Self {
            shape,
            distaxes,
            offsets,
            ranks,
        })
    }

    /// Compute a near-equal decomposition of `shape` along `distaxes`
    /// over `num_ranks` workers, approximating the partition grid
    /// with the best achievable surface-to-volume ratio. Ranks are
    /// `0..n` for the resulting partition count `n`.
    pub fn balanced(
        shape: Vec<usize>,
        distaxes: Vec<usize>,
        num_ranks: usize,
    ) -> Result<Self, PartitionError> {
        let n = num_ranks;
        let ranks: Vec<Rank> = (0..n).collect();
        Self::balanced_on(shape, distaxes, &ranks)
    }

    /// Like [`Decomposition::balanced`], but partitions over the
    /// given worker ranks. The rank list is truncated to the computed
    /// partition count.
    pub fn balanced_on(
        shape: Vec<usize>,
        distaxes: Vec<usize>,
        ranks: &[Rank],
    ) -> Result<Self, PartitionError> {
        if distaxes.is_empty() {
            return Err(PartitionError::NoDistributedAxes);
        }
        if ranks.is_empty() {
            return Err(PartitionError::RankCountMismatch {
                expected: 1,
                got: 0,
            });
        }
        for &axis in &distaxes {
            if axis >= shape.len() {
                return Err(PartitionError::AxisOutOfRange {
                    axis,
                    ndims: shape.len(),
                });
            }
        }

        // Hypothetical patch with the best surface-to-volume ratio.
        let volume: usize = distaxes.iter().map(|&a| shape[a]).product();
        let patch_volume = volume as f64 / ranks.len() as f64;
        let patch_edge = patch_volume.powf(1.0 / distaxes.len() as f64);

        // Assign prime factors of the rank count to axes in ascending
        // order of extent, smallest factors first; the largest axis
        // gets whatever is left over.
        let mut factors = prime_factors(ranks.len());
        let mut sorted_axes = distaxes.clone();
        sorted_axes.sort_by_key(|&a| shape[a]);

        let mut parts_per_axis = vec![1usize; shape.len()];
        for &axis in &sorted_axes[..sorted_axes.len() - 1] {
            let want = shape[axis] as f64 / patch_edge;
            while (parts_per_axis[axis] as f64) < want {
                match factors.pop_front() {
                    Some(f) => parts_per_axis[axis] *= f,
                    None => break,
                }
            }
        }
        let largest = sorted_axes[sorted_axes.len() - 1];
        parts_per_axis[largest] *= factors.iter().product::<usize>();

        // Ceil-divided local extent per axis, then recompute the
        // partition count from it; rounding can shrink the grid.
        let mut offsets = Vec::with_capacity(distaxes.len());
        for &axis in &distaxes {
            let local = shape[axis].div_ceil(parts_per_axis[axis]);
            let parts = shape[axis].div_ceil(local);
            offsets.push((0..parts).map(|i| i * local).collect::<Vec<_>>());
        }

        let num_partitions: usize = offsets.iter().map(Vec::len).product();
        if ranks.len() < num_partitions {
            return Err(PartitionError::RankCountMismatch {
                expected: num_partitions,
                got: ranks.len(),
            });
        }
        tracing::debug!(
            ?shape,
            ?distaxes,
            partitions = num_partitions,
            "balanced decomposition"
        );
        Self::new(
            shape,
            distaxes,
            offsets,
            ranks[..num_partitions].to_vec(),
        )
    }

    /// The extent of the array along each axis.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The number of array dimensions.
    pub fn num_dim(&self) -> usize {
        self.shape.len()
    }

    /// The axes along which elements are partitioned across ranks.
    pub fn distaxes(&self) -> &[usize] {
        &self.distaxes
    }

    /// Per distributed axis, the partition boundary offsets.
    pub fn offsets(&self) -> &[Vec<usize>] {
        &self.offsets
    }

    /// The flattened rank list, row-major over partition-index
    /// tuples with the last distributed axis varying fastest.
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    /// The total number of partitions.
    pub fn num_partitions(&self) -> usize {
        self.ranks.len()
    }

    /// Partition count along each distributed axis.
    pub fn parts_per_axis(&self) -> Vec<usize> {
        self.offsets.iter().map(Vec::len).collect()
    }

    /// Row-major pitch multipliers: `pitch[i]` is the product of the
    /// partition counts of all distributed axes after axis `i`.
    pub fn pitch(&self) -> Vec<usize> {
        let counts = self.parts_per_axis();
        (0..counts.len())
            .map(|i| counts[i + 1..].iter().product())
            .collect()
    }

    /// Combine per-axis partition indices into a linear index into
    /// the rank list.
    pub fn linear_index(&self, parts: &[usize]) -> usize {
        parts
            .iter()
            .zip(self.pitch())
            .map(|(&i, p)| i * p)
            .sum()
    }

    /// The position of `axis` within the distributed axis list.
    fn axis_pos(&self, axis: usize) -> Option<usize> {
        self.distaxes.iter().position(|&a| a == axis)
    }

    /// `[begin, end)` of partition `part` along the `pos`-th
    /// distributed axis.
    pub fn axis_bounds(&self, pos: usize, part: usize) -> (usize, usize) {
        let offsets_sa = &self.offsets[pos];
        let begin = offsets_sa[part];
        let end = if part + 1 < offsets_sa.len() {
            offsets_sa[part + 1]
        } else {
            self.shape[self.distaxes[pos]]
        };
        (begin, end)
    }

    /// The partition owning `index` along the `pos`-th distributed
    /// axis: rightmost offset not exceeding `index`.
    pub fn partition_of(&self, pos: usize, index: usize) -> usize {
        self.offsets[pos].partition_point(|&o| o <= index) - 1
    }

    /// Resolve a full multi-axis index to its owning rank and the
    /// index in that rank's local coordinates.
    pub fn owner_of(&self, index: &[usize]) -> Result<(Rank, Vec<usize>), PartitionError> {
        if index.len() != self.shape.len() {
            return Err(PartitionError::InvalidDims {
                expected: self.shape.len(),
                got: index.len(),
            });
        }
        for (&idx, &extent) in index.iter().zip(&self.shape) {
            if idx >= extent {
                return Err(PartitionError::IndexOutOfRange {
                    index: idx as isize,
                    extent,
                });
            }
        }
        let mut local = index.to_vec();
        let mut parts = Vec::with_capacity(self.distaxes.len());
        for (pos, &axis) in self.distaxes.iter().enumerate() {
            let part = self.partition_of(pos, index[axis]);
            local[axis] = index[axis] - self.offsets[pos][part];
            parts.push(part);
        }
        let rank = self.ranks[self.linear_index(&parts)];
        Ok((rank, local))
    }

    /// The local block shape of every partition, in rank-list order.
    pub fn partition_shapes(&self) -> Vec<Vec<usize>> {
        CartesianIterator::new(self.parts_per_axis())
            .map(|parts| {
                let mut shape = self.shape.clone();
                for (pos, &part) in parts.iter().enumerate() {
                    let (begin, end) = self.axis_bounds(pos, part);
                    shape[self.distaxes[pos]] = end - begin;
                }
                shape
            })
            .collect()
    }

    /// The global origin of every partition (0 on non-distributed
    /// axes), in rank-list order.
    pub fn partition_origins(&self) -> Vec<Vec<usize>> {
        CartesianIterator::new(self.parts_per_axis())
            .map(|parts| {
                let mut origin = vec![0; self.shape.len()];
                for (pos, &part) in parts.iter().enumerate() {
                    origin[self.distaxes[pos]] = self.offsets[pos][part];
                }
                origin
            })
            .collect()
    }

    /// Derive the decomposition of a slice of this array.
    ///
    /// Takes one [`IndexExpr`] per array axis. Integer arguments
    /// collapse their axis; on a distributed axis the owning
    /// partition is located by offset search. Span arguments keep
    /// their axis; on a distributed axis every original partition
    /// contributes the subsequence of the span falling inside its
    /// bounds, yielding a local window per surviving partition and
    /// cumulative new offsets. The new rank list gathers the
    /// surviving partition combinations through this decomposition's
    /// pitch, in the same row-major order as the new offsets.
    pub fn slice(&self, args: &[IndexExpr]) -> Result<SlicedDecomposition, PartitionError> {
        let (new_shape, resolved) = resolve_args(&self.shape, args)?;

        // Per distributed axis: surviving partition indices, local
        // windows, and (for span axes) the new offsets.
        let mut survivors_aa: Vec<Vec<usize>> = Vec::with_capacity(self.distaxes.len());
        let mut windows_aa: Vec<Vec<WindowAxis>> = Vec::with_capacity(self.distaxes.len());
        let mut new_distaxes = Vec::new();
        let mut new_offsets = Vec::new();

        for (pos, &axis) in self.distaxes.iter().enumerate() {
            match resolved[axis] {
                ResolvedIndex::At(index) => {
                    let part = self.partition_of(pos, index);
                    let local = index - self.offsets[pos][part];
                    survivors_aa.push(vec![part]);
                    windows_aa.push(vec![WindowAxis::At(local)]);
                }
                ResolvedIndex::Span { begin, end, step } => {
                    let mut survivors = Vec::new();
                    let mut windows = Vec::new();
                    let mut offsets_sa = Vec::new();
                    let mut total = 0usize;

                    // Last element of the span itself.
                    let span_last = begin + ((end - 1 - begin) / step) * step;

                    let first_part = self.partition_of(pos, begin);
                    let last_part = self.partition_of(pos, span_last);
                    for part in first_part..=last_part {
                        let (p_begin, p_end) = self.axis_bounds(pos, part);
                        let Some(first) = first_in_partition(begin, end, step, p_begin, p_end)
                        else {
                            continue;
                        };
                        // Largest span element within this partition.
                        let mut last = first + ((p_end - 1 - first) / step) * step;
                        last = last.min(span_last);

                        windows.push(WindowAxis::Span {
                            begin: first - p_begin,
                            end: last + 1 - p_begin,
                            step,
                        });
                        offsets_sa.push(total);
                        total += (last - first) / step + 1;
                        survivors.push(part);
                    }

                    // Shift the axis index by the number of collapsed
                    // axes to its left.
                    let shift = resolved[..axis]
                        .iter()
                        .filter(|r| matches!(r, ResolvedIndex::At(_)))
                        .count();
                    new_distaxes.push(axis - shift);
                    new_offsets.push(offsets_sa);
                    survivors_aa.push(survivors);
                    windows_aa.push(windows);
                }
            }
        }

        // Gather the surviving ranks through the original pitch, in
        // the row-major order of the new partition grid.
        let pitch = self.pitch();
        let counts: Vec<usize> = survivors_aa.iter().map(Vec::len).collect();
        let mut new_ranks = Vec::new();
        let mut windows = Vec::new();
        for combo in CartesianIterator::new(counts) {
            let linear: usize = combo
                .iter()
                .enumerate()
                .map(|(pos, &i)| survivors_aa[pos][i] * pitch[pos])
                .sum();
            new_ranks.push(self.ranks[linear]);

            // Full-dimensional local window for this partition:
            // distributed axes take their per-partition window,
            // everything else the resolved global argument.
            let mut axes = Vec::with_capacity(self.shape.len());
            for (axis, arg) in resolved.iter().enumerate() {
                if let Some(pos) = self.axis_pos(axis) {
                    axes.push(windows_aa[pos][combo[pos]]);
                } else {
                    axes.push(match *arg {
                        ResolvedIndex::At(index) => WindowAxis::At(index),
                        ResolvedIndex::Span { begin, end, step } => {
                            WindowAxis::Span { begin, end, step }
                        }
                    });
                }
            }
            windows.push(Window::new(axes));
        }

        let decomposition = Decomposition::new(new_shape, new_distaxes, new_offsets, new_ranks)?;
        Ok(SlicedDecomposition {
            decomposition,
            windows,
        })
    }
}

impl fmt::Display for Decomposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shape {:?}, distaxes {:?}, offsets {:?}, ranks {:?}",
            self.shape, self.distaxes, self.offsets, self.ranks
        )
    }
}

/// The result of slicing a [`Decomposition`]: the derived
/// decomposition and, aligned with its rank list, the local window
/// each surviving rank applies to its block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlicedDecomposition {
    pub decomposition: Decomposition,
    pub windows: Vec<Window>,
}

/// First element of the strided span `begin..end` that falls within
/// the partition `[p_begin, p_end)`, if any.
fn first_in_partition(
    begin: usize,
    end: usize,
    step: usize,
    p_begin: usize,
    p_end: usize,
) -> Option<usize> {
    let first = if begin >= p_begin {
        begin
    } else {
        begin + (p_begin - begin).div_ceil(step) * step
    };
    if first >= p_end || first >= end {
        None
    } else {
        Some(first)
    }
}

/// Iterates over all coordinate tuples in an N-dimensional space.
///
/// Yields each point in row-major order for the grid defined by
/// `dims`, where each coordinate lies in `[0..dims[i])`. An empty
/// `dims` yields a single empty tuple.
pub(crate) struct CartesianIterator {
    dims: Vec<usize>,
    index: usize,
}

impl CartesianIterator {
    pub(crate) fn new(dims: Vec<usize>) -> Self {
        CartesianIterator { dims, index: 0 }
    }
}

impl Iterator for CartesianIterator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.dims.iter().product::<usize>() {
            return None;
        }

        let mut result: Vec<usize> = vec![0; self.dims.len()];
        let mut rest = self.index;
        for (i, dim) in self.dims.iter().enumerate().rev() {
            result[i] = rest % dim;
            rest /= dim;
        }
        self.index += 1;
        Some(result)
    }
}

/// Prime factors of `n` in ascending order; empty for `n <= 1`.
fn prime_factors(mut n: usize) -> std::collections::VecDeque<usize> {
    let mut factors = std::collections::VecDeque::new();
    let mut f = 2;
    while f * f <= n {
        while n % f == 0 {
            factors.push_back(f);
            n /= f;
        }
        f += 1;
    }
    if n > 1 {
        factors.push_back(n);
    }
    factors
}
