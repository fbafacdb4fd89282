/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Routing plans between two decompositions of the same shape.
//!
//! Redistribution moves every element from the rank owning it under a
//! source decomposition to the rank owning it under a destination
//! decomposition. The planner first intersects the two partitionings
//! axis by axis ([`common_decomposition`]), then enumerates the
//! resulting sub-blocks and emits per-rank send and receive tables
//! with unique message tags ([`build_transfer_plan`]).

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use itertools::izip;
use serde::Deserialize;
use serde::Serialize;

use crate::decomposition::CartesianIterator;
use crate::decomposition::Decomposition;
use crate::decomposition::PartitionError;
use crate::decomposition::Rank;
use crate::range::Window;
use crate::range::WindowAxis;

/// The intersection of two partitionings along one axis.
///
/// `offsets` are the merged segment boundaries (sorted union of both
/// sides' boundaries); segment `k` covers `[offsets[k], offsets[k+1])`,
/// the last extending to the axis extent. `pairs[k]` names the
/// partition containing segment `k` on each side, `None` on a side
/// not distributed along this axis. `base_a[k]`/`base_b[k]` are the
/// global begin of that containing partition (0 on a replicated
/// side), so `offsets[k] - base` is the segment's begin in the owning
/// block's local coordinates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMerge {
    pub axis: usize,
    pub offsets: Vec<usize>,
    pub pairs: Vec<(Option<usize>, Option<usize>)>,
    pub base_a: Vec<usize>,
    pub base_b: Vec<usize>,
}

impl AxisMerge {
    pub fn num_segments(&self) -> usize {
        self.offsets.len()
    }

    /// `[begin, end)` of segment `k` for an axis of the given extent.
    pub fn segment_bounds(&self, k: usize, extent: usize) -> (usize, usize) {
        let begin = self.offsets[k];
        let end = if k + 1 < self.offsets.len() {
            self.offsets[k + 1]
        } else {
            extent
        };
        (begin, end)
    }
}

/// Intersect two decompositions of the same shape.
///
/// Produces one [`AxisMerge`] per axis in the sorted union of both
/// sides' distributed axes. An axis distributed on both sides is
/// merged with a two-pointer sweep over the sorted boundaries; an
/// axis distributed on one side only keeps that side's boundaries
/// with the other side replicated (partition `None`, base 0).
pub fn common_decomposition(
    a: &Decomposition,
    b: &Decomposition,
) -> Result<Vec<AxisMerge>, PartitionError> {
    if a.shape() != b.shape() {
        return Err(PartitionError::ShapeMismatch {
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }

    let axes: BTreeSet<usize> = a
        .distaxes()
        .iter()
        .chain(b.distaxes())
        .copied()
        .collect();

    let mut merges = Vec::with_capacity(axes.len());
    for axis in axes {
        let pos_a = a.distaxes().iter().position(|&x| x == axis);
        let pos_b = b.distaxes().iter().position(|&x| x == axis);
        let extent = a.shape()[axis];

        let merge = match (pos_a, pos_b) {
            (Some(pa), Some(pb)) => merge_axis(axis, extent, &a.offsets()[pa], &b.offsets()[pb]),
            (Some(pa), None) => one_sided(axis, &a.offsets()[pa], Side::A),
            (None, Some(pb)) => one_sided(axis, &b.offsets()[pb], Side::B),
            (None, None) => unreachable!("axis from the union is distributed on neither side"),
        };
        merges.push(merge);
    }
    Ok(merges)
}

enum Side {
    A,
    B,
}

fn one_sided(axis: usize, offsets: &[usize], side: Side) -> AxisMerge {
    let n = offsets.len();
    let (pairs, base_a, base_b) = match side {
        Side::A => (
            (0..n).map(|i| (Some(i), None)).collect(),
            offsets.to_vec(),
            vec![0; n],
        ),
        Side::B => (
            (0..n).map(|i| (None, Some(i))).collect(),
            vec![0; n],
            offsets.to_vec(),
        ),
    };
    AxisMerge {
        axis,
        offsets: offsets.to_vec(),
        pairs,
        base_a,
        base_b,
    }
}

fn merge_axis(axis: usize, extent: usize, oa: &[usize], ob: &[usize]) -> AxisMerge {
    let end_of = |offsets: &[usize], i: usize| {
        if i + 1 < offsets.len() {
            offsets[i + 1]
        } else {
            extent
        }
    };

    let mut offsets = Vec::new();
    let mut pairs = Vec::new();
    let mut base_a = Vec::new();
    let mut base_b = Vec::new();

    let mut ia = 0;
    let mut ib = 0;
    let mut begin = 0;
    loop {
        offsets.push(begin);
        pairs.push((Some(ia), Some(ib)));
        base_a.push(oa[ia]);
        base_b.push(ob[ib]);

        let ea = end_of(oa, ia);
        let eb = end_of(ob, ib);
        let end = ea.min(eb);
        if end == extent {
            break;
        }
        if ea == end {
            ia += 1;
        }
        if eb == end {
            ib += 1;
        }
        begin = end;
    }

    AxisMerge {
        axis,
        offsets,
        pairs,
        base_a,
        base_b,
    }
}

/// One message of a transfer plan: the other endpoint, the window of
/// the local block holding the payload, and the message tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    pub peer: Rank,
    pub window: Window,
    pub tag: u64,
}

/// Per-rank send and receive tables for one redistribution.
///
/// Tags increase monotonically over the plan, so every (source,
/// destination, tag) triple is unique and a send matches exactly one
/// receive. A rank absent from both tables holds no data involved in
/// the transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub sends: BTreeMap<Rank, Vec<TransferEntry>>,
    pub recvs: BTreeMap<Rank, Vec<TransferEntry>>,
}

impl TransferPlan {
    /// Every rank with at least one send or receive.
    pub fn participants(&self) -> BTreeSet<Rank> {
        self.sends.keys().chain(self.recvs.keys()).copied().collect()
    }

    pub fn num_messages(&self) -> usize {
        self.sends.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.recvs.is_empty()
    }
}

/// Plan the redistribution of an array from `src` to `dst`.
///
/// Enumerates the cartesian product of merged segments across all
/// merged axes; each combination is one contiguous sub-block owned by
/// exactly one rank on each side, so it becomes one tagged message.
/// Windows on axes distributed on neither side span the whole axis.
pub fn build_transfer_plan(
    src: &Decomposition,
    dst: &Decomposition,
) -> Result<TransferPlan, PartitionError> {
    let merges = common_decomposition(src, dst)?;
    let shape = src.shape();

    let counts: Vec<usize> = merges.iter().map(AxisMerge::num_segments).collect();
    let mut plan = TransferPlan::default();
    let mut next_tag: u64 = 0;

    for combo in CartesianIterator::new(counts) {
        let mut src_parts = Vec::new();
        let mut dst_parts = Vec::new();
        let mut src_axes: Vec<WindowAxis> = shape
            .iter()
            .map(|&extent| WindowAxis::Span {
                begin: 0,
                end: extent,
                step: 1,
            })
            .collect();
        let mut dst_axes = src_axes.clone();

        for (merge, &k) in izip!(&merges, &combo) {
            let (begin, end) = merge.segment_bounds(k, shape[merge.axis]);
            let (pa, pb) = merge.pairs[k];
            if let Some(part) = pa {
                src_parts.push(part);
            }
            if let Some(part) = pb {
                dst_parts.push(part);
            }
            src_axes[merge.axis] = WindowAxis::Span {
                begin: begin - merge.base_a[k],
                end: end - merge.base_a[k],
                step: 1,
            };
            dst_axes[merge.axis] = WindowAxis::Span {
                begin: begin - merge.base_b[k],
                end: end - merge.base_b[k],
                step: 1,
            };
        }

        let src_rank = src.ranks()[src.linear_index(&src_parts)];
        let dst_rank = dst.ranks()[dst.linear_index(&dst_parts)];

        let tag = next_tag;
        next_tag += 1;
        plan.sends.entry(src_rank).or_default().push(TransferEntry {
            peer: dst_rank,
            window: Window::new(src_axes),
            tag,
        });
        plan.recvs.entry(dst_rank).or_default().push(TransferEntry {
            peer: src_rank,
            window: Window::new(dst_axes),
            tag,
        });
    }

    tracing::debug!(
        messages = plan.num_messages(),
        participants = plan.participants().len(),
        "transfer plan"
    );
    Ok(plan)
}
