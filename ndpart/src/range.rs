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

use crate::PartitionError;

/// A range of indices along one axis, with a stride. Ranges are
/// convertible from native Rust ranges.
///
/// `Range(begin, None, step)` extends to the end of the axis;
/// `Range(begin, Some(end), step)` is half-open. The end is clamped
/// to the axis extent on resolution, mirroring the usual slice
/// normalization rules.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord
)]
pub struct Range(pub usize, pub Option<usize>, pub usize);

impl Range {
    /// Resolve against an axis of the given extent, producing an
    /// explicit `(begin, end, step)` with `end` clamped to `extent`.
    pub fn resolve(&self, extent: usize) -> (usize, usize, usize) {
        match self {
            Range(begin, Some(end), step) => (*begin, std::cmp::min(extent, *end), *step),
            Range(begin, None, step) => (*begin, extent, *step),
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Range(begin, None, step) => write!(f, "{}::{}", begin, step),
            Range(begin, Some(end), step) => write!(f, "{}:{}:{}", begin, end, step),
        }
    }
}

impl From<std::ops::Range<usize>> for Range {
    fn from(r: std::ops::Range<usize>) -> Self {
        Self(r.start, Some(r.end), 1)
    }
}

impl From<std::ops::RangeInclusive<usize>> for Range {
    fn from(r: std::ops::RangeInclusive<usize>) -> Self {
        Self(*r.start(), Some(*r.end() + 1), 1)
    }
}

impl From<std::ops::RangeFrom<usize>> for Range {
    fn from(r: std::ops::RangeFrom<usize>) -> Self {
        Self(r.start, None, 1)
    }
}

impl From<std::ops::RangeFull> for Range {
    fn from(_: std::ops::RangeFull) -> Self {
        Self(0, None, 1)
    }
}

/// One slicing argument per array axis: either a single index
/// (collapsing the axis) or a strided span. Integer indices may be
/// negative, counting from the end of the axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexExpr {
    /// A single index; the axis vanishes from the result.
    At(isize),
    /// A strided span; the axis survives with a new extent.
    Span(Range),
}

impl IndexExpr {
    /// The full span of an axis.
    pub fn all() -> Self {
        IndexExpr::Span(Range(0, None, 1))
    }
}

impl From<isize> for IndexExpr {
    fn from(idx: isize) -> Self {
        IndexExpr::At(idx)
    }
}

impl From<Range> for IndexExpr {
    fn from(r: Range) -> Self {
        IndexExpr::Span(r)
    }
}

impl From<std::ops::Range<usize>> for IndexExpr {
    fn from(r: std::ops::Range<usize>) -> Self {
        IndexExpr::Span(r.into())
    }
}

impl From<std::ops::RangeFrom<usize>> for IndexExpr {
    fn from(r: std::ops::RangeFrom<usize>) -> Self {
        IndexExpr::Span(r.into())
    }
}

impl From<std::ops::RangeFull> for IndexExpr {
    fn from(r: std::ops::RangeFull) -> Self {
        IndexExpr::Span(r.into())
    }
}

/// A slicing argument normalized against a concrete axis extent:
/// indices wrapped and bounds-checked, spans clamped and guaranteed
/// nonempty with `step >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolvedIndex {
    At(usize),
    Span { begin: usize, end: usize, step: usize },
}

impl ResolvedIndex {
    /// The number of elements the argument selects along its axis.
    /// `None` for a collapsed axis.
    pub fn extent(&self) -> Option<usize> {
        match self {
            ResolvedIndex::At(_) => None,
            ResolvedIndex::Span { begin, end, step } => Some((end - begin).div_ceil(*step)),
        }
    }
}

/// Wrap a possibly negative index against an axis extent.
pub fn resolve_index(index: isize, extent: usize) -> Result<usize, PartitionError> {
    let wrapped = if index < 0 {
        index + extent as isize
    } else {
        index
    };
    if wrapped < 0 || wrapped as usize >= extent {
        return Err(PartitionError::IndexOutOfRange { index, extent });
    }
    Ok(wrapped as usize)
}

/// Normalize one slicing argument per axis against a shape, returning
/// the shape of the selection (collapsed axes removed) and the
/// per-axis resolved arguments.
pub fn resolve_args(
    shape: &[usize],
    args: &[IndexExpr],
) -> Result<(Vec<usize>, Vec<ResolvedIndex>), PartitionError> {
    if args.len() != shape.len() {
        return Err(PartitionError::InvalidDims {
            expected: shape.len(),
            got: args.len(),
        });
    }

    let mut new_shape = Vec::new();
    let mut resolved = Vec::with_capacity(args.len());
    for (&extent, arg) in shape.iter().zip(args) {
        match arg {
            IndexExpr::At(idx) => {
                resolved.push(ResolvedIndex::At(resolve_index(*idx, extent)?));
            }
            IndexExpr::Span(range) => {
                let (begin, end, step) = range.resolve(extent);
                if step == 0 {
                    return Err(PartitionError::ZeroStep);
                }
                if begin >= end {
                    return Err(PartitionError::EmptyRange { begin, end, step });
                }
                new_shape.push((end - begin).div_ceil(step));
                resolved.push(ResolvedIndex::Span { begin, end, step });
            }
        }
    }
    Ok((new_shape, resolved))
}

/// One axis of a local window applied on an owning worker: either a
/// collapsing index or a strided span, both in the worker's local
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowAxis {
    At(usize),
    Span { begin: usize, end: usize, step: usize },
}

impl WindowAxis {
    pub fn extent(&self) -> Option<usize> {
        match self {
            WindowAxis::At(_) => None,
            WindowAxis::Span { begin, end, step } => Some((end - begin).div_ceil(*step)),
        }
    }
}

/// A rectangular window into one worker's local block, one
/// [`WindowAxis`] per local axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    axes: Vec<WindowAxis>,
}

impl Window {
    pub fn new(axes: Vec<WindowAxis>) -> Self {
        Self { axes }
    }

    /// The full window over a block of the given shape.
    pub fn full(shape: &[usize]) -> Self {
        Self {
            axes: shape
                .iter()
                .map(|&extent| WindowAxis::Span {
                    begin: 0,
                    end: extent,
                    step: 1,
                })
                .collect(),
        }
    }

    pub fn axes(&self) -> &[WindowAxis] {
        &self.axes
    }

    pub fn num_dim(&self) -> usize {
        self.axes.len()
    }

    /// The shape of the selection, collapsed axes removed.
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().filter_map(|axis| axis.extent()).collect()
    }

    /// The number of elements the window covers.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, axis) in self.axes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match axis {
                WindowAxis::At(idx) => write!(f, "{}", idx)?,
                WindowAxis::Span { begin, end, step } => write!(f, "{}:{}:{}", begin, end, step)?,
            }
        }
        write!(f, "]")
    }
}
