/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Partition algebra for distributed n-dimensional arrays.
//!
//! `ndpart` provides the coordinate-system math underneath a
//! cluster-distributed array: which contiguous block of which axes
//! each worker rank owns ([`Decomposition`]), how a slicing
//! expression maps onto those blocks ([`IndexExpr`], [`Window`],
//! [`SlicedDecomposition`]), and which messages move an array from
//! one decomposition to another ([`common_decomposition`],
//! [`build_transfer_plan`]).
//!
//! Everything here is pure metadata: no element data is touched, no
//! I/O is performed. The companion `distarray` crate executes these
//! plans against actual worker-resident blocks.

pub mod decomposition;
pub mod range;
pub mod routing;

pub use crate::decomposition::Decomposition;
pub use crate::decomposition::PartitionError;
pub use crate::decomposition::Rank;
pub use crate::decomposition::SlicedDecomposition;
pub use crate::range::IndexExpr;
pub use crate::range::Range;
pub use crate::range::ResolvedIndex;
pub use crate::range::Window;
pub use crate::range::WindowAxis;
pub use crate::range::resolve_args;
pub use crate::range::resolve_index;
pub use crate::routing::AxisMerge;
pub use crate::routing::TransferEntry;
pub use crate::routing::TransferPlan;
pub use crate::routing::build_transfer_plan;
pub use crate::routing::common_decomposition;
