/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cluster-distributed n-dimensional arrays.
//!
//! A [`DistributedArray`] splits selected axes of a dense array into
//! contiguous blocks, one per worker rank, as described by an
//! [`ndpart::Decomposition`]. The coordinator drives workers through
//! the typed [`ClusterView`] seam; data moves between workers over a
//! [`Transport`] according to plans computed by `ndpart`'s routing
//! planner. [`LocalCluster`] hosts all workers in-process and serves
//! as the reference backend.
//!
//! ```ignore
//! let cluster = Arc::new(LocalCluster::<f64>::new(4));
//! let a = DistributedArray::zeros(cluster.clone(), vec![16, 7], vec![1]).await?;
//! a.fill(1.0).await?;
//! let b = a.slice(&[IndexExpr::all(), IndexExpr::Span(Range(2, Some(6), 2))]).await?;
//! let local = b.gather().await?;
//! ```

pub mod array;
pub mod cluster;
pub mod local;
pub mod transport;
mod worker;

pub use crate::array::DistArrayError;
pub use crate::array::DistributedArray;
pub use crate::array::Rhs;
pub use crate::array::SetValue;
pub use crate::cluster::BinaryOp;
pub use crate::cluster::BlockHandle;
pub use crate::cluster::ClusterError;
pub use crate::cluster::ClusterView;
pub use crate::cluster::DType;
pub use crate::cluster::Element;
pub use crate::cluster::Operand;
pub use crate::cluster::WorkerCall;
pub use crate::cluster::WorkerReply;
pub use crate::local::LocalCluster;
pub use crate::transport::LocalTransport;
pub use crate::transport::Tag;
pub use crate::transport::Transport;
pub use crate::transport::TransportError;
