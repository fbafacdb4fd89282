/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An in-process [`ClusterView`] hosting every worker in the
//! coordinator's process, used by tests and as the reference backend.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use ndpart::Rank;
use tokio::sync::Mutex;

use crate::cluster::BlockHandle;
use crate::cluster::ClusterError;
use crate::cluster::ClusterView;
use crate::cluster::Element;
use crate::cluster::WorkerCall;
use crate::cluster::WorkerReply;
use crate::transport::LocalTransport;
use crate::worker::WorkerState;

/// Hosts N workers over a shared in-process transport. Each worker's
/// state sits behind its own async mutex; one `invoke` locks only the
/// addressed workers and runs their batches concurrently, which is
/// what lets both sides of a transfer make progress.
///
/// Handles retired via [`ClusterView::retire`] are queued and freed
/// at the start of the next `invoke`.
pub struct LocalCluster<T: Element> {
    world: Vec<Rank>,
    workers: HashMap<Rank, Arc<Mutex<WorkerState<T>>>>,
    transport: Arc<LocalTransport<T>>,
    graveyard: std::sync::Mutex<Vec<(BlockHandle, Vec<Rank>)>>,
}

impl<T: Element> LocalCluster<T> {
    pub fn new(num_workers: usize) -> Self {
        let world: Vec<Rank> = (0..num_workers).collect();
        let workers = world
            .iter()
            .map(|&rank| (rank, Arc::new(Mutex::new(WorkerState::new(rank)))))
            .collect();
        Self {
            world,
            workers,
            transport: Arc::new(LocalTransport::new()),
            graveyard: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn drain_graveyard(&self) -> Vec<(Rank, Vec<WorkerCall<T>>)> {
        let retired = match self.graveyard.lock() {
            Ok(mut graveyard) => std::mem::take(&mut *graveyard),
            Err(_) => Vec::new(),
        };
        let mut by_rank: BTreeMap<Rank, Vec<WorkerCall<T>>> = BTreeMap::new();
        for (handle, ranks) in retired {
            for rank in ranks {
                by_rank
                    .entry(rank)
                    .or_default()
                    .push(WorkerCall::Free { handle });
            }
        }
        by_rank.into_iter().collect()
    }

    async fn run(
        &self,
        calls: Vec<(Rank, Vec<WorkerCall<T>>)>,
    ) -> Result<Vec<(Rank, Vec<WorkerReply<T>>)>, ClusterError> {
        let mut tasks = Vec::with_capacity(calls.len());
        for (rank, batch) in calls {
            let worker = self
                .workers
                .get(&rank)
                .ok_or(ClusterError::UnknownRank(rank))?
                .clone();
            let transport = Arc::clone(&self.transport);
            tasks.push(async move {
                let mut state = worker.lock().await;
                let mut replies = Vec::with_capacity(batch.len());
                for call in batch {
                    replies.push(state.execute(call, transport.as_ref()).await?);
                }
                Ok::<_, ClusterError>((rank, replies))
            });
        }
        try_join_all(tasks).await
    }
}

#[async_trait]
impl<T: Element> ClusterView<T> for LocalCluster<T> {
    fn world(&self) -> &[Rank] {
        &self.world
    }

    async fn invoke(
        &self,
        calls: Vec<(Rank, Vec<WorkerCall<T>>)>,
    ) -> Result<Vec<(Rank, Vec<WorkerReply<T>>)>, ClusterError> {
        let retired = self.drain_graveyard();
        if !retired.is_empty() {
            tracing::debug!(batches = retired.len(), "reaping retired handles");
            self.run(retired).await?;
        }
        self.run(calls).await
    }

    fn retire(&self, handle: BlockHandle, ranks: &[Rank]) {
        if let Ok(mut graveyard) = self.graveyard.lock() {
            graveyard.push((handle, ranks.to_vec()));
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[tokio::test]
    async fn test_invoke_runs_batches_on_addressed_ranks() {
        let cluster = LocalCluster::<f64>::new(3);
        let handle = BlockHandle(0);
        let replies = cluster
            .invoke(vec![
                (
                    0,
                    vec![
                        WorkerCall::AssignFull {
                            handle,
                            block: array![1.0, 2.0].into_dyn(),
                        },
                        WorkerCall::PullBlock { handle },
                    ],
                ),
                (
                    2,
                    vec![WorkerCall::Alloc {
                        handle,
                        shape: vec![2],
                    }],
                ),
            ])
            .await
            .unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0, 0);
        assert_eq!(
            replies[0].1[1],
            WorkerReply::Block(array![1.0, 2.0].into_dyn())
        );
        assert_eq!(replies[1], (2, vec![WorkerReply::Unit]));
    }

    #[tokio::test]
    async fn test_unknown_rank_is_rejected() {
        let cluster = LocalCluster::<f64>::new(2);
        let err = cluster
            .invoke(vec![(5, vec![WorkerCall::Free {
                handle: BlockHandle(0),
            }])])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::UnknownRank(5)));
    }

    #[tokio::test]
    async fn test_retired_handles_are_reaped_on_next_invoke() {
        let cluster = LocalCluster::<i32>::new(1);
        let handle = BlockHandle(7);
        cluster
            .invoke(vec![(0, vec![WorkerCall::Alloc {
                handle,
                shape: vec![4],
            }])])
            .await
            .unwrap();

        cluster.retire(handle, &[0]);

        // The reap runs before this batch, so the pull must fail.
        let err = cluster
            .invoke(vec![(0, vec![WorkerCall::PullBlock { handle }])])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoSuchBlock(BlockHandle(7), 0)));
    }
}
