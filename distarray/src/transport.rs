/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Point-to-point transport between workers.
//!
//! Messages are addressed by (source rank, destination rank, tag).
//! Within one transfer plan tags are unique per rank pair, so a
//! receive matches exactly one send regardless of arrival order.

use std::collections::HashMap;

use async_trait::async_trait;
use ndpart::Rank;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::cluster::Element;

pub type Tag = u64;

/// The type of error for transport operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("channel ({src} -> {dst}, tag {tag}) closed before delivery")]
    ChannelClosed { src: Rank, dst: Rank, tag: Tag },

    #[error("channel ({src} -> {dst}, tag {tag}) already has a receiver")]
    ReceiverBusy { src: Rank, dst: Rank, tag: Tag },
}

/// Asynchronous point-to-point message passing. `send` never blocks
/// on the receiver; `recv` completes when the matching send has been
/// delivered. One receive consumes one send.
#[async_trait]
pub trait Transport<T: Element>: Send + Sync {
    async fn send(
        &self,
        src: Rank,
        dst: Rank,
        tag: Tag,
        data: Vec<T>,
    ) -> Result<(), TransportError>;

    async fn recv(&self, src: Rank, dst: Rank, tag: Tag) -> Result<Vec<T>, TransportError>;
}

struct Channel<T> {
    tx: mpsc::UnboundedSender<Vec<T>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<T>>>,
}

impl<T> Channel<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

/// In-process [`Transport`] over unbounded channels, one per
/// (source, destination, tag) triple. A channel is created lazily by
/// whichever side arrives first and removed once its message has been
/// received, so tag sequences may restart across transfers as long as
/// transfers themselves are serialized.
pub struct LocalTransport<T: Element> {
    channels: Mutex<HashMap<(Rank, Rank, Tag), Channel<T>>>,
}

impl<T: Element> LocalTransport<T> {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Element> Default for LocalTransport<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Element> Transport<T> for LocalTransport<T> {
    async fn send(
        &self,
        src: Rank,
        dst: Rank,
        tag: Tag,
        data: Vec<T>,
    ) -> Result<(), TransportError> {
        let tx = {
            let mut channels = self.channels.lock().await;
            channels
                .entry((src, dst, tag))
                .or_insert_with(Channel::new)
                .tx
                .clone()
        };
        tracing::trace!(src, dst, tag, len = data.len(), "send");
        tx.send(data)
            .map_err(|_| TransportError::ChannelClosed { src, dst, tag })
    }

    async fn recv(&self, src: Rank, dst: Rank, tag: Tag) -> Result<Vec<T>, TransportError> {
        let mut rx = {
            let mut channels = self.channels.lock().await;
            channels
                .entry((src, dst, tag))
                .or_insert_with(Channel::new)
                .rx
                .take()
                .ok_or(TransportError::ReceiverBusy { src, dst, tag })?
        };
        let data = rx
            .recv()
            .await
            .ok_or(TransportError::ChannelClosed { src, dst, tag })?;
        self.channels.lock().await.remove(&(src, dst, tag));
        tracing::trace!(src, dst, tag, len = data.len(), "recv");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_then_recv() {
        let transport = LocalTransport::<f64>::new();
        transport.send(0, 1, 0, vec![1.0, 2.0]).await.unwrap();
        let data = transport.recv(0, 1, 0).await.unwrap();
        assert_eq!(data, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_recv_before_send() {
        let transport = std::sync::Arc::new(LocalTransport::<i32>::new());
        let receiver = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.recv(2, 0, 7).await })
        };
        tokio::task::yield_now().await;
        transport.send(2, 0, 7, vec![42]).await.unwrap();
        assert_eq!(receiver.await.unwrap().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_tags_keep_messages_apart() {
        let transport = LocalTransport::<i32>::new();
        transport.send(0, 1, 0, vec![10]).await.unwrap();
        transport.send(0, 1, 1, vec![20]).await.unwrap();
        assert_eq!(transport.recv(0, 1, 1).await.unwrap(), vec![20]);
        assert_eq!(transport.recv(0, 1, 0).await.unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn test_tag_reuse_after_receipt() {
        let transport = LocalTransport::<i32>::new();
        transport.send(0, 1, 0, vec![1]).await.unwrap();
        transport.recv(0, 1, 0).await.unwrap();
        // The channel entry is gone, so the tag is free again.
        transport.send(0, 1, 0, vec![2]).await.unwrap();
        assert_eq!(transport.recv(0, 1, 0).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_self_send() {
        let transport = LocalTransport::<f64>::new();
        transport.send(3, 3, 5, vec![1.5]).await.unwrap();
        assert_eq!(transport.recv(3, 3, 5).await.unwrap(), vec![1.5]);
    }
}
