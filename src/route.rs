//! The subscriber / route pump (§4.5): one task per live subscription,
//! replaying history then draining live traffic onto the client's outbound
//! channel. The pump is the sole writer to that channel (§3).

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::codec::{self, Frame};
use crate::error::Error;
use crate::kv::KvStore;
use crate::message::{Message, Path};
use crate::partition::{Partition, StartPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unsubscribed,
    SlowConsumer,
    ServerShuttingDown,
}

/// What the router needs to register a new route in the subscription tree.
pub struct Subscription {
    pub id: RouteId,
    pub path: Path,
    pub sender: mpsc::Sender<Arc<Message>>,
    pub closed_tx: oneshot::Sender<CloseReason>,
}

/// Drives one route from creation to close: optional replay, then live
/// fanout, forwarding raw encoded frames onto `out_tx`.
pub struct RoutePump {
    pub path: Path,
    pub user_id: String,
    pub application_id: String,
    pub partition: Option<Arc<Partition>>,
    pub start: Option<StartPoint>,
    pub live_rx: mpsc::Receiver<Arc<Message>>,
    pub closed_rx: oneshot::Receiver<CloseReason>,
    pub out_tx: mpsc::Sender<Vec<u8>>,
    pub kv: Option<Arc<dyn KvStore>>,
}

impl RoutePump {
    pub async fn run(mut self) {
        if let (Some(partition), Some(start)) = (self.partition.clone(), self.start) {
            if !self.replay(partition, start).await {
                return;
            }
        }
        self.live().await;
    }

    /// Returns `false` if the route was closed during replay (caller should
    /// not proceed to the live phase).
    async fn replay(&mut self, partition: Arc<Partition>, start: StartPoint) -> bool {
        let (tx, mut rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(partition.fetch(start, usize::MAX, tx, cancel_rx));

        loop {
            tokio::select! {
                item = rx.recv() => {
                    match item {
                        Some(Ok((id, bytes))) => {
                            if self.out_tx.send(bytes).await.is_err() {
                                return false;
                            }
                            self.persist_offset(id);
                        }
                        Some(Err(err)) => {
                            log::warn!("replay fetch failed for {}: {err}", self.path);
                            return true;
                        }
                        None => return true,
                    }
                }
                reason = &mut self.closed_rx => {
                    let reason = reason.unwrap_or(CloseReason::Unsubscribed);
                    let _ = cancel_tx.send(());
                    self.notify_close(reason).await;
                    return false;
                }
            }
        }
    }

    async fn live(mut self) {
        loop {
            tokio::select! {
                message = self.live_rx.recv() => {
                    match message {
                        Some(message) => {
                            let bytes = codec::encode(&Frame::Message((*message).clone()));
                            if self.out_tx.send(bytes).await.is_err() {
                                return;
                            }
                            self.persist_offset(message.id);
                        }
                        None => return,
                    }
                }
                reason = &mut self.closed_rx => {
                    let reason = reason.unwrap_or(CloseReason::Unsubscribed);
                    self.notify_close(reason).await;
                    return;
                }
            }
        }
    }

    async fn notify_close(&self, reason: CloseReason) {
        if reason == CloseReason::SlowConsumer {
            let err = Error::SlowConsumer(self.path.to_string());
            let frame = codec::error_frame(&err, Some(&self.path));
            let _ = self.out_tx.send(codec::encode(&frame)).await;
        }
    }

    fn persist_offset(&self, id: u64) {
        let Some(kv) = self.kv.clone() else { return };
        let key = format!(
            "subscription/{}/{}/{}",
            self.user_id, self.application_id, self.path
        );
        tokio::spawn(async move {
            if let Err(err) = kv.put(&key, id.to_string().into_bytes()).await {
                log::warn!("failed to persist subscription offset {key}: {err}");
            }
        });
    }
}
