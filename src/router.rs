//! The pub/sub router (§4.4): a single-task cooperative dispatcher owning
//! the subscription tree. All tree reads/writes happen on the dispatch task;
//! everything else talks to it through bounded channels.
//!
//! Grounded on the teacher's `merge.rs` `FanInReader` (several independent
//! sources drained by one owning task) generalized from "pick the oldest
//! pending message" to "fan one message out to every matching route".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};

use crate::cluster::ClusterSink;
use crate::message::{Message, Path};
use crate::route::{CloseReason, RouteId, Subscription};
use crate::tree::SubscriptionTree;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct RouterHandle {
    subscribe_tx: mpsc::Sender<Subscription>,
    unsubscribe_tx: mpsc::Sender<RouteId>,
    incoming_tx: mpsc::Sender<Arc<Message>>,
    cluster_incoming_tx: mpsc::Sender<Arc<Message>>,
    next_route_id: Arc<AtomicU64>,
}

impl RouterHandle {
    pub fn alloc_route_id(&self) -> RouteId {
        RouteId(self.next_route_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn subscribe(&self, subscription: Subscription) {
        let _ = self.subscribe_tx.send(subscription).await;
    }

    pub async fn unsubscribe(&self, id: RouteId) {
        let _ = self.unsubscribe_tx.send(id).await;
    }

    pub async fn publish_local(&self, message: Arc<Message>) {
        let _ = self.incoming_tx.send(message).await;
    }

    pub async fn publish_cluster(&self, message: Arc<Message>) {
        let _ = self.cluster_incoming_tx.send(message).await;
    }
}

struct Registration {
    path: Path,
    closed_tx: Option<oneshot::Sender<CloseReason>>,
}

struct Dispatcher {
    tree: SubscriptionTree,
    registrations: HashMap<RouteId, Registration>,
    slow_since: HashMap<RouteId, Instant>,
    cluster: Option<Arc<dyn ClusterSink>>,
    self_node_id: u8,
    slow_consumer_deadline: Duration,
}

impl Dispatcher {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.tree
            .insert(&subscription.path, subscription.id, subscription.sender);
        self.registrations.insert(
            subscription.id,
            Registration {
                path: subscription.path,
                closed_tx: Some(subscription.closed_tx),
            },
        );
    }

    fn on_unsubscribe(&mut self, id: RouteId) {
        if let Some(registration) = self.registrations.remove(&id) {
            self.tree.remove(&registration.path, id);
        }
        self.slow_since.remove(&id);
    }

    async fn on_publish(&mut self, message: Arc<Message>, from_cluster: bool, now_secs: u64) {
        if message.is_expired(now_secs) {
            return;
        }
        if !from_cluster && message.node_id == self.self_node_id {
            if let Some(cluster) = &self.cluster {
                let frame = crate::codec::encode(&crate::codec::Frame::Message((*message).clone()));
                cluster.broadcast(frame).await;
            }
        }

        let matches = self.tree.matching(&message.path);
        let mut to_drop = Vec::new();
        for (route_id, sender) in matches {
            match sender.try_send(message.clone()) {
                Ok(()) => {
                    self.slow_since.remove(&route_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    to_drop.push((route_id, CloseReason::Unsubscribed));
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let since = *self
                        .slow_since
                        .entry(route_id)
                        .or_insert_with(Instant::now);
                    if since.elapsed() >= self.slow_consumer_deadline {
                        to_drop.push((route_id, CloseReason::SlowConsumer));
                    }
                }
            }
        }
        for (route_id, reason) in to_drop {
            self.slow_since.remove(&route_id);
            if let Some(registration) = self.registrations.remove(&route_id) {
                self.tree.remove(&registration.path, route_id);
                if let Some(closed_tx) = registration.closed_tx {
                    let _ = closed_tx.send(reason);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, registration) in self.registrations.drain() {
            if let Some(closed_tx) = registration.closed_tx {
                let _ = closed_tx.send(CloseReason::ServerShuttingDown);
            }
        }
    }
}

/// Spawns the dispatch task and returns a cloneable handle plus a shutdown
/// switch. Dropping the switch or calling `shutdown()` drains the inbound
/// queues and notifies every live route before the task exits.
pub fn spawn(
    cluster: Option<Arc<dyn ClusterSink>>,
    self_node_id: u8,
    slow_consumer_deadline: Duration,
) -> (RouterHandle, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let (subscribe_tx, mut subscribe_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (unsubscribe_tx, mut unsubscribe_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (incoming_tx, mut incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (cluster_incoming_tx, mut cluster_incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = RouterHandle {
        subscribe_tx,
        unsubscribe_tx,
        incoming_tx,
        cluster_incoming_tx,
        next_route_id: Arc::new(AtomicU64::new(1)),
    };

    let join = tokio::spawn(async move {
        let mut dispatcher = Dispatcher {
            tree: SubscriptionTree::new(),
            registrations: HashMap::new(),
            slow_since: HashMap::new(),
            cluster,
            self_node_id,
            slow_consumer_deadline,
        };

        loop {
            let now_secs = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            tokio::select! {
                Some(subscription) = subscribe_rx.recv() => {
                    dispatcher.on_subscribe(subscription);
                }
                Some(id) = unsubscribe_rx.recv() => {
                    dispatcher.on_unsubscribe(id);
                }
                Some(message) = incoming_rx.recv() => {
                    dispatcher.on_publish(message, false, now_secs).await;
                }
                Some(message) = cluster_incoming_rx.recv() => {
                    dispatcher.on_publish(message, true, now_secs).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }
        dispatcher.shutdown();
    });

    (handle, shutdown_tx, join)
}
