//! Per-connection protocol state machine (§4.6): parses `+`/`-`/`send`/`status`
//! commands from one WebSocket client, manages its active routes, and pumps
//! frames back out.
//!
//! The distilled spec calls for three tasks per connection (reader,
//! router-interface, writer); this collapses reader and router-interface into
//! one task since the reader is the only place that mutates the connection's
//! route set, and running both reader and writer in the background leaves the
//! rest of the protocol logic free of locking entirely (§4.6 additions).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::codec::{self, Frame};
use crate::command::{self, Command};
use crate::error::{Error, Result};
use crate::kv::{self, KvStore};
use crate::message::{Filters, Message, Path};
use crate::partition::{MessageStore, StartPoint};
use crate::route::{RoutePump, Subscription};
use crate::router::RouterHandle;

/// Collaborators shared by every connection on this server.
pub struct ConnectionContext {
    pub router: RouterHandle,
    pub store: Arc<MessageStore>,
    pub kv: Option<Arc<dyn KvStore>>,
    pub queue_depth: usize,
    pub idle_read_timeout: Duration,
    pub node_id: u8,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct ActiveRoute {
    route_id: crate::route::RouteId,
    pump: JoinHandle<()>,
}

/// Drives one accepted client from its `#connected` greeting to close.
pub async fn handle_connection(ws: WebSocketStream<TcpStream>, user_id: String, ctx: Arc<ConnectionContext>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(ctx.queue_depth);

    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if ws_tx.send(WsMessage::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let connected = serde_json::json!({
        "ApplicationId": "",
        "UserId": user_id,
        "Time": now_secs(),
    });
    let greeting = Frame::Status {
        name: "connected".to_string(),
        text: String::new(),
        data: Some(connected),
    };
    if out_tx.send(codec::encode(&greeting)).await.is_err() {
        let _ = writer.await;
        return;
    }

    let mut routes: HashMap<Path, ActiveRoute> = HashMap::new();

    loop {
        let next = tokio::time::timeout(ctx.idle_read_timeout, ws_rx.next()).await;
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => {
                log::debug!("connection error user={user_id}: {err}");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                log::debug!("idle read timeout user={user_id}");
                break;
            }
        };

        let raw: &[u8] = match &message {
            WsMessage::Text(text) => text.as_bytes(),
            WsMessage::Binary(bytes) => bytes,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let result = match command::parse(raw) {
            Ok(command) => dispatch(command, &user_id, &ctx, &out_tx, &mut routes).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            let frame = codec::error_frame(&err, None);
            if out_tx.send(codec::encode(&frame)).await.is_err() {
                break;
            }
        }
    }

    for (_, route) in routes.drain() {
        ctx.router.unsubscribe(route.route_id).await;
        let _ = route.pump.await;
    }
    drop(out_tx);
    let _ = writer.await;
}

async fn dispatch(
    command: Command,
    user_id: &str,
    ctx: &Arc<ConnectionContext>,
    out_tx: &mpsc::Sender<Vec<u8>>,
    routes: &mut HashMap<Path, ActiveRoute>,
) -> Result<()> {
    match command {
        Command::Subscribe { path, start } => {
            let resolved = resolve_start(&path, start, user_id, ctx).await;
            let (route_id, pump) = create_route(path.clone(), resolved, user_id, ctx, out_tx.clone()).await?;
            if let Some(previous) = routes.insert(path.clone(), ActiveRoute { route_id, pump }) {
                ctx.router.unsubscribe(previous.route_id).await;
                previous.pump.abort();
            }
            emit(out_tx, "subscribed-to", path.to_string()).await;
            Ok(())
        }
        Command::Unsubscribe { path } => {
            if let Some(route) = routes.remove(&path) {
                ctx.router.unsubscribe(route.route_id).await;
                let _ = route.pump.await;
            }
            emit(out_tx, "canceled", path.to_string()).await;
            Ok(())
        }
        Command::Send { path, header, body } => {
            let id = handle_send(path, header, body, user_id, ctx).await?;
            emit(out_tx, "send", id.to_string()).await;
            Ok(())
        }
        Command::Status { topic } => {
            let max_id = handle_status(&topic, ctx).await?;
            let frame = Frame::Status {
                name: "status".to_string(),
                text: String::new(),
                data: Some(serde_json::json!({ "maxId": max_id })),
            };
            let _ = out_tx.send(codec::encode(&frame)).await;
            Ok(())
        }
    }
}

async fn emit(out_tx: &mpsc::Sender<Vec<u8>>, name: &str, text: String) {
    let frame = Frame::Status {
        name: name.to_string(),
        text,
        data: None,
    };
    let _ = out_tx.send(codec::encode(&frame)).await;
}

/// Resolves a subscribe's replay cursor: an explicit token wins, otherwise
/// fall back to the persisted offset (resuming one past the last delivered
/// id), otherwise no replay at all.
async fn resolve_start(
    path: &Path,
    explicit: Option<StartPoint>,
    user_id: &str,
    ctx: &ConnectionContext,
) -> Option<StartPoint> {
    if explicit.is_some() {
        return explicit;
    }
    let kv = ctx.kv.as_ref()?;
    let key = kv::subscription_key(user_id, "", path.as_str());
    let stored = kv.get(&key).await.ok().flatten()?;
    let offset = kv::parse_offset(&stored)?;
    Some(StartPoint::Id(offset + 1))
}

async fn create_route(
    path: Path,
    start: Option<StartPoint>,
    user_id: &str,
    ctx: &Arc<ConnectionContext>,
    out_tx: mpsc::Sender<Vec<u8>>,
) -> Result<(crate::route::RouteId, JoinHandle<()>)> {
    let route_id = ctx.router.alloc_route_id();
    let (live_tx, live_rx) = mpsc::channel(ctx.queue_depth);
    let (closed_tx, closed_rx) = oneshot::channel();

    let partition_name = path.partition();
    let partition = if partition_name.is_empty() {
        None
    } else {
        Some(ctx.store.partition(partition_name).await?)
    };

    ctx.router
        .subscribe(Subscription {
            id: route_id,
            path: path.clone(),
            sender: live_tx,
            closed_tx,
        })
        .await;

    let pump = RoutePump {
        path,
        user_id: user_id.to_string(),
        application_id: String::new(),
        partition,
        start,
        live_rx,
        closed_rx,
        out_tx,
        kv: ctx.kv.clone(),
    };
    let handle = tokio::spawn(pump.run());
    Ok((route_id, handle))
}

async fn handle_send(
    path: Path,
    header: Vec<u8>,
    body: Vec<u8>,
    user_id: &str,
    ctx: &Arc<ConnectionContext>,
) -> Result<u64> {
    if path.partition().is_empty() {
        return Err(Error::BadRequest("cannot send to the root path".to_string()));
    }
    let partition = ctx.store.partition(path.partition()).await?;

    let now = now_secs();
    let node_id = ctx.node_id;
    let path_for_store = path.clone();
    let user_for_store = user_id.to_string();
    let header_for_store = header.clone();
    let body_for_store = body.clone();

    let id = partition
        .store_tx(move |id| {
            let message = Message {
                id,
                path: path_for_store,
                user_id: user_for_store,
                application_id: String::new(),
                filters: Filters::new(),
                expires: 0,
                time: now,
                node_id,
                header_json: header_for_store,
                body: body_for_store,
            };
            codec::encode(&Frame::Message(message))
        })
        .await?;

    let message = Arc::new(Message {
        id,
        path,
        user_id: user_id.to_string(),
        application_id: String::new(),
        filters: Filters::new(),
        expires: 0,
        time: now,
        node_id,
        header_json: header,
        body,
    });
    ctx.router.publish_local(message).await;
    Ok(id)
}

async fn handle_status(topic: &str, ctx: &Arc<ConnectionContext>) -> Result<u64> {
    let path = Path::new(topic);
    let partition_name = path.partition();
    if partition_name.is_empty() {
        return Err(Error::BadRequest("status requires a non-root topic".to_string()));
    }
    let partition = ctx.store.existing_partition(partition_name).await?;
    Ok(partition.max_id().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use crate::router;
    use std::time::Duration as StdDuration;

    fn test_ctx(store: Arc<MessageStore>, router: RouterHandle) -> Arc<ConnectionContext> {
        Arc::new(ConnectionContext {
            router,
            store,
            kv: Some(Arc::new(InMemoryKvStore::new())),
            queue_depth: 16,
            idle_read_timeout: StdDuration::from_secs(30),
            node_id: 0,
        })
    }

    #[tokio::test]
    async fn send_allocates_id_and_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MessageStore::new(dir.path().to_path_buf(), 1 << 20));
        let (router_handle, _shutdown, _join) = router::spawn(None, 0, StdDuration::from_secs(3));
        let ctx = test_ctx(store, router_handle.clone());

        let (route_id, pump) = create_route(Path::new("/foo"), None, "alice", &ctx, mpsc::channel(16).0)
            .await
            .unwrap();

        let id = handle_send(Path::new("/foo/bar"), Vec::new(), b"hi".to_vec(), "bob", &ctx)
            .await
            .unwrap();
        assert_eq!(id, 1);

        router_handle.unsubscribe(route_id).await;
        let _ = pump.await;
    }

    #[tokio::test]
    async fn status_reports_max_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MessageStore::new(dir.path().to_path_buf(), 1 << 20));
        let (router_handle, _shutdown, _join) = router::spawn(None, 0, StdDuration::from_secs(3));
        let ctx = test_ctx(store, router_handle);

        handle_send(Path::new("/x"), Vec::new(), Vec::new(), "alice", &ctx)
            .await
            .unwrap();
        let max_id = handle_status("/x", &ctx).await.unwrap();
        assert_eq!(max_id, 1);
    }

    #[tokio::test]
    async fn status_on_unknown_partition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MessageStore::new(dir.path().to_path_buf(), 1 << 20));
        let (router_handle, _shutdown, _join) = router::spawn(None, 0, StdDuration::from_secs(3));
        let ctx = test_ctx(store, router_handle);

        let err = handle_status("/never-published", &ctx).await.unwrap_err();
        assert!(matches!(err, Error::UnknownPartition(_)));
        assert!(!dir.path().join("never-published").exists());
    }

    #[tokio::test]
    async fn send_to_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MessageStore::new(dir.path().to_path_buf(), 1 << 20));
        let (router_handle, _shutdown, _join) = router::spawn(None, 0, StdDuration::from_secs(3));
        let ctx = test_ctx(store, router_handle);

        let err = handle_send(Path::new("/"), Vec::new(), Vec::new(), "alice", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn resolve_start_falls_back_to_persisted_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MessageStore::new(dir.path().to_path_buf(), 1 << 20));
        let (router_handle, _shutdown, _join) = router::spawn(None, 0, StdDuration::from_secs(3));
        let ctx = test_ctx(store, router_handle);
        let key = kv::subscription_key("alice", "", "/x");
        ctx.kv.as_ref().unwrap().put(&key, b"9".to_vec()).await.unwrap();

        let start = resolve_start(&Path::new("/x"), None, "alice", &ctx).await;
        assert!(matches!(start, Some(StartPoint::Id(10))));
    }
}
