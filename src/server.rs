//! Accept loop and WebSocket handshake (§4.6, §6): binds the listen address,
//! upgrades each accepted connection, extracts the `/user/<id>` path segment
//! per §6's transport convention, and spawns [`connection::handle_connection`].

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

use crate::connection::{self, ConnectionContext};

fn user_id_from_uri(path: &str) -> String {
    path.strip_prefix("/user/").unwrap_or("").to_string()
}

/// Runs the accept loop until `shutdown` reports `true`, spawning one task
/// per accepted connection. Does not return until told to shut down.
pub async fn serve(listener: TcpListener, ctx: Arc<ConnectionContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    accept_and_handle(stream, addr, ctx).await;
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn accept_and_handle(stream: tokio::net::TcpStream, addr: std::net::SocketAddr, ctx: Arc<ConnectionContext>) {
    let (user_id_tx, user_id_rx) = oneshot::channel();
    let callback = move |request: &Request, response: Response| {
        let user_id = user_id_from_uri(request.uri().path());
        let _ = user_id_tx.send(user_id);
        Ok(response)
    };

    match accept_hdr_async(stream, callback).await {
        Ok(ws) => {
            let user_id = user_id_rx.await.unwrap_or_default();
            log::debug!("accepted connection from {addr} user={user_id}");
            connection::handle_connection(ws, user_id, ctx).await;
        }
        Err(err) => {
            log::warn!("websocket handshake failed for {addr}: {err}");
        }
    }
}
