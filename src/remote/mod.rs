//! WebSocket remote control: `button` and `status` requests at `/ws`.

mod message;
mod peer;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::actions::Action;
use crate::app::AppHandle;
use crate::tasks::{TaskCounter, TaskGuard};
use peer::Peer;

pub const DEFAULT_PORT: u16 = 9999;

/// Status pushes that can queue up for a slow client before it starts skipping
const UPDATE_BACKLOG: usize = 32;

#[derive(Clone)]
struct ServerState {
    app: AppHandle,
    updates: broadcast::Sender<Value>,
    /// Flips to `true` once the server stops accepting
    shutdown: watch::Receiver<bool>,
    connections: TaskCounter,
}

/// Serve until Ctrl-C. Unless `keepalive`, every window and the session are
/// killed on the way out.
pub async fn run_server(app: AppHandle, port: u16, keepalive: bool) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind remote control server to {addr}"))?;
    info!(port, "serving remote control on ws://{addr}/ws");

    serve(listener, app.clone(), shutdown_signal()).await?;

    if keepalive {
        info!("keeping session alive");
    } else {
        info!("terminating all windows");
        app.execute(Action::Terminate { reinit: false })
            .await
            .context("Failed to terminate session on shutdown")?;
    }
    Ok(())
}

/// Accept connections until `shutdown` resolves, then close every open
/// socket and wait for their handlers to finish.
async fn serve<F>(listener: TcpListener, app: AppHandle, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (updates, _) = broadcast::channel(UPDATE_BACKLOG);
    let (stop, stopped) = watch::channel(false);
    let connections = TaskCounter::new();
    let state = ServerState {
        app,
        updates,
        shutdown: stopped,
        connections: connections.clone(),
    };

    let router = Router::new()
        .route("/", get(|| async { "tmule remote control\n" }))
        .route("/ws", get(upgrade))
        .with_state(state);

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = stop.send(true);
        })
        .await
        .context("Remote control server error")?;

    let open = connections.active();
    if open > 0 {
        debug!(clients = open, "closing client connections");
    }
    connections.idle().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    // Counted from here so a shutdown racing the handshake still waits for it
    let guard = state.connections.enter();
    ws.on_upgrade(move |socket| handle_socket(socket, state, guard))
}

async fn handle_socket(socket: WebSocket, state: ServerState, _guard: TaskGuard) {
    info!(clients = state.connections.active(), "client connected");

    let (tx, rx) = mpsc::unbounded_channel();
    let peer = Peer::new(tx, state.app.clone(), state.updates.clone());
    let updates = state.updates.subscribe();

    let mut rx_stream = UnboundedReceiverStream::new(rx);
    let (mut ws_tx, ws_rx) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx_stream.next().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    serve_peer(&peer, ws_rx, updates, state.shutdown.clone()).await;

    send_task.abort();
    info!("client disconnected");
}

/// Pump one client's frames and the shared status updates until the client
/// goes away or the server shuts down. Unanswered queries are dropped on exit.
async fn serve_peer<S>(
    peer: &Peer,
    mut incoming: S,
    mut updates: broadcast::Receiver<Value>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        tokio::select! {
            msg = incoming.next() => match msg {
                Some(Ok(Message::Text(text))) => peer.handle_text(&text).await,
                Some(Ok(Message::Binary(bytes))) => {
                    info!(bytes = bytes.len(), "binary message ignored");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "websocket error");
                    break;
                }
            },
            update = updates.recv() => match update {
                Ok(status) => {
                    peer.send_json(status);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "client fell behind on status updates");
                }
                Err(RecvError::Closed) => break,
            },
            _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
                debug!("server stopping, closing connection");
                break;
            }
        }
    }

    peer.close();
}
