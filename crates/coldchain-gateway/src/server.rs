use crate::dashboard::DashboardSession;
use crate::gateway::Gateway;
use crate::registry::{ConnectionHandle, Outbound};
use crate::session::{AgentSession, Flow};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{future::Future, io, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY: u16 = 1008;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws/agent", get(agent_ws_handler))
        .route("/ws/dashboard/:organization_id", get(dashboard_ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(gateway)
}

pub async fn serve<F>(listener: TcpListener, gateway: Arc<Gateway>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(gateway, socket))
}

async fn dashboard_ws_handler(
    ws: WebSocketUpgrade,
    Path(organization_id): Path<String>,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_dashboard_socket(gateway, organization_id, socket))
}

async fn handle_agent_socket(gateway: Arc<Gateway>, socket: WebSocket) {
    let config = gateway.config().clone();
    let (conn, outbound) = gateway.open_connection();
    let (ws_sender, mut ws_receiver) = socket.split();
    let mut write_task = spawn_writer(ws_sender, outbound, config.write_timeout, conn.conn_id());
    let ping_task = spawn_ping(conn.clone(), config.ping_interval);
    info!(event = "agent_connected", conn_id = conn.conn_id());

    let mut session = AgentSession::new(gateway.clone(), conn.clone());
    let auth_deadline = (!config.auth_timeout.is_zero())
        .then(|| tokio::time::Instant::now() + config.auth_timeout);
    let mut writer_done = false;

    loop {
        let deadline = auth_deadline.filter(|_| !session.is_authenticated());
        let next = tokio::select! {
            next = read_before(&mut ws_receiver, deadline) => next,
            _ = &mut write_task => {
                writer_done = true;
                warn!(event = "writer_stopped", conn_id = conn.conn_id());
                break;
            }
        };
        let Some(next) = next else {
            session.expire_handshake().await;
            break;
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                warn!(event = "read_error", conn_id = conn.conn_id(), error = %err);
                break;
            }
            None => break,
        };
        if let Message::Close(_) = msg {
            info!(event = "client_close", conn_id = conn.conn_id());
            break;
        }
        let Some(data) = message_bytes(msg) else {
            continue;
        };
        if config.debug {
            debug!(event = "message_received", conn_id = conn.conn_id(), raw = %String::from_utf8_lossy(&data));
        }
        if session.handle_frame(&data).await == Flow::Close {
            break;
        }
    }

    session.close("disconnect").await;
    drop(session);
    finish(conn, ping_task, (!writer_done).then_some(write_task)).await;
}

async fn handle_dashboard_socket(gateway: Arc<Gateway>, organization_id: String, socket: WebSocket) {
    let config = gateway.config().clone();
    let (conn, outbound) = gateway.open_connection();
    let (ws_sender, mut ws_receiver) = socket.split();
    let mut write_task = spawn_writer(ws_sender, outbound, config.write_timeout, conn.conn_id());
    let ping_task = spawn_ping(conn.clone(), config.ping_interval);
    let mut session = DashboardSession::open(&gateway, &organization_id, conn.clone());
    let mut writer_done = false;

    loop {
        let result = tokio::select! {
            next = ws_receiver.next() => next,
            _ = &mut write_task => {
                writer_done = true;
                debug!(event = "writer_stopped", conn_id = conn.conn_id());
                break;
            }
        };
        let msg = match result {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                debug!(event = "read_error", conn_id = conn.conn_id(), error = %err);
                break;
            }
            None => break,
        };
        if let Message::Close(_) = msg {
            break;
        }
        if let Some(data) = message_bytes(msg) {
            session.ignore_frame(&data);
        }
    }

    session.close();
    conn.close("disconnect").await;
    finish(conn, ping_task, (!writer_done).then_some(write_task)).await;
}

/// Next inbound message, or `None` once the handshake deadline passes.
async fn read_before(
    receiver: &mut SplitStream<WebSocket>,
    deadline: Option<Instant>,
) -> Option<Option<Result<Message, axum::Error>>> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, receiver.next()).await.ok(),
        None => Some(receiver.next().await),
    }
}

/// Stops keepalives and waits for the writer to flush the close frame.
async fn finish(
    conn: ConnectionHandle,
    ping_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
) {
    if let Some(ping_task) = ping_task {
        ping_task.abort();
    }
    drop(conn);
    if let Some(write_task) = write_task {
        let _ = write_task.await;
    }
}

fn message_bytes(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Close(_) | Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn spawn_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    conn_id: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let (msg, last) = match frame {
                Outbound::Text(text) => (Message::Text(text), false),
                Outbound::Ping => (Message::Ping(Vec::new()), false),
                Outbound::Close(reason) => {
                    let code = if reason == "disconnect" {
                        CLOSE_NORMAL
                    } else {
                        CLOSE_POLICY
                    };
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    (Message::Close(Some(frame)), true)
                }
            };
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(event = "write_error", conn_id, error = %err);
                    return;
                }
                Err(_) => {
                    warn!(event = "write_timeout", conn_id);
                    return;
                }
            }
            if last {
                return;
            }
        }
    })
}

fn spawn_ping(conn: ConnectionHandle, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !conn.ping().await {
                debug!(event = "ping_stopped", conn_id = conn.conn_id());
                return;
            }
        }
    }))
}
