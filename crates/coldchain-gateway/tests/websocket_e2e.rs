mod common;

use coldchain_gateway::{serve, GatewayConfig};
use common::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    harness: Harness,
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Server {
    async fn start(config: GatewayConfig) -> Self {
        let harness = Harness::with_config(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let gateway = harness.gateway.clone();
        tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            serve(listener, gateway, shutdown).await.expect("serve");
        });
        Self {
            harness,
            addr,
            shutdown: Some(shutdown_tx),
        }
    }

    async fn connect(&self, path: &str) -> Client {
        let url = format!("ws://{}{}", self.addr, path);
        let (client, _response) = connect_async(url.as_str()).await.expect("connect");
        client
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn quiet_config() -> GatewayConfig {
    GatewayConfig {
        ping_interval: Duration::ZERO,
        ..test_config()
    }
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("send");
}

/// Next JSON message, or `None` once the server closes the socket.
async fn next_json(client: &mut Client) -> Option<Value> {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .expect("server reply in time");
        match next {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(&text).expect("server json"));
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_readings_reach_dashboards_over_websocket() {
    let server = Server::start(quiet_config()).await;
    let mut dashboard = server.connect(&format!("/ws/dashboard/{ORG_A}")).await;
    let mut other_tenant = server.connect(&format!("/ws/dashboard/{ORG_B}")).await;
    let registry = server.harness.gateway.registry().clone();
    assert!(wait_until(|| registry.dashboard_count(ORG_A) == 1 && registry.dashboard_count(ORG_B) == 1).await);

    let mut agent = server.connect("/ws/agent").await;
    send_json(&mut agent, json!({ "type": "AUTH", "payload": { "organizationId": ORG_A, "token": "tok-u1" } })).await;
    let reply = next_json(&mut agent).await.expect("auth reply");
    assert_eq!(reply["type"], "AUTH_OK");

    send_json(
        &mut agent,
        json!({
            "type": "TEMPERATURE_READING",
            "payload": { "readings": [reading("inst-1", -10.0, -20.0, -15.0)] }
        }),
    )
    .await;

    let mut types = Vec::new();
    while types.len() < 3 {
        let message = next_json(&mut dashboard).await.expect("dashboard message");
        types.push(message["type"].as_str().unwrap_or_default().to_string());
        if message["type"] == "ALERT_NOTIFICATION" {
            assert_eq!(message["payload"]["limitValue"], -15.0);
        }
    }
    assert_eq!(types, vec!["TEMPERATURE_UPDATE", "INSTRUMENT_UPDATE", "ALERT_NOTIFICATION"]);
    assert!(wait_until(|| server.harness.mailer.sent().len() == 1).await);

    let quiet = tokio::time::timeout(Duration::from_millis(200), other_tenant.next()).await;
    assert!(quiet.is_err(), "other tenant received {quiet:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_agent_is_refused_and_slot_frees_on_disconnect() {
    let server = Server::start(quiet_config()).await;
    let auth = json!({ "type": "AUTH", "payload": { "organizationId": ORG_A, "token": "tok-u1" } });

    let mut first = server.connect("/ws/agent").await;
    send_json(&mut first, auth.clone()).await;
    assert_eq!(next_json(&mut first).await.expect("reply")["type"], "AUTH_OK");

    let mut second = server.connect("/ws/agent").await;
    send_json(&mut second, auth.clone()).await;
    let refused = next_json(&mut second).await.expect("reply");
    assert_eq!(refused["type"], "AUTH_ERROR");
    assert_eq!(refused["payload"]["message"], "agent already active");
    assert!(next_json(&mut second).await.is_none());

    first.close(None).await.expect("close");
    drop(first);
    let registry = server.harness.gateway.registry().clone();
    assert!(wait_until(|| registry.agent(ORG_A).is_none()).await);

    let mut third = server.connect("/ws/agent").await;
    send_json(&mut third, auth).await;
    assert_eq!(next_json(&mut third).await.expect("reply")["type"], "AUTH_OK");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_agent_is_closed_after_auth_timeout() {
    let server = Server::start(GatewayConfig {
        auth_timeout: Duration::from_millis(200),
        ..quiet_config()
    })
    .await;
    let mut agent = server.connect("/ws/agent").await;
    let reply = next_json(&mut agent).await.expect("timeout reply");
    assert_eq!(reply["type"], "AUTH_ERROR");
    assert_eq!(reply["payload"]["message"], "authentication timeout");
    assert!(next_json(&mut agent).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_endpoint_answers_ok() {
    let server = Server::start(quiet_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.expect("connect");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok"));
}
