use coldchain_core::ServerMessage;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type ConnId = u64;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close(String),
}

/// Sending half of one duplex connection. Cloned into the registry; the
/// receiving half belongs to the socket writer.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    conn_id: ConnId,
    sender: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn channel(conn_id: ConnId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                conn_id,
                sender,
                closed: Arc::new(AtomicBool::new(false)),
            },
            receiver,
        )
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    /// Queues a reply, waiting for queue space. Used for direct answers to the
    /// connection's own requests, where ordering matters more than latency.
    pub async fn send(&self, message: &ServerMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        let text = match message.to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_error", conn_id = self.conn_id, error = %err);
                return false;
            }
        };
        self.sender.send(Outbound::Text(text)).await.is_ok()
    }

    /// Non-blocking enqueue of an already encoded frame.
    pub fn try_send_text(&self, text: &str) -> Result<(), mpsc::error::TrySendError<Outbound>> {
        self.sender.try_send(Outbound::Text(text.to_string()))
    }

    pub async fn ping(&self) -> bool {
        self.is_open() && self.sender.send(Outbound::Ping).await.is_ok()
    }

    /// Marks the connection closed and asks the writer to send a close frame.
    /// Idempotent.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.send(Outbound::Close(reason.to_string())).await;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentConflict {
    pub active_conn_id: ConnId,
}

/// Which connections belong to which organization: at most one agent and any
/// number of dashboards per organization. Mutations lock only the affected
/// organization's shard.
#[derive(Default)]
pub struct ConnectionRegistry {
    conn_counter: AtomicU64,
    agents: DashMap<String, ConnectionHandle>,
    dashboards: DashMap<String, HashMap<ConnId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// First-active-wins: an open incumbent keeps the slot. A closed incumbent
    /// whose close event has not been processed yet is replaced.
    pub fn register_agent(
        &self,
        organization_id: &str,
        conn: &ConnectionHandle,
    ) -> Result<(), AgentConflict> {
        match self.agents.entry(organization_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.conn_id == conn.conn_id {
                    return Ok(());
                }
                if current.is_open() {
                    return Err(AgentConflict {
                        active_conn_id: current.conn_id,
                    });
                }
                debug!(
                    event = "agent_slot_reclaimed",
                    organization_id,
                    stale_conn_id = current.conn_id,
                    conn_id = conn.conn_id
                );
                entry.insert(conn.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(conn.clone());
            }
        }
        info!(event = "agent_registered", organization_id, conn_id = conn.conn_id);
        Ok(())
    }

    /// Removes the agent only if `conn_id` still owns the slot, so a late close
    /// from a superseded connection cannot evict its successor.
    pub fn unregister_agent(&self, organization_id: &str, conn_id: ConnId) -> bool {
        let removed = self
            .agents
            .remove_if(organization_id, |_, current| current.conn_id == conn_id)
            .is_some();
        if removed {
            info!(event = "agent_unregistered", organization_id, conn_id);
        }
        removed
    }

    pub fn agent(&self, organization_id: &str) -> Option<ConnectionHandle> {
        self.agents
            .get(organization_id)
            .map(|entry| entry.value().clone())
    }

    pub fn add_dashboard(&self, organization_id: &str, conn: &ConnectionHandle) {
        self.dashboards
            .entry(organization_id.to_string())
            .or_default()
            .insert(conn.conn_id, conn.clone());
        info!(event = "dashboard_registered", organization_id, conn_id = conn.conn_id);
    }

    pub fn remove_dashboard(&self, organization_id: &str, conn_id: ConnId) -> bool {
        let mut removed = false;
        if let Entry::Occupied(mut entry) = self.dashboards.entry(organization_id.to_string()) {
            removed = entry.get_mut().remove(&conn_id).is_some();
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        if removed {
            info!(event = "dashboard_unregistered", organization_id, conn_id);
        }
        removed
    }

    pub fn dashboard_count(&self, organization_id: &str) -> usize {
        self.dashboards
            .get(organization_id)
            .map(|set| set.len())
            .unwrap_or_default()
    }

    fn snapshot_dashboards(&self, organization_id: &str) -> Vec<ConnectionHandle> {
        self.dashboards
            .get(organization_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Sends to every open dashboard of the organization without waiting.
    /// Closed or backed-up peers are skipped; their own close event removes
    /// them.
    pub fn broadcast(&self, organization_id: &str, message: &ServerMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let targets = self.snapshot_dashboards(organization_id);
        if targets.is_empty() {
            return report;
        }
        let text = match message.to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_error", organization_id, error = %err);
                return report;
            }
        };
        for conn in targets {
            if !conn.is_open() {
                report.skipped += 1;
                continue;
            }
            match conn.try_send_text(&text) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "dashboard_slow_consumer", organization_id, conn_id = conn.conn_id);
                    report.skipped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.skipped += 1;
                }
            }
        }
        debug!(
            event = "broadcast",
            organization_id,
            r#type = message.type_name(),
            delivered = report.delivered,
            skipped = report.skipped
        );
        report
    }
}
