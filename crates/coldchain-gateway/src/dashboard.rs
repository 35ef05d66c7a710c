use crate::gateway::Gateway;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use std::sync::Arc;
use tracing::{debug, info};

/// Receive-only subscription of one connection to an organization's
/// broadcasts. Registered on open, removed on close or drop.
pub struct DashboardSession {
    registry: Arc<ConnectionRegistry>,
    organization_id: String,
    conn: ConnectionHandle,
    connected: bool,
}

impl DashboardSession {
    pub fn open(gateway: &Gateway, organization_id: &str, conn: ConnectionHandle) -> Self {
        let registry = gateway.registry().clone();
        registry.add_dashboard(organization_id, &conn);
        info!(event = "dashboard_connected", organization_id, conn_id = conn.conn_id());
        Self {
            registry,
            organization_id: organization_id.to_string(),
            conn,
            connected: true,
        }
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Inbound frames from dashboards carry no meaning here.
    pub fn ignore_frame(&self, frame: &[u8]) {
        debug!(
            event = "dashboard_message_ignored",
            organization_id = %self.organization_id,
            conn_id = self.conn.conn_id(),
            size = frame.len()
        );
    }

    pub fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.registry
            .remove_dashboard(&self.organization_id, self.conn.conn_id());
        info!(
            event = "dashboard_disconnected",
            organization_id = %self.organization_id,
            conn_id = self.conn.conn_id()
        );
    }
}

impl Drop for DashboardSession {
    fn drop(&mut self) {
        self.close();
    }
}
