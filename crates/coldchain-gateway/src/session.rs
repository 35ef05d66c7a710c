//! Per-connection agent protocol: the AUTH handshake followed by routing of
//! authenticated messages.

use crate::auth::AuthError;
use crate::gateway::Gateway;
use crate::registry::ConnectionHandle;
use coldchain_core::{
    AgentMessage, AuthPayload, Envelope, InstrumentCreatePayload, InstrumentCreatedPayload,
    ServerMessage, TemperatureReadingPayload,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Unauthenticated,
    Authenticated { organization_id: String },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct AgentSession {
    gateway: Arc<Gateway>,
    conn: ConnectionHandle,
    state: AgentState,
}

impl AgentSession {
    pub fn new(gateway: Arc<Gateway>, conn: ConnectionHandle) -> Self {
        Self {
            gateway,
            conn,
            state: AgentState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn organization_id(&self) -> Option<&str> {
        match &self.state {
            AgentState::Authenticated { organization_id } => Some(organization_id.as_str()),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AgentState::Authenticated { .. })
    }

    pub fn conn(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// Handles one inbound frame. Messages from one connection are processed
    /// strictly in the order this is called.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Flow {
        let organization_id = match &self.state {
            AgentState::Closed => return Flow::Close,
            AgentState::Unauthenticated => None,
            AgentState::Authenticated { organization_id } => Some(organization_id.clone()),
        };
        if let Some(organization_id) = organization_id.as_deref() {
            if !self.holds_agent_slot(organization_id) {
                warn!(
                    event = "agent_superseded",
                    conn_id = self.conn.conn_id(),
                    organization_id,
                    open = self.conn.is_open()
                );
                self.close("superseded").await;
                return Flow::Close;
            }
        }
        let envelope = match Envelope::decode(frame, self.gateway.config().max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                if organization_id.is_none() {
                    warn!(event = "pre_auth_frame_invalid", conn_id = self.conn.conn_id(), error = %err);
                    return self.reject(AuthError::AuthenticationRequired).await;
                }
                warn!(event = "message_invalid", conn_id = self.conn.conn_id(), error = %err);
                return Flow::Continue;
            }
        };
        match organization_id {
            None => self.handle_unauthenticated(&envelope).await,
            Some(organization_id) => self.handle_authenticated(&organization_id, &envelope).await,
        }
    }

    /// A connection whose writer is gone may have lost the registry slot to a
    /// newer agent; it must stop routing once that can have happened.
    fn holds_agent_slot(&self, organization_id: &str) -> bool {
        self.conn.is_open()
            && self
                .gateway
                .registry()
                .agent(organization_id)
                .is_some_and(|agent| agent.conn_id() == self.conn.conn_id())
    }

    async fn handle_unauthenticated(&mut self, envelope: &Envelope) -> Flow {
        if !envelope.is_auth() {
            warn!(
                event = "message_before_auth",
                conn_id = self.conn.conn_id(),
                r#type = %envelope.r#type
            );
            return self.reject(AuthError::AuthenticationRequired).await;
        }
        let payload = match AgentMessage::from_envelope(envelope) {
            Ok(AgentMessage::Auth(payload)) => payload,
            Ok(_) | Err(_) => return self.reject(AuthError::InvalidPayload).await,
        };
        match self.gateway.authenticate(&self.conn, &payload).await {
            Ok(organization_id) => {
                info!(
                    event = "agent_auth_ok",
                    conn_id = self.conn.conn_id(),
                    organization_id = %organization_id
                );
                self.state = AgentState::Authenticated { organization_id };
                self.conn.send(&ServerMessage::AuthOk).await;
                Flow::Continue
            }
            Err(err) => self.reject(err).await,
        }
    }

    async fn handle_authenticated(&mut self, organization_id: &str, envelope: &Envelope) -> Flow {
        let message = match AgentMessage::from_envelope(envelope) {
            Ok(message) => message,
            Err(err) => {
                if envelope.is_auth() {
                    return self.reject(AuthError::InvalidPayload).await;
                }
                warn!(
                    event = "payload_invalid",
                    conn_id = self.conn.conn_id(),
                    organization_id,
                    error = %err
                );
                return Flow::Continue;
            }
        };
        match message {
            AgentMessage::Auth(payload) => self.reauthenticate(organization_id, &payload).await,
            AgentMessage::InstrumentCreate(payload) => {
                self.create_instrument(organization_id, payload).await
            }
            AgentMessage::TemperatureReading(payload) => {
                self.ingest(organization_id, payload).await;
                Flow::Continue
            }
        }
    }

    /// A repeated AUTH may confirm the bound organization but never move the
    /// session to another one.
    async fn reauthenticate(&mut self, organization_id: &str, payload: &AuthPayload) -> Flow {
        match self.gateway.authorize(payload).await {
            Ok(resolved) if resolved == organization_id => {
                self.conn.send(&ServerMessage::AuthOk).await;
                Flow::Continue
            }
            Ok(resolved) => {
                warn!(
                    event = "agent_rebind_rejected",
                    conn_id = self.conn.conn_id(),
                    organization_id,
                    requested = %resolved
                );
                self.reject(AuthError::OrganizationMismatch).await
            }
            Err(err) => self.reject(err).await,
        }
    }

    async fn create_instrument(
        &mut self,
        organization_id: &str,
        payload: InstrumentCreatePayload,
    ) -> Flow {
        if payload.organization_id != organization_id {
            warn!(
                event = "instrument_tenant_mismatch",
                conn_id = self.conn.conn_id(),
                organization_id,
                requested = %payload.organization_id
            );
            return self.reject(AuthError::OrganizationMismatch).await;
        }
        match self.gateway.create_instrument(organization_id, payload).await {
            Ok(instrument) => {
                self.conn
                    .send(&ServerMessage::InstrumentCreated(InstrumentCreatedPayload {
                        slug: instrument.slug,
                        instrument_id: instrument.id,
                    }))
                    .await;
            }
            Err(err) => {
                warn!(
                    event = "instrument_create_failed",
                    conn_id = self.conn.conn_id(),
                    organization_id,
                    error = %err
                );
            }
        }
        Flow::Continue
    }

    async fn ingest(&self, organization_id: &str, payload: TemperatureReadingPayload) {
        let report = self
            .gateway
            .ingest_readings(organization_id, payload.readings)
            .await;
        debug!(
            event = "reading_batch",
            conn_id = self.conn.conn_id(),
            organization_id,
            accepted = report.accepted,
            dropped = report.dropped,
            transitions = report.transitions
        );
    }

    /// Closes a connection whose handshake never completed. No-op once
    /// authenticated.
    pub async fn expire_handshake(&mut self) -> Flow {
        match self.state {
            AgentState::Unauthenticated => self.reject(AuthError::Timeout).await,
            AgentState::Authenticated { .. } => Flow::Continue,
            AgentState::Closed => Flow::Close,
        }
    }

    async fn reject(&mut self, err: AuthError) -> Flow {
        warn!(
            event = "agent_auth_rejected",
            conn_id = self.conn.conn_id(),
            organization_id = self.organization_id().unwrap_or(""),
            reason = err.code()
        );
        self.conn.send(&ServerMessage::auth_error(err.to_string())).await;
        self.close(err.code()).await;
        Flow::Close
    }

    /// Leaves the registry and asks the writer to close the socket.
    pub async fn close(&mut self, reason: &str) {
        self.release();
        self.conn.close(reason).await;
    }

    fn release(&mut self) {
        let state = std::mem::replace(&mut self.state, AgentState::Closed);
        if let AgentState::Authenticated { organization_id } = state {
            self.gateway.release_agent(&organization_id, &self.conn);
        }
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.release();
    }
}
