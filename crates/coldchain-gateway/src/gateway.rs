use crate::alert_state::AlertStateStore;
use crate::auth::{resolve_organization, AuthError};
use crate::collaborators::{CollaboratorError, Collaborators};
use crate::config::GatewayConfig;
use crate::notify::{NotificationDispatcher, NotificationWorker};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use chrono::Utc;
use coldchain_core::{
    nearest_limit, slugify, AlertThresholds, AlertTransition, AuthPayload, Instrument,
    InstrumentCreatePayload, InstrumentUpdate, InstrumentViewModel, NewInstrument,
    NotificationSettings, ReadingEvent, ReadingInput, ServerMessage,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What one `TEMPERATURE_READING` batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub dropped: usize,
    pub persisted: Option<usize>,
    pub transitions: usize,
}

/// Process-wide gateway state shared by every connection task.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    alerts: AlertStateStore,
    thresholds: AlertThresholds,
    dispatcher: NotificationDispatcher,
    collaborators: Collaborators,
}

impl Gateway {
    /// Builds the gateway and starts its notification worker. Must be called
    /// from within a tokio runtime.
    pub fn new(config: GatewayConfig, collaborators: Collaborators) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let worker = NotificationWorker::new(
            registry.clone(),
            collaborators.settings.clone(),
            collaborators.mailer.clone(),
            NotificationSettings::with_recipients(config.alert_recipients.clone()),
            config.email_timeout,
            config.email_concurrency,
        );
        let (dispatcher, _worker) = worker.spawn(config.notification_queue);
        Arc::new(Self {
            thresholds: AlertThresholds::new(config.warning_band),
            alerts: AlertStateStore::with_limit(config.max_tracked_alerts),
            config,
            registry,
            dispatcher,
            collaborators,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn alerts(&self) -> &AlertStateStore {
        &self.alerts
    }

    /// Allocates a connection id and its bounded outbound queue.
    pub fn open_connection(&self) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        ConnectionHandle::channel(self.registry.next_conn_id(), self.config.queue_capacity)
    }

    /// Verifies the credentials and resolves the organization they grant,
    /// without touching the registry.
    pub async fn authorize(&self, payload: &AuthPayload) -> Result<String, AuthError> {
        let verified = match self.collaborators.tokens.verify(&payload.token).await {
            Ok(Some(verified)) => verified,
            Ok(None) => return Err(AuthError::InvalidToken),
            Err(err) => {
                warn!(event = "token_verifier_failed", error = %err);
                return Err(AuthError::ServiceUnavailable);
            }
        };
        let organization_id = resolve_organization(
            payload.organization_id.as_deref(),
            verified.organization_id.as_deref(),
        )?;
        match self
            .collaborators
            .directory
            .find_organization(&organization_id)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return Err(AuthError::OrganizationNotFound),
            Err(err) => {
                warn!(event = "directory_failed", organization_id = %organization_id, error = %err);
                return Err(AuthError::ServiceUnavailable);
            }
        }
        match self
            .collaborators
            .directory
            .has_active_membership(&verified.subject, &organization_id)
            .await
        {
            Ok(true) => Ok(organization_id),
            Ok(false) => Err(AuthError::MembershipInactive),
            Err(err) => {
                warn!(event = "directory_failed", organization_id = %organization_id, error = %err);
                Err(AuthError::ServiceUnavailable)
            }
        }
    }

    /// Full handshake: authorize, then claim the organization's agent slot.
    pub async fn authenticate(
        &self,
        conn: &ConnectionHandle,
        payload: &AuthPayload,
    ) -> Result<String, AuthError> {
        let organization_id = self.authorize(payload).await?;
        self.registry
            .register_agent(&organization_id, conn)
            .map_err(|conflict| {
                warn!(
                    event = "agent_conflict",
                    organization_id = %organization_id,
                    conn_id = conn.conn_id(),
                    active_conn_id = conflict.active_conn_id
                );
                AuthError::AgentAlreadyActive
            })?;
        Ok(organization_id)
    }

    pub fn release_agent(&self, organization_id: &str, conn: &ConnectionHandle) -> bool {
        self.registry.unregister_agent(organization_id, conn.conn_id())
    }

    /// Creates the instrument through the repository and announces it to the
    /// organization's dashboards. The caller has already checked the tenant.
    pub async fn create_instrument(
        &self,
        organization_id: &str,
        payload: InstrumentCreatePayload,
    ) -> Result<Instrument, CollaboratorError> {
        let new = NewInstrument {
            organization_id: organization_id.to_string(),
            slug: slugify(&payload.name),
            name: payload.name,
            instrument_type: payload.instrument_type,
            min_value: payload.min_value,
            max_value: payload.max_value,
            process_status_text: payload.process_status_text,
        };
        let instrument = self.collaborators.instruments.create_instrument(new).await?;
        info!(
            event = "instrument_created",
            organization_id,
            instrument_id = %instrument.id,
            slug = %instrument.slug
        );
        self.registry.broadcast(
            organization_id,
            &ServerMessage::InstrumentViewModel(InstrumentViewModel::from(&instrument)),
        );
        Ok(instrument)
    }

    /// Persist, fan out, then evaluate each reading in order. Persistence
    /// failure is logged and does not stop broadcast or evaluation.
    pub async fn ingest_readings(
        &self,
        organization_id: &str,
        readings: Vec<ReadingInput>,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        let received_at = Utc::now();
        let mut events = Vec::with_capacity(readings.len());
        for reading in readings {
            let declared = reading
                .organization_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty());
            if let Some(declared) = declared {
                if declared != organization_id {
                    warn!(
                        event = "reading_tenant_mismatch",
                        organization_id,
                        declared,
                        instrument_id = %reading.instrument_id
                    );
                    report.dropped += 1;
                    continue;
                }
            }
            events.push(reading.into_event(organization_id, received_at));
        }
        report.accepted = events.len();
        if events.is_empty() {
            return report;
        }

        match self
            .collaborators
            .readings
            .insert_readings(events.clone())
            .await
        {
            Ok(count) => report.persisted = Some(count),
            Err(err) => {
                warn!(
                    event = "reading_batch_persist_failed",
                    organization_id,
                    count = events.len(),
                    error = %err
                );
            }
        }

        for event in &events {
            self.registry
                .broadcast(organization_id, &ServerMessage::TemperatureUpdate(event.clone()));
            self.registry.broadcast(
                organization_id,
                &ServerMessage::InstrumentUpdate(InstrumentUpdate::from(event)),
            );
            if self.evaluate(event) {
                report.transitions += 1;
            }
        }
        report
    }

    /// Returns true when the reading produced a notifiable transition.
    fn evaluate(&self, event: &ReadingEvent) -> bool {
        let level = self
            .thresholds
            .evaluate(event.edit_value, event.min_value, event.max_value);
        let previous = self
            .alerts
            .observe(&event.organization_id, &event.instrument_id, level);
        let Some(previous) = previous else {
            return false;
        };
        info!(
            event = "alert_transition",
            organization_id = %event.organization_id,
            instrument_id = %event.instrument_id,
            from = %previous,
            to = %level,
            value = event.edit_value
        );
        if !level.is_alerting() {
            return false;
        }
        self.dispatcher.submit(AlertTransition {
            instrument_id: event.instrument_id.clone(),
            organization_id: event.organization_id.clone(),
            instrument_name: event.instrument_name.clone(),
            previous,
            level,
            value: event.edit_value,
            limit: nearest_limit(event.edit_value, event.min_value, event.max_value),
            occurred_at: event.timestamp,
        });
        true
    }
}
