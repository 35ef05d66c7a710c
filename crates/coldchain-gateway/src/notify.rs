//! Turns alert transitions into push broadcasts and emails, off the reading
//! ingestion path.
//!
//! One worker task drains the queue in order and pushes each alert before
//! taking the next, so pushes for an instrument arrive in transition order.
//! Emails leave the worker as their own tasks, a bounded number at a time; a
//! slow mail provider never holds up pushes for any organization.

use crate::collaborators::{Mailer, SettingsSource};
use crate::registry::ConnectionRegistry;
use coldchain_core::{
    AlertNotification, AlertTransition, EmailMessage, NotificationSettings, ServerMessage,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// What `dispatch` did for one transition. `email` is the in-flight send,
/// resolving to whether the provider accepted it.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub pushed: bool,
    pub email: Option<JoinHandle<bool>>,
}

pub struct NotificationWorker {
    registry: Arc<ConnectionRegistry>,
    settings: Arc<dyn SettingsSource>,
    mailer: Arc<dyn Mailer>,
    fallback: NotificationSettings,
    email_timeout: Duration,
    email_slots: Arc<Semaphore>,
}

impl NotificationWorker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        settings: Arc<dyn SettingsSource>,
        mailer: Arc<dyn Mailer>,
        fallback: NotificationSettings,
        email_timeout: Duration,
        email_concurrency: usize,
    ) -> Self {
        Self {
            registry,
            settings,
            mailer,
            fallback,
            email_timeout,
            email_slots: Arc::new(Semaphore::new(email_concurrency.max(1))),
        }
    }

    async fn settings_for(&self, organization_id: &str) -> NotificationSettings {
        match self.settings.notification_settings(organization_id).await {
            Ok(Some(settings)) => settings,
            Ok(None) => self.fallback.clone(),
            Err(err) => {
                warn!(event = "settings_lookup_failed", organization_id, error = %err);
                self.fallback.clone()
            }
        }
    }

    /// Runs every channel the organization's settings allow for this
    /// transition. The push happens before this returns; the email is
    /// started and handed back. Failures are logged, never returned.
    pub async fn dispatch(&self, transition: &AlertTransition) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let settings = self.settings_for(&transition.organization_id).await;
        let alert_type = transition.alert_type();
        if !settings.allows(alert_type) {
            debug!(
                event = "alert_suppressed",
                organization_id = %transition.organization_id,
                instrument_id = %transition.instrument_id,
                alert_type = %alert_type
            );
            return outcome;
        }

        if settings.push_enabled {
            let message = ServerMessage::AlertNotification(AlertNotification::from(transition));
            let report = self.registry.broadcast(&transition.organization_id, &message);
            outcome.pushed = true;
            info!(
                event = "alert_pushed",
                organization_id = %transition.organization_id,
                instrument_id = %transition.instrument_id,
                alert_type = %alert_type,
                delivered = report.delivered
            );
        }

        if settings.wants_email() {
            outcome.email = self.spawn_email(transition, transition.email(&settings));
        }
        outcome
    }

    /// Starts one send if a slot is free. With every slot busy the email is
    /// dropped; the push has already gone out.
    fn spawn_email(
        &self,
        transition: &AlertTransition,
        email: EmailMessage,
    ) -> Option<JoinHandle<bool>> {
        let organization_id = transition.organization_id.clone();
        let instrument_id = transition.instrument_id.clone();
        let permit = match self.email_slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    event = "email_dropped",
                    organization_id = %organization_id,
                    instrument_id = %instrument_id,
                    reason = "too_many_in_flight"
                );
                return None;
            }
        };
        let mailer = self.mailer.clone();
        let email_timeout = self.email_timeout;
        Some(tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(email_timeout, mailer.send(&email)).await {
                Ok(Ok(receipt)) => {
                    info!(
                        event = "email_sent",
                        organization_id = %organization_id,
                        instrument_id = %instrument_id,
                        recipients = email.to.len(),
                        id = receipt.id.as_deref().unwrap_or("")
                    );
                    true
                }
                Ok(Err(err)) => {
                    warn!(
                        event = "email_send_failed",
                        organization_id = %organization_id,
                        instrument_id = %instrument_id,
                        error = %err
                    );
                    false
                }
                Err(_) => {
                    warn!(
                        event = "email_send_failed",
                        organization_id = %organization_id,
                        instrument_id = %instrument_id,
                        error = "timeout"
                    );
                    false
                }
            }
        }))
    }

    /// Moves the worker onto its own task fed by a bounded queue. The task
    /// ends once every dispatcher clone is dropped.
    pub fn spawn(self, capacity: usize) -> (NotificationDispatcher, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<AlertTransition>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(transition) = receiver.recv().await {
                self.dispatch(&transition).await;
            }
            debug!(event = "notification_worker_stopped");
        });
        (NotificationDispatcher { sender }, handle)
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<AlertTransition>,
}

impl NotificationDispatcher {
    /// Enqueues without waiting. A full queue drops the transition.
    pub fn submit(&self, transition: AlertTransition) -> bool {
        match self.sender.try_send(transition) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(transition)) => {
                warn!(
                    event = "notification_dropped",
                    organization_id = %transition.organization_id,
                    instrument_id = %transition.instrument_id,
                    reason = "queue_full"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(transition)) => {
                warn!(
                    event = "notification_dropped",
                    organization_id = %transition.organization_id,
                    instrument_id = %transition.instrument_id,
                    reason = "worker_stopped"
                );
                false
            }
        }
    }
}
