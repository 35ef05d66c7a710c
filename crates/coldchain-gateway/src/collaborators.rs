//! Seams to the systems the gateway does not own: token issuance, the
//! organization directory, instrument and reading persistence, notification
//! settings, and outbound email.

use async_trait::async_trait;
use coldchain_core::{EmailMessage, Instrument, NewInstrument, NotificationSettings, ReadingEvent};
use coldchain_storage::StorageError;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject: String,
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailReceipt {
    pub id: Option<String>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// `Ok(None)` means the token is invalid or expired. `Err` is reserved for
    /// the verifier itself being unreachable.
    async fn verify(&self, token: &str) -> Result<Option<VerifiedToken>, CollaboratorError>;
}

#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn find_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationRecord>, CollaboratorError>;

    async fn has_active_membership(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait InstrumentRepository: Send + Sync {
    async fn create_instrument(&self, new: NewInstrument) -> Result<Instrument, CollaboratorError>;
}

#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn insert_readings(&self, readings: Vec<ReadingEvent>) -> Result<usize, CollaboratorError>;
}

#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn notification_settings(
        &self,
        organization_id: &str,
    ) -> Result<Option<NotificationSettings>, CollaboratorError>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<EmailReceipt, CollaboratorError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub tokens: Arc<dyn TokenVerifier>,
    pub directory: Arc<dyn OrganizationDirectory>,
    pub instruments: Arc<dyn InstrumentRepository>,
    pub readings: Arc<dyn ReadingSink>,
    pub settings: Arc<dyn SettingsSource>,
    pub mailer: Arc<dyn Mailer>,
}
