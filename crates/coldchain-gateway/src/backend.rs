//! Default collaborator implementations used by the binary: the SQLite store,
//! a token table loaded from disk, and a mailer that only logs.

use crate::collaborators::{
    CollaboratorError, EmailReceipt, InstrumentRepository, Mailer, OrganizationDirectory,
    OrganizationRecord, ReadingSink, SettingsSource, TokenVerifier, VerifiedToken,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coldchain_core::{EmailMessage, Instrument, NewInstrument, NotificationSettings, ReadingEvent};
use coldchain_storage::ColdChainStore;
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::info;

#[derive(Clone)]
pub struct SqliteBackend {
    store: Arc<Mutex<ColdChainStore>>,
}

impl SqliteBackend {
    pub fn new(store: ColdChainStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Runs a store call on the blocking pool so sqlite I/O never stalls a
    /// connection task.
    async fn with_store<T, F>(&self, op: F) -> Result<T, CollaboratorError>
    where
        T: Send + 'static,
        F: FnOnce(&ColdChainStore) -> Result<T, coldchain_storage::StorageError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|_| CollaboratorError::Unavailable("store lock poisoned".to_string()))?;
            op(&guard).map_err(CollaboratorError::from)
        })
        .await
        .map_err(|err| CollaboratorError::Unavailable(format!("store task failed: {err}")))?
    }
}

#[async_trait]
impl OrganizationDirectory for SqliteBackend {
    async fn find_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationRecord>, CollaboratorError> {
        let id = organization_id.to_string();
        let organization = self.with_store(move |store| store.organization(&id)).await?;
        Ok(organization.map(|org| OrganizationRecord {
            id: org.id,
            name: org.name,
        }))
    }

    async fn has_active_membership(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<bool, CollaboratorError> {
        let user_id = user_id.to_string();
        let organization_id = organization_id.to_string();
        self.with_store(move |store| store.has_active_membership(&user_id, &organization_id))
            .await
    }
}

#[async_trait]
impl InstrumentRepository for SqliteBackend {
    async fn create_instrument(&self, new: NewInstrument) -> Result<Instrument, CollaboratorError> {
        self.with_store(move |store| store.create_instrument(&new))
            .await
    }
}

#[async_trait]
impl ReadingSink for SqliteBackend {
    async fn insert_readings(&self, readings: Vec<ReadingEvent>) -> Result<usize, CollaboratorError> {
        self.with_store(move |store| store.insert_readings(&readings))
            .await
    }
}

#[async_trait]
impl SettingsSource for SqliteBackend {
    async fn notification_settings(
        &self,
        organization_id: &str,
    ) -> Result<Option<NotificationSettings>, CollaboratorError> {
        let organization_id = organization_id.to_string();
        self.with_store(move |store| store.notification_settings(&organization_id))
            .await
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub token: String,
    pub subject: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Verifies agent tokens against a fixed table, typically loaded from a JSON
/// array of [`TokenGrant`]s.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    grants: HashMap<String, TokenGrant>,
}

impl StaticTokenVerifier {
    pub fn new(grants: impl IntoIterator<Item = TokenGrant>) -> Self {
        Self {
            grants: grants
                .into_iter()
                .map(|grant| (grant.token.clone(), grant))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading token file {}", path.display()))?;
        let grants: Vec<TokenGrant> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing token file {}", path.display()))?;
        Ok(Self::new(grants))
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Option<VerifiedToken>, CollaboratorError> {
        let Some(grant) = self.grants.get(token) else {
            return Ok(None);
        };
        if grant.expires_at.is_some_and(|expires_at| expires_at <= Utc::now()) {
            return Ok(None);
        }
        Ok(Some(VerifiedToken {
            subject: grant.subject.clone(),
            organization_id: grant
                .organization_id
                .clone()
                .filter(|id| !id.trim().is_empty()),
        }))
    }
}

/// Stand-in mail transport: records the message in the log and reports
/// success.
#[derive(Debug, Default)]
pub struct LogMailer {
    sent: AtomicU64,
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<EmailReceipt, CollaboratorError> {
        let id = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            event = "email_logged",
            id,
            to = %message.to.join(","),
            subject = %message.subject
        );
        Ok(EmailReceipt {
            id: Some(format!("log-{id}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use coldchain_core::{slugify, InstrumentType};
    use coldchain_storage::MembershipStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn grant(token: &str, organization_id: Option<&str>) -> TokenGrant {
        TokenGrant {
            token: token.to_string(),
            subject: "u1".to_string(),
            organization_id: organization_id.map(str::to_string),
            expires_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn static_verifier_rejects_unknown_and_expired_tokens() {
        let mut expired = grant("old", None);
        expired.expires_at = Some(Utc::now() - Duration::minutes(1));
        let verifier = StaticTokenVerifier::new([grant("good", Some("org-a")), expired]);

        let verified = verifier.verify("good").await.expect("verify").expect("valid");
        assert_eq!(verified.subject, "u1");
        assert_eq!(verified.organization_id.as_deref(), Some("org-a"));
        assert!(verifier.verify("old").await.expect("verify").is_none());
        assert!(verifier.verify("nope").await.expect("verify").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn static_verifier_loads_json_file() {
        let mut file = NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"[{{"token": "t-1", "subject": "u1", "organizationId": ""}}]"#
        )
        .expect("write");
        let verifier = StaticTokenVerifier::load(file.path()).expect("load");
        assert_eq!(verifier.len(), 1);
        let verified = verifier.verify("t-1").await.expect("verify").expect("valid");
        assert_eq!(verified.organization_id, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sqlite_backend_serves_directory_and_persistence() {
        let store = ColdChainStore::open_in_memory().expect("store");
        store.upsert_organization("org-a", "Acme").expect("org");
        store
            .upsert_membership("u1", "org-a", MembershipStatus::Active)
            .expect("member");
        let backend = SqliteBackend::new(store);

        let org = backend
            .find_organization("org-a")
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(org.name, "Acme");
        assert!(backend.find_organization("org-x").await.expect("lookup").is_none());
        assert!(backend
            .has_active_membership("u1", "org-a")
            .await
            .expect("membership"));

        let instrument = backend
            .create_instrument(NewInstrument {
                organization_id: "org-a".to_string(),
                name: "Freezer A".to_string(),
                slug: slugify("Freezer A"),
                instrument_type: InstrumentType::Temperature,
                min_value: -20.0,
                max_value: -15.0,
                process_status_text: None,
            })
            .await
            .expect("create");
        assert_eq!(instrument.slug, "freezer-a");
        assert!(backend
            .notification_settings("org-a")
            .await
            .expect("settings")
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn log_mailer_issues_sequential_ids() {
        let mailer = LogMailer::default();
        let message = EmailMessage {
            to: vec!["ops@example.com".to_string()],
            subject: "s".to_string(),
            body: "b".to_string(),
        };
        let first = mailer.send(&message).await.expect("send");
        let second = mailer.send(&message).await.expect("send");
        assert_eq!(first.id.as_deref(), Some("log-1"));
        assert_eq!(second.id.as_deref(), Some("log-2"));
    }
}
