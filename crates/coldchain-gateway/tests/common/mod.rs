#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use coldchain_core::{EmailMessage, Instrument, NewInstrument, NotificationSettings, ReadingEvent};
use coldchain_gateway::{
    AgentSession, CollaboratorError, Collaborators, ConnectionHandle, DashboardSession,
    EmailReceipt, Gateway, GatewayConfig, InstrumentRepository, Mailer, OrganizationDirectory,
    OrganizationRecord, Outbound, ReadingSink, SettingsSource, TokenVerifier, VerifiedToken,
};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

pub const ORG_A: &str = "org-a";
pub const ORG_B: &str = "org-b";
pub const FALLBACK_RECIPIENT: &str = "ops@example.com";

#[derive(Default)]
pub struct FakeTokens {
    tokens: HashMap<String, VerifiedToken>,
    pub unavailable: AtomicBool,
}

impl FakeTokens {
    fn with(mut self, token: &str, subject: &str, organization_id: Option<&str>) -> Self {
        self.tokens.insert(
            token.to_string(),
            VerifiedToken {
                subject: subject.to_string(),
                organization_id: organization_id.map(str::to_string),
            },
        );
        self
    }
}

#[async_trait]
impl TokenVerifier for FakeTokens {
    async fn verify(&self, token: &str) -> Result<Option<VerifiedToken>, CollaboratorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("token service down".to_string()));
        }
        Ok(self.tokens.get(token).cloned())
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    organizations: HashSet<String>,
    memberships: HashSet<(String, String)>,
}

#[async_trait]
impl OrganizationDirectory for FakeDirectory {
    async fn find_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationRecord>, CollaboratorError> {
        Ok(self
            .organizations
            .contains(organization_id)
            .then(|| OrganizationRecord {
                id: organization_id.to_string(),
                name: organization_id.to_uppercase(),
            }))
    }

    async fn has_active_membership(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<bool, CollaboratorError> {
        Ok(self
            .memberships
            .contains(&(user_id.to_string(), organization_id.to_string())))
    }
}

#[derive(Default)]
pub struct FakeInstruments {
    counter: AtomicU64,
    pub created: Mutex<Vec<Instrument>>,
}

#[async_trait]
impl InstrumentRepository for FakeInstruments {
    async fn create_instrument(&self, new: NewInstrument) -> Result<Instrument, CollaboratorError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let instrument = Instrument {
            id: format!("inst-{id}"),
            organization_id: new.organization_id,
            name: new.name,
            slug: new.slug,
            instrument_type: new.instrument_type,
            min_value: new.min_value,
            max_value: new.max_value,
            process_status_text: new.process_status_text,
            created_at: Utc::now(),
        };
        self.created.lock().expect("lock").push(instrument.clone());
        Ok(instrument)
    }
}

#[derive(Default)]
pub struct RecordingReadings {
    pub stored: Mutex<Vec<ReadingEvent>>,
    pub fail: AtomicBool,
}

impl RecordingReadings {
    pub fn count(&self) -> usize {
        self.stored.lock().expect("lock").len()
    }
}

#[async_trait]
impl ReadingSink for RecordingReadings {
    async fn insert_readings(&self, readings: Vec<ReadingEvent>) -> Result<usize, CollaboratorError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("database offline".to_string()));
        }
        let count = readings.len();
        self.stored.lock().expect("lock").extend(readings);
        Ok(count)
    }
}

#[derive(Default)]
pub struct FakeSettings {
    pub by_organization: Mutex<HashMap<String, NotificationSettings>>,
}

impl FakeSettings {
    pub fn set(&self, organization_id: &str, settings: NotificationSettings) {
        self.by_organization
            .lock()
            .expect("lock")
            .insert(organization_id.to_string(), settings);
    }
}

#[async_trait]
impl SettingsSource for FakeSettings {
    async fn notification_settings(
        &self,
        organization_id: &str,
    ) -> Result<Option<NotificationSettings>, CollaboratorError> {
        Ok(self
            .by_organization
            .lock()
            .expect("lock")
            .get(organization_id)
            .cloned())
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<EmailMessage>>,
    pub attempts: AtomicU64,
    pub fail: AtomicBool,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().expect("lock").clone()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<EmailReceipt, CollaboratorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected("mailbox unavailable".to_string()));
        }
        self.sent.lock().expect("lock").push(message.clone());
        Ok(EmailReceipt {
            id: Some("msg-1".to_string()),
        })
    }
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub tokens: Arc<FakeTokens>,
    pub instruments: Arc<FakeInstruments>,
    pub readings: Arc<RecordingReadings>,
    pub settings: Arc<FakeSettings>,
    pub mailer: Arc<RecordingMailer>,
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        alert_recipients: vec![FALLBACK_RECIPIENT.to_string()],
        email_timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Org A has active member u1; org B has active member u2; u3 has no
    /// membership anywhere.
    pub fn with_config(config: GatewayConfig) -> Self {
        let tokens = Arc::new(
            FakeTokens::default()
                .with("tok-u1", "u1", None)
                .with("tok-u1-a", "u1", Some(ORG_A))
                .with("tok-u1-b", "u1", Some(ORG_B))
                .with("tok-u2", "u2", None)
                .with("tok-u3", "u3", None),
        );
        let directory = Arc::new(FakeDirectory {
            organizations: [ORG_A, ORG_B].into_iter().map(str::to_string).collect(),
            memberships: [("u1", ORG_A), ("u1", ORG_B), ("u2", ORG_B)]
                .into_iter()
                .map(|(user, org)| (user.to_string(), org.to_string()))
                .collect(),
        });
        let instruments = Arc::new(FakeInstruments::default());
        let readings = Arc::new(RecordingReadings::default());
        let settings = Arc::new(FakeSettings::default());
        let mailer = Arc::new(RecordingMailer::default());
        let collaborators = Collaborators {
            tokens: tokens.clone(),
            directory,
            instruments: instruments.clone(),
            readings: readings.clone(),
            settings: settings.clone(),
            mailer: mailer.clone(),
        };
        Self {
            gateway: Gateway::new(config, collaborators),
            tokens,
            instruments,
            readings,
            settings,
            mailer,
        }
    }

    pub fn agent(&self) -> (AgentSession, mpsc::Receiver<Outbound>) {
        let (conn, rx) = self.gateway.open_connection();
        (AgentSession::new(self.gateway.clone(), conn), rx)
    }

    pub fn dashboard(&self, organization_id: &str) -> (DashboardSession, mpsc::Receiver<Outbound>) {
        let (conn, rx): (ConnectionHandle, _) = self.gateway.open_connection();
        (DashboardSession::open(&self.gateway, organization_id, conn), rx)
    }

    /// Session authenticated for `organization_id` through token `tok-u1`.
    pub async fn authenticated_agent(
        &self,
        organization_id: &str,
    ) -> (AgentSession, mpsc::Receiver<Outbound>) {
        let (mut session, mut rx) = self.agent();
        session.handle_frame(&auth_frame(Some(organization_id), "tok-u1")).await;
        let replies = drain(&mut rx);
        assert_eq!(message_types(&replies.messages), vec!["AUTH_OK"]);
        (session, rx)
    }
}

pub fn frame(message_type: &str, payload: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({ "type": message_type, "payload": payload })).expect("encode")
}

pub fn auth_frame(organization_id: Option<&str>, token: &str) -> Vec<u8> {
    match organization_id {
        Some(organization_id) => frame(
            "AUTH",
            json!({ "organizationId": organization_id, "token": token }),
        ),
        None => frame("AUTH", json!({ "token": token })),
    }
}

pub fn reading(instrument_id: &str, value: f64, min_value: f64, max_value: f64) -> Value {
    json!({
        "instrumentId": instrument_id,
        "instrumentName": "Freezer A",
        "value": value,
        "minValue": min_value,
        "maxValue": max_value,
    })
}

pub fn readings_frame(readings: Vec<Value>) -> Vec<u8> {
    frame("TEMPERATURE_READING", json!({ "readings": readings }))
}

#[derive(Debug, Default)]
pub struct Received {
    pub messages: Vec<Value>,
    pub closed: Option<String>,
}

/// Everything queued on the connection so far.
pub fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Received {
    let mut received = Received::default();
    while let Ok(frame) = rx.try_recv() {
        match frame {
            Outbound::Text(text) => {
                received
                    .messages
                    .push(serde_json::from_str(&text).expect("server json"));
            }
            Outbound::Close(reason) => received.closed = Some(reason),
            Outbound::Ping => {}
        }
    }
    received
}

pub fn message_types(messages: &[Value]) -> Vec<String> {
    messages
        .iter()
        .map(|message| message["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub fn of_type<'a>(messages: &'a [Value], message_type: &str) -> Vec<&'a Value> {
    messages
        .iter()
        .filter(|message| message["type"] == message_type)
        .collect()
}

pub fn auth_error_message(received: &Received) -> Option<String> {
    of_type(&received.messages, "AUTH_ERROR")
        .first()
        .and_then(|message| message["payload"]["message"].as_str())
        .map(str::to_string)
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
