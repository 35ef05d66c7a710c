//! Real-time telemetry gateway: authenticates field agents, ingests their
//! readings, fans updates out to dashboards and raises edge-triggered alerts.

pub mod alert_state;
pub mod auth;
pub mod backend;
pub mod collaborators;
pub mod config;
pub mod dashboard;
pub mod gateway;
pub mod logging;
pub mod notify;
pub mod registry;
pub mod server;
pub mod session;

pub use alert_state::AlertStateStore;
pub use auth::{resolve_organization, AuthError};
pub use backend::{LogMailer, SqliteBackend, StaticTokenVerifier, TokenGrant};
pub use collaborators::{
    CollaboratorError, Collaborators, EmailReceipt, InstrumentRepository, Mailer,
    OrganizationDirectory, OrganizationRecord, ReadingSink, SettingsSource, TokenVerifier,
    VerifiedToken,
};
pub use config::{load_config, GatewayConfig};
pub use dashboard::DashboardSession;
pub use gateway::{Gateway, IngestReport};
pub use notify::{DispatchOutcome, NotificationDispatcher, NotificationWorker};
pub use registry::{BroadcastReport, ConnId, ConnectionHandle, ConnectionRegistry, Outbound};
pub use server::{router, serve};
pub use session::{AgentSession, AgentState, Flow};
