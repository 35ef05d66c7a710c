use crate::alert::AlertLevel;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_EMAIL_TEMPLATE: &str = "Cold-chain alert: {chamber_name} reported a {alert_type} reading of {current_value} (limit {limit_value}) at {timestamp}.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Warning,
    Critical,
}

impl AlertType {
    pub fn for_level(level: AlertLevel) -> Self {
        if level == AlertLevel::Critical {
            AlertType::Critical
        } else {
            AlertType::Warning
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Warning => "warning",
            AlertType::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-organization notification preferences. Owned by the configuration
/// subsystem; the gateway only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    pub email_enabled: bool,
    #[serde(default)]
    pub email_recipients: Vec<String>,
    pub push_enabled: bool,
    pub critical_alerts: bool,
    pub warning_alerts: bool,
    #[serde(default = "default_template")]
    pub email_template: String,
}

fn default_template() -> String {
    DEFAULT_EMAIL_TEMPLATE.to_string()
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self::with_recipients(Vec::new())
    }
}

impl NotificationSettings {
    /// Fallback used when an organization has no stored settings.
    pub fn with_recipients(recipients: Vec<String>) -> Self {
        Self {
            email_enabled: true,
            email_recipients: recipients,
            push_enabled: true,
            critical_alerts: true,
            warning_alerts: true,
            email_template: default_template(),
        }
    }

    pub fn allows(&self, alert_type: AlertType) -> bool {
        match alert_type {
            AlertType::Critical => self.critical_alerts,
            AlertType::Warning => self.warning_alerts,
        }
    }

    pub fn wants_email(&self) -> bool {
        self.email_enabled
            && self
                .email_recipients
                .iter()
                .any(|address| !address.trim().is_empty())
    }
}

/// A level change that landed on warning or critical.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertTransition {
    pub instrument_id: String,
    pub organization_id: String,
    pub instrument_name: String,
    pub previous: AlertLevel,
    pub level: AlertLevel,
    pub value: f64,
    pub limit: f64,
    pub occurred_at: DateTime<Utc>,
}

impl AlertTransition {
    pub fn alert_type(&self) -> AlertType {
        AlertType::for_level(self.level)
    }

    pub fn timestamp(&self) -> String {
        self.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn render(&self, template: &str) -> String {
        template
            .replace("{chamber_name}", &self.instrument_name)
            .replace("{alert_type}", self.alert_type().as_str())
            .replace("{current_value}", &format_reading(self.value))
            .replace("{limit_value}", &format_reading(self.limit))
            .replace("{timestamp}", &self.timestamp())
    }

    pub fn email(&self, settings: &NotificationSettings) -> EmailMessage {
        let subject = match self.alert_type() {
            AlertType::Critical => format!("[CRITICAL] {} out of range", self.instrument_name),
            AlertType::Warning => format!("[WARNING] {} approaching limit", self.instrument_name),
        };
        EmailMessage {
            to: settings
                .email_recipients
                .iter()
                .map(|address| address.trim().to_string())
                .filter(|address| !address.is_empty())
                .collect(),
            subject,
            body: self.render(&settings.email_template),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotification {
    pub instrument_id: String,
    pub chamber_name: String,
    pub alert_type: AlertType,
    pub current_value: f64,
    pub limit_value: f64,
    pub timestamp: String,
}

impl From<&AlertTransition> for AlertNotification {
    fn from(transition: &AlertTransition) -> Self {
        Self {
            instrument_id: transition.instrument_id.clone(),
            chamber_name: transition.instrument_name.clone(),
            alert_type: transition.alert_type(),
            current_value: transition.value,
            limit_value: transition.limit,
            timestamp: transition.timestamp(),
        }
    }
}

fn format_reading(value: f64) -> String {
    format!("{value}")
}
