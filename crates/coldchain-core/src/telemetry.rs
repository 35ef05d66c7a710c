use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentType {
    #[default]
    Temperature,
    Pressure,
    Differential,
}

impl InstrumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Temperature => "temperature",
            InstrumentType::Pressure => "pressure",
            InstrumentType::Differential => "differential",
        }
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "temperature" => Ok(InstrumentType::Temperature),
            "pressure" => Ok(InstrumentType::Pressure),
            "differential" => Ok(InstrumentType::Differential),
            other => Err(format!("Unknown instrument type: {other}")),
        }
    }
}

/// Instrument creation request after tenant validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInstrument {
    pub organization_id: String,
    pub name: String,
    pub slug: String,
    pub instrument_type: InstrumentType,
    pub min_value: f64,
    pub max_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_status_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub slug: String,
    pub instrument_type: InstrumentType,
    pub min_value: f64,
    pub max_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_status_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentViewModel {
    pub instrument_id: String,
    pub slug: String,
    pub name: String,
    pub instrument_type: InstrumentType,
    pub min_value: f64,
    pub max_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_status_text: Option<String>,
    pub status: String,
    pub created_at: String,
}

impl From<&Instrument> for InstrumentViewModel {
    fn from(instrument: &Instrument) -> Self {
        Self {
            instrument_id: instrument.id.clone(),
            slug: instrument.slug.clone(),
            name: instrument.name.clone(),
            instrument_type: instrument.instrument_type,
            min_value: instrument.min_value,
            max_value: instrument.max_value,
            process_status_text: instrument.process_status_text.clone(),
            status: "normal".to_string(),
            created_at: instrument.created_at.to_rfc3339(),
        }
    }
}

/// One reading as sent by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingInput {
    pub instrument_id: String,
    #[serde(default)]
    pub instrument_name: String,
    pub value: f64,
    #[serde(default)]
    pub edit_value: Option<f64>,
    pub min_value: f64,
    pub max_value: f64,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub setpoint: Option<f64>,
    #[serde(default)]
    pub differential: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ReadingInput {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.instrument_id.trim().is_empty() {
            return Err("missing_instrument_id");
        }
        if !self.value.is_finite() || self.edit_value.is_some_and(|v| !v.is_finite()) {
            return Err("non_finite_value");
        }
        if !self.min_value.is_finite() || !self.max_value.is_finite() {
            return Err("non_finite_bounds");
        }
        if self.min_value > self.max_value {
            return Err("inverted_bounds");
        }
        Ok(())
    }

    /// Binds the reading to the authenticated organization, stamping receipt
    /// time when the agent did not supply one.
    pub fn into_event(self, organization_id: &str, received_at: DateTime<Utc>) -> ReadingEvent {
        let edit_value = self.edit_value.unwrap_or(self.value);
        let instrument_name = if self.instrument_name.trim().is_empty() {
            self.instrument_id.clone()
        } else {
            self.instrument_name
        };
        ReadingEvent {
            instrument_id: self.instrument_id,
            organization_id: organization_id.to_string(),
            instrument_name,
            value: self.value,
            edit_value,
            min_value: self.min_value,
            max_value: self.max_value,
            temperature: self.temperature,
            pressure: self.pressure,
            setpoint: self.setpoint,
            differential: self.differential,
            timestamp: self.timestamp.unwrap_or(received_at),
        }
    }
}

/// A reading bound to its organization. Broadcast as `TEMPERATURE_UPDATE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingEvent {
    pub instrument_id: String,
    pub organization_id: String,
    pub instrument_name: String,
    pub value: f64,
    pub edit_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setpoint: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub differential: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentUpdate {
    pub instrument_id: String,
    pub value: f64,
    pub edit_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setpoint: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub differential: Option<f64>,
    pub updated_at: String,
}

impl From<&ReadingEvent> for InstrumentUpdate {
    fn from(reading: &ReadingEvent) -> Self {
        let no_channels = reading.temperature.is_none()
            && reading.pressure.is_none()
            && reading.setpoint.is_none()
            && reading.differential.is_none();
        let temperature = if no_channels {
            Some(reading.edit_value)
        } else {
            reading.temperature
        };
        Self {
            instrument_id: reading.instrument_id.clone(),
            value: reading.value,
            edit_value: reading.edit_value,
            temperature,
            pressure: reading.pressure,
            setpoint: reading.setpoint,
            differential: reading.differential,
            updated_at: reading.timestamp.to_rfc3339(),
        }
    }
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "instrument".to_string()
    } else {
        slug
    }
}
