use chrono::{DateTime, Utc};
use coldchain_core::{Instrument, InstrumentType, NewInstrument, NotificationSettings, ReadingEvent};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

pub const COLDCHAIN_SCHEMA_VERSION: i64 = 1;

const MAX_SLUG_SUFFIX: u32 = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("organization not found: {0}")]
    OrganizationNotFound(String),
    #[error("no free slug for '{0}'")]
    SlugExhausted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Active,
    Invited,
    Suspended,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Invited => "invited",
            MembershipStatus::Suspended => "suspended",
        }
    }
}

pub struct ColdChainStore {
    conn: Connection,
}

impl ColdChainStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let current = self.schema_version()?;
        if current > COLDCHAIN_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: COLDCHAIN_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_coldchain_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn upsert_organization(&self, id: &str, name: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO organizations (id, name, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            ",
            params![id, name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn organization(&self, id: &str) -> Result<Option<Organization>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, created_at FROM organizations WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, name, created_at)| {
            Ok(Organization {
                id,
                name,
                created_at: parse_timestamp(created_at)?,
            })
        })
        .transpose()
    }

    pub fn upsert_membership(
        &self,
        user_id: &str,
        organization_id: &str,
        status: MembershipStatus,
    ) -> Result<(), StorageError> {
        if self.organization(organization_id)?.is_none() {
            return Err(StorageError::OrganizationNotFound(
                organization_id.to_string(),
            ));
        }
        self.conn.execute(
            "
            INSERT INTO memberships (user_id, organization_id, status, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, organization_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            ",
            params![
                user_id,
                organization_id,
                status.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn has_active_membership(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "
                SELECT 1 FROM memberships
                WHERE user_id = ?1 AND organization_id = ?2 AND status = 'active'
                ",
                params![user_id, organization_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Inserts the instrument, suffixing the slug (`-2`, `-3`, ...) when the
    /// organization already uses it.
    pub fn create_instrument(&self, new: &NewInstrument) -> Result<Instrument, StorageError> {
        if self.organization(&new.organization_id)?.is_none() {
            return Err(StorageError::OrganizationNotFound(
                new.organization_id.clone(),
            ));
        }
        let slug = self.free_slug(&new.organization_id, &new.slug)?;
        let instrument = Instrument {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: new.organization_id.clone(),
            name: new.name.clone(),
            slug,
            instrument_type: new.instrument_type,
            min_value: new.min_value,
            max_value: new.max_value,
            process_status_text: new.process_status_text.clone(),
            created_at: Utc::now(),
        };
        self.conn.execute(
            "
            INSERT INTO instruments (
                id,
                organization_id,
                name,
                slug,
                instrument_type,
                min_value,
                max_value,
                process_status_text,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                instrument.id,
                instrument.organization_id,
                instrument.name,
                instrument.slug,
                instrument.instrument_type.as_str(),
                instrument.min_value,
                instrument.max_value,
                instrument.process_status_text,
                instrument.created_at.to_rfc3339(),
            ],
        )?;
        Ok(instrument)
    }

    fn free_slug(&self, organization_id: &str, base: &str) -> Result<String, StorageError> {
        let mut candidate = base.to_string();
        for suffix in 2..=MAX_SLUG_SUFFIX {
            let taken = self
                .conn
                .query_row(
                    "SELECT 1 FROM instruments WHERE organization_id = ?1 AND slug = ?2",
                    params![organization_id, candidate],
                    |_| Ok(()),
                )
                .optional()?;
            if taken.is_none() {
                return Ok(candidate);
            }
            candidate = format!("{base}-{suffix}");
        }
        Err(StorageError::SlugExhausted(base.to_string()))
    }

    pub fn instrument(&self, id: &str) -> Result<Option<Instrument>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT id, organization_id, name, slug, instrument_type, min_value, max_value,
                       process_status_text, created_at
                FROM instruments
                WHERE id = ?1
                ",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((
            id,
            organization_id,
            name,
            slug,
            instrument_type,
            min_value,
            max_value,
            process_status_text,
            created_at,
        )) = row
        else {
            return Ok(None);
        };
        let instrument_type = instrument_type
            .parse::<InstrumentType>()
            .map_err(StorageError::Serialization)?;
        Ok(Some(Instrument {
            id,
            organization_id,
            name,
            slug,
            instrument_type,
            min_value,
            max_value,
            process_status_text,
            created_at: parse_timestamp(created_at)?,
        }))
    }

    /// Writes the whole batch in one transaction; either every reading lands
    /// or none does.
    pub fn insert_readings(&self, readings: &[ReadingEvent]) -> Result<usize, StorageError> {
        if readings.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut statement = tx.prepare(
                "
                INSERT INTO readings (
                    instrument_id,
                    organization_id,
                    value,
                    edit_value,
                    min_value,
                    max_value,
                    temperature,
                    pressure,
                    setpoint,
                    differential,
                    recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ",
            )?;
            for reading in readings {
                statement.execute(params![
                    reading.instrument_id,
                    reading.organization_id,
                    reading.value,
                    reading.edit_value,
                    reading.min_value,
                    reading.max_value,
                    reading.temperature,
                    reading.pressure,
                    reading.setpoint,
                    reading.differential,
                    reading.timestamp.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(readings.len())
    }

    pub fn reading_count(&self, instrument_id: &str) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM readings WHERE instrument_id = ?1",
            [instrument_id],
            |row| row.get(0),
        )?)
    }

    pub fn notification_settings(
        &self,
        organization_id: &str,
    ) -> Result<Option<NotificationSettings>, StorageError> {
        let raw = self
            .conn
            .query_row(
                "SELECT settings_json FROM notification_settings WHERE organization_id = ?1",
                [organization_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|err| StorageError::Serialization(err.to_string()))
        })
        .transpose()
    }

    pub fn upsert_notification_settings(
        &self,
        organization_id: &str,
        settings: &NotificationSettings,
    ) -> Result<(), StorageError> {
        let settings_json = serde_json::to_string(settings)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO notification_settings (organization_id, settings_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(organization_id) DO UPDATE SET
                settings_json = excluded.settings_json,
                updated_at = excluded.updated_at
            ",
            params![organization_id, settings_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
