//! Call Records Database
//!
//! SQLite-Persistenz für Anruf-Metadaten (ringing/active/ended).
//! Status-Änderungen schreibt nur die Session des Anrufers.

use crate::call::{CallId, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call record not found: {0}")]
    RecordNotFound(String),

    #[error("Corrupt call record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("Call record write did not complete: {0}")]
    WriteTask(String),
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Persistierter Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Missed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
            CallStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Missed | CallStatus::Failed
        )
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(CallStatus::Ringing),
            "active" => Ok(CallStatus::Active),
            "ended" => Ok(CallStatus::Ended),
            "missed" => Ok(CallStatus::Missed),
            "failed" => Ok(CallStatus::Failed),
            other => Err(format!("unknown call status '{}'", other)),
        }
    }
}

/// Eine Zeile der `calls`-Tabelle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Neuer Record im Status `ringing`
    pub fn ringing(id: CallId, caller_id: UserId, callee_id: UserId) -> Self {
        Self {
            id,
            caller_id,
            callee_id,
            status: CallStatus::Ringing,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
        }
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Create/Update-by-ID Persistenz für Call Records
pub trait CallRecordStore: Send + Sync {
    fn create(&self, record: &CallRecord) -> Result<(), DatabaseError>;

    /// `ringing` → `active`, setzt `answered_at`
    fn mark_active(&self, id: &CallId, answered_at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Setzt den Endstatus; bereits beendete Records bleiben unverändert
    fn finish(
        &self,
        id: &CallId,
        status: CallStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    fn get(&self, id: &CallId) -> Result<CallRecord, DatabaseError>;

    /// Neueste Anrufe zuerst
    fn recent(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError>;
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank für Call Records (Thread-safe durch Mutex)
pub struct CallRecordsDatabase {
    conn: Mutex<Connection>,
}

impl CallRecordsDatabase {
    /// Öffnet oder erstellt die Datenbank
    ///
    /// Ohne Pfad wird `calls.db` im App-Datenverzeichnis verwendet.
    pub fn open(path: Option<&Path>) -> Result<Self, DatabaseError> {
        let db_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_database_path()?,
        };

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call database at {:?}", db_path);

        let db = Self {
            conn: Mutex::new(Connection::open(&db_path)?),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-Memory Datenbank (Tests, flüchtige Sessions)
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn default_database_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs =
            directories::ProjectDirs::from("com", "kaufm", "call-app").ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        Ok(proj_dirs.data_dir().join("calls.db"))
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                callee_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                answered_at TEXT,
                ended_at TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_calls_started_at ON calls(started_at)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Markiert Anrufe eines früheren Prozesses als `failed`
    ///
    /// Eine Session überlebt keinen Neustart; was noch `ringing` oder
    /// `active` ist, wurde nie sauber beendet.
    pub fn fail_stale_calls(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE calls
            SET status = 'failed', ended_at = ?1
            WHERE status IN ('ringing', 'active')
            "#,
            params![Utc::now().to_rfc3339()],
        )?;

        if changed > 0 {
            tracing::info!("Marked {} stale call(s) as failed", changed);
        }
        Ok(changed)
    }

    fn get_inner(conn: &Connection, id: &CallId) -> Result<CallRecord, DatabaseError> {
        let raw = conn
            .query_row(
                r#"
                SELECT id, caller_id, callee_id, status, started_at, answered_at, ended_at
                FROM calls
                WHERE id = ?1
                "#,
                params![id.to_string()],
                RawRecord::from_row,
            )
            .optional()?;

        raw.ok_or_else(|| DatabaseError::RecordNotFound(id.to_string()))?
            .into_record()
    }
}

impl CallRecordStore for CallRecordsDatabase {
    fn create(&self, record: &CallRecord) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO calls (id, caller_id, callee_id, status, started_at, answered_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                record.id.to_string(),
                record.caller_id.as_str(),
                record.callee_id.as_str(),
                record.status.as_str(),
                record.started_at.to_rfc3339(),
                record.answered_at.map(|t| t.to_rfc3339()),
                record.ended_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn mark_active(&self, id: &CallId, answered_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE calls
            SET status = 'active', answered_at = ?2
            WHERE id = ?1 AND status = 'ringing'
            "#,
            params![id.to_string(), answered_at.to_rfc3339()],
        )?;

        if changed == 0 {
            // Existiert der Record überhaupt?
            Self::get_inner(&conn, id)?;
        }
        Ok(())
    }

    fn finish(
        &self,
        id: &CallId,
        status: CallStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE calls
            SET status = ?2, ended_at = ?3
            WHERE id = ?1 AND status IN ('ringing', 'active')
            "#,
            params![id.to_string(), status.as_str(), ended_at.to_rfc3339()],
        )?;

        if changed == 0 {
            let existing = Self::get_inner(&conn, id)?;
            tracing::debug!(
                "Call record {} already terminal ({}), ignoring {}",
                id,
                existing.status.as_str(),
                status.as_str()
            );
        }
        Ok(())
    }

    fn get(&self, id: &CallId) -> Result<CallRecord, DatabaseError> {
        let conn = self.conn.lock();
        Self::get_inner(&conn, id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, caller_id, callee_id, status, started_at, answered_at, ended_at
            FROM calls
            ORDER BY started_at DESC
            LIMIT ?1
            "#,
        )?;

        let raws = stmt
            .query_map(params![limit as i64], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<RawRecord>>>()?;

        raws.into_iter().map(RawRecord::into_record).collect()
    }
}

/// Zeile wie sie aus SQLite kommt, vor dem Parsen
struct RawRecord {
    id: String,
    caller_id: String,
    callee_id: String,
    status: String,
    started_at: String,
    answered_at: Option<String>,
    ended_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            caller_id: row.get(1)?,
            callee_id: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            answered_at: row.get(5)?,
            ended_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<CallRecord, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::CorruptRecord {
            id: self.id.clone(),
            reason,
        };
        let parse_time = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(e.to_string()))
        };

        Ok(CallRecord {
            id: self.id.parse().map_err(|e: uuid::Error| corrupt(e.to_string()))?,
            caller_id: UserId::new(self.caller_id.as_str()),
            callee_id: UserId::new(self.callee_id.as_str()),
            status: self.status.parse().map_err(corrupt)?,
            started_at: parse_time(&self.started_at)?,
            answered_at: self.answered_at.as_deref().map(parse_time).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
