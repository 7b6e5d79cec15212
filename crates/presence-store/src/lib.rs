//! presence-store — Durable local storage of enrolled face descriptors.
//!
//! One SQLite table keyed by a generated record id, with a secondary index on
//! `(user_id, user_type)`. The connection is opened lazily on first use and
//! shared by every caller for the lifetime of the store.

use chrono::Utc;
use presence_core::{Descriptor, FaceDescriptor, Subject, UserType};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS face_descriptors (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        user_type TEXT NOT NULL,
        descriptor BLOB NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_face_descriptors_subject
        ON face_descriptors(user_id, user_type);
";

const SELECT_COLUMNS: &str = "SELECT id, user_id, user_type, descriptor, timestamp FROM face_descriptors";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("descriptor store unavailable: {0}")]
    Unavailable(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("corrupt descriptor row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    /// Private in-memory database, gone when the store is dropped.
    Memory,
}

/// Row as read from SQLite, before validation.
struct RawRow {
    id: String,
    user_id: String,
    user_type: String,
    descriptor: Vec<u8>,
    timestamp: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            user_type: row.get(2)?,
            descriptor: row.get(3)?,
            timestamp: row.get(4)?,
        })
    }

    fn into_record(self) -> Result<FaceDescriptor, StoreError> {
        let user_type: UserType = self.user_type.parse().map_err(|e: presence_core::UserTypeParseError| {
            StoreError::Corrupt {
                id: self.id.clone(),
                reason: e.to_string(),
            }
        })?;
        let descriptor = Descriptor::from_le_bytes(&self.descriptor).ok_or_else(|| StoreError::Corrupt {
            id: self.id.clone(),
            reason: format!("descriptor blob of {} bytes is not a float array", self.descriptor.len()),
        })?;
        Ok(FaceDescriptor {
            id: self.id,
            user_id: self.user_id,
            user_type,
            descriptor,
            timestamp: self.timestamp,
        })
    }
}

/// Enrolled descriptor storage.
pub struct DescriptorStore {
    location: StoreLocation,
    conn: OnceCell<Connection>,
    /// Last id stamp handed out; keeps ids unique within this handle.
    last_stamp: AtomicI64,
}

impl DescriptorStore {
    /// Store backed by a database file. Nothing is opened until first use.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_location(StoreLocation::File(path.into()))
    }

    pub fn in_memory() -> Self {
        Self::with_location(StoreLocation::Memory)
    }

    pub fn with_location(location: StoreLocation) -> Self {
        Self {
            location,
            conn: OnceCell::new(),
            last_stamp: AtomicI64::new(0),
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Shared connection, opening it and creating the schema on first use.
    ///
    /// A failed open leaves the cell empty so the next call retries.
    async fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn
            .get_or_try_init(|| async {
                let conn = match &self.location {
                    StoreLocation::File(path) => {
                        ensure_parent_dir(path)?;
                        Connection::open(path).await
                    }
                    StoreLocation::Memory => Connection::open_in_memory().await,
                }
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

                conn.call(|conn| {
                    conn.execute_batch(SCHEMA)?;
                    Ok(())
                })
                .await
                .map_err(|e| StoreError::Unavailable(format!("schema setup failed: {e}")))?;

                tracing::info!(location = ?self.location, "descriptor store opened");
                Ok(conn)
            })
            .await
    }

    /// Strictly increasing nanosecond stamp for record ids.
    fn next_stamp(&self) -> i64 {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1000));
        let prev = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| Some(now.max(prev + 1)))
            .unwrap_or(now);
        now.max(prev + 1)
    }

    /// Persist one descriptor for `subject`. Duplicates are expected.
    pub async fn add(&self, subject: &Subject, descriptor: &Descriptor) -> Result<FaceDescriptor, StoreError> {
        let conn = self.conn().await?;
        let record = FaceDescriptor {
            id: format!("{}_{}", subject.user_id, self.next_stamp()),
            user_id: subject.user_id.clone(),
            user_type: subject.user_type,
            descriptor: descriptor.clone(),
            timestamp: Utc::now().timestamp_millis(),
        };

        let id = record.id.clone();
        let user_id = record.user_id.clone();
        let user_type = record.user_type.as_str();
        let blob = record.descriptor.to_le_bytes();
        let timestamp = record.timestamp;
        conn.call(move |conn| {
            conn.execute(
                "INSERT INTO face_descriptors (id, user_id, user_type, descriptor, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, user_id, user_type, blob, timestamp],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(id = %record.id, subject = %subject, dims = record.descriptor.len(), "descriptor stored");
        Ok(record)
    }

    /// Every descriptor enrolled for `subject`, oldest first. Empty if none.
    pub async fn get_all_for_user(&self, subject: &Subject) -> Result<Vec<FaceDescriptor>, StoreError> {
        let conn = self.conn().await?;
        let user_id = subject.user_id.clone();
        let user_type = subject.user_type.as_str();
        let rows = conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE user_id = ?1 AND user_type = ?2 ORDER BY timestamp, id"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![user_id, user_type], RawRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RawRow::into_record).collect()
    }

    /// Snapshot of every enrolled descriptor across all users.
    pub async fn get_all(&self) -> Result<Vec<FaceDescriptor>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY timestamp, id"))?;
                let rows = stmt
                    .query_map([], RawRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RawRow::into_record).collect()
    }

    /// Delete every descriptor for `subject`. Returns how many were removed.
    pub async fn remove_all_for_user(&self, subject: &Subject) -> Result<usize, StoreError> {
        let conn = self.conn().await?;
        let user_id = subject.user_id.clone();
        let user_type = subject.user_type.as_str();
        let removed = conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM face_descriptors WHERE user_id = ?1 AND user_type = ?2",
                    rusqlite::params![user_id, user_type],
                )?;
                Ok(n)
            })
            .await?;
        tracing::info!(subject = %subject, removed, "descriptors removed");
        Ok(removed)
    }

    /// Total number of stored descriptors.
    pub async fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn().await?;
        let n = conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM face_descriptors", [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Enrolled subjects with their descriptor counts.
    pub async fn subjects(&self) -> Result<Vec<(Subject, usize)>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, user_type, COUNT(*) FROM face_descriptors
                     GROUP BY user_id, user_type ORDER BY user_type, user_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(user_id, user_type, n)| {
                let user_type = user_type.parse::<UserType>().map_err(|e| StoreError::Corrupt {
                    id: user_id.clone(),
                    reason: e.to_string(),
                })?;
                Ok((Subject::new(user_id, user_type), usize::try_from(n).unwrap_or(0)))
            })
            .collect()
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Unavailable(format!("cannot create {}: {e}", parent.display())))?;
    }
    Ok(())
}
