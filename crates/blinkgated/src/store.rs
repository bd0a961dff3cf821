use async_trait::async_trait;
use blinkgate_core::{
    AttendanceSink, EnrollmentRecord, EnrollmentStore, FaceEmbedding, FailureReason,
    LivenessPolicy, StoreFault, VerificationMethod, VerificationOutcome,
};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

/// Upper bound on a stored embedding's dimension.
const MAX_EMBEDDING_DIM: usize = 4096;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed (key mismatch or corrupted data)")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0}")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("user {user} is enrolled with {enrolled}, cannot append {incoming}; re-enroll instead")]
    ModelVersionConflict {
        user: String,
        enrolled: String,
        incoming: String,
    },
    #[error("corrupt attendance row: {0}")]
    CorruptRow(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// How a new reference embedding relates to existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollMode {
    /// Drop every existing reference for the user first.
    Replace,
    /// Add another reference; the model version must match the existing ones.
    Append,
}

/// SQLite-backed enrollment and attendance storage.
///
/// Reference embeddings are encrypted with AES-256-GCM before storage and
/// decrypted on retrieval. A per-installation 32-byte key is generated at
/// first use and stored at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct BiometricStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl BiometricStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/blinkgate"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS users (
                     user TEXT PRIMARY KEY,
                     model_version TEXT NOT NULL,
                     required_blinks INTEGER NOT NULL,
                     updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS enrollments (
                     id TEXT PRIMARY KEY,
                     user TEXT NOT NULL REFERENCES users(user) ON DELETE CASCADE,
                     label TEXT NOT NULL,
                     embedding BLOB NOT NULL,
                     dimension INTEGER NOT NULL,
                     model_version TEXT NOT NULL,
                     quality_score REAL NOT NULL DEFAULT 0.0,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_enrollments_user ON enrollments(user);
                 CREATE TABLE IF NOT EXISTS attendance (
                     id TEXT PRIMARY KEY,
                     user TEXT NOT NULL,
                     checked_in_at TEXT NOT NULL,
                     overall_accepted INTEGER NOT NULL,
                     face_accepted INTEGER NOT NULL,
                     liveness_accepted INTEGER NOT NULL,
                     score REAL,
                     blink_count INTEGER NOT NULL,
                     required_blinks INTEGER NOT NULL,
                     reasons TEXT NOT NULL,
                     method TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_user ON attendance(user, checked_in_at);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Store a reference embedding for a user. Returns the generated UUID.
    pub async fn enroll(
        &self,
        user: &str,
        label: &str,
        embedding: &FaceEmbedding,
        quality_score: f32,
        required_blinks: u32,
        mode: EnrollMode,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        // Encrypt before entering the SQLite closure
        validate_embedding_values(&embedding.values)?;
        let blob = self.encrypt_embedding(&embedding.values)?;
        let dimension = embedding.dimension() as i64;
        let model_version = embedding.model_version.clone();

        let id_clone = id.clone();
        let user = user.to_string();
        let label = label.to_string();

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let existing: Option<String> = tx
                    .query_row(
                        "SELECT model_version FROM users WHERE user = ?1",
                        [&user],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                match (mode, existing) {
                    (EnrollMode::Append, Some(enrolled)) if enrolled != model_version => {
                        return Ok(Err(StoreError::ModelVersionConflict {
                            user,
                            enrolled,
                            incoming: model_version,
                        }));
                    }
                    (EnrollMode::Replace, Some(_)) => {
                        tx.execute("DELETE FROM enrollments WHERE user = ?1", [&user])?;
                    }
                    _ => {}
                }

                tx.execute(
                    "INSERT INTO users (user, model_version, required_blinks, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user) DO UPDATE SET
                         model_version = excluded.model_version,
                         required_blinks = excluded.required_blinks,
                         updated_at = excluded.updated_at",
                    rusqlite::params![user, model_version, required_blinks, now],
                )?;
                tx.execute(
                    "INSERT INTO enrollments (id, user, label, embedding, dimension, model_version, quality_score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![id_clone, user, label, blob, dimension, model_version, quality_score, now],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?;
        outcome?;

        Ok(id)
    }

    /// Full enrollment record for a user, or `None` if not enrolled.
    pub async fn get_enrollment(&self, user: &str) -> Result<Option<EnrollmentRecord>, StoreError> {
        let user_id = user.to_string();
        let user = user_id.clone();

        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        type Row = (Vec<u8>, i64, String);
        let fetched: Option<(String, u32, Vec<Row>)> = self
            .conn
            .call(move |conn| {
                let header = conn
                    .query_row(
                        "SELECT model_version, required_blinks FROM users WHERE user = ?1",
                        [&user],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some((model_version, required_blinks)) = header else {
                    return Ok(None);
                };

                let mut stmt = conn.prepare(
                    "SELECT embedding, dimension, model_version
                     FROM enrollments WHERE user = ?1 ORDER BY created_at, rowid",
                )?;
                let rows = stmt.query_map([&user], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                let rows = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(Some((model_version, required_blinks, rows)))
            })
            .await?;

        let Some((model_version, required_blinks, rows)) = fetched else {
            return Ok(None);
        };

        let mut embeddings = Vec::with_capacity(rows.len());
        for (blob, dimension, version) in rows {
            let values = self.decrypt_embedding(&blob, dimension as usize)?;
            embeddings.push(FaceEmbedding::new(values, version));
        }

        let record = EnrollmentRecord::new(user_id, model_version, embeddings)
            .with_liveness(LivenessPolicy { required_blinks });
        Ok(Some(record))
    }

    /// List references for a user (metadata only, no embeddings).
    pub async fn list_by_user(&self, user: &str) -> Result<Vec<EnrollmentInfo>, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, label, model_version, dimension, quality_score, created_at
                     FROM enrollments WHERE user = ?1 ORDER BY created_at, rowid",
                )?;
                let rows = stmt.query_map([&user], |row| {
                    Ok(EnrollmentInfo {
                        id: row.get(0)?,
                        label: row.get(1)?,
                        model_version: row.get(2)?,
                        dimension: row.get(3)?,
                        quality_score: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove every reference for a user. Attendance history is kept.
    pub async fn remove_user(&self, user: &str) -> Result<bool, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM enrollments WHERE user = ?1", [&user])?;
                let affected = tx.execute("DELETE FROM users WHERE user = ?1", [&user])?;
                tx.commit()?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count enrolled users and stored references.
    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        self.conn
            .call(|conn| {
                let users: u64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                let enrollments: u64 =
                    conn.query_row("SELECT COUNT(*) FROM enrollments", [], |row| row.get(0))?;
                let attendance: u64 =
                    conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
                Ok(StoreCounts {
                    users,
                    enrollments,
                    attendance,
                })
            })
            .await
            .map_err(StoreError::from)
    }

    /// Append an attendance record for a finished check-in. Returns its UUID.
    pub async fn record_attendance(&self, outcome: &VerificationOutcome) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let reasons: Vec<&str> = outcome.reasons.iter().map(|r| r.code()).collect();
        let reasons = serde_json::to_string(&reasons)
            .map_err(|e| StoreError::CorruptRow(e.to_string()))?;
        let row = (
            id.clone(),
            outcome.user_id.clone(),
            outcome.completed_at.to_rfc3339(),
            outcome.overall_accepted,
            outcome.face_accepted,
            outcome.liveness_accepted,
            outcome.score.map(f64::from),
            outcome.blink_count as i64,
            outcome.required_blinks,
            reasons,
            outcome.method().as_str(),
        );

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (id, user, checked_in_at, overall_accepted, face_accepted,
                         liveness_accepted, score, blink_count, required_blinks, reasons, method)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7, row.8, row.9, row.10
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Attendance records for a user, newest first.
    pub async fn attendance_history(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let user = user.to_string();
        let limit = limit as i64;

        type Raw = (String, String, String, bool, bool, bool, Option<f64>, i64, u32, String, String);
        let rows: Vec<Raw> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user, checked_in_at, overall_accepted, face_accepted, liveness_accepted,
                            score, blink_count, required_blinks, reasons, method
                     FROM attendance WHERE user = ?1
                     ORDER BY checked_in_at DESC, rowid DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![user, limit], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter()
            .map(
                |(id, user, checked_in_at, overall, face, liveness, score, blinks, required, reasons, method)| {
                    let codes: Vec<String> = serde_json::from_str(&reasons)
                        .map_err(|e| StoreError::CorruptRow(format!("reasons: {e}")))?;
                    let reasons = codes
                        .iter()
                        .map(|c| {
                            FailureReason::from_code(c)
                                .ok_or_else(|| StoreError::CorruptRow(format!("unknown reason {c}")))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let method = VerificationMethod::parse(&method)
                        .ok_or_else(|| StoreError::CorruptRow(format!("unknown method {method}")))?;
                    Ok(AttendanceRecord {
                        id,
                        user,
                        checked_in_at,
                        overall_accepted: overall,
                        face_accepted: face,
                        liveness_accepted: liveness,
                        score,
                        blink_count: blinks as u64,
                        required_blinks: required,
                        reasons,
                        method,
                    })
                },
            )
            .collect()
    }

    /// Total and accepted check-ins for a user.
    pub async fn attendance_summary(&self, user: &str) -> Result<AttendanceSummary, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let (total, successful): (u64, u64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(overall_accepted), 0) FROM attendance WHERE user = ?1",
                    [&user],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(AttendanceSummary { total, successful })
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt an embedding blob and check it holds exactly `dimension` values.
    fn decrypt_embedding(&self, blob: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding_strict(&plaintext, dimension)
    }
}

#[async_trait]
impl EnrollmentStore for BiometricStore {
    async fn get_enrollment(&self, user_id: &str) -> Result<Option<EnrollmentRecord>, StoreFault> {
        BiometricStore::get_enrollment(self, user_id)
            .await
            .map_err(|e| StoreFault::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl AttendanceSink for BiometricStore {
    async fn persist_attendance(&self, outcome: &VerificationOutcome) -> Result<(), StoreFault> {
        let id = self
            .record_attendance(outcome)
            .await
            .map_err(|e| StoreFault::Unavailable(e.to_string()))?;
        tracing::debug!(id = %id, user = %outcome.user_id, "attendance recorded");
        Ok(())
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding_strict(bytes: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 || bytes.len() / 4 != dimension {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(dimension);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }

    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.is_empty() || values.len() > MAX_EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about a stored reference embedding (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnrollmentInfo {
    pub id: String,
    pub label: String,
    pub model_version: String,
    pub dimension: u32,
    pub quality_score: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StoreCounts {
    pub users: u64,
    pub enrollments: u64,
    pub attendance: u64,
}

/// One stored check-in.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub user: String,
    pub checked_in_at: String,
    pub overall_accepted: bool,
    pub face_accepted: bool,
    pub liveness_accepted: bool,
    pub score: Option<f64>,
    pub blink_count: u64,
    pub required_blinks: u32,
    pub reasons: Vec<FailureReason>,
    pub method: VerificationMethod,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AttendanceSummary {
    pub total: u64,
    pub successful: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 512;

    fn ramp(version: &str) -> FaceEmbedding {
        FaceEmbedding::new((0..DIM).map(|i| i as f32 / DIM as f32).collect(), version)
    }

    fn outcome(user: &str, accepted: bool, reasons: Vec<FailureReason>) -> VerificationOutcome {
        VerificationOutcome {
            user_id: user.to_string(),
            face_accepted: accepted,
            liveness_accepted: true,
            overall_accepted: accepted,
            reasons,
            score: Some(if accepted { 0.82 } else { 0.31 }),
            threshold: 0.6,
            blink_count: 2,
            required_blinks: 2,
            frames_processed: 40,
            frames_dropped: 0,
            completed_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();
        let embedding = ramp("w600k_r50@4c06341c33c2");

        let id = store
            .enroll("alice", "default", &embedding, 0.85, 3, EnrollMode::Replace)
            .await
            .unwrap();
        assert!(!id.is_empty());

        let record = store.get_enrollment("alice").await.unwrap().unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.model_version, "w600k_r50@4c06341c33c2");
        assert_eq!(record.liveness.required_blinks, 3);
        assert_eq!(record.embeddings.len(), 1);
        for (orig, rec) in embedding.values.iter().zip(record.embeddings[0].values.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
    }

    #[tokio::test]
    async fn test_unknown_user_is_none() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();
        assert!(store.get_enrollment("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_drops_old_references() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();

        store
            .enroll("alice", "old", &ramp("v1"), 0.9, 2, EnrollMode::Replace)
            .await
            .unwrap();
        store
            .enroll("alice", "new", &ramp("v2"), 0.9, 2, EnrollMode::Replace)
            .await
            .unwrap();

        let record = store.get_enrollment("alice").await.unwrap().unwrap();
        assert_eq!(record.model_version, "v2");
        assert_eq!(record.embeddings.len(), 1);
        assert_eq!(record.embeddings[0].model_version, "v2");
    }

    #[tokio::test]
    async fn test_append_same_version() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();

        store
            .enroll("alice", "normal", &ramp("v1"), 0.9, 2, EnrollMode::Append)
            .await
            .unwrap();
        store
            .enroll("alice", "glasses", &ramp("v1"), 0.8, 2, EnrollMode::Append)
            .await
            .unwrap();

        let record = store.get_enrollment("alice").await.unwrap().unwrap();
        assert_eq!(record.embeddings.len(), 2);

        let listed = store.list_by_user("alice").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].label, "normal");
        assert_eq!(listed[1].label, "glasses");
        assert_eq!(listed[0].dimension, DIM as u32);
    }

    #[tokio::test]
    async fn test_append_rejects_other_version() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();

        store
            .enroll("alice", "normal", &ramp("v1"), 0.9, 2, EnrollMode::Append)
            .await
            .unwrap();
        let err = store
            .enroll("alice", "glasses", &ramp("v2"), 0.8, 2, EnrollMode::Append)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ModelVersionConflict { .. }));

        let record = store.get_enrollment("alice").await.unwrap().unwrap();
        assert_eq!(record.embeddings.len(), 1);
        assert_eq!(record.model_version, "v1");
    }

    #[tokio::test]
    async fn test_remove_user_is_isolated() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();

        store
            .enroll("alice", "default", &ramp("v1"), 0.9, 2, EnrollMode::Replace)
            .await
            .unwrap();
        store
            .enroll("bob", "default", &ramp("v1"), 0.9, 2, EnrollMode::Replace)
            .await
            .unwrap();

        assert!(!store.remove_user("carol").await.unwrap());
        assert!(store.remove_user("alice").await.unwrap());
        assert!(store.get_enrollment("alice").await.unwrap().is_none());
        assert!(store.get_enrollment("bob").await.unwrap().is_some());

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.users, 1);
        assert_eq!(counts.enrollments, 1);
    }

    #[tokio::test]
    async fn test_rejects_non_finite_embedding() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();
        let mut bad = ramp("v1");
        bad.values[42] = f32::NAN;

        let err = store
            .enroll("alice", "default", &bad, 0.9, 2, EnrollMode::Replace)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingValue));
        assert!(store.get_enrollment("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_empty_embedding() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();
        let empty = FaceEmbedding::new(vec![], "v1");
        let err = store
            .enroll("alice", "default", &empty, 0.9, 2, EnrollMode::Replace)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingDim(0)));
    }

    #[test]
    fn test_strict_rejects_wrong_length() {
        let bytes = embedding_to_bytes(&[0.5; 8]);
        let err = bytes_to_embedding_strict(&bytes, 16).unwrap_err();
        assert!(matches!(err, StoreError::InvalidBlob(32)));
    }

    #[test]
    fn test_strict_rejects_infinity() {
        let bytes = embedding_to_bytes(&[0.5, f32::INFINITY]);
        let err = bytes_to_embedding_strict(&bytes, 2).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingValue));
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        // Encrypt with one key, try to decrypt with another
        let store1 = BiometricStore {
            conn: tokio_rusqlite::Connection::open(Path::new(":memory:"))
                .await
                .unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = BiometricStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };

        let values = ramp("v1").values;
        let blob = store1.encrypt_embedding(&values).unwrap();
        assert_eq!(store1.decrypt_embedding(&blob, DIM).unwrap(), values);
        assert!(matches!(
            store2.decrypt_embedding(&blob, DIM),
            Err(StoreError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn test_key_file_persists() {
        let dir = std::env::temp_dir().join(format!("blinkgate-store-key-{}", uuid::Uuid::new_v4()));
        let db = dir.join("blinkgate.db");

        let first = BiometricStore::open(&db).await.unwrap();
        first
            .enroll("alice", "default", &ramp("v1"), 0.9, 2, EnrollMode::Replace)
            .await
            .unwrap();
        drop(first);

        let key = std::fs::metadata(dir.join(".key")).unwrap();
        assert_eq!(key.len(), 32);
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(key.permissions().mode() & 0o777, 0o600);

        let reopened = BiometricStore::open(&db).await.unwrap();
        let record = reopened.get_enrollment("alice").await.unwrap().unwrap();
        assert_eq!(record.embeddings[0].values, ramp("v1").values);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_attendance_history_newest_first() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();

        let mut first = outcome("alice", false, vec![FailureReason::LowSimilarityScore]);
        first.completed_at = chrono::Utc::now() - chrono::Duration::seconds(60);
        store.record_attendance(&first).await.unwrap();
        store.record_attendance(&outcome("alice", true, vec![])).await.unwrap();
        store.record_attendance(&outcome("bob", true, vec![])).await.unwrap();

        let history = store.attendance_history("alice", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].overall_accepted);
        assert_eq!(history[0].method, VerificationMethod::Both);
        assert!(!history[1].overall_accepted);
        assert_eq!(history[1].reasons, vec![FailureReason::LowSimilarityScore]);
        assert_eq!(history[1].method, VerificationMethod::Blink);

        let limited = store.attendance_history("alice", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(limited[0].overall_accepted);

        let summary = store.attendance_summary("alice").await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.successful, 1);
    }

    #[tokio::test]
    async fn test_attendance_keeps_missing_score() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();
        let mut cancelled = outcome("alice", false, vec![FailureReason::Cancelled]);
        cancelled.score = None;
        cancelled.liveness_accepted = false;
        store.record_attendance(&cancelled).await.unwrap();

        let history = store.attendance_history("alice", 5).await.unwrap();
        assert_eq!(history[0].score, None);
        assert_eq!(history[0].method, VerificationMethod::None);
        assert_eq!(history[0].reasons, vec![FailureReason::Cancelled]);
    }

    #[tokio::test]
    async fn test_store_traits() {
        let store = BiometricStore::open(Path::new(":memory:")).await.unwrap();
        store
            .enroll("alice", "default", &ramp("v1"), 0.9, 2, EnrollMode::Replace)
            .await
            .unwrap();

        let enrollments: &dyn EnrollmentStore = &store;
        assert!(enrollments.get_enrollment("alice").await.unwrap().is_some());

        let sink: &dyn AttendanceSink = &store;
        sink.persist_attendance(&outcome("alice", true, vec![]))
            .await
            .unwrap();
        assert_eq!(store.counts().await.unwrap().attendance, 1);
    }
}
