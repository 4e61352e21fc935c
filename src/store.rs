//! Fingerprint index persistence
//!
//! [`IndexStore`] is the narrow contract the engine relies on; the SQLite
//! implementation is the embedded default. Lookups run against a covering
//! index on `hash`, so their cost is proportional to the output. Track ids
//! are monotonic and never reused.

use crate::config::IndexConfig;
use crate::error::EngineError;
use crate::fingerprint::Landmark;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Caller-supplied track metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMeta {
    pub title: String,
    pub artist: String,
    /// Spectrogram frames covered by the track.
    pub duration_frames: u32,
}

/// A stored track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: i64,
    pub title: String,
    pub artist: String,
    pub duration_frames: u32,
    pub created_at: DateTime<Utc>,
    pub fingerprint_count: u64,
}

/// One row of a bulk hash lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashHit {
    pub hash: u32,
    pub track_id: i64,
    pub anchor_frame: u32,
}

/// Index size counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub tracks: u64,
    pub fingerprints: u64,
    pub bytes: u64,
}

/// Persistence contract for fingerprint records and track metadata.
///
/// Implementations enforce single-writer, multi-reader access internally.
/// `delete_track` must be idempotent and must remove the track's
/// fingerprints with it.
pub trait IndexStore: Send + Sync {
    fn create_track(&self, meta: &TrackMeta) -> Result<i64, EngineError>;

    /// Insert fingerprints for a track. Batches are committed as single
    /// transactional units.
    fn insert_fingerprints(&self, track_id: i64, landmarks: &[Landmark])
        -> Result<usize, EngineError>;

    fn delete_track(&self, track_id: i64) -> Result<(), EngineError>;

    fn lookup(&self, hash: u32) -> Result<Vec<(i64, u32)>, EngineError>;

    /// Bulk lookup. Duplicate input hashes are queried once.
    fn lookup_many(&self, hashes: &[u32]) -> Result<Vec<HashHit>, EngineError>;

    fn get_track(&self, track_id: i64) -> Result<Option<Track>, EngineError>;

    fn list_tracks(&self) -> Result<Vec<Track>, EngineError>;

    fn stats(&self) -> Result<StoreStats, EngineError>;

    /// Reclaim space and refresh query planner statistics. Semantics of the
    /// stored data are unchanged.
    fn optimize(&self) -> Result<(), EngineError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tracks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    artist TEXT NOT NULL,
    duration_frames INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    fingerprint_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS fingerprints (
    hash INTEGER NOT NULL,
    anchor_time INTEGER NOT NULL,
    track_id INTEGER NOT NULL REFERENCES tracks(id)
);
CREATE INDEX IF NOT EXISTS idx_fingerprints_hash
    ON fingerprints(hash, track_id, anchor_time);
";

/// SQLite-backed [`IndexStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    batch_size: usize,
}

impl SqliteStore {
    /// Open (or create) the index at `cfg.storage_path`. ":memory:" opens a
    /// private in-memory index.
    pub fn open(cfg: &IndexConfig) -> Result<Self, EngineError> {
        let conn = if cfg.storage_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(&cfg.storage_path)?
        };
        // WAL keeps readers unblocked during an ingest; in-memory databases
        // report their own journal mode, which is fine. FULL sync makes a
        // committed ingest survive power loss.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            batch_size: cfg.batch_size.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn track_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        duration_frames: row.get(3)?,
        created_at: row.get(4)?,
        fingerprint_count: row.get(5)?,
    })
}

const TRACK_COLUMNS: &str = "id, title, artist, duration_frames, created_at, fingerprint_count";

impl IndexStore for SqliteStore {
    fn create_track(&self, meta: &TrackMeta) -> Result<i64, EngineError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tracks (title, artist, duration_frames, created_at, fingerprint_count)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![meta.title, meta.artist, meta.duration_frames, Utc::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn insert_fingerprints(
        &self,
        track_id: i64,
        landmarks: &[Landmark],
    ) -> Result<usize, EngineError> {
        let mut conn = self.lock();
        let mut inserted = 0;
        for chunk in landmarks.chunks(self.batch_size) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO fingerprints (hash, anchor_time, track_id) VALUES (?1, ?2, ?3)",
                )?;
                for lm in chunk {
                    stmt.execute(params![lm.hash, lm.anchor_frame, track_id])?;
                }
            }
            tx.execute(
                "UPDATE tracks SET fingerprint_count = fingerprint_count + ?1 WHERE id = ?2",
                params![chunk.len() as i64, track_id],
            )?;
            tx.commit()?;
            inserted += chunk.len();
        }
        Ok(inserted)
    }

    fn delete_track(&self, track_id: i64) -> Result<(), EngineError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM fingerprints WHERE track_id = ?1", [track_id])?;
        tx.execute("DELETE FROM tracks WHERE id = ?1", [track_id])?;
        tx.commit()?;
        Ok(())
    }

    fn lookup(&self, hash: u32) -> Result<Vec<(i64, u32)>, EngineError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT track_id, anchor_time FROM fingerprints WHERE hash = ?1",
        )?;
        let rows = stmt.query_map([hash], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn lookup_many(&self, hashes: &[u32]) -> Result<Vec<HashHit>, EngineError> {
        let mut unique = hashes.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT track_id, anchor_time FROM fingerprints WHERE hash = ?1",
        )?;
        let mut hits = Vec::new();
        for &hash in &unique {
            let rows = stmt.query_map([hash], |row| {
                Ok(HashHit {
                    hash,
                    track_id: row.get(0)?,
                    anchor_frame: row.get(1)?,
                })
            })?;
            for hit in rows {
                hits.push(hit?);
            }
        }
        Ok(hits)
    }

    fn get_track(&self, track_id: i64) -> Result<Option<Track>, EngineError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?1"
        ))?;
        Ok(stmt.query_row([track_id], track_from_row).optional()?)
    }

    fn list_tracks(&self) -> Result<Vec<Track>, EngineError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {TRACK_COLUMNS} FROM tracks ORDER BY id"))?;
        let rows = stmt.query_map([], track_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn stats(&self) -> Result<StoreStats, EngineError> {
        let conn = self.lock();
        let tracks: u64 = conn.query_row("SELECT COUNT(*) FROM tracks", [], |r| r.get(0))?;
        let fingerprints: u64 =
            conn.query_row("SELECT COUNT(*) FROM fingerprints", [], |r| r.get(0))?;
        let page_count: u64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: u64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(StoreStats {
            tracks,
            fingerprints,
            bytes: page_count * page_size,
        })
    }

    fn optimize(&self) -> Result<(), EngineError> {
        let conn = self.lock();
        conn.execute_batch("ANALYZE; VACUUM;")?;
        Ok(())
    }
}
