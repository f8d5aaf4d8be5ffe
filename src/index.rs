//! Archive index: durable records of recordings, their chunk byte ranges,
//! storage volumes and dependent snapshot artifacts.
//!
//! Backed by a bundled SQLite database. The writer owns the only insert path
//! for an open recording; the reconstruction engine and the capacity manager
//! read concurrently. All access is serialized at the connection, which is
//! fine for row-at-a-time CRUD on an appliance-scale archive.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

/// Folder layout under a volume mount point, fixed for the appliance:
/// `<mount>/gatevault/cameras/<cameraId>/video/<filename>`.
const BASE_FOLDER: &str = "gatevault";
const CAMERA_FOLDER: &str = "cameras";
const VAULT_FOLDER: &str = "video";
const SNAPSHOT_FOLDER: &str = "snapshots";

/// A mount point with its capacity policy.
#[derive(Debug, Clone)]
pub struct StorageVolume {
    pub id: i64,
    pub mount_point: PathBuf,
    /// Eviction floor: keep at least this many bytes free on the drive.
    pub min_free_bytes: u64,
    /// Eviction ceiling: archive usage may not exceed this (0 = unlimited).
    pub max_use_bytes: u64,
    pub active: bool,
}

impl StorageVolume {
    /// Directory holding a camera's recording files on this volume.
    pub fn vault_dir(&self, camera_id: &str) -> PathBuf {
        self.mount_point
            .join(BASE_FOLDER)
            .join(CAMERA_FOLDER)
            .join(camera_id)
            .join(VAULT_FOLDER)
    }

    /// Directory holding a camera's snapshot files on this volume.
    pub fn snapshot_dir(&self, camera_id: &str) -> PathBuf {
        self.mount_point
            .join(BASE_FOLDER)
            .join(CAMERA_FOLDER)
            .join(camera_id)
            .join(SNAPSHOT_FOLDER)
    }
}

/// One physical media file and its metadata.
#[derive(Debug, Clone)]
pub struct Recording {
    pub id: i64,
    pub camera_id: String,
    pub volume_id: i64,
    pub filename: String,
    /// Epoch milliseconds of the first chunk.
    pub start_date: i64,
    /// Epoch milliseconds one past the last chunk's duration.
    pub end_date: i64,
    pub duration_ms: i64,
    pub file_size: u64,
    pub init_size: u64,
    pub completed: bool,
}

impl Recording {
    pub fn file_path(&self, volume: &StorageVolume) -> PathBuf {
        volume.vault_dir(&self.camera_id).join(&self.filename)
    }
}

/// One fragment's placement inside a recording file.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub recording_id: i64,
    pub camera_id: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub duration_ms: i64,
    /// Epoch milliseconds of the fragment start.
    pub timestamp: i64,
    pub size: u64,
}

/// A still-image artifact tied to a recording, deleted with it on eviction.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: i64,
    pub recording_id: Option<i64>,
    pub camera_id: String,
    pub timestamp: i64,
    pub filename: String,
    pub file_size: u64,
}

impl Snapshot {
    pub fn file_path(&self, volume: &StorageVolume) -> PathBuf {
        volume.snapshot_dir(&self.camera_id).join(&self.filename)
    }
}

/// SQLite-backed archive index.
pub struct ArchiveIndex {
    conn: Mutex<Connection>,
}

impl ArchiveIndex {
    /// Open (creating if absent) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating index directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening archive index at {:?}", path))?;
        Self::init(conn)
    }

    /// In-memory index for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS volumes (
                id             INTEGER PRIMARY KEY,
                mount_point    TEXT    NOT NULL UNIQUE,
                min_free_bytes INTEGER NOT NULL DEFAULT 0,
                max_use_bytes  INTEGER NOT NULL DEFAULT 0,
                active         INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS recordings (
                id          INTEGER PRIMARY KEY,
                camera_id   TEXT    NOT NULL,
                volume_id   INTEGER NOT NULL REFERENCES volumes(id),
                filename    TEXT    NOT NULL,
                start_date  INTEGER NOT NULL,
                end_date    INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                file_size   INTEGER NOT NULL DEFAULT 0,
                init_size   INTEGER NOT NULL DEFAULT 0,
                completed   INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_recordings_volume_start
                ON recordings(volume_id, start_date);
            CREATE INDEX IF NOT EXISTS idx_recordings_camera_start
                ON recordings(camera_id, start_date);

            CREATE TABLE IF NOT EXISTS chunks (
                id           INTEGER PRIMARY KEY,
                recording_id INTEGER NOT NULL REFERENCES recordings(id) ON DELETE CASCADE,
                camera_id    TEXT    NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset   INTEGER NOT NULL,
                duration_ms  INTEGER NOT NULL,
                timestamp    INTEGER NOT NULL,
                size         INTEGER NOT NULL,
                UNIQUE (recording_id, start_offset)
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_camera_ts
                ON chunks(camera_id, timestamp);

            CREATE TABLE IF NOT EXISTS snapshots (
                id           INTEGER PRIMARY KEY,
                recording_id INTEGER REFERENCES recordings(id),
                camera_id    TEXT    NOT NULL,
                timestamp    INTEGER NOT NULL,
                filename     TEXT    NOT NULL,
                file_size    INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_recording
                ON snapshots(recording_id);
            "#,
        )
        .context("initializing archive index schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("archive index lock poisoned"))
    }

    // ── Volumes ──────────────────────────────────────────────────────

    /// Register (or update the policy of) the volume at `mount_point`.
    pub fn register_volume(
        &self,
        mount_point: &Path,
        min_free_bytes: u64,
        max_use_bytes: u64,
    ) -> Result<StorageVolume> {
        let conn = self.conn()?;
        let mount = mount_point.to_string_lossy().to_string();
        conn.execute(
            "INSERT INTO volumes (mount_point, min_free_bytes, max_use_bytes, active)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(mount_point) DO UPDATE
             SET min_free_bytes = ?2, max_use_bytes = ?3, active = 1",
            params![mount, min_free_bytes as i64, max_use_bytes as i64],
        )?;
        let volume = conn.query_row(
            "SELECT id, mount_point, min_free_bytes, max_use_bytes, active
             FROM volumes WHERE mount_point = ?1",
            params![mount],
            row_to_volume,
        )?;
        Ok(volume)
    }

    pub fn active_volumes(&self) -> Result<Vec<StorageVolume>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, mount_point, min_free_bytes, max_use_bytes, active
             FROM volumes WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_volume)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn volume(&self, id: i64) -> Result<Option<StorageVolume>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, mount_point, min_free_bytes, max_use_bytes, active
                 FROM volumes WHERE id = ?1",
                params![id],
                row_to_volume,
            )
            .optional()?)
    }

    /// Sum of recording file sizes on a volume (archive usage).
    pub fn usage_bytes(&self, volume_id: i64) -> Result<u64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(file_size), 0) FROM recordings WHERE volume_id = ?1",
            params![volume_id],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    // ── Recordings ───────────────────────────────────────────────────

    /// Create the row for a freshly opened recording file.
    pub fn create_recording(
        &self,
        camera_id: &str,
        volume_id: i64,
        filename: &str,
        start_date: i64,
        init_size: u64,
    ) -> Result<Recording> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO recordings
             (camera_id, volume_id, filename, start_date, end_date,
              duration_ms, file_size, init_size, completed)
             VALUES (?1, ?2, ?3, ?4, ?4, 0, ?5, ?5, 0)",
            params![camera_id, volume_id, filename, start_date, init_size as i64],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Recording {
            id,
            camera_id: camera_id.to_string(),
            volume_id,
            filename: filename.to_string(),
            start_date,
            end_date: start_date,
            duration_ms: 0,
            file_size: init_size,
            init_size,
            completed: false,
        })
    }

    /// Insert a chunk and roll the owning recording's running totals forward,
    /// in one transaction. Called once per appended fragment, after the bytes
    /// are durably written.
    pub fn append_chunk(&self, chunk: &Chunk) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chunks
             (recording_id, camera_id, start_offset, end_offset, duration_ms, timestamp, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chunk.recording_id,
                chunk.camera_id,
                chunk.start_offset as i64,
                chunk.end_offset as i64,
                chunk.duration_ms,
                chunk.timestamp,
                chunk.size as i64
            ],
        )?;
        tx.execute(
            "UPDATE recordings SET
               duration_ms = duration_ms + ?2,
               file_size   = file_size + ?3,
               end_date    = ?4
             WHERE id = ?1",
            params![
                chunk.recording_id,
                chunk.duration_ms,
                chunk.size as i64,
                chunk.timestamp + chunk.duration_ms
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Mark a recording completed. Idempotent.
    pub fn complete_recording(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE recordings SET completed = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Force-complete recordings left open by an abrupt termination.
    ///
    /// Their rows already reflect every durably written fragment (chunk rows
    /// are inserted only after the bytes), so nothing is lost; they simply
    /// become ordinary completed recordings that eviction may reclaim.
    pub fn complete_stale_open(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute("UPDATE recordings SET completed = 1 WHERE completed = 0", [])?;
        if n > 0 {
            info!(recordings = n, "force-completed stale open recordings");
        }
        Ok(n)
    }

    pub fn recording(&self, id: i64) -> Result<Option<Recording>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("{RECORDING_SELECT} WHERE id = ?1"),
                params![id],
                row_to_recording,
            )
            .optional()?)
    }

    /// Recordings for a camera overlapping `[from, to)`, oldest first.
    pub fn recordings_in_range(
        &self,
        camera_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Recording>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{RECORDING_SELECT}
             WHERE camera_id = ?1 AND end_date >= ?2 AND start_date < ?3
             ORDER BY start_date"
        ))?;
        let rows = stmt.query_map(params![camera_id, from, to], row_to_recording)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// A page of the oldest completed recordings on a volume.
    pub fn oldest_completed(
        &self,
        volume_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Recording>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{RECORDING_SELECT}
             WHERE volume_id = ?1 AND completed = 1
             ORDER BY start_date ASC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![volume_id, limit as i64, offset as i64],
            row_to_recording,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a recording's index rows (snapshots, chunks, recording) as one
    /// transaction. Backing files must already have been removed.
    pub fn delete_recording(&self, id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM snapshots WHERE recording_id = ?1", params![id])?;
        tx.execute("DELETE FROM chunks WHERE recording_id = ?1", params![id])?;
        tx.execute("DELETE FROM recordings WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // ── Chunks ───────────────────────────────────────────────────────

    /// Chunks for a camera whose timestamp falls in `[from, to)`, ordered by
    /// timestamp (ties by recording then offset). This ordering is the
    /// manifest builder's contract.
    pub fn chunks_in_range(&self, camera_id: &str, from: i64, to: i64) -> Result<Vec<Chunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT recording_id, camera_id, start_offset, end_offset,
                    duration_ms, timestamp, size
             FROM chunks
             WHERE camera_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
             ORDER BY timestamp, recording_id, start_offset",
        )?;
        let rows = stmt.query_map(params![camera_id, from, to], row_to_chunk)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All chunks of one recording in on-disk order.
    pub fn chunks_for_recording(&self, recording_id: i64) -> Result<Vec<Chunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT recording_id, camera_id, start_offset, end_offset,
                    duration_ms, timestamp, size
             FROM chunks WHERE recording_id = ?1 ORDER BY start_offset",
        )?;
        let rows = stmt.query_map(params![recording_id], row_to_chunk)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Snapshots ────────────────────────────────────────────────────

    pub fn add_snapshot(
        &self,
        recording_id: Option<i64>,
        camera_id: &str,
        timestamp: i64,
        filename: &str,
        file_size: u64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO snapshots (recording_id, camera_id, timestamp, filename, file_size)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![recording_id, camera_id, timestamp, filename, file_size as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn snapshots_for_recording(&self, recording_id: i64) -> Result<Vec<Snapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, recording_id, camera_id, timestamp, filename, file_size
             FROM snapshots WHERE recording_id = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![recording_id], |row| {
            Ok(Snapshot {
                id: row.get(0)?,
                recording_id: row.get(1)?,
                camera_id: row.get(2)?,
                timestamp: row.get(3)?,
                filename: row.get(4)?,
                file_size: row.get::<_, i64>(5)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

const RECORDING_SELECT: &str = "SELECT id, camera_id, volume_id, filename, start_date, end_date,
            duration_ms, file_size, init_size, completed
     FROM recordings";

fn row_to_volume(row: &rusqlite::Row<'_>) -> rusqlite::Result<StorageVolume> {
    Ok(StorageVolume {
        id: row.get(0)?,
        mount_point: PathBuf::from(row.get::<_, String>(1)?),
        min_free_bytes: row.get::<_, i64>(2)? as u64,
        max_use_bytes: row.get::<_, i64>(3)? as u64,
        active: row.get::<_, i64>(4)? != 0,
    })
}

fn row_to_recording(row: &rusqlite::Row<'_>) -> rusqlite::Result<Recording> {
    Ok(Recording {
        id: row.get(0)?,
        camera_id: row.get(1)?,
        volume_id: row.get(2)?,
        filename: row.get(3)?,
        start_date: row.get(4)?,
        end_date: row.get(5)?,
        duration_ms: row.get(6)?,
        file_size: row.get::<_, i64>(7)? as u64,
        init_size: row.get::<_, i64>(8)? as u64,
        completed: row.get::<_, i64>(9)? != 0,
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        recording_id: row.get(0)?,
        camera_id: row.get(1)?,
        start_offset: row.get::<_, i64>(2)? as u64,
        end_offset: row.get::<_, i64>(3)? as u64,
        duration_ms: row.get(4)?,
        timestamp: row.get(5)?,
        size: row.get::<_, i64>(6)? as u64,
    })
}
