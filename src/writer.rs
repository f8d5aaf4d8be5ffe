//! Segment writer: turns a stamped fragment stream into a growing media file
//! plus its chunk index rows.
//!
//! Ordering contract: bytes are written and flushed before the chunk row is
//! inserted, so every indexed byte range is durable. The recording row's
//! `file_size` therefore always equals `init_size` plus the sum of its chunk
//! sizes, and consecutive chunk offsets are contiguous.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::fragment::{Fragment, InitSegment};
use crate::index::{ArchiveIndex, Chunk, Recording, StorageVolume};

/// One open recording file and its index row.
pub struct SegmentWriter {
    index: Arc<ArchiveIndex>,
    volume: StorageVolume,
    recording: Recording,
    file: BufWriter<File>,
    /// Byte offset of the next write; starts at the init block's length.
    cursor: u64,
    /// Epoch ms of the first appended fragment, for rotation timing.
    first_timestamp: Option<i64>,
    /// Epoch ms one past the last appended fragment.
    last_end: i64,
    /// Set when an append failed: file and index may disagree past the
    /// cursor, so further appends are refused.
    failed: bool,
}

impl SegmentWriter {
    /// Create the recording file, write the initialization block, and insert
    /// the open recording row.
    pub async fn open(
        index: Arc<ArchiveIndex>,
        volume: StorageVolume,
        camera_id: &str,
        init: &InitSegment,
        start_ms: i64,
    ) -> Result<Self> {
        let dir = volume.vault_dir(camera_id);
        let filename = format!("{start_ms}.mp4");
        let path = dir.join(&filename);
        let init_len = init.data.len() as u64;

        let file = tokio::task::block_in_place(|| -> Result<BufWriter<File>> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating vault directory {:?}", dir))?;
            let file = File::create(&path)
                .with_context(|| format!("creating recording file {:?}", path))?;
            let mut file = BufWriter::new(file);
            file.write_all(&init.data)?;
            file.flush()?;
            Ok(file)
        })?;

        let recording =
            index.create_recording(camera_id, volume.id, &filename, start_ms, init_len)?;
        info!(
            camera = %camera_id,
            recording = recording.id,
            file = %filename,
            init_bytes = init_len,
            "opened recording"
        );

        Ok(Self {
            index,
            volume,
            recording,
            file,
            cursor: init_len,
            first_timestamp: None,
            last_end: start_ms,
            failed: false,
        })
    }

    /// Append one fragment: write its bytes, flush, then index the chunk.
    ///
    /// After a failed append the file and the cursor may disagree, so the
    /// writer refuses further appends; close it and open a fresh recording.
    pub async fn append(&mut self, fragment: &Fragment) -> Result<Chunk> {
        if self.failed {
            bail!(
                "recording {} writer unusable after earlier append failure",
                self.recording.id
            );
        }
        let size = fragment.size_bytes();
        let chunk = Chunk {
            recording_id: self.recording.id,
            camera_id: self.recording.camera_id.clone(),
            start_offset: self.cursor,
            end_offset: self.cursor + size - 1,
            duration_ms: fragment.duration_ms,
            timestamp: fragment.timestamp_ms,
            size,
        };

        let written = tokio::task::block_in_place(|| -> Result<()> {
            self.file.write_all(&fragment.payload)?;
            self.file.flush()?;
            Ok(())
        })
        .with_context(|| {
            format!(
                "writing {} bytes to recording {}",
                size, self.recording.id
            )
        });
        if let Err(err) = written {
            self.failed = true;
            return Err(err);
        }
        if let Err(err) = self.index.append_chunk(&chunk) {
            self.failed = true;
            return Err(err);
        }
        self.cursor += size;
        self.first_timestamp.get_or_insert(fragment.timestamp_ms);
        self.last_end = fragment.end_ms();
        debug!(
            recording = self.recording.id,
            offset = chunk.start_offset,
            bytes = size,
            "appended chunk"
        );
        Ok(chunk)
    }

    /// True once the appended span reaches the rotation length.
    pub fn should_rotate(&self, segment_time: Duration) -> bool {
        match self.first_timestamp {
            Some(first) => self.last_end - first >= segment_time.as_millis() as i64,
            None => false,
        }
    }

    pub fn recording_id(&self) -> i64 {
        self.recording.id
    }

    pub fn volume(&self) -> &StorageVolume {
        &self.volume
    }

    /// Flush remaining bytes and mark the recording completed.
    pub async fn close(mut self) -> Result<Recording> {
        tokio::task::block_in_place(|| self.file.flush())
            .with_context(|| format!("flushing recording {}", self.recording.id))?;
        self.index.complete_recording(self.recording.id)?;
        let recording = self
            .index
            .recording(self.recording.id)?
            .unwrap_or(self.recording);
        info!(
            camera = %recording.camera_id,
            recording = recording.id,
            duration_ms = recording.duration_ms,
            bytes = recording.file_size,
            "closed recording"
        );
        Ok(recording)
    }
}
