//! Capacity manager: keeps each volume inside its policy by evicting the
//! oldest completed recordings.
//!
//! A pass computes the byte deficit (below the free floor, or above the use
//! ceiling), then walks completed recordings oldest first, accumulating their
//! file and snapshot sizes until the deficit is covered. Victims lose their
//! backing files first, then their index rows. Open recordings are never
//! candidates.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::index::{ArchiveIndex, Recording, StorageVolume};

/// Eviction candidates fetched per index query.
const EVICTION_PAGE: usize = 8;

/// Free-space oracle for a mount point. Separated out so passes can run
/// against a fake disk in tests.
#[async_trait]
pub trait SpaceProbe: Send + Sync {
    async fn free_bytes(&self, mount: &Path) -> Result<u64>;
}

/// `statvfs(2)`-backed probe.
pub struct StatvfsProbe;

#[async_trait]
impl SpaceProbe for StatvfsProbe {
    async fn free_bytes(&self, mount: &Path) -> Result<u64> {
        let path = CString::new(mount.as_os_str().as_bytes())
            .context("mount point contains a NUL byte")?;
        tokio::task::block_in_place(|| {
            let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
            if rc != 0 {
                return Err(anyhow!(
                    "statvfs({:?}) failed: {}",
                    mount,
                    std::io::Error::last_os_error()
                ));
            }
            Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
        })
    }
}

pub struct CapacityManager {
    index: Arc<ArchiveIndex>,
    probe: Arc<dyn SpaceProbe>,
}

impl CapacityManager {
    pub fn new(index: Arc<ArchiveIndex>, probe: Arc<dyn SpaceProbe>) -> Self {
        Self { index, probe }
    }

    /// Bytes that must be reclaimed on a volume, given its current state.
    fn deficit(volume: &StorageVolume, free: u64, usage: u64) -> u64 {
        let below_floor = volume.min_free_bytes.saturating_sub(free);
        let above_ceiling = if volume.max_use_bytes > 0 {
            usage.saturating_sub(volume.max_use_bytes)
        } else {
            0
        };
        below_floor.max(above_ceiling)
    }

    /// One pass over all active volumes. Returns total bytes reclaimed.
    pub async fn run_pass(&self) -> Result<u64> {
        let mut reclaimed = 0;
        for volume in self.index.active_volumes()? {
            reclaimed += self.run_volume_pass(&volume).await?;
        }
        Ok(reclaimed)
    }

    async fn run_volume_pass(&self, volume: &StorageVolume) -> Result<u64> {
        let free = self.probe.free_bytes(&volume.mount_point).await?;
        let usage = self.index.usage_bytes(volume.id)?;
        let deficit = Self::deficit(volume, free, usage);
        if deficit == 0 {
            debug!(volume = volume.id, free, usage, "capacity within bounds");
            return Ok(0);
        }
        info!(volume = volume.id, free, usage, deficit, "capacity pass starting");

        // Select oldest-first until the accumulated reclaimable size covers
        // the deficit, then stop; a page with no candidates ends the pass.
        let mut victims: Vec<(Recording, u64)> = Vec::new();
        let mut planned = 0u64;
        let mut offset = 0;
        'select: loop {
            let page = self.index.oldest_completed(volume.id, EVICTION_PAGE, offset)?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for recording in page {
                let snapshot_bytes: u64 = self
                    .index
                    .snapshots_for_recording(recording.id)?
                    .iter()
                    .map(|s| s.file_size)
                    .sum();
                let size = recording.file_size + snapshot_bytes;
                planned += size;
                victims.push((recording, size));
                if planned >= deficit {
                    break 'select;
                }
            }
        }
        if planned < deficit {
            warn!(
                volume = volume.id,
                deficit,
                reclaimable = planned,
                "not enough completed recordings to cover deficit"
            );
        }

        let mut reclaimed = 0;
        for (recording, size) in victims {
            self.evict(volume, &recording).await?;
            reclaimed += size;
        }
        info!(volume = volume.id, reclaimed, "capacity pass done");
        Ok(reclaimed)
    }

    /// Remove one recording: backing files best-effort, then index rows.
    async fn evict(&self, volume: &StorageVolume, recording: &Recording) -> Result<()> {
        let path = recording.file_path(volume);
        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!(recording = recording.id, ?path, %err, "could not delete recording file");
        }
        for snapshot in self.index.snapshots_for_recording(recording.id)? {
            let path = snapshot.file_path(volume);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(snapshot = snapshot.id, ?path, %err, "could not delete snapshot file");
            }
        }
        self.index.delete_recording(recording.id)?;
        info!(
            camera = %recording.camera_id,
            recording = recording.id,
            bytes = recording.file_size,
            "evicted recording"
        );
        Ok(())
    }

    /// Periodic pass loop until cancellation.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_pass().await {
                        warn!(%err, "capacity pass failed");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("capacity manager stopping");
                    return;
                }
            }
        }
    }
}
