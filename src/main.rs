//! Gatevault — vehicle-gate video archive appliance.
//!
//! Records each configured camera into rotating fragmented-MP4 files, keeps
//! a byte-range index of every fragment, serves any archived time window as
//! HLS reconstructed straight from the files, and evicts the oldest footage
//! to stay inside the volume's capacity policy.
//!
//! ## Usage
//!
//! ```bash
//! # Record one camera onto /media/storage1, web UI on port 3000
//! GATEVAULT_CAMERAS=gate=rtsp://10.0.0.2/main gatevault
//!
//! # Custom mount and capacity policy
//! GATEVAULT_STORAGE_MOUNT=/media/archive \
//! GATEVAULT_MIN_FREE_BYTES=5000000000 gatevault
//! ```

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use gatevault::capacity::{CapacityManager, SpaceProbe, StatvfsProbe};
use gatevault::config::Config;
use gatevault::lifecycle::LifecycleController;
use gatevault::web::{self, WebState};
use gatevault::ArchiveIndex;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatevault=info".parse().unwrap()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();
    info!("Gatevault starting");
    info!("  Storage mount: {:?}", config.storage_mount);
    info!("  Index: {:?}", config.db_path);
    info!("  Segment time: {:?}", config.segment_time);
    info!("  Web port: {}", config.web_addr.port());
    if config.cameras.is_empty() {
        warn!("no cameras configured (set GATEVAULT_CAMERAS=id=url,...)");
    }

    let index = Arc::new(ArchiveIndex::open(&config.db_path).context("opening archive index")?);
    // anything left open by a crash becomes an ordinary completed recording
    index.complete_stale_open()?;
    let volume = index
        .register_volume(
            &config.storage_mount,
            config.min_free_bytes,
            config.max_use_bytes,
        )
        .context("registering storage volume")?;

    let lifecycle = Arc::new(LifecycleController::new(
        index.clone(),
        volume.clone(),
        config.clone(),
    ));
    for camera in &config.cameras {
        lifecycle.start(camera);
    }

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let probe: Arc<dyn SpaceProbe> = Arc::new(StatvfsProbe);
    let manager = Arc::new(CapacityManager::new(index.clone(), probe.clone()));
    tracker.spawn(manager.run(config.space_check_interval, cancel.clone()));

    let state = Arc::new(WebState {
        index,
        lifecycle: lifecycle.clone(),
        probe,
        target_duration_ms: config.target_duration_ms,
        start_time: Instant::now(),
    });
    let web_addr = config.web_addr;
    let web_cancel = cancel.clone();
    tracker.spawn(async move {
        tokio::select! {
            result = web::start(state, web_addr) => {
                if let Err(err) = result {
                    warn!(%err, "web server exited");
                }
            }
            _ = web_cancel.cancelled() => {}
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();
    lifecycle.shutdown().await;
    tracker.close();
    if tokio::time::timeout(std::time::Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("shutdown timed out waiting for tasks");
    }
    Ok(())
}
