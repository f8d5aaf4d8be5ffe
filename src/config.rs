//! Environment-driven configuration.
//!
//! Every knob has a `GATEVAULT_*` variable and a default that matches the
//! appliance's shipped behavior. Parsing never fails; a bad value falls back
//! to the default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// One camera to record, parsed from `GATEVAULT_CAMERAS` (`id=url` pairs,
/// comma separated).
#[derive(Debug, Clone)]
pub struct CameraSpec {
    pub id: String,
    pub url: String,
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mount point of the archive volume.
    pub storage_mount: PathBuf,
    /// Index database path (defaults to `<mount>/gatevault/archive.db`).
    pub db_path: PathBuf,
    /// Keep at least this many bytes free on the volume.
    pub min_free_bytes: u64,
    /// Archive may use at most this many bytes (0 = unlimited).
    pub max_use_bytes: u64,
    /// Rotate recording files after this long.
    pub segment_time: Duration,
    /// Greedy manifest-entry grouping target in milliseconds.
    pub target_duration_ms: i64,
    /// Capacity manager pass interval.
    pub space_check_interval: Duration,
    /// Delay before relaunching a dead capture process.
    pub restart_backoff: Duration,
    /// No fragment for this long means the capture process is stalled.
    pub stall_timeout: Duration,
    /// Fragments retained in the pre-buffer ring while no file is open.
    pub pre_buffer_len: usize,
    pub web_addr: SocketAddr,
    pub cameras: Vec<CameraSpec>,
}

impl Config {
    pub fn from_env() -> Self {
        let storage_mount = env_var("GATEVAULT_STORAGE_MOUNT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/media/storage1"));

        let db_path = env_var("GATEVAULT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| storage_mount.join("gatevault").join("archive.db"));

        let min_free_bytes = env_parse("GATEVAULT_MIN_FREE_BYTES", 2 * 1024 * 1024 * 1024u64);
        let max_use_bytes = env_parse("GATEVAULT_MAX_USE_BYTES", 0u64);

        let segment_time = Duration::from_secs(env_parse("GATEVAULT_SEGMENT_SECONDS", 60u64));
        let target_duration_ms = env_parse("GATEVAULT_TARGET_DURATION_MS", 10_000i64);
        let space_check_interval =
            Duration::from_secs(env_parse("GATEVAULT_SPACE_CHECK_SECONDS", 120u64));
        let restart_backoff =
            Duration::from_secs(env_parse("GATEVAULT_RESTART_BACKOFF_SECONDS", 5u64));
        let stall_timeout = Duration::from_secs(env_parse("GATEVAULT_STALL_SECONDS", 30u64));
        let pre_buffer_len = env_parse("GATEVAULT_PREBUFFER_LEN", 10usize);

        let web_port: u16 = env_parse("GATEVAULT_WEB_PORT", 3000u16);
        let web_addr = SocketAddr::from(([0, 0, 0, 0], web_port));

        let cameras = env_var("GATEVAULT_CAMERAS")
            .map(|s| parse_cameras(&s))
            .unwrap_or_default();

        Self {
            storage_mount,
            db_path,
            min_free_bytes,
            max_use_bytes,
            segment_time,
            target_duration_ms,
            space_check_interval,
            restart_backoff,
            stall_timeout,
            pre_buffer_len,
            web_addr,
            cameras,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn parse_cameras(raw: &str) -> Vec<CameraSpec> {
    raw.split(',')
        .filter_map(|pair| {
            let (id, url) = pair.trim().split_once('=')?;
            if id.is_empty() || url.is_empty() {
                return None;
            }
            Some(CameraSpec {
                id: id.to_string(),
                url: url.to_string(),
            })
        })
        .collect()
}
