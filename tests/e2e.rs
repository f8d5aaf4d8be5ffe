//! End-to-end pipeline tests:
//!
//! - fMP4 byte stream → scanner → segment writer → archive index (ingest)
//! - archive index → manifest → HTTP segment reconstruction (playback)
//! - capacity pass → oldest recordings evicted (retention)
//!
//! The web layer runs on an ephemeral port and is driven with raw HTTP/1.0
//! over a TCP socket.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use gatevault::capacity::{CapacityManager, SpaceProbe};
use gatevault::config::Config;
use gatevault::lifecycle::{LifecycleController, StreamRunner};
use gatevault::web::{self, WebState};
use gatevault::{ArchiveIndex, StorageVolume};

// ── fMP4 stream builders ─────────────────────────────────────────────

fn boxed(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&((payload.len() as u32 + 8).to_be_bytes()));
    out.extend_from_slice(box_type);
    out.extend_from_slice(payload);
    out
}

fn init_block() -> Vec<u8> {
    let mut mdhd = vec![0u8; 12];
    mdhd.extend_from_slice(&1000u32.to_be_bytes());
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    let mdia = boxed(b"mdia", &boxed(b"mdhd", &mdhd));
    let trak = boxed(b"trak", &mdia);
    let mut out = boxed(b"ftyp", b"isom");
    out.extend_from_slice(&boxed(b"moov", &trak));
    out
}

fn fragment_block(duration_ms: u32, fill: u8, mdat_len: usize) -> Vec<u8> {
    let mut trun = vec![0u8, 0, 0x01, 0];
    trun.extend_from_slice(&1u32.to_be_bytes());
    trun.extend_from_slice(&duration_ms.to_be_bytes());
    let mut traf = boxed(b"tfhd", &[0, 0, 0, 0, 0, 0, 0, 1]);
    traf.extend_from_slice(&boxed(b"trun", &trun));
    let mut out = boxed(b"moof", &boxed(b"traf", &traf));
    out.extend_from_slice(&boxed(b"mdat", &vec![fill; mdat_len]));
    out
}

// ── Harness ──────────────────────────────────────────────────────────

struct FixedProbe(u64);

#[async_trait]
impl SpaceProbe for FixedProbe {
    async fn free_bytes(&self, _mount: &Path) -> Result<u64> {
        Ok(self.0)
    }
}

fn test_config(mount: &Path) -> Config {
    Config {
        storage_mount: mount.to_path_buf(),
        db_path: mount.join("archive.db"),
        min_free_bytes: 0,
        max_use_bytes: 0,
        segment_time: Duration::from_secs(3600),
        target_duration_ms: 10_000,
        space_check_interval: Duration::from_secs(120),
        restart_backoff: Duration::from_millis(10),
        stall_timeout: Duration::from_secs(5),
        pre_buffer_len: 10,
        web_addr: "127.0.0.1:0".parse().unwrap(),
        cameras: Vec::new(),
    }
}

struct Harness {
    index: Arc<ArchiveIndex>,
    volume: StorageVolume,
    addr: SocketAddr,
}

async fn spawn_harness(dir: &Path) -> Harness {
    let config = test_config(dir);
    let index = Arc::new(ArchiveIndex::open(&config.db_path).unwrap());
    let volume = index.register_volume(dir, 0, 0).unwrap();
    let lifecycle = Arc::new(LifecycleController::new(
        index.clone(),
        volume.clone(),
        config.clone(),
    ));
    let state = Arc::new(WebState {
        index: index.clone(),
        lifecycle,
        probe: Arc::new(FixedProbe(u64::MAX)),
        target_duration_ms: config.target_duration_ms,
        start_time: Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, web::router(state)).await.unwrap();
    });

    Harness { index, volume, addr }
}

/// Ingest a synthetic stream for `cam1` and return the completed recordings.
async fn ingest(
    index: &Arc<ArchiveIndex>,
    volume: &StorageVolume,
    stream: Vec<u8>,
) -> Vec<gatevault::Recording> {
    let runner = StreamRunner {
        index: index.clone(),
        volume: volume.clone(),
        camera_id: "cam1".into(),
        segment_time: Duration::from_secs(3600),
        stall_timeout: Duration::from_secs(5),
        pre_buffer_len: 10,
    };
    runner
        .consume(std::io::Cursor::new(stream), &CancellationToken::new())
        .await
        .unwrap();
    index.recordings_in_range("cam1", 0, i64::MAX).unwrap()
}

/// Raw HTTP/1.0 GET: returns (status, body).
async fn http_get(addr: SocketAddr, path: &str) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.0\r\nHost: test\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let status: u16 = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("no status line");
    (status, raw[split + 4..].to_vec())
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn archive_then_play_back_byte_exact() {
    let dir = tempfile::tempdir().unwrap();
    let harness = spawn_harness(dir.path()).await;

    let mut stream = init_block();
    for i in 0..3u8 {
        stream.extend_from_slice(&fragment_block(1000, i + 1, 400));
    }
    let recordings = ingest(&harness.index, &harness.volume, stream).await;
    assert_eq!(recordings.len(), 1);
    let rec = &recordings[0];
    let file_bytes = std::fs::read(rec.file_path(&harness.volume)).unwrap();
    assert_eq!(file_bytes.len() as u64, rec.file_size);

    // manifest over the whole archive window
    let now = chrono::Utc::now().timestamp_millis();
    let (status, body) = http_get(
        harness.addr,
        &format!("/cam1/video/archive.m3u8?from=0&to={}", now + 60_000),
    )
    .await;
    assert_eq!(status, 200);
    let manifest = String::from_utf8(body).unwrap();
    assert!(manifest.starts_with("#EXTM3U"));
    assert!(manifest.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
    assert!(manifest.contains(&format!("#EXT-X-MAP:URI=\"init-{}.mp4\"", rec.id)));
    assert!(manifest.trim_end().ends_with("#EXT-X-ENDLIST"));

    // the init URL returns exactly the file head
    let (status, init_bytes) =
        http_get(harness.addr, &format!("/cam1/video/init-{}.mp4", rec.id)).await;
    assert_eq!(status, 200);
    assert_eq!(init_bytes, &file_bytes[..rec.init_size as usize]);

    // every segment URL in the manifest reconstructs real file bytes;
    // together they cover the file body exactly
    let segments: Vec<&str> = manifest
        .lines()
        .filter(|line| line.ends_with(".m4s"))
        .collect();
    assert!(!segments.is_empty());
    let mut reassembled = Vec::new();
    for segment in segments {
        let (status, bytes) = http_get(harness.addr, &format!("/cam1/video/{segment}")).await;
        assert_eq!(status, 200);
        reassembled.extend_from_slice(&bytes);
    }
    assert_eq!(reassembled, &file_bytes[rec.init_size as usize..]);

    // hostile span sizes on a real recording are refused, not allocated
    let (status, _) = http_get(
        harness.addr,
        &format!("/cam1/video/{}+0+18446744073709551615_0.m4s", rec.id),
    )
    .await;
    assert_eq!(status, 503);
    let (status, _) = http_get(
        harness.addr,
        &format!("/cam1/video/{}+0+1000000000000_0.m4s", rec.id),
    )
    .await;
    assert_eq!(status, 503);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_and_missing_segments_map_to_http_errors() {
    let dir = tempfile::tempdir().unwrap();
    let harness = spawn_harness(dir.path()).await;

    let (status, _) = http_get(harness.addr, "/cam1/video/not-a-key_x.m4s").await;
    assert_eq!(status, 400);

    // well-formed key for a recording that does not exist
    let (status, _) = http_get(harness.addr, "/cam1/video/999+0+100_0.m4s").await;
    assert_eq!(status, 503);

    let (status, _) = http_get(harness.addr, "/cam1/video/init-999.mp4").await;
    assert_eq!(status, 503);

    let (status, _) = http_get(harness.addr, "/cam1/video/archive.xyz").await;
    assert_eq!(status, 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_window_is_a_valid_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let harness = spawn_harness(dir.path()).await;

    let (status, body) = http_get(harness.addr, "/cam1/video/archive.m3u8?from=0&to=1").await;
    assert_eq!(status, 200);
    let manifest = String::from_utf8(body).unwrap();
    assert!(manifest.starts_with("#EXTM3U"));
    assert!(!manifest.contains("EXTINF"));
    assert!(manifest.trim_end().ends_with("#EXT-X-ENDLIST"));
}

#[tokio::test(flavor = "multi_thread")]
async fn eviction_clears_oldest_and_playback_follows() {
    let dir = tempfile::tempdir().unwrap();
    let harness = spawn_harness(dir.path()).await;

    // two separate ingests become two recordings with distinct start dates
    let mut first = init_block();
    first.extend_from_slice(&fragment_block(1000, 0x11, 200));
    let recs = ingest(&harness.index, &harness.volume, first).await;
    let oldest = recs[0].clone();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut second = init_block();
    second.extend_from_slice(&fragment_block(1000, 0x22, 200));
    let recs = ingest(&harness.index, &harness.volume, second).await;
    assert_eq!(recs.len(), 2);
    let newest = recs.iter().max_by_key(|r| r.start_date).unwrap().clone();
    assert_ne!(oldest.id, newest.id);

    // a deficit of one recording's size: the pass takes the oldest only
    let volume = harness
        .index
        .register_volume(dir.path(), oldest.file_size, 0)
        .unwrap();
    let manager = CapacityManager::new(harness.index.clone(), Arc::new(FixedProbe(0)));
    let reclaimed = manager.run_pass().await.unwrap();
    assert_eq!(reclaimed, oldest.file_size);
    assert!(harness.index.recording(oldest.id).unwrap().is_none());
    assert!(harness.index.recording(newest.id).unwrap().is_some());
    assert!(!oldest.file_path(&volume).exists());

    // the evicted recording's init is gone, the survivor still plays
    let (status, _) =
        http_get(harness.addr, &format!("/cam1/video/init-{}.mp4", oldest.id)).await;
    assert_eq!(status, 503);
    let (status, _) =
        http_get(harness.addr, &format!("/cam1/video/init-{}.mp4", newest.id)).await;
    assert_eq!(status, 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_volumes_and_streams() {
    let dir = tempfile::tempdir().unwrap();
    let harness = spawn_harness(dir.path()).await;

    let (status, body) = http_get(harness.addr, "/api/status").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["volumes"].as_array().is_some_and(|v| v.len() == 1));
    assert!(json["streams"].as_array().is_some_and(|s| s.is_empty()));

    let (status, body) = http_get(harness.addr, "/api/recordings/cam1?from=0&to=1").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json.as_array().is_some_and(|list| list.is_empty()));
}
