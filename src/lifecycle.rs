//! Recording lifecycle controller: one supervised capture process per
//! camera, its fragment stream driving a segment writer.
//!
//! The controller owns a supervision task per active stream. The task spawns
//! ffmpeg with an fMP4 stdout, splits the pipe with [`FragmentScanner`],
//! stamps fragments with the wall clock, rotates recording files on the
//! configured segment length, and relaunches the process after a fixed
//! backoff when it dies or stalls.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CameraSpec, Config};
use crate::fragment::{Fragment, InitSegment, PreBuffer};
use crate::index::{ArchiveIndex, StorageVolume};
use crate::mp4::{FragmentScanner, ScanEvent};
use crate::writer::SegmentWriter;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Capture command line: copy the video stream into fragmented MP4 on stdout.
fn capture_args(url: &str) -> Vec<String> {
    [
        "-loglevel",
        "quiet",
        "-rtsp_transport",
        "tcp",
        "-i",
        url,
        "-an",
        "-c:v",
        "copy",
        "-f",
        "mp4",
        "-movflags",
        "+frag_keyframe+empty_moov+default_base_moof",
        "-reset_timestamps",
        "1",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

struct StreamHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Per-stream knobs and shared services, cloned into each supervision task.
#[derive(Clone)]
pub struct StreamRunner {
    pub index: Arc<ArchiveIndex>,
    pub volume: StorageVolume,
    pub camera_id: String,
    pub segment_time: Duration,
    pub stall_timeout: Duration,
    pub pre_buffer_len: usize,
}

impl StreamRunner {
    /// Spawn the capture process once and consume it to completion.
    async fn run_once(&self, url: &str, cancel: &CancellationToken) -> Result<()> {
        let mut child = Command::new("ffmpeg")
            .args(capture_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("spawning ffmpeg")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;

        let result = self.consume(stdout, cancel).await;
        let _ = child.kill().await;
        let _ = child.wait().await;
        result
    }

    /// Drive the fragment stream from `reader` until EOF, stall, error or
    /// cancellation. Always closes out the in-flight recording on the way
    /// out, so a crash-interrupted file is still a valid completed archive
    /// entry up to its last flushed chunk.
    pub async fn consume<R>(&self, mut reader: R, cancel: &CancellationToken) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut scanner = FragmentScanner::new();
        let mut init: Option<InitSegment> = None;
        let mut pre_buffer = PreBuffer::new(self.pre_buffer_len);
        let mut writer: Option<SegmentWriter> = None;
        let mut buf = vec![0u8; 64 * 1024];

        let result = 'read: loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break 'read Ok(()),
                read = tokio::time::timeout(self.stall_timeout, reader.read(&mut buf)) => read,
            };
            let n = match read {
                Ok(Ok(0)) => break 'read Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(err)) => break 'read Err(err).context("reading capture stdout"),
                Err(_) => {
                    break 'read Err(anyhow!(
                        "no fragment within {:?}, capture stalled",
                        self.stall_timeout
                    ))
                }
            };

            // an unparseable stream cannot be resynchronized; bail out so
            // the supervisor relaunches the capture process
            let events = match scanner.push(&buf[..n]) {
                Ok(events) => events,
                Err(err) => break 'read Err(err).context("capture stream unparseable"),
            };
            for event in events {
                match event {
                    ScanEvent::Init(data) => {
                        // a fresh init invalidates the open file
                        if let Some(w) = writer.take() {
                            w.close().await?;
                        }
                        debug!(camera = %self.camera_id, bytes = data.len(), "initialization block");
                        init = Some(InitSegment { data });
                    }
                    ScanEvent::Fragment { data, duration_ms } => {
                        let fragment = Fragment {
                            timestamp_ms: now_ms(),
                            duration_ms,
                            payload: data,
                        };
                        let Some(init_seg) = &init else {
                            pre_buffer.push(fragment);
                            continue;
                        };
                        if let Err(err) = self
                            .write_fragment(&mut writer, init_seg, &mut pre_buffer, fragment)
                            .await
                        {
                            warn!(camera = %self.camera_id, %err, "write failed, closing recording");
                            if let Some(w) = writer.take() {
                                if let Err(err) = w.close().await {
                                    warn!(camera = %self.camera_id, %err, "close after write failure");
                                }
                            }
                        }
                    }
                }
            }
        };

        if let Some(w) = writer.take() {
            if let Err(err) = w.close().await {
                warn!(camera = %self.camera_id, %err, "closing recording at stream end");
            }
        }
        result
    }

    /// Append one stamped fragment, opening a file first if none is open and
    /// rotating afterwards when the segment length is reached.
    async fn write_fragment(
        &self,
        writer: &mut Option<SegmentWriter>,
        init: &InitSegment,
        pre_buffer: &mut PreBuffer,
        fragment: Fragment,
    ) -> Result<()> {
        if writer.is_none() {
            let mut w = SegmentWriter::open(
                self.index.clone(),
                self.volume.clone(),
                &self.camera_id,
                init,
                fragment.timestamp_ms,
            )
            .await?;
            for buffered in pre_buffer.drain() {
                w.append(&buffered).await?;
            }
            *writer = Some(w);
        }
        let rotate = if let Some(w) = writer.as_mut() {
            w.append(&fragment).await?;
            w.should_rotate(self.segment_time)
        } else {
            false
        };
        if rotate {
            if let Some(w) = writer.take() {
                w.close().await?;
            }
        }
        Ok(())
    }
}

/// Starts, supervises and stops per-camera capture streams.
pub struct LifecycleController {
    index: Arc<ArchiveIndex>,
    volume: StorageVolume,
    config: Config,
    streams: Mutex<HashMap<String, StreamHandle>>,
}

impl LifecycleController {
    pub fn new(index: Arc<ArchiveIndex>, volume: StorageVolume, config: Config) -> Self {
        Self {
            index,
            volume,
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Begin recording a camera. Returns false if it is already running.
    pub fn start(&self, camera: &CameraSpec) -> bool {
        let mut streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if streams.contains_key(&camera.id) {
            return false;
        }

        let runner = StreamRunner {
            index: self.index.clone(),
            volume: self.volume.clone(),
            camera_id: camera.id.clone(),
            segment_time: self.config.segment_time,
            stall_timeout: self.config.stall_timeout,
            pre_buffer_len: self.config.pre_buffer_len,
        };
        let url = camera.url.clone();
        let backoff = self.config.restart_backoff;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let camera_id = camera.id.clone();

        let task = tokio::spawn(async move {
            loop {
                info!(camera = %camera_id, "starting capture process");
                match runner.run_once(&url, &task_cancel).await {
                    Ok(()) => info!(camera = %camera_id, "capture process ended"),
                    Err(err) => warn!(camera = %camera_id, %err, "capture failed"),
                }
                if task_cancel.is_cancelled() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = task_cancel.cancelled() => return,
                }
            }
        });

        streams.insert(camera.id.clone(), StreamHandle { cancel, task });
        info!(camera = %camera.id, "stream started");
        true
    }

    /// Stop recording a camera: disable restart, kill the process, close the
    /// in-flight recording. Returns false if the camera was not running.
    pub async fn stop(&self, camera_id: &str) -> bool {
        let handle = {
            let mut streams = match self.streams.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            streams.remove(camera_id)
        };
        let Some(handle) = handle else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(err) = handle.task.await {
            warn!(camera = %camera_id, %err, "stream task panicked");
        }
        info!(camera = %camera_id, "stream stopped");
        true
    }

    pub fn active_streams(&self) -> Vec<String> {
        match self.streams.lock() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }

    /// Stop every stream, for shutdown.
    pub async fn shutdown(&self) {
        let ids = self.active_streams();
        for id in ids {
            self.stop(&id).await;
        }
    }
}
