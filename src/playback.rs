//! Reconstruction engine: turns a time window of indexed chunks into an HLS
//! manifest, and a manifest segment name back into the exact bytes it covers.
//!
//! Segments never exist on disk. A segment URL encodes the byte ranges that
//! produce it (`<recId>+<offset>+<size>[-<recId>+<offset>+<size>...]_<n>.m4s`)
//! and the bytes are read straight out of the recording files on request.

use std::fmt::Write as _;
use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::index::{ArchiveIndex, Chunk};

/// One contiguous byte range inside one recording file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub recording_id: i64,
    pub offset: u64,
    pub size: u64,
}

/// The byte-range list a segment name encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructionKey {
    pub spans: Vec<Span>,
}

impl ReconstructionKey {
    /// Render the key portion of a segment file name.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, span) in self.spans.iter().enumerate() {
            if i > 0 {
                out.push('-');
            }
            let _ = write!(out, "{}+{}+{}", span.recording_id, span.offset, span.size);
        }
        out
    }

    /// Parse a segment file name of the form `<key>_<n>.m4s`.
    pub fn parse_filename(name: &str) -> Result<(Self, u64)> {
        let stem = name
            .strip_suffix(".m4s")
            .ok_or_else(|| anyhow!("segment name missing .m4s suffix: {name}"))?;
        let (key, seq) = stem
            .rsplit_once('_')
            .ok_or_else(|| anyhow!("segment name missing sequence number: {name}"))?;
        let seq: u64 = seq
            .parse()
            .with_context(|| format!("bad sequence number in {name}"))?;
        let mut spans = Vec::new();
        for part in key.split('-') {
            let mut fields = part.split('+');
            let (Some(id), Some(offset), Some(size), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                bail!("malformed span {part:?} in segment name {name}");
            };
            let span = Span {
                recording_id: id.parse().with_context(|| format!("bad recording id in {part:?}"))?,
                offset: offset.parse().with_context(|| format!("bad offset in {part:?}"))?,
                size: size.parse().with_context(|| format!("bad size in {part:?}"))?,
            };
            if span.size == 0 {
                bail!("zero-size span in segment name {name}");
            }
            spans.push(span);
        }
        Ok((Self { spans }, seq))
    }
}

/// One playlist entry, derived from a run of chunks.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub key: ReconstructionKey,
    pub duration_ms: i64,
    /// Epoch ms of the first chunk in the run.
    pub start_ms: i64,
    /// True when a timeline gap precedes this entry.
    pub discontinuity: bool,
    /// Recording holding the run's first chunk, for init-map selection.
    pub first_recording: i64,
}

/// Group a timestamp-ordered chunk list into manifest entries.
///
/// Chunks accumulate into the current entry until its duration reaches
/// `target_ms`. A timeline gap (next timestamp later than the previous
/// chunk's end) closes the entry and flags the next one discontinuous. A
/// recording change inside an entry just opens a new span in its key.
pub fn build_entries(chunks: &[Chunk], target_ms: i64) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    let mut run: Vec<&Chunk> = Vec::new();
    let mut run_dur = 0i64;
    let mut pending_discontinuity = false;

    let mut flush = |run: &mut Vec<&Chunk>, run_dur: &mut i64, discontinuity: bool| {
        if run.is_empty() {
            return;
        }
        let mut spans: Vec<Span> = Vec::new();
        for chunk in run.iter() {
            match spans.last_mut() {
                Some(span)
                    if span.recording_id == chunk.recording_id
                        && span.offset + span.size == chunk.start_offset =>
                {
                    span.size += chunk.size;
                }
                _ => spans.push(Span {
                    recording_id: chunk.recording_id,
                    offset: chunk.start_offset,
                    size: chunk.size,
                }),
            }
        }
        entries.push(ManifestEntry {
            key: ReconstructionKey { spans },
            duration_ms: *run_dur,
            start_ms: run[0].timestamp,
            discontinuity,
            first_recording: run[0].recording_id,
        });
        run.clear();
        *run_dur = 0;
    };

    let mut prev: Option<&Chunk> = None;
    for chunk in chunks {
        if let Some(p) = prev {
            if chunk.timestamp - p.timestamp > p.duration_ms {
                // gap in the timeline: close the run, flag the next entry
                flush(&mut run, &mut run_dur, pending_discontinuity);
                pending_discontinuity = true;
            }
        }
        run.push(chunk);
        run_dur += chunk.duration_ms;
        prev = Some(chunk);
        if run_dur >= target_ms {
            flush(&mut run, &mut run_dur, pending_discontinuity);
            pending_discontinuity = false;
        }
    }
    flush(&mut run, &mut run_dur, pending_discontinuity);
    entries
}

/// Render entries as a VOD playlist.
///
/// An `#EXT-X-MAP` line is emitted before the first entry and again whenever
/// the entry's first recording differs from the previous map's recording;
/// each recording file carries its own initialization copy so the map is
/// always byte-correct.
pub fn render_manifest(entries: &[ManifestEntry]) -> String {
    let target_secs = entries
        .iter()
        .map(|e| (e.duration_ms + 999) / 1000)
        .max()
        .unwrap_or(1)
        .max(1);

    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:7\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_secs}");
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");

    let mut mapped_recording: Option<i64> = None;
    for (seq, entry) in entries.iter().enumerate() {
        if entry.discontinuity {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        if mapped_recording != Some(entry.first_recording) {
            let _ = writeln!(out, "#EXT-X-MAP:URI=\"init-{}.mp4\"", entry.first_recording);
            mapped_recording = Some(entry.first_recording);
        }
        if let Some(date) = DateTime::<Utc>::from_timestamp_millis(entry.start_ms) {
            let _ = writeln!(
                out,
                "#EXT-X-PROGRAM-DATE-TIME:{}",
                date.to_rfc3339_opts(SecondsFormat::Millis, true)
            );
        }
        let _ = writeln!(out, "#EXTINF:{:.6},", entry.duration_ms as f64 / 1000.0);
        let _ = writeln!(out, "{}_{}.m4s", entry.key.encode(), seq);
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

/// Query a camera's chunks in `[from, to)` and build the playlist text.
pub fn manifest_for_range(
    index: &ArchiveIndex,
    camera_id: &str,
    from: i64,
    to: i64,
    target_ms: i64,
) -> Result<String> {
    let chunks = index.chunks_in_range(camera_id, from, to)?;
    Ok(render_manifest(&build_entries(&chunks, target_ms)))
}

/// Read and concatenate the exact bytes a key describes.
///
/// Span offsets and sizes come straight from the request URL, so every span
/// is resolved and bounds-checked against its recording's indexed extent
/// before a single byte is allocated or read. Each span is then read in its
/// own await step, so a dropped request abandons the remaining reads. A
/// short read means the index and the file disagree and is reported as an
/// error for this segment only.
pub async fn reconstruct(index: &Arc<ArchiveIndex>, key: &ReconstructionKey) -> Result<Bytes> {
    let mut reads = Vec::with_capacity(key.spans.len());
    let mut total: u64 = 0;
    for span in &key.spans {
        let recording = index
            .recording(span.recording_id)?
            .ok_or_else(|| anyhow!("recording {} not in index", span.recording_id))?;
        let volume = index
            .volume(recording.volume_id)?
            .ok_or_else(|| anyhow!("volume {} not in index", recording.volume_id))?;
        span.offset
            .checked_add(span.size)
            .filter(|end| *end <= recording.file_size)
            .ok_or_else(|| {
                anyhow!(
                    "span {}+{}+{} exceeds recording extent of {} bytes",
                    span.recording_id,
                    span.offset,
                    span.size,
                    recording.file_size
                )
            })?;
        total = total
            .checked_add(span.size)
            .ok_or_else(|| anyhow!("segment size overflows"))?;
        reads.push((recording.file_path(&volume), span.clone()));
    }

    let mut out = BytesMut::with_capacity(total as usize);
    for (path, span) in reads {
        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("opening recording file {:?}", path))?;
        file.seek(SeekFrom::Start(span.offset)).await?;
        let mut buf = vec![0u8; span.size as usize];
        file.read_exact(&mut buf).await.with_context(|| {
            format!(
                "reading {} bytes at offset {} of recording {}",
                span.size, span.offset, span.recording_id
            )
        })?;
        out.extend_from_slice(&buf);
    }
    Ok(out.freeze())
}

/// Read a recording's initialization block (the file's first `init_size`
/// bytes).
pub async fn init_segment(index: &Arc<ArchiveIndex>, recording_id: i64) -> Result<Bytes> {
    let recording = index
        .recording(recording_id)?
        .ok_or_else(|| anyhow!("recording {recording_id} not in index"))?;
    let volume = index
        .volume(recording.volume_id)?
        .ok_or_else(|| anyhow!("volume {} not in index", recording.volume_id))?;
    let path = recording.file_path(&volume);
    let mut file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("opening recording file {:?}", path))?;
    let mut buf = vec![0u8; recording.init_size as usize];
    file.read_exact(&mut buf)
        .await
        .with_context(|| format!("reading init block of recording {recording_id}"))?;
    Ok(Bytes::from(buf))
}
