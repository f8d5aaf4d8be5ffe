//! Incremental fMP4 splitter.
//!
//! The video pipeline emits a single byte stream: an initialization block
//! (ftyp+moov) followed by an unbounded sequence of moof+mdat fragments.
//! `FragmentScanner` accumulates pipe reads, cuts them on box boundaries and
//! derives each fragment's media duration from the trun/tfhd sample tables
//! against the movie timescale.

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use tracing::warn;

/// Events produced while scanning the pipeline byte stream.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// Complete initialization block (ftyp+moov).
    Init(Bytes),
    /// Complete media fragment (moof+mdat) and its duration.
    Fragment { data: Bytes, duration_ms: i64 },
}

/// Incremental scanner over an fMP4 byte stream.
pub struct FragmentScanner {
    buf: BytesMut,
    init_done: bool,
    timescale: u32,
    /// A moof held back until its mdat arrives.
    pending_moof: Option<(Bytes, u64)>,
}

impl FragmentScanner {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            init_done: false,
            timescale: 1000,
            pending_moof: None,
        }
    }

    /// Movie timescale parsed from the init block (1000 until seen).
    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    /// Feed pipeline bytes, returning every event completed by them.
    ///
    /// Errors on a box header that can never be valid; there is no way to
    /// resynchronize such a stream, so the caller should drop the scanner
    /// and restart the pipeline.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<ScanEvent>> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            let Some((box_type, box_len)) = read_header(&self.buf)? else {
                break;
            };
            if self.buf.len() < box_len {
                break; // box still incomplete
            }

            match &box_type {
                b"ftyp" => {
                    // head of the init block, wait for the moov
                    if self.init_done {
                        // pipeline restarted mid-stream; start a fresh init
                        self.init_done = false;
                    }
                    if !self.try_complete_init(&mut events)? {
                        break;
                    }
                }
                b"moov" if !self.init_done => {
                    if !self.try_complete_init(&mut events)? {
                        break;
                    }
                }
                b"moof" => {
                    let moof = self.buf.split_to(box_len).freeze();
                    let ticks = fragment_ticks(&moof);
                    self.pending_moof = Some((moof, ticks));
                }
                b"mdat" => {
                    let mdat = self.buf.split_to(box_len).freeze();
                    match self.pending_moof.take() {
                        Some((moof, ticks)) => {
                            let mut data = BytesMut::with_capacity(moof.len() + mdat.len());
                            data.extend_from_slice(&moof);
                            data.extend_from_slice(&mdat);
                            let duration_ms = ticks_to_ms(ticks, self.timescale);
                            events.push(ScanEvent::Fragment {
                                data: data.freeze(),
                                duration_ms,
                            });
                        }
                        None => warn!("mdat without preceding moof, dropping {} bytes", box_len),
                    }
                }
                other => {
                    // styp/free/prft and friends carry no samples
                    tracing::debug!(
                        box_type = %String::from_utf8_lossy(other),
                        len = box_len,
                        "skipping box"
                    );
                    let _ = self.buf.split_to(box_len);
                }
            }
        }

        Ok(events)
    }

    /// When `ftyp` leads the buffer, the init block runs through the end of
    /// the following `moov`. Returns false if the moov is still incomplete.
    fn try_complete_init(&mut self, events: &mut Vec<ScanEvent>) -> Result<bool> {
        let mut end = 0usize;
        let mut saw_moov = false;
        while let Some((box_type, box_len)) = read_header(&self.buf[end..])? {
            if self.buf.len() < end + box_len {
                return Ok(false);
            }
            end += box_len;
            if &box_type == b"moov" {
                saw_moov = true;
                break;
            }
        }
        if !saw_moov {
            return Ok(false);
        }

        let init = self.buf.split_to(end).freeze();
        if let Some(ts) = movie_timescale(&init) {
            self.timescale = ts;
        } else {
            warn!("no mdhd timescale in init block, assuming 1000");
        }
        self.init_done = true;
        events.push(ScanEvent::Init(init));
        Ok(true)
    }
}

impl Default for FragmentScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn ticks_to_ms(ticks: u64, timescale: u32) -> i64 {
    if timescale == 0 {
        return 0;
    }
    (ticks.saturating_mul(1000) / timescale as u64) as i64
}

/// Box header at the head of the stream buffer: `Ok(None)` while fewer than
/// 8 bytes are in, `Err` on a size no valid box can have. A corrupt header
/// at the top level cannot be skipped or resynchronized, and swallowing it
/// would leave the scanner accumulating bytes forever without ever emitting
/// another event.
fn read_header(data: &[u8]) -> Result<Option<([u8; 4], usize)>> {
    if data.len() < 8 {
        return Ok(None);
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if size < 8 {
        // largesize and to-end boxes never occur in this stream
        bail!("invalid mp4 box size {size}");
    }
    let mut box_type = [0u8; 4];
    box_type.copy_from_slice(&data[4..8]);
    Ok(Some((box_type, size)))
}

/// Lenient header read for walking children of an already-validated box.
fn peek_box(data: &[u8]) -> Option<([u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if size < 8 {
        return None;
    }
    let mut box_type = [0u8; 4];
    box_type.copy_from_slice(&data[4..8]);
    Some((box_type, size))
}

/// Walk a container box, yielding `(type, payload)` for each child.
fn children(data: &[u8]) -> impl Iterator<Item = ([u8; 4], &[u8])> + '_ {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        let (box_type, len) = peek_box(&data[pos..])?;
        if pos + len > data.len() {
            return None;
        }
        let payload = &data[pos + 8..pos + len];
        pos += len;
        Some((box_type, payload))
    })
}

/// moov -> trak -> mdia -> mdhd timescale of the first track.
fn movie_timescale(init: &[u8]) -> Option<u32> {
    let moov = children(init).find(|(t, _)| t == b"moov")?.1;
    let trak = children(moov).find(|(t, _)| t == b"trak")?.1;
    let mdia = children(trak).find(|(t, _)| t == b"mdia")?.1;
    let mdhd = children(mdia).find(|(t, _)| t == b"mdhd")?.1;
    if mdhd.is_empty() {
        return None;
    }
    // version 0: ts at 12, version 1: 64-bit times push it to 20
    let offset = if mdhd[0] == 1 { 20 } else { 12 };
    if mdhd.len() < offset + 4 {
        return None;
    }
    Some(u32::from_be_bytes([
        mdhd[offset],
        mdhd[offset + 1],
        mdhd[offset + 2],
        mdhd[offset + 3],
    ]))
}

/// Total sample duration of a moof in timescale ticks.
///
/// Sums the trun per-sample durations when present, otherwise multiplies the
/// tfhd default sample duration by the sample count.
fn fragment_ticks(moof: &[u8]) -> u64 {
    let Some((_, len)) = peek_box(moof) else {
        return 0;
    };
    let moof_payload = &moof[8..len.min(moof.len())];
    let mut total = 0u64;
    for (box_type, traf) in children(moof_payload) {
        if &box_type != b"traf" {
            continue;
        }
        let mut default_duration = 0u32;
        for (t, payload) in children(traf) {
            match &t {
                b"tfhd" => default_duration = tfhd_default_duration(payload).unwrap_or(0),
                b"trun" => total += trun_ticks(payload, default_duration),
                _ => {}
            }
        }
    }
    total
}

fn tfhd_default_duration(payload: &[u8]) -> Option<u32> {
    if payload.len() < 8 {
        return None;
    }
    let flags = u32::from_be_bytes([0, payload[1], payload[2], payload[3]]);
    let mut pos = 8; // version/flags + track id
    if flags & 0x000001 != 0 {
        pos += 8; // base-data-offset
    }
    if flags & 0x000002 != 0 {
        pos += 4; // sample-description-index
    }
    if flags & 0x000008 == 0 {
        return None; // no default-sample-duration
    }
    if payload.len() < pos + 4 {
        return None;
    }
    Some(u32::from_be_bytes([
        payload[pos],
        payload[pos + 1],
        payload[pos + 2],
        payload[pos + 3],
    ]))
}

fn trun_ticks(payload: &[u8], default_duration: u32) -> u64 {
    if payload.len() < 8 {
        return 0;
    }
    let flags = u32::from_be_bytes([0, payload[1], payload[2], payload[3]]);
    let sample_count =
        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;

    let duration_present = flags & 0x000100 != 0;
    if !duration_present {
        return default_duration as u64 * sample_count as u64;
    }

    let mut pos = 8;
    if flags & 0x000001 != 0 {
        pos += 4; // data-offset
    }
    if flags & 0x000004 != 0 {
        pos += 4; // first-sample-flags
    }
    let mut per_sample = 4; // duration
    if flags & 0x000200 != 0 {
        per_sample += 4; // size
    }
    if flags & 0x000400 != 0 {
        per_sample += 4; // flags
    }
    if flags & 0x000800 != 0 {
        per_sample += 4; // composition offset
    }

    let mut total = 0u64;
    for i in 0..sample_count {
        let at = pos + i * per_sample;
        if payload.len() < at + 4 {
            break;
        }
        total += u32::from_be_bytes([
            payload[at],
            payload[at + 1],
            payload[at + 2],
            payload[at + 3],
        ]) as u64;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&((payload.len() as u32 + 8).to_be_bytes()));
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        out
    }

    fn mdhd(timescale: u32) -> Vec<u8> {
        let mut payload = vec![0u8; 12]; // version 0 + flags + times
        payload.extend_from_slice(&timescale.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes()); // duration
        boxed(b"mdhd", &payload)
    }

    fn init_block(timescale: u32) -> Vec<u8> {
        let mdia = boxed(b"mdia", &mdhd(timescale));
        let trak = boxed(b"trak", &mdia);
        let moov = boxed(b"moov", &trak);
        let mut out = boxed(b"ftyp", b"isom");
        out.extend_from_slice(&moov);
        out
    }

    /// moof with one trun carrying explicit per-sample durations.
    fn moof_with_durations(durations: &[u32]) -> Vec<u8> {
        let mut trun = vec![0u8, 0, 0x01, 0]; // version 0, duration-present flag
        trun.extend_from_slice(&(durations.len() as u32).to_be_bytes());
        for d in durations {
            trun.extend_from_slice(&d.to_be_bytes());
        }
        let trun = boxed(b"trun", &trun);

        let tfhd = boxed(b"tfhd", &[0, 0, 0, 0, 0, 0, 0, 1]); // no optional fields
        let mut traf_payload = tfhd;
        traf_payload.extend_from_slice(&trun);
        let traf = boxed(b"traf", &traf_payload);
        boxed(b"moof", &traf)
    }

    fn mdat(len: usize) -> Vec<u8> {
        boxed(b"mdat", &vec![0xAB; len])
    }

    #[test]
    fn scanner_splits_init_then_fragment() {
        let mut scanner = FragmentScanner::new();
        let mut stream = init_block(90_000);
        stream.extend_from_slice(&moof_with_durations(&[45_000, 45_000]));
        stream.extend_from_slice(&mdat(16));

        let events = scanner.push(&stream).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ScanEvent::Init(_)));
        match &events[1] {
            ScanEvent::Fragment { data, duration_ms } => {
                assert_eq!(*duration_ms, 1000); // 90000 ticks @ 90kHz
                assert_eq!(&data[4..8], b"moof");
            }
            other => panic!("expected fragment, got {:?}", other),
        }
        assert_eq!(scanner.timescale(), 90_000);
    }

    #[test]
    fn scanner_handles_split_reads() {
        let mut scanner = FragmentScanner::new();
        let mut stream = init_block(1000);
        stream.extend_from_slice(&moof_with_durations(&[500]));
        stream.extend_from_slice(&mdat(8));

        // feed one byte at a time, as a slow pipe would
        let mut events = Vec::new();
        for b in &stream {
            events.extend(scanner.push(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(events.len(), 2);
        match &events[1] {
            ScanEvent::Fragment { duration_ms, .. } => assert_eq!(*duration_ms, 500),
            other => panic!("expected fragment, got {:?}", other),
        }
    }

    #[test]
    fn scanner_uses_tfhd_default_duration() {
        // trun without per-sample durations, 3 samples
        let mut trun = vec![0u8, 0, 0, 0];
        trun.extend_from_slice(&3u32.to_be_bytes());
        let trun = boxed(b"trun", &trun);

        // tfhd with default-sample-duration flag (0x08)
        let mut tfhd = vec![0u8, 0, 0, 0x08];
        tfhd.extend_from_slice(&1u32.to_be_bytes()); // track id
        tfhd.extend_from_slice(&200u32.to_be_bytes()); // default duration
        let tfhd = boxed(b"tfhd", &tfhd);

        let mut traf_payload = tfhd;
        traf_payload.extend_from_slice(&trun);
        let traf = boxed(b"traf", &traf_payload);
        let moof = boxed(b"moof", &traf);

        let mut scanner = FragmentScanner::new();
        let mut stream = init_block(1000);
        stream.extend_from_slice(&moof);
        stream.extend_from_slice(&mdat(4));

        let events = scanner.push(&stream).unwrap();
        match events.last().unwrap() {
            ScanEvent::Fragment { duration_ms, .. } => assert_eq!(*duration_ms, 600),
            other => panic!("expected fragment, got {:?}", other),
        }
    }

    #[test]
    fn scanner_skips_unknown_boxes() {
        let mut scanner = FragmentScanner::new();
        let mut stream = init_block(1000);
        stream.extend_from_slice(&boxed(b"free", &[0; 12]));
        stream.extend_from_slice(&moof_with_durations(&[1000]));
        stream.extend_from_slice(&mdat(4));

        let events = scanner.push(&stream).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn orphan_mdat_is_dropped() {
        let mut scanner = FragmentScanner::new();
        let mut stream = init_block(1000);
        stream.extend_from_slice(&mdat(4));
        let events = scanner.push(&stream).unwrap();
        assert_eq!(events.len(), 1); // init only
    }

    #[test]
    fn corrupt_box_header_is_an_error() {
        let mut scanner = FragmentScanner::new();
        let events = scanner.push(&init_block(1000)).unwrap();
        assert_eq!(events.len(), 1);

        // a size below 8 can never head a box; the stream is unrecoverable
        let err = scanner
            .push(&[0, 0, 0, 3, 0xde, 0xad, 0xbe, 0xef])
            .unwrap_err();
        assert!(err.to_string().contains("invalid mp4 box size"), "{err}");
    }

    #[test]
    fn corrupt_header_inside_init_scan_is_an_error() {
        let mut scanner = FragmentScanner::new();
        // complete ftyp followed by a garbage header where the moov should be
        let mut stream = boxed(b"ftyp", b"isom");
        stream.extend_from_slice(&[0, 0, 0, 1, b'j', b'u', b'n', b'k']);
        assert!(scanner.push(&stream).is_err());
    }
}
