//! Gatevault - continuous video archive engine for the gate controller
//!
//! Turns the live fragmented-MP4 stream of each camera into a durable,
//! byte-indexed archive and reconstructs arbitrary time windows of it as
//! playable HLS segments and manifests, while a capacity manager keeps
//! disk usage of every storage volume inside its configured bounds.
//!
//! - **`fragment`** / **`mp4`**: fragment types and the incremental fMP4
//!   splitter that feeds them from a raw pipeline byte stream
//! - **`index`**: SQLite-backed archive index (recordings, chunks, volumes)
//! - **`writer`**: segment writer, one per active stream
//! - **`playback`**: manifest builder and byte-range reconstruction
//! - **`capacity`**: space-bounded eviction of the oldest recordings
//! - **`lifecycle`**: per-stream supervisor of the video pipeline subprocess
//! - **`web`**: axum HTTP surface (init / m4s / m3u8)

pub mod capacity;
pub mod config;
pub mod fragment;
pub mod index;
pub mod lifecycle;
pub mod mp4;
pub mod playback;
pub mod web;
pub mod writer;

pub use config::Config;
pub use fragment::{Fragment, InitSegment, PreBuffer};
pub use index::{ArchiveIndex, Chunk, Recording, StorageVolume};
pub use playback::{ManifestEntry, ReconstructionKey};
pub use writer::SegmentWriter;
