//! Fragment types shared between the pipeline splitter and the writer.
//!
//! A fragment is one self-contained moof+mdat unit with its own wall-clock
//! timestamp and duration. The initialization block (ftyp+moov) arrives once
//! per pipeline session and is written at the head of every recording file.

use std::collections::VecDeque;

use bytes::Bytes;

/// One self-contained media fragment (moof+mdat).
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Wall-clock timestamp of the fragment start, epoch milliseconds.
    pub timestamp_ms: i64,
    /// Media duration of the fragment in milliseconds.
    pub duration_ms: i64,
    /// Raw fragment bytes.
    pub payload: Bytes,
}

impl Fragment {
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Timestamp one past the end of this fragment's timeline.
    pub fn end_ms(&self) -> i64 {
        self.timestamp_ms + self.duration_ms
    }
}

/// The initialization block (ftyp+moov), fixed until pipeline restart.
#[derive(Debug, Clone)]
pub struct InitSegment {
    pub data: Bytes,
}

impl InitSegment {
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Rolling buffer of the most recent fragments of a stream.
///
/// Holds fragments that arrive while no recording file is open; when one
/// opens, the buffered fragments are appended ahead of the live ones so the
/// file starts a few seconds before the open.
#[derive(Debug, Default)]
pub struct PreBuffer {
    capacity: usize,
    fragments: VecDeque<Fragment>,
}

impl PreBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            fragments: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, fragment: Fragment) {
        if self.capacity == 0 {
            return;
        }
        if self.fragments.len() == self.capacity {
            self.fragments.pop_front();
        }
        self.fragments.push_back(fragment);
    }

    /// Drain the buffered fragments in arrival order.
    pub fn drain(&mut self) -> Vec<Fragment> {
        self.fragments.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}
