//! Persistent segmented FIFO.
//!
//! The queue is a directory of numbered segment files, each holding a
//! length-prefixed, checksummed sequence of frames, plus a sidecar head file
//! that records the next-to-consume position. The writer only ever appends,
//! the reader only ever advances, and segment files are never mutated in
//! place: a segment is deleted as a whole once every frame in it has been
//! acknowledged.
//!
//! Crash safety follows from the frame format. A frame that was only
//! partially written before a crash fails its length or checksum validation
//! during replay, and the segment is sealed at the last valid frame. Sealed
//! bytes past that point are ignored forever; the writer resumes in a fresh
//! segment.
//!
//! One writer and one reader exist per queue. Both sides share the in-memory
//! index under a single mutex, which also backs the `block-with-timeout`
//! overflow policy via a condvar.

#![deny(missing_docs)]

mod frame;
mod queue;

use std::{path::PathBuf, time::Duration};

pub use frame::MAX_FRAME_PAYLOAD;
pub use queue::{
    open, AckError, OpenError, PushError, PushOutcome, QueueReader, QueueRecord, QueueWriter,
    ReadError,
};

const DEFAULT_MAX_SEGMENT_RECORDS: usize = 500;
const DEFAULT_CAPACITY_RECORDS: usize = 50_000;

/// How eagerly appended frames are forced to disk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SyncPolicy {
    /// `fsync` after every append. Slowest, loses nothing on crash.
    Always,
    /// `fsync` every 64 appends and on segment rotation.
    #[default]
    Batched,
    /// Never `fsync` explicitly; the OS page cache decides.
    Never,
}

/// What `push` does when the queue is at capacity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Fail the push with [`PushError::Full`].
    #[default]
    Reject,
    /// Advance the head past the oldest unconsumed frames to make room.
    DropOldest,
    /// Wait up to the given duration for the reader to make room, then fail
    /// the push with [`PushError::Full`].
    BlockWithTimeout(Duration),
}

/// Queue configuration.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub(crate) data_dir: PathBuf,
    pub(crate) max_segment_records: usize,
    pub(crate) capacity_records: usize,
    pub(crate) sync: SyncPolicy,
    pub(crate) overflow: OverflowPolicy,
}

impl QueueConfig {
    /// Starts building a configuration for a queue rooted at `data_dir`.
    ///
    /// The directory is created on open if it does not exist. It must be
    /// unique per queue; two queues sharing a directory corrupt each other.
    pub fn from_path(data_dir: impl Into<PathBuf>) -> QueueConfigBuilder {
        QueueConfigBuilder {
            data_dir: data_dir.into(),
            max_segment_records: None,
            capacity_records: None,
            sync: None,
            overflow: None,
        }
    }
}

/// Builder for [`QueueConfig`].
pub struct QueueConfigBuilder {
    data_dir: PathBuf,
    max_segment_records: Option<usize>,
    capacity_records: Option<usize>,
    sync: Option<SyncPolicy>,
    overflow: Option<OverflowPolicy>,
}

impl QueueConfigBuilder {
    /// Sets the maximum number of frames per segment file.
    ///
    /// Smaller segments reclaim disk sooner after acknowledgement at the cost
    /// of more files. Defaults to 500.
    pub fn max_segment_records(mut self, records: usize) -> Self {
        self.max_segment_records = Some(records);
        self
    }

    /// Sets the maximum number of unconsumed frames held across all segments.
    ///
    /// Pushing past this limit triggers the overflow policy. Defaults to
    /// 50,000.
    pub fn capacity_records(mut self, records: usize) -> Self {
        self.capacity_records = Some(records);
        self
    }

    /// Sets the fsync policy. Defaults to [`SyncPolicy::Batched`].
    pub fn sync(mut self, sync: SyncPolicy) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Sets the overflow policy. Defaults to [`OverflowPolicy::Reject`].
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = Some(overflow);
        self
    }

    /// Consumes this builder and constructs a `QueueConfig`.
    pub fn build(self) -> QueueConfig {
        QueueConfig {
            data_dir: self.data_dir,
            max_segment_records: self
                .max_segment_records
                .unwrap_or(DEFAULT_MAX_SEGMENT_RECORDS)
                .max(1),
            capacity_records: self
                .capacity_records
                .unwrap_or(DEFAULT_CAPACITY_RECORDS)
                .max(1),
            sync: self.sync.unwrap_or_default(),
            overflow: self.overflow.unwrap_or_default(),
        }
    }
}
