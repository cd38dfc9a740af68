//! Queue state machine: writer, reader, replay, reclamation.

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Instant,
};

use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::{
    frame::{read_frame, write_frame, FrameStatus, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD},
    OverflowPolicy, QueueConfig, SyncPolicy,
};

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".dat";
const HEAD_FILE: &str = "head";
const HEAD_TMP_FILE: &str = "head.tmp";

/// With the batched sync policy, how many appends may accumulate before the
/// active segment is fsynced.
pub(crate) const SYNC_BATCH_RECORDS: usize = 64;

/// Error opening or replaying a queue directory.
#[derive(Debug, Snafu)]
pub enum OpenError {
    /// The queue directory could not be created or scanned.
    #[snafu(display("failed to prepare queue directory {}: {}", path.display(), source))]
    Directory {
        /// The offending directory.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// A segment file could not be replayed.
    #[snafu(display("failed to replay segment {}: {}", path.display(), source))]
    Replay {
        /// The offending segment file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
}

/// Error appending a frame.
#[derive(Debug, Snafu)]
pub enum PushError {
    /// The queue is at capacity and the overflow policy refused the frame.
    #[snafu(display("queue is full ({} records)", capacity))]
    Full {
        /// Configured capacity, in records.
        capacity: usize,
    },
    /// The frame exceeds [`MAX_FRAME_PAYLOAD`].
    #[snafu(display("record of {} bytes exceeds the frame limit", size))]
    RecordTooLarge {
        /// Size of the rejected payload.
        size: usize,
    },
    /// An I/O error occurred during the append.
    #[snafu(display("queue write I/O error: {}", source))]
    PushIo {
        /// The underlying error.
        source: io::Error,
    },
}

/// Error reading frames.
#[derive(Debug, Snafu)]
pub enum ReadError {
    /// An I/O error occurred while reading a segment.
    #[snafu(display("queue read I/O error: {}", source))]
    ReadIo {
        /// The underlying error.
        source: io::Error,
    },
}

/// Error acknowledging frames.
#[derive(Debug, Snafu)]
pub enum AckError {
    /// The head file or a segment could not be updated.
    #[snafu(display("queue acknowledge I/O error: {}", source))]
    AckIo {
        /// The underlying error.
        source: io::Error,
    },
}

/// One frame handed to the reader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueRecord {
    /// Monotonic sequence number, unique across restarts.
    pub seq: u64,
    /// The frame payload as written.
    pub payload: Vec<u8>,
}

/// Outcome of a successful push.
#[derive(Clone, Copy, Debug)]
pub struct PushOutcome {
    /// Sequence number assigned to the pushed frame.
    pub seq: u64,
    /// Frames discarded by the `drop-oldest` overflow policy to make room.
    pub dropped: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
struct Position {
    segment: u64,
    offset: u64,
}

#[derive(Debug)]
struct SegmentMeta {
    index: u64,
    path: PathBuf,
    /// Byte length of the valid frame region. Bytes past this point are a
    /// torn tail from a previous run and are never read.
    committed_len: u64,
    records: usize,
    sealed: bool,
}

#[derive(Debug, Default)]
struct State {
    segments: VecDeque<SegmentMeta>,
    active: Option<File>,
    head: Position,
    read_pos: Position,
    acked_seq: u64,
    next_seq: u64,
    next_segment_index: u64,
    /// Frames in [head, tail): everything still occupying disk.
    unacked_records: usize,
    /// Frames in [read_pos, tail): everything not yet handed to the reader.
    unread_records: usize,
    appends_since_sync: usize,
}

impl Default for Position {
    fn default() -> Self {
        Position {
            segment: 1,
            offset: 0,
        }
    }
}

struct Shared {
    config: QueueConfig,
    state: Mutex<State>,
    space: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn segment_path(&self, index: u64) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{SEGMENT_PREFIX}{index:010}{SEGMENT_SUFFIX}"))
    }

    fn persist_head(&self, state: &State) -> io::Result<()> {
        let tmp = self.config.data_dir.join(HEAD_TMP_FILE);
        let line = format!(
            "v1 {} {} {}\n",
            state.head.segment, state.head.offset, state.acked_seq
        );
        {
            let mut file = File::create(&tmp)?;
            file.write_all(line.as_bytes())?;
            if self.config.sync == SyncPolicy::Always {
                file.sync_data()?;
            }
        }
        fs::rename(&tmp, self.config.data_dir.join(HEAD_FILE))
    }

    /// Skips head past sealed, fully consumed segments and deletes them,
    /// along with any segment left wholly below the head.
    fn reclaim(&self, state: &mut State) {
        loop {
            let deletable = match state.segments.front() {
                Some(front) => {
                    let consumed = front.sealed
                        && state.head.segment == front.index
                        && state.head.offset >= front.committed_len;
                    consumed || front.index < state.head.segment
                }
                None => false,
            };
            if !deletable {
                break;
            }
            let front = state
                .segments
                .pop_front()
                .expect("front presence just checked");
            if let Err(error) = fs::remove_file(&front.path) {
                warn!(
                    message = "Failed to delete consumed queue segment.",
                    path = %front.path.display(),
                    %error,
                );
            } else {
                debug!(
                    message = "Deleted consumed queue segment.",
                    segment = front.index,
                );
            }
            let next = state
                .segments
                .front()
                .map(|s| s.index)
                .unwrap_or(state.next_segment_index);
            if state.head.segment < next {
                state.head = Position {
                    segment: next,
                    offset: 0,
                };
            }
            if state.read_pos < state.head {
                state.read_pos = state.head;
            }
        }
    }
}

/// Appending side of the queue.
pub struct QueueWriter {
    shared: Arc<Shared>,
}

/// Consuming side of the queue.
pub struct QueueReader {
    shared: Arc<Shared>,
    /// Frames handed out by `read` but not yet acknowledged, in order.
    pending: VecDeque<(u64, Position)>,
}

/// Opens (or creates) the queue rooted at the configured directory and
/// replays any frames left over from a previous run.
///
/// The tail segment of a previous run is sealed at its last valid frame and
/// writing resumes in a fresh segment, so torn bytes from a crash are never
/// appended after.
pub fn open(config: QueueConfig) -> Result<(QueueWriter, QueueReader), OpenError> {
    let dir = config.data_dir.clone();
    fs::create_dir_all(&dir).context(DirectorySnafu { path: dir.clone() })?;

    let mut indexes = Vec::new();
    let entries = fs::read_dir(&dir).context(DirectorySnafu { path: dir.clone() })?;
    for entry in entries {
        let entry = entry.context(DirectorySnafu { path: dir.clone() })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(index) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|digits| digits.parse::<u64>().ok())
        {
            indexes.push((index, entry.path()));
        }
    }
    indexes.sort_unstable_by_key(|(index, _)| *index);

    let mut segments = VecDeque::with_capacity(indexes.len());
    let mut next_seq = 1u64;
    let mut total_records = 0usize;
    for (index, path) in indexes {
        let (committed_len, records, max_seq) =
            replay_segment(&path).context(ReplaySnafu { path: path.clone() })?;
        if let Some(max_seq) = max_seq {
            next_seq = next_seq.max(max_seq + 1);
        }
        total_records += records;
        segments.push_back(SegmentMeta {
            index,
            path,
            committed_len,
            records,
            sealed: true,
        });
    }

    let (mut head, acked_seq) = read_head_file(&dir).unwrap_or_else(|| {
        (
            segments
                .front()
                .map(|s| Position {
                    segment: s.index,
                    offset: 0,
                })
                .unwrap_or_default(),
            0,
        )
    });

    // Segments wholly below the head were fully consumed; a crash between
    // persisting the head and deleting them leaves them behind.
    while segments.front().is_some_and(|s| s.index < head.segment) {
        let stale = segments.pop_front().expect("front presence just checked");
        total_records -= stale.records;
        if let Err(error) = fs::remove_file(&stale.path) {
            warn!(
                message = "Failed to delete stale queue segment.",
                path = %stale.path.display(),
                %error,
            );
        }
    }

    if let Some(seg) = segments.iter().find(|s| s.index == head.segment) {
        // A head recorded past the committed region of its segment (possible
        // if the segment itself lost a torn tail) is clamped back to the
        // committed end so replay stays within valid frames.
        head.offset = head.offset.min(seg.committed_len);
    } else if let Some(front) = segments.front() {
        // The head's segment is gone but later segments exist; everything in
        // them is unconsumed.
        head = Position {
            segment: front.index,
            offset: 0,
        };
    } else if head.offset > 0 {
        // Fully drained queue whose tail segment was already deleted; the
        // next segment starts fresh past the recorded one.
        head = Position {
            segment: head.segment + 1,
            offset: 0,
        };
    }

    let next_segment_index = segments
        .back()
        .map(|s| s.index + 1)
        .unwrap_or(head.segment)
        .max(1);
    // Sequence numbers stay monotonic even when every frame was consumed
    // and its segment deleted before the restart.
    next_seq = next_seq.max(acked_seq + 1);

    let consumed =
        count_records_before(&segments, head).context(DirectorySnafu { path: dir.clone() })?;
    let unacked = total_records.saturating_sub(consumed);

    let shared = Arc::new(Shared {
        config,
        state: Mutex::new(State {
            segments,
            active: None,
            head,
            read_pos: head,
            acked_seq,
            next_seq,
            next_segment_index,
            unacked_records: unacked,
            unread_records: unacked,
            appends_since_sync: 0,
        }),
        space: Condvar::new(),
    });
    {
        let mut state = shared.lock();
        shared.reclaim(&mut state);
    }

    debug!(
        message = "Opened queue.",
        path = %dir.display(),
        replayed_records = unacked,
    );

    Ok((
        QueueWriter {
            shared: Arc::clone(&shared),
        },
        QueueReader {
            shared,
            pending: VecDeque::new(),
        },
    ))
}

fn replay_segment(path: &Path) -> io::Result<(u64, usize, Option<u64>)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut committed = 0u64;
    let mut records = 0usize;
    let mut max_seq = None;
    loop {
        match read_frame(&mut reader)? {
            FrameStatus::Valid { seq, payload } => {
                committed += (FRAME_HEADER_LEN + payload.len()) as u64;
                records += 1;
                max_seq = Some(max_seq.map_or(seq, |m: u64| m.max(seq)));
            }
            FrameStatus::Torn => {
                warn!(
                    message = "Sealing queue segment at torn frame.",
                    path = %path.display(),
                    committed_bytes = committed,
                );
                break;
            }
            FrameStatus::EndOfSegment => break,
        }
    }
    Ok((committed, records, max_seq))
}

fn read_head_file(dir: &Path) -> Option<(Position, u64)> {
    let content = fs::read_to_string(dir.join(HEAD_FILE)).ok()?;
    let mut parts = content.split_whitespace();
    if parts.next() != Some("v1") {
        warn!(message = "Ignoring head file with unknown version.");
        return None;
    }
    let segment = parts.next()?.parse().ok()?;
    let offset = parts.next()?.parse().ok()?;
    let acked_seq = parts.next()?.parse().ok()?;
    Some((Position { segment, offset }, acked_seq))
}

fn count_records_before(segments: &VecDeque<SegmentMeta>, head: Position) -> io::Result<usize> {
    let mut consumed = 0;
    for segment in segments {
        if segment.index < head.segment {
            consumed += segment.records;
        } else if segment.index == head.segment && head.offset > 0 {
            let file = File::open(&segment.path)?;
            let mut reader = BufReader::new(file.take(head.offset));
            while let FrameStatus::Valid { .. } = read_frame(&mut reader)? {
                consumed += 1;
            }
        }
    }
    Ok(consumed)
}

impl QueueWriter {
    /// Appends one frame, applying the overflow policy when at capacity.
    pub fn push(&self, payload: &[u8]) -> Result<PushOutcome, PushError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(PushError::RecordTooLarge {
                size: payload.len(),
            });
        }

        let shared = &self.shared;
        let mut state = shared.lock();

        let capacity = shared.config.capacity_records;
        let mut dropped = 0usize;
        while state.unacked_records >= capacity {
            match shared.config.overflow {
                OverflowPolicy::Reject => return Err(PushError::Full { capacity }),
                OverflowPolicy::DropOldest => {
                    drop_oldest(shared, &mut state).context(PushIoSnafu)?;
                    dropped += 1;
                }
                OverflowPolicy::BlockWithTimeout(timeout) => {
                    let deadline = Instant::now() + timeout;
                    while state.unacked_records >= capacity {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Err(PushError::Full { capacity });
                        }
                        let (next, _result) = shared
                            .space
                            .wait_timeout(state, remaining)
                            .unwrap_or_else(|e| e.into_inner());
                        state = next;
                    }
                }
            }
        }

        self.ensure_active_segment(&mut state).context(PushIoSnafu)?;

        let seq = state.next_seq;
        let sync = shared.config.sync;
        let flush_now = match sync {
            SyncPolicy::Always => true,
            SyncPolicy::Batched => state.appends_since_sync + 1 >= SYNC_BATCH_RECORDS,
            SyncPolicy::Never => false,
        };
        let written = {
            let file = state.active.as_mut().expect("active segment just ensured");
            let written = write_frame(file, seq, payload).context(PushIoSnafu)?;
            if flush_now {
                file.sync_data().context(PushIoSnafu)?;
            }
            written
        };

        state.next_seq += 1;
        state.appends_since_sync = if flush_now {
            0
        } else {
            state.appends_since_sync + 1
        };
        let tail = state
            .segments
            .back_mut()
            .expect("active segment implies tail meta");
        tail.committed_len += written as u64;
        tail.records += 1;
        state.unacked_records += 1;
        state.unread_records += 1;

        Ok(PushOutcome { seq, dropped })
    }

    /// Number of frames on disk that have not been acknowledged.
    pub fn pending_records(&self) -> usize {
        self.shared.lock().unacked_records
    }

    fn ensure_active_segment(&self, state: &mut State) -> io::Result<()> {
        let needs_rotation = match state.segments.back() {
            Some(tail) if !tail.sealed => tail.records >= self.shared.config.max_segment_records,
            _ => true,
        };
        if !needs_rotation {
            return Ok(());
        }

        if let (Some(tail), Some(file)) = (state.segments.back_mut(), state.active.as_mut()) {
            if !tail.sealed {
                if self.shared.config.sync != SyncPolicy::Never {
                    file.sync_data()?;
                }
                tail.sealed = true;
            }
        }
        state.active = None;

        let index = state.next_segment_index;
        let path = self.shared.segment_path(index);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        state.next_segment_index += 1;
        state.segments.push_back(SegmentMeta {
            index,
            path,
            committed_len: 0,
            records: 0,
            sealed: false,
        });
        state.active = Some(file);
        state.appends_since_sync = 0;
        Ok(())
    }
}

/// Advances the head past the oldest frame on disk.
fn drop_oldest(shared: &Shared, state: &mut State) -> io::Result<()> {
    shared.reclaim(state);
    let (path, skip) = match state.segments.front() {
        Some(front)
            if state.head.segment == front.index && state.head.offset < front.committed_len =>
        {
            (front.path.clone(), state.head.offset)
        }
        _ => return Ok(()),
    };

    // Only the frame length is needed to advance; the first four header
    // bytes carry it.
    let mut file = File::open(&path)?;
    file.seek(SeekFrom::Start(skip))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as u64;

    let was_unread = state.read_pos == state.head;
    state.head.offset += 8 + len;
    state.unacked_records = state.unacked_records.saturating_sub(1);
    if was_unread {
        state.unread_records = state.unread_records.saturating_sub(1);
    }
    if state.read_pos < state.head {
        state.read_pos = state.head;
    }
    shared.reclaim(state);
    shared.persist_head(state)?;
    Ok(())
}

impl QueueReader {
    /// Reads up to `max_records` frames from the current read position.
    ///
    /// Returned frames stay on disk until [`ack`](Self::ack)ed; an empty
    /// vector means nothing unread is available right now.
    pub fn read(&mut self, max_records: usize) -> Result<Vec<QueueRecord>, ReadError> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();
        let mut out = Vec::new();

        while out.len() < max_records && state.unread_records > 0 {
            let current = state.read_pos;
            let (seg_index, seg_path, seg_committed, seg_sealed) = match state
                .segments
                .iter()
                .find(|s| s.index == current.segment)
            {
                Some(s) => (s.index, s.path.clone(), s.committed_len, s.sealed),
                // The read position points at a segment that does not exist
                // yet (fully drained queue); nothing more to read.
                None => break,
            };

            if current.offset >= seg_committed {
                if seg_sealed {
                    let next = state
                        .segments
                        .iter()
                        .map(|s| s.index)
                        .find(|index| *index > current.segment)
                        .unwrap_or(state.next_segment_index);
                    state.read_pos = Position {
                        segment: next,
                        offset: 0,
                    };
                    continue;
                }
                break;
            }

            let mut file = File::open(&seg_path).context(ReadIoSnafu)?;
            file.seek(SeekFrom::Start(current.offset))
                .context(ReadIoSnafu)?;
            let budget = seg_committed - current.offset;
            let mut reader = BufReader::new(file.take(budget));

            while out.len() < max_records && state.read_pos.offset < seg_committed {
                match read_frame(&mut reader).context(ReadIoSnafu)? {
                    FrameStatus::Valid { seq, payload } => {
                        state.read_pos.offset += (FRAME_HEADER_LEN + payload.len()) as u64;
                        state.unread_records = state.unread_records.saturating_sub(1);
                        self.pending.push_back((seq, state.read_pos));
                        out.push(QueueRecord { seq, payload });
                    }
                    FrameStatus::Torn | FrameStatus::EndOfSegment => {
                        // Committed bytes never contain torn frames, so this
                        // indicates outside interference with the file.
                        warn!(
                            message = "Unreadable frame inside committed queue region.",
                            segment = seg_index,
                            offset = state.read_pos.offset,
                        );
                        state.read_pos.offset = seg_committed;
                        break;
                    }
                }
            }
        }

        Ok(out)
    }

    /// Acknowledges every read frame with a sequence number up to and
    /// including `through_seq`, advancing the durable head and deleting
    /// segments that became fully consumed.
    pub fn ack(&mut self, through_seq: u64) -> Result<(), AckError> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();

        let mut last = None;
        let mut acked = 0usize;
        while let Some((seq, end)) = self.pending.front().copied() {
            if seq > through_seq {
                break;
            }
            self.pending.pop_front();
            if end > state.head {
                acked += 1;
            }
            last = Some((seq, end));
        }
        let Some((seq, end)) = last else {
            return Ok(());
        };

        if end > state.head {
            state.head = end;
            state.unacked_records = state.unacked_records.saturating_sub(acked);
        }
        state.acked_seq = state.acked_seq.max(seq);
        shared.reclaim(&mut state);
        shared.persist_head(&state).context(AckIoSnafu)?;
        shared.space.notify_all();
        Ok(())
    }

    /// Number of frames on disk that have not been acknowledged.
    pub fn pending_records(&self) -> usize {
        self.shared.lock().unacked_records
    }

    /// True when every frame ever pushed has been acknowledged.
    pub fn is_drained(&self) -> bool {
        self.pending_records() == 0
    }
}
