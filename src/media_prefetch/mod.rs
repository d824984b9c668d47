// src/media_prefetch/mod.rs - Media prefetch ring buffer pipeline
//
// A background worker reads the gcode stream and stores compacted lines as
// records in a ring buffer; the print executor pops them one at a time with
// `read_command`. Only the cursors are shared under a mutex: the bytes between
// `read_tail` and the worker's `write_tail` belong to the worker until they are
// published, the bytes between `read_head` and `read_tail` belong to the reader.

pub mod record;
pub mod ring_buffer;
mod worker;

#[cfg(test)]
mod tests;

use crate::async_job::{AsyncJob, AsyncJobExecutor};
use crate::config::{ConfigError, PrefetchConfig};
use krusty_shared::gcode_reader::{GCodeReaderPosition, GcodeReaderFactory, StreamError};
use parking_lot::Mutex;
use record::{Record, RecordReader};
use ring_buffer::RingBuffer;
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use worker::WorkerState;

const PREFETCH_FATAL_TITLE: &str = "Prefetch error";

/// Logs and aborts on a broken pipeline invariant. Continuing would corrupt
/// the stream position.
#[track_caller]
pub(crate) fn prefetch_fatal(what: &str) -> ! {
    tracing::error!("{}: {}", PREFETCH_FATAL_TITLE, what);
    panic!("{}: {}", PREFETCH_FATAL_TITLE, what);
}

/// Outcome of `read_command` and the published state of the buffer tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// A command was read
    Ok,
    /// Nothing buffered right now, more may come after a fetch
    #[default]
    EndOfBuffer,
    /// The whole stream was read
    EndOfFile,
    /// The stream is corrupted
    Corruption,
    /// Reading the media failed
    UsbError,
    /// The requested part of the file is not available yet
    NotDownloaded,
}

impl Status {
    /// Statuses that need intervention outside the pipeline (reinserting the
    /// media, waiting for a download, aborting the print).
    pub fn is_error(self) -> bool {
        matches!(self, Status::Corruption | Status::UsbError | Status::NotDownloaded)
    }
}

impl From<&StreamError> for Status {
    fn from(error: &StreamError) -> Self {
        match error {
            StreamError::EndOfFile => Status::EndOfFile,
            StreamError::Timeout => Status::EndOfBuffer,
            StreamError::Io(_) => Status::UsbError,
            StreamError::OutOfRange => Status::NotDownloaded,
            StreamError::Corrupt => Status::Corruption,
        }
    }
}

/// One decoded command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResult {
    /// Compacted line exactly as stored, not necessarily UTF-8
    pub gcode: Vec<u8>,
    /// Position that re-reads this command when resumed from
    pub replay_pos: GCodeReaderPosition,
    /// Position right after this command
    pub resume_pos: GCodeReaderPosition,
    /// The command was longer than the command buffer and got truncated
    pub cropped: bool,
}

impl ReadResult {
    /// The gcode for display; invalid UTF-8 is replaced.
    pub fn gcode_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.gcode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub commands_in_buffer: usize,
    pub stream_size_estimate: u32,
    pub buffer_occupancy_percent: u8,
    pub tail_status: Status,
    pub last_fetch_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReadTail {
    pub buffer_pos: usize,
    /// Stream position after the last published command
    pub gcode_pos: GCodeReaderPosition,
    pub status: Status,
}

/// State shared between the manager and the worker, always under `PrefetchShared::state`.
#[derive(Debug)]
pub(crate) struct SharedState {
    /// Written only by the manager
    pub read_head: usize,
    /// Written only by the worker
    pub read_tail: ReadTail,
    pub stream_size_estimate: u32,
    /// Tells the worker to drop its reader and restart from `read_tail`
    pub worker_reset_pending: bool,
    /// False for the file-closing job issued by `stop`
    pub fetch_requested: bool,
    pub commands_in_buffer: usize,
    pub filepath: String,
    pub last_fetch_duration_ms: Option<u64>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            read_head: 0,
            read_tail: ReadTail::default(),
            stream_size_estimate: 0,
            // A fresh worker has nothing worth keeping
            worker_reset_pending: true,
            fetch_requested: false,
            commands_in_buffer: 0,
            filepath: String::new(),
            last_fetch_duration_ms: None,
        }
    }
}

/// Everything the worker job needs, owned jointly by the manager and the job.
pub(crate) struct PrefetchShared {
    pub state: Mutex<SharedState>,
    pub ring: Mutex<RingBuffer>,
    /// Only ever locked by the (single) worker
    pub worker: Mutex<WorkerState>,
    pub reader_factory: Arc<dyn GcodeReaderFactory>,
    pub command_buffer_size: usize,
    /// Ring capacity, readable without the ring lock
    pub buffer_size: usize,
}

/// Prefetches gcode from media into memory ahead of the print executor.
pub struct MediaPrefetchManager {
    shared: Arc<PrefetchShared>,
    worker_job: AsyncJob,
    /// Position after the last command returned by `read_command`
    resume_pos: GCodeReaderPosition,
    gcode_scratch: Vec<u8>,
    ready_threshold_percent: u8,
}

impl MediaPrefetchManager {
    pub fn new(
        config: &PrefetchConfig,
        executor: Arc<AsyncJobExecutor>,
        reader_factory: Arc<dyn GcodeReaderFactory>,
    ) -> Result<Self, ConfigError> {
        // The worker routine is not written for parallel execution
        assert_eq!(AsyncJobExecutor::worker_count(), 1);
        config.validate()?;

        let shared = PrefetchShared {
            state: Mutex::new(SharedState::default()),
            ring: Mutex::new(RingBuffer::new(config.buffer_size)),
            worker: Mutex::new(WorkerState::new(config.command_buffer_size)),
            reader_factory,
            command_buffer_size: config.command_buffer_size,
            buffer_size: config.buffer_size,
        };

        Ok(Self {
            shared: Arc::new(shared),
            worker_job: AsyncJob::new(executor),
            resume_pos: GCodeReaderPosition::default(),
            gcode_scratch: Vec::with_capacity(config.command_buffer_size),
            ready_threshold_percent: config.ready_threshold_percent,
        })
    }

    /// Decode the next command into `result`. Never blocks.
    ///
    /// Returns `Status::Ok` if a command was read, otherwise the status of the
    /// buffer tail (`result` is left untouched then).
    pub fn read_command(&mut self, result: &mut ReadResult) -> Status {
        let mut state = self.shared.state.lock();
        let s = &mut *state;

        if s.read_head == s.read_tail.buffer_pos {
            if s.read_tail.status == Status::Ok {
                prefetch_fatal("empty buffer published with ok status");
            }
            return s.read_tail.status;
        }

        let ring = self.shared.ring.lock();
        let mut reader = RecordReader::new(&ring, &mut s.read_head, s.read_tail.buffer_pos);

        let resume_pos = &mut self.resume_pos;
        result.replay_pos = *resume_pos;
        result.cropped = false;

        // The worker only publishes data that ends with a gcode record, so
        // once we start reading we always reach one
        loop {
            match reader.read_record(&mut self.gcode_scratch) {
                Record::OffsetUpdate(offset) => resume_pos.offset = offset,
                Record::IncrementalOffsetUpdate(diff) => resume_pos.offset += u32::from(diff),
                Record::RestoreInfoUpdate(info) => resume_pos.restore_info = info,
                Record::CroppedFlag => result.cropped = true,
                Record::PlainGcode(gcode) => {
                    result.gcode.clear();
                    result.gcode.extend_from_slice(gcode);
                    break;
                }
            }
        }

        result.resume_pos = *resume_pos;

        // The advanced read_head hands the space back to the worker
        if s.commands_in_buffer == 0 {
            prefetch_fatal("command read but none accounted");
        }
        s.commands_in_buffer -= 1;
        Status::Ok
    }

    /// Prepare prefetching of `filepath` from `position`. Data arrives after `issue_fetch`.
    pub fn start(&mut self, filepath: &str, position: GCodeReaderPosition) {
        self.stop();

        tracing::debug!("Media prefetch start '{}' {}", filepath, position.offset);

        let mut s = self.shared.state.lock();
        s.filepath = filepath.to_string();
        s.worker_reset_pending = true;
        s.read_tail.gcode_pos = position;
        s.read_tail.status = Status::EndOfBuffer;
        self.resume_pos = position;
    }

    /// Drop all buffered data and the current job. The worker's file handle
    /// gets closed by a follow-up job.
    pub fn stop(&mut self) {
        tracing::debug!("Media prefetch stop");

        // Discard first: the job checks the flag under the state lock
        self.worker_job.discard();

        {
            let mut s = self.shared.state.lock();
            *s = SharedState::default();
            self.resume_pos = GCodeReaderPosition::default();
        }

        // A job with fetch_requested == false only closes the reader
        let shared = self.shared.clone();
        self.worker_job.issue(move |control| shared.fetch_routine(control));
    }

    /// Ask the worker to top up the buffer. Cheap if a fetch is already running.
    pub fn issue_fetch(&self) {
        {
            let mut s = self.shared.state.lock();
            if self.worker_job.is_active() && s.fetch_requested {
                return;
            }
            s.fetch_requested = true;
        }

        tracing::debug!("Media prefetch issue fetch");
        let shared = self.shared.clone();
        self.worker_job.issue(move |control| shared.fetch_routine(control));
    }

    /// True if nothing is buffered and nothing terminal was reached.
    pub fn check_buffer_empty(&self) -> bool {
        let s = self.shared.state.lock();
        s.read_head == s.read_tail.buffer_pos && s.read_tail.status == Status::EndOfBuffer
    }

    /// Enough is buffered to start printing without starving right away.
    pub fn check_ready_to_start_print(&self) -> bool {
        let metrics = self.get_metrics();
        metrics.buffer_occupancy_percent > self.ready_threshold_percent || metrics.tail_status == Status::EndOfFile
    }

    pub fn get_metrics(&self) -> Metrics {
        let s = self.shared.state.lock();
        let capacity = self.shared.buffer_size;
        let occupied = RingBuffer::occupied(capacity, s.read_head, s.read_tail.buffer_pos);
        Metrics {
            commands_in_buffer: s.commands_in_buffer,
            stream_size_estimate: s.stream_size_estimate,
            buffer_occupancy_percent: (occupied * 100 / capacity) as u8,
            tail_status: s.read_tail.status,
            last_fetch_duration_ms: s.last_fetch_duration_ms,
        }
    }
}

impl Drop for MediaPrefetchManager {
    fn drop(&mut self) {
        // No fetch may outlive the manager
        self.worker_job.discard_and_wait();
    }
}
