// src/media_prefetch/worker.rs - Fetch routine run on the async job worker
use super::record::{Record, RecordWriter};
use super::{PrefetchShared, ReadTail, Status};
use crate::async_job::AsyncJobExecutionControl;
use krusty_shared::gcode_reader::{GCodeReaderPosition, GcodeReader, StreamError, StreamRestoreInfo};
use std::time::Instant;

/// Line being assembled from the stream.
#[derive(Debug)]
pub(crate) struct CommandBuffer {
    pub data: Vec<u8>,
    /// Capacity of `data`; the stored gcode is at most one byte shorter
    size: usize,
    /// A complete command sits in `data` and waits for space in the ring
    pub flush_pending: bool,
    /// Inside a comment, drop everything until the end of the line
    pub skip_rest_of_line: bool,
    /// Something other than whitespace did not fit into `data`
    pub overflowed: bool,
    pub cropped: bool,
}

impl CommandBuffer {
    fn new(size: usize) -> Self {
        Self {
            data: Vec::with_capacity(size),
            size,
            flush_pending: false,
            skip_rest_of_line: false,
            overflowed: false,
            cropped: false,
        }
    }

    fn reset(&mut self) {
        self.data.clear();
        self.flush_pending = false;
        self.skip_rest_of_line = false;
        self.overflowed = false;
        self.cropped = false;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WriteTail {
    pub buffer_pos: usize,
    /// Stream position as last written into the ring
    pub gcode_pos: GCodeReaderPosition,
}

/// State private to the worker.
pub(crate) struct WorkerState {
    pub reader: Option<Box<dyn GcodeReader>>,
    /// Offset of the next character the reader returns
    pub gcode_reader_pos: u32,
    pub write_tail: WriteTail,
    /// Snapshot of the manager's read head, the end of our writable region
    pub read_head: usize,
    pub command: CommandBuffer,
    /// Restore info of the last reader we closed, for reopening it later
    pub closed_restore_info: StreamRestoreInfo,
}

impl WorkerState {
    pub fn new(command_buffer_size: usize) -> Self {
        Self {
            reader: None,
            gcode_reader_pos: 0,
            write_tail: WriteTail::default(),
            read_head: 0,
            command: CommandBuffer::new(command_buffer_size),
            closed_restore_info: StreamRestoreInfo::default(),
        }
    }

    /// Fresh state continuing right after the last published command.
    fn starting_at(read_tail: &ReadTail, command_buffer_size: usize) -> Self {
        Self {
            gcode_reader_pos: read_tail.gcode_pos.offset,
            write_tail: WriteTail {
                buffer_pos: read_tail.buffer_pos,
                gcode_pos: read_tail.gcode_pos,
            },
            closed_restore_info: read_tail.gcode_pos.restore_info,
            ..Self::new(command_buffer_size)
        }
    }

    fn close_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.closed_restore_info = reader.restore_info();
        }
    }
}

impl PrefetchShared {
    /// One fetch: (re)open the reader if needed and fill the ring until it is
    /// full, the stream ends or errors.
    pub(crate) fn fetch_routine(&self, control: &AsyncJobExecutionControl) {
        let started = Instant::now();

        let mut worker = self.worker.lock();
        let w = &mut *worker;

        let mut reader_needs_initialization = w.reader.is_none();

        // Copy what we need so that the reader is opened outside of the lock
        let (filepath, fetch_requested) = {
            let mut s = self.state.lock();

            if control.is_discarded() {
                return;
            }

            if s.worker_reset_pending {
                s.worker_reset_pending = false;
                reader_needs_initialization = true;
                *w = WorkerState::starting_at(&s.read_tail, self.command_buffer_size);
            }

            // The end of the region we can write to
            w.read_head = s.read_head;

            (s.filepath.clone(), s.fetch_requested)
        };

        tracing::debug!("Fetch start '{}' from {}", filepath, w.gcode_reader_pos);

        if reader_needs_initialization {
            // First drop the old reader, never hold two at once
            w.close_reader();

            if filepath.is_empty() {
                // No file, we were only asked to close the reader
                return;
            }

            if !self.open_reader(control, w, &filepath) {
                return;
            }
        } else if let Some(reader) = w.reader.as_mut() {
            reader.update_validity(&filepath);
        }

        if !fetch_requested {
            return;
        }

        let initial_gcode_pos = w.gcode_reader_pos;

        // Keep fetching until we run out of space
        loop {
            // A failed flush means the ring is full, continue with the next fetch
            if w.command.flush_pending && !self.fetch_flush_command(control, w) {
                tracing::debug!("Flush command stopped: {} {}", w.write_tail.buffer_pos, w.read_head);
                break;
            }

            if !self.fetch_command(control, w) {
                break;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            "Fetch stop at {}, fetched {}, took {} ms",
            w.gcode_reader_pos,
            w.gcode_reader_pos - initial_gcode_pos,
            duration_ms
        );

        let mut s = self.state.lock();
        if !control.is_discarded() {
            s.last_fetch_duration_ms = Some(duration_ms);
        }
    }

    /// Opens the reader at the worker's stream position. On failure the
    /// error is published and false returned.
    fn open_reader(&self, control: &AsyncJobExecutionControl, w: &mut WorkerState, filepath: &str) -> bool {
        let Some(mut reader) = self.reader_factory.open(filepath) else {
            tracing::debug!("Fetch open failed");

            let mut s = self.state.lock();
            if !control.is_discarded() {
                s.read_tail.status = Status::UsbError;
            }
            return false;
        };

        reader.update_validity(filepath);
        reader.set_restore_info(w.closed_restore_info);

        if let Err(error) = reader.stream_gcode_start(w.gcode_reader_pos) {
            tracing::debug!("Fetch start stream fail: {}", error);
            // Reader is dropped here, the next fetch starts over
            self.fetch_report_error(control, w, error);
            return false;
        }

        tracing::debug!("Fetch reader (re)opened");

        let stream_size_estimate = reader.gcode_stream_size_estimate();
        w.reader = Some(reader);

        let mut s = self.state.lock();
        if control.is_discarded() {
            return false;
        }
        s.stream_size_estimate = stream_size_estimate;
        true
    }

    /// Writes the pending command (with any metadata it needs) into the ring
    /// and publishes it. False if it doesn't fit yet or the job was discarded.
    fn fetch_flush_command(&self, control: &AsyncJobExecutionControl, w: &mut WorkerState) -> bool {
        let restore_info = w
            .reader
            .as_ref()
            .map_or(w.write_tail.gcode_pos.restore_info, |reader| reader.restore_info());
        let offset = w.gcode_reader_pos;

        let mut records: Vec<Record<'_>> = Vec::with_capacity(4);

        if restore_info != w.write_tail.gcode_pos.restore_info {
            records.push(Record::RestoreInfoUpdate(restore_info));
        }

        if offset != w.write_tail.gcode_pos.offset {
            debug_assert!(offset >= w.write_tail.gcode_pos.offset);
            let offset_diff = offset - w.write_tail.gcode_pos.offset;
            match u8::try_from(offset_diff) {
                Ok(diff) => records.push(Record::IncrementalOffsetUpdate(diff)),
                Err(_) => records.push(Record::OffsetUpdate(offset)),
            }
        }

        if w.command.cropped {
            records.push(Record::CroppedFlag);
        }

        records.push(Record::PlainGcode(&w.command.data));

        {
            let mut ring = self.ring.lock();
            let mut writer = RecordWriter::new(&mut ring, &mut w.write_tail.buffer_pos, w.read_head);
            if !writer.write_records(&records) {
                return false;
            }
        }
        drop(records);

        w.write_tail.gcode_pos = GCodeReaderPosition { offset, restore_info };

        {
            let mut s = self.state.lock();

            if control.is_discarded() {
                return false;
            }

            s.commands_in_buffer += 1;

            // Publish only now that a gcode is the last record: read_command
            // must be able to finish once it starts reading
            s.read_tail = ReadTail {
                buffer_pos: w.write_tail.buffer_pos,
                gcode_pos: w.write_tail.gcode_pos,
                status: Status::EndOfBuffer,
            };

            // Pick up space the manager freed in the meantime
            w.read_head = s.read_head;
        }

        w.command.reset();
        true
    }

    /// Pulls one character into the command buffer. False stops the fetch.
    fn fetch_command(&self, control: &AsyncJobExecutionControl, w: &mut WorkerState) -> bool {
        let Some(reader) = w.reader.as_mut() else {
            return false;
        };

        let ch = match reader.stream_getc() {
            Ok(ch) => {
                w.gcode_reader_pos += 1;
                ch
            }
            // EOF with an unterminated last line: flush it first
            Err(StreamError::EndOfFile) if !w.command.data.is_empty() => b'\n',
            Err(error) => {
                self.fetch_report_error(control, w, error);
                return false;
            }
        };

        let cmd = &mut w.command;

        if ch == b'\n' {
            // Trailing whitespace doesn't count against the limit
            compact_gcode(&mut cmd.data);

            if cmd.overflowed || cmd.data.len() >= cmd.size {
                tracing::warn!("Warning: gcode didn't fit in the command buffer, cropped");
                cmd.data.truncate(cmd.size - 1);
                compact_gcode(&mut cmd.data);
                cmd.cropped = true;
                tracing::warn!("Cropped gcode: {}", String::from_utf8_lossy(&cmd.data));
            }

            // Empty line, keep on reading
            if cmd.data.is_empty() {
                cmd.reset();
                return true;
            }

            cmd.flush_pending = true;
        } else if ch == b';' {
            cmd.skip_rest_of_line = true;
        } else if cmd.data.is_empty() && ch.is_ascii_whitespace() {
            // Leading whitespace
        } else if !cmd.skip_rest_of_line {
            if cmd.data.len() < cmd.size {
                cmd.data.push(ch);
            } else if !ch.is_ascii_whitespace() {
                // Longer lines get cropped and executed anyway, with a warning
                cmd.overflowed = true;
            }
        }

        true
    }

    /// Publishes the status a stream error maps to. Hard errors make the next
    /// fetch restart from the last published position.
    fn fetch_report_error(&self, control: &AsyncJobExecutionControl, w: &mut WorkerState, error: StreamError) {
        tracing::debug!("Read error: {}", error);

        let status = Status::from(&error);
        let is_error = status.is_error();

        // Release the handle as soon as possible, unless it's worth retrying
        if status != Status::EndOfBuffer {
            w.close_reader();
        }

        // Check the discard under the lock, stop() discards before locking
        let mut s = self.state.lock();
        if control.is_discarded() {
            return;
        }

        s.read_tail.status = status;
        s.worker_reset_pending |= is_error;
    }
}

/// Drops trailing whitespace (including the `\r` of CRLF files).
fn compact_gcode(data: &mut Vec<u8>) {
    while data.last().is_some_and(|ch| ch.is_ascii_whitespace()) {
        data.pop();
    }
}
