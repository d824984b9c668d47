// krusty_shared/src/gcode_reader.rs - Stream reader interface used by the media prefetch pipeline
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

/// Size of the opaque restore token in bytes.
pub const RESTORE_INFO_SIZE: usize = 16;

/// Opaque state a reader needs to reopen a stream mid-way (container block
/// positions, decompressor bookkeeping, ...). Plain files leave it zeroed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRestoreInfo(pub [u8; RESTORE_INFO_SIZE]);

impl StreamRestoreInfo {
    pub fn as_bytes(&self) -> &[u8; RESTORE_INFO_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; RESTORE_INFO_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Resumable position in a gcode stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCodeReaderPosition {
    /// Byte offset into the gcode stream
    pub offset: u32,
    pub restore_info: StreamRestoreInfo,
}

impl GCodeReaderPosition {
    pub fn at_offset(offset: u32) -> Self {
        Self {
            offset,
            restore_info: StreamRestoreInfo::default(),
        }
    }
}

/// Non-OK outcomes of a stream operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("end of file")]
    EndOfFile,
    /// Low level transport could not deliver data in time, try again later
    #[error("timeout")]
    Timeout,
    #[error("IO error: {0}")]
    Io(String),
    /// Requested region is not available (yet), e.g. a file still being downloaded
    #[error("out of valid range")]
    OutOfRange,
    #[error("stream corrupted")]
    Corrupt,
}

/// Sequential gcode stream source.
pub trait GcodeReader: Send {
    /// Re-evaluate which parts of the file are readable (partial downloads).
    fn update_validity(&mut self, path: &str);

    fn set_restore_info(&mut self, info: StreamRestoreInfo);

    fn restore_info(&self) -> StreamRestoreInfo;

    /// Position the gcode stream at `offset`.
    fn stream_gcode_start(&mut self, offset: u32) -> Result<(), StreamError>;

    /// Next character of the gcode stream.
    fn stream_getc(&mut self) -> Result<u8, StreamError>;

    fn gcode_stream_size_estimate(&self) -> u32;
}

/// Opens readers for file paths. `None` means the file could not be opened.
pub trait GcodeReaderFactory: Send + Sync {
    fn open(&self, path: &str) -> Option<Box<dyn GcodeReader>>;
}

/// Which byte ranges of a partially transferred file are present.
///
/// `None` as the reader's validity means the whole file is available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileValidity {
    pub total_size: u64,
    pub valid_head: Option<Range<u64>>,
    pub valid_tail: Option<Range<u64>>,
}

impl FileValidity {
    /// Nothing is available yet.
    pub fn nothing(total_size: u64) -> Self {
        Self {
            total_size,
            valid_head: None,
            valid_tail: None,
        }
    }

    /// Only the first `len` bytes are available.
    pub fn head(total_size: u64, len: u64) -> Self {
        Self {
            total_size,
            valid_head: Some(0..len),
            valid_tail: None,
        }
    }

    pub fn range_valid(&self, start: u64, end: u64) -> bool {
        debug_assert!(start <= end);
        if start == end {
            return true;
        }

        // Reads past the end of the file are the EOF's business, not ours
        let end = end.min(self.total_size);
        let inside = |part: &Option<Range<u64>>| match part {
            Some(r) => start >= r.start && end <= r.end,
            None => false,
        };

        inside(&self.valid_head) || inside(&self.valid_tail)
    }
}

/// Checks a range against an optional validity (no validity = whole file valid).
pub fn range_valid(validity: Option<&FileValidity>, start: u64, end: u64) -> bool {
    validity.map_or(true, |v| v.range_valid(start, end))
}
