// src/media_prefetch/record.rs - Tagged records stored in the prefetch ring
use super::prefetch_fatal;
use super::ring_buffer::RingBuffer;
use krusty_shared::gcode_reader::{RESTORE_INFO_SIZE, StreamRestoreInfo};

/// Record tag, the first byte of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// u8 length + non-terminated gcode bytes
    PlainGcode = 0,

    // 1 is taken by compressed gcode in the firmware format, not produced here

    /// StreamRestoreInfo follows. Emitted whenever the stream restore info changes.
    RestoreInfoUpdate = 2,

    /// u32 absolute stream offset follows
    OffsetUpdate = 3,

    /// u8 offset increase follows
    IncrementalOffsetUpdate = 4,

    /// The following gcode did not fit the command buffer and was cropped. No data.
    CroppedFlag = 5,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::PlainGcode,
            2 => Self::RestoreInfoUpdate,
            3 => Self::OffsetUpdate,
            4 => Self::IncrementalOffsetUpdate,
            5 => Self::CroppedFlag,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: RecordType,
}

/// Fixed-size value that can be stored in the ring.
pub trait Entry: Sized {
    const SIZE: usize;

    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
}

/// Largest `Entry::SIZE`, for stack scratch buffers.
const MAX_ENTRY_SIZE: usize = RESTORE_INFO_SIZE;

impl Entry for u8 {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = *self;
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl Entry for u32 {
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        u32::from_le_bytes(raw)
    }
}

impl Entry for StreamRestoreInfo {
    const SIZE: usize = RESTORE_INFO_SIZE;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; RESTORE_INFO_SIZE];
        raw.copy_from_slice(bytes);
        StreamRestoreInfo::from_bytes(raw)
    }
}

impl Entry for RecordHeader {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.record_type as u8;
    }

    fn decode(bytes: &[u8]) -> Self {
        match RecordType::try_from(bytes[0]) {
            Ok(record_type) => Self { record_type },
            Err(tag) => {
                tracing::error!("Unknown prefetch record tag {}", tag);
                prefetch_fatal("unknown record type")
            }
        }
    }
}

/// One record as written to or decoded from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'a> {
    PlainGcode(&'a [u8]),
    RestoreInfoUpdate(StreamRestoreInfo),
    OffsetUpdate(u32),
    IncrementalOffsetUpdate(u8),
    CroppedFlag,
}

impl Record<'_> {
    /// Encoded size including the header.
    pub fn encoded_len(&self) -> usize {
        RecordHeader::SIZE
            + match self {
                Record::PlainGcode(gcode) => u8::SIZE + gcode.len(),
                Record::RestoreInfoUpdate(_) => StreamRestoreInfo::SIZE,
                Record::OffsetUpdate(_) => u32::SIZE,
                Record::IncrementalOffsetUpdate(_) => u8::SIZE,
                Record::CroppedFlag => 0,
            }
    }

    fn record_type(&self) -> RecordType {
        match self {
            Record::PlainGcode(_) => RecordType::PlainGcode,
            Record::RestoreInfoUpdate(_) => RecordType::RestoreInfoUpdate,
            Record::OffsetUpdate(_) => RecordType::OffsetUpdate,
            Record::IncrementalOffsetUpdate(_) => RecordType::IncrementalOffsetUpdate,
            Record::CroppedFlag => RecordType::CroppedFlag,
        }
    }
}

/// Upper bound of bytes one flushed command can take (all metadata records
/// plus the gcode itself). The ring must be strictly larger than this.
pub fn max_flush_size(max_gcode_len: usize) -> usize {
    Record::RestoreInfoUpdate(StreamRestoreInfo::default()).encoded_len()
        + Record::OffsetUpdate(0).encoded_len()
        + Record::CroppedFlag.encoded_len()
        + RecordHeader::SIZE
        + u8::SIZE
        + max_gcode_len
}

/// Worker-side view of the ring: writes at its own tail, bounded by the last
/// known read head.
pub struct RecordWriter<'a> {
    ring: &'a mut RingBuffer,
    write_pos: &'a mut usize,
    read_head: usize,
}

impl<'a> RecordWriter<'a> {
    pub fn new(ring: &'a mut RingBuffer, write_pos: &'a mut usize, read_head: usize) -> Self {
        Self { ring, write_pos, read_head }
    }

    pub fn can_write_entry_raw(&self, bytes: usize) -> bool {
        self.ring.can_write(*self.write_pos, self.read_head, bytes)
    }

    pub fn write_entry_raw(&mut self, data: &[u8]) {
        self.ring.write(self.write_pos, self.read_head, data);
    }

    pub fn write_entry<T: Entry>(&mut self, value: &T) {
        let mut scratch = [0u8; MAX_ENTRY_SIZE];
        value.encode(&mut scratch[..T::SIZE]);
        self.write_entry_raw(&scratch[..T::SIZE]);
    }

    /// Writes all `records` or nothing. Returns false if they don't fit.
    pub fn write_records(&mut self, records: &[Record<'_>]) -> bool {
        let total: usize = records.iter().map(Record::encoded_len).sum();
        if !self.can_write_entry_raw(total) {
            return false;
        }

        for record in records {
            self.write_entry(&RecordHeader {
                record_type: record.record_type(),
            });
            match record {
                Record::PlainGcode(gcode) => {
                    // One byte encodes the length
                    let Ok(len) = u8::try_from(gcode.len()) else {
                        prefetch_fatal("gcode too long for a record");
                    };
                    self.write_entry(&len);
                    self.write_entry_raw(gcode);
                }
                Record::RestoreInfoUpdate(info) => self.write_entry(info),
                Record::OffsetUpdate(offset) => self.write_entry(offset),
                Record::IncrementalOffsetUpdate(diff) => self.write_entry(diff),
                Record::CroppedFlag => {}
            }
        }

        true
    }
}

/// Manager-side view of the ring: reads at the head, bounded by the published tail.
pub struct RecordReader<'a> {
    ring: &'a RingBuffer,
    read_pos: &'a mut usize,
    read_tail: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(ring: &'a RingBuffer, read_pos: &'a mut usize, read_tail: usize) -> Self {
        Self { ring, read_pos, read_tail }
    }

    pub fn can_read_entry_raw(&self, bytes: usize) -> bool {
        self.ring.can_read(*self.read_pos, self.read_tail, bytes)
    }

    pub fn read_entry_raw(&mut self, out: &mut [u8]) {
        self.ring.read(self.read_pos, self.read_tail, out);
    }

    pub fn read_entry<T: Entry>(&mut self) -> T {
        let mut scratch = [0u8; MAX_ENTRY_SIZE];
        self.read_entry_raw(&mut scratch[..T::SIZE]);
        T::decode(&scratch[..T::SIZE])
    }

    /// Decodes the next record. Gcode bytes land in `gcode`, which the
    /// returned `PlainGcode` borrows.
    pub fn read_record<'b>(&mut self, gcode: &'b mut Vec<u8>) -> Record<'b> {
        let header: RecordHeader = self.read_entry();
        match header.record_type {
            RecordType::PlainGcode => {
                let len = self.read_entry::<u8>() as usize;
                gcode.clear();
                gcode.resize(len, 0);
                self.read_entry_raw(gcode);
                Record::PlainGcode(gcode.as_slice())
            }
            RecordType::RestoreInfoUpdate => Record::RestoreInfoUpdate(self.read_entry()),
            RecordType::OffsetUpdate => Record::OffsetUpdate(self.read_entry()),
            RecordType::IncrementalOffsetUpdate => Record::IncrementalOffsetUpdate(self.read_entry()),
            RecordType::CroppedFlag => Record::CroppedFlag,
        }
    }
}
