// krusty_shared/src/memory_reader.rs - In-memory gcode sources for simulation and testing
//
// Files live in a shared table so a test can change them (extend a download,
// inject faults) while a reader opened on them is in use.

use crate::gcode_reader::{GcodeReader, GcodeReaderFactory, StreamError, StreamRestoreInfo};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;

/// Error returned by `stream_getc` when the stream reaches `at`.
#[derive(Debug, Clone)]
pub struct Fault {
    pub at: u32,
    pub error: StreamError,
    /// Fire only once, then disappear (even for readers opened later)
    pub once: bool,
}

#[derive(Debug, Default)]
struct MemoryFile {
    data: Vec<u8>,
    faults: Vec<Fault>,
    /// (offset, token): token reported once the stream reaches the offset
    restore_points: Vec<(u32, StreamRestoreInfo)>,
    /// Bytes beyond this are reported as not downloaded
    valid_len: Option<u32>,
    pause_at: Option<u32>,
}

/// What readers did, for assertions.
#[derive(Debug, Default, Clone)]
pub struct ReaderLog {
    pub opens: usize,
    pub failed_opens: usize,
    /// (offset, restore info set before the start)
    pub stream_starts: Vec<(u32, StreamRestoreInfo)>,
    pub validity_updates: usize,
}

#[derive(Debug, Default)]
struct PauseState {
    reached: bool,
    released: bool,
}

/// Blocks a reader at a chosen offset until released.
#[derive(Debug, Default)]
pub struct PauseGate {
    state: Mutex<PauseState>,
    cond: Condvar,
}

impl PauseGate {
    fn arrive(&self) {
        let mut state = self.state.lock();
        state.reached = true;
        self.cond.notify_all();
        while !state.released {
            self.cond.wait(&mut state);
        }
    }

    /// Wait until a reader is parked at the pause offset.
    pub fn wait_reached(&self) {
        let mut state = self.state.lock();
        while !state.reached {
            self.cond.wait(&mut state);
        }
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        state.released = true;
        self.cond.notify_all();
    }
}

/// Table of in-memory gcode files, usable as a reader factory.
#[derive(Debug, Default, Clone)]
pub struct MemoryGcodeFiles {
    files: Arc<Mutex<HashMap<String, Arc<Mutex<MemoryFile>>>>>,
    log: Arc<Mutex<ReaderLog>>,
    gate: Arc<PauseGate>,
}

impl MemoryGcodeFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        let file = MemoryFile {
            data: data.into(),
            ..Default::default()
        };
        self.files.lock().insert(path.to_string(), Arc::new(Mutex::new(file)));
    }

    pub fn add_fault(&self, path: &str, fault: Fault) {
        if let Some(file) = self.file(path) {
            file.lock().faults.push(fault);
        }
    }

    pub fn add_restore_point(&self, path: &str, offset: u32, info: StreamRestoreInfo) {
        if let Some(file) = self.file(path) {
            let mut file = file.lock();
            file.restore_points.push((offset, info));
            file.restore_points.sort_by_key(|(offset, _)| *offset);
        }
    }

    pub fn set_valid_len(&self, path: &str, valid_len: Option<u32>) {
        if let Some(file) = self.file(path) {
            file.lock().valid_len = valid_len;
        }
    }

    /// Park the next reader that reaches `offset` until `gate().release()`.
    pub fn pause_at(&self, path: &str, offset: u32) {
        if let Some(file) = self.file(path) {
            file.lock().pause_at = Some(offset);
        }
    }

    pub fn gate(&self) -> Arc<PauseGate> {
        self.gate.clone()
    }

    pub fn log(&self) -> ReaderLog {
        self.log.lock().clone()
    }

    fn file(&self, path: &str) -> Option<Arc<Mutex<MemoryFile>>> {
        self.files.lock().get(path).cloned()
    }
}

impl GcodeReaderFactory for MemoryGcodeFiles {
    fn open(&self, path: &str) -> Option<Box<dyn GcodeReader>> {
        let Some(file) = self.file(path) else {
            self.log.lock().failed_opens += 1;
            return None;
        };
        self.log.lock().opens += 1;
        let valid_len = file.lock().valid_len;
        Some(Box::new(MemoryGcodeReader {
            file,
            log: self.log.clone(),
            gate: self.gate.clone(),
            pos: 0,
            restore_info: StreamRestoreInfo::default(),
            valid_len,
        }))
    }
}

/// Reader over one `MemoryGcodeFiles` entry.
pub struct MemoryGcodeReader {
    file: Arc<Mutex<MemoryFile>>,
    log: Arc<Mutex<ReaderLog>>,
    gate: Arc<PauseGate>,
    pos: u32,
    restore_info: StreamRestoreInfo,
    valid_len: Option<u32>,
}

impl GcodeReader for MemoryGcodeReader {
    fn update_validity(&mut self, _path: &str) {
        self.valid_len = self.file.lock().valid_len;
        self.log.lock().validity_updates += 1;
    }

    fn set_restore_info(&mut self, info: StreamRestoreInfo) {
        self.restore_info = info;
    }

    fn restore_info(&self) -> StreamRestoreInfo {
        let file = self.file.lock();
        file.restore_points
            .iter()
            .rev()
            .find(|(offset, _)| *offset <= self.pos)
            .map(|(_, info)| *info)
            .unwrap_or(self.restore_info)
    }

    fn stream_gcode_start(&mut self, offset: u32) -> Result<(), StreamError> {
        self.log.lock().stream_starts.push((offset, self.restore_info));
        if offset as usize > self.file.lock().data.len() {
            return Err(StreamError::Io(format!("seek past end: {}", offset)));
        }
        self.pos = offset;
        Ok(())
    }

    fn stream_getc(&mut self) -> Result<u8, StreamError> {
        let pause = {
            let mut file = self.file.lock();
            if file.pause_at == Some(self.pos) {
                file.pause_at = None;
                true
            } else {
                false
            }
        };
        if pause {
            self.gate.arrive();
        }

        let mut file = self.file.lock();

        if let Some(idx) = file.faults.iter().position(|f| f.at == self.pos) {
            let fault = file.faults[idx].clone();
            if fault.once {
                file.faults.remove(idx);
            }
            return Err(fault.error);
        }

        if self.valid_len.is_some_and(|len| self.pos >= len) && (self.pos as usize) < file.data.len() {
            return Err(StreamError::OutOfRange);
        }

        match file.data.get(self.pos as usize) {
            Some(ch) => {
                self.pos += 1;
                Ok(*ch)
            }
            None => Err(StreamError::EndOfFile),
        }
    }

    fn gcode_stream_size_estimate(&self) -> u32 {
        self.file.lock().data.len() as u32
    }
}
