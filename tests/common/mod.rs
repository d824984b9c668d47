// Shared helpers for the prefetch integration tests
#![allow(dead_code)]

use krusty_media::{AsyncJobExecutor, MediaPrefetchManager, PrefetchConfig, ReadResult, Status};
use krusty_shared::memory_reader::MemoryGcodeFiles;
use std::sync::Arc;

pub const FILE: &str = "usb/print.gcode";

pub fn create_manager(
    files: &MemoryGcodeFiles,
    buffer_size: usize,
    command_buffer_size: usize,
) -> (MediaPrefetchManager, Arc<AsyncJobExecutor>) {
    let config = PrefetchConfig {
        buffer_size,
        command_buffer_size,
        ..Default::default()
    };
    let executor = Arc::new(AsyncJobExecutor::new("prefetch_test").unwrap());
    let manager = MediaPrefetchManager::new(&config, executor.clone(), Arc::new(files.clone())).unwrap();
    (manager, executor)
}

/// Issue a fetch and wait until the worker is done with it.
pub fn fetch(manager: &MediaPrefetchManager, executor: &AsyncJobExecutor) {
    manager.issue_fetch();
    executor.wait_idle();
}

/// Read commands until the buffer runs dry; returns them and the final status.
pub fn drain(manager: &mut MediaPrefetchManager) -> (Vec<ReadResult>, Status) {
    let mut out = Vec::new();
    loop {
        let mut result = ReadResult::default();
        match manager.read_command(&mut result) {
            Status::Ok => out.push(result),
            status => return (out, status),
        }
    }
}

/// Keep fetching and draining until the stream reports something other than end of buffer.
pub fn read_to_end(manager: &mut MediaPrefetchManager, executor: &AsyncJobExecutor) -> (Vec<ReadResult>, Status) {
    let mut all = Vec::new();
    loop {
        fetch(manager, executor);
        let (mut results, status) = drain(manager);
        let progressed = !results.is_empty();
        all.append(&mut results);
        if status != Status::EndOfBuffer || !progressed {
            return (all, status);
        }
    }
}
