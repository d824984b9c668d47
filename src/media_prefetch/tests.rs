// src/media_prefetch/tests.rs - Tests that look at the manager's internal state
use super::*;
use krusty_shared::gcode_reader::StreamRestoreInfo;
use krusty_shared::memory_reader::{Fault, MemoryGcodeFiles};
use super::record::RecordType;

const FILE: &str = "usb/test.gcode";

fn manager_with(files: &MemoryGcodeFiles, buffer_size: usize, command_buffer_size: usize) -> (MediaPrefetchManager, Arc<AsyncJobExecutor>) {
    let config = PrefetchConfig {
        buffer_size,
        command_buffer_size,
        ..Default::default()
    };
    let executor = Arc::new(AsyncJobExecutor::new("prefetch_test").unwrap());
    let manager = MediaPrefetchManager::new(&config, executor.clone(), Arc::new(files.clone())).unwrap();
    (manager, executor)
}

fn fetch(manager: &MediaPrefetchManager, executor: &AsyncJobExecutor) {
    manager.issue_fetch();
    executor.wait_idle();
}

fn line(ch: char) -> String {
    // 25 characters plus the newline
    format!("G1 X{}\n", ch.to_string().repeat(21))
}

#[test]
fn test_flush_is_all_or_nothing_when_ring_is_full() {
    let files = MemoryGcodeFiles::new();
    files.insert(FILE, format!("{}{}{}", line('1'), line('2'), line('3')));
    let (mut manager, executor) = manager_with(&files, 60, 32);

    manager.start(FILE, GCodeReaderPosition::default());
    fetch(&manager, &executor);

    // Each command takes 2 (offset) + 2 (header, length) + 25 bytes
    {
        let s = manager.shared.state.lock();
        assert_eq!(s.commands_in_buffer, 2);
        assert_eq!(s.read_tail.buffer_pos, 58);
        assert_eq!(s.read_tail.status, Status::EndOfBuffer);
        assert_eq!(s.read_tail.gcode_pos.offset, 52);
    }
    {
        let worker = manager.shared.worker.lock();
        assert_eq!(worker.write_tail.buffer_pos, 58);
        assert!(worker.command.flush_pending);
    }
    {
        // The third record did not leave a single byte behind
        let ring = manager.shared.ring.lock();
        assert_eq!(&ring.bytes()[58..60], &[0, 0]);
    }

    // Freeing the first record makes exactly enough room, wrapping around
    let mut result = ReadResult::default();
    assert_eq!(manager.read_command(&mut result), Status::Ok);
    assert_eq!(manager.shared.state.lock().read_head, 29);
    fetch(&manager, &executor);

    {
        let s = manager.shared.state.lock();
        assert_eq!(s.read_tail.buffer_pos, 27);
        assert_eq!(s.commands_in_buffer, 2);
        assert_eq!(s.read_tail.status, Status::EndOfFile);
    }

    for expected in ['2', '3'] {
        assert_eq!(manager.read_command(&mut result), Status::Ok);
        assert_eq!(format!("{}\n", result.gcode_str()), line(expected));
    }
    assert_eq!(result.resume_pos.offset, 78);
    assert_eq!(manager.read_command(&mut result), Status::EndOfFile);
}

#[test]
fn test_corruption_restarts_from_last_published_command() {
    let files = MemoryGcodeFiles::new();
    files.insert(FILE, "G1 X1\nG1 X2\nG1 X3\n");
    files.add_fault(
        FILE,
        Fault {
            at: 9,
            error: StreamError::Corrupt,
            once: true,
        },
    );
    let (mut manager, executor) = manager_with(&files, 256, 32);

    manager.start(FILE, GCodeReaderPosition::default());
    fetch(&manager, &executor);

    {
        let s = manager.shared.state.lock();
        assert_eq!(s.read_tail.status, Status::Corruption);
        assert!(s.worker_reset_pending);
        assert_eq!(s.read_tail.gcode_pos.offset, 6);
    }
    assert!(manager.shared.worker.lock().reader.is_none());

    let mut result = ReadResult::default();
    assert_eq!(manager.read_command(&mut result), Status::Ok);
    assert_eq!(result.gcode, b"G1 X1");
    assert_eq!(manager.read_command(&mut result), Status::Corruption);

    fetch(&manager, &executor);
    let log = files.log();
    assert_eq!(log.stream_starts.last().map(|(offset, _)| *offset), Some(6));
    assert!(!manager.shared.state.lock().worker_reset_pending);

    assert_eq!(manager.read_command(&mut result), Status::Ok);
    assert_eq!(result.gcode, b"G1 X2");
    assert_eq!(result.replay_pos.offset, 6);
    assert_eq!(result.resume_pos.offset, 12);
    assert_eq!(manager.read_command(&mut result), Status::Ok);
    assert_eq!(result.gcode, b"G1 X3");
    assert_eq!(manager.read_command(&mut result), Status::EndOfFile);
}

#[test]
fn test_reopen_carries_restore_info_of_last_command() {
    let files = MemoryGcodeFiles::new();
    files.insert(FILE, "G28\nG1 X1\nG1 X2\n");
    let info = StreamRestoreInfo([0xAB; 16]);
    files.add_restore_point(FILE, 4, info);
    files.add_fault(
        FILE,
        Fault {
            at: 12,
            error: StreamError::Io("unplugged".to_string()),
            once: true,
        },
    );
    let (mut manager, executor) = manager_with(&files, 256, 32);

    manager.start(FILE, GCodeReaderPosition::default());
    fetch(&manager, &executor);
    assert_eq!(manager.shared.state.lock().read_tail.status, Status::UsbError);

    fetch(&manager, &executor);
    let log = files.log();
    assert_eq!(log.opens, 2);
    assert_eq!(log.stream_starts.last(), Some(&(10, info)));
}

#[test]
fn test_stop_resets_shared_state() {
    let files = MemoryGcodeFiles::new();
    files.insert(FILE, "G28\nG1 X1\n");
    let (mut manager, executor) = manager_with(&files, 256, 32);

    manager.start(FILE, GCodeReaderPosition::default());
    fetch(&manager, &executor);
    assert_eq!(manager.shared.state.lock().commands_in_buffer, 2);

    manager.stop();
    executor.wait_idle();

    let s = manager.shared.state.lock();
    assert_eq!(s.read_head, 0);
    assert_eq!(s.read_tail.buffer_pos, 0);
    assert_eq!(s.commands_in_buffer, 0);
    assert!(s.filepath.is_empty());
    // The close job consumed the reset
    assert!(!s.worker_reset_pending);
    drop(s);
    assert!(manager.shared.worker.lock().reader.is_none());
}

#[test]
fn test_restore_info_written_only_when_it_changes() {
    let files = MemoryGcodeFiles::new();
    files.insert(FILE, "G28\nG1 X1\nG1 X2\n");
    files.add_restore_point(FILE, 4, StreamRestoreInfo([0x11; 16]));
    let (mut manager, executor) = manager_with(&files, 256, 32);

    manager.start(FILE, GCodeReaderPosition::default());
    fetch(&manager, &executor);

    // First command: token (17) + offset (2) + gcode (5), the others only offset + gcode
    assert_eq!(manager.shared.state.lock().read_tail.buffer_pos, 24 + 9 + 9);
    let ring = manager.shared.ring.lock();
    assert_eq!(ring.bytes()[0], RecordType::RestoreInfoUpdate as u8);
    assert_eq!(ring.bytes()[24], RecordType::IncrementalOffsetUpdate as u8);
    assert_eq!(ring.bytes()[33], RecordType::IncrementalOffsetUpdate as u8);
}

#[test]
fn test_offset_gap_of_256_is_absolute() {
    // (comment length, tag of the first record, bytes of the offset record)
    for (comment_len, tag, offset_record_len) in [
        (250usize, RecordType::IncrementalOffsetUpdate, 2usize),
        (251, RecordType::OffsetUpdate, 5),
    ] {
        let files = MemoryGcodeFiles::new();
        files.insert(FILE, format!(";{}\nG1\n", "x".repeat(comment_len)));
        let (mut manager, executor) = manager_with(&files, 256, 32);

        manager.start(FILE, GCodeReaderPosition::default());
        fetch(&manager, &executor);

        assert_eq!(manager.shared.state.lock().read_tail.buffer_pos, offset_record_len + 4);
        assert_eq!(manager.shared.ring.lock().bytes()[0], tag as u8);

        let mut result = ReadResult::default();
        assert_eq!(manager.read_command(&mut result), Status::Ok);
        assert_eq!(result.gcode, b"G1");
        assert_eq!(result.resume_pos.offset, comment_len as u32 + 5);
    }
}

#[test]
fn test_metrics_do_not_take_the_ring_lock() {
    let files = MemoryGcodeFiles::new();
    files.insert(FILE, "G28\n");
    let (mut manager, executor) = manager_with(&files, 256, 32);

    manager.start(FILE, GCodeReaderPosition::default());
    fetch(&manager, &executor);

    let _ring = manager.shared.ring.lock();
    let metrics = manager.get_metrics();
    assert_eq!(metrics.commands_in_buffer, 1);
    assert_eq!(metrics.buffer_occupancy_percent, (7 * 100 / 256) as u8);
    assert!(!manager.check_buffer_empty());
}
