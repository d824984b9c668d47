// src/file_reader.rs - Plain gcode files on the local filesystem
use krusty_shared::gcode_reader::{
    range_valid, FileValidity, GcodeReader, GcodeReaderFactory, StreamError, StreamRestoreInfo,
};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

const READ_BUFFER_SIZE: usize = 4096;

/// Opens `PlainGcodeReader`s. A file is considered still downloading while
/// `<path><partial_suffix>` exists next to it.
#[derive(Debug, Clone)]
pub struct FileReaderFactory {
    partial_suffix: String,
}

impl FileReaderFactory {
    pub fn new(partial_suffix: &str) -> Self {
        Self {
            partial_suffix: partial_suffix.to_string(),
        }
    }
}

impl GcodeReaderFactory for FileReaderFactory {
    fn open(&self, path: &str) -> Option<Box<dyn GcodeReader>> {
        if path.is_empty() {
            return None;
        }
        if path.ends_with(".bgcode") {
            tracing::warn!("Binary gcode is not supported: '{}'", path);
            return None;
        }

        match File::open(path) {
            Ok(file) => {
                tracing::debug!("Opened gcode file '{}'", path);
                Some(Box::new(PlainGcodeReader::new(file, &self.partial_suffix)))
            }
            Err(e) => {
                tracing::warn!("Failed to open gcode file '{}': {}", path, e);
                None
            }
        }
    }
}

/// Sequential reader over a plain text gcode file.
pub struct PlainGcodeReader {
    file: BufReader<File>,
    partial_suffix: String,
    /// `None` while the whole file is available
    validity: Option<FileValidity>,
    file_size: u64,
    pos: u64,
    restore_info: StreamRestoreInfo,
}

impl PlainGcodeReader {
    fn new(file: File, partial_suffix: &str) -> Self {
        let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Self {
            file: BufReader::with_capacity(READ_BUFFER_SIZE, file),
            partial_suffix: partial_suffix.to_string(),
            validity: None,
            file_size,
            pos: 0,
            restore_info: StreamRestoreInfo::default(),
        }
    }
}

fn map_io_error(e: std::io::Error) -> StreamError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => StreamError::Timeout,
        _ => StreamError::Io(e.to_string()),
    }
}

impl GcodeReader for PlainGcodeReader {
    fn update_validity(&mut self, path: &str) {
        if let Ok(size) = self.file.get_ref().metadata().map(|m| m.len()) {
            self.file_size = size;
        }

        let marker = format!("{}{}", path, self.partial_suffix);
        self.validity = if Path::new(&marker).exists() {
            Some(FileValidity::head(self.file_size, self.file_size))
        } else {
            None
        };
    }

    fn set_restore_info(&mut self, info: StreamRestoreInfo) {
        self.restore_info = info;
    }

    fn restore_info(&self) -> StreamRestoreInfo {
        self.restore_info
    }

    fn stream_gcode_start(&mut self, offset: u32) -> Result<(), StreamError> {
        let offset = u64::from(offset);
        if offset > self.file_size {
            return Err(StreamError::Io(format!(
                "start offset {} past end of file ({} bytes)",
                offset, self.file_size
            )));
        }
        self.file.seek(SeekFrom::Start(offset)).map_err(map_io_error)?;
        self.pos = offset;
        Ok(())
    }

    fn stream_getc(&mut self) -> Result<u8, StreamError> {
        if self.validity.is_some() && !range_valid(self.validity.as_ref(), self.pos, self.pos + 1) {
            return Err(StreamError::OutOfRange);
        }

        let mut byte = [0u8; 1];
        loop {
            match self.file.read(&mut byte) {
                Ok(0) => {
                    // A file still being written only ends when the download does
                    return Err(if self.validity.is_some() {
                        StreamError::OutOfRange
                    } else {
                        StreamError::EndOfFile
                    });
                }
                Ok(_) => {
                    self.pos += 1;
                    return Ok(byte[0]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io_error(e)),
            }
        }
    }

    fn gcode_stream_size_estimate(&self) -> u32 {
        u32::try_from(self.file_size).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::tempdir;

    fn read_to_end(reader: &mut dyn GcodeReader) -> (Vec<u8>, StreamError) {
        let mut out = Vec::new();
        loop {
            match reader.stream_getc() {
                Ok(ch) => out.push(ch),
                Err(e) => return (out, e),
            }
        }
    }

    #[test]
    fn test_read_whole_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part.gcode");
        fs::write(&path, "G28\nG1 X10\n").unwrap();
        let path = path.to_str().unwrap();

        let factory = FileReaderFactory::new(".part");
        let mut reader = factory.open(path).unwrap();
        reader.update_validity(path);
        reader.stream_gcode_start(0).unwrap();
        assert_eq!(reader.gcode_stream_size_estimate(), 11);

        let (data, end) = read_to_end(reader.as_mut());
        assert_eq!(data, b"G28\nG1 X10\n");
        assert_eq!(end, StreamError::EndOfFile);
    }

    #[test]
    fn test_start_at_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part.gcode");
        fs::write(&path, "G28\nG1 X10\n").unwrap();
        let path = path.to_str().unwrap();

        let mut reader = FileReaderFactory::new(".part").open(path).unwrap();
        reader.stream_gcode_start(4).unwrap();
        let (data, _) = read_to_end(reader.as_mut());
        assert_eq!(data, b"G1 X10\n");

        assert!(matches!(reader.stream_gcode_start(100), Err(StreamError::Io(_))));
    }

    #[test]
    fn test_missing_and_empty_paths() {
        let factory = FileReaderFactory::new(".part");
        assert!(factory.open("").is_none());
        assert!(factory.open("/nonexistent/dir/file.gcode").is_none());
    }

    #[test]
    fn test_binary_gcode_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part.bgcode");
        fs::write(&path, "GCDE").unwrap();
        assert!(FileReaderFactory::new(".part").open(path.to_str().unwrap()).is_none());
    }

    #[test]
    fn test_partial_download() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dl.gcode");
        let marker = dir.path().join("dl.gcode.part");
        fs::write(&path, "G28\n").unwrap();
        fs::write(&marker, "").unwrap();
        let path_str = path.to_str().unwrap();

        let mut reader = FileReaderFactory::new(".part").open(path_str).unwrap();
        reader.update_validity(path_str);
        reader.stream_gcode_start(0).unwrap();

        let (data, end) = read_to_end(reader.as_mut());
        assert_eq!(data, b"G28\n");
        assert_eq!(end, StreamError::OutOfRange);

        // More data arrives and the download finishes
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"M84\n").unwrap();
        file.flush().unwrap();
        fs::remove_file(&marker).unwrap();

        reader.update_validity(path_str);
        assert_eq!(reader.gcode_stream_size_estimate(), 8);
        let (data, end) = read_to_end(reader.as_mut());
        assert_eq!(data, b"M84\n");
        assert_eq!(end, StreamError::EndOfFile);
    }

    #[test]
    fn test_restore_info_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.gcode");
        fs::write(&path, "G28\n").unwrap();
        let mut reader = FileReaderFactory::new(".part").open(path.to_str().unwrap()).unwrap();
        let info = StreamRestoreInfo([7; 16]);
        reader.set_restore_info(info);
        assert_eq!(reader.restore_info(), info);
    }
}
