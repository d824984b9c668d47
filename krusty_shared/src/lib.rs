// krusty_shared: gcode stream types shared by the prefetch pipeline, the host and test doubles

pub mod gcode_reader;
pub mod memory_reader;

pub use gcode_reader::{GCodeReaderPosition, GcodeReader, GcodeReaderFactory, StreamError, StreamRestoreInfo};
