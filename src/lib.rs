// src/lib.rs - Media prefetch pipeline for printing gcode from removable or downloading media
pub mod async_job;
pub mod config;
pub mod file_reader;
pub mod media_prefetch;

pub use async_job::{AsyncJob, AsyncJobExecutionControl, AsyncJobExecutor};
pub use config::{load_config, Config, ConfigError, HostConfig, PrefetchConfig};
pub use file_reader::{FileReaderFactory, PlainGcodeReader};
pub use media_prefetch::{MediaPrefetchManager, Metrics, ReadResult, Status};
