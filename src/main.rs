// src/main.rs - Streams a gcode file through the prefetch pipeline and prints the commands
use clap::Parser;
use krusty_media::config::{self, Config};
use krusty_media::{AsyncJobExecutor, FileReaderFactory, MediaPrefetchManager, Metrics, ReadResult, Status};
use krusty_shared::gcode_reader::GCodeReaderPosition;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Prefetch a gcode file the way the print executor consumes it.
#[derive(Parser, Debug)]
#[command(name = "prefetch-host", version, about, long_about = None)]
struct Args {
    /// Gcode file to stream
    file: String,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Stream offset to start from
    #[arg(short, long, default_value_t = 0)]
    offset: u32,

    /// Overrides `host.log_level` (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    file: String,
    commands_read: u64,
    cropped_commands: u64,
    final_status: Status,
    resume_offset: u32,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    config.prefetch.validate()?;

    let level_name = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    let level: tracing::Level = level_name.parse().unwrap_or_else(|_| {
        eprintln!("Unknown log level '{}', using info", level_name);
        tracing::Level::INFO
    });

    // Logs go to stderr so stdout only carries commands and the report
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Prefetching '{}' from offset {}", args.file, args.offset);
    tracing::info!(
        "Ring buffer: {} bytes, command buffer: {} bytes",
        config.prefetch.buffer_size,
        config.prefetch.command_buffer_size
    );

    let executor = Arc::new(AsyncJobExecutor::new("media_prefetch")?);
    let factory = Arc::new(FileReaderFactory::new(&config.prefetch.partial_suffix));
    let mut manager = MediaPrefetchManager::new(&config.prefetch, executor.clone(), factory)?;

    manager.start(&args.file, GCodeReaderPosition::at_offset(args.offset));
    manager.issue_fetch();

    let mut interval = tokio::time::interval(Duration::from_millis(config.host.poll_interval_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut result = ReadResult::default();
    let mut commands_read = 0u64;
    let mut cropped_commands = 0u64;
    let mut started_printing = false;
    let mut last_occupancy_percent = u8::MAX;

    let final_status = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break Status::EndOfBuffer;
            }
            _ = interval.tick() => {}
        }

        // Let the buffer fill up before consuming, like a print start would
        if !started_printing {
            let metrics = manager.get_metrics();
            if metrics.tail_status.is_error() {
                tracing::error!("Prefetch failed before the start with {:?}", metrics.tail_status);
                break metrics.tail_status;
            }
            // A buffer that stopped growing is as full as it gets
            let stalled = metrics.commands_in_buffer > 0
                && metrics.buffer_occupancy_percent == last_occupancy_percent;
            last_occupancy_percent = metrics.buffer_occupancy_percent;
            if !manager.check_ready_to_start_print() && !stalled {
                manager.issue_fetch();
                continue;
            }
            tracing::debug!("Buffer ready at {}%, start consuming", metrics.buffer_occupancy_percent);
            started_printing = true;
        }

        let status = loop {
            match manager.read_command(&mut result) {
                Status::Ok => {
                    commands_read += 1;
                    if result.cropped {
                        cropped_commands += 1;
                    }
                    if !args.json {
                        println!(
                            "{:>10} {:>10} {}{}",
                            result.replay_pos.offset,
                            result.resume_pos.offset,
                            result.gcode_str(),
                            if result.cropped { " (cropped)" } else { "" }
                        );
                    }
                }
                other => break other,
            }
        };

        match status {
            Status::EndOfFile => break status,
            status if status.is_error() => {
                tracing::error!("Prefetch stopped with {:?} at offset {}", status, result.resume_pos.offset);
                break status;
            }
            _ => {
                let metrics = manager.get_metrics();
                if metrics.buffer_occupancy_percent < config.prefetch.low_watermark_percent {
                    manager.issue_fetch();
                }
            }
        }
    };

    let report = Report {
        file: args.file.clone(),
        commands_read,
        cropped_commands,
        final_status,
        resume_offset: result.resume_pos.offset,
        metrics: manager.get_metrics(),
    };

    manager.stop();
    drop(manager);
    executor.wait_idle();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        tracing::info!(
            "Read {} commands ({} cropped), final status {:?}",
            report.commands_read,
            report.cropped_commands,
            report.final_status
        );
        tracing::info!(
            "Stream size estimate {} bytes, last fetch took {:?} ms",
            report.metrics.stream_size_estimate,
            report.metrics.last_fetch_duration_ms
        );
    }

    if final_status.is_error() {
        std::process::exit(1);
    }
    Ok(())
}
