use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::fs::File;

/// Terminal at Info, `logs/clippy-sync.log` next to the executable at Debug.
pub fn setup_logger() -> Result<()> {
    let exe_path = std::env::current_exe().context("Failed to get exe path")?;
    let exe_dir = exe_path.parent().unwrap_or(std::path::Path::new("."));
    let log_dir = exe_dir.join("logs");
    std::fs::create_dir_all(&log_dir).context("Failed to create log dir")?;

    let log_file =
        File::create(log_dir.join("clippy-sync.log")).context("Failed to create log file")?;

    let config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap_or_else(|builder| builder)
        .build();

    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            LevelFilter::Info,
            config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, config, log_file),
    ];

    CombinedLogger::init(loggers).ok();
    log::info!("Logger initialized at {:?}", log_dir);
    Ok(())
}
