use anyhow::Result;
use simplelog::*;
use std::{
    fs,
    io::Write,
    path::Path,
    sync::Mutex,
};

use crate::config::LogConfig;

pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

pub fn init(cfg: &LogConfig) -> Result<()> {
    let level = level_filter(&cfg.level);

    // Terminal output goes to stderr so `list --json` stays pipeable.
    let term_cfg = ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        term_cfg,
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];

    if let Some(path) = cfg.file.clone() {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        let file_cfg = ConfigBuilder::new()
            .set_target_level(LevelFilter::Off)
            .set_location_level(LevelFilter::Off)
            .set_thread_level(LevelFilter::Off)
            .build();
        loggers.push(WriteLogger::new(level, file_cfg, file));
    }

    CombinedLogger::init(loggers)?;
    Ok(())
}

// --- mutation journal --------------------------------------------------------

const JOURNAL_MAX_BYTES: usize = 64 * 1024;

static JOURNAL_LOCK: Mutex<()> = Mutex::new(());

/// Append one line per committed mutation. Repeated lines are kept: each
/// one is a separate commit.
///
/// Only the last 64 KiB survive, cut at a line boundary. Failures are
/// swallowed and never fail an operation.
pub fn journal(path: Option<&Path>, msg: &str) {
    let Some(path) = path else {
        return;
    };
    let _guard = match JOURNAL_LOCK.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    if let Ok(mut f) = fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{stamp} {msg}");
        let _ = f.flush();
    }

    if let Err(e) = trim_file_keep_last_utf8(path, JOURNAL_MAX_BYTES) {
        log::debug!("journal trim failed {}: {e:#}", path.display());
    }
}

fn trim_file_keep_last_utf8(path: &Path, max_bytes: usize) -> Result<()> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    if meta.len() as usize <= max_bytes {
        return Ok(());
    }
    let data = fs::read(path)?;
    if data.len() <= max_bytes {
        return Ok(());
    }
    let mut start = data.len().saturating_sub(max_bytes);

    while start < data.len() && std::str::from_utf8(&data[start..]).is_err() {
        start += 1;
    }

    // Keep whole lines unless the next newline is unreasonably far.
    if start < data.len() {
        if let Some(pos) = data[start..].iter().position(|b| *b == b'\n') {
            if pos < 1024 {
                start += pos + 1;
            }
        }
    }

    fs::write(path, &data[start..])?;
    Ok(())
}
