//! Console logger setup for the binary.

use std::io::Write;
use std::path::Path;

use env_logger::Env;
use log::{LevelFilter, Record};

fn get_file_line(record: &Record) -> String {
    let file = record
        .file()
        .and_then(|f| Path::new(f).file_name())
        .map(|f| f.to_string_lossy().into_owned());
    match (file, record.line()) {
        (Some(file), None) => format!("{file}:"),
        (Some(file), Some(line)) => format!("{file}:{line}:"),
        _ => String::new(),
    }
}

fn log_level_str(record: &Record) -> String {
    let mut level_str = record.level().to_string();
    level_str.truncate(1);
    level_str
}

/// Initialise `env_logger` once. `RUST_LOG` is honoured for module filters,
/// `filter_level` sets the global level from `--verbose` / `--quiet`.
pub fn setup_logger(filter_level: LevelFilter) {
    let result = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .filter_level(filter_level)
        .format(|buf, record| {
            let date = buf.timestamp_seconds();
            let level = log_level_str(record);
            let file_line = get_file_line(record);
            writeln!(buf, "{date} [{level}] {file_line} {}", record.args())
        })
        .try_init();
    if result.is_err() {
        log::debug!("logger already initialised");
    }
}
