// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide logger behind the `log` facade.
//!
//! A level filter plus one output sink, console (stderr) or an append-only
//! log file. Installed once at startup; a configuration reload may change
//! the level and the sink in place.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

enum Sink {
    Console,
    File(std::fs::File),
}

struct Logger {
    sink: Mutex<Sink>,
}

static LOGGER: Logger = Logger {
    sink: Mutex::new(Sink::Console),
};

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = match &mut *sink {
            Sink::Console => writeln!(io::stderr(), "[{}] {}", level_tag(record.level()), record.args()),
            Sink::File(file) => writeln!(
                file,
                "[{}] [{}] {}",
                unix_timestamp(),
                level_tag(record.level()),
                record.args()
            ),
        };
    }

    fn flush(&self) {
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = match &mut *sink {
            Sink::Console => io::stderr().flush(),
            Sink::File(file) => file.flush(),
        };
    }
}

fn level_tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "error",
        log::Level::Warn => "warning",
        log::Level::Info => "info",
        log::Level::Debug => "debug",
        log::Level::Trace => "trace",
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn make_sink(log_file: Option<&Path>) -> io::Result<Sink> {
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(Sink::File(file))
        }
        None => Ok(Sink::Console),
    }
}

/// Install the logger. Safe to call again on reload: the level and sink
/// are replaced, the `log::set_logger` registration happens only once.
pub fn init(level: log::LevelFilter, log_file: Option<&Path>) -> io::Result<()> {
    let sink = make_sink(log_file)?;
    {
        let mut slot = match LOGGER.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = sink;
    }
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
    Ok(())
}
