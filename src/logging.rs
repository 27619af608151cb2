//! Console logging via `env_logger` (`RUST_LOG` wins over the flag-derived
//! default), with optional file mirrors: info-and-above lines shown on the
//! console are appended to the info log, error lines are appended to the
//! error log even when the console is silenced.

use anyhow::{Context, Result};
use env_logger::Env;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    pub debug: bool,
    pub verbose: bool,
    pub silent: bool,
    pub info_file: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
}

struct ClientLogger {
    console: env_logger::Logger,
    info_file: Option<Mutex<File>>,
    error_file: Option<Mutex<File>>,
}

impl Log for ClientLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata) || metadata.level() == Level::Error
    }

    fn log(&self, record: &Record) {
        // errors reach the error file even with the console silenced
        if record.level() == Level::Error {
            if let Some(file) = &self.error_file {
                append_line(file, record);
            }
        }
        if self.console.matches(record) {
            self.console.log(record);
            if record.level() != Level::Error {
                if let Some(file) = &self.info_file {
                    append_line(file, record);
                }
            }
        }
    }

    fn flush(&self) {
        self.console.flush();
    }
}

fn append_line(file: &Mutex<File>, record: &Record) {
    if let Ok(mut file) = file.lock() {
        let _ = writeln!(
            file,
            "{} [{}] {}",
            clock_hms(),
            record.target(),
            record.args()
        );
    }
}

pub(crate) fn clock_hms() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let day = secs % 86_400;
    format!("{:02}:{:02}:{:02}", day / 3600, (day % 3600) / 60, day % 60)
}

pub fn default_filter(debug: bool, verbose: bool, silent: bool) -> &'static str {
    if silent {
        "off"
    } else if debug {
        "trace"
    } else if verbose {
        "debug"
    } else {
        "info"
    }
}

pub fn init(opts: &LogOptions) -> Result<()> {
    let filter = default_filter(opts.debug, opts.verbose, opts.silent);
    let console = env_logger::Builder::from_env(Env::default().default_filter_or(filter)).build();

    let mut max_level = console.filter();
    let error_file = match &opts.error_file {
        Some(path) => {
            max_level = max_level.max(LevelFilter::Error);
            Some(Mutex::new(open_append(path)?))
        }
        None => None,
    };
    let info_file = match &opts.info_file {
        Some(path) => Some(Mutex::new(open_append(path)?)),
        None => None,
    };

    log::set_boxed_logger(Box::new(ClientLogger {
        console,
        info_file,
        error_file,
    }))?;
    log::set_max_level(max_level);
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file: {}", path.display()))
}
