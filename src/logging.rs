// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Console and log file output.
//!
//! Every run logs to the console, and once the install root is known, also
//! to a fresh log file at `<install root>/logs/setup_<timestamp>.log`. Runs
//! started within the same second get `setup_<timestamp>_<n>.log` instead,
//! so no run ever appends to another run's log. Each file line has the form
//! `[yyyy-MM-dd HH:mm:ss] message`.
//!
//! Logging never aborts provisioning. If the log file cannot be created, the
//! run continues with console output only, and write errors on an attached
//! file are silently dropped.

use chrono::{DateTime, Local};
use std::{
    fmt::Result as FmtResult,
    fs::File,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{
        self,
        format::{FormatEvent, FormatFields, Writer},
        FmtContext, MakeWriter,
    },
    prelude::*,
    registry::LookupSpan,
    EnvFilter, Layer,
};

const TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";
const MAX_SUFFIX: u32 = 999;

/// Install global subscriber logging to console and given log file.
///
/// Console verbosity follows `RUST_LOG`, defaulting to "info".
pub fn init(log_file: &LogFile) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer(log_file.clone()))
        .init();
}

/// Layer writing `[timestamp] message` lines into log file.
pub fn file_layer<S>(log_file: LogFile) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(false)
        .event_format(LogFileFormat)
        .with_writer(log_file)
        .with_filter(LevelFilter::INFO)
}

/// Name of log file for run started at given time.
///
/// A nonzero `suffix` tells apart runs started within the same second.
pub fn log_file_name(started: DateTime<Local>, suffix: u32) -> String {
    let stamp = started.format("%Y%m%d_%H%M%S");
    match suffix {
        0 => format!("setup_{stamp}.log"),
        n => format!("setup_{stamp}_{n}.log"),
    }
}

/// Log file that can be attached after logging has been initialized.
///
/// Events are only written once a file is attached. Until then, and after
/// any write error, events are dropped.
#[derive(Debug, Default, Clone)]
pub struct LogFile {
    file: Arc<Mutex<Option<File>>>,
}

impl LogFile {
    /// Construct new detached log file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create fresh log file in directory and start writing to it.
    ///
    /// # Errors
    ///
    /// - Return [`io::Error`] if directory or file cannot be created.
    /// - Return [`io::Error`] of kind [`ErrorKind::AlreadyExists`] if every
    ///   suffixed name for this second is taken.
    pub fn attach(&self, dir: &Path) -> io::Result<PathBuf> {
        mkdirp::mkdirp(dir)?;
        let started = Local::now();

        let mut suffix = 0;
        let (path, file) = loop {
            let path = dir.join(log_file_name(started, suffix));
            match File::options().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(err) if err.kind() == ErrorKind::AlreadyExists && suffix < MAX_SUFFIX => {
                    suffix += 1;
                }
                Err(err) => return Err(err),
            }
        };

        if let Ok(mut guard) = self.file.lock() {
            *guard = Some(file);
        }

        Ok(path)
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            file: self.file.clone(),
        }
    }
}

/// Writer handed out by [`LogFile`] for one event.
#[derive(Debug)]
pub struct LogFileWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // INVARIANT: Never report failure, logging must not abort a run.
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = file.write_all(buf);
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = file.flush();
            }
        }

        Ok(())
    }
}

/// Event format of log file lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFileFormat;

impl<S, N> FormatEvent<S, N> for LogFileFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> FmtResult {
        write!(writer, "[{}] ", Local::now().format(TIMESTAMP))?;

        let level = *event.metadata().level();
        if level != Level::INFO {
            write!(writer, "{level}: ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
