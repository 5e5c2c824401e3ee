//! Nested log contexts for suite, test case and step output.
//!
//! A context either owns a sink (stdout through `tracing`, a log file, or an
//! in-memory buffer) or writes through its parent's sink. File sinks are
//! flushed when the context is dropped, so every exit path leaves a complete
//! log behind.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::{Level, error, info, warn};

use crate::error::Result;

/// Whether `announce` also reaches the parent context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Quiet,
    Verbose,
}

enum Sink {
    Stdout,
    File {
        path: PathBuf,
        writer: Mutex<BufWriter<File>>,
    },
    Buffer(Arc<Mutex<Vec<String>>>),
    Inherit,
}

pub struct LogContext<'a> {
    name: String,
    sink: Sink,
    parent: Option<&'a LogContext<'a>>,
    propagation: Propagation,
}

impl<'a> LogContext<'a> {
    /// Root context writing to stdout through `tracing`.
    pub fn stdout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sink: Sink::Stdout,
            parent: None,
            propagation: Propagation::Quiet,
        }
    }

    /// Root context collecting lines in memory.
    pub fn buffered(name: impl Into<String>) -> (Self, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let ctx = Self {
            name: name.into(),
            sink: Sink::Buffer(lines.clone()),
            parent: None,
            propagation: Propagation::Quiet,
        };
        (ctx, lines)
    }

    /// Child context with its own log file (created along with its directory).
    pub fn child_file<'b>(
        &'b self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        propagation: Propagation,
    ) -> Result<LogContext<'b>> {
        let path = path.into();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = File::create(&path)?;
        Ok(LogContext {
            name: name.into(),
            sink: Sink::File {
                path,
                writer: Mutex::new(BufWriter::new(file)),
            },
            parent: Some(self),
            propagation,
        })
    }

    /// Child context writing through this context's sink.
    pub fn child<'b>(&'b self, name: impl Into<String>, propagation: Propagation) -> LogContext<'b> {
        LogContext {
            name: name.into(),
            sink: Sink::Inherit,
            parent: Some(self),
            propagation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the file this context writes to, if it owns one.
    pub fn log_file(&self) -> Option<&Path> {
        match &self.sink {
            Sink::File { path, .. } => Some(path),
            Sink::Inherit => self.parent.and_then(|parent| parent.log_file()),
            _ => None,
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.write(Level::INFO, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.write(Level::WARN, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write(Level::ERROR, message.as_ref());
    }

    /// Progress message: always written here, and passed up through every
    /// verbose ancestor. A sink shared with the parent is written only once.
    pub fn announce(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.write(Level::INFO, message);
        self.forward(message);
    }

    fn forward(&self, message: &str) {
        if self.propagation == Propagation::Verbose
            && let Some(parent) = self.parent
        {
            if !matches!(self.sink, Sink::Inherit) {
                parent.write(Level::INFO, message);
            }
            parent.forward(message);
        }
    }

    fn write(&self, level: Level, message: &str) {
        match &self.sink {
            Sink::Stdout => match level {
                Level::ERROR => error!("{message}"),
                Level::WARN => warn!("{message}"),
                _ => info!("{message}"),
            },
            Sink::File { writer, path } => {
                let line = decorate(level, message);
                let written = writer
                    .lock()
                    .map_err(|_| std::io::Error::other("log writer poisoned"))
                    .and_then(|mut w| writeln!(w, "{line}"));
                if let Err(err) = written {
                    warn!(path = %path.display(), %err, "Failed to write log line");
                }
            }
            Sink::Buffer(lines) => {
                if let Ok(mut guard) = lines.lock() {
                    guard.push(decorate(level, message));
                }
            }
            Sink::Inherit => match self.parent {
                Some(parent) => parent.write(level, message),
                None => info!("{message}"),
            },
        }
    }

    pub fn flush(&self) {
        if let Sink::File { writer, .. } = &self.sink
            && let Ok(mut w) = writer.lock()
        {
            let _ = w.flush();
        }
    }
}

impl Drop for LogContext<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

fn decorate(level: Level, message: &str) -> String {
    match level {
        Level::ERROR => format!("ERROR: {message}"),
        Level::WARN => format!("WARNING: {message}"),
        _ => message.to_string(),
    }
}
