use std::fs;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use testflow::paths;

#[derive(Clone, Copy, Debug)]
pub enum JsonLogFormat {
    Pretty,
    Compact,
}

/// Installs the global subscriber.
///
/// Stdout follows `--verbose`/`--log-json`. When `run_id` is given, a debug
/// level JSON copy of every event goes to `~/.testflow/logs/run-<id>.log`.
/// The returned guard must outlive the run or the file tail is lost.
pub fn init(
    verbose: bool,
    log_json: bool,
    json_format: JsonLogFormat,
    run_id: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stdout_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_env_filter(verbose));

    let (file_layer, guard) = match run_id {
        Some(id) => {
            let log_dir = paths::logs_dir();
            match fs::create_dir_all(&log_dir) {
                Ok(()) => {
                    let appender =
                        tracing_appender::rolling::never(&log_dir, format!("run-{id}.log"));
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    let layer = fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_filter(Targets::new().with_default(tracing::Level::DEBUG));
                    (Some(layer), Some(guard))
                }
                Err(err) => {
                    eprintln!("Warning: cannot create log dir {}: {err}", log_dir.display());
                    (None, None)
                }
            }
        }
        None => (None, None),
    };

    let stdout_layer: Box<dyn Layer<Registry> + Send + Sync> = match (log_json, json_format) {
        (true, JsonLogFormat::Pretty) => Box::new(
            fmt::layer()
                .json()
                .with_writer(|| PrettyJsonWriter::new(std::io::stdout()))
                .with_filter(stdout_filter),
        ),
        (true, JsonLogFormat::Compact) => Box::new(
            fmt::layer()
                .json()
                .with_writer(std::io::stdout)
                .with_filter(stdout_filter),
        ),
        (false, _) if verbose => Box::new(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(stdout_filter),
        ),
        (false, _) => Box::new(
            fmt::layer()
                .with_writer(std::io::stdout)
                .without_time()
                .with_target(false)
                .with_level(true)
                .with_filter(stdout_filter),
        ),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

/// Re-indents each JSON event written through it; other bytes pass through.
struct PrettyJsonWriter<W: std::io::Write> {
    inner: W,
}

impl<W: std::io::Write> PrettyJsonWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: std::io::Write> std::io::Write for PrettyJsonWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(text) = std::str::from_utf8(buf)
            && let Ok(value) = serde_json::from_str::<serde_json::Value>(text.trim())
            && value.is_object()
            && serde_json::to_writer_pretty(&mut self.inner, &value).is_ok()
        {
            self.inner.write_all(b"\n")?;
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn default_env_filter(verbose: bool) -> EnvFilter {
    let directives = if verbose {
        "testflow=debug,info"
    } else {
        "testflow=info,warn"
    };
    EnvFilter::new(directives)
}
