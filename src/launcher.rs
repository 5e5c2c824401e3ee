use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc::UnboundedSender,
};
use tracing::debug;

use crate::error::{Error, Result};

/// A single external process to run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub argv: Vec<String>,
    pub work_dir: PathBuf,
    /// Variables set on this child only.
    pub env: Vec<(String, String)>,
}

impl LaunchRequest {
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl LaunchOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Port for running external commands; blocks the caller until exit.
///
/// Output lines of the child, stdout and stderr alike, are sent to `lines`
/// as they are produced.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(
        &self,
        request: &LaunchRequest,
        lines: UnboundedSender<String>,
    ) -> Result<LaunchOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
        lines: UnboundedSender<String>,
    ) -> Result<LaunchOutput> {
        let (program, args) = request.argv.split_first().ok_or_else(|| Error::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;
        debug!(command = %request.display(), work_dir = %request.work_dir.display(), "Launching process");
        let spawn_error = |source| Error::Spawn {
            command: request.display(),
            source,
        };
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&request.work_dir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, (), ()) = tokio::join!(
            child.wait(),
            forward_lines(stdout, lines.clone()),
            forward_lines(stderr, lines),
        );
        let status = status.map_err(spawn_error)?;
        Ok(LaunchOutput {
            code: status.code(),
        })
    }
}

/// Sends each line of `reader` until it closes; bytes that are not UTF-8 are
/// replaced.
async fn forward_lines<R: AsyncRead + Unpin>(reader: Option<R>, lines: UnboundedSender<String>) {
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if lines.send(line).is_err() {
                    break;
                }
            }
        }
    }
}
