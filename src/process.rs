//! Launching and supervising yt-dlp.
//!
//! [`ToolCommand`] knows the two invocation shapes the service uses (a JSON
//! metadata probe and a stream to stdout). [`ToolProcess`] owns one running
//! invocation: it drains stderr into a bounded buffer on its own task, and it
//! guarantees the child is terminated and reaped even when it is dropped
//! half-way through, e.g. because the HTTP client went away.

use std::{io, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use crate::{config::ToolSettings, format::FormatSpec};

const STDERR_READ_CHUNK: usize = 4096;

/// Builds yt-dlp invocations from the configured [`ToolSettings`].
#[derive(Debug, Clone)]
pub struct ToolCommand {
    settings: ToolSettings,
}

impl ToolCommand {
    pub fn new(settings: ToolSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ToolSettings {
        &self.settings
    }

    /// `<tool> <url> --dump-json --no-warnings --no-progress`
    pub fn probe_args(url: &str) -> Vec<String> {
        vec![
            url.to_owned(),
            "--dump-json".to_owned(),
            "--no-warnings".to_owned(),
            "--no-progress".to_owned(),
        ]
    }

    /// `<tool> <url> -o - --no-warnings --no-progress <format args>`
    pub fn stream_args(url: &str, spec: &FormatSpec) -> Vec<String> {
        let mut args = vec![
            url.to_owned(),
            "-o".to_owned(),
            "-".to_owned(),
            "--no-warnings".to_owned(),
            "--no-progress".to_owned(),
        ];
        args.extend(spec.tool_arguments.iter().cloned());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.settings.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    pub fn spawn_probe(&self, url: &str) -> io::Result<(ToolProcess, ChildStdout)> {
        ToolProcess::spawn(self.command(&Self::probe_args(url)), "probe", &self.settings)
    }

    pub fn spawn_stream(
        &self,
        url: &str,
        spec: &FormatSpec,
    ) -> io::Result<(ToolProcess, ChildStdout)> {
        ToolProcess::spawn(
            self.command(&Self::stream_args(url, spec)),
            "stream",
            &self.settings,
        )
    }

    /// Runs `<tool> --version` to fail loudly when yt-dlp is missing.
    pub async fn version(&self) -> Result<String> {
        let program = self.settings.program.display().to_string();
        let output = time::timeout(
            self.settings.probe_timeout,
            Command::new(&self.settings.program)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("{program} --version timed out"))?
        .with_context(|| format!("{program} is not installed or not in PATH"))?;

        if !output.status.success() {
            bail!(
                "{} is installed but returned a failure status ({})",
                program,
                output.status
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

/// Diagnostic output of one process, capped at a fixed size. Bytes past the
/// cap are counted and dropped.
#[derive(Debug, Clone, Default)]
pub struct StderrBuffer {
    bytes: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl StderrBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let keep = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..keep]);
        self.dropped += chunk.len() - keep;
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

async fn drain_stderr<R>(mut reader: R, limit: usize, label: &'static str) -> StderrBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buffer = StderrBuffer::with_limit(limit);
    let mut chunk = vec![0u8; STDERR_READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                debug!(
                    phase = label,
                    "yt-dlp stderr: {}",
                    String::from_utf8_lossy(&chunk[..n]).trim_end()
                );
                buffer.push(&chunk[..n]);
            }
            Err(err) => {
                warn!(phase = label, error = %err, "reading yt-dlp stderr failed");
                break;
            }
        }
    }
    if buffer.dropped() > 0 {
        debug!(phase = label, dropped = buffer.dropped(), "yt-dlp stderr truncated");
    }
    buffer
}

/// How a process ended, together with whatever stderr it left behind.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stderr: StderrBuffer,
}

/// One running yt-dlp invocation.
///
/// The child is reaped by [`wait`](Self::wait) or
/// [`terminate`](Self::terminate). If neither ran to completion, dropping the
/// handle sends SIGTERM and finishes the job on a background task.
#[derive(Debug)]
pub struct ToolProcess {
    child: Option<Child>,
    pid: Option<u32>,
    stderr_task: Option<JoinHandle<StderrBuffer>>,
    label: &'static str,
    stderr_limit: usize,
    kill_grace: Duration,
}

impl ToolProcess {
    pub fn spawn(
        mut command: Command,
        label: &'static str,
        settings: &ToolSettings,
    ) -> io::Result<(Self, ChildStdout)> {
        let mut child = command.spawn()?;
        let pid = child.id();
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, settings.stderr_limit, label)));
        let stdout = child.stdout.take();

        let process = Self {
            child: Some(child),
            pid,
            stderr_task,
            label,
            stderr_limit: settings.stderr_limit,
            kill_grace: settings.kill_grace,
        };
        let stdout = stdout.ok_or_else(|| io::Error::other("yt-dlp stdout was not captured"))?;
        debug!(phase = label, pid = ?pid, "spawned yt-dlp");
        Ok((process, stdout))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_reaped(&self) -> bool {
        self.child.is_none()
    }

    /// Waits for the process to exit and collects its stderr.
    pub async fn wait(&mut self) -> io::Result<ProcessOutcome> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| io::Error::other("yt-dlp process already reaped"))?;
        let status = child.wait().await?;
        self.child = None;
        let stderr = self.collect_stderr().await;
        Ok(ProcessOutcome {
            exit_code: status.code(),
            success: status.success(),
            stderr,
        })
    }

    /// Asks the process to stop, escalates to a hard kill after the grace
    /// period, and reaps it.
    pub async fn terminate(&mut self) -> io::Result<ProcessOutcome> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| io::Error::other("yt-dlp process already reaped"))?;
        send_terminate(&mut child, self.label);
        let status = reap(child, self.kill_grace, self.label).await?;
        let stderr = self.collect_stderr().await;
        Ok(ProcessOutcome {
            exit_code: status.code(),
            success: false,
            stderr,
        })
    }

    async fn collect_stderr(&mut self) -> StderrBuffer {
        let Some(mut task) = self.stderr_task.take() else {
            return StderrBuffer::with_limit(self.stderr_limit);
        };
        // A grandchild (ffmpeg) can keep the pipe open after yt-dlp is gone.
        match time::timeout(self.kill_grace, &mut task).await {
            Ok(Ok(buffer)) => buffer,
            Ok(Err(err)) => {
                warn!(phase = self.label, error = %err, "stderr reader task failed");
                StderrBuffer::with_limit(self.stderr_limit)
            }
            Err(_) => {
                task.abort();
                debug!(phase = self.label, "stderr still open after exit; giving up on it");
                StderrBuffer::with_limit(self.stderr_limit)
            }
        }
    }
}

impl Drop for ToolProcess {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        info!(phase = self.label, pid = ?self.pid, "terminating abandoned yt-dlp process");
        send_terminate(&mut child, self.label);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let grace = self.kill_grace;
                let label = self.label;
                handle.spawn(async move {
                    if let Err(err) = reap(child, grace, label).await {
                        warn!(phase = label, error = %err, "reaping yt-dlp process failed");
                    }
                });
            }
            // Outside a runtime `kill_on_drop` is all that is left.
            Err(_) => {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, label: &'static str) {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => return,
            Err(err) => debug!(phase = label, pid, error = %err, "SIGTERM failed"),
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _label: &'static str) {
    let _ = child.start_kill();
}

async fn reap(
    mut child: Child,
    grace: Duration,
    label: &'static str,
) -> io::Result<std::process::ExitStatus> {
    match time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(phase = label, "yt-dlp ignored SIGTERM; killing it");
            child.kill().await?;
            child.wait().await
        }
    }
}
