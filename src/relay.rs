//! Streaming half of a download: couples yt-dlp's stdout to an HTTP body.
//!
//! The relay is pull-based. A chunk is read from the pipe only when the body
//! consumer asks for the next one, so a slow client leaves the pipe full and
//! yt-dlp blocked on write, and at most one chunk of `chunk_size` bytes is in
//! flight at any time. Dropping the relay while the process is still running
//! (the client disconnected) terminates the process.

use std::io;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use tokio::process::ChildStdout;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::{
    classify::{Phase, classify, classify_io, excerpt},
    error::{ClassifiedError, ErrorKind},
    format::FormatSpec,
    process::{ProcessOutcome, ToolCommand, ToolProcess},
};

/// Lifecycle of one streaming request.
///
/// ```text
/// Idle -> Launching -> Streaming -> Completed
///             |             \-> FailedMidStream
///             |-> Completed (tool wrote nothing and exited 0)
///             \-> FailedBeforeFirstByte
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    /// Process spawned, nothing relayed and no header sent yet.
    Launching,
    /// Headers are committed; bytes are flowing.
    Streaming,
    Completed,
    FailedBeforeFirstByte,
    FailedMidStream,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RelayState::Completed | RelayState::FailedBeforeFirstByte | RelayState::FailedMidStream
        )
    }

    /// Once this holds, a failure can only be reported by aborting the body.
    pub fn headers_committed(self) -> bool {
        matches!(
            self,
            RelayState::Streaming | RelayState::Completed | RelayState::FailedMidStream
        )
    }
}

#[derive(Debug)]
pub struct MediaRelay {
    url: String,
    state: RelayState,
    process: Option<ToolProcess>,
    stdout: Option<ReaderStream<ChildStdout>>,
    pending: Option<Bytes>,
    bytes_relayed: u64,
}

impl MediaRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: RelayState::Idle,
            process: None,
            stdout: None,
            pending: None,
            bytes_relayed: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ToolProcess::pid)
    }

    /// `Idle -> Launching`, or `FailedBeforeFirstByte` when the process cannot
    /// be spawned.
    pub fn launch(&mut self, tool: &ToolCommand, spec: &FormatSpec) -> Result<(), ClassifiedError> {
        if self.state != RelayState::Idle {
            return Err(self.misuse("launch"));
        }
        self.state = RelayState::Launching;
        match tool.spawn_stream(&self.url, spec) {
            Ok((process, stdout)) => {
                self.process = Some(process);
                self.stdout = Some(ReaderStream::with_capacity(
                    stdout,
                    tool.settings().chunk_size,
                ));
                Ok(())
            }
            Err(err) => {
                self.state = RelayState::FailedBeforeFirstByte;
                let classified = classify_io(&err.to_string(), Phase::StreamLaunch);
                error!(url = %self.url, error = %err, "could not start yt-dlp stream");
                Err(classified)
            }
        }
    }

    /// Waits for the first chunk so a failure that surfaces immediately can
    /// still be answered with a JSON error instead of a truncated body.
    pub async fn prime(&mut self) -> Result<(), ClassifiedError> {
        if self.state != RelayState::Launching {
            return Err(self.misuse("prime"));
        }
        let Some(stdout) = self.stdout.as_mut() else {
            return Err(self.misuse("prime"));
        };

        match stdout.next().await {
            Some(Ok(chunk)) => {
                self.pending = Some(chunk);
                self.state = RelayState::Streaming;
                Ok(())
            }
            Some(Err(err)) => {
                self.stdout = None;
                self.stop_process().await;
                self.state = RelayState::FailedBeforeFirstByte;
                warn!(url = %self.url, error = %err, "reading yt-dlp output failed");
                Err(classify_io(&err.to_string(), Phase::StreamRuntime))
            }
            None => {
                self.stdout = None;
                match self.wait_process().await {
                    Ok(outcome) if outcome.success => {
                        self.state = RelayState::Completed;
                        warn!(url = %self.url, "yt-dlp exited cleanly without output");
                        Ok(())
                    }
                    Ok(outcome) => {
                        self.state = RelayState::FailedBeforeFirstByte;
                        let err = self.classify_outcome(&outcome);
                        warn!(
                            url = %self.url,
                            kind = ?err.kind,
                            exit_code = ?outcome.exit_code,
                            stderr = excerpt(&outcome.stderr.text()),
                            "yt-dlp stream failed before any output"
                        );
                        Err(err)
                    }
                    Err(err) => {
                        self.state = RelayState::FailedBeforeFirstByte;
                        warn!(url = %self.url, error = %err, "waiting for yt-dlp failed");
                        Err(classify_io(&err.to_string(), Phase::StreamRuntime))
                    }
                }
            }
        }
    }

    /// Next piece of the body. `None` ends the body normally; an `Err` item
    /// aborts it so the client sees a truncated transfer.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if let Some(chunk) = self.pending.take() {
            self.bytes_relayed += chunk.len() as u64;
            return Some(Ok(chunk));
        }
        if self.state != RelayState::Streaming {
            return None;
        }
        let stdout = self.stdout.as_mut()?;

        match stdout.next().await {
            Some(Ok(chunk)) => {
                self.bytes_relayed += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Some(Err(err)) => {
                self.stdout = None;
                self.stop_process().await;
                self.state = RelayState::FailedMidStream;
                error!(
                    url = %self.url,
                    bytes = self.bytes_relayed,
                    error = %err,
                    "reading yt-dlp output failed mid-stream; aborting response"
                );
                Some(Err(err))
            }
            None => {
                self.stdout = None;
                match self.wait_process().await {
                    Ok(outcome) if outcome.success => {
                        self.state = RelayState::Completed;
                        info!(url = %self.url, bytes = self.bytes_relayed, "download completed");
                        None
                    }
                    Ok(outcome) => {
                        self.state = RelayState::FailedMidStream;
                        let err = self.classify_outcome(&outcome);
                        error!(
                            url = %self.url,
                            kind = ?err.kind,
                            exit_code = ?outcome.exit_code,
                            bytes = self.bytes_relayed,
                            stderr = %outcome.stderr.text(),
                            "yt-dlp failed mid-stream; aborting response"
                        );
                        Some(Err(io::Error::other(err)))
                    }
                    Err(err) => {
                        self.state = RelayState::FailedMidStream;
                        error!(
                            url = %self.url,
                            error = %err,
                            "waiting for yt-dlp failed mid-stream"
                        );
                        Some(Err(err))
                    }
                }
            }
        }
    }

    /// Body stream for the HTTP response. Dropping it drops the relay.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::unfold(self, |mut relay| async move {
            relay.next_chunk().await.map(|item| (item, relay))
        })
    }

    fn classify_outcome(&self, outcome: &ProcessOutcome) -> ClassifiedError {
        classify(&outcome.stderr.text(), outcome.exit_code, Phase::StreamRuntime)
    }

    async fn wait_process(&mut self) -> io::Result<ProcessOutcome> {
        let mut process = self
            .process
            .take()
            .ok_or_else(|| io::Error::other("yt-dlp process missing"))?;
        process.wait().await
    }

    async fn stop_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(err) = process.terminate().await {
                warn!(url = %self.url, error = %err, "terminating yt-dlp failed");
            }
        }
    }

    fn misuse(&self, operation: &str) -> ClassifiedError {
        ClassifiedError::new(
            ErrorKind::StreamRuntimeFailed,
            format!("Download relay cannot {operation} while {:?}.", self.state),
        )
    }
}

impl Drop for MediaRelay {
    fn drop(&mut self) {
        if !self.state.is_terminal() && self.process.is_some() {
            info!(
                url = %self.url,
                state = ?self.state,
                bytes = self.bytes_relayed,
                "client went away; stopping yt-dlp"
            );
        }
        // The stdout pipe closes first, then ToolProcess terminates the child.
        self.stdout = None;
        self.process = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ToolSettings,
        format::resolve,
        request::Container,
        test_support::stub_tool,
    };
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    const URL: &str = "https://youtu.be/abc";

    type Started = Result<MediaRelay, (RelayState, ClassifiedError)>;

    async fn started(body: &str) -> (TempDir, Started) {
        let dir = tempdir().unwrap();
        let tool = stub_tool(dir.path(), body);
        let mut relay = MediaRelay::new(URL);
        let spec = resolve(Container::Video, "720p");
        let result = match relay.launch(&tool, &spec) {
            Ok(()) => match relay.prime().await {
                Ok(()) => Ok(relay),
                Err(err) => Err((relay.state(), err)),
            },
            Err(err) => Err((relay.state(), err)),
        };
        (dir, result)
    }

    async fn drain(relay: &mut MediaRelay) -> (Vec<u8>, Option<io::Error>) {
        let mut body = Vec::new();
        while let Some(item) = relay.next_chunk().await {
            match item {
                Ok(chunk) => body.extend_from_slice(&chunk),
                Err(err) => return (body, Some(err)),
            }
        }
        (body, None)
    }

    #[tokio::test]
    async fn relays_output_and_completes() {
        let (_dir, result) = started("printf 'hello world'").await;
        let mut relay = result.unwrap();
        assert_eq!(relay.state(), RelayState::Streaming);
        assert!(relay.state().headers_committed());

        let (body, err) = drain(&mut relay).await;
        assert_eq!(body, b"hello world");
        assert!(err.is_none());
        assert_eq!(relay.state(), RelayState::Completed);
        assert_eq!(relay.bytes_relayed(), 11);
    }

    #[tokio::test]
    async fn passes_stream_arguments() {
        let (_dir, result) = started(
            r#"if [ "$1" = "https://youtu.be/abc" ] && [ "$2" = "-o" ] && [ "$3" = "-" ] \
  && [ "$6" = "-f" ]; then
  printf ok
else
  echo "unexpected args: $*" >&2
  exit 9
fi"#,
        )
        .await;
        let mut relay = result.unwrap();
        assert_eq!(drain(&mut relay).await.0, b"ok");
    }

    #[tokio::test]
    async fn failure_after_bytes_aborts_stream() {
        let (_dir, result) =
            started("printf '0123456789'\necho 'ERROR: fragment lost' >&2\nexit 3").await;
        let mut relay = result.unwrap();
        let (body, err) = drain(&mut relay).await;
        assert_eq!(body, b"0123456789");
        assert!(err.is_some());
        assert_eq!(relay.state(), RelayState::FailedMidStream);
        assert!(relay.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn failure_before_first_byte_is_reported() {
        let (_dir, result) =
            started("echo 'ERROR: Requested format is not available' >&2\nexit 1").await;
        let (state, err) = result.unwrap_err();
        assert_eq!(state, RelayState::FailedBeforeFirstByte);
        assert!(!state.headers_committed());
        assert_eq!(err.kind, ErrorKind::StreamRuntimeFailed);
        assert!(err.message.contains("Requested format is not available"));
    }

    #[tokio::test]
    async fn bot_challenge_before_first_byte() {
        let (_dir, result) =
            started("echo 'Sign in to confirm you\u{2019}re not a bot' >&2\nexit 1").await;
        let (_, err) = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BotDetectionBlocked);
    }

    #[tokio::test]
    async fn empty_success_completes_without_body() {
        let (_dir, result) = started("exit 0").await;
        let mut relay = result.unwrap();
        assert_eq!(relay.state(), RelayState::Completed);
        assert!(relay.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn launch_failure_is_stream_launch_failed() {
        let tool = ToolCommand::new(ToolSettings {
            program: "/nonexistent/yt-dlp".into(),
            ..ToolSettings::default()
        });
        let mut relay = MediaRelay::new(URL);
        let err = relay
            .launch(&tool, &resolve(Container::Audio, ""))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StreamLaunchFailed);
        assert!(!err.message.contains("signal"));
        assert_eq!(relay.state(), RelayState::FailedBeforeFirstByte);
    }

    #[tokio::test]
    async fn chunks_are_bounded_by_chunk_size() {
        let (_dir, result) = started("exec yes").await;
        let mut relay = result.unwrap();
        for _ in 0..8 {
            let chunk = relay.next_chunk().await.unwrap().unwrap();
            assert!(chunk.len() <= 4096);
        }
    }

    #[tokio::test]
    async fn unread_output_blocks_the_producer() {
        let (dir, result) =
            started("head -c 20000000 /dev/zero\ntouch \"$(dirname \"$0\")/finished\"").await;
        let mut relay = result.unwrap();
        let marker = dir.path().join("finished");

        // Only the primed chunk has been read; the pipe is full and the
        // producer must be stuck writing.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!marker.exists(), "yt-dlp ran ahead of an idle consumer");

        let (body, err) = drain(&mut relay).await;
        assert!(err.is_none());
        assert_eq!(body.len(), 20_000_000);
        assert_eq!(relay.state(), RelayState::Completed);
        assert!(marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_relay_terminates_process() {
        use nix::{sys::signal::kill, unistd::Pid};

        let (_dir, result) = started("exec yes").await;
        let relay = result.unwrap();
        let pid = Pid::from_raw(i32::try_from(relay.pid().unwrap()).unwrap());
        assert!(kill(pid, None).is_ok());

        drop(relay);

        let mut gone = false;
        for _ in 0..100 {
            if kill(pid, None).is_err() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "yt-dlp process outlived its relay");
    }

    #[tokio::test]
    async fn body_stream_ends_with_error_on_failure() {
        let (_dir, result) = started("printf 'abc'\nexit 1").await;
        let items: Vec<_> = result.unwrap().into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(&items[0].as_ref().unwrap()[..], b"abc");
        assert!(items[1].is_err());
    }
}
