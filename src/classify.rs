//! Turns the diagnostic text of a failed yt-dlp run into a [`ClassifiedError`].
//!
//! Pure functions only: nothing here touches a process or the network, so new
//! upstream failure signatures can be added to [`BOT_CHALLENGE_SIGNATURES`]
//! without going near the orchestration code.

use crate::error::{ClassifiedError, ErrorKind};

/// Substrings yt-dlp prints when the upstream site demands that a human
/// confirm they are not a bot. Both apostrophe forms have been observed.
pub const BOT_CHALLENGE_SIGNATURES: &[&str] = &[
    "Sign in to confirm you\u{2019}re not a bot",
    "Sign in to confirm you're not a bot",
];

/// Longest diagnostic excerpt carried in an error message, in characters.
pub const EXCERPT_LEN: usize = 200;

pub const BOT_DETECTION_MESSAGE: &str = "YouTube's bot detection was triggered and this video may not be \
downloadable right now. Please try a different video or try again later.";

/// Which part of the request was running when the tool failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probe,
    StreamLaunch,
    StreamRuntime,
}

pub fn is_bot_challenge(stderr: &str) -> bool {
    BOT_CHALLENGE_SIGNATURES
        .iter()
        .any(|signature| stderr.contains(signature))
}

/// First [`EXCERPT_LEN`] characters of `text`, trimmed.
pub fn excerpt(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_LEN) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}

fn describe_exit(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("code: {code}"),
        None => "terminated by signal".to_owned(),
    }
}

/// Classifies a run that exited. `exit_code` is `None` when a signal ended it.
pub fn classify(stderr: &str, exit_code: Option<i32>, phase: Phase) -> ClassifiedError {
    if is_bot_challenge(stderr) {
        return ClassifiedError::new(ErrorKind::BotDetectionBlocked, BOT_DETECTION_MESSAGE);
    }
    failure(phase, Some(describe_exit(exit_code)), excerpt(stderr))
}

/// Classifies a failure that left no exit status behind: the spawn itself
/// failed or the pipes broke. `detail` is the I/O error text.
pub fn classify_io(detail: &str, phase: Phase) -> ClassifiedError {
    failure(phase, None, excerpt(detail))
}

fn failure(phase: Phase, exit: Option<String>, detail: &str) -> ClassifiedError {
    let exit = exit.map(|exit| format!(" ({exit})")).unwrap_or_default();
    let (kind, message) = match phase {
        Phase::Probe => (
            ErrorKind::ProbeFailed,
            format!("Could not fetch video information{exit}. Please check the URL. {detail}"),
        ),
        Phase::StreamLaunch => (
            ErrorKind::StreamLaunchFailed,
            format!("Could not start the download{exit}. {detail}"),
        ),
        Phase::StreamRuntime => (
            ErrorKind::StreamRuntimeFailed,
            format!("The download could not be completed{exit}. {detail}"),
        ),
    };
    ClassifiedError::new(kind, message.trim_end())
}
