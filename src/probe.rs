//! Metadata probe: `yt-dlp --dump-json` run to completion before anything is
//! streamed, both to learn the title and to find out early whether the video
//! can be fetched at all.

use std::io;

use serde::Deserialize;
use tokio::{io::AsyncReadExt, time};
use tracing::{debug, warn};

use crate::{
    classify::{Phase, classify, excerpt},
    error::ClassifiedError,
    process::{ProcessOutcome, ToolCommand, ToolProcess},
};

/// Output of a successful probe.
#[derive(Debug, Clone)]
pub struct VideoMetadata {
    pub raw_json: String,
    pub title: String,
}

/// Subset of the `--dump-json` document the service reads.
#[derive(Debug, Deserialize)]
struct ProbeDocument {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

enum ProbeRun {
    Finished(Vec<u8>, ProcessOutcome),
    Oversized,
    ReadFailed(io::Error),
    WaitFailed(io::Error),
}

pub async fn probe(tool: &ToolCommand, url: &str) -> Result<VideoMetadata, ClassifiedError> {
    let settings = tool.settings();
    let (mut process, stdout) = tool.spawn_probe(url).map_err(|err| {
        warn!(error = %err, "could not start yt-dlp probe");
        ClassifiedError::probe_failed(format!("Could not fetch video information: {err}"))
    })?;

    let limit = settings.probe_output_limit;
    let run = async {
        let mut raw = Vec::new();
        let mut reader = stdout.take(limit as u64 + 1);
        if let Err(err) = reader.read_to_end(&mut raw).await {
            return ProbeRun::ReadFailed(err);
        }
        if raw.len() > limit {
            return ProbeRun::Oversized;
        }
        drop(reader);
        match process.wait().await {
            Ok(outcome) => ProbeRun::Finished(raw, outcome),
            Err(err) => ProbeRun::WaitFailed(err),
        }
    };

    let run = match time::timeout(settings.probe_timeout, run).await {
        Ok(run) => run,
        Err(_) => {
            warn!(timeout = ?settings.probe_timeout, "yt-dlp probe timed out");
            stop(&mut process).await;
            return Err(ClassifiedError::probe_failed(format!(
                "Timed out fetching video information after {} seconds.",
                settings.probe_timeout.as_secs_f32()
            )));
        }
    };

    match run {
        ProbeRun::Finished(raw, outcome) if outcome.success => parse_metadata(raw),
        ProbeRun::Finished(_, outcome) => {
            let stderr = outcome.stderr.text();
            let err = classify(&stderr, outcome.exit_code, Phase::Probe);
            warn!(
                kind = ?err.kind,
                exit_code = ?outcome.exit_code,
                stderr = excerpt(&stderr),
                "yt-dlp probe failed"
            );
            Err(err)
        }
        ProbeRun::Oversized => {
            stop(&mut process).await;
            Err(ClassifiedError::probe_failed(format!(
                "Video information exceeded {limit} bytes."
            )))
        }
        ProbeRun::ReadFailed(err) | ProbeRun::WaitFailed(err) => {
            warn!(error = %err, "yt-dlp probe I/O failed");
            stop(&mut process).await;
            Err(ClassifiedError::probe_failed(format!(
                "Could not fetch video information: {err}"
            )))
        }
    }
}

async fn stop(process: &mut ToolProcess) {
    if process.is_reaped() {
        return;
    }
    if let Err(err) = process.terminate().await {
        warn!(error = %err, "terminating yt-dlp probe failed");
    }
}

/// Parses the first JSON document yt-dlp printed.
fn parse_metadata(raw: Vec<u8>) -> Result<VideoMetadata, ClassifiedError> {
    let raw_json = String::from_utf8(raw).map_err(|_| {
        ClassifiedError::probe_failed("yt-dlp returned video information that is not UTF-8.")
    })?;

    let document = serde_json::Deserializer::from_str(&raw_json)
        .into_iter::<ProbeDocument>()
        .next()
        .ok_or_else(|| ClassifiedError::probe_failed("yt-dlp returned no video information."))?
        .map_err(|err| {
            ClassifiedError::probe_failed(format!("Could not parse video information: {err}"))
        })?;

    let title = document.title.or(document.id).unwrap_or_default();
    debug!(%title, bytes = raw_json.len(), "probe succeeded");
    Ok(VideoMetadata { raw_json, title })
}
