//! Validation of the `POST /download` body. Nothing in here touches a
//! subprocess; a request that fails these checks never reaches the tool.

use serde::Deserialize;
use url::Url;

use crate::error::ClassifiedError;

const WATCH_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];
const SHORT_LINK_HOST: &str = "youtu.be";

/// Output container requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// `mp3`, extracted and transcoded audio.
    Audio,
    /// `mp4`, muxed video and audio.
    Video,
}

impl Container {
    pub fn from_tag(tag: &str) -> Result<Self, ClassifiedError> {
        match tag {
            "mp3" => Ok(Container::Audio),
            "mp4" => Ok(Container::Video),
            other => Err(ClassifiedError::unsupported_format(format!(
                "Unsupported format '{other}'. Expected 'mp3' or 'mp4'."
            ))),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Container::Audio => "mp3",
            Container::Video => "mp4",
        }
    }
}

/// Wire shape of the request body. Every field is optional here so that
/// missing values turn into `InvalidInput` rather than a framework rejection.
#[derive(Debug, Default, Deserialize)]
struct RawRequest {
    url: Option<String>,
    format: Option<String>,
    quality: Option<String>,
}

/// A request that passed validation. Immutable for the rest of its life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalRequest {
    pub source_url: String,
    pub container: Container,
    pub quality: String,
}

impl RetrievalRequest {
    pub fn from_body(body: &[u8]) -> Result<Self, ClassifiedError> {
        let raw: RawRequest = serde_json::from_slice(body).map_err(|err| {
            ClassifiedError::invalid_input(format!("Request body must be a JSON object: {err}"))
        })?;

        let url = raw.url.unwrap_or_default();
        let source_url = validate_source_url(&url)?;

        let format = raw
            .format
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ClassifiedError::invalid_input("Missing 'format' field."))?;
        let container = Container::from_tag(format.trim())?;

        Ok(Self {
            source_url,
            container,
            quality: raw.quality.unwrap_or_default().trim().to_owned(),
        })
    }
}

/// Checks that `raw` is a watch-page or short-link URL of the supported site
/// and returns it in normalized form.
pub fn validate_source_url(raw: &str) -> Result<String, ClassifiedError> {
    let invalid = || ClassifiedError::invalid_input("Invalid YouTube URL.");

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }

    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let accepted = if WATCH_HOSTS.contains(&host.as_str()) {
        url.path() == "/watch"
            && url
                .query_pairs()
                .any(|(key, value)| key == "v" && !value.is_empty())
    } else if host == SHORT_LINK_HOST {
        !url.path().trim_matches('/').is_empty()
    } else {
        false
    };

    if accepted { Ok(url.to_string()) } else { Err(invalid()) }
}
