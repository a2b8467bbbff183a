//! Maps a (container, quality) pair onto the yt-dlp arguments that produce it
//! and the headers the response is sent with.

use crate::request::Container;

/// Audio quality tiers. Each maps to a fixed `--audio-quality` level, where
/// yt-dlp treats `0` as best and `10` as worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioQuality {
    High,
    Medium,
    Low,
    ToolDefault,
}

impl AudioQuality {
    pub fn parse(quality: &str) -> Self {
        match quality {
            "320kbps" => AudioQuality::High,
            "128kbps" => AudioQuality::Medium,
            "64kbps" => AudioQuality::Low,
            _ => AudioQuality::ToolDefault,
        }
    }

    fn encoder_level(self) -> Option<&'static str> {
        match self {
            AudioQuality::High => Some("0"),
            AudioQuality::Medium => Some("5"),
            AudioQuality::Low => Some("7"),
            AudioQuality::ToolDefault => None,
        }
    }
}

/// Video quality tiers, expressed as height bounds on the selected stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoQuality {
    /// At least 2160 lines.
    Uhd,
    /// At most the given number of lines.
    AtMost(u32),
    BestMp4,
}

impl VideoQuality {
    pub fn parse(quality: &str) -> Self {
        match quality {
            "4k" => VideoQuality::Uhd,
            "1080p" => VideoQuality::AtMost(1080),
            "720p" => VideoQuality::AtMost(720),
            "480p" => VideoQuality::AtMost(480),
            "360p" => VideoQuality::AtMost(360),
            _ => VideoQuality::BestMp4,
        }
    }

    /// Builds the `-f` selector: separate mp4 video plus m4a audio within the
    /// bound, then a combined mp4 within the bound, then whatever is best.
    pub fn selector(self) -> String {
        let bound = match self {
            VideoQuality::Uhd => "height>=2160".to_owned(),
            VideoQuality::AtMost(height) => format!("height<={height}"),
            VideoQuality::BestMp4 => return "best[ext=mp4]".to_owned(),
        };
        format!("bestvideo[{bound}][ext=mp4]+bestaudio[ext=m4a]/best[{bound}][ext=mp4]/best")
    }
}

/// Resolved description of one (container, quality) combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
    pub tool_arguments: Vec<String>,
    pub content_type: &'static str,
    pub file_extension: &'static str,
}

impl FormatSpec {
    pub fn content_disposition(&self, sanitized_title: &str) -> String {
        format!(
            "attachment; filename=\"{}.{}\"",
            sanitized_title, self.file_extension
        )
    }
}

/// Total over every quality string: unknown tiers fall back to the container
/// default instead of failing.
pub fn resolve(container: Container, quality: &str) -> FormatSpec {
    match container {
        Container::Audio => {
            let mut tool_arguments = vec![
                "-x".to_owned(),
                "--audio-format".to_owned(),
                "mp3".to_owned(),
            ];
            if let Some(level) = AudioQuality::parse(quality).encoder_level() {
                tool_arguments.push("--audio-quality".to_owned());
                tool_arguments.push(level.to_owned());
            }
            FormatSpec {
                tool_arguments,
                content_type: "audio/mpeg",
                file_extension: "mp3",
            }
        }
        Container::Video => FormatSpec {
            tool_arguments: vec!["-f".to_owned(), VideoQuality::parse(quality).selector()],
            content_type: "video/mp4",
            file_extension: "mp4",
        },
    }
}
