use thiserror::Error;

use crate::yt_dlp::FormatRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    AtMost,
    Best,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectionRequest {
    pub target_height: Option<u32>,
    pub match_mode: MatchMode,
}

impl Default for SelectionRequest {
    fn default() -> Self {
        Self::best()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QualityError {
    #[error("invalid quality '{0}', expected e.g. 'best', '720p' or '<=720p'")]
    Malformed(String),
    #[error("quality height must be greater than zero")]
    ZeroHeight,
}

impl SelectionRequest {
    pub fn best() -> Self {
        Self {
            target_height: None,
            match_mode: MatchMode::Best,
        }
    }

    pub fn exact(height: u32) -> Self {
        Self {
            target_height: Some(height),
            match_mode: MatchMode::Exact,
        }
    }

    pub fn at_most(height: u32) -> Self {
        Self {
            target_height: Some(height),
            match_mode: MatchMode::AtMost,
        }
    }

    /// Parses a caller quality token: `best`, `720p`, `720`, `<=720p` or `max720p`.
    pub fn parse(token: &str) -> Result<Self, QualityError> {
        let token = token.trim().to_ascii_lowercase();
        if token.is_empty() || token == "best" {
            return Ok(Self::best());
        }

        let (rest, ceiling) = match token
            .strip_prefix("<=")
            .or_else(|| token.strip_prefix("max"))
        {
            Some(rest) => (rest.trim_start(), true),
            None => (token.as_str(), false),
        };
        let digits = rest.strip_suffix('p').unwrap_or(rest);

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(QualityError::Malformed(token.clone()));
        }
        let height = digits
            .parse::<u32>()
            .map_err(|_| QualityError::Malformed(token.clone()))?;
        if height == 0 {
            return Err(QualityError::ZeroHeight);
        }

        Ok(if ceiling {
            Self::at_most(height)
        } else {
            Self::exact(height)
        })
    }
}

/// Renders a height as the token callers send back, e.g. `1080p`.
pub fn quality_label(height: u32) -> String {
    format!("{height}p")
}

/// The `-f` argument handed to yt-dlp when downloading an already selected record.
///
/// Video-only records get the best audio track merged in, falling back to the
/// bare video stream when the site has no separate audio.
pub fn download_format_string(record: &FormatRecord, want_audio: bool) -> String {
    let id = &record.format_id;
    if want_audio || record.has_audio() {
        id.clone()
    } else {
        format!("{id}+bestaudio/{id}")
    }
}
