//! Quality-aware format selection.
//!
//! Everything in here is a pure function over the decoded format list; the
//! HTTP layer decides what to do with the chosen record.

use std::cmp::Ordering;

use crate::{
    format::{MatchMode, SelectionRequest},
    yt_dlp::FormatRecord,
};

/// Picks one playable record for `request`, or `None` when no record carries
/// the wanted stream kind with a usable locator.
///
/// `Exact` falls back to `AtMost` on a miss, and `AtMost` falls back to the
/// highest record when nothing fits under the ceiling.
pub fn select<'a>(
    formats: &'a [FormatRecord],
    request: SelectionRequest,
    want_audio: bool,
) -> Option<&'a FormatRecord> {
    let ranked = ranked(formats, want_audio);
    let best = *ranked.first()?;

    let target = match (request.match_mode, request.target_height) {
        (MatchMode::Best, _) | (_, None) => return Some(best),
        (_, Some(target)) => target,
    };

    if request.match_mode == MatchMode::Exact {
        if let Some(exact) = ranked.iter().copied().find(|f| f.height == Some(target)) {
            return Some(exact);
        }
    }

    // ranked is descending, so the first record under the ceiling is the nearest one
    let below = ranked
        .iter()
        .find(|f| f.height.is_some_and(|h| h <= target))
        .copied();
    Some(below.unwrap_or(best))
}

/// Picks the audio stream for `/audio`: the best audio-only record by bitrate,
/// otherwise the best record that carries audio at all.
pub fn select_audio(formats: &[FormatRecord]) -> Option<&FormatRecord> {
    let mut audio_only: Vec<&FormatRecord> = formats
        .iter()
        .filter(|f| f.is_audio_only() && f.stream_locator().is_some())
        .collect();
    audio_only.sort_by(|a, b| audio_rank(b, a));
    audio_only
        .first()
        .copied()
        .or_else(|| select(formats, SelectionRequest::best(), true))
}

/// Distinct heights a caller can ask for, highest first.
pub fn available_heights(formats: &[FormatRecord]) -> Vec<u32> {
    let mut heights: Vec<u32> = ranked(formats, false)
        .into_iter()
        .filter_map(|f| f.height)
        .collect();
    heights.dedup();
    heights
}

fn ranked(formats: &[FormatRecord], want_audio: bool) -> Vec<&FormatRecord> {
    let mut candidates: Vec<&FormatRecord> = formats
        .iter()
        .filter(|f| if want_audio { f.has_audio() } else { f.has_video() })
        .filter(|f| f.stream_locator().is_some())
        .collect();
    // stable sort keeps input order for records that compare equal
    candidates.sort_by(|a, b| rank(b, a));
    candidates
}

/// Ascending order of preference: height, then manifest transport, then bitrate.
fn rank(a: &FormatRecord, b: &FormatRecord) -> Ordering {
    a.height
        .unwrap_or(0)
        .cmp(&b.height.unwrap_or(0))
        .then_with(|| a.is_manifest().cmp(&b.is_manifest()))
        .then_with(|| cmp_f64(a.tbr, b.tbr))
}

/// Ascending order of preference for audio-only records: bitrate, then manifest transport.
fn audio_rank(a: &FormatRecord, b: &FormatRecord) -> Ordering {
    cmp_f64(audio_bitrate(a), audio_bitrate(b))
        .then_with(|| a.is_manifest().cmp(&b.is_manifest()))
}

fn audio_bitrate(f: &FormatRecord) -> Option<f64> {
    f.abr.or(f.tbr)
}

fn cmp_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    a.unwrap_or(0.0).total_cmp(&b.unwrap_or(0.0))
}
