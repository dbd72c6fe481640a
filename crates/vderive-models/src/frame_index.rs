//! Mapping of a playback position to a stored frame index.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SCALE_NUM: u128 = 100_000_000_000_000;
const SCALE_DEN: u128 = 10_000_000_000_000_000;

/// Seconds per timestamp component, rightmost first.
const COMPONENT_WEIGHTS: [f64; 4] = [1.0, 60.0, 3_600.0, 86_400.0];

pub type FrameIndexResult<T> = Result<T, FrameIndexError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameIndexError {
    #[error("Must provide exactly one of percent, time, or index")]
    InvalidRequestShape,

    #[error("Missing data from video: {0}")]
    MissingMetadata(&'static str),

    #[error("Unrecognized timestamp format: {0}")]
    MalformedTimestamp(String),
}

/// A frame position, in one of three forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FrameRequest {
    /// Position as a percentage of the video, clamped to 0..=100
    Percent(i64),
    /// Position as `[[[dd:]hh:]mm:]ss[.sss]`
    Timestamp(String),
    /// Explicit 0-based index
    Index(u64),
}

impl FrameRequest {
    /// Build from optional query-style parameters; exactly one must be set.
    pub fn from_params(
        percent: Option<i64>,
        time: Option<String>,
        index: Option<u64>,
    ) -> FrameIndexResult<Self> {
        match (percent, time, index) {
            (Some(p), None, None) => Ok(FrameRequest::Percent(p)),
            (None, Some(t), None) => Ok(FrameRequest::Timestamp(t)),
            (None, None, Some(i)) => Ok(FrameRequest::Index(i)),
            _ => Err(FrameIndexError::InvalidRequestShape),
        }
    }
}

/// Resolve a request to a frame index.
///
/// `frame_count` is required for percent and timestamp requests, `duration`
/// only for timestamps. Explicit indices pass through unchecked.
pub fn resolve_frame_index(
    request: &FrameRequest,
    frame_count: Option<u64>,
    duration: Option<f64>,
) -> FrameIndexResult<u64> {
    match request {
        FrameRequest::Index(index) => Ok(*index),
        FrameRequest::Percent(percent) => {
            let frame_count = require_frame_count(frame_count)?;
            Ok(percent_to_index(*percent, frame_count))
        }
        FrameRequest::Timestamp(raw) => {
            let frame_count = require_frame_count(frame_count)?;
            let duration = duration
                .filter(|d| d.is_finite() && *d > 0.0)
                .ok_or(FrameIndexError::MissingMetadata("duration"))?;
            let seconds = parse_timestamp(raw)?.clamp(0.0, duration);
            Ok((seconds * frame_count as f64 / duration).floor() as u64)
        }
    }
}

fn require_frame_count(frame_count: Option<u64>) -> FrameIndexResult<u64> {
    frame_count
        .filter(|count| *count > 0)
        .ok_or(FrameIndexError::MissingMetadata("videoFrameCount"))
}

/// `floor(percent * frame_count / 100)` in scaled integer arithmetic.
fn percent_to_index(percent: i64, frame_count: u64) -> u64 {
    let percent = percent.clamp(0, 100) as u128;
    (SCALE_NUM * percent * frame_count as u128 / SCALE_DEN) as u64
}

/// Parse `[[[dd:]hh:]mm:]ss[.sss]` into seconds.
pub fn parse_timestamp(raw: &str) -> FrameIndexResult<f64> {
    let malformed = || FrameIndexError::MalformedTimestamp(raw.to_string());

    let parts: Vec<&str> = raw.trim().split(':').collect();
    if parts.len() > COMPONENT_WEIGHTS.len() {
        return Err(malformed());
    }

    let mut seconds = 0.0;
    for (part, weight) in parts.iter().rev().zip(COMPONENT_WEIGHTS) {
        let value: f64 = part.trim().parse().map_err(|_| malformed())?;
        if !value.is_finite() {
            return Err(malformed());
        }
        seconds += value * weight;
    }
    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_boundaries() {
        let req = |p| FrameRequest::Percent(p);
        assert_eq!(resolve_frame_index(&req(0), Some(250), None), Ok(0));
        assert_eq!(resolve_frame_index(&req(100), Some(250), None), Ok(250));
        assert_eq!(resolve_frame_index(&req(50), Some(251), None), Ok(125));
        assert_eq!(resolve_frame_index(&req(-5), Some(250), None), Ok(0));
        assert_eq!(resolve_frame_index(&req(400), Some(250), None), Ok(250));
    }

    #[test]
    fn test_percent_is_monotonic() {
        let mut last = 0;
        for p in 0..=100 {
            let index = resolve_frame_index(&FrameRequest::Percent(p), Some(7_919), None).unwrap();
            assert!(index >= last);
            last = index;
        }
        assert_eq!(last, 7_919);
    }

    #[test]
    fn test_timestamp_resolution() {
        let ts = |s: &str| FrameRequest::Timestamp(s.to_string());
        assert_eq!(resolve_frame_index(&ts("00:00:10"), Some(200), Some(20.0)), Ok(100));
        assert_eq!(resolve_frame_index(&ts("5.5"), Some(200), Some(20.0)), Ok(55));
        assert_eq!(resolve_frame_index(&ts("1:00"), Some(200), Some(20.0)), Ok(200));
        assert_eq!(resolve_frame_index(&ts("-3"), Some(200), Some(20.0)), Ok(0));
    }

    #[test]
    fn test_timestamp_component_weights() {
        assert_eq!(parse_timestamp("1:02:03"), Ok(3_723.0));
        assert_eq!(parse_timestamp("1:00:00:00"), Ok(86_400.0));
        assert_eq!(parse_timestamp("90"), Ok(90.0));
    }

    #[test]
    fn test_malformed_timestamps() {
        assert_eq!(
            resolve_frame_index(&FrameRequest::Timestamp("1:2:3:4:5".into()), Some(10), Some(10.0)),
            Err(FrameIndexError::MalformedTimestamp("1:2:3:4:5".into()))
        );
        assert!(matches!(parse_timestamp("aa:10"), Err(FrameIndexError::MalformedTimestamp(_))));
        assert!(matches!(parse_timestamp(""), Err(FrameIndexError::MalformedTimestamp(_))));
    }

    #[test]
    fn test_missing_metadata() {
        assert_eq!(
            resolve_frame_index(&FrameRequest::Percent(10), None, Some(3.0)),
            Err(FrameIndexError::MissingMetadata("videoFrameCount"))
        );
        assert_eq!(
            resolve_frame_index(&FrameRequest::Percent(10), Some(0), None),
            Err(FrameIndexError::MissingMetadata("videoFrameCount"))
        );
        assert_eq!(
            resolve_frame_index(&FrameRequest::Timestamp("1".into()), Some(10), None),
            Err(FrameIndexError::MissingMetadata("duration"))
        );
    }

    #[test]
    fn test_explicit_index_passes_through() {
        assert_eq!(resolve_frame_index(&FrameRequest::Index(9_999), None, None), Ok(9_999));
    }

    #[test]
    fn test_request_shape() {
        assert_eq!(
            FrameRequest::from_params(Some(50), Some("00:00:01".into()), None),
            Err(FrameIndexError::InvalidRequestShape)
        );
        assert_eq!(
            FrameRequest::from_params(None, None, None),
            Err(FrameIndexError::InvalidRequestShape)
        );
        assert_eq!(FrameRequest::from_params(None, None, Some(3)), Ok(FrameRequest::Index(3)));
    }
}
