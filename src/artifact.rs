use axum::{
    body::Body,
    http::{header, HeaderMap, Response, StatusCode},
};
use bytes::Bytes;

use crate::source_url::safe_file_name;

pub const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

/// Resolved byte window for a `Range: bytes=...` request. Only single ranges
/// are honored; multipart ranges fall back to the full body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parse a Range header value against the artifact length. Returns `None`
/// for absent/unsupported/unsatisfiable ranges, in which case the caller
/// serves the whole artifact.
pub fn parse_range(header_value: &str, total_len: u64) -> Option<ByteRange> {
    if total_len == 0 {
        return None;
    }
    let raw = header_value.trim().strip_prefix("bytes=")?;
    if raw.contains(',') {
        return None;
    }
    let (start_raw, end_raw) = raw.split_once('-')?;

    let range = if start_raw.is_empty() {
        // Suffix form: last N bytes.
        let suffix: u64 = end_raw.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        let start = total_len.saturating_sub(suffix);
        ByteRange {
            start,
            end: total_len - 1,
        }
    } else {
        let start: u64 = start_raw.parse().ok()?;
        let end = if end_raw.is_empty() {
            total_len - 1
        } else {
            end_raw.parse::<u64>().ok()?.min(total_len - 1)
        };
        ByteRange { start, end }
    };

    if range.start > range.end || range.start >= total_len {
        return None;
    }
    Some(range)
}

/// Build the success response for an artifact request, honoring a Range
/// header when present. `attachment` switches between download and inline
/// playback semantics.
pub fn artifact_response(
    headers: &HeaderMap,
    bytes: Bytes,
    title: &str,
    attachment: bool,
) -> Response<Body> {
    let total_len = bytes.len() as u64;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, total_len));

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, AUDIO_CONTENT_TYPE)
        .header(header::ACCEPT_RANGES, "bytes");

    builder = if attachment {
        builder
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", safe_file_name(title)),
            )
            .header(header::CACHE_CONTROL, "public, max-age=86400, immutable")
    } else {
        builder.header(header::CACHE_CONTROL, "public, max-age=3600")
    };

    let (status, body) = match range {
        Some(range) => {
            let slice = bytes.slice(range.start as usize..=range.end as usize);
            builder = builder
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, total_len),
                )
                .header(header::CONTENT_LENGTH, range.len());
            (StatusCode::PARTIAL_CONTENT, slice)
        }
        None => {
            builder = builder.header(header::CONTENT_LENGTH, total_len);
            (StatusCode::OK, bytes)
        }
    };

    builder
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_open_ended_ranges() {
        assert_eq!(
            parse_range("bytes=0-99", 1000),
            Some(ByteRange { start: 0, end: 99 })
        );
        assert_eq!(
            parse_range("bytes=200-", 1000),
            Some(ByteRange { start: 200, end: 999 })
        );
        assert_eq!(
            parse_range("bytes=0-5000", 1000),
            Some(ByteRange { start: 0, end: 999 })
        );
    }

    #[test]
    fn suffix_range_takes_last_bytes() {
        assert_eq!(
            parse_range("bytes=-100", 1000),
            Some(ByteRange { start: 900, end: 999 })
        );
        assert_eq!(
            parse_range("bytes=-5000", 1000),
            Some(ByteRange { start: 0, end: 999 })
        );
    }

    #[test]
    fn unsatisfiable_or_malformed_ranges_are_rejected() {
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=50-20", 1000), None);
        assert_eq!(parse_range("bytes=abc-def", 1000), None);
        assert_eq!(parse_range("items=0-10", 1000), None);
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), None);
        assert_eq!(parse_range("bytes=-0", 1000), None);
        assert_eq!(parse_range("bytes=0-", 0), None);
    }

    #[test]
    fn range_len_is_inclusive() {
        let range = ByteRange { start: 10, end: 19 };
        assert_eq!(range.len(), 10);
    }
}
