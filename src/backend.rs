use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure classification for a conversion attempt. Only `Transient` is
/// retried; `Permanent` and `Configuration` fail fast.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub bytes: Bytes,
    pub title: String,
}

/// Advisory progress checkpoints in the 0..=100 range. Receivers treat them
/// as UI hints only; dropped sends are fine.
pub type ProgressSender = mpsc::Sender<u8>;

/// Download/encode tuning for one conversion attempt. Retries walk the
/// ladder toward the most compatible, slowest profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceProfile {
    pub name: &'static str,
    pub concurrent_fragments: u32,
    pub http_chunk_size: &'static str,
    pub downloader_retries: u32,
    pub ffmpeg_threads: u32,
    pub audio_bitrate: &'static str,
}

pub const AGGRESSIVE: PerformanceProfile = PerformanceProfile {
    name: "aggressive",
    concurrent_fragments: 8,
    http_chunk_size: "4M",
    downloader_retries: 5,
    ffmpeg_threads: 0,
    audio_bitrate: "192k",
};

pub const BALANCED: PerformanceProfile = PerformanceProfile {
    name: "balanced",
    concurrent_fragments: 4,
    http_chunk_size: "2M",
    downloader_retries: 3,
    ffmpeg_threads: 0,
    audio_bitrate: "192k",
};

pub const CONSERVATIVE: PerformanceProfile = PerformanceProfile {
    name: "conservative",
    concurrent_fragments: 2,
    http_chunk_size: "1M",
    downloader_retries: 3,
    ffmpeg_threads: 1,
    audio_bitrate: "128k",
};

const LADDER: [PerformanceProfile; 3] = [BALANCED, CONSERVATIVE, CONSERVATIVE];

/// Profile for the Nth attempt (0-based). The first attempt runs balanced;
/// every retry degrades toward conservative and stays there.
pub fn profile_for_attempt(attempt: u32) -> PerformanceProfile {
    LADDER[(attempt as usize).min(LADDER.len() - 1)]
}

/// One conversion backend, selected once at startup. Implementations turn a
/// video id into encoded audio bytes plus a display title, reporting coarse
/// progress along the way.
#[async_trait]
pub trait ConversionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn convert(
        &self,
        video_id: &str,
        profile: &PerformanceProfile,
        progress: ProgressSender,
    ) -> Result<ConversionOutput, BackendError>;
}

/// Map a diagnostic line from yt-dlp/ffmpeg or the provider onto the error
/// taxonomy. Unknown failures default to transient and get retried.
pub fn classify_diagnostic(message: &str) -> BackendError {
    let lower = message.to_ascii_lowercase();

    const PERMANENT_PATTERNS: [&str; 8] = [
        "video unavailable",
        "private video",
        "this video is not available",
        "account associated with this video has been terminated",
        "video has been removed",
        "not available in your country",
        "age-restricted",
        "sign in to confirm",
    ];
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return BackendError::Permanent(message.to_string());
    }

    const TRANSIENT_PATTERNS: [&str; 7] = [
        "timed out",
        "timeout",
        "connection reset",
        "temporary failure",
        "429",
        "502",
        "503",
    ];
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return BackendError::Transient(message.to_string());
    }

    BackendError::Transient(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_degrades_and_saturates() {
        assert_eq!(profile_for_attempt(0), BALANCED);
        assert_eq!(profile_for_attempt(1), CONSERVATIVE);
        assert_eq!(profile_for_attempt(2), CONSERVATIVE);
        assert_eq!(profile_for_attempt(9), CONSERVATIVE);
        assert!(profile_for_attempt(1).concurrent_fragments < profile_for_attempt(0).concurrent_fragments);
    }

    #[test]
    fn permanent_failures_are_not_retryable() {
        let err = classify_diagnostic("ERROR: Video unavailable");
        assert!(matches!(err, BackendError::Permanent(_)));
        assert!(!err.is_retryable());

        let err = classify_diagnostic("This video is not available in your country");
        assert!(!err.is_retryable());
    }

    #[test]
    fn network_failures_are_retryable() {
        assert!(classify_diagnostic("read: connection reset by peer").is_retryable());
        assert!(classify_diagnostic("HTTP Error 429: Too Many Requests").is_retryable());
        assert!(classify_diagnostic("download timed out").is_retryable());
    }

    #[test]
    fn unknown_failures_default_to_transient() {
        assert!(classify_diagnostic("something odd happened").is_retryable());
    }
}
