use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use crate::backend::{
    classify_diagnostic, BackendError, ConversionBackend, ConversionOutput, PerformanceProfile,
    ProgressSender,
};
use crate::source_url::normalize_url;

/// Local-pipeline backend: yt-dlp streams the best audio track to stdout,
/// ffmpeg encodes it to MP3 on a byte pipe. Progress is inferred from the
/// diagnostic output of both tools.
pub struct SubprocessPipelineBackend {
    ytdlp_bin: PathBuf,
    ffmpeg_bin: PathBuf,
}

impl SubprocessPipelineBackend {
    pub fn new(ytdlp_bin: PathBuf, ffmpeg_bin: PathBuf) -> Self {
        Self {
            ytdlp_bin,
            ffmpeg_bin,
        }
    }

    /// Cheap metadata probe; also serves as a fast-fail for permanently
    /// unavailable videos before the streaming pipeline spins up.
    async fn probe_title(&self, url: &str) -> Result<String, BackendError> {
        let output = Command::new(&self.ytdlp_bin)
            .arg("--print")
            .arg("title")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| {
                BackendError::Configuration(format!(
                    "Failed to execute {}: {err}",
                    self.ytdlp_bin.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let line = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("yt-dlp probe failed");
            return Err(classify_diagnostic(line));
        }

        let title = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if title.is_empty() {
            Ok("YouTube Audio".to_string())
        } else {
            Ok(title)
        }
    }
}

#[async_trait]
impl ConversionBackend for SubprocessPipelineBackend {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    async fn convert(
        &self,
        video_id: &str,
        profile: &PerformanceProfile,
        progress: ProgressSender,
    ) -> Result<ConversionOutput, BackendError> {
        let url = normalize_url(video_id);

        let title = self.probe_title(&url).await?;
        let _ = progress.send(20).await;

        let mut downloader = Command::new(&self.ytdlp_bin)
            .arg("-f")
            .arg("bestaudio/best")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--newline")
            .arg("--progress")
            .arg("--concurrent-fragments")
            .arg(profile.concurrent_fragments.to_string())
            .arg("--http-chunk-size")
            .arg(profile.http_chunk_size)
            .arg("--retries")
            .arg(profile.downloader_retries.to_string())
            .arg("-o")
            .arg("-")
            .arg(&url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The orchestrator cancels timed-out conversions by dropping this
            // future; the children must not outlive it.
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                BackendError::Configuration(format!(
                    "Failed to spawn {}: {err}",
                    self.ytdlp_bin.display()
                ))
            })?;

        let mut encoder = Command::new(&self.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-i")
            .arg("pipe:0")
            .arg("-vn")
            .arg("-acodec")
            .arg("libmp3lame")
            .arg("-b:a")
            .arg(profile.audio_bitrate)
            .arg("-threads")
            .arg(profile.ffmpeg_threads.to_string())
            .arg("-f")
            .arg("mp3")
            .arg("pipe:1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                BackendError::Configuration(format!(
                    "Failed to spawn {}: {err}",
                    self.ffmpeg_bin.display()
                ))
            })?;

        let mut downloader_stdout = downloader.stdout.take().ok_or_else(|| {
            BackendError::Transient("yt-dlp stdout was not captured".to_string())
        })?;
        let downloader_stderr = downloader.stderr.take().ok_or_else(|| {
            BackendError::Transient("yt-dlp stderr was not captured".to_string())
        })?;
        let mut encoder_stdin = encoder.stdin.take().ok_or_else(|| {
            BackendError::Transient("ffmpeg stdin was not captured".to_string())
        })?;
        let mut encoder_stdout = encoder.stdout.take().ok_or_else(|| {
            BackendError::Transient("ffmpeg stdout was not captured".to_string())
        })?;
        let encoder_stderr = encoder.stderr.take().ok_or_else(|| {
            BackendError::Transient("ffmpeg stderr was not captured".to_string())
        })?;

        // Pump yt-dlp stdout into ffmpeg stdin; dropping stdin at the end
        // signals EOF so the encoder can flush.
        let pump = tokio::spawn(async move {
            let copied = tokio::io::copy(&mut downloader_stdout, &mut encoder_stdin).await;
            drop(encoder_stdin);
            copied
        });

        let progress_for_downloader = progress.clone();
        let downloader_diag = tokio::spawn(async move {
            let mut lines = BufReader::new(downloader_stderr).lines();
            let mut tail: Option<String> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(pct) = parse_download_percent(trimmed) {
                    // Download milestones map onto the 20..60 band.
                    let scaled = 20 + (pct * 0.4) as u8;
                    let _ = progress_for_downloader.try_send(scaled.min(60));
                } else {
                    debug!(line = %trimmed, "yt-dlp");
                    tail = Some(trimmed.to_string());
                }
            }
            tail
        });

        let progress_for_encoder = progress.clone();
        let encoder_diag = tokio::spawn(async move {
            let mut lines = BufReader::new(encoder_stderr).lines();
            let mut tail: Option<String> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed.starts_with("size=") {
                    let _ = progress_for_encoder.try_send(75);
                } else {
                    tail = Some(trimmed.to_string());
                }
            }
            tail
        });

        let mut encoded = Vec::new();
        encoder_stdout
            .read_to_end(&mut encoded)
            .await
            .map_err(|err| BackendError::Transient(format!("Failed reading encoder output: {err}")))?;

        let downloader_status = downloader.wait().await.map_err(|err| {
            BackendError::Transient(format!("Failed waiting for yt-dlp: {err}"))
        })?;
        let encoder_status = encoder
            .wait()
            .await
            .map_err(|err| BackendError::Transient(format!("Failed waiting for ffmpeg: {err}")))?;

        if let Ok(Err(err)) = pump.await {
            warn!("pipe between yt-dlp and ffmpeg broke: {err}");
        }
        let downloader_tail = downloader_diag.await.ok().flatten();
        let encoder_tail = encoder_diag.await.ok().flatten();

        if !downloader_status.success() {
            let diag = downloader_tail.unwrap_or_else(|| {
                format!("yt-dlp exited with {downloader_status}")
            });
            return Err(classify_diagnostic(&diag));
        }
        if !encoder_status.success() {
            let diag = encoder_tail
                .unwrap_or_else(|| format!("ffmpeg exited with {encoder_status}"));
            return Err(classify_diagnostic(&diag));
        }
        if encoded.is_empty() {
            return Err(BackendError::Transient(
                "pipeline produced zero audio bytes".to_string(),
            ));
        }

        let _ = progress.send(90).await;

        Ok(ConversionOutput {
            bytes: Bytes::from(encoded),
            title,
        })
    }
}

/// Pull the percentage out of a yt-dlp `[download]  42.3% of ...` line.
fn parse_download_percent(line: &str) -> Option<f64> {
    let rest = line.strip_prefix("[download]")?.trim_start();
    let token = rest.split_whitespace().next()?;
    let number = token.strip_suffix('%')?;
    let pct: f64 = number.parse().ok()?;
    if (0.0..=100.0).contains(&pct) {
        Some(pct)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::parse_download_percent;

    #[test]
    fn parses_ytdlp_progress_lines() {
        assert_eq!(
            parse_download_percent("[download]  42.3% of 3.52MiB at 1.21MiB/s ETA 00:02"),
            Some(42.3)
        );
        assert_eq!(parse_download_percent("[download] 100% of 3.52MiB"), Some(100.0));
    }

    #[test]
    fn ignores_non_progress_lines() {
        assert_eq!(parse_download_percent("[info] Downloading webpage"), None);
        assert_eq!(parse_download_percent("[download] Destination: -"), None);
        assert_eq!(parse_download_percent("[download] 523% of weird"), None);
    }
}
