//! `yt-dlp` backed fetch service.
//!
//! Metadata comes from `yt-dlp -J`. Audio is extracted with `-x`, which hands
//! conversion to ffmpeg. Progress is read from stdout through a
//! `--progress-template` that prints one machine-readable line per update;
//! the control token is checked between lines, so a paused job stops draining
//! the pipe and the child blocks on its next write.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tubeq_models::{AudioFormat, AudioQuality, MediaMetadata};

use crate::control::FetchControl;
use crate::error::{FetchError, FetchResult};
use crate::progress::ProgressSink;
use crate::service::{FetchRequest, FetchedMedia, MediaFetchService};
use crate::source_url::is_youtube_url;

const PROGRESS_MARKER: &str = "tubeq-progress";
const POSTPROCESS_MARKER: &str = "tubeq-post";

/// Stderr lines kept for error classification.
const STDERR_TAIL_LINES: usize = 40;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Check if yt-dlp is available.
pub fn check_ytdlp() -> FetchResult<PathBuf> {
    which::which("yt-dlp").map_err(|_| FetchError::ToolMissing("yt-dlp"))
}

/// Check if ffmpeg is available.
pub fn check_ffmpeg() -> FetchResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| FetchError::ToolMissing("ffmpeg"))
}

/// Fetch service driving the `yt-dlp` CLI.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    work_dir: PathBuf,
    extra_args: Vec<String>,
}

impl YtDlpFetcher {
    /// Temporary files are created under `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            extra_args: Vec::new(),
        }
    }

    /// Extra arguments appended to every download invocation.
    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn download_args(&self, request: &FetchRequest, output_template: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "--no-playlist",
            "--newline",
            "--progress",
            "--no-warnings",
            "--no-part",
            "--concurrent-fragments",
            "1",
            "--user-agent",
            USER_AGENT,
            "--progress-template",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push(format!(
            "download:{} %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s",
            PROGRESS_MARKER
        ));
        args.push("--progress-template".to_string());
        args.push(format!("postprocess:{} %(progress.status)s", POSTPROCESS_MARKER));

        args.push("-f".to_string());
        args.push(format_selector(request.quality));
        args.push("-x".to_string());
        args.push("--audio-format".to_string());
        args.push(request.format.extension().to_string());
        if request.format == AudioFormat::Mp3 {
            args.push("--audio-quality".to_string());
            args.push(format!("{}K", request.quality.bitrate_kbps()));
        }
        args.push("--postprocessor-args".to_string());
        args.push("ffmpeg:-ar 44100 -ac 2".to_string());

        args.push("-o".to_string());
        args.push(output_template.to_string_lossy().to_string());
        args.extend(self.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }
}

#[async_trait]
impl MediaFetchService for YtDlpFetcher {
    fn validate_url(&self, url: &str) -> bool {
        is_youtube_url(url)
    }

    async fn fetch_metadata(&self, url: &str) -> FetchResult<MediaMetadata> {
        let binary = check_ytdlp()?;
        if !self.validate_url(url) {
            return Err(FetchError::InvalidInput(format!("unsupported URL: {}", url)));
        }

        debug!(url = %url, "Fetching metadata with yt-dlp");
        let output = Command::new(binary)
            .args(["-J", "--no-playlist", "--no-warnings", "--user-agent", USER_AGENT, "--"])
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("yt-dlp stderr: {}", stderr);
            return Err(FetchError::classify_stderr("yt-dlp metadata failed", &stderr));
        }

        let metadata = parse_metadata(&output.stdout)?;
        info!(
            source_id = %metadata.source_id,
            title = %metadata.title,
            "Fetched media metadata"
        );
        Ok(metadata)
    }

    async fn fetch_and_convert(
        &self,
        request: &FetchRequest,
        progress: ProgressSink,
        control: FetchControl,
    ) -> FetchResult<FetchedMedia> {
        let binary = check_ytdlp()?;
        control.checkpoint().await?;

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let temp_dir = tempfile::Builder::new()
            .prefix("tubeq-")
            .tempdir_in(&self.work_dir)?;
        let output_template = temp_dir.path().join("audio.%(ext)s");
        let args = self.download_args(request, &output_template);

        info!(
            url = %request.url,
            quality = %request.quality,
            format = %request.format,
            "Starting yt-dlp audio extraction"
        );

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::network("yt-dlp stdout not captured"))?;
        let stderr_task = child.stderr.take().map(collect_tail);

        let mut lines = BufReader::new(stdout).lines();
        loop {
            // Parks here while paused; the child stalls once the pipe fills
            control.checkpoint().await?;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = control.cancelled() => return Err(FetchError::Cancelled),
            };
            let Some(line) = line else { break };
            match parse_progress_line(&line) {
                Some(ProgressLine::Transfer { downloaded, total }) => progress.transfer(downloaded, total),
                Some(ProgressLine::Postprocess { finished }) => {
                    progress.converting(if finished { 1.0 } else { 0.0 })
                }
                None => {}
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = control.cancelled() => return Err(FetchError::Cancelled),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            debug!("yt-dlp stderr: {}", stderr);
            let err = FetchError::classify_stderr("yt-dlp failed", &stderr);
            if matches!(err, FetchError::RateLimited(_)) {
                warn!(url = %request.url, "Upstream rate limit detected");
            }
            return Err(err);
        }

        control.checkpoint().await?;
        let path = find_output(temp_dir.path(), request.format).await?;
        let data = tokio::fs::read(&path).await?;
        if data.is_empty() {
            return Err(FetchError::conversion("converted file is empty"));
        }
        progress.converting(1.0);

        info!(
            url = %request.url,
            size_mb = data.len() as f64 / (1024.0 * 1024.0),
            "Audio extraction finished"
        );
        Ok(FetchedMedia::new(data, request.format))
    }
}

/// yt-dlp format selector for a quality preference.
fn format_selector(quality: AudioQuality) -> String {
    match quality {
        AudioQuality::Highest => "bestaudio/best".to_string(),
        AudioQuality::Lowest => "worstaudio/worst".to_string(),
        other => {
            let target = other.bitrate_kbps();
            format!(
                "bestaudio[abr>={}][abr<={}]/bestaudio/best",
                target.saturating_sub(32),
                target + 32
            )
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProgressLine {
    Transfer { downloaded: u64, total: Option<u64> },
    Postprocess { finished: bool },
}

fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        PROGRESS_MARKER => {
            let downloaded = parse_number(parts.next()?)?;
            let total = parts.next().and_then(parse_number);
            let estimate = parts.next().and_then(parse_number);
            Some(ProgressLine::Transfer {
                downloaded,
                total: total.or(estimate).filter(|t| *t > 0),
            })
        }
        POSTPROCESS_MARKER => Some(ProgressLine::Postprocess {
            finished: parts.next()? == "finished",
        }),
        _ => None,
    }
}

/// yt-dlp prints `NA` for unknown values and floats for estimates.
fn parse_number(raw: &str) -> Option<u64> {
    raw.parse::<u64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64))
}

async fn find_output(dir: &Path, format: AudioFormat) -> FetchResult<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(format.extension()) {
            return Ok(path);
        }
    }
    Err(FetchError::conversion(format!(
        "no {} file produced",
        format.extension()
    )))
}

fn collect_tail<R>(reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join("\n")
    })
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<FormatJson>,
}

#[derive(Debug, Deserialize)]
struct FormatJson {
    #[serde(default)]
    acodec: Option<String>,
    #[serde(default)]
    vcodec: Option<String>,
    #[serde(default)]
    abr: Option<f64>,
    #[serde(default)]
    filesize: Option<u64>,
    #[serde(default)]
    filesize_approx: Option<u64>,
}

impl FormatJson {
    fn is_audio_only(&self) -> bool {
        let has_audio = self.acodec.as_deref().is_some_and(|c| c != "none");
        let has_video = self.vcodec.as_deref().is_some_and(|c| c != "none");
        has_audio && !has_video
    }
}

fn parse_metadata(raw: &[u8]) -> FetchResult<MediaMetadata> {
    let info: InfoJson = serde_json::from_slice(raw)?;

    let best_audio = info
        .formats
        .iter()
        .filter(|f| f.is_audio_only())
        .max_by(|a, b| {
            a.abr
                .unwrap_or(0.0)
                .partial_cmp(&b.abr.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    let quality = best_audio
        .and_then(|f| f.abr)
        .map(|abr| format!("{}kbps", abr.round() as u64))
        .unwrap_or_else(|| "unknown".to_string());
    let size_bytes = best_audio.and_then(|f| f.filesize.or(f.filesize_approx));

    Ok(MediaMetadata {
        title: info.title.unwrap_or_default(),
        author: info
            .uploader
            .or(info.channel)
            .unwrap_or_else(|| "Unknown".to_string()),
        duration_secs: info.duration.map(|d| d.max(0.0).round() as u64).unwrap_or(0),
        thumbnail_url: info.thumbnail.unwrap_or_default(),
        quality,
        size_bytes,
        source_id: info.id,
    })
}
