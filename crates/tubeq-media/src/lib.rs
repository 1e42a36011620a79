//! Media fetch contract and the `yt-dlp` adapter.
//!
//! This crate provides:
//! - The [`MediaFetchService`] trait the worker drives
//! - A cooperative pause/cancel token checked at chunk boundaries
//! - Raw progress reporting over a bounded channel
//! - A `yt-dlp` backed implementation

pub mod control;
pub mod error;
pub mod progress;
pub mod service;
pub mod source_url;
pub mod ytdlp;

pub use control::{ControlSignal, FetchControl};
pub use error::{FetchError, FetchResult};
pub use progress::{FetchProgress, ProgressSink};
pub use service::{FetchRequest, FetchedMedia, MediaFetchService};
pub use source_url::{is_youtube_url, video_id};
pub use ytdlp::{check_ffmpeg, check_ytdlp, YtDlpFetcher};
