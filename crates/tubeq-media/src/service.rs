//! Media fetch service contract.

use async_trait::async_trait;
use tubeq_models::{AudioFormat, AudioQuality, DownloadJob, MediaMetadata};

use crate::control::FetchControl;
use crate::error::FetchResult;
use crate::progress::ProgressSink;

/// What to fetch and how to encode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub quality: AudioQuality,
    pub format: AudioFormat,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, quality: AudioQuality, format: AudioFormat) -> Self {
        Self {
            url: url.into(),
            quality,
            format,
        }
    }

    pub fn for_job(job: &DownloadJob) -> Self {
        Self::new(job.source_url.clone(), job.quality, job.format)
    }
}

/// Converted media returned by a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

impl FetchedMedia {
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Self {
        Self { data, format }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }
}

/// Upstream media source.
///
/// Implementations must call [`FetchControl::checkpoint`] between I/O chunks
/// so pause and cancel take effect at the next chunk boundary.
#[async_trait]
pub trait MediaFetchService: Send + Sync {
    /// Cheap syntactic check, no network access.
    fn validate_url(&self, url: &str) -> bool;

    /// Look up descriptive metadata.
    ///
    /// Fails with `NotFound` or `RateLimited`.
    async fn fetch_metadata(&self, url: &str) -> FetchResult<MediaMetadata>;

    /// Fetch the media and convert it to the requested format.
    ///
    /// Fails with `Network`, `RateLimited`, `Cancelled` or `Conversion`.
    async fn fetch_and_convert(
        &self,
        request: &FetchRequest,
        progress: ProgressSink,
        control: FetchControl,
    ) -> FetchResult<FetchedMedia>;
}
