mod concat;
mod ffmpeg;

pub use concat::ConcatMerger;
pub use ffmpeg::{write_file_list, FfmpegMerger};

use std::{
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{config::DownloadConfig, error::SegdlResult, util::remove_file_if_exists};

/// A downloaded segment file waiting to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSegment {
    pub index: u64,
    pub path: PathBuf,
}

impl MergeSegment {
    pub fn new<P>(index: u64, path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            index,
            path: path.into(),
        }
    }
}

/// How the output file was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// ffmpeg concat demuxer with stream copy.
    StreamCopy,
    /// Raw binary concatenation.
    Concat,
}

pub trait Merger: Send + Sync + 'static {
    /// Merge `segments` into `output`.
    ///
    /// Segments may be passed in any order. Implementations write them in
    /// ascending index order, create the output directory when missing and
    /// overwrite an existing output file.
    fn merge(
        &self,
        segments: Vec<MergeSegment>,
        output: &Path,
    ) -> impl Future<Output = SegdlResult<MergeStrategy>> + Send;
}

pub(crate) fn sort_segments(segments: &mut [MergeSegment]) {
    segments.sort_by_key(|segment| segment.index);
}

/// Stream copy with ffmpeg, falling back to raw concatenation when ffmpeg is
/// missing, fails or times out.
pub struct AutoMerger {
    ffmpeg: FfmpegMerger,
    concat: ConcatMerger,
}

impl AutoMerger {
    pub fn new(ffmpeg: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffmpeg: FfmpegMerger::new(ffmpeg, timeout),
            concat: ConcatMerger,
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(config.ffmpeg.clone(), config.merge_timeout)
    }
}

impl Merger for AutoMerger {
    async fn merge(
        &self,
        mut segments: Vec<MergeSegment>,
        output: &Path,
    ) -> SegdlResult<MergeStrategy> {
        sort_segments(&mut segments);
        tracing::info!("Merging {} chunks...", segments.len());

        match self.ffmpeg.merge(segments.clone(), output).await {
            Ok(strategy) => return Ok(strategy),
            Err(e) => {
                tracing::warn!("ffmpeg merge failed, falling back to concatenation. {e}");
            }
        }

        match self.concat.merge(segments, output).await {
            Ok(strategy) => Ok(strategy),
            Err(e) => {
                if let Err(e) = remove_file_if_exists(output).await {
                    tracing::warn!("Failed to remove incomplete output: {e}");
                }
                Err(e)
            }
        }
    }
}
