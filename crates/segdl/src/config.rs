use std::{num::NonZeroU32, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{SegdlError, SegdlResult};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Tunables of the download engine.
///
/// Durations are written as seconds in JSON:
///
/// ```json
/// { "concurrency": 16, "segment_timeout": 30, "work_root": "/var/tmp/segdl" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Segments fetched at the same time for one job.
    pub concurrency: NonZeroU32,
    /// Total attempts for one segment, including the first one.
    pub retries: u32,
    /// Base of the linear backoff between attempts: `attempt * retry_delay`.
    #[serde(with = "secs")]
    pub retry_delay: Duration,

    #[serde(with = "secs")]
    pub manifest_timeout: Duration,
    #[serde(with = "secs")]
    pub key_timeout: Duration,
    #[serde(with = "secs")]
    pub segment_timeout: Duration,
    #[serde(with = "secs")]
    pub merge_timeout: Duration,

    /// Root of per-job working directories.
    pub work_root: PathBuf,
    /// Directory of final files when a job has no explicit output path.
    pub output_dir: PathBuf,
    /// Explicit ffmpeg binary. Looked up in `PATH` when unset.
    pub ffmpeg: Option<PathBuf>,
    /// Keep the working directory after a successful merge.
    pub keep_segments: bool,

    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: NonZeroU32::new(8).unwrap(),
            retries: 3,
            retry_delay: Duration::from_secs(1),
            manifest_timeout: Duration::from_secs(30),
            key_timeout: Duration::from_secs(10),
            segment_timeout: Duration::from_secs(30),
            merge_timeout: Duration::from_secs(300),
            work_root: std::env::temp_dir(),
            output_dir: PathBuf::from("."),
            ffmpeg: None,
            keep_segments: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl DownloadConfig {
    pub fn from_json_file<P>(path: P) -> SegdlResult<Self>
    where
        P: AsRef<std::path::Path>,
    {
        let path = path.as_ref();
        let data =
            std::fs::read_to_string(path).map_err(|e| SegdlError::filesystem(path, e))?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
