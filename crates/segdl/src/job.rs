use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SegdlError, SegdlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Downloading,
    Merging,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Transition table of a download job.
    ///
    /// ```text
    /// pending ──► downloading ──► merging ──► completed
    ///                │  ▲  ▲         │
    ///                │  │  │         └──► failed
    ///                ▼  │  │
    ///   paused / cancelled / failed   (manual resume or retry)
    /// ```
    ///
    /// `cancelled -> downloading` is accepted so that a cancelled job can be
    /// retried the same way a failed one can.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Merging)
                | (Downloading, Paused)
                | (Downloading, Cancelled)
                | (Downloading, Failed)
                | (Paused, Downloading)
                | (Paused, Cancelled)
                | (Failed, Downloading)
                | (Cancelled, Downloading)
                | (Merging, Completed)
                | (Merging, Failed)
        )
    }

    /// Validate and return the next status.
    pub fn transition(&self, next: JobStatus) -> SegdlResult<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SegdlError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters to create a [DownloadJob].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Final file path. Derived from the title when absent.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl JobRequest {
    pub fn new<S>(url: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn title<S>(mut self, title: S) -> Self
    where
        S: Into<String>,
    {
        self.title = Some(title.into());
        self
    }

    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn output_path<P>(mut self, path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.output_path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub url: String,
    pub title: Option<String>,
    pub headers: HashMap<String, String>,
    pub status: JobStatus,

    pub total_segments: u64,
    pub completed_segments: u64,
    pub failed_segments: u64,
    /// Percentage in `0..=100`
    pub progress: f64,

    /// Raw AES-128 key shared by all segments. Empty for plain playlists.
    #[serde(with = "hex_bytes")]
    pub encryption_key: Vec<u8>,
    /// Explicit IV from the playlist. `None` means the IV is derived from the
    /// segment index.
    pub encryption_iv: Option<[u8; 16]>,

    pub output_path: PathBuf,
    pub work_dir: PathBuf,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    pub fn new(request: JobRequest, output_dir: &std::path::Path, work_root: &std::path::Path) -> Self {
        let id = JobId::new();
        let output_path = request
            .output_path
            .unwrap_or_else(|| output_dir.join(output_file_name(&id, request.title.as_deref())));

        Self {
            id,
            url: request.url,
            title: request.title,
            headers: request.headers,
            status: JobStatus::Pending,
            total_segments: 0,
            completed_segments: 0,
            failed_segments: 0,
            progress: 0.,
            encryption_key: Vec::new(),
            encryption_iv: None,
            output_path,
            work_dir: work_root.join(format!("download_{id}")),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !self.encryption_key.is_empty()
    }
}

/// `<title>.mp4`, or `download_<id>.mp4` for untitled jobs.
pub fn output_file_name(id: &JobId, title: Option<&str>) -> String {
    let name = match title.map(str::trim) {
        Some(title) if !title.is_empty() => title.replace(['/', '\\'], "_"),
        _ => format!("download_{id}"),
    };
    if name.ends_with(".mp4") {
        name
    } else {
        format!("{name}.mp4")
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
