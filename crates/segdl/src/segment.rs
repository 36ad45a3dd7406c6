use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// One segment of a [DownloadJob](crate::job::DownloadJob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentJob {
    pub job_id: JobId,
    /// Position in the media playlist, starts from 0. Defines the merge order.
    pub index: u64,
    pub url: String,
    pub status: SegmentStatus,

    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub retry_count: u32,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SegmentJob {
    pub fn new(job_id: JobId, index: u64, url: String) -> Self {
        Self {
            job_id,
            index,
            url,
            status: SegmentStatus::Pending,
            file_path: None,
            file_size: None,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Segments left behind in `downloading` were interrupted and are fetched again.
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self.status,
            SegmentStatus::Pending | SegmentStatus::Downloading
        )
    }
}

/// Segment file name inside the job's working directory.
pub fn segment_file_name(index: u64) -> String {
    format!("segment_{index:06}.ts")
}
