pub mod memory;

use std::{future::Future, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    error::SegdlResult,
    job::{DownloadJob, JobId, JobStatus},
    segment::{SegmentJob, SegmentStatus},
};

/// Persistence of jobs and their segments.
///
/// The engine never stores anything itself; every record change goes through
/// this trait.
pub trait JobStore: Send + Sync + 'static {
    fn create_job(&self, job: &DownloadJob) -> impl Future<Output = SegdlResult<()>> + Send;

    fn get_job(&self, id: JobId) -> impl Future<Output = SegdlResult<DownloadJob>> + Send;

    fn update_job(
        &self,
        id: JobId,
        update: JobUpdate,
    ) -> impl Future<Output = SegdlResult<()>> + Send;

    /// Delete a job together with all of its segments.
    fn delete_job(&self, id: JobId) -> impl Future<Output = SegdlResult<()>> + Send;

    fn create_segment(&self, segment: &SegmentJob)
        -> impl Future<Output = SegdlResult<()>> + Send;

    fn update_segment(
        &self,
        job_id: JobId,
        index: u64,
        update: SegmentUpdate,
    ) -> impl Future<Output = SegdlResult<()>> + Send;

    /// Segments of a job ordered by index, optionally filtered by status.
    fn list_segments(
        &self,
        job_id: JobId,
        status: Option<SegmentStatus>,
    ) -> impl Future<Output = SegdlResult<Vec<SegmentJob>>> + Send;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore,
{
    fn create_job(&self, job: &DownloadJob) -> impl Future<Output = SegdlResult<()>> + Send {
        self.as_ref().create_job(job)
    }

    fn get_job(&self, id: JobId) -> impl Future<Output = SegdlResult<DownloadJob>> + Send {
        self.as_ref().get_job(id)
    }

    fn update_job(
        &self,
        id: JobId,
        update: JobUpdate,
    ) -> impl Future<Output = SegdlResult<()>> + Send {
        self.as_ref().update_job(id, update)
    }

    fn delete_job(&self, id: JobId) -> impl Future<Output = SegdlResult<()>> + Send {
        self.as_ref().delete_job(id)
    }

    fn create_segment(
        &self,
        segment: &SegmentJob,
    ) -> impl Future<Output = SegdlResult<()>> + Send {
        self.as_ref().create_segment(segment)
    }

    fn update_segment(
        &self,
        job_id: JobId,
        index: u64,
        update: SegmentUpdate,
    ) -> impl Future<Output = SegdlResult<()>> + Send {
        self.as_ref().update_segment(job_id, index, update)
    }

    fn list_segments(
        &self,
        job_id: JobId,
        status: Option<SegmentStatus>,
    ) -> impl Future<Output = SegdlResult<Vec<SegmentJob>>> + Send {
        self.as_ref().list_segments(job_id, status)
    }
}

/// Changed fields of a [DownloadJob]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub total_segments: Option<u64>,
    pub completed_segments: Option<u64>,
    pub failed_segments: Option<u64>,
    pub progress: Option<f64>,
    pub encryption_key: Option<Vec<u8>>,
    pub encryption_iv: Option<Option<[u8; 16]>>,
    pub error_message: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(self, job: &mut DownloadJob) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(total) = self.total_segments {
            job.total_segments = total;
        }
        if let Some(completed) = self.completed_segments {
            job.completed_segments = completed;
        }
        if let Some(failed) = self.failed_segments {
            job.failed_segments = failed;
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(key) = self.encryption_key {
            job.encryption_key = key;
        }
        if let Some(iv) = self.encryption_iv {
            job.encryption_iv = iv;
        }
        if let Some(message) = self.error_message {
            job.error_message = message;
        }
        if let Some(started_at) = self.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
    }
}

/// Changed fields of a [SegmentJob]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SegmentUpdate {
    pub status: Option<SegmentStatus>,
    pub file_path: Option<Option<PathBuf>>,
    pub file_size: Option<Option<u64>>,
    pub retry_count: Option<u32>,
    pub error_message: Option<Option<String>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SegmentUpdate {
    pub fn status(status: SegmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Back to `pending` with a fresh retry budget.
    pub fn reset() -> Self {
        Self {
            status: Some(SegmentStatus::Pending),
            retry_count: Some(0),
            error_message: Some(None),
            ..Default::default()
        }
    }

    pub fn apply(self, segment: &mut SegmentJob) {
        if let Some(status) = self.status {
            segment.status = status;
        }
        if let Some(path) = self.file_path {
            segment.file_path = path;
        }
        if let Some(size) = self.file_size {
            segment.file_size = size;
        }
        if let Some(retry_count) = self.retry_count {
            segment.retry_count = retry_count;
        }
        if let Some(message) = self.error_message {
            segment.error_message = message;
        }
        if let Some(completed_at) = self.completed_at {
            segment.completed_at = Some(completed_at);
        }
    }
}
