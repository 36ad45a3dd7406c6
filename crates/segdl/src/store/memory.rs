use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use super::{JobStore, JobUpdate, SegmentUpdate};
use crate::{
    error::{SegdlError, SegdlResult},
    job::{DownloadJob, JobId},
    segment::{SegmentJob, SegmentStatus},
};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, DownloadJob>,
    segments: HashMap<JobId, BTreeMap<u64, SegmentJob>>,
}

/// [JobStore] kept in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &DownloadJob) -> SegdlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.jobs.insert(job.id, job.clone());
        state.segments.entry(job.id).or_default();
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> SegdlResult<DownloadJob> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(SegdlError::JobNotFound(id))
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> SegdlResult<()> {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(&id).ok_or(SegdlError::JobNotFound(id))?;
        update.apply(job);
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> SegdlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.jobs.remove(&id).ok_or(SegdlError::JobNotFound(id))?;
        state.segments.remove(&id);
        Ok(())
    }

    async fn create_segment(&self, segment: &SegmentJob) -> SegdlResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.jobs.contains_key(&segment.job_id) {
            return Err(SegdlError::JobNotFound(segment.job_id));
        }
        state
            .segments
            .entry(segment.job_id)
            .or_default()
            .insert(segment.index, segment.clone());
        Ok(())
    }

    async fn update_segment(
        &self,
        job_id: JobId,
        index: u64,
        update: SegmentUpdate,
    ) -> SegdlResult<()> {
        let mut state = self.state.lock().unwrap();
        let segment = state
            .segments
            .get_mut(&job_id)
            .and_then(|segments| segments.get_mut(&index))
            .ok_or(SegdlError::SegmentNotFound { job_id, index })?;
        update.apply(segment);
        Ok(())
    }

    async fn list_segments(
        &self,
        job_id: JobId,
        status: Option<SegmentStatus>,
    ) -> SegdlResult<Vec<SegmentJob>> {
        let state = self.state.lock().unwrap();
        let segments = state
            .segments
            .get(&job_id)
            .ok_or(SegdlError::JobNotFound(job_id))?;
        Ok(segments
            .values()
            .filter(|segment| status.map_or(true, |status| segment.status == status))
            .cloned()
            .collect())
    }
}
