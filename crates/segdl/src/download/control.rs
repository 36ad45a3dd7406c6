use std::sync::Mutex;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::{
    error::{SegdlError, SegdlResult},
    job::JobStatus,
};

/// In-process state shared between the run of a job and its controllers.
///
/// The status is the only cancellation signal: workers and the dispatch loop
/// poll it and stop once it leaves `downloading`.
pub(crate) struct JobControl {
    status: Mutex<JobStatus>,
    /// Held for the whole run. A resume or retry waits here until the previous
    /// run has drained its in-flight segments.
    run: AsyncMutex<()>,
}

impl JobControl {
    pub(crate) fn new(status: JobStatus) -> Self {
        Self {
            status: Mutex::new(status),
            run: AsyncMutex::new(()),
        }
    }

    pub(crate) fn status(&self) -> JobStatus {
        *self.status.lock().unwrap()
    }

    pub(crate) fn is_downloading(&self) -> bool {
        self.status() == JobStatus::Downloading
    }

    pub(crate) fn transition(&self, next: JobStatus) -> SegdlResult<()> {
        let mut status = self.status.lock().unwrap();
        *status = status.transition(next)?;
        Ok(())
    }

    /// Like [JobControl::transition], but only out of one of `from`.
    pub(crate) fn transition_from(&self, from: &[JobStatus], next: JobStatus) -> SegdlResult<()> {
        let mut status = self.status.lock().unwrap();
        if !from.contains(&status) {
            return Err(SegdlError::InvalidTransition {
                from: *status,
                to: next,
            });
        }
        *status = status.transition(next)?;
        Ok(())
    }

    pub(crate) async fn lock_run(&self) -> MutexGuard<'_, ()> {
        self.run.lock().await
    }
}
