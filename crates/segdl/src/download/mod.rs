mod control;
mod worker;

use std::{
    collections::HashMap,
    num::NonZeroU32,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use reqwest::Url;
use tokio::task::JoinSet;

use self::{
    control::JobControl,
    worker::{SegmentOutcome, SegmentTask, WorkerContext},
};
use crate::{
    completion::Completion,
    config::DownloadConfig,
    decrypt::SegmentDecryptor,
    error::{SegdlError, SegdlResult},
    fetch::SegmentFetcher,
    hls::PlaylistResolver,
    job::{DownloadJob, JobId, JobRequest, JobStatus},
    merge::{AutoMerger, MergeSegment, Merger},
    notify::{Notifier, ProgressEvent},
    progress::ProgressTracker,
    segment::{segment_file_name, SegmentJob, SegmentStatus},
    store::{JobStore, JobUpdate, SegmentUpdate},
    util::{
        ensure_dir,
        http::{header_map, HttpClient},
    },
};

/// Drives download jobs from `pending` to a settled status.
///
/// ```text
///  create_job ──► start ──► resolve playlist ──► segment records
///                               │
///                               ▼
///                  ┌──── bounded worker pool ────┐
///                  │ fetch ─► decrypt ─► file    │ ◄── pause / cancel
///                  └──────────────┬──────────────┘
///                                 ▼
///                       completion ─► merge ─► completed
/// ```
///
/// Every operation that runs a job (`start`, `resume`, `retry`) returns once
/// the job has settled. Job level failures are recorded on the job, so these
/// calls only return an error when the request itself is invalid or the
/// store fails.
pub struct JobOrchestrator<S, N, M> {
    inner: Arc<Inner<S, N, M>>,
}

impl<S, N, M> Clone for JobOrchestrator<S, N, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S, N, M> {
    store: S,
    notifier: N,
    merger: M,

    resolver: PlaylistResolver,
    fetcher: SegmentFetcher,
    config: Arc<DownloadConfig>,

    controls: Mutex<HashMap<JobId, Arc<JobControl>>>,
}

impl<S, N, M> JobOrchestrator<S, N, M>
where
    S: JobStore,
    N: Notifier,
    M: Merger,
{
    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Register a new `pending` job and allocate its working directory.
    pub async fn create_job(&self, request: JobRequest) -> SegdlResult<DownloadJob> {
        let config = &self.inner.config;
        let job = DownloadJob::new(request, &config.output_dir, &config.work_root);
        ensure_dir(&job.work_dir).await?;
        self.inner.store.create_job(&job).await?;

        self.inner
            .controls
            .lock()
            .unwrap()
            .insert(job.id, Arc::new(JobControl::new(job.status)));
        tracing::info!("Job {} created for {}", job.id, job.url);
        Ok(job)
    }

    pub async fn status(&self, id: JobId) -> SegdlResult<DownloadJob> {
        self.inner.store.get_job(id).await
    }

    /// `pending -> downloading`, then run the job until it settles.
    pub async fn start(&self, id: JobId) -> SegdlResult<DownloadJob> {
        let control = self.control(id).await?;
        let _run = control.lock_run().await;

        control.transition_from(&[JobStatus::Pending], JobStatus::Downloading)?;
        self.inner
            .store
            .update_job(
                id,
                JobUpdate {
                    status: Some(JobStatus::Downloading),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.inner
            .notifier
            .emit_status_change(id, JobStatus::Downloading, None);

        self.run(id, &control).await
    }

    /// Ask a running job to stop. In-flight segments are discarded when they
    /// return and go back to `pending`.
    pub async fn pause(&self, id: JobId) -> SegdlResult<()> {
        self.signal(id, JobStatus::Paused).await
    }

    pub async fn cancel(&self, id: JobId) -> SegdlResult<()> {
        self.signal(id, JobStatus::Cancelled).await
    }

    /// `paused -> downloading`, dispatching the segments that are not done yet.
    pub async fn resume(&self, id: JobId) -> SegdlResult<DownloadJob> {
        let control = self.control(id).await?;
        let _run = control.lock_run().await;

        control.transition_from(&[JobStatus::Paused], JobStatus::Downloading)?;
        self.inner
            .store
            .update_job(id, JobUpdate::status(JobStatus::Downloading))
            .await?;
        self.inner
            .notifier
            .emit_status_change(id, JobStatus::Downloading, Some("resumed"));

        self.run(id, &control).await
    }

    /// `failed | cancelled -> downloading`. Failed segments get a fresh retry
    /// budget, completed ones are kept.
    pub async fn retry(&self, id: JobId) -> SegdlResult<DownloadJob> {
        let control = self.control(id).await?;
        let _run = control.lock_run().await;

        control.transition_from(
            &[JobStatus::Failed, JobStatus::Cancelled],
            JobStatus::Downloading,
        )?;

        let failed = self
            .inner
            .store
            .list_segments(id, Some(SegmentStatus::Failed))
            .await?;
        for segment in &failed {
            self.inner
                .store
                .update_segment(id, segment.index, SegmentUpdate::reset())
                .await?;
        }
        self.inner
            .store
            .update_job(
                id,
                JobUpdate {
                    status: Some(JobStatus::Downloading),
                    failed_segments: Some(0),
                    error_message: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!("Retrying job {id}, {} failed segments reset.", failed.len());
        self.inner
            .notifier
            .emit_status_change(id, JobStatus::Downloading, Some("retrying"));

        self.run(id, &control).await
    }

    async fn control(&self, id: JobId) -> SegdlResult<Arc<JobControl>> {
        let known = self.inner.controls.lock().unwrap().get(&id).cloned();
        if let Some(control) = known {
            return Ok(control);
        }

        // Job created by another process or before a restart
        let job = self.inner.store.get_job(id).await?;
        let control = self
            .inner
            .controls
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(JobControl::new(job.status)))
            .clone();
        Ok(control)
    }

    async fn signal(&self, id: JobId, status: JobStatus) -> SegdlResult<()> {
        let control = self.control(id).await?;
        control.transition(status)?;
        self.inner
            .store
            .update_job(id, JobUpdate::status(status))
            .await?;
        self.inner.notifier.emit_status_change(id, status, None);
        Ok(())
    }

    async fn run(&self, id: JobId, control: &Arc<JobControl>) -> SegdlResult<DownloadJob> {
        if let Err(e) = self.download(id, control).await {
            match e {
                SegdlError::JobNotFound(_) => return Err(e),
                e => self.fail(id, control, e.to_string()).await?,
            }
        }
        self.inner.store.get_job(id).await
    }

    async fn download(&self, id: JobId, control: &Arc<JobControl>) -> SegdlResult<()> {
        let store = &self.inner.store;
        let config = &self.inner.config;

        let mut job = store.get_job(id).await?;
        ensure_dir(&job.work_dir).await?;
        let headers = header_map(&job.headers)?;

        let mut segments = store.list_segments(id, None).await?;
        if segments.is_empty() {
            let playlist = self.inner.resolver.resolve(&job.url, &headers).await?;
            store
                .update_job(
                    id,
                    JobUpdate {
                        total_segments: Some(playlist.segments.len() as u64),
                        encryption_key: Some(playlist.encryption.key.clone()),
                        encryption_iv: Some(playlist.encryption.iv),
                        ..Default::default()
                    },
                )
                .await?;
            for (index, url) in playlist.segments.iter().enumerate() {
                let segment = SegmentJob::new(id, index as u64, url.to_string());
                store.create_segment(&segment).await?;
                segments.push(segment);
            }
            job = store.get_job(id).await?;
        }

        let mut tracker = tracker_from(job.total_segments, &segments);
        let pending: Vec<_> = segments
            .into_iter()
            .filter(SegmentJob::is_dispatchable)
            .collect();

        let context = Arc::new(WorkerContext {
            fetcher: self.inner.fetcher.clone(),
            decryptor: job
                .is_encrypted()
                .then(|| SegmentDecryptor::new(job.encryption_key.clone(), job.encryption_iv)),
            headers,
            config: config.clone(),
            control: control.clone(),
        });

        let concurrency = config.concurrency.get() as usize;
        tracing::info!(
            "Start downloading {} segments with {} thread(s).",
            pending.len(),
            concurrency
        );

        let mut queue = pending.into_iter();
        let mut workers = JoinSet::new();
        loop {
            while workers.len() < concurrency && control.is_downloading() {
                let Some(segment) = queue.next() else {
                    break;
                };
                let url = Url::parse(&segment.url)?;
                store
                    .update_segment(
                        id,
                        segment.index,
                        SegmentUpdate::status(SegmentStatus::Downloading),
                    )
                    .await?;
                workers.spawn(worker::run(
                    context.clone(),
                    SegmentTask {
                        index: segment.index,
                        url,
                        path: job.work_dir.join(segment_file_name(segment.index)),
                    },
                ));
            }

            let Some(result) = workers.join_next().await else {
                break;
            };
            let (index, outcome) = match result {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Segment worker crashed: {e}");
                    continue;
                }
            };
            self.settle(&job, index, outcome, control, &mut tracker)
                .await?;
        }

        let status = control.status();
        if status != JobStatus::Downloading {
            tracing::info!("Job {id} stopped: {status}");
            return Ok(());
        }

        match Completion::from(&tracker) {
            Completion::Merge => self.merge(&job, control).await,
            Completion::Fail { failed, message } => {
                tracing::error!("Failed to download {failed} segments of job {id}");
                self.fail(id, control, message).await
            }
            Completion::Wait => {
                let unsettled = tracker.total() - tracker.completed() - tracker.failed();
                self.fail(
                    id,
                    control,
                    format!("Download stopped with {unsettled} unsettled segments"),
                )
                .await
            }
        }
    }

    /// Record the outcome of one worker. The only writer of segment results
    /// and job counters.
    async fn settle(
        &self,
        job: &DownloadJob,
        index: u64,
        outcome: SegmentOutcome,
        control: &JobControl,
        tracker: &mut ProgressTracker,
    ) -> SegdlResult<()> {
        let store = &self.inner.store;

        let outcome = match outcome {
            _ if !control.is_downloading() => SegmentOutcome::Discarded,
            outcome => outcome,
        };
        let update = match outcome {
            SegmentOutcome::Discarded => {
                return store
                    .update_segment(job.id, index, SegmentUpdate::status(SegmentStatus::Pending))
                    .await;
            }
            SegmentOutcome::Completed { size, retries } => {
                tracker.record_completed(size);
                let filename = segment_file_name(index);
                tracing::info!(
                    "Processing {filename} finished. ({} / {} or {:.2}%)",
                    tracker.completed() + tracker.failed(),
                    tracker.total(),
                    tracker.percent()
                );
                SegmentUpdate {
                    status: Some(SegmentStatus::Completed),
                    file_path: Some(Some(job.work_dir.join(filename))),
                    file_size: Some(Some(size)),
                    retry_count: Some(retries),
                    error_message: Some(None),
                    completed_at: Some(Utc::now()),
                }
            }
            SegmentOutcome::Failed { error, retries } => {
                tracker.record_failed();
                SegmentUpdate {
                    status: Some(SegmentStatus::Failed),
                    retry_count: Some(retries),
                    error_message: Some(Some(error.to_string())),
                    ..Default::default()
                }
            }
        };
        store.update_segment(job.id, index, update).await?;

        store
            .update_job(
                job.id,
                JobUpdate {
                    completed_segments: Some(tracker.completed()),
                    failed_segments: Some(tracker.failed()),
                    progress: Some(tracker.percent()),
                    ..Default::default()
                },
            )
            .await?;
        self.inner.notifier.emit_progress(ProgressEvent::new(
            job.id,
            JobStatus::Downloading,
            tracker.snapshot(),
        ));
        Ok(())
    }

    async fn merge(&self, job: &DownloadJob, control: &JobControl) -> SegdlResult<()> {
        let store = &self.inner.store;

        control.transition(JobStatus::Merging)?;
        store
            .update_job(job.id, JobUpdate::status(JobStatus::Merging))
            .await?;
        self.inner
            .notifier
            .emit_status_change(job.id, JobStatus::Merging, None);

        let segments = store
            .list_segments(job.id, Some(SegmentStatus::Completed))
            .await?
            .into_iter()
            .map(|segment| {
                let path = segment
                    .file_path
                    .unwrap_or_else(|| job.work_dir.join(segment_file_name(segment.index)));
                MergeSegment::new(segment.index, path)
            })
            .collect();

        let strategy = match self.inner.merger.merge(segments, &job.output_path).await {
            Ok(strategy) => strategy,
            Err(e) => {
                let message = match e {
                    SegdlError::Merge(_) => e.to_string(),
                    e => format!("Failed to merge segments: {e}"),
                };
                return self.fail(job.id, control, message).await;
            }
        };

        control.transition(JobStatus::Completed)?;
        store
            .update_job(
                job.id,
                JobUpdate {
                    status: Some(JobStatus::Completed),
                    progress: Some(100.),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(
            "Job {} completed ({strategy:?}): {}",
            job.id,
            job.output_path.display()
        );
        self.inner.notifier.emit_status_change(
            job.id,
            JobStatus::Completed,
            Some(&job.output_path.to_string_lossy()),
        );

        if !self.inner.config.keep_segments {
            if let Err(e) = tokio::fs::remove_dir_all(&job.work_dir).await {
                tracing::warn!(
                    "Failed to clean up working directory {}: {e}",
                    job.work_dir.display()
                );
            }
        }
        Ok(())
    }

    /// Mark the job failed, unless it was paused or cancelled in the meantime.
    async fn fail(&self, id: JobId, control: &JobControl, message: String) -> SegdlResult<()> {
        if let Err(e) = control.transition_from(
            &[JobStatus::Downloading, JobStatus::Merging],
            JobStatus::Failed,
        ) {
            tracing::debug!("Job {id} not marked failed: {e}. {message}");
            return Ok(());
        }

        self.inner
            .store
            .update_job(
                id,
                JobUpdate {
                    status: Some(JobStatus::Failed),
                    error_message: Some(Some(message.clone())),
                    ..Default::default()
                },
            )
            .await?;
        self.inner
            .notifier
            .emit_status_change(id, JobStatus::Failed, Some(&message));
        Ok(())
    }
}

/// Counters of a run continued from stored segment records.
fn tracker_from(total: u64, segments: &[SegmentJob]) -> ProgressTracker {
    let (completed, failed, bytes) =
        segments
            .iter()
            .fold((0, 0, 0), |(completed, failed, bytes), segment| {
                match segment.status {
                    SegmentStatus::Completed => (
                        completed + 1,
                        failed,
                        bytes + segment.file_size.unwrap_or_default(),
                    ),
                    SegmentStatus::Failed => (completed, failed + 1, bytes),
                    _ => (completed, failed, bytes),
                }
            });
    ProgressTracker::resume(total, completed, failed, bytes)
}

pub struct JobOrchestratorBuilder {
    config: DownloadConfig,
    client: Option<HttpClient>,
}

impl JobOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: DownloadConfig::default(),
            client: None,
        }
    }

    pub fn with_config(config: DownloadConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    pub fn concurrency(mut self, concurrency: NonZeroU32) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay = retry_delay;
        self
    }

    pub fn segment_timeout(mut self, timeout: Duration) -> Self {
        self.config.segment_timeout = timeout;
        self
    }

    pub fn work_root<P>(mut self, work_root: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.config.work_root = work_root.into();
        self
    }

    pub fn output_dir<P>(mut self, output_dir: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.config.output_dir = output_dir.into();
        self
    }

    pub fn ffmpeg<P>(mut self, ffmpeg: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.config.ffmpeg = Some(ffmpeg.into());
        self
    }

    pub fn keep_segments(mut self, keep_segments: bool) -> Self {
        self.config.keep_segments = keep_segments;
        self
    }

    /// Use a preconfigured client instead of one built from the config.
    pub fn client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Build with the default ffmpeg-then-concatenation merger.
    pub fn build<S, N>(
        self,
        store: S,
        notifier: N,
    ) -> SegdlResult<JobOrchestrator<S, N, AutoMerger>>
    where
        S: JobStore,
        N: Notifier,
    {
        let merger = AutoMerger::from_config(&self.config);
        self.build_with_merger(store, notifier, merger)
    }

    pub fn build_with_merger<S, N, M>(
        self,
        store: S,
        notifier: N,
        merger: M,
    ) -> SegdlResult<JobOrchestrator<S, N, M>>
    where
        S: JobStore,
        N: Notifier,
        M: Merger,
    {
        let config = self.config;
        let client = match self.client {
            Some(client) => client,
            None => HttpClient::from_config(&config)?,
        };

        let resolver = PlaylistResolver::new(client.clone())
            .with_timeouts(config.manifest_timeout, config.key_timeout);
        let fetcher = SegmentFetcher::new(client, config.segment_timeout);

        Ok(JobOrchestrator {
            inner: Arc::new(Inner {
                store,
                notifier,
                merger,
                resolver,
                fetcher,
                config: Arc::new(config),
                controls: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Default for JobOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
