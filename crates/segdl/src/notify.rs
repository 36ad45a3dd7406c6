use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    job::{JobId, JobStatus},
    progress::{format_eta, format_speed, ProgressSnapshot},
};

/// Progress of a job after a segment settled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    pub percent: f64,
    /// Bytes per second
    pub speed: f64,
    pub eta: Option<Duration>,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, status: JobStatus, snapshot: ProgressSnapshot) -> Self {
        Self {
            job_id,
            status,
            percent: snapshot.percent,
            speed: snapshot.speed,
            eta: snapshot.eta,
            completed: snapshot.completed,
            failed: snapshot.failed,
            total: snapshot.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress(ProgressEvent),
    StatusChange {
        job_id: JobId,
        status: JobStatus,
        message: Option<String>,
    },
}

/// Receives job events. Called from the orchestrator task, so implementations
/// must not block.
pub trait Notifier: Send + Sync + 'static {
    fn emit_progress(&self, event: ProgressEvent);

    fn emit_status_change(&self, job_id: JobId, status: JobStatus, message: Option<&str>);
}

impl<N> Notifier for std::sync::Arc<N>
where
    N: Notifier,
{
    fn emit_progress(&self, event: ProgressEvent) {
        self.as_ref().emit_progress(event)
    }

    fn emit_status_change(&self, job_id: JobId, status: JobStatus, message: Option<&str>) {
        self.as_ref().emit_status_change(job_id, status, message)
    }
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn emit_progress(&self, _event: ProgressEvent) {}

    fn emit_status_change(&self, _job_id: JobId, _status: JobStatus, _message: Option<&str>) {}
}

/// Writes events to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn emit_progress(&self, event: ProgressEvent) {
        let eta = event.eta.map(format_eta).unwrap_or_else(|| "-".to_string());
        tracing::info!(
            "[{}] {} / {} ({:.2}%), {} failed, {}, ETA {eta}",
            event.job_id,
            event.completed,
            event.total,
            event.percent,
            event.failed,
            format_speed(event.speed),
        );
    }

    fn emit_status_change(&self, job_id: JobId, status: JobStatus, message: Option<&str>) {
        match (status, message) {
            (JobStatus::Failed, Some(message)) => {
                tracing::error!("[{job_id}] Job failed: {message}")
            }
            (_, Some(message)) => tracing::info!("[{job_id}] Job {status}: {message}"),
            (_, None) => tracing::info!("[{job_id}] Job {status}"),
        }
    }
}

/// Forwards events into an unbounded channel.
///
/// Events are dropped silently once the receiver is gone.
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn emit_progress(&self, event: ProgressEvent) {
        let _ = self.sender.send(JobEvent::Progress(event));
    }

    fn emit_status_change(&self, job_id: JobId, status: JobStatus, message: Option<&str>) {
        let _ = self.sender.send(JobEvent::StatusChange {
            job_id,
            status,
            message: message.map(str::to_string),
        });
    }
}
