use std::{path::PathBuf, sync::Arc};

use reqwest::{header::HeaderMap, Url};

use super::control::JobControl;
use crate::{
    config::DownloadConfig,
    decrypt::SegmentDecryptor,
    error::{SegdlError, SegdlResult},
    fetch::SegmentFetcher,
    util::remove_file_if_exists,
};

/// Shared by every worker of one run.
pub(crate) struct WorkerContext {
    pub(crate) fetcher: SegmentFetcher,
    pub(crate) decryptor: Option<SegmentDecryptor>,
    pub(crate) headers: HeaderMap,
    pub(crate) config: Arc<DownloadConfig>,
    pub(crate) control: Arc<JobControl>,
}

pub(crate) struct SegmentTask {
    pub(crate) index: u64,
    pub(crate) url: Url,
    pub(crate) path: PathBuf,
}

pub(crate) enum SegmentOutcome {
    Completed { size: u64, retries: u32 },
    Failed { error: SegdlError, retries: u32 },
    /// The job left `downloading` before the segment settled.
    Discarded,
}

/// Fetch and decrypt one segment, retrying network failures in place.
pub(crate) async fn run(context: Arc<WorkerContext>, task: SegmentTask) -> (u64, SegmentOutcome) {
    let attempts = context.config.retries.max(1);
    let filename = task
        .path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| task.index.to_string());

    let mut attempt = 0;
    let outcome = loop {
        if !context.control.is_downloading() {
            break SegmentOutcome::Discarded;
        }

        attempt += 1;
        match process(&context, &task).await {
            Ok(size) => {
                break SegmentOutcome::Completed {
                    size,
                    retries: attempt - 1,
                }
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!("Processing {filename} failed, retry later ({attempt}/{attempts}). {e}");
                tokio::time::sleep(context.config.retry_delay(attempt)).await;
            }
            Err(e) => {
                tracing::error!("Processing {filename} failed, drop. {e}");
                break SegmentOutcome::Failed {
                    error: e,
                    retries: attempt - 1,
                };
            }
        }
    };

    (task.index, outcome)
}

/// One attempt. Returns the size of the stored segment file.
async fn process(context: &WorkerContext, task: &SegmentTask) -> SegdlResult<u64> {
    let data = context
        .fetcher
        .fetch(task.index, &task.url, &context.headers, &task.path)
        .await?;

    let Some(decryptor) = &context.decryptor else {
        return Ok(data.len() as u64);
    };

    let result = match decryptor.decrypt(data, task.index).await {
        Ok(plain) => tokio::fs::write(&task.path, &plain)
            .await
            .map(|_| plain.len() as u64)
            .map_err(|e| SegdlError::filesystem(&task.path, e)),
        Err(e) => Err(e),
    };
    if result.is_err() {
        if let Err(e) = remove_file_if_exists(&task.path).await {
            tracing::warn!("Failed to remove segment {}: {e}", task.index);
        }
    }
    result
}
