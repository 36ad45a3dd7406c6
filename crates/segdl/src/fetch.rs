use std::{path::Path, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{header::HeaderMap, Url};
use tokio::{fs::File, io::AsyncWriteExt};

use crate::{
    error::{SegdlError, SegdlResult},
    util::{
        http::{error_for_status, HttpClient},
        remove_file_if_exists,
    },
};

/// Downloads a single segment into the job's working directory.
#[derive(Clone)]
pub struct SegmentFetcher {
    client: HttpClient,
    timeout: Duration,
}

impl SegmentFetcher {
    pub fn new(client: HttpClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Stream the segment at `url` into `path` and return the raw bytes.
    ///
    /// The whole attempt, including the body, is bounded by the fetcher timeout.
    /// On any failure the partially written file is removed.
    pub async fn fetch(
        &self,
        index: u64,
        url: &Url,
        headers: &HeaderMap,
        path: &Path,
    ) -> SegdlResult<Bytes> {
        let result = tokio::time::timeout(self.timeout, self.fetch_to_file(index, url, headers, path))
            .await
            .unwrap_or_else(|_| {
                Err(SegdlError::SegmentFetch {
                    index,
                    reason: format!("timed out after {:?}", self.timeout),
                })
            });

        if result.is_err() {
            if let Err(e) = remove_file_if_exists(path).await {
                tracing::warn!("Failed to remove partial segment {index}: {e}");
            }
        }
        result
    }

    async fn fetch_to_file(
        &self,
        index: u64,
        url: &Url,
        headers: &HeaderMap,
        path: &Path,
    ) -> SegdlResult<Bytes> {
        let fetch_error = |reason: String| SegdlError::SegmentFetch { index, reason };

        let response = self
            .client
            .get_with(url.clone(), headers)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        let response = error_for_status(response).map_err(|e| fetch_error(e.to_string()))?;

        let mut file = File::create(path)
            .await
            .map_err(|e| SegdlError::filesystem(path, e))?;
        let mut data = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fetch_error(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| SegdlError::filesystem(path, e))?;
            data.extend_from_slice(&chunk);
        }
        file.flush()
            .await
            .map_err(|e| SegdlError::filesystem(path, e))?;

        Ok(data.freeze())
    }
}
