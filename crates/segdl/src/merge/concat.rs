use std::path::Path;

use tokio::{fs::File, io::AsyncWriteExt};

use super::{sort_segments, MergeSegment, MergeStrategy, Merger};
use crate::{
    error::{SegdlError, SegdlResult},
    util::ensure_dir,
};

/// Concatenate segment files byte by byte in index order.
///
/// Missing segment files are skipped with a warning.
pub struct ConcatMerger;

impl Merger for ConcatMerger {
    async fn merge(
        &self,
        mut segments: Vec<MergeSegment>,
        output: &Path,
    ) -> SegdlResult<MergeStrategy> {
        sort_segments(&mut segments);

        if let Some(dir) = output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_dir(dir).await?;
        }

        let mut output_file = File::create(output)
            .await
            .map_err(|e| SegdlError::filesystem(output, e))?;
        let mut merged = 0;
        for segment in &segments {
            let mut file = match File::open(&segment.path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("Segment file not found: {}", segment.path.display());
                    continue;
                }
                Err(e) => return Err(SegdlError::filesystem(&segment.path, e)),
            };
            tokio::io::copy(&mut file, &mut output_file)
                .await
                .map_err(|e| SegdlError::filesystem(output, e))?;
            merged += 1;
        }
        output_file
            .flush()
            .await
            .map_err(|e| SegdlError::filesystem(output, e))?;

        tracing::info!("Successfully merged {merged} segments using simple concatenation");
        Ok(MergeStrategy::Concat)
    }
}
