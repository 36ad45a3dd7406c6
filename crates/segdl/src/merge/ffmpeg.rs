use std::{
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::Command;

use super::{sort_segments, MergeSegment, MergeStrategy, Merger};
use crate::{
    error::{SegdlError, SegdlResult},
    util::ensure_dir,
};

/// Concatenate segments with the ffmpeg concat demuxer, without re-encoding.
pub struct FfmpegMerger {
    /// Explicit binary. Looked up in `PATH` when unset.
    ffmpeg: Option<PathBuf>,
    timeout: Duration,
}

impl FfmpegMerger {
    pub fn new(ffmpeg: Option<PathBuf>, timeout: Duration) -> Self {
        Self { ffmpeg, timeout }
    }

    fn ffmpeg(&self) -> SegdlResult<PathBuf> {
        match &self.ffmpeg {
            Some(path) => Ok(path.clone()),
            None => which::which("ffmpeg")
                .map_err(|e| SegdlError::Merge(format!("ffmpeg is not available: {e}"))),
        }
    }
}

impl Merger for FfmpegMerger {
    async fn merge(
        &self,
        mut segments: Vec<MergeSegment>,
        output: &Path,
    ) -> SegdlResult<MergeStrategy> {
        if segments.is_empty() {
            return Err(SegdlError::Merge("no segments to merge".to_string()));
        }
        sort_segments(&mut segments);

        let ffmpeg = self.ffmpeg()?;
        tracing::debug!("Concatenating with ffmpeg CLI...");

        let output_dir = match output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        ensure_dir(&output_dir).await?;

        let mut list = tempfile::Builder::new()
            .prefix(".segdl-")
            .suffix(".filelist.txt")
            .tempfile_in(&output_dir)
            .map_err(|e| SegdlError::filesystem(&output_dir, e))?;
        write_file_list(list.as_file_mut(), &segments)
            .map_err(|e| SegdlError::filesystem(list.path(), e))?;

        let child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(list.path())
            .args(["-c", "copy", "-y"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SegdlError::Merge(format!("failed to spawn ffmpeg: {e}")))?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SegdlError::Merge(format!("ffmpeg timed out after {:?}", self.timeout)))?
            .map_err(|e| SegdlError::Merge(format!("ffmpeg failed: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(SegdlError::Merge(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        tracing::info!("Successfully merged {} segments using ffmpeg", segments.len());
        Ok(MergeStrategy::StreamCopy)
    }
}

/// Write an ffmpeg concat demuxer list, one `file '<path>'` line per segment.
///
/// Single quotes inside a path are written as `'\''`.
pub fn write_file_list<W>(writer: &mut W, segments: &[MergeSegment]) -> std::io::Result<()>
where
    W: Write,
{
    for segment in segments {
        let path = std::path::absolute(&segment.path).unwrap_or_else(|_| segment.path.clone());
        let escaped = path.to_string_lossy().replace('\'', r"'\''");
        writeln!(writer, "file '{escaped}'")?;
    }
    writer.flush()
}
