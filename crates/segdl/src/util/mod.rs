pub mod http;

use std::path::Path;

use crate::error::{SegdlError, SegdlResult};

pub(crate) async fn ensure_dir<P>(dir: P) -> SegdlResult<()>
where
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    if !dir.exists() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SegdlError::filesystem(dir, e))?;
    }

    Ok(())
}

/// Remove a file if it exists. Other errors are returned.
pub(crate) async fn remove_file_if_exists<P>(path: P) -> SegdlResult<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SegdlError::filesystem(path, e)),
    }
}
