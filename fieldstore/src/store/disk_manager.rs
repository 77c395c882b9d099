use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, info};

use crate::{config::TEMP_FILE_SUFFIX, error::DbResult};

/// Whole-file access to data files.
///
/// Writes never touch the destination in place: the bytes go to a sibling
/// temporary file, which is synced and renamed over the destination. An
/// interrupted write leaves the previous file intact.
#[derive(Debug)]
pub(crate) struct DiskManager {
    path: PathBuf,
}

impl DiskManager {
    pub fn new(path: impl Into<PathBuf>) -> DiskManager {
        DiskManager { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole data file, or `None` if it doesn't exist yet.
    pub async fn read(&self) -> DbResult<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                info!(path = %self.path.display(), size = bytes.len(), "read data file");
                Ok(Some(bytes))
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Replaces the data file contents.
    pub async fn write(&self, bytes: &[u8]) -> DbResult<()> {
        write_atomic(&self.path, bytes).await
    }
}

/// Writes `bytes` to `path` through a synced temporary file and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> DbResult<()> {
    let folder = match path.parent() {
        Some(folder) if !folder.as_os_str().is_empty() => folder,
        _ => Path::new("."),
    };
    fs::create_dir_all(folder).await?;

    let mut temp = path.as_os_str().to_owned();
    temp.push(".");
    temp.push(TEMP_FILE_SUFFIX);
    let temp = PathBuf::from(temp);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp, path).await?;
    sync_dir(folder).await?;

    info!(path = %path.display(), size = bytes.len(), "wrote data file");
    Ok(())
}

/// Makes a rename in the folder durable.
async fn sync_dir(folder: &Path) -> DbResult<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(folder).await?;
        dir.sync_all().await?;
    }
    debug!(folder = %folder.display(), "synced folder");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_write() -> DbResult<()> {
        let dir = tempfile::tempdir()?;
        let disk = DiskManager::new(dir.path().join("nested/data.fsdb"));
        assert_eq!(disk.read().await?, None);

        disk.write(b"first").await?;
        disk.write(b"second").await?;
        assert_eq!(disk.read().await?.as_deref(), Some(&b"second"[..]));

        // No temporary file is left behind.
        let mut entries = fs::read_dir(dir.path().join("nested")).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        assert_eq!(names, ["data.fsdb"]);
        Ok(())
    }
}
