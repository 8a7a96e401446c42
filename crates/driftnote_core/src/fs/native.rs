//! Native filesystem implementation backed by tokio::fs.

use std::io::Result;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{BoxFuture, FileStat, StorageFs};

/// Filesystem implementation over the real disk.
///
/// `write_file` goes through a temp file plus rename so concurrent readers
/// (including the cloud-sync agent uploading the directory) never observe a
/// half-written file, and calls `sync_all` before the rename so a complete
/// file implies durable bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeFs;

impl NativeFs {
    /// Create a new native filesystem handle.
    pub fn new() -> Self {
        Self
    }
}

fn system_time_ms(t: std::io::Result<std::time::SystemTime>) -> i64 {
    t.ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl StorageFs for NativeFs {
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool> {
        Box::pin(async move { tokio::fs::try_exists(path).await.unwrap_or(false) })
    }

    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { tokio::fs::create_dir_all(path).await })
    }

    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { tokio::fs::read(path).await })
    }

    fn write_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let tmp = tmp_path(path);
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await
        })
    }

    fn append_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(content).await?;
            file.sync_all().await
        })
    }

    fn delete_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { tokio::fs::remove_file(path).await })
    }

    fn list_files<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Vec<PathBuf>>> {
        Box::pin(async move {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let mut files = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                match entry.file_type().await {
                    Ok(ft) if ft.is_file() => files.push(entry.path()),
                    // Entries that vanish mid-listing (cloud sync races) are skipped.
                    _ => {}
                }
            }
            Ok(files)
        })
    }

    fn stat<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<FileStat>> {
        Box::pin(async move {
            let meta = tokio::fs::metadata(path).await?;
            Ok(FileStat {
                size: meta.len(),
                mtime_ms: system_time_ms(meta.modified()),
                ctime_ms: system_time_ms(meta.created().or_else(|_| meta.modified())),
            })
        })
    }

    fn seek_write<'a>(
        &'a self,
        path: &'a Path,
        offset: u64,
        content: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            file.write_all(content).await?;
            file.sync_all().await
        })
    }
}

/// Temp-file name for atomic replacement, kept in the same directory so the
/// rename stays on one filesystem.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new();
        let path = dir.path().join("a.bin");

        fs.write_file(&path, b"hello").await.unwrap();
        assert!(fs.exists(&path).await);
        assert_eq!(fs.read_file(&path).await.unwrap(), b"hello");

        let stat = fs.stat(&path).await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(stat.mtime_ms > 0);
    }

    #[tokio::test]
    async fn append_creates_and_extends() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new();
        let path = dir.path().join("log.bin");

        fs.append_file(&path, b"ab").await.unwrap();
        fs.append_file(&path, b"cd").await.unwrap();
        assert_eq!(fs.read_file(&path).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn list_files_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new();
        fs.write_file(&dir.path().join("f.txt"), b"x").await.unwrap();
        fs.create_dir_all(&dir.path().join("sub")).await.unwrap();

        let files = fs.list_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("f.txt"));
    }

    #[tokio::test]
    async fn list_files_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new();
        let files = fs.list_files(&dir.path().join("nope")).await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn seek_write_flips_single_byte() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new();
        let path = dir.path().join("snap.bin");
        fs.write_file(&path, &[0u8; 10]).await.unwrap();

        fs.seek_write(&path, 5, &[0x01]).await.unwrap();
        let bytes = fs.read_file(&path).await.unwrap();
        assert_eq!(bytes[5], 0x01);
        assert_eq!(bytes[4], 0x00);
        assert_eq!(bytes.len(), 10);
    }
}
