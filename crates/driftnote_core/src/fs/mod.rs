//! Async filesystem abstraction.
//!
//! The engine never touches `std::fs` directly: every read and write goes
//! through the [`StorageFs`] trait so the same code can run against a real
//! disk ([`NativeFs`]), an in-memory tree in tests ([`MemoryFs`]), or any
//! other backend the host application supplies.
//!
//! ## Object safety
//!
//! `StorageFs` is designed to be object-safe so it can be used behind
//! `dyn StorageFs` (the engine holds one `Arc<dyn StorageFs>` per process).
//! To enable this, all methods return boxed futures.

use std::future::Future;
use std::io::Result;
use std::path::{Path, PathBuf};
use std::pin::Pin;

mod memory;
mod native;

pub use memory::MemoryFs;
pub use native::NativeFs;

/// A boxed future for object-safe async methods.
///
/// Futures are `Send` for compatibility with multi-threaded runtimes.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// File metadata returned by [`StorageFs::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File size in bytes.
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch.
    pub mtime_ms: i64,
    /// Creation (or metadata-change) time, milliseconds since the Unix epoch.
    pub ctime_ms: i64,
}

/// Async abstraction over the filesystem operations the engine needs.
///
/// All operations are asynchronous because the backing tree may live under a
/// cloud-sync service where any access can stall. Implementations surface
/// missing files as `std::io::ErrorKind::NotFound`; callers decide whether
/// that means "no data yet" or a real failure.
pub trait StorageFs: Send + Sync {
    /// Checks if a file or directory exists.
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool>;

    /// Creates a directory and all parent directories.
    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// Reads the entire file into memory.
    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Writes (replacing) the entire file.
    ///
    /// Implementations must make the replacement atomic with respect to
    /// concurrent readers and durable on return: a reader never observes a
    /// half-written file, and the bytes survive a crash once this resolves.
    fn write_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Appends bytes to a file, creating it if absent.
    fn append_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Deletes a file.
    fn delete_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// Lists the direct children of a directory, files only.
    ///
    /// A missing directory yields an empty list: sync directories created by
    /// older builds may lack optional subdirectories.
    fn list_files<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Vec<PathBuf>>>;

    /// Returns size and timestamps for a file.
    fn stat<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<FileStat>>;

    /// Overwrites `content.len()` bytes at `offset` without touching the rest
    /// of the file, durably.
    ///
    /// The snapshot writer uses this to flip the status byte after the
    /// payload is on disk. The default implementation falls back to
    /// read-modify-write for backends without positioned writes.
    fn seek_write<'a>(
        &'a self,
        path: &'a Path,
        offset: u64,
        content: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut bytes = self.read_file(path).await?;
            let start = offset as usize;
            let end = start + content.len();
            if end > bytes.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("seek_write past end of {}", path.display()),
                ));
            }
            bytes[start..end].copy_from_slice(content);
            self.write_file(path, &bytes).await
        })
    }
}

// Blanket implementation for references to StorageFs
impl<T: StorageFs + ?Sized> StorageFs for &T {
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool> {
        (*self).exists(path)
    }

    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        (*self).create_dir_all(path)
    }

    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        (*self).read_file(path)
    }

    fn write_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        (*self).write_file(path, content)
    }

    fn append_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        (*self).append_file(path, content)
    }

    fn delete_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        (*self).delete_file(path)
    }

    fn list_files<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Vec<PathBuf>>> {
        (*self).list_files(dir)
    }

    fn stat<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<FileStat>> {
        (*self).stat(path)
    }

    fn seek_write<'a>(
        &'a self,
        path: &'a Path,
        offset: u64,
        content: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        (*self).seek_write(path, offset, content)
    }
}

impl<T: StorageFs + ?Sized> StorageFs for std::sync::Arc<T> {
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool> {
        (**self).exists(path)
    }

    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        (**self).create_dir_all(path)
    }

    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        (**self).read_file(path)
    }

    fn write_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        (**self).write_file(path, content)
    }

    fn append_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        (**self).append_file(path, content)
    }

    fn delete_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        (**self).delete_file(path)
    }

    fn list_files<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Vec<PathBuf>>> {
        (**self).list_files(dir)
    }

    fn stat<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<FileStat>> {
        (**self).stat(path)
    }

    fn seek_write<'a>(
        &'a self,
        path: &'a Path,
        offset: u64,
        content: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        (**self).seek_write(path, offset, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seek_write_default_falls_back_to_rewrite() {
        // MemoryFs does not override seek_write, so this exercises the
        // read-modify-write default.
        let fs = MemoryFs::new();
        let path = Path::new("f.bin");
        fs.write_file(path, &[0u8; 8]).await.unwrap();
        fs.seek_write(path, 5, &[0x01]).await.unwrap();

        let bytes = fs.read_file(path).await.unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[tokio::test]
    async fn seek_write_past_end_fails() {
        let fs = MemoryFs::new();
        let path = Path::new("f.bin");
        fs.write_file(path, &[0u8; 4]).await.unwrap();
        let err = fs.seek_write(path, 4, &[1]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
