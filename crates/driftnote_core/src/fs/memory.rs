//! In-memory filesystem for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{BoxFuture, FileStat, StorageFs};

struct FileEntry {
    bytes: Vec<u8>,
    mtime_ms: i64,
    ctime_ms: i64,
}

#[derive(Default)]
struct Tree {
    files: BTreeMap<PathBuf, FileEntry>,
    dirs: BTreeSet<PathBuf>,
}

/// In-memory [`StorageFs`] implementation.
///
/// Operations complete immediately; paths are compared verbatim, so tests
/// should build them consistently (the engine always goes through
/// `Path::join`).
#[derive(Default)]
pub struct MemoryFs {
    tree: Mutex<Tree>,
}

impl MemoryFs {
    /// Create an empty in-memory filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored file path, for assertions.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let tree = self.tree.lock().unwrap();
        tree.files.keys().cloned().collect()
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

impl StorageFs for MemoryFs {
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let tree = self.tree.lock().unwrap();
            tree.files.contains_key(path) || tree.dirs.contains(path)
        })
    }

    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut tree = self.tree.lock().unwrap();
            let mut current = PathBuf::new();
            for component in path.components() {
                current.push(component);
                tree.dirs.insert(current.clone());
            }
            Ok(())
        })
    }

    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let tree = self.tree.lock().unwrap();
            tree.files
                .get(path)
                .map(|f| f.bytes.clone())
                .ok_or_else(|| not_found(path))
        })
    }

    fn write_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = Self::now_ms();
            let mut tree = self.tree.lock().unwrap();
            let ctime = tree.files.get(path).map(|f| f.ctime_ms).unwrap_or(now);
            tree.files.insert(
                path.to_path_buf(),
                FileEntry {
                    bytes: content.to_vec(),
                    mtime_ms: now,
                    ctime_ms: ctime,
                },
            );
            Ok(())
        })
    }

    fn append_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = Self::now_ms();
            let mut tree = self.tree.lock().unwrap();
            match tree.files.get_mut(path) {
                Some(entry) => {
                    entry.bytes.extend_from_slice(content);
                    entry.mtime_ms = now;
                }
                None => {
                    tree.files.insert(
                        path.to_path_buf(),
                        FileEntry {
                            bytes: content.to_vec(),
                            mtime_ms: now,
                            ctime_ms: now,
                        },
                    );
                }
            }
            Ok(())
        })
    }

    fn delete_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut tree = self.tree.lock().unwrap();
            tree.files
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| not_found(path))
        })
    }

    fn list_files<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Vec<PathBuf>>> {
        Box::pin(async move {
            let tree = self.tree.lock().unwrap();
            Ok(tree
                .files
                .keys()
                .filter(|p| p.parent() == Some(dir))
                .cloned()
                .collect())
        })
    }

    fn stat<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<FileStat>> {
        Box::pin(async move {
            let tree = self.tree.lock().unwrap();
            tree.files
                .get(path)
                .map(|f| FileStat {
                    size: f.bytes.len() as u64,
                    mtime_ms: f.mtime_ms,
                    ctime_ms: f.ctime_ms,
                })
                .ok_or_else(|| not_found(path))
        })
    }
}

fn not_found(path: &Path) -> Error {
    Error::new(
        ErrorKind::NotFound,
        format!("ENOENT: {} does not exist", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_delete() {
        let fs = MemoryFs::new();
        let path = Path::new("notes/a.bin");

        fs.write_file(path, b"data").await.unwrap();
        assert_eq!(fs.read_file(path).await.unwrap(), b"data");

        fs.delete_file(path).await.unwrap();
        assert!(fs.read_file(path).await.is_err());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let fs = MemoryFs::new();
        let err = fs.read_file(Path::new("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_files_is_direct_children_only() {
        let fs = MemoryFs::new();
        fs.write_file(Path::new("d/a.log"), b"1").await.unwrap();
        fs.write_file(Path::new("d/b.log"), b"2").await.unwrap();
        fs.write_file(Path::new("d/sub/c.log"), b"3").await.unwrap();

        let files = fs.list_files(Path::new("d")).await.unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn create_dir_all_registers_parents() {
        let fs = MemoryFs::new();
        fs.create_dir_all(Path::new("a/b/c")).await.unwrap();
        assert!(fs.exists(Path::new("a")).await);
        assert!(fs.exists(Path::new("a/b")).await);
        assert!(fs.exists(Path::new("a/b/c")).await);
    }

    #[tokio::test]
    async fn append_then_stat() {
        let fs = MemoryFs::new();
        let path = Path::new("x.log");
        fs.append_file(path, b"ab").await.unwrap();
        fs.append_file(path, b"c").await.unwrap();
        assert_eq!(fs.stat(path).await.unwrap().size, 3);
    }
}
