//! Storage abstraction.
//!
//! Named, byte-addressable files grouped in directories. Feeds, the
//! metadata catalog and the keyring all persist through these traits so the
//! same code runs against the filesystem or purely in memory.
//!
//! # Implementations
//!
//! - [`MemoryDirectory`]: process-local map of byte buffers. Clones share
//!   contents, which lets tests drop and reopen components over the same data.
//! - [`FsDirectory`]: plain files below a root path, accessed with `tokio::fs`.

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

/// File metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes
    pub size: u64,
}

/// A named byte-addressable file.
#[async_trait]
pub trait File: Send + Sync + Debug {
    /// File name within its directory.
    fn name(&self) -> &str;

    /// Read exactly `len` bytes starting at `offset`.
    async fn read(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Write `data` at `offset`, extending the file if needed.
    async fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Shrink or extend the file to exactly `size` bytes.
    async fn truncate(&self, size: u64) -> StorageResult<()>;

    /// Current file metadata.
    async fn stat(&self) -> StorageResult<FileStat>;

    /// Remove the file. Deleting a missing file is not an error.
    async fn delete(&self) -> StorageResult<()>;

    /// Read the whole file.
    async fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.stat().await?.size;
        self.read(0, size as usize).await
    }
}

/// A directory of files and sub-directories.
#[async_trait]
pub trait Directory: Send + Sync + Debug {
    /// Slash-separated path of this directory relative to the storage root.
    fn path(&self) -> &str;

    /// Open `name`, creating an empty file if absent.
    async fn file(&self, name: &str) -> StorageResult<Arc<dyn File>>;

    /// Nested directory handle. Nothing is created until a file is opened.
    fn sub_directory(&self, name: &str) -> Arc<dyn Directory>;

    /// Names of files directly in this directory.
    async fn list(&self) -> StorageResult<Vec<String>>;

    /// Remove this directory and everything below it.
    async fn delete(&self) -> StorageResult<()>;
}

/// Build the storage root described by `config`.
pub fn create_storage(config: &StorageConfig) -> Arc<dyn Directory> {
    if config.persistent {
        Arc::new(FsDirectory::new(config.data_root.clone()))
    } else {
        Arc::new(MemoryDirectory::new())
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

type MemoryFiles = Arc<Mutex<BTreeMap<String, Arc<RwLock<Vec<u8>>>>>>;

/// In-memory storage root.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    files: MemoryFiles,
    path: String,
}

impl MemoryDirectory {
    /// Fresh, empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    fn path(&self) -> &str {
        &self.path
    }

    async fn file(&self, name: &str) -> StorageResult<Arc<dyn File>> {
        let full = join(&self.path, name);
        let data = self
            .files
            .lock()
            .await
            .entry(full.clone())
            .or_default()
            .clone();
        Ok(Arc::new(MemoryFile {
            name: name.to_string(),
            full,
            data,
            files: self.files.clone(),
        }))
    }

    fn sub_directory(&self, name: &str) -> Arc<dyn Directory> {
        Arc::new(MemoryDirectory {
            files: self.files.clone(),
            path: join(&self.path, name),
        })
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        let prefix = if self.path.is_empty() {
            String::new()
        } else {
            format!("{}/", self.path)
        };
        let files = self.files.lock().await;
        Ok(files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn delete(&self) -> StorageResult<()> {
        let prefix = format!("{}/", self.path);
        let mut files = self.files.lock().await;
        if self.path.is_empty() {
            files.clear();
        } else {
            files.retain(|k, _| !k.starts_with(&prefix));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryFile {
    name: String,
    full: String,
    data: Arc<RwLock<Vec<u8>>>,
    files: MemoryFiles,
}

#[async_trait]
impl File for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read().await;
        let size = data.len() as u64;
        let start = offset as usize;
        if offset + len as u64 > size {
            return Err(StorageError::OutOfBounds { offset, len, size });
        }
        Ok(data[start..start + len].to_vec())
    }

    async fn write(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write().await;
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    async fn truncate(&self, size: u64) -> StorageResult<()> {
        self.data.write().await.resize(size as usize, 0);
        Ok(())
    }

    async fn stat(&self) -> StorageResult<FileStat> {
        Ok(FileStat {
            size: self.data.read().await.len() as u64,
        })
    }

    async fn delete(&self) -> StorageResult<()> {
        self.files.lock().await.remove(&self.full);
        self.data.write().await.clear();
        Ok(())
    }
}

/// Filesystem storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
    path: String,
}

impl FsDirectory {
    /// Storage below `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path: String::new(),
        }
    }

    fn dir(&self) -> PathBuf {
        self.root.join(&self.path)
    }
}

#[async_trait]
impl Directory for FsDirectory {
    fn path(&self) -> &str {
        &self.path
    }

    async fn file(&self, name: &str) -> StorageResult<Arc<dyn File>> {
        let dir = self.dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Arc::new(FsFile {
            name: name.to_string(),
            path,
        }))
    }

    fn sub_directory(&self, name: &str) -> Arc<dyn Directory> {
        Arc::new(FsDirectory {
            root: self.root.clone(),
            path: join(&self.path, name),
        })
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self) -> StorageResult<()> {
        match tokio::fs::remove_dir_all(self.dir()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
struct FsFile {
    name: String,
    path: PathBuf,
}

impl FsFile {
    async fn open(&self) -> StorageResult<tokio::fs::File> {
        tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    StorageError::NotFound(self.path.display().to_string())
                }
                _ => e.into(),
            })
    }
}

#[async_trait]
impl File for FsFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut file = self.open().await?;
        let size = file.metadata().await?.len();
        if offset + len as u64 > size {
            return Err(StorageError::OutOfBounds { offset, len, size });
        }
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut file = self.open().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn truncate(&self, size: u64) -> StorageResult<()> {
        let file = self.open().await?;
        file.set_len(size).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn stat(&self) -> StorageResult<FileStat> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(FileStat { size: meta.len() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(self.path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self) -> StorageResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
