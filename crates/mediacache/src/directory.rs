//! Directory capabilities and the files minted from them.
//!
//! A [`DirectoryHandle`] is what the user grants; [`FileHandle`]s are named
//! entries inside it and [`WritableFile`]s are positional write streams on a
//! file. Two backends exist: [`LocalDirectory`] on the real filesystem and
//! [`MemoryDirectory`] that keeps everything in process memory.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

use crate::error::{CaptureError, Result};

/// Positional write stream on one file.
#[async_trait]
pub trait WritableFile: Send {
    async fn write_at(&mut self, position: u64, data: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;
}

/// A named file inside a granted directory.
#[async_trait]
pub trait FileHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn create_writable(&self, keep_existing_data: bool) -> io::Result<Box<dyn WritableFile>>;
}

/// A user-granted directory capability.
#[async_trait]
pub trait DirectoryHandle: Send + Sync {
    /// Stable description of where this directory lives.
    fn location(&self) -> String;

    /// Open (and with `create`, create) the file `name`.
    ///
    /// Concurrent creation of distinct files is not guaranteed to be atomic;
    /// callers go through [`crate::DirectoryGrant`] which serializes it.
    async fn get_file_handle(&self, name: &str, create: bool) -> io::Result<Arc<dyn FileHandle>>;
}

/// Prompts for, or resolves, a directory capability.
#[async_trait]
pub trait DirectoryPicker: Send + Sync {
    /// Ask the user for a directory. `picker_id` lets the prompt reopen where
    /// it was last left.
    async fn pick(&self, picker_id: &str) -> Result<Arc<dyn DirectoryHandle>>;

    /// Resolve a capability obtained earlier, identified by its location.
    async fn open(&self, location: &str) -> Result<Arc<dyn DirectoryHandle>>;
}

fn validate_file_name(name: &str) -> io::Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid file name `{name}`"),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

/// Directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirectory {
    root: PathBuf,
}

impl LocalDirectory {
    /// Open an existing directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let metadata = tokio::fs::metadata(&root).await.map_err(|e| {
            CaptureError::access_denied(format!("{}: {e}", root.display()))
        })?;
        if !metadata.is_dir() {
            return Err(CaptureError::access_denied(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Open a directory, creating it (and its parents) when missing.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Self::open(root).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl DirectoryHandle for LocalDirectory {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn get_file_handle(&self, name: &str, create: bool) -> io::Result<Arc<dyn FileHandle>> {
        validate_file_name(name)?;
        let path = self.root.join(name);
        if create {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;
        } else if !tokio::fs::try_exists(&path).await? {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            ));
        }
        debug!(path = %path.display(), "Opened file handle");
        Ok(Arc::new(LocalFileHandle {
            name: name.to_owned(),
            path,
        }))
    }
}

struct LocalFileHandle {
    name: String,
    path: PathBuf,
}

#[async_trait]
impl FileHandle for LocalFileHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_writable(&self, keep_existing_data: bool) -> io::Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .write(true)
            .truncate(!keep_existing_data)
            .open(&self.path)
            .await?;
        Ok(Box::new(LocalWritable { file: Some(file) }))
    }
}

struct LocalWritable {
    file: Option<File>,
}

#[async_trait]
impl WritableFile for LocalWritable {
    async fn write_at(&mut self, position: u64, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writable closed"))?;
        file.seek(SeekFrom::Start(position)).await?;
        file.write_all(data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// Picker backed by the local filesystem.
///
/// `pick` answers with a preconfigured directory; without one it behaves
/// like a user dismissing the prompt.
#[derive(Debug, Clone, Default)]
pub struct LocalPicker {
    default_dir: Option<PathBuf>,
}

impl LocalPicker {
    pub fn new(default_dir: Option<PathBuf>) -> Self {
        Self { default_dir }
    }
}

#[async_trait]
impl DirectoryPicker for LocalPicker {
    async fn pick(&self, picker_id: &str) -> Result<Arc<dyn DirectoryHandle>> {
        let Some(dir) = &self.default_dir else {
            return Err(CaptureError::access_denied(format!(
                "no directory chosen for picker `{picker_id}`"
            )));
        };
        Ok(Arc::new(LocalDirectory::create(dir.clone()).await?))
    }

    async fn open(&self, location: &str) -> Result<Arc<dyn DirectoryHandle>> {
        Ok(Arc::new(LocalDirectory::open(location).await?))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

type MemoryFile = Arc<Mutex<Vec<u8>>>;

/// Directory kept entirely in memory. Clones share the same files.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    name: String,
    files: Arc<Mutex<HashMap<String, MemoryFile>>>,
    read_only: bool,
}

impl MemoryDirectory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A directory that refuses to create files.
    pub fn read_only(name: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::new(name)
        }
    }

    /// Current bytes of `name`.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|file| file.lock().clone())
    }

    /// Sorted names of every file in the directory.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl DirectoryHandle for MemoryDirectory {
    fn location(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn get_file_handle(&self, name: &str, create: bool) -> io::Result<Arc<dyn FileHandle>> {
        validate_file_name(name)?;
        let mut files = self.files.lock();
        let file = match files.get(name) {
            Some(file) => Arc::clone(file),
            None if !create => {
                return Err(io::Error::new(io::ErrorKind::NotFound, name.to_owned()));
            }
            None if self.read_only => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} is read-only", self.location()),
                ));
            }
            None => {
                let file = MemoryFile::default();
                files.insert(name.to_owned(), Arc::clone(&file));
                file
            }
        };
        Ok(Arc::new(MemoryFileHandle {
            name: name.to_owned(),
            file,
        }))
    }
}

struct MemoryFileHandle {
    name: String,
    file: MemoryFile,
}

#[async_trait]
impl FileHandle for MemoryFileHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_writable(&self, keep_existing_data: bool) -> io::Result<Box<dyn WritableFile>> {
        if !keep_existing_data {
            self.file.lock().clear();
        }
        Ok(Box::new(MemoryWritable {
            file: Some(Arc::clone(&self.file)),
        }))
    }
}

struct MemoryWritable {
    file: Option<MemoryFile>,
}

#[async_trait]
impl WritableFile for MemoryWritable {
    async fn write_at(&mut self, position: u64, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writable closed"))?;
        let start = usize::try_from(position)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let mut bytes = file.lock();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}

/// Picker that always answers with the same directory, or refuses when it
/// has none.
#[derive(Clone, Default)]
pub struct FixedPicker {
    directory: Option<Arc<dyn DirectoryHandle>>,
}

impl FixedPicker {
    pub fn new(directory: Option<Arc<dyn DirectoryHandle>>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl DirectoryPicker for FixedPicker {
    async fn pick(&self, picker_id: &str) -> Result<Arc<dyn DirectoryHandle>> {
        self.directory.clone().ok_or_else(|| {
            CaptureError::access_denied(format!("picker `{picker_id}` was dismissed"))
        })
    }

    async fn open(&self, location: &str) -> Result<Arc<dyn DirectoryHandle>> {
        match &self.directory {
            Some(dir) if dir.location() == location => Ok(Arc::clone(dir)),
            _ => Err(CaptureError::access_denied(format!(
                "unknown directory `{location}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("clip [id].mp4").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("a/b").is_err());
        assert!(validate_file_name("a\\b").is_err());
    }

    #[tokio::test]
    async fn test_memory_positional_writes() {
        let dir = MemoryDirectory::new("t");
        let handle = dir.get_file_handle("f", true).await.unwrap();
        let mut writable = handle.create_writable(false).await.unwrap();
        writable.write_at(0, b"hello").await.unwrap();
        writable.write_at(5, b" world").await.unwrap();
        writable.write_at(0, b"J").await.unwrap();
        writable.close().await.unwrap();
        assert!(writable.write_at(0, b"x").await.is_err());

        assert_eq!(dir.contents("f").unwrap(), b"Jello world");
        assert_eq!(dir.file_names(), vec!["f".to_owned()]);
    }

    #[tokio::test]
    async fn test_memory_write_past_addressable_end() {
        let dir = MemoryDirectory::new("t");
        let handle = dir.get_file_handle("f", true).await.unwrap();
        let mut writable = handle.create_writable(false).await.unwrap();
        let err = writable
            .write_at(usize::MAX as u64, b"xy")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(dir.contents("f").unwrap(), b"");
    }

    #[tokio::test]
    async fn test_memory_read_only_refuses_creation() {
        let dir = MemoryDirectory::read_only("ro");
        let err = dir.get_file_handle("f", true).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_memory_missing_without_create() {
        let dir = MemoryDirectory::new("t");
        assert!(dir.get_file_handle("f", false).await.is_err());
    }

    #[tokio::test]
    async fn test_local_directory_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let dir = LocalDirectory::open(temp.path()).await.unwrap();
        let handle = dir.get_file_handle("out.bin", true).await.unwrap();
        let mut writable = handle.create_writable(true).await.unwrap();
        writable.write_at(0, b"abc").await.unwrap();
        writable.write_at(3, b"def").await.unwrap();
        writable.close().await.unwrap();

        let bytes = tokio::fs::read(temp.path().join("out.bin")).await.unwrap();
        assert_eq!(bytes, b"abcdef");
    }

    #[tokio::test]
    async fn test_local_open_rejects_missing_dir() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("nope");
        let err = LocalDirectory::open(&missing).await.unwrap_err();
        assert!(matches!(err, CaptureError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn test_fixed_picker() {
        let dir: Arc<dyn DirectoryHandle> = Arc::new(MemoryDirectory::new("m"));
        let picker = FixedPicker::new(Some(Arc::clone(&dir)));
        assert_eq!(picker.pick("id").await.unwrap().location(), "memory://m");
        assert!(picker.open("memory://m").await.is_ok());
        assert!(picker.open("memory://other").await.is_err());

        let dismissed = FixedPicker::new(None);
        assert!(dismissed.pick("id").await.is_err());
    }
}
