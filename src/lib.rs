//! Uniform asynchronous virtual file system.
//!
//! One polymorphic [`FileSystem`] / [`VirtualFile`] contract served by
//! several backends: the host disk ([`host_fs`]), memory ([`mem_fs`]) and
//! read-only zip archives ([`zip_fs`]), composable through jailing
//! ([`scoped_fs`]) and mounting ([`mount_fs`]).
//!
//! All caller-visible operations are `async`; backends that touch the disk
//! hand the blocking call to the runtime's worker pool (see [`blocking`])
//! instead of blocking the scheduler thread.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub mod blocking;
pub mod host_fs;
pub mod mem_fs;
pub mod mount_fs;
pub mod scoped_fs;
pub mod zip_fs;

pub use mount_fs::MountFileSystem;
pub use scoped_fs::ScopedFileSystem;

pub type Result<T> = std::result::Result<T, FsError>;

/// Error type for external users
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum FsError {
    /// The path given as a base was not a directory so the operation was not possible
    #[error("base is not a directory")]
    BaseNotDirectory,
    /// Expected a file but found not a file
    #[error("not a file")]
    NotAFile,
    /// File or directory exists
    #[error("file exists")]
    AlreadyExists,
    /// The requested file or directory could not be found
    #[error("entity not found")]
    EntryNotFound,
    /// Caller was not allowed to perform this operation
    #[error("permission denied")]
    PermissionDenied,
    /// The provided data or path is invalid
    #[error("invalid input")]
    InvalidInput,
    /// Operation on a handle (or archive) that has been closed
    #[error("handle closed")]
    HandleClosed,
    /// Capability not implemented by this backend
    #[error("unsupported operation")]
    Unsupported,
    /// Write-shaped operation on a read-only backend
    #[error("filesystem is read-only")]
    ReadOnly,
    /// The directory is not empty
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    /// The archive's directory record is unreadable
    #[error("not a valid archive")]
    CorruptArchive,
    /// Entry data does not match its recorded checksum
    #[error("integrity check failed")]
    IntegrityFailure,
    /// A lock on shared state was poisoned
    #[error("lock poisoned")]
    Lock,
    /// Something else failed when doing IO, carrying the native context.
    #[error("i/o error during {op}: {message} (errno {errno})")]
    Io {
        errno: i32,
        message: String,
        op: &'static str,
    },
}

impl FsError {
    /// Translate a native error at the syscall site, keeping errno, message
    /// and the attempted operation. Raw platform codes never cross the VFS
    /// boundary undecoded.
    pub fn from_io(op: &'static str, err: io::Error) -> Self {
        tracing::trace!(op, errno = err.raw_os_error().unwrap_or(0), error = %err);
        match err.kind() {
            io::ErrorKind::NotFound => FsError::EntryNotFound,
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            io::ErrorKind::InvalidInput => FsError::InvalidInput,
            _ => FsError::Io {
                errno: err.raw_os_error().unwrap_or(0),
                message: err.to_string(),
                op,
            },
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::from_io("io", err)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileType {
    pub dir: bool,
    pub file: bool,
    pub symlink: bool,
    pub char_device: bool,
    pub block_device: bool,
    pub socket: bool,
    pub fifo: bool,
}

impl FileType {
    pub fn new_dir() -> Self {
        Self {
            dir: true,
            ..Default::default()
        }
    }

    pub fn new_file() -> Self {
        Self {
            file: true,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.dir
    }

    pub fn is_file(&self) -> bool {
        self.file
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink
    }
}

/// Immutable metadata snapshot, created per call.
///
/// Timestamps are nanoseconds since the UNIX epoch; `0` where the backend
/// has no better answer. `device` is `-1` for backends with no device
/// notion (archives, memory).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub ft: FileType,
    pub accessed: u64,
    pub created: u64,
    pub modified: u64,
    pub len: u64,
    pub device: i64,
    pub inode: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Backend-specific payload, if any.
    pub extra: Option<String>,
}

impl Metadata {
    pub fn is_file(&self) -> bool {
        self.ft.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.ft.is_dir()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The result of a `stat`: unlike [`FileSystem::metadata`], a missing path
/// is a normal result (`exists == false`), not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub path: PathBuf,
    pub exists: bool,
    pub metadata: Metadata,
}

impl Stat {
    pub fn found(path: impl Into<PathBuf>, metadata: Metadata) -> Self {
        Self {
            path: path.into(),
            exists: true,
            metadata,
        }
    }

    /// Sentinel for a path that does not exist: zero size, zero timestamps.
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            exists: false,
            metadata: Metadata {
                device: -1,
                ..Default::default()
            },
        }
    }

    pub fn is_directory(&self) -> bool {
        self.exists && self.metadata.is_dir()
    }

    pub fn size(&self) -> u64 {
        self.metadata.len
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path: PathBuf,
    pub metadata: Result<Metadata>,
}

impl DirEntry {
    pub fn path(&self) -> PathBuf {
        self.path.clone()
    }

    pub fn file_name(&self) -> OsString {
        self.path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default()
    }

    pub fn metadata(&self) -> Result<Metadata> {
        self.metadata.clone()
    }

    pub fn file_type(&self) -> Result<FileType> {
        Ok(self.metadata()?.ft)
    }
}

/// A finite, eagerly collected directory listing. The native directory
/// handle is released before the listing is handed out, so early consumer
/// exit cannot leak it.
#[derive(Debug, Clone, Default)]
pub struct ReadDir {
    pub data: Vec<DirEntry>,
    index: usize,
}

impl ReadDir {
    pub fn new(data: Vec<DirEntry>) -> Self {
        Self { data, index: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl Iterator for ReadDir {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.data.get(self.index)?.clone();
        self.index += 1;
        Some(Ok(entry))
    }
}

/// Inert subscription returned by [`FileSystem::watch`]. Change
/// notification is an external collaborator; cancelling is a no-op.
#[derive(Debug)]
pub struct WatchGuard {
    _priv: (),
}

impl WatchGuard {
    pub(crate) fn inert() -> Self {
        Self { _priv: () }
    }

    pub fn cancel(self) {}
}

#[derive(Debug, Clone)]
pub struct OpenOptionsConfig {
    read: bool,
    write: bool,
    create_new: bool,
    create: bool,
    append: bool,
    truncate: bool,
}

impl OpenOptionsConfig {
    pub const fn read(&self) -> bool {
        self.read
    }

    pub const fn write(&self) -> bool {
        self.write
    }

    pub const fn create_new(&self) -> bool {
        self.create_new
    }

    pub const fn create(&self) -> bool {
        self.create
    }

    pub const fn append(&self) -> bool {
        self.append
    }

    pub const fn truncate(&self) -> bool {
        self.truncate
    }

    /// True when the options ask for any form of mutation.
    pub const fn would_write(&self) -> bool {
        self.write || self.append || self.create || self.create_new || self.truncate
    }
}

#[async_trait]
pub trait FileOpener: fmt::Debug + Send + Sync {
    async fn open(
        &self,
        path: &Path,
        conf: &OpenOptionsConfig,
    ) -> Result<Box<dyn VirtualFile + Send + Sync + 'static>>;
}

pub struct OpenOptions<'a> {
    opener: &'a (dyn FileOpener + Send + Sync),
    conf: OpenOptionsConfig,
}

impl<'a> OpenOptions<'a> {
    pub fn new(opener: &'a (dyn FileOpener + Send + Sync)) -> Self {
        Self {
            opener,
            conf: OpenOptionsConfig {
                read: false,
                write: false,
                create_new: false,
                create: false,
                append: false,
                truncate: false,
            },
        }
    }

    /// Replace the whole configuration, keeping the opener.
    pub fn options(mut self, conf: OpenOptionsConfig) -> Self {
        self.conf = conf;
        self
    }

    pub fn read(mut self, read: bool) -> Self {
        self.conf.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.conf.write = write;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.conf.append = append;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.conf.truncate = truncate;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.conf.create = create;
        self
    }

    pub fn create_new(mut self, create_new: bool) -> Self {
        self.conf.create_new = create_new;
        self
    }

    pub async fn open<P: AsRef<Path> + Send>(
        &self,
        path: P,
    ) -> Result<Box<dyn VirtualFile + Send + Sync + 'static>> {
        self.opener.open(path.as_ref(), &self.conf).await
    }
}

/// The polymorphic file handle.
///
/// Every operation is positioned (pread/pwrite semantics): the handle keeps
/// no caller-visible cursor. Operations issued concurrently against one
/// handle are not serialized by the crate; callers that need ordering must
/// await each call before issuing the next.
#[async_trait]
pub trait VirtualFile: fmt::Debug + Send + Sync + 'static {
    /// the last time the file was accessed in nanoseconds as a UNIX timestamp
    fn last_accessed(&self) -> u64;

    /// the last time the file was modified in nanoseconds as a UNIX timestamp
    fn last_modified(&self) -> u64;

    /// the time at which the file was created in nanoseconds as a UNIX timestamp
    fn created_time(&self) -> u64;

    /// the size of the file in bytes
    async fn size(&self) -> Result<u64>;

    /// Change the size of the file, if the `new_size` is greater than the
    /// current size the extra bytes will be allocated and zeroed
    async fn set_len(&self, new_size: u64) -> Result<()>;

    /// Read up to `len` bytes at `offset`. A `len` of zero returns an empty
    /// buffer without dispatching; a short buffer means end of file. The
    /// result buffer is allocated on the worker side and ownership handed
    /// back to the caller.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written.
    /// The buffer is copied before crossing the worker boundary, so the
    /// caller may reuse it immediately.
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Close the handle. Idempotent: closing an already-closed handle is a
    /// no-op, never a second native close. Every other operation after
    /// `close` fails with [`FsError::HandleClosed`].
    async fn close(&self) -> Result<()>;

    /// Read the whole file from offset zero.
    async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_at(out.len() as u64, 64 * 1024).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }
}

/// The capability set every backend (and composition wrapper) implements.
///
/// Unsupported capabilities report [`FsError::Unsupported`] rather than
/// silently succeeding, except for the documented `exec`/`watch` stubs.
#[async_trait]
pub trait FileSystem: fmt::Debug + Send + Sync + 'static {
    async fn read_dir(&self, path: &Path) -> Result<ReadDir>;
    async fn create_dir(&self, path: &Path) -> Result<()>;
    async fn remove_dir(&self, path: &Path) -> Result<()>;
    async fn remove_file(&self, path: &Path) -> Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Metadata for `path`, failing with [`FsError::EntryNotFound`] when
    /// absent. Most callers want [`FileSystem::stat`] instead.
    async fn metadata(&self, path: &Path) -> Result<Metadata>;

    fn new_open_options(&self) -> OpenOptions<'_>;

    /// Stat never fails for a missing path: absence is a normal result.
    /// Only unexpected failures during traversal (permissions, raw I/O)
    /// surface as errors.
    async fn stat(&self, path: &Path) -> Result<Stat> {
        match self.metadata(path).await {
            Ok(metadata) => Ok(Stat::found(path, metadata)),
            Err(FsError::EntryNotFound)
            | Err(FsError::BaseNotDirectory)
            | Err(FsError::NotAFile)
            | Err(FsError::InvalidInput) => Ok(Stat::missing(path)),
            Err(err) => Err(err),
        }
    }

    /// Process execution is an external collaborator; no backend in this
    /// crate implements it.
    async fn exec(
        &self,
        _path: &Path,
        _args: &[String],
        _env: &HashMap<String, String>,
    ) -> Result<i32> {
        Err(FsError::Unsupported)
    }

    /// Change notification is an external collaborator; the returned
    /// subscription is inert.
    fn watch(&self, _path: &Path) -> Result<WatchGuard> {
        Ok(WatchGuard::inert())
    }
}

/// First of `TMPDIR`, `TEMP`, `TMP`, falling back to `/tmp`.
pub fn tmp_dir() -> PathBuf {
    ["TMPDIR", "TEMP", "TMP"]
        .iter()
        .find_map(|key| std::env::var_os(key))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_translation_keeps_the_taxonomy() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "nope");
        assert_eq!(FsError::from_io("test", not_found), FsError::EntryNotFound);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(FsError::from_io("test", denied), FsError::PermissionDenied);

        let other = io::Error::from_raw_os_error(5);
        match FsError::from_io("test.op", other) {
            FsError::Io { errno, op, .. } => {
                assert_eq!(errno, 5);
                assert_eq!(op, "test.op");
            }
            err => panic!("expected Io, got {err:?}"),
        }
    }

    #[test]
    fn missing_stat_is_a_zeroed_sentinel() {
        let stat = Stat::missing("/does/not/exist");
        assert!(!stat.exists);
        assert_eq!(stat.size(), 0);
        assert_eq!(stat.metadata.modified, 0);
        assert!(!stat.is_directory());
    }

    #[test]
    fn tmp_dir_falls_back_to_a_fixed_default() {
        // With none of the candidates set the fallback must be absolute.
        assert!(tmp_dir().is_absolute());
    }
}
