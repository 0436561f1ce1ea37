//! Read-only zip-archive backend.
//!
//! The archive's central directory is parsed once into an [`EntryIndex`];
//! nodes and handles share it immutably. Stored entries are served as
//! zero-copy slices of the backing bytes; deflated entries are inflated in
//! full on first access and then served as fixed-size read-only streams.

mod index;

pub use index::{EntryIndex, ZipEntry};

use std::io::Read;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use index::{METHOD_DEFLATED, METHOD_STORED};

use crate::{
    DirEntry, FileOpener, FileType, FsError, Metadata, OpenOptions, OpenOptionsConfig, ReadDir,
    Result, VirtualFile,
};

/// A filesystem view over one zip archive held in memory.
#[derive(Debug, Clone)]
pub struct FileSystem {
    data: Bytes,
    index: Arc<EntryIndex>,
    verify_crc: bool,
    closed: Arc<AtomicBool>,
}

impl FileSystem {
    /// Parse the archive's central directory and build the entry index.
    /// A missing or truncated directory record fails with
    /// [`FsError::CorruptArchive`].
    pub fn new(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let index = EntryIndex::parse(&data)?;
        tracing::debug!(entries = index.len(), "built zip entry index");
        Ok(Self {
            data,
            index: Arc::new(index),
            verify_crc: false,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Read the whole of `file` and open it as an archive.
    pub async fn from_file(file: &dyn VirtualFile) -> Result<Self> {
        let bytes = file.read_to_end().await?;
        Self::new(bytes)
    }

    /// Verify entry checksums when deflated entries are first materialized.
    /// A mismatch is a data-integrity error, not silently ignored.
    pub fn verify_crc(mut self, verify: bool) -> Self {
        self.verify_crc = verify;
        self
    }

    pub fn index(&self) -> &EntryIndex {
        &self.index
    }

    /// Close the archive. All further operations on this filesystem fail;
    /// entry handles already open keep serving their data.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn guard_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FsError::HandleClosed)
        } else {
            Ok(())
        }
    }

    /// Lexically resolve `path` to a normalized slash-separated entry key
    /// (`""` is the archive root).
    fn entry_key(path: &Path) -> Result<String> {
        let mut segments: Vec<&str> = Vec::new();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    segments.pop();
                }
                Component::Normal(segment) => {
                    segments.push(segment.to_str().ok_or(FsError::InvalidInput)?);
                }
                Component::Prefix(_) => return Err(FsError::InvalidInput),
            }
        }
        Ok(segments.join("/"))
    }

    fn entry_metadata(&self, entry: &ZipEntry) -> Metadata {
        Metadata {
            ft: if entry.is_dir {
                FileType::new_dir()
            } else {
                FileType::new_file()
            },
            accessed: entry.timestamp,
            created: entry.timestamp,
            modified: entry.timestamp,
            len: if entry.is_dir {
                0
            } else {
                entry.uncompressed_size
            },
            device: -1,
            inode: entry.inode,
            mode: 0o777,
            uid: 0,
            gid: 0,
            extra: None,
        }
    }

    fn root_metadata(&self) -> Metadata {
        Metadata {
            ft: FileType::new_dir(),
            device: -1,
            mode: 0o777,
            ..Default::default()
        }
    }
}

#[async_trait]
impl crate::FileSystem for FileSystem {
    async fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        self.guard_open()?;
        let key = Self::entry_key(path)?;

        if !key.is_empty() {
            match self.index.get(&key) {
                Some(entry) if entry.is_dir => {}
                Some(_) => return Err(FsError::BaseNotDirectory),
                None => return Err(FsError::EntryNotFound),
            }
        }

        let data = self
            .index
            .children(&key)
            .into_iter()
            .map(|entry| DirEntry {
                path: Path::new("/").join(&entry.name),
                metadata: Ok(self.entry_metadata(entry)),
            })
            .collect();

        Ok(ReadDir::new(data))
    }

    async fn create_dir(&self, _path: &Path) -> Result<()> {
        self.guard_open()?;
        Err(FsError::ReadOnly)
    }

    async fn remove_dir(&self, _path: &Path) -> Result<()> {
        self.guard_open()?;
        Err(FsError::ReadOnly)
    }

    async fn remove_file(&self, _path: &Path) -> Result<()> {
        self.guard_open()?;
        Err(FsError::ReadOnly)
    }

    async fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        self.guard_open()?;
        Err(FsError::ReadOnly)
    }

    async fn metadata(&self, path: &Path) -> Result<Metadata> {
        self.guard_open()?;
        let key = Self::entry_key(path)?;

        if key.is_empty() {
            return Ok(self.root_metadata());
        }
        self.index
            .get(&key)
            .map(|entry| self.entry_metadata(entry))
            .ok_or(FsError::EntryNotFound)
    }

    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }
}

#[async_trait]
impl FileOpener for FileSystem {
    async fn open(
        &self,
        path: &Path,
        conf: &OpenOptionsConfig,
    ) -> Result<Box<dyn VirtualFile + Send + Sync + 'static>> {
        self.guard_open()?;
        if conf.would_write() {
            return Err(FsError::ReadOnly);
        }

        let key = Self::entry_key(path)?;
        let entry = self.index.get(&key).ok_or(FsError::EntryNotFound)?;
        if entry.is_dir {
            return Err(FsError::NotAFile);
        }

        let (start, end) = self.index.data_range(&self.data, entry)?;
        let raw = self.data.slice(start..end);

        let contents = match entry.method {
            METHOD_STORED => Contents::Stored(raw),
            METHOD_DEFLATED => Contents::Deflated {
                raw,
                inflated: Mutex::new(None),
            },
            method => {
                tracing::debug!(entry = %entry.name, method, "unsupported compression method");
                return Err(FsError::Unsupported);
            }
        };

        Ok(Box::new(ZipFile {
            name: entry.name.clone(),
            len: entry.uncompressed_size,
            crc32: entry.crc32,
            timestamp: entry.timestamp,
            verify_crc: self.verify_crc,
            contents,
            open: AtomicBool::new(true),
        }))
    }
}

#[derive(Debug)]
enum Contents {
    /// Byte range straight over the backing archive bytes.
    Stored(Bytes),
    /// Inflated in full on first access, then served from memory.
    Deflated {
        raw: Bytes,
        inflated: Mutex<Option<Arc<Vec<u8>>>>,
    },
}

/// A read-only handle over one archive entry.
#[derive(Debug)]
pub struct ZipFile {
    name: String,
    len: u64,
    crc32: u32,
    timestamp: u64,
    verify_crc: bool,
    contents: Contents,
    open: AtomicBool,
}

impl ZipFile {
    fn guard_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(FsError::HandleClosed)
        }
    }

    fn check_crc(&self, data: &[u8]) -> Result<()> {
        if !self.verify_crc {
            return Ok(());
        }
        let mut crc = flate2::Crc::new();
        crc.update(data);
        if crc.sum() != self.crc32 {
            tracing::debug!(entry = %self.name, "crc mismatch");
            return Err(FsError::IntegrityFailure);
        }
        Ok(())
    }

    /// The decompressed entry bytes. Stored entries alias the archive
    /// buffer; deflated entries inflate once and cache the result.
    fn materialize(&self) -> Result<EntryBytes> {
        match &self.contents {
            Contents::Stored(bytes) => {
                self.check_crc(bytes)?;
                Ok(EntryBytes::Slice(bytes.clone()))
            }
            Contents::Deflated { raw, inflated } => {
                let mut slot = inflated.lock().map_err(|_| FsError::Lock)?;
                if let Some(cached) = slot.as_ref() {
                    return Ok(EntryBytes::Owned(cached.clone()));
                }

                let mut decoder = flate2::read::DeflateDecoder::new(raw.as_ref());
                let mut buffer = Vec::with_capacity(self.len as usize);
                decoder
                    .read_to_end(&mut buffer)
                    .map_err(|_| FsError::CorruptArchive)?;
                self.check_crc(&buffer)?;

                let buffer = Arc::new(buffer);
                *slot = Some(buffer.clone());
                Ok(EntryBytes::Owned(buffer))
            }
        }
    }
}

enum EntryBytes {
    Slice(Bytes),
    Owned(Arc<Vec<u8>>),
}

impl AsRef<[u8]> for EntryBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Slice(bytes) => bytes.as_ref(),
            Self::Owned(bytes) => bytes.as_slice(),
        }
    }
}

#[async_trait]
impl VirtualFile for ZipFile {
    fn last_accessed(&self) -> u64 {
        self.timestamp
    }

    fn last_modified(&self) -> u64 {
        self.timestamp
    }

    fn created_time(&self) -> u64 {
        self.timestamp
    }

    async fn size(&self) -> Result<u64> {
        self.guard_open()?;
        Ok(self.len)
    }

    async fn set_len(&self, _new_size: u64) -> Result<()> {
        self.guard_open()?;
        Err(FsError::ReadOnly)
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.guard_open()?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let bytes = self.materialize()?;
        let data = bytes.as_ref();
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<usize> {
        self.guard_open()?;
        Err(FsError::ReadOnly)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}
