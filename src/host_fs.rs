//! Host-disk backend. Every operation that touches the disk is a single
//! blocking call handed to the worker pool via [`blocking::dispatch`].

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::runtime::Handle;

use crate::blocking;
use crate::{
    DirEntry, FileOpener, FileType, FsError, Metadata, OpenOptions, OpenOptionsConfig, ReadDir,
    Result, VirtualFile,
};

/// A filesystem rooted at a host directory.
///
/// The runtime handle is injected explicitly; use the `new_with_*`
/// constructors from inside a runtime.
#[derive(Debug, Clone)]
pub struct FileSystem {
    handle: Handle,
    root: PathBuf,
}

impl FileSystem {
    pub fn new(handle: Handle, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = fs::canonicalize(&root).map_err(|err| FsError::from_io("host.new", err))?;
        Ok(FileSystem { handle, root })
    }

    /// Rooted at the process current working directory.
    pub fn new_with_cwd(handle: Handle) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|err| FsError::from_io("host.cwd", err))?;
        Self::new(handle, cwd)
    }

    /// Rooted at the environment-resolved temp directory.
    pub fn new_tmp(handle: Handle) -> Result<Self> {
        Self::new(handle, crate::tmp_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn prepare_path(&self, path: &Path) -> PathBuf {
        let path = normalize_path(path);

        let path = if !path.starts_with(&self.root) {
            let path = path.strip_prefix("/").unwrap_or(&path);

            self.root.join(path)
        } else {
            path.to_owned()
        };

        debug_assert!(path.starts_with(&self.root));
        path
    }
}

// Copied from cargo
// https://github.com/rust-lang/cargo/blob/fede83ccf973457de319ba6fa0e36ead454d2e20/src/cargo/util/paths.rs#L61
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        PathBuf::from(c.as_os_str())
    } else {
        PathBuf::new()
    };

    for component in components {
        match component {
            Component::Prefix(..) => unreachable!(),
            Component::RootDir => {
                ret.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                ret.pop();
            }
            Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

fn nanos_since_epoch(time: io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |time| time.as_nanos() as u64)
}

fn metadata_from_std(metadata: &fs::Metadata) -> Metadata {
    let filetype = metadata.file_type();
    let (char_device, block_device, socket, fifo) = {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            (
                filetype.is_char_device(),
                filetype.is_block_device(),
                filetype.is_socket(),
                filetype.is_fifo(),
            )
        }
        #[cfg(not(unix))]
        {
            (false, false, false, false)
        }
    };
    let (device, inode, mode, uid, gid) = {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            (
                metadata.dev() as i64,
                metadata.ino(),
                metadata.mode(),
                metadata.uid(),
                metadata.gid(),
            )
        }
        #[cfg(not(unix))]
        {
            (-1i64, 0u64, 0u32, 0u32, 0u32)
        }
    };

    Metadata {
        ft: FileType {
            dir: filetype.is_dir(),
            file: filetype.is_file(),
            symlink: filetype.is_symlink(),
            char_device,
            block_device,
            socket,
            fifo,
        },
        accessed: nanos_since_epoch(metadata.accessed()),
        created: nanos_since_epoch(metadata.created()),
        modified: nanos_since_epoch(metadata.modified()),
        len: metadata.len(),
        device,
        inode,
        mode,
        uid,
        gid,
        extra: None,
    }
}

#[async_trait]
impl crate::FileSystem for FileSystem {
    async fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let path = self.prepare_path(path);
        let root = self.root.clone();

        blocking::dispatch(&self.handle, "host.read_dir", move || {
            let read_dir = fs::read_dir(&path)?;
            let mut data = read_dir
                .map(|entry| {
                    let entry = entry?;

                    let path = entry
                        .path()
                        .strip_prefix(&root)
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?
                        .to_owned();
                    let path = Path::new("/").join(path);

                    let metadata = entry.metadata()?;

                    Ok(DirEntry {
                        path,
                        metadata: Ok(metadata_from_std(&metadata)),
                    })
                })
                .collect::<io::Result<Vec<DirEntry>>>()?;
            data.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
            Ok(ReadDir::new(data))
        })
        .await
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let path = self.prepare_path(path);

        if path.parent().is_none() {
            return Err(FsError::BaseNotDirectory);
        }

        blocking::dispatch(&self.handle, "host.create_dir", move || {
            fs::create_dir(&path)
        })
        .await
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let prepared = self.prepare_path(path);

        if prepared.parent().is_none() {
            return Err(FsError::BaseNotDirectory);
        }

        // https://github.com/rust-lang/rust/issues/86442
        // DirectoryNotEmpty is not reported consistently by the OS.
        if let Ok(metadata) = self.metadata(path).await {
            if metadata.is_dir() {
                match self.read_dir(path).await {
                    Ok(dir) if !dir.is_empty() => return Err(FsError::DirectoryNotEmpty),
                    _ => {}
                }
            }
        }

        blocking::dispatch(&self.handle, "host.remove_dir", move || {
            fs::remove_dir(&prepared)
        })
        .await
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        let path = self.prepare_path(path);

        if path.parent().is_none() {
            return Err(FsError::BaseNotDirectory);
        }

        blocking::dispatch(&self.handle, "host.remove_file", move || {
            fs::remove_file(&path)
        })
        .await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.prepare_path(from);
        let to = self.prepare_path(to);

        if from.parent().is_none() || to.parent().is_none() {
            return Err(FsError::BaseNotDirectory);
        }

        blocking::dispatch(&self.handle, "host.rename", move || fs::rename(&from, &to)).await
    }

    async fn metadata(&self, path: &Path) -> Result<Metadata> {
        let path = self.prepare_path(path);

        blocking::dispatch(&self.handle, "host.metadata", move || {
            let metadata = fs::metadata(&path)?;
            Ok(metadata_from_std(&metadata))
        })
        .await
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
        let path = self.prepare_path(path);

        let read = conf.read();
        let write = conf.write();
        let create = conf.create();
        let create_new = conf.create_new();
        let truncate = conf.truncate();

        // according to Rust's stdlib, specifying both truncate and append is nonsensical,
        // and it will return an error if we try to open a file with both flags set.
        // in order to prevent this, and stay compatible with native binaries, we just ignore
        // the append flag if truncate is set.
        let append = if truncate { false } else { conf.append() };

        let open_path = path.clone();
        let (file, metadata) = blocking::dispatch(&self.handle, "host.open", move || {
            let file = fs::OpenOptions::new()
                .read(read)
                .write(write)
                .create_new(create_new)
                .create(create)
                .append(append)
                .truncate(truncate)
                .open(&open_path)?;
            let metadata = file.metadata()?;
            Ok((file, metadata))
        })
        .await?;

        Ok(Box::new(File::new(self.handle.clone(), file, path, &metadata)))
    }
}

/// A thin wrapper around one open host descriptor.
///
/// All reads and writes are positioned (`pread`/`pwrite`); the handle keeps
/// no cursor. The descriptor lives behind `Option` so that `close` is
/// idempotent and later operations observe [`FsError::HandleClosed`].
#[derive(Debug)]
pub struct File {
    handle: Handle,
    inner: Mutex<Option<Arc<fs::File>>>,
    pub host_path: PathBuf,
    accessed: u64,
    created: u64,
    modified: u64,
}

impl File {
    pub(crate) fn new(handle: Handle, file: fs::File, host_path: PathBuf, metadata: &fs::Metadata) -> Self {
        Self {
            handle,
            inner: Mutex::new(Some(Arc::new(file))),
            host_path,
            accessed: nanos_since_epoch(metadata.accessed()),
            created: nanos_since_epoch(metadata.created()),
            modified: nanos_since_epoch(metadata.modified()),
        }
    }

    fn file(&self) -> Result<Arc<fs::File>> {
        self.inner
            .lock()
            .map_err(|_| FsError::Lock)?
            .as_ref()
            .cloned()
            .ok_or(FsError::HandleClosed)
    }
}

#[async_trait]
impl VirtualFile for File {
    fn last_accessed(&self) -> u64 {
        self.accessed
    }

    fn last_modified(&self) -> u64 {
        self.modified
    }

    fn created_time(&self) -> u64 {
        self.created
    }

    async fn size(&self) -> Result<u64> {
        let file = self.file()?;
        blocking::dispatch(&self.handle, "host.file.size", move || {
            Ok(file.metadata()?.len())
        })
        .await
    }

    async fn set_len(&self, new_size: u64) -> Result<()> {
        let file = self.file()?;
        blocking::dispatch(&self.handle, "host.file.set_len", move || {
            file.set_len(new_size)
        })
        .await
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.file()?;
        if len == 0 {
            return Ok(Vec::new());
        }

        blocking::dispatch(&self.handle, "host.file.read_at", move || {
            let mut buf = vec![0u8; len];
            let read = {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::FileExt;
                    file.read_at(&mut buf, offset)?
                }
                #[cfg(windows)]
                {
                    use std::os::windows::fs::FileExt;
                    file.seek_read(&mut buf, offset)?
                }
            };
            buf.truncate(read);
            Ok(buf)
        })
        .await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let file = self.file()?;
        if data.is_empty() {
            return Ok(0);
        }

        // The caller may reuse its buffer as soon as this call returns to
        // the scheduler; copy before crossing to the worker thread.
        let data = Bytes::copy_from_slice(data);

        blocking::dispatch(&self.handle, "host.file.write_at", move || {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileExt;
                file.write_at(&data, offset)
            }
            #[cfg(windows)]
            {
                use std::os::windows::fs::FileExt;
                file.seek_write(&data, offset)
            }
        })
        .await
    }

    async fn flush(&self) -> Result<()> {
        let file = self.file()?;
        blocking::dispatch(&self.handle, "host.file.flush", move || file.sync_data()).await
    }

    async fn close(&self) -> Result<()> {
        let taken = self.inner.lock().map_err(|_| FsError::Lock)?.take();
        let Some(file) = taken else {
            return Ok(());
        };

        tracing::trace!(path = %self.host_path.display(), "closing host file");
        // In-flight operations may still hold clones; the native close
        // happens on whichever worker drops the last one.
        blocking::dispatch(&self.handle, "host.file.close", move || {
            drop(file);
            Ok(())
        })
        .await
    }
}
