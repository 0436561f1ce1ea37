//! Jailing: a wrapper that confines any filesystem to a subtree.
//!
//! The jail is a security boundary, not a convenience: a path whose `..`
//! components would climb above the jail root is rejected with
//! [`FsError::PermissionDenied`] instead of being clamped.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    DirEntry, FileOpener, FileSystem, FsError, Metadata, OpenOptions, OpenOptionsConfig, ReadDir,
    Result, VirtualFile,
};

/// A [`FileSystem`] implementation that is scoped to a subtree of the
/// wrapped filesystem.
#[derive(Debug, Clone)]
pub struct ScopedFileSystem {
    root: PathBuf,
    inner: Arc<dyn FileSystem + Send + Sync>,
}

impl ScopedFileSystem {
    pub fn new(inner: Arc<dyn FileSystem + Send + Sync>, root: impl Into<PathBuf>) -> Self {
        ScopedFileSystem {
            root: root.into(),
            inner,
        }
    }

    fn prepare_path(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.root.join(jail_normalize(path)?))
    }

    fn reroot(&self, path: &Path) -> Result<PathBuf> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| FsError::InvalidInput)?;
        Ok(Path::new("/").join(relative))
    }
}

/// Lexically resolve `path` relative to the jail root, rejecting any
/// traversal that would escape it.
fn jail_normalize(path: &Path) -> Result<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(FsError::PermissionDenied);
                }
            }
            Component::Normal(segment) => parts.push(segment),
            Component::Prefix(_) => return Err(FsError::InvalidInput),
        }
    }
    Ok(parts.into_iter().collect())
}

#[async_trait]
impl FileSystem for ScopedFileSystem {
    async fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let path = self.prepare_path(path)?;

        let mut entries = Vec::new();
        for entry in self.inner.read_dir(&path).await? {
            let entry = entry?;
            entries.push(DirEntry {
                path: self.reroot(&entry.path)?,
                ..entry
            });
        }

        Ok(ReadDir::new(entries))
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let path = self.prepare_path(path)?;
        self.inner.create_dir(&path).await
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let path = self.prepare_path(path)?;
        self.inner.remove_dir(&path).await
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        let path = self.prepare_path(path)?;
        self.inner.remove_file(&path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.prepare_path(from)?;
        let to = self.prepare_path(to)?;
        self.inner.rename(&from, &to).await
    }

    async fn metadata(&self, path: &Path) -> Result<Metadata> {
        let path = self.prepare_path(path)?;
        self.inner.metadata(&path).await
    }

    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }
}

#[async_trait]
impl FileOpener for ScopedFileSystem {
    async fn open(
        &self,
        path: &Path,
        conf: &OpenOptionsConfig,
    ) -> Result<Box<dyn VirtualFile + Send + Sync + 'static>> {
        let path = self.prepare_path(path)?;
        self.inner
            .new_open_options()
            .options(conf.clone())
            .open(&path)
            .await
    }
}
