//! Mounting: graft filesystems as subtrees of a host filesystem.
//!
//! Paths under a mount prefix delegate to the mounted backend with the
//! prefix stripped; every other path goes to the host unchanged. Nested
//! mounts resolve longest-prefix first.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::host_fs::normalize_path;
use crate::{
    DirEntry, FileOpener, FileSystem, FileType, FsError, Metadata, OpenOptions, OpenOptionsConfig,
    ReadDir, Result, VirtualFile,
};

#[derive(Debug)]
struct MountPoint {
    prefix: PathBuf,
    fs: Arc<dyn FileSystem + Send + Sync>,
}

/// Resolution of a path against the mount table.
struct Resolved {
    fs: Arc<dyn FileSystem + Send + Sync>,
    /// Path to hand to `fs`, rooted at the mount (or host) root.
    path: PathBuf,
    /// The matched prefix; `None` when the host won.
    prefix: Option<PathBuf>,
}

#[derive(Debug)]
pub struct MountFileSystem {
    host: Arc<dyn FileSystem + Send + Sync>,
    mounts: RwLock<Vec<MountPoint>>,
}

impl MountFileSystem {
    pub fn new(host: Arc<dyn FileSystem + Send + Sync>) -> Self {
        Self {
            host,
            mounts: RwLock::new(Vec::new()),
        }
    }

    /// Graft `fs` under `prefix`. The prefix must be absolute; mounting the
    /// same prefix twice fails with [`FsError::AlreadyExists`].
    pub fn mount(
        &self,
        prefix: impl Into<PathBuf>,
        fs: Arc<dyn FileSystem + Send + Sync>,
    ) -> Result<()> {
        let prefix = normalize_path(&prefix.into());
        if !prefix.is_absolute() || prefix.parent().is_none() {
            return Err(FsError::InvalidInput);
        }

        let mut mounts = self.mounts.write().map_err(|_| FsError::Lock)?;
        if mounts.iter().any(|mount| mount.prefix == prefix) {
            return Err(FsError::AlreadyExists);
        }
        tracing::debug!(prefix = %prefix.display(), "mounting filesystem");
        mounts.push(MountPoint { prefix, fs });
        Ok(())
    }

    pub fn unmount(&self, prefix: &Path) -> Result<()> {
        let prefix = normalize_path(prefix);
        let mut mounts = self.mounts.write().map_err(|_| FsError::Lock)?;
        let before = mounts.len();
        mounts.retain(|mount| mount.prefix != prefix);
        if mounts.len() == before {
            return Err(FsError::EntryNotFound);
        }
        tracing::debug!(prefix = %prefix.display(), "unmounted filesystem");
        Ok(())
    }

    fn resolve(&self, path: &Path) -> Result<Resolved> {
        let path = normalize_path(path);
        let mounts = self.mounts.read().map_err(|_| FsError::Lock)?;

        let best = mounts
            .iter()
            .filter(|mount| path.starts_with(&mount.prefix))
            .max_by_key(|mount| mount.prefix.components().count());

        Ok(match best {
            Some(mount) => {
                let rest = path
                    .strip_prefix(&mount.prefix)
                    .expect("starts_with implies strip_prefix");
                Resolved {
                    fs: mount.fs.clone(),
                    path: Path::new("/").join(rest),
                    prefix: Some(mount.prefix.clone()),
                }
            }
            None => Resolved {
                fs: self.host.clone(),
                path,
                prefix: None,
            },
        })
    }

    /// Mount roots directly under `path`, surfaced as directory entries.
    fn mount_roots_under(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mounts = self.mounts.read().map_err(|_| FsError::Lock)?;
        Ok(mounts
            .iter()
            .filter(|mount| mount.prefix.parent() == Some(path))
            .map(|mount| DirEntry {
                path: mount.prefix.clone(),
                metadata: Ok(Metadata {
                    ft: FileType::new_dir(),
                    device: -1,
                    ..Default::default()
                }),
            })
            .collect())
    }
}

#[async_trait]
impl FileSystem for MountFileSystem {
    async fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let resolved = self.resolve(path)?;

        match resolved.prefix {
            Some(prefix) => {
                let listing = resolved.fs.read_dir(&resolved.path).await?;
                let entries = listing
                    .map(|entry| {
                        let entry = entry?;
                        let rest = entry
                            .path
                            .strip_prefix("/")
                            .map(Path::to_path_buf)
                            .unwrap_or_else(|_| entry.path.clone());
                        Ok(DirEntry {
                            path: prefix.join(rest),
                            ..entry
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ReadDir::new(entries))
            }
            None => {
                let roots = self.mount_roots_under(&resolved.path)?;
                match self.host.read_dir(&resolved.path).await {
                    Ok(listing) => {
                        let mut entries: Vec<DirEntry> =
                            listing.collect::<Result<Vec<_>>>()?;
                        for root in roots {
                            if !entries.iter().any(|entry| entry.path == root.path) {
                                entries.push(root);
                            }
                        }
                        Ok(ReadDir::new(entries))
                    }
                    // The host has no such directory, but mounts may still
                    // make it visible.
                    Err(FsError::EntryNotFound) if !roots.is_empty() => {
                        Ok(ReadDir::new(roots))
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let resolved = self.resolve(path)?;
        resolved.fs.create_dir(&resolved.path).await
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let resolved = self.resolve(path)?;
        resolved.fs.remove_dir(&resolved.path).await
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        let resolved = self.resolve(path)?;
        resolved.fs.remove_file(&resolved.path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_resolved = self.resolve(from)?;
        let to_resolved = self.resolve(to)?;
        if from_resolved.prefix != to_resolved.prefix {
            return Err(FsError::Unsupported);
        }
        from_resolved
            .fs
            .rename(&from_resolved.path, &to_resolved.path)
            .await
    }

    async fn metadata(&self, path: &Path) -> Result<Metadata> {
        let resolved = self.resolve(path)?;
        resolved.fs.metadata(&resolved.path).await
    }

    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }
}

#[async_trait]
impl FileOpener for MountFileSystem {
    async fn open(
        &self,
        path: &Path,
        conf: &OpenOptionsConfig,
    ) -> Result<Box<dyn VirtualFile + Send + Sync + 'static>> {
        let resolved = self.resolve(path)?;
        resolved
            .fs
            .new_open_options()
            .options(conf.clone())
            .open(&resolved.path)
            .await
    }
}
