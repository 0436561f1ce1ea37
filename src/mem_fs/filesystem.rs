//! This module contains the [`FileSystem`] type itself.

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use slab::Slab;

use super::{time, DirectoryNode, File, FileHandle, FileNode, Inode, Node, ROOT_INODE};
use crate::{
    DirEntry, FileOpener, FileType, FsError, Metadata, OpenOptions, OpenOptionsConfig, ReadDir,
    Result, VirtualFile,
};

/// The in-memory file system!
///
/// This `FileSystem` type can be cloned, it's a light copy of the
/// `FileSystemInner` (which is behind an `Arc` + `RwLock`).
#[derive(Debug, Clone, Default)]
pub struct FileSystem {
    pub(super) inner: Arc<RwLock<FileSystemInner>>,
}

#[derive(Debug)]
pub(super) struct FileSystemInner {
    pub(super) storage: Slab<Node>,
}

impl Default for FileSystemInner {
    fn default() -> Self {
        let mut storage = Slab::new();
        let inode = storage.insert(Node::Directory(DirectoryNode {
            name: OsString::from("/"),
            children: Vec::new(),
            metadata: metadata_for(FileType::new_dir(), ROOT_INODE),
        }));
        debug_assert_eq!(
            inode, ROOT_INODE,
            "the root directory must claim the first inode",
        );
        Self { storage }
    }
}

fn metadata_for(ft: FileType, inode: Inode) -> Metadata {
    let time = time();
    Metadata {
        ft,
        accessed: time,
        created: time,
        modified: time,
        len: 0,
        device: -1,
        inode: inode as u64,
        mode: if ft.is_dir() { 0o777 } else { 0o666 },
        uid: 0,
        gid: 0,
        extra: None,
    }
}

impl FileSystemInner {
    fn canonicalize_without_inode(&self, path: &Path) -> Result<PathBuf> {
        if !path.is_absolute() {
            return Err(FsError::InvalidInput);
        }
        Ok(crate::host_fs::normalize_path(path))
    }

    fn canonicalize(&self, path: &Path) -> Result<(PathBuf, Inode)> {
        let path = self.canonicalize_without_inode(path)?;
        let inode = self.inode_of(&path)?;
        Ok((path, inode))
    }

    fn inode_of(&self, path: &Path) -> Result<Inode> {
        let mut inode = ROOT_INODE;
        for component in path.components() {
            match component {
                Component::RootDir => {}
                Component::Normal(name) => inode = self.child_of(inode, name)?,
                _ => return Err(FsError::InvalidInput),
            }
        }
        Ok(inode)
    }

    fn child_of(&self, dir: Inode, name: &OsStr) -> Result<Inode> {
        let children = match self.storage.get(dir) {
            Some(Node::Directory(DirectoryNode { children, .. })) => children,
            Some(Node::File(_)) => return Err(FsError::BaseNotDirectory),
            None => return Err(FsError::EntryNotFound),
        };
        children
            .iter()
            .copied()
            .find(|inode| {
                self.storage
                    .get(*inode)
                    .map(|node| node.name() == name)
                    .unwrap_or(false)
            })
            .ok_or(FsError::EntryNotFound)
    }

    /// Resolve the parent directory of `path` and the final path segment.
    fn split_parent(&self, path: &Path) -> Result<(Inode, OsString)> {
        let parent = path.parent().ok_or(FsError::BaseNotDirectory)?;
        let name = path
            .file_name()
            .ok_or(FsError::InvalidInput)?
            .to_os_string();
        let inode = self.inode_of(parent)?;
        match self.storage.get(inode) {
            Some(Node::Directory(_)) => Ok((inode, name)),
            _ => Err(FsError::BaseNotDirectory),
        }
    }

    fn add_child(&mut self, parent: Inode, child: Inode) {
        if let Some(Node::Directory(DirectoryNode {
            children, metadata, ..
        })) = self.storage.get_mut(parent)
        {
            children.push(child);
            metadata.modified = time();
        }
    }

    fn remove_child(&mut self, parent: Inode, child: Inode) {
        if let Some(Node::Directory(DirectoryNode {
            children, metadata, ..
        })) = self.storage.get_mut(parent)
        {
            children.retain(|inode| *inode != child);
            metadata.modified = time();
        }
    }
}

#[async_trait]
impl crate::FileSystem for FileSystem {
    async fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let guard = self.inner.read().map_err(|_| FsError::Lock)?;

        let (path, inode) = guard.canonicalize(path)?;
        let children = match guard.storage.get(inode) {
            Some(Node::Directory(DirectoryNode { children, .. })) => children,
            _ => return Err(FsError::BaseNotDirectory),
        };

        let data = children
            .iter()
            .filter_map(|inode| guard.storage.get(*inode))
            .map(|node| DirEntry {
                path: path.join(node.name()),
                metadata: Ok(node.metadata().clone()),
            })
            .collect();

        Ok(ReadDir::new(data))
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| FsError::Lock)?;

        let path = guard.canonicalize_without_inode(path)?;
        if guard.inode_of(&path).is_ok() {
            return Err(FsError::AlreadyExists);
        }

        // Missing parents are not synthesized.
        let (parent, name) = guard.split_parent(&path)?;

        let entry = guard.storage.vacant_entry();
        let inode = entry.key();
        entry.insert(Node::Directory(DirectoryNode {
            name,
            children: Vec::new(),
            metadata: metadata_for(FileType::new_dir(), inode),
        }));
        guard.add_child(parent, inode);

        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| FsError::Lock)?;

        let (path, inode) = guard.canonicalize(path)?;
        let (parent, _) = guard.split_parent(&path)?;

        match guard.storage.get(inode) {
            Some(Node::Directory(DirectoryNode { children, .. })) => {
                if !children.is_empty() {
                    return Err(FsError::DirectoryNotEmpty);
                }
            }
            Some(Node::File(_)) => return Err(FsError::BaseNotDirectory),
            None => return Err(FsError::EntryNotFound),
        }

        guard.remove_child(parent, inode);
        guard.storage.remove(inode);

        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| FsError::Lock)?;

        let (path, inode) = guard.canonicalize(path)?;
        let (parent, _) = guard.split_parent(&path)?;

        match guard.storage.get(inode) {
            Some(Node::File(_)) => {}
            Some(Node::Directory(_)) => return Err(FsError::NotAFile),
            None => return Err(FsError::EntryNotFound),
        }

        guard.remove_child(parent, inode);
        guard.storage.remove(inode);

        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| FsError::Lock)?;

        let from = guard.canonicalize_without_inode(from)?;
        let to = guard.canonicalize_without_inode(to)?;

        let (from_parent, from_name) = guard.split_parent(&from)?;
        let (to_parent, to_name) = guard.split_parent(&to)?;
        let inode = guard.child_of(from_parent, &from_name)?;

        match guard.child_of(to_parent, &to_name) {
            Ok(existing) => match guard.storage.get(existing) {
                Some(Node::Directory(_)) => return Err(FsError::AlreadyExists),
                _ => {
                    guard.remove_child(to_parent, existing);
                    guard.storage.remove(existing);
                }
            },
            Err(FsError::EntryNotFound) => {}
            Err(err) => return Err(err),
        }

        guard.remove_child(from_parent, inode);
        guard.add_child(to_parent, inode);
        if let Some(node) = guard.storage.get_mut(inode) {
            node.set_name(to_name);
            node.metadata_mut().modified = time();
        }

        Ok(())
    }

    async fn metadata(&self, path: &Path) -> Result<Metadata> {
        let guard = self.inner.read().map_err(|_| FsError::Lock)?;
        let (_, inode) = guard.canonicalize(path)?;
        guard
            .storage
            .get(inode)
            .map(|node| node.metadata().clone())
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
        let mut guard = self.inner.write().map_err(|_| FsError::Lock)?;
        let path = guard.canonicalize_without_inode(path)?;

        match guard.inode_of(&path) {
            Ok(inode) => {
                if conf.create_new() {
                    return Err(FsError::AlreadyExists);
                }
                let file = match guard.storage.get(inode) {
                    Some(Node::File(FileNode { file, .. })) => file.clone(),
                    Some(Node::Directory(_)) => return Err(FsError::NotAFile),
                    None => return Err(FsError::EntryNotFound),
                };
                if conf.truncate() && conf.would_write() {
                    file.truncate();
                    if let Some(node) = guard.storage.get_mut(inode) {
                        let metadata = node.metadata_mut();
                        metadata.len = 0;
                        metadata.modified = time();
                    }
                }
                drop(guard);
                Ok(Box::new(FileHandle::new(
                    self.clone(),
                    inode,
                    file.buffer.clone(),
                    conf.read(),
                    conf.write() || conf.append(),
                    conf.append(),
                )))
            }
            Err(FsError::EntryNotFound) if conf.create() || conf.create_new() => {
                let (parent, name) = guard.split_parent(&path)?;
                let file = File::default();
                let entry = guard.storage.vacant_entry();
                let inode = entry.key();
                entry.insert(Node::File(FileNode {
                    name,
                    file: file.clone(),
                    metadata: metadata_for(FileType::new_file(), inode),
                }));
                guard.add_child(parent, inode);
                drop(guard);
                Ok(Box::new(FileHandle::new(
                    self.clone(),
                    inode,
                    file.buffer,
                    conf.read(),
                    true,
                    conf.append(),
                )))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FileSystem;
    use crate::{FileSystem as _, FsError, VirtualFile as _};
    use std::path::Path;

    #[tokio::test]
    async fn test_create_dir() {
        let fs = FileSystem::default();

        assert_eq!(fs.create_dir(Path::new("/foo")).await, Ok(()));
        assert_eq!(
            fs.create_dir(Path::new("/foo")).await,
            Err(FsError::AlreadyExists),
        );
        assert_eq!(fs.create_dir(Path::new("/foo/bar")).await, Ok(()));

        assert_eq!(
            fs.create_dir(Path::new("/a/b/c")).await,
            Err(FsError::EntryNotFound),
            "missing parents are not synthesized",
        );

        let names = fs
            .read_dir(Path::new("/foo"))
            .await
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["bar"]);
    }

    #[tokio::test]
    async fn test_remove_dir() {
        let fs = FileSystem::default();

        assert_eq!(fs.create_dir(Path::new("/foo")).await, Ok(()));
        assert_eq!(fs.create_dir(Path::new("/foo/bar")).await, Ok(()));

        assert_eq!(
            fs.remove_dir(Path::new("/foo")).await,
            Err(FsError::DirectoryNotEmpty),
        );
        assert_eq!(fs.remove_dir(Path::new("/foo/bar")).await, Ok(()));
        assert_eq!(fs.remove_dir(Path::new("/foo")).await, Ok(()));
        assert_eq!(
            fs.remove_dir(Path::new("/foo")).await,
            Err(FsError::EntryNotFound),
        );
    }

    #[tokio::test]
    async fn test_rename() {
        let fs = FileSystem::default();

        assert_eq!(fs.create_dir(Path::new("/foo")).await, Ok(()));
        fs.new_open_options()
            .write(true)
            .create(true)
            .open(Path::new("/foo/a.txt"))
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        assert_eq!(
            fs.rename(Path::new("/foo/a.txt"), Path::new("/foo/b.txt"))
                .await,
            Ok(())
        );
        assert!(fs.stat(Path::new("/foo/b.txt")).await.unwrap().exists);
        assert!(!fs.stat(Path::new("/foo/a.txt")).await.unwrap().exists);

        assert_eq!(
            fs.rename(Path::new("/foo/missing"), Path::new("/foo/c.txt"))
                .await,
            Err(FsError::EntryNotFound),
        );
    }

    #[tokio::test]
    async fn stat_reports_existence() {
        let fs = FileSystem::default();

        // Never-created paths stat as absent, without erroring.
        let missing = fs.stat(Path::new("/nope")).await.unwrap();
        assert!(!missing.exists);
        assert_eq!(missing.size(), 0);

        assert_eq!(fs.create_dir(Path::new("/dir")).await, Ok(()));
        let dir = fs.stat(Path::new("/dir")).await.unwrap();
        assert!(dir.exists);
        assert!(dir.is_directory());

        let file = fs
            .new_open_options()
            .write(true)
            .create(true)
            .open(Path::new("/dir/data.txt"))
            .await
            .unwrap();
        file.write_at(0, b"12345").await.unwrap();
        file.close().await.unwrap();

        let stat = fs.stat(Path::new("/dir/data.txt")).await.unwrap();
        assert!(stat.exists);
        assert_eq!(stat.size(), 5);
        assert_eq!(stat.metadata.device, -1);
    }

    #[tokio::test]
    async fn open_missing_without_create_fails() {
        let fs = FileSystem::default();
        let err = fs
            .new_open_options()
            .read(true)
            .open(Path::new("/absent.txt"))
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::EntryNotFound);
    }

    #[tokio::test]
    async fn create_new_refuses_existing_files() {
        let fs = FileSystem::default();
        fs.new_open_options()
            .write(true)
            .create(true)
            .open(Path::new("/x.txt"))
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        let err = fs
            .new_open_options()
            .write(true)
            .create_new(true)
            .open(Path::new("/x.txt"))
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::AlreadyExists);
    }
}
