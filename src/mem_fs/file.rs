use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{time, FileSystem, Inode};
use crate::{FsError, Result, VirtualFile};

/// The contents of a memory-resident file, shared between the inode table
/// and every open handle.
#[derive(Debug, Clone, Default)]
pub(super) struct File {
    pub(super) buffer: Arc<RwLock<Vec<u8>>>,
}

impl File {
    pub(super) fn truncate(&self) {
        if let Ok(mut buffer) = self.buffer.write() {
            buffer.clear();
        }
    }
}

/// An open handle onto a [`File`].
///
/// Positioned reads and writes go straight to the shared buffer; the node's
/// metadata (length, modified time) is kept in step on every mutation.
#[derive(Debug)]
pub struct FileHandle {
    filesystem: FileSystem,
    inode: Inode,
    buffer: Arc<RwLock<Vec<u8>>>,
    readable: bool,
    writable: bool,
    append: bool,
    open: AtomicBool,
}

impl FileHandle {
    pub(super) fn new(
        filesystem: FileSystem,
        inode: Inode,
        buffer: Arc<RwLock<Vec<u8>>>,
        readable: bool,
        writable: bool,
        append: bool,
    ) -> Self {
        Self {
            filesystem,
            inode,
            buffer,
            readable,
            writable,
            append,
            open: AtomicBool::new(true),
        }
    }

    fn guard_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(FsError::HandleClosed)
        }
    }

    fn node_time(&self, pick: fn(&crate::Metadata) -> u64) -> u64 {
        let Ok(guard) = self.filesystem.inner.read() else {
            return 0;
        };
        guard
            .storage
            .get(self.inode)
            .map(|node| pick(node.metadata()))
            .unwrap_or(0)
    }

    fn update_len(&self, len: u64) {
        if let Ok(mut guard) = self.filesystem.inner.write() {
            if let Some(node) = guard.storage.get_mut(self.inode) {
                let metadata = node.metadata_mut();
                metadata.len = len;
                metadata.modified = time();
            }
        }
    }
}

#[async_trait]
impl VirtualFile for FileHandle {
    fn last_accessed(&self) -> u64 {
        self.node_time(|metadata| metadata.accessed)
    }

    fn last_modified(&self) -> u64 {
        self.node_time(|metadata| metadata.modified)
    }

    fn created_time(&self) -> u64 {
        self.node_time(|metadata| metadata.created)
    }

    async fn size(&self) -> Result<u64> {
        self.guard_open()?;
        let buffer = self.buffer.read().map_err(|_| FsError::Lock)?;
        Ok(buffer.len() as u64)
    }

    async fn set_len(&self, new_size: u64) -> Result<()> {
        self.guard_open()?;
        if !self.writable {
            return Err(FsError::PermissionDenied);
        }
        let mut buffer = self.buffer.write().map_err(|_| FsError::Lock)?;
        buffer.resize(new_size as usize, 0);
        drop(buffer);
        self.update_len(new_size);
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.guard_open()?;
        if !self.readable {
            return Err(FsError::PermissionDenied);
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let buffer = self.buffer.read().map_err(|_| FsError::Lock)?;
        let start = (offset as usize).min(buffer.len());
        let end = start.saturating_add(len).min(buffer.len());
        Ok(buffer[start..end].to_vec())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.guard_open()?;
        if !self.writable {
            return Err(FsError::PermissionDenied);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let new_len;
        {
            let mut buffer = self.buffer.write().map_err(|_| FsError::Lock)?;
            let offset = if self.append {
                buffer.len()
            } else {
                offset as usize
            };
            let end = offset + data.len();
            if buffer.len() < end {
                buffer.resize(end, 0);
            }
            buffer[offset..end].copy_from_slice(data);
            new_len = buffer.len() as u64;
        }
        self.update_len(new_len);
        Ok(data.len())
    }

    async fn close(&self) -> Result<()> {
        // Idempotent: flipping an already-closed handle is a no-op.
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}
