//! In-memory backend. Nothing here blocks, so operations complete without
//! a worker-pool round trip; the handle contract (positioned access,
//! idempotent close) is identical to the host backend's.

mod file;
mod filesystem;

pub use file::FileHandle;
pub use filesystem::FileSystem;

use file::File;

use crate::Metadata;
use std::ffi::{OsStr, OsString};
use std::time::{SystemTime, UNIX_EPOCH};

type Inode = usize;
const ROOT_INODE: Inode = 0;

#[derive(Debug)]
struct FileNode {
    name: OsString,
    file: File,
    metadata: Metadata,
}

#[derive(Debug)]
struct DirectoryNode {
    name: OsString,
    children: Vec<Inode>,
    metadata: Metadata,
}

#[derive(Debug)]
enum Node {
    File(FileNode),
    Directory(DirectoryNode),
}

impl Node {
    fn name(&self) -> &OsStr {
        match self {
            Self::File(FileNode { name, .. }) => name.as_os_str(),
            Self::Directory(DirectoryNode { name, .. }) => name.as_os_str(),
        }
    }

    fn metadata(&self) -> &Metadata {
        match self {
            Self::File(FileNode { metadata, .. }) => metadata,
            Self::Directory(DirectoryNode { metadata, .. }) => metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            Self::File(FileNode { metadata, .. }) => metadata,
            Self::Directory(DirectoryNode { metadata, .. }) => metadata,
        }
    }

    fn set_name(&mut self, new_name: OsString) {
        match self {
            Self::File(FileNode { name, .. }) => *name = new_name,
            Self::Directory(DirectoryNode { name, .. }) => *name = new_name,
        }
    }
}

fn time() -> u64 {
    // It's very unlikely that the system returns a time that is before
    // `UNIX_EPOCH` :-).
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}
