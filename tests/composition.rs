//! Jail and mount composition over real backends: containment is enforced,
//! mounted subtrees are addressed transparently, and wrappers nest.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::runtime::Handle;

use common::{build_zip, Method};
use unifs::{
    host_fs, mem_fs, zip_fs, FileSystem as _, FsError, MountFileSystem, ScopedFileSystem,
    VirtualFile as _,
};

#[tokio::test]
async fn jail_contains_traversal_on_the_host() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("inner")).unwrap();
    std::fs::write(temp.path().join("inner/ok.txt"), b"fine").unwrap();
    std::fs::write(temp.path().join("outside.txt"), b"secret").unwrap();

    let host = Arc::new(host_fs::FileSystem::new(Handle::current(), temp.path()).unwrap());
    let jail = ScopedFileSystem::new(host, "/inner");

    // In-jail access works and is re-rooted.
    let ok = jail
        .new_open_options()
        .read(true)
        .open(Path::new("/ok.txt"))
        .await
        .unwrap();
    assert_eq!(ok.read_to_end().await.unwrap(), b"fine");
    ok.close().await.unwrap();

    // Escapes are rejected, not resolved.
    assert_eq!(
        jail.new_open_options()
            .read(true)
            .open(Path::new("/../outside.txt"))
            .await
            .map(|_| ())
            .unwrap_err(),
        FsError::PermissionDenied,
    );
    assert_eq!(
        jail.metadata(Path::new("../../etc/passwd")).await,
        Err(FsError::PermissionDenied),
    );

    // A `..` that stays inside the jail is just path arithmetic.
    let still_inside = jail
        .metadata(Path::new("/sub/../ok.txt"))
        .await
        .unwrap();
    assert!(still_inside.is_file());
}

#[tokio::test]
async fn jail_wraps_any_backend() {
    let backing = Arc::new(mem_fs::FileSystem::default());
    backing.create_dir(Path::new("/app")).await.unwrap();
    backing.create_dir(Path::new("/app/data")).await.unwrap();

    let jail = ScopedFileSystem::new(backing.clone(), "/app");
    jail.create_dir(Path::new("/cache")).await.unwrap();

    // The wrapper writes through into the backing namespace.
    assert!(backing.stat(Path::new("/app/cache")).await.unwrap().exists);

    let mut names: Vec<PathBuf> = jail
        .read_dir(Path::new("/"))
        .await
        .unwrap()
        .map(|entry| entry.unwrap().path)
        .collect();
    names.sort();
    assert_eq!(names, vec![PathBuf::from("/cache"), PathBuf::from("/data")]);
}

#[tokio::test]
async fn archives_mount_as_subtrees() {
    let host = Arc::new(mem_fs::FileSystem::default());
    host.create_dir(Path::new("/data")).await.unwrap();

    let archive = Arc::new(
        zip_fs::FileSystem::new(build_zip(&[
            ("hello/world.txt", b"HELLO WORLD!", Method::Stored),
            ("top.txt", b"top level", Method::Stored),
        ]))
        .unwrap(),
    );

    let fs = MountFileSystem::new(host);
    fs.mount("/assets", archive).unwrap();

    // Transparent addressing through the mount prefix.
    let file = fs
        .new_open_options()
        .read(true)
        .open(Path::new("/assets/hello/world.txt"))
        .await
        .unwrap();
    assert_eq!(file.read_to_end().await.unwrap(), b"HELLO WORLD!");

    let stat = fs.stat(Path::new("/assets/hello/world.txt")).await.unwrap();
    assert!(stat.exists);
    assert_eq!(stat.size(), 12);

    // Listings under the prefix are re-prefixed into the host namespace.
    let names: Vec<PathBuf> = fs
        .read_dir(Path::new("/assets"))
        .await
        .unwrap()
        .map(|entry| entry.unwrap().path)
        .collect();
    assert_eq!(
        names,
        vec![PathBuf::from("/assets/hello"), PathBuf::from("/assets/top.txt")]
    );

    // Host paths are untouched, and the mount is visible at the root.
    let root: Vec<PathBuf> = fs
        .read_dir(Path::new("/"))
        .await
        .unwrap()
        .map(|entry| entry.unwrap().path)
        .collect();
    assert!(root.contains(&PathBuf::from("/data")));
    assert!(root.contains(&PathBuf::from("/assets")));

    // Writing into the read-only mounted archive still fails loudly.
    assert_eq!(
        fs.create_dir(Path::new("/assets/new")).await,
        Err(FsError::ReadOnly)
    );
}

#[tokio::test]
async fn wrappers_nest() {
    // Jail into a subtree of a mounted archive: resolution composes.
    let host = Arc::new(mem_fs::FileSystem::default());
    let archive = Arc::new(
        zip_fs::FileSystem::new(build_zip(&[(
            "hello/world.txt",
            b"HELLO WORLD!",
            Method::Stored,
        )]))
        .unwrap(),
    );

    let mounted = Arc::new({
        let fs = MountFileSystem::new(host);
        fs.mount("/assets", archive).unwrap();
        fs
    });

    let jail = ScopedFileSystem::new(mounted, "/assets/hello");

    let file = jail
        .new_open_options()
        .read(true)
        .open(Path::new("/world.txt"))
        .await
        .unwrap();
    assert_eq!(file.read_to_end().await.unwrap(), b"HELLO WORLD!");

    assert_eq!(
        jail.metadata(Path::new("/../../secret")).await,
        Err(FsError::PermissionDenied)
    );
}

#[tokio::test]
async fn watch_returns_an_inert_subscription() {
    let fs = mem_fs::FileSystem::default();
    let guard = fs.watch(Path::new("/anything")).unwrap();
    guard.cancel();
}

#[tokio::test]
async fn exec_is_an_unsupported_collaborator() {
    let fs = mem_fs::FileSystem::default();
    let err = fs
        .exec(Path::new("/bin/true"), &[], &Default::default())
        .await
        .unwrap_err();
    assert_eq!(err, FsError::Unsupported);
}
