//! The bridge between blocking native calls and the cooperative scheduler.
//!
//! Backends hold an injected [`Handle`] and run every blocking syscall on
//! the runtime's worker pool through [`dispatch`]; the awaiting task is
//! suspended, never the scheduler thread. The pool is process-wide shared
//! state: created lazily with the runtime, alive until process exit.

use std::io;

use tokio::runtime::Handle;

use crate::{FsError, Result};

/// Run `f` on the blocking worker pool and translate its outcome.
///
/// Everything captured by `f` must be owned (`'static`): write buffers are
/// copied by the caller before the handoff, read buffers are allocated
/// inside the closure and handed back by value. Errors are translated at
/// the syscall site, tagged with `op`; the dispatch mechanism itself never
/// retries.
///
/// Dropping the returned future abandons the task: the worker thread still
/// finishes the blocking call and its result is discarded.
pub async fn dispatch<T, F>(handle: &Handle, op: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    match handle.spawn_blocking(f).await {
        Ok(result) => result.map_err(|err| FsError::from_io(op, err)),
        Err(join_err) => {
            tracing::error!(op, error = %join_err, "blocking task did not complete");
            Err(FsError::Io {
                errno: 0,
                message: join_err.to_string(),
                op,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_returns_the_closure_value() {
        let handle = Handle::current();
        let value = dispatch(&handle, "test.value", || Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn dispatch_translates_native_errors() {
        let handle = Handle::current();
        let err = dispatch::<(), _>(&handle, "test.enoent", || {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
        })
        .await
        .unwrap_err();
        assert_eq!(err, FsError::EntryNotFound);
    }

    #[tokio::test]
    async fn dispatch_keeps_errno_and_context() {
        let handle = Handle::current();
        let err = dispatch::<(), _>(&handle, "test.errno", || {
            Err(io::Error::from_raw_os_error(13))
        })
        .await
        .unwrap_err();
        match err {
            FsError::PermissionDenied => {}
            FsError::Io { errno, op, .. } => {
                assert_eq!(errno, 13);
                assert_eq!(op, "test.errno");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
