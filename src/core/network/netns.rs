use std::{
    fs::File,
    future::Future,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
        unix::fs::MetadataExt,
    },
    path::Path,
    thread,
};

use anyhow::Context;
use log::{debug, error};
use nix::sched::{setns, CloneFlags};
use tokio::sync::oneshot;

/// An open reference to a network namespace.
#[derive(Debug)]
pub struct NetnsHandle {
    file: File,
}

impl NetnsHandle {
    /// The namespace of a running process, e.g. a container's init.
    pub fn from_pid(pid: i32) -> anyhow::Result<Self> {
        Self::from_path(format!("/proc/{pid}/ns/net"))
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("open netns {} failed", path.display()))?;

        Ok(Self { file })
    }

    /// The namespace of the calling thread.
    pub fn current() -> anyhow::Result<Self> {
        Self::from_path("/proc/thread-self/ns/net")
    }

    /// Inode of the namespace; two handles with the same inode refer to the
    /// same namespace.
    pub fn inode(&self) -> anyhow::Result<u64> {
        Ok(self.file.metadata()?.ino())
    }

    pub fn try_clone(&self) -> anyhow::Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
        })
    }
}

impl AsFd for NetnsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for NetnsHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Keeps the current thread inside another network namespace and switches
/// it back to where it came from.
struct NamespaceGuard {
    origin: Option<NetnsHandle>,
}

impl NamespaceGuard {
    fn enter(target: &NetnsHandle) -> anyhow::Result<Self> {
        let origin = NetnsHandle::current().context("record current netns failed")?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET).context("enter netns failed")?;

        Ok(Self {
            origin: Some(origin),
        })
    }

    fn restore(mut self) -> anyhow::Result<()> {
        match self.origin.take() {
            Some(origin) => {
                setns(origin.as_fd(), CloneFlags::CLONE_NEWNET).context("exit netns failed")
            }
            None => Ok(()),
        }
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Some(origin) = self.origin.take() {
            if let Err(e) = setns(origin.as_fd(), CloneFlags::CLONE_NEWNET) {
                error!("exit netns failed: {e}");
            }
        }
    }
}

/// Run `work` inside the `target` network namespace.
///
/// The work is driven on a dedicated thread with its own single-threaded
/// runtime: the thread is the only one that ever switches namespace, and it
/// is never reused for anything else. Sockets opened by `work` (netlink
/// included) belong to `target`. The thread switches back to its original
/// namespace before the result is handed over, also when `work` fails or
/// panics.
pub async fn run_in_namespace<F, Fut, T>(target: &NetnsHandle, work: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>>,
    T: Send + 'static,
{
    let target = target.try_clone().context("duplicate netns handle failed")?;
    let (tx, rx) = oneshot::channel();

    thread::Builder::new()
        .name("rtain-netns".to_string())
        .spawn(move || {
            let _ = tx.send(run_pinned(&target, work));
        })
        .context("spawn netns thread failed")?;

    rx.await.context("netns thread exited without a result")?
}

fn run_pinned<F, Fut, T>(target: &NetnsHandle, work: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let guard = NamespaceGuard::enter(target)?;
    debug!("Entered netns {:?}", target.inode().ok());

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build netns runtime failed")
        .and_then(|rt| rt.block_on(work()));

    match (result, guard.restore()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore_err)) => {
            error!("{restore_err:?}");
            Err(e)
        }
    }
}
