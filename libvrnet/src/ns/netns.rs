use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use rtnetlink::Handle;

use crate::error::{NetError, Result};

pub const BIND_MOUNT_PATH: &str = "/var/run/netns";

/// Where a network namespace handle comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetnsRef {
    /// The namespace the daemon itself runs in.
    Root,
    /// A container namespace, reached through the process that owns it.
    Pid(i32),
    /// A named namespace bind-mounted under `/var/run/netns`.
    Name(String),
}

/// An open network namespace. Owns the file descriptor; the kernel reference
/// is released when the value is dropped.
#[derive(Debug)]
pub struct Netns {
    file: File,
    path: PathBuf,
}

impl Netns {
    pub fn open(source: &NetnsRef) -> Result<Self> {
        match source {
            NetnsRef::Root => Self::current(),
            NetnsRef::Pid(pid) => Self::from_pid(*pid),
            NetnsRef::Name(name) => Self::from_name(name),
        }
    }

    /// The namespace of the calling thread.
    pub fn current() -> Result<Self> {
        let path = format!(
            "/proc/{}/task/{}/ns/net",
            std::process::id(),
            nix::unistd::gettid()
        );
        Self::from_path(Path::new(&path))
    }

    /// The namespace of another process, via `/proc/<pid>/ns/net`. A stale
    /// pid surfaces here as an open failure.
    pub fn from_pid(pid: i32) -> Result<Self> {
        if pid <= 0 {
            return Err(NetError::Namespace(format!("invalid pid {pid}")));
        }
        Self::from_path(Path::new(&format!("/proc/{pid}/ns/net")))
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::from_path(&Path::new(BIND_MOUNT_PATH).join(name))
    }

    fn from_path(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path).map_err(|e| {
            NetError::Namespace(format!("failed to open {}: {e}", path.display()))
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Moves the calling thread into this namespace.
    pub fn enter(&self) -> Result<()> {
        nix::sched::setns(self.file.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| NetError::Namespace(format!("setns {}: {e}", self.path.display())))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens an rtnetlink handle bound to this namespace.
    ///
    /// The calling thread briefly enters the namespace to create the
    /// netlink socket and is restored before returning; the socket stays
    /// bound to the namespace it was created in. There is no await while
    /// the thread is switched.
    ///
    /// # Returns
    /// A handle whose operations all apply inside this namespace.
    pub fn handle(&self) -> Result<Handle> {
        let origin = Netns::current()?;
        self.enter()?;
        let conn = rtnetlink::new_connection();
        let restored = origin.enter();
        let (connection, handle, _) = conn?;
        restored?;
        tokio::spawn(connection);
        Ok(handle)
    }
}

/// Opens an rtnetlink handle in the daemon's own namespace.
pub fn root_handle() -> Result<Handle> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);
    Ok(handle)
}

impl PartialEq for Netns {
    fn eq(&self, other: &Self) -> bool {
        match (self.file.metadata(), other.file.metadata()) {
            (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
            _ => false,
        }
    }
}

impl Display for Netns {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.file.metadata() {
            Ok(meta) => write!(f, "NS({}:{})", meta.dev(), meta.ino()),
            Err(_) => write!(f, "NS(unknown)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_netns_opens() {
        let ns = Netns::current().unwrap();
        assert!(ns.raw_fd() >= 0);
        assert_eq!(ns, Netns::current().unwrap());
    }

    #[test]
    fn test_from_pid_rejects_bad_pid() {
        assert!(Netns::from_pid(0).is_err());
        assert!(Netns::from_pid(-3).is_err());
    }

    #[test]
    fn test_open_by_source() {
        let root = Netns::open(&NetnsRef::Root).unwrap();
        let own = Netns::open(&NetnsRef::Pid(std::process::id() as i32)).unwrap();
        assert_eq!(root, own);
    }
}
