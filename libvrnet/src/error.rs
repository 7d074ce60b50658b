use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("netlink connection failed: {0}")]
    Connection(#[from] std::io::Error),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error(transparent)]
    Netlink(#[from] rtnetlink::Error),
}

impl NetError {
    fn raw_code(&self) -> Option<i32> {
        match self {
            NetError::Netlink(rtnetlink::Error::NetlinkError(msg)) => Some(msg.raw_code()),
            _ => None,
        }
    }

    /// The kernel already holds the object being created.
    pub fn is_exist(&self) -> bool {
        self.raw_code() == Some(-libc::EEXIST)
    }

    /// The object being deleted or queried is already gone.
    pub fn is_not_found(&self) -> bool {
        if matches!(self, NetError::LinkNotFound(_)) {
            return true;
        }
        matches!(
            self.raw_code(),
            Some(code) if code == -libc::ENODEV
                || code == -libc::ENOENT
                || code == -libc::ESRCH
                || code == -libc::EADDRNOTAVAIL
        )
    }
}

/// Collapses "already there" into success for create-style operations.
pub fn ok_if_exists(res: Result<()>) -> Result<()> {
    match res {
        Err(e) if e.is_exist() => Ok(()),
        other => other,
    }
}

/// Collapses "already gone" into success for delete-style operations.
pub fn ok_if_not_found(res: Result<()>) -> Result<()> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
