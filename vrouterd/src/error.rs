use libvrnet::NetError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Reconciliation failures, classified by what the work queue should do
/// with them.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Broken input (missing annotation, malformed spec). Not retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O hiccup (runtime rpc, orchestrator, stale pid). Retried with
    /// backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// The kernel rejected a programming step. Retried with backoff.
    #[error("programming error: {0}")]
    Programming(String),
}

impl DaemonError {
    pub fn retriable(&self) -> bool {
        !matches!(self, DaemonError::Config(_))
    }
}

impl From<NetError> for DaemonError {
    fn from(e: NetError) -> Self {
        match e {
            // A namespace that cannot be opened is a stale pid; the next
            // runtime resolution sorts it out.
            NetError::Namespace(msg) => DaemonError::Transient(msg),
            NetError::Invalid(msg) => DaemonError::Config(msg),
            other => DaemonError::Programming(other.to_string()),
        }
    }
}

impl From<libcrio::CrioError> for DaemonError {
    fn from(e: libcrio::CrioError) -> Self {
        match e {
            libcrio::CrioError::UnsupportedEndpoint(_) | libcrio::CrioError::Config(_) => {
                DaemonError::Config(e.to_string())
            }
            other => DaemonError::Transient(other.to_string()),
        }
    }
}

impl From<etcd_client::Error> for DaemonError {
    fn from(e: etcd_client::Error) -> Self {
        DaemonError::Transient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!DaemonError::Config("missing annotation".into()).retriable());
        assert!(DaemonError::Transient("rpc timeout".into()).retriable());
        assert!(DaemonError::Programming("addr add failed".into()).retriable());
    }
}
