use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::{CrioError, Result};

pub const DEFAULT_RUNTIME_ENDPOINT: &str = "unix:///var/run/crio/crio.sock";
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const CRICTL_CONFIG_PATH: &str = "/etc/crictl.yaml";

/// Connection settings for the container runtime.
#[derive(Debug, Clone)]
pub struct CrioConfig {
    pub runtime_endpoint: String,
    /// Defaults to the runtime endpoint when unset.
    pub image_endpoint: String,
    /// Per-RPC timeout.
    pub timeout: Duration,
}

impl Default for CrioConfig {
    fn default() -> Self {
        Self {
            runtime_endpoint: DEFAULT_RUNTIME_ENDPOINT.to_string(),
            image_endpoint: DEFAULT_RUNTIME_ENDPOINT.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// The subset of crictl's config file the daemon honors.
#[derive(Debug, Default, Deserialize)]
struct CrictlFile {
    #[serde(rename = "runtime-endpoint")]
    runtime_endpoint: Option<String>,
    #[serde(rename = "image-endpoint")]
    image_endpoint: Option<String>,
    timeout: Option<u64>,
}

impl CrioConfig {
    /// Builds a config from explicit values, filling gaps from
    /// `/etc/crictl.yaml` (when present) and the defaults. The image
    /// endpoint falls back to the runtime endpoint.
    pub fn resolve(
        runtime_endpoint: Option<&str>,
        image_endpoint: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<Self> {
        let file = Self::read_crictl_file(Path::new(CRICTL_CONFIG_PATH))?;

        let runtime = runtime_endpoint
            .map(str::to_string)
            .or(file.runtime_endpoint)
            .unwrap_or_else(|| {
                warn!("runtime endpoint not set, using default {DEFAULT_RUNTIME_ENDPOINT}");
                DEFAULT_RUNTIME_ENDPOINT.to_string()
            });
        let image = image_endpoint
            .map(str::to_string)
            .or(file.image_endpoint)
            .unwrap_or_else(|| runtime.clone());
        let timeout = timeout_secs
            .or(file.timeout)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            runtime_endpoint: runtime,
            image_endpoint: image,
            timeout: Duration::from_secs(timeout),
        })
    }

    fn read_crictl_file(path: &Path) -> Result<CrictlFile> {
        if !path.exists() {
            return Ok(CrictlFile::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| CrioError::Config(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| CrioError::Config(format!("{}: {e}", path.display())))
    }

    #[cfg(test)]
    fn resolve_with_file(
        path: &Path,
        runtime_endpoint: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<Self> {
        let file = Self::read_crictl_file(path)?;
        let runtime = runtime_endpoint
            .map(str::to_string)
            .or(file.runtime_endpoint)
            .unwrap_or_else(|| DEFAULT_RUNTIME_ENDPOINT.to_string());
        let image = file.image_endpoint.unwrap_or_else(|| runtime.clone());
        let timeout = timeout_secs
            .or(file.timeout)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Ok(Self {
            runtime_endpoint: runtime,
            image_endpoint: image,
            timeout: Duration::from_secs(timeout),
        })
    }
}

/// Extracts the socket path from a `unix://` endpoint. Bare paths get the
/// unix scheme assumed; anything else is unsupported.
pub fn unix_socket_path(endpoint: &str) -> Result<String> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(CrioError::UnsupportedEndpoint(endpoint.to_string()));
        }
        return Ok(path.to_string());
    }
    if endpoint.starts_with('/') {
        return Ok(endpoint.to_string());
    }
    Err(CrioError::UnsupportedEndpoint(endpoint.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_unix_socket_path() {
        assert_eq!(
            unix_socket_path("unix:///var/run/crio/crio.sock").unwrap(),
            "/var/run/crio/crio.sock"
        );
        assert_eq!(
            unix_socket_path("/var/run/crio/crio.sock").unwrap(),
            "/var/run/crio/crio.sock"
        );
        assert!(unix_socket_path("tcp://127.0.0.1:10010").is_err());
        assert!(unix_socket_path("unix://").is_err());
    }

    #[test]
    fn test_resolve_from_crictl_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "runtime-endpoint: unix:///run/other.sock").unwrap();
        writeln!(file, "timeout: 10").unwrap();

        let cfg = CrioConfig::resolve_with_file(file.path(), None, None).unwrap();
        assert_eq!(cfg.runtime_endpoint, "unix:///run/other.sock");
        // image endpoint falls back to the runtime endpoint
        assert_eq!(cfg.image_endpoint, "unix:///run/other.sock");
        assert_eq!(cfg.timeout, Duration::from_secs(10));

        // explicit values win over the file
        let cfg =
            CrioConfig::resolve_with_file(file.path(), Some("unix:///run/cli.sock"), Some(2))
                .unwrap();
        assert_eq!(cfg.runtime_endpoint, "unix:///run/cli.sock");
        assert_eq!(cfg.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_resolve_defaults_without_file() {
        let cfg = CrioConfig::resolve_with_file(Path::new("/nonexistent/crictl.yaml"), None, None)
            .unwrap();
        assert_eq!(cfg.runtime_endpoint, DEFAULT_RUNTIME_ENDPOINT);
        assert_eq!(cfg.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }
}
