use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_internal_bridge() -> String {
    "intbr".to_string()
}
fn default_external_bridge() -> String {
    "extbr".to_string()
}
fn default_internal_veth_base() -> String {
    "intif".to_string()
}
fn default_external_veth_base() -> String {
    "extif".to_string()
}
fn default_workers() -> usize {
    1
}

/// Process-wide settings, immutable after startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Identity of this node in the orchestrator.
    pub node_name: String,

    /// Orchestrator (etcd-compatible) endpoints.
    pub orchestrator_endpoints: Vec<String>,

    /// Container runtime sockets; crictl.yaml and built-in defaults fill
    /// the gaps.
    #[serde(default)]
    pub runtime_endpoint: Option<String>,
    #[serde(default)]
    pub image_endpoint: Option<String>,
    /// Per-RPC timeout for runtime calls, seconds.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Physical uplinks. Left empty here, they are resolved from the node
    /// object's annotations at startup.
    #[serde(default)]
    pub internal_interface: String,
    #[serde(default)]
    pub external_interface: String,

    #[serde(default = "default_internal_bridge")]
    pub internal_bridge_name: String,
    #[serde(default = "default_external_bridge")]
    pub external_bridge_name: String,

    /// Base names for the synthesized host-side veth pairs; the pair ends
    /// are `<base>0` and `<base>1`.
    #[serde(default = "default_internal_veth_base")]
    pub new_internal_interface_name: String,
    #[serde(default = "default_external_veth_base")]
    pub new_external_interface_name: String,

    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl DaemonConfig {
    pub fn uplink(&self, side: crate::binding::Side) -> &str {
        match side {
            crate::binding::Side::Internal => &self.internal_interface,
            crate::binding::Side::External => &self.external_interface,
        }
    }

    pub fn bridge_name(&self, side: crate::binding::Side) -> &str {
        match side {
            crate::binding::Side::Internal => &self.internal_bridge_name,
            crate::binding::Side::External => &self.external_bridge_name,
        }
    }

    pub fn veth_base(&self, side: crate::binding::Side) -> &str {
        match side {
            crate::binding::Side::Internal => &self.new_internal_interface_name,
            crate::binding::Side::External => &self.new_external_interface_name,
        }
    }
}

pub fn load_config(path: &Path) -> Result<DaemonConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;
    let cfg: DaemonConfig =
        serde_yaml::from_str(&content).context("failed to parse YAML config")?;
    if cfg.workers == 0 {
        anyhow::bail!("workers must be at least 1");
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
nodeName: node-1
orchestratorEndpoints:
  - http://127.0.0.1:2379
internalInterface: eth0
externalInterface: eth1
"#
        )
        .unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.node_name, "node-1");
        assert_eq!(cfg.internal_bridge_name, "intbr");
        assert_eq!(cfg.external_bridge_name, "extbr");
        assert_eq!(cfg.new_internal_interface_name, "intif");
        assert_eq!(cfg.new_external_interface_name, "extif");
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.timeout, None);
    }

    #[test]
    fn test_load_config_leaves_uplinks_for_node_annotations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "nodeName: node-1\norchestratorEndpoints: []\n").unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert!(cfg.internal_interface.is_empty());
        assert!(cfg.external_interface.is_empty());
    }
}
