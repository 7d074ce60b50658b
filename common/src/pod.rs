use serde::{Deserialize, Serialize};

use crate::ObjectMeta;

/// Subset of the workload pod object the daemon consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

impl Pod {
    /// Standard readiness predicate: the pod is running and its `Ready`
    /// condition is `True`.
    pub fn is_ready(&self) -> bool {
        if self.status.phase.as_deref() != Some("Running") {
            return false;
        }
        self.status
            .conditions
            .iter()
            .any(|c| c.condition_type == "Ready" && c.status == "True")
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "p1".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                node_name: Some("node-1".to_string()),
            },
            status: PodStatus {
                phase: Some("Running".to_string()),
                conditions: vec![PodCondition {
                    condition_type: "Ready".to_string(),
                    status: "True".to_string(),
                }],
            },
        }
    }

    #[test]
    fn test_readiness_predicate() {
        assert!(ready_pod().is_ready());

        let mut pending = ready_pod();
        pending.status.phase = Some("Pending".to_string());
        assert!(!pending.is_ready());

        let mut unready = ready_pod();
        unready.status.conditions[0].status = "False".to_string();
        assert!(!unready.is_ready());

        let mut bare = ready_pod();
        bare.status.conditions.clear();
        assert!(!bare.is_ready());
    }

    #[test]
    fn test_pod_yaml_round_trip() {
        let yaml = r#"
metadata:
  name: router-a-7c9f
  namespace: default
  labels:
    app: virtualrouter
  annotations:
    customresourceName: router-a
    customresourceNamespace: default
  finalizers:
    - networkcontroller.io/virtualrouter-daemon
spec:
  nodeName: node-1
status:
  phase: Running
  conditions:
    - type: Ready
      status: "True"
"#;
        let pod: Pod = serde_yaml::from_str(yaml).unwrap();
        assert!(pod.is_ready());
        assert!(!pod.is_deleting());
        assert_eq!(
            pod.metadata.annotations.get(crate::ANNOTATION_CR_NAME),
            Some(&"router-a".to_string())
        );
        assert!(pod.metadata.has_finalizer(crate::VIRTUALROUTER_DAEMON_FINALIZER));
    }
}
