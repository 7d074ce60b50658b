use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard object metadata shared by every stored object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn key(&self) -> String {
        crate::object_key(&self.namespace, &self.name)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Removes a finalizer by name. Returns true when the list changed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_finalizer() {
        let mut meta = ObjectMeta {
            name: "p1".to_string(),
            namespace: "default".to_string(),
            finalizers: vec![
                crate::VIRTUALROUTER_DAEMON_FINALIZER.to_string(),
                "other/finalizer".to_string(),
            ],
            ..Default::default()
        };

        assert!(meta.remove_finalizer(crate::VIRTUALROUTER_DAEMON_FINALIZER));
        assert!(!meta.has_finalizer(crate::VIRTUALROUTER_DAEMON_FINALIZER));
        assert_eq!(meta.finalizers, vec!["other/finalizer".to_string()]);

        // absent finalizer is a no-op
        assert!(!meta.remove_finalizer(crate::VIRTUALROUTER_DAEMON_FINALIZER));
    }
}
