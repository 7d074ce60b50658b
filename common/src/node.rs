use serde::{Deserialize, Serialize};

use crate::ObjectMeta;

/// Subset of the node object the daemon consumes: the annotations naming
/// this node's physical uplinks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl Node {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }
}
