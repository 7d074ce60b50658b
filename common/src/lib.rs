pub mod meta;
pub mod node;
pub mod pod;
pub mod router;

pub use meta::ObjectMeta;
pub use node::Node;
pub use pod::{Pod, PodCondition, PodSpec, PodStatus};
pub use router::{VirtualRouter, VirtualRouterSpec};

/// Label every virtual-router workload pod carries (`app=virtualrouter`).
pub const APP_LABEL_KEY: &str = "app";
pub const VIRTUALROUTER_LABEL: &str = "virtualrouter";

/// Pod annotations pointing at the VirtualRouter object backing the workload.
pub const ANNOTATION_CR_NAME: &str = "customresourceName";
pub const ANNOTATION_CR_NAMESPACE: &str = "customresourceNamespace";

/// Node annotations naming the physical uplinks on each node.
pub const ANNOTATION_INTERNAL_INTERFACE: &str = "internalInterface";
pub const ANNOTATION_EXTERNAL_INTERFACE: &str = "externalInterface";

/// Finalizer held by the daemon while a pod has kernel state programmed.
pub const VIRTUALROUTER_DAEMON_FINALIZER: &str = "networkcontroller.io/virtualrouter-daemon";

/// Builds the `namespace/name` key objects are addressed by.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Splits a `namespace/name` key. Keys without a namespace are rejected.
pub fn split_object_key(key: &str) -> Option<(&str, &str)> {
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_round_trip() {
        let key = object_key("default", "router-a");
        assert_eq!(key, "default/router-a");
        assert_eq!(split_object_key(&key), Some(("default", "router-a")));
    }

    #[test]
    fn test_split_object_key_rejects_malformed() {
        assert_eq!(split_object_key("no-namespace"), None);
        assert_eq!(split_object_key("/name-only"), None);
        assert_eq!(split_object_key("namespace-only/"), None);
    }
}
