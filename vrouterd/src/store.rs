use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{object_key, Node, Pod, VirtualRouter, APP_LABEL_KEY, VIRTUALROUTER_LABEL};
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use log::{debug, error, info, warn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::queue::{WorkItem, WorkQueue};

const POD_PREFIX: &str = "/registry/pods/";
const VR_PREFIX: &str = "/registry/virtualrouters/";
const NODE_PREFIX: &str = "/registry/nodes/";
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Orchestrator client plus informer-backed local caches. Watch tasks keep
/// the caches current and translate object churn into work-queue keys; the
/// reconciler only ever reads the caches.
pub struct ClusterStore {
    client: Arc<RwLock<Client>>,
    node_name: String,
    pods: RwLock<HashMap<String, Pod>>,
    routers: RwLock<HashMap<String, VirtualRouter>>,
}

impl ClusterStore {
    pub async fn connect(endpoints: &[String], node_name: &str) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            node_name: node_name.to_string(),
            pods: RwLock::new(HashMap::new()),
            routers: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get_pod(&self, key: &str) -> Option<Pod> {
        self.pods.read().await.get(key).cloned()
    }

    pub async fn get_virtual_router(&self, key: &str) -> Option<VirtualRouter> {
        self.routers.read().await.get(key).cloned()
    }

    fn tracks_pod(&self, pod: &Pod) -> bool {
        is_tracked_pod(pod, &self.node_name)
    }

    /// Re-enqueues every cached object. Run periodically as a safety net
    /// against missed events.
    pub async fn resync(&self, queue: &WorkQueue) {
        for key in self.pods.read().await.keys() {
            queue.add(WorkItem::Pod(key.clone()));
        }
        for key in self.routers.read().await.keys() {
            queue.add(WorkItem::VirtualRouter(key.clone()));
        }
    }

    /// One-shot read of this node's object, for the uplink annotations.
    pub async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let etcd_key = format!("{NODE_PREFIX}{name}");
        let mut client = self.client.write().await;
        let resp = client.get(etcd_key.as_str(), None).await?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        match serde_yaml::from_slice(kv.value()) {
            Ok(node) => Ok(Some(node)),
            Err(e) => {
                warn!("stored node {name} is unparsable: {e}");
                Ok(None)
            }
        }
    }

    /// Drops a finalizer from the stored pod object. Reads the
    /// authoritative copy, not the cache; a pod that is already gone or no
    /// longer carries the finalizer is success.
    pub async fn remove_pod_finalizer(&self, key: &str, finalizer: &str) -> Result<()> {
        let etcd_key = format!("{POD_PREFIX}{key}");
        let mut client = self.client.write().await;

        let resp = client.get(etcd_key.as_str(), None).await?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(());
        };
        let mut pod: Pod = match serde_yaml::from_slice(kv.value()) {
            Ok(pod) => pod,
            Err(e) => {
                warn!("stored pod {key} is unparsable while removing finalizer: {e}");
                return Ok(());
            }
        };
        if !pod.metadata.remove_finalizer(finalizer) {
            return Ok(());
        }

        let yaml = serde_yaml::to_string(&pod)
            .map_err(|e| crate::error::DaemonError::Programming(e.to_string()))?;
        client
            .put(etcd_key.as_str(), yaml, Some(PutOptions::new()))
            .await?;
        drop(client);

        self.pods.write().await.insert(key.to_string(), pod);
        info!("removed finalizer {finalizer} from pod {key}");
        Ok(())
    }

    /// List+watch loop for workload pods. Reconnects with a delay until
    /// cancelled.
    pub async fn run_pod_informer(
        self: Arc<Self>,
        queue: Arc<WorkQueue>,
        cancel: CancellationToken,
    ) {
        loop {
            match self.pod_list_and_watch(&queue, &cancel).await {
                Ok(()) => return,
                Err(e) => error!("pod watch failed: {e}; reconnecting"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
            }
        }
    }

    async fn pod_list_and_watch(
        &self,
        queue: &WorkQueue,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (snapshot, revision) = self.snapshot(POD_PREFIX).await?;

        let mut fresh = HashMap::new();
        for (key, value) in snapshot {
            match serde_yaml::from_str::<Pod>(&value) {
                Ok(pod) if self.tracks_pod(&pod) => {
                    fresh.insert(key, pod);
                }
                Ok(_) => {}
                Err(e) => warn!("skipping unparsable pod {key}: {e}"),
            }
        }

        {
            let mut pods = self.pods.write().await;
            // pods that vanished while we were not watching still need a
            // detach pass
            for key in pods.keys() {
                if !fresh.contains_key(key) {
                    queue.add(WorkItem::Pod(key.clone()));
                }
            }
            for key in fresh.keys() {
                queue.add(WorkItem::Pod(key.clone()));
            }
            *pods = fresh;
        }
        info!(
            "pod cache primed at revision {revision} ({} tracked)",
            self.pods.read().await.len()
        );

        let (mut watcher, mut stream) = {
            let mut client = self.client.write().await;
            client
                .watch(
                    POD_PREFIX,
                    Some(
                        WatchOptions::new()
                            .with_prefix()
                            .with_start_revision(revision + 1),
                    ),
                )
                .await?
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = watcher.cancel().await;
                    return Ok(());
                }
                msg = stream.message() => {
                    let Some(resp) = msg? else {
                        return Err(crate::error::DaemonError::Transient(
                            "pod watch stream closed".to_string(),
                        ));
                    };
                    for event in resp.events() {
                        self.handle_pod_event(event, queue).await;
                    }
                }
            }
        }
    }

    async fn handle_pod_event(&self, event: &etcd_client::Event, queue: &WorkQueue) {
        let Some(kv) = event.kv() else { return };
        let Some(key) = object_key_from_etcd(kv.key(), POD_PREFIX) else {
            return;
        };

        match event.event_type() {
            EventType::Put => match serde_yaml::from_slice::<Pod>(kv.value()) {
                Ok(pod) if self.tracks_pod(&pod) => {
                    debug!("pod event: {key}");
                    self.pods.write().await.insert(key.clone(), pod);
                    queue.add(WorkItem::Pod(key));
                }
                Ok(_) => {
                    // moved off this node or lost the label
                    if self.pods.write().await.remove(&key).is_some() {
                        queue.add(WorkItem::Pod(key));
                    }
                }
                Err(e) => warn!("ignoring unparsable pod {key}: {e}"),
            },
            EventType::Delete => {
                if self.pods.write().await.remove(&key).is_some() {
                    queue.add(WorkItem::Pod(key));
                }
            }
        }
    }

    /// List+watch loop for VirtualRouter objects, cluster-wide.
    pub async fn run_router_informer(
        self: Arc<Self>,
        queue: Arc<WorkQueue>,
        cancel: CancellationToken,
    ) {
        loop {
            match self.router_list_and_watch(&queue, &cancel).await {
                Ok(()) => return,
                Err(e) => error!("virtualrouter watch failed: {e}; reconnecting"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
            }
        }
    }

    async fn router_list_and_watch(
        &self,
        queue: &WorkQueue,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (snapshot, revision) = self.snapshot(VR_PREFIX).await?;

        let mut fresh = HashMap::new();
        for (key, value) in snapshot {
            match serde_yaml::from_str::<VirtualRouter>(&value) {
                Ok(vr) => {
                    fresh.insert(key, vr);
                }
                Err(e) => warn!("skipping unparsable virtualrouter {key}: {e}"),
            }
        }
        {
            let mut routers = self.routers.write().await;
            for key in fresh.keys() {
                queue.add(WorkItem::VirtualRouter(key.clone()));
            }
            *routers = fresh;
        }
        info!(
            "virtualrouter cache primed at revision {revision} ({} objects)",
            self.routers.read().await.len()
        );

        let (mut watcher, mut stream) = {
            let mut client = self.client.write().await;
            client
                .watch(
                    VR_PREFIX,
                    Some(
                        WatchOptions::new()
                            .with_prefix()
                            .with_start_revision(revision + 1),
                    ),
                )
                .await?
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = watcher.cancel().await;
                    return Ok(());
                }
                msg = stream.message() => {
                    let Some(resp) = msg? else {
                        return Err(crate::error::DaemonError::Transient(
                            "virtualrouter watch stream closed".to_string(),
                        ));
                    };
                    for event in resp.events() {
                        self.handle_router_event(event, queue).await;
                    }
                }
            }
        }
    }

    async fn handle_router_event(&self, event: &etcd_client::Event, queue: &WorkQueue) {
        let Some(kv) = event.kv() else { return };
        let Some(key) = object_key_from_etcd(kv.key(), VR_PREFIX) else {
            return;
        };

        match event.event_type() {
            EventType::Put => match serde_yaml::from_slice::<VirtualRouter>(kv.value()) {
                Ok(vr) => {
                    debug!("virtualrouter event: {key}");
                    self.routers.write().await.insert(key.clone(), vr);
                    queue.add(WorkItem::VirtualRouter(key));
                }
                Err(e) => warn!("ignoring unparsable virtualrouter {key}: {e}"),
            },
            EventType::Delete => {
                self.routers.write().await.remove(&key);
                queue.add(WorkItem::VirtualRouter(key));
            }
        }
    }

    /// Prefix snapshot plus the revision it was taken at, so the watch can
    /// start exactly where the list left off.
    async fn snapshot(&self, prefix: &str) -> Result<(Vec<(String, String)>, i64)> {
        let mut client = self.client.write().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let items = resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = object_key_from_etcd(kv.key(), prefix)?;
                Some((key, String::from_utf8_lossy(kv.value()).to_string()))
            })
            .collect();
        Ok((items, revision))
    }
}

/// Only pods scheduled to the given node and labeled as virtual-router
/// workloads are cached and reconciled.
fn is_tracked_pod(pod: &Pod, node_name: &str) -> bool {
    pod.spec.node_name.as_deref() == Some(node_name)
        && pod.metadata.labels.get(APP_LABEL_KEY).map(String::as_str) == Some(VIRTUALROUTER_LABEL)
}

fn object_key_from_etcd(raw: &[u8], prefix: &str) -> Option<String> {
    let key = String::from_utf8_lossy(raw);
    let rest = key.strip_prefix(prefix)?;
    let (namespace, name) = common::split_object_key(rest)?;
    Some(object_key(namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ObjectMeta;

    #[test]
    fn test_object_key_from_etcd() {
        assert_eq!(
            object_key_from_etcd(b"/registry/pods/default/p1", POD_PREFIX),
            Some("default/p1".to_string())
        );
        assert_eq!(object_key_from_etcd(b"/registry/pods/broken", POD_PREFIX), None);
        assert_eq!(
            object_key_from_etcd(b"/registry/virtualrouters/default/r1", POD_PREFIX),
            None
        );
    }

    #[test]
    fn test_pod_node_and_label_filter() {
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: "p1".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        pod.spec.node_name = Some("node-1".to_string());
        pod.metadata
            .labels
            .insert(APP_LABEL_KEY.to_string(), VIRTUALROUTER_LABEL.to_string());

        assert!(is_tracked_pod(&pod, "node-1"));
        assert!(!is_tracked_pod(&pod, "node-2"));

        let mut unlabeled = pod.clone();
        unlabeled.metadata.labels.clear();
        assert!(!is_tracked_pod(&unlabeled, "node-1"));

        let mut unscheduled = pod.clone();
        unscheduled.spec.node_name = None;
        assert!(!is_tracked_pod(&unscheduled, "node-1"));
    }
}
