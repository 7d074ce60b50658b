use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use common::{
    object_key, VirtualRouter, VirtualRouterSpec, ANNOTATION_CR_NAME, ANNOTATION_CR_NAMESPACE,
    VIRTUALROUTER_DAEMON_FINALIZER,
};
use futures::FutureExt;
use libcrio::CrioClient;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::binding::{RouterBinding, Side, DEFAULT_FWMARK, DEFAULT_TABLE};
use crate::diff::{diff, SyncAction};
use crate::error::{DaemonError, Result};
use crate::queue::{WorkItem, WorkQueue};
use crate::store::ClusterStore;

/// Reconciler-private view of one attached workload.
#[derive(Debug, Clone)]
pub struct WorkloadRecord {
    pub pod_key: String,
    pub container_id: String,
    pub pid: i32,
    pub last_applied: Option<VirtualRouterSpec>,
}

/// Cached pod → container identity resolution.
#[derive(Debug, Clone)]
struct ContainerBinding {
    container_name: String,
    container_id: String,
    pid: i32,
}

/// All mutable reconciler state behind one lock; with at-most-one in-flight
/// work item per key, this also serializes the kernel-facing apply path.
#[derive(Default)]
struct ReconcilerState {
    /// Keyed by workload (container / VirtualRouter) name.
    records: HashMap<String, WorkloadRecord>,
    /// Keyed by pod `namespace/name`.
    bindings: HashMap<String, ContainerBinding>,
    /// VLAN id → containers currently tagged with it.
    vlan_index: HashMap<u16, HashSet<String>>,
}

fn vlan_index_add(index: &mut HashMap<u16, HashSet<String>>, vlan: u16, container: &str) {
    if vlan == 0 {
        return;
    }
    index.entry(vlan).or_default().insert(container.to_string());
}

fn vlan_index_remove(index: &mut HashMap<u16, HashSet<String>>, vlan: u16, container: &str) {
    if vlan == 0 {
        return;
    }
    if let Some(users) = index.get_mut(&vlan) {
        users.remove(container);
        if users.is_empty() {
            index.remove(&vlan);
        }
    }
}

fn vlan_in_use_by_others(
    index: &HashMap<u16, HashSet<String>>,
    vlan: u16,
    container: &str,
) -> bool {
    if vlan == 0 {
        return false;
    }
    index
        .get(&vlan)
        .is_some_and(|users| users.iter().any(|c| c != container))
}

pub struct Reconciler {
    store: Arc<ClusterStore>,
    crio: CrioClient,
    binding: RouterBinding,
    state: Mutex<ReconcilerState>,
}

impl Reconciler {
    pub fn new(store: Arc<ClusterStore>, crio: CrioClient, binding: RouterBinding) -> Self {
        Self {
            store,
            crio,
            binding,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    /// Drains the queue until shutdown. Worker panics are contained and
    /// treated as a transient failure of the item that caused them.
    pub async fn run_worker(self: Arc<Self>, queue: Arc<WorkQueue>) {
        while let Some(item) = queue.get().await {
            let outcome = AssertUnwindSafe(self.reconcile(&item)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {
                    debug!("synced {item}");
                    queue.forget(&item);
                }
                Ok(Err(e)) if e.retriable() => {
                    warn!("reconciling {item} failed: {e}; requeueing");
                    queue.add_rate_limited(item.clone());
                }
                Ok(Err(e)) => {
                    error!("reconciling {item} failed permanently: {e}");
                    queue.forget(&item);
                }
                Err(_) => {
                    error!("worker panicked while reconciling {item}; requeueing");
                    queue.add_rate_limited(item.clone());
                }
            }
            queue.done(&item);
        }
    }

    async fn reconcile(&self, item: &WorkItem) -> Result<()> {
        match item {
            WorkItem::Pod(key) => self.reconcile_pod(key).await,
            WorkItem::VirtualRouter(key) => self.reconcile_virtual_router(key).await,
        }
    }

    async fn reconcile_pod(&self, key: &str) -> Result<()> {
        let Some(pod) = self.store.get_pod(key).await else {
            // the pod vanished from the cache; tear down whatever we hold
            return self.detach_pod(key).await;
        };

        if pod.is_deleting() {
            self.detach_pod(key).await?;
            self.store
                .remove_pod_finalizer(key, VIRTUALROUTER_DAEMON_FINALIZER)
                .await?;
            return Ok(());
        }

        if !pod.is_ready() {
            debug!("pod {key} not ready yet");
            return Ok(());
        }

        let cr_name = pod
            .metadata
            .annotations
            .get(ANNOTATION_CR_NAME)
            .ok_or_else(|| {
                DaemonError::Config(format!("pod {key} lacks the {ANNOTATION_CR_NAME} annotation"))
            })?;
        let cr_namespace = pod
            .metadata
            .annotations
            .get(ANNOTATION_CR_NAMESPACE)
            .ok_or_else(|| {
                DaemonError::Config(format!(
                    "pod {key} lacks the {ANNOTATION_CR_NAMESPACE} annotation"
                ))
            })?;

        let vr_key = object_key(cr_namespace, cr_name);
        let Some(vr) = self.store.get_virtual_router(&vr_key).await else {
            debug!("virtualrouter {vr_key} not observed yet; waiting");
            return Ok(());
        };

        self.attach_pod(key, &vr).await
    }

    async fn reconcile_virtual_router(&self, key: &str) -> Result<()> {
        let Some(vr) = self.store.get_virtual_router(key).await else {
            return Ok(());
        };
        // the workload container inside the pod carries the router's name
        self.sync(&vr.metadata.name, vr.spec.clone()).await
    }

    /// Resolves the pod's container identity, programs both veth paths on
    /// first contact, and hands over to the diff-driven sync.
    async fn attach_pod(&self, pod_key: &str, vr: &VirtualRouter) -> Result<()> {
        let container_name = vr.metadata.name.clone();

        let cached = self.state.lock().await.bindings.get(pod_key).cloned();
        let binding = match cached {
            Some(binding) => binding,
            None => {
                let container_id = self
                    .crio
                    .resolve_running_container(&container_name)
                    .await?
                    .ok_or_else(|| {
                        DaemonError::Transient(format!(
                            "no running container named {container_name}"
                        ))
                    })?;
                let pid = self.crio.container_pid(&container_id).await?.ok_or_else(|| {
                    DaemonError::Transient(format!("container {container_id} reports no pid"))
                })?;
                let binding = ContainerBinding {
                    container_name: container_name.clone(),
                    container_id,
                    pid,
                };
                self.state
                    .lock()
                    .await
                    .bindings
                    .insert(pod_key.to_string(), binding.clone());
                binding
            }
        };

        let attached = self.state.lock().await.records.contains_key(&container_name);
        if attached {
            return match self.sync(&container_name, vr.spec.clone()).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // identity may have gone stale; re-resolve on retry
                    self.state.lock().await.bindings.remove(pod_key);
                    Err(e)
                }
            };
        }

        self.state.lock().await.records.insert(
            container_name.clone(),
            WorkloadRecord {
                pod_key: pod_key.to_string(),
                container_id: binding.container_id.clone(),
                pid: binding.pid,
                last_applied: None,
            },
        );

        let veths = async {
            self.binding
                .attach_veth(&binding.container_id, binding.pid, Side::Internal)
                .await?;
            self.binding
                .attach_veth(&binding.container_id, binding.pid, Side::External)
                .await
        }
        .await;
        if let Err(e) = veths {
            let mut state = self.state.lock().await;
            state.records.remove(&container_name);
            state.bindings.remove(pod_key);
            return Err(e);
        }
        info!("attached pod {pod_key} (container {})", binding.container_id);

        match self.sync(&container_name, vr.spec.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.lock().await.bindings.remove(pod_key);
                Err(e)
            }
        }
    }

    /// The diff engine's effectful half: applies only what changed, in
    /// fixed order, and records the new spec only after everything took.
    async fn sync(&self, container_name: &str, spec: VirtualRouterSpec) -> Result<()> {
        let mut state = self.state.lock().await;

        let Some(record) = state.records.get(container_name) else {
            debug!("no binding for {container_name}; pod-side sync will follow");
            return Ok(());
        };
        let pid = record.pid;
        let container_id = record.container_id.clone();
        let first_time = record.last_applied.is_none();
        let actions = diff(record.last_applied.as_ref(), &spec);

        if first_time {
            self.binding
                .install_fwmark_rule(pid, DEFAULT_FWMARK, DEFAULT_TABLE)
                .await?;
        }

        for action in &actions {
            match action {
                SyncAction::SetVlan { new_vlan, old_vlan } => {
                    let old_in_use =
                        vlan_in_use_by_others(&state.vlan_index, *old_vlan, container_name);
                    self.binding
                        .set_vlan(&container_id, *new_vlan, *old_vlan, old_in_use)
                        .await?;
                    vlan_index_remove(&mut state.vlan_index, *old_vlan, container_name);
                    vlan_index_add(&mut state.vlan_index, *new_vlan, container_name);
                }
                SyncAction::AssignInternalAddress { ip, netmask } => {
                    self.binding
                        .assign_address(pid, Side::Internal, *ip, *netmask)
                        .await?;
                    self.binding
                        .mirror_routes_to_table(pid, Side::Internal.container_ifname(), DEFAULT_TABLE)
                        .await?;
                }
                SyncAction::AssignExternalAddress { ip, netmask } => {
                    self.binding
                        .assign_address(pid, Side::External, *ip, *netmask)
                        .await?;
                    self.binding
                        .mirror_routes_to_table(pid, Side::External.container_ifname(), DEFAULT_TABLE)
                        .await?;
                }
                SyncAction::SetDefaultGateway { gateway } => {
                    self.binding
                        .set_default_gateway(pid, *gateway, DEFAULT_TABLE)
                        .await?;
                }
            }
        }

        if !actions.is_empty() {
            info!("synced {container_name}: {} change(s) applied", actions.len());
        }
        if let Some(record) = state.records.get_mut(container_name) {
            record.last_applied = Some(spec);
        }
        Ok(())
    }

    /// Unwinds a workload: VLAN entries, both veths, then the record and
    /// binding. Safe to call for pods that never attached.
    async fn detach_pod(&self, pod_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let container_name = state
            .bindings
            .get(pod_key)
            .map(|b| b.container_name.clone())
            .or_else(|| {
                state
                    .records
                    .iter()
                    .find(|(_, r)| r.pod_key == pod_key)
                    .map(|(name, _)| name.clone())
            });
        let Some(container_name) = container_name else {
            return Ok(());
        };

        let Some(record) = state.records.get(&container_name).cloned() else {
            state.bindings.remove(pod_key);
            return Ok(());
        };

        if let Some(last) = &record.last_applied {
            if last.vlan_number != 0 {
                let still_in_use =
                    vlan_in_use_by_others(&state.vlan_index, last.vlan_number, &container_name);
                self.binding
                    .set_vlan(&record.container_id, 0, last.vlan_number, still_in_use)
                    .await?;
                vlan_index_remove(&mut state.vlan_index, last.vlan_number, &container_name);
            }
        }

        self.binding
            .clear_veth(&record.container_id, Side::Internal)
            .await?;
        self.binding
            .clear_veth(&record.container_id, Side::External)
            .await?;

        state.records.remove(&container_name);
        state.bindings.remove(pod_key);
        info!("detached {container_name} (pod {pod_key})");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_index_tracks_users() {
        let mut index = HashMap::new();

        vlan_index_add(&mut index, 10, "router-a");
        vlan_index_add(&mut index, 10, "router-b");
        vlan_index_add(&mut index, 20, "router-c");

        assert!(vlan_in_use_by_others(&index, 10, "router-a"));
        assert!(!vlan_in_use_by_others(&index, 20, "router-c"));

        vlan_index_remove(&mut index, 10, "router-b");
        assert!(!vlan_in_use_by_others(&index, 10, "router-a"));

        vlan_index_remove(&mut index, 10, "router-a");
        assert!(!index.contains_key(&10));
    }

    #[test]
    fn test_vlan_zero_is_never_indexed() {
        let mut index = HashMap::new();
        vlan_index_add(&mut index, 0, "router-a");
        assert!(index.is_empty());
        assert!(!vlan_in_use_by_others(&index, 0, "router-a"));
        vlan_index_remove(&mut index, 0, "router-a");
    }

    #[test]
    fn test_vlan_membership_is_exclusive_per_container() {
        let mut index = HashMap::new();
        vlan_index_add(&mut index, 10, "router-a");
        // retag: remove from old vlan before adding to the new one
        vlan_index_remove(&mut index, 10, "router-a");
        vlan_index_add(&mut index, 20, "router-a");

        assert!(!index.contains_key(&10));
        assert_eq!(
            index.get(&20).map(|users| users.contains("router-a")),
            Some(true)
        );
    }
}
