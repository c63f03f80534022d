//! Cluster adapter
//!
//! Node-scoped Kubernetes operations: labels, cordon state, readiness,
//! deletion, and draining via the eviction API. Every operation takes an
//! `ignore_not_found` flag that maps a NotFound response to success — a node
//! may already be gone by the time a call reaches the API, because the cloud
//! side terminates instances independently.

use std::time::Duration;

use futures::future::join_all;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, PostParams};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::progress::{emit, EventSender};
use crate::retry::{retry_on_conflict, ConflictRetry};

/// Poll interval while waiting for an evicted pod to disappear
const POD_DELETION_POLL: Duration = Duration::from_secs(30);

/// Total wait for an evicted pod to disappear
const POD_DELETION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Flags controlling a node drain
#[derive(Debug, Clone, Copy)]
pub struct DrainFlags {
    /// Skip pods owned by a DaemonSet
    pub ignore_daemon_sets: bool,
    /// Fall back to a direct delete when eviction is rejected
    pub force: bool,
    /// Evict pods using local storage as well
    pub delete_local_data: bool,
    /// Map NotFound to success throughout the drain
    pub ignore_not_found: bool,
}

/// True when the error is a NotFound response from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

fn allow_not_found<T>(result: kube::Result<T>, ignore: bool) -> kube::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if ignore && is_not_found(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

/// A node is ready iff its `Ready` condition reports status `True`
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// Value of one label on a node object
pub fn label_of(node: &Node, key: &str) -> Option<String> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key).cloned())
}

/// DaemonSet ownership check: the first owner reference decides
pub fn is_daemon_set_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_deref()
        .and_then(|owners| owners.first())
        .map(|owner| owner.kind == "DaemonSet")
        .unwrap_or(false)
}

/// Client for node-scoped cluster operations
pub struct KubeClient {
    client: kube::Client,
    retry: ConflictRetry,
    selector_lock: Mutex<()>,
}

impl KubeClient {
    /// Build a client from the ambient kubeconfig / in-cluster environment
    pub async fn new() -> Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client (tests, embedding)
    pub fn with_client(client: kube::Client) -> Self {
        Self {
            client,
            retry: ConflictRetry::default(),
            selector_lock: Mutex::new(()),
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Fetch one node; `None` when absent and `ignore_not_found` is set
    pub async fn node(&self, node_name: &str, ignore_not_found: bool) -> Result<Option<Node>> {
        Ok(allow_not_found(self.nodes().get(node_name).await, ignore_not_found)?)
    }

    /// Nodes matching a label selector.
    ///
    /// Serialized with a mutex so list results cannot interleave with this
    /// process's own label writes.
    pub async fn nodes_by_label(
        &self,
        selector: &str,
        ignore_not_found: bool,
    ) -> Result<Vec<Node>> {
        let _guard = self.selector_lock.lock().await;
        let params = ListParams::default().labels(selector);
        let list = allow_not_found(self.nodes().list(&params).await, ignore_not_found)?;
        Ok(list.map(|l| l.items).unwrap_or_default())
    }

    /// Number of nodes matching a label selector
    pub async fn node_count_by_label(
        &self,
        selector: &str,
        ignore_not_found: bool,
    ) -> Result<usize> {
        Ok(self.nodes_by_label(selector, ignore_not_found).await?.len())
    }

    /// Set one label on a node, retrying write conflicts
    pub async fn add_label(
        &self,
        node_name: &str,
        key: &str,
        value: &str,
        ignore_not_found: bool,
    ) -> Result<()> {
        let api = self.nodes();
        retry_on_conflict(&self.retry, "add_label", || {
            let api = api.clone();
            async move {
                let Some(mut node) = allow_not_found(api.get(node_name).await, ignore_not_found)?
                else {
                    return Ok(());
                };
                let labels = node.metadata.labels.get_or_insert_with(Default::default);
                if labels.get(key).map(String::as_str) == Some(value) {
                    return Ok(());
                }
                labels.insert(key.to_string(), value.to_string());
                allow_not_found(
                    api.replace(node_name, &PostParams::default(), &node).await,
                    ignore_not_found,
                )?;
                Ok(())
            }
        })
        .await?;
        Ok(())
    }

    /// Remove one label from a node, retrying write conflicts
    pub async fn remove_label(
        &self,
        node_name: &str,
        key: &str,
        ignore_not_found: bool,
    ) -> Result<()> {
        let api = self.nodes();
        retry_on_conflict(&self.retry, "remove_label", || {
            let api = api.clone();
            async move {
                let Some(mut node) = allow_not_found(api.get(node_name).await, ignore_not_found)?
                else {
                    return Ok(());
                };
                if let Some(labels) = node.metadata.labels.as_mut() {
                    labels.remove(key);
                }
                allow_not_found(
                    api.replace(node_name, &PostParams::default(), &node).await,
                    ignore_not_found,
                )?;
                Ok(())
            }
        })
        .await?;
        Ok(())
    }

    /// Value of one label, when the node and label exist
    pub async fn label_value(
        &self,
        node_name: &str,
        key: &str,
        ignore_not_found: bool,
    ) -> Result<Option<String>> {
        let node = self.node(node_name, ignore_not_found).await?;
        Ok(node.and_then(|n| label_of(&n, key)))
    }

    /// Whether the node carries `key=value`. A missing node reads as false
    /// under `ignore_not_found`.
    pub async fn has_label(
        &self,
        node_name: &str,
        key: &str,
        value: &str,
        ignore_not_found: bool,
    ) -> Result<bool> {
        let _guard = self.selector_lock.lock().await;
        let node = allow_not_found(self.nodes().get(node_name).await, ignore_not_found)?;
        Ok(node
            .map(|n| label_of(&n, key).as_deref() == Some(value))
            .unwrap_or(false))
    }

    /// Mark a node unschedulable
    pub async fn cordon(&self, node_name: &str, ignore_not_found: bool) -> Result<()> {
        self.set_unschedulable(node_name, true, ignore_not_found).await
    }

    /// Mark a node schedulable again
    pub async fn uncordon(&self, node_name: &str, ignore_not_found: bool) -> Result<()> {
        self.set_unschedulable(node_name, false, ignore_not_found).await
    }

    async fn set_unschedulable(
        &self,
        node_name: &str,
        unschedulable: bool,
        ignore_not_found: bool,
    ) -> Result<()> {
        let api = self.nodes();
        retry_on_conflict(&self.retry, "cordon", || {
            let api = api.clone();
            async move {
                let Some(mut node) = allow_not_found(api.get(node_name).await, ignore_not_found)?
                else {
                    return Ok(());
                };
                node.spec.get_or_insert_with(Default::default).unschedulable =
                    Some(unschedulable);
                allow_not_found(
                    api.replace(node_name, &PostParams::default(), &node).await,
                    ignore_not_found,
                )?;
                Ok(())
            }
        })
        .await?;
        Ok(())
    }

    /// Readiness per [`node_is_ready`]. A missing node reads as not ready
    /// under `ignore_not_found`.
    pub async fn is_node_ready(&self, node_name: &str, ignore_not_found: bool) -> Result<bool> {
        let node = self.node(node_name, ignore_not_found).await?;
        Ok(node.map(|n| node_is_ready(&n)).unwrap_or(false))
    }

    /// Delete the node object
    pub async fn delete_node(&self, node_name: &str, ignore_not_found: bool) -> Result<()> {
        allow_not_found(
            self.nodes().delete(node_name, &DeleteParams::default()).await,
            ignore_not_found,
        )?;
        Ok(())
    }

    /// Evict every eligible pod off a node.
    ///
    /// Evictions run concurrently; one pod failing does not abort the
    /// others. Returns the accumulated failures — an empty list is success.
    pub async fn drain_node(
        &self,
        node_name: &str,
        flags: &DrainFlags,
        events: &EventSender,
    ) -> Vec<String> {
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = match allow_not_found(
            Api::<Pod>::all(self.client.clone()).list(&params).await,
            flags.ignore_not_found,
        ) {
            Ok(list) => list.map(|l| l.items).unwrap_or_default(),
            Err(err) => return vec![err.to_string()],
        };

        let evictions: Vec<_> = pods
            .iter()
            .filter(|&pod| !(flags.ignore_daemon_sets && is_daemon_set_pod(pod)))
            .map(|pod| self.evict_pod(pod, flags, events))
            .collect();

        debug!(node = %node_name, pods = evictions.len(), "evicting pods");
        join_all(evictions)
            .await
            .into_iter()
            .filter_map(|result| result.err())
            .collect()
    }

    /// Evict one pod, falling back to a direct delete when the eviction is
    /// rejected and `force` is set. After a successful eviction, waits for
    /// the pod object with the original UID to disappear.
    pub async fn evict_pod(
        &self,
        pod: &Pod,
        flags: &DrainFlags,
        events: &EventSender,
    ) -> std::result::Result<(), String> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let api = self.pods(&namespace);

        emit(events, format!("Evicting pod {namespace}/{name}")).await;
        let evicted = allow_not_found(
            api.evict(&name, &EvictParams::default()).await,
            flags.ignore_not_found,
        );

        match evicted {
            Ok(_) => self.wait_for_pod_deletion(&api, &name, &uid).await,
            Err(err) => {
                // Typically a PodDisruptionBudget rejecting the eviction
                emit(
                    events,
                    format!("Unable to gracefully evict pod {name}: {err}"),
                )
                .await;
                if flags.force {
                    emit(events, format!("Force deleting pod {name}")).await;
                    warn!(pod = %name, namespace = %namespace, "eviction rejected, force deleting");
                    self.delete_pod(&name, &namespace, flags.ignore_not_found)
                        .await
                        .map_err(|e| e.to_string())
                } else {
                    Err(err.to_string())
                }
            }
        }
    }

    async fn wait_for_pod_deletion(
        &self,
        api: &Api<Pod>,
        name: &str,
        uid: &str,
    ) -> std::result::Result<(), String> {
        let deadline = tokio::time::Instant::now() + POD_DELETION_TIMEOUT;

        loop {
            match api.get(name).await {
                // A replacement pod can reuse the name; only the original
                // UID disappearing counts.
                Ok(pod) if pod.metadata.uid.as_deref() == Some(uid) => {}
                Ok(_) => return Ok(()),
                Err(err) if is_not_found(&err) => return Ok(()),
                Err(err) => return Err(err.to_string()),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "pod {name} still present after {}s",
                    POD_DELETION_TIMEOUT.as_secs()
                ));
            }
            tokio::time::sleep(POD_DELETION_POLL).await;
        }
    }

    /// Delete one pod directly, bypassing disruption budgets
    pub async fn delete_pod(
        &self,
        name: &str,
        namespace: &str,
        ignore_not_found: bool,
    ) -> Result<()> {
        info!(pod = %name, namespace = %namespace, "deleting pod");
        allow_not_found(
            self.pods(namespace).delete(name, &DeleteParams::default()).await,
            ignore_not_found,
        )?;
        Ok(())
    }

    /// Raw client handle for adjacent consumers (preflight checks)
    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn node_with_conditions(conditions: Vec<NodeCondition>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_ready_true() {
        let node = node_with_conditions(vec![
            condition("MemoryPressure", "False"),
            condition("Ready", "True"),
        ]);
        assert!(node_is_ready(&node));
    }

    #[test]
    fn test_node_ready_false_and_unknown() {
        assert!(!node_is_ready(&node_with_conditions(vec![condition(
            "Ready", "False"
        )])));
        assert!(!node_is_ready(&node_with_conditions(vec![condition(
            "Ready", "Unknown"
        )])));
    }

    #[test]
    fn test_node_without_conditions_not_ready() {
        assert!(!node_is_ready(&node_with_conditions(vec![])));
        assert!(!node_is_ready(&Node::default()));
    }

    fn pod_with_owner(kind: Option<&str>) -> Pod {
        let mut pod = Pod::default();
        if let Some(kind) = kind {
            pod.metadata.owner_references = Some(vec![OwnerReference {
                kind: kind.to_string(),
                ..Default::default()
            }]);
        }
        pod
    }

    #[test]
    fn test_daemon_set_detection_uses_first_owner() {
        assert!(is_daemon_set_pod(&pod_with_owner(Some("DaemonSet"))));
        assert!(!is_daemon_set_pod(&pod_with_owner(Some("ReplicaSet"))));
        assert!(!is_daemon_set_pod(&pod_with_owner(None)));
    }

    #[test]
    fn test_daemon_set_detection_ignores_second_owner() {
        let mut pod = pod_with_owner(Some("ReplicaSet"));
        pod.metadata
            .owner_references
            .as_mut()
            .unwrap()
            .push(OwnerReference {
                kind: "DaemonSet".to_string(),
                ..Default::default()
            });
        assert!(!is_daemon_set_pod(&pod));
    }

    fn node_with_labels(labels: &[(&str, &str)]) -> Node {
        let mut node = Node::default();
        node.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        node
    }

    #[test]
    fn test_label_of_reads_value() {
        let node = node_with_labels(&[("dockyard.io/node-state", "old")]);
        assert_eq!(
            label_of(&node, "dockyard.io/node-state").as_deref(),
            Some("old")
        );
    }

    #[test]
    fn test_label_of_missing_key_or_labels() {
        let node = node_with_labels(&[("other", "value")]);
        assert_eq!(label_of(&node, "dockyard.io/node-state"), None);
        assert_eq!(label_of(&Node::default(), "dockyard.io/node-state"), None);
    }

    #[test]
    fn test_has_label_comparison() {
        // has_label reduces to this comparison over the fetched node
        let node = node_with_labels(&[("dockyard.io/node-state", "new")]);
        assert!(label_of(&node, "dockyard.io/node-state").as_deref() == Some("new"));
        assert!(label_of(&node, "dockyard.io/node-state").as_deref() != Some("old"));
        assert!(label_of(&Node::default(), "dockyard.io/node-state").as_deref() != Some("new"));
    }

    fn not_found_err() -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        })
    }

    #[test]
    fn test_allow_not_found_modality() {
        let absorbed: kube::Result<Option<u32>> = allow_not_found(Err(not_found_err()), true);
        assert!(matches!(absorbed, Ok(None)));

        let surfaced: kube::Result<Option<u32>> = allow_not_found(Err(not_found_err()), false);
        assert!(surfaced.is_err());

        let passthrough = allow_not_found(Ok(5), true);
        assert!(matches!(passthrough, Ok(Some(5))));
    }
}
