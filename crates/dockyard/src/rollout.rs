//! Rollout orchestrator
//!
//! A stateful, resumable, batched control loop that replaces the old
//! instances of one ASG with fresh ones:
//!
//! ```text
//! pre-rollout                    batched loop                 post-rollout
//!     │                              │                             │
//!     ├─ label old/new nodes         ├─ pick batchSize old nodes   ├─ strip labels
//!     ├─ snapshot capacity in tags   ├─ per node, concurrently:    ├─ uncordon
//!     ├─ cordon everything           │    wait new instance        ├─ restore min/max
//!     └─ enable scale-in protection  │    wait node Ready          │  from tags, drop them
//!                                    │    label new, drain old     └─ clear instance
//!                                    │    delete node, terminate       protection
//!                                    └─ next batch after a pause
//! ```
//!
//! All rollout state lives in ASG tags and node labels, so an interrupted
//! run resumes from what the cloud remembers: pre-rollout only writes the
//! capacity tags when absent, and the loop only ever selects nodes still
//! labelled `old`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::asg::AsgClient;
use crate::bridge::NodeBridge;
use crate::config::RolloutConfig;
use crate::error::{Result, RolloutError};
use crate::kube::{DrainFlags, KubeClient};
use crate::progress::{emit, EventSender, ProgressSender, RolloutProgress};

/// Namespace for every tag and label dockyard persists
pub const STATE_NAMESPACE: &str = "dockyard.io";

/// Node label carrying a node's role in the current rollout
pub const NODE_STATE_LABEL: &str = "dockyard.io/node-state";

/// Tag holding the pre-rollout minimum capacity
pub const TAG_MIN: &str = "dockyard.io/min";

/// Tag holding the pre-rollout maximum capacity
pub const TAG_MAX: &str = "dockyard.io/max";

/// Tag holding the pre-rollout desired capacity
pub const TAG_DESIRED: &str = "dockyard.io/desired";

/// Settle pause before clearing per-instance protection at post-rollout
const POST_ROLLOUT_SETTLE: Duration = Duration::from_secs(60);

/// A node's role in the current rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Running the previous launch specification; eligible for draining
    Old,
    /// Running the current launch specification; never drained or terminated
    New,
    /// Drained, awaiting node deletion and instance termination
    Drained,
}

impl NodeState {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Old => "old",
            NodeState::New => "new",
            NodeState::Drained => "drained",
        }
    }

    /// Label selector matching nodes in this state
    pub fn selector(&self) -> String {
        format!("{NODE_STATE_LABEL}={}", self.as_str())
    }
}

/// Number of full batches for `old_count` old instances.
///
/// Integer division: a remainder smaller than the batch is not processed in
/// this run and stays labelled `old` for a later one.
pub fn batch_steps(old_count: usize, batch_size: usize) -> usize {
    old_count / batch_size
}

/// First `batch_size` nodes, or nothing when fewer remain
pub fn take_batch(mut nodes: Vec<String>, batch_size: usize) -> Vec<String> {
    if nodes.len() < batch_size {
        return Vec::new();
    }
    nodes.truncate(batch_size);
    nodes
}

/// Capacity raise forcing `batch` replacements to be provisioned up front:
/// min and desired move to `desired + batch`, max grows only when the new
/// desired would exceed it.
pub fn raised_capacity(desired: i32, max: i32, batch: i32) -> (i32, Option<i32>) {
    let target = desired + batch;
    let new_max = (target > max).then_some(max + batch);
    (target, new_max)
}

/// Initial progress record for a rollout over `old_count` old instances
pub fn progress_totals(old_count: usize, batch_size: usize) -> RolloutProgress {
    RolloutProgress {
        steps_size: batch_size as u32,
        steps_done: 0,
        // +2 for the pre- and post-rollout steps
        total_size: old_count as u32 + 2,
    }
}

/// Orchestrates the rolling replacement of one ASG at a time
pub struct AsgRollout {
    asg: Arc<AsgClient>,
    kube: Arc<KubeClient>,
    bridge: Arc<NodeBridge>,
    config: RolloutConfig,
    progress: Mutex<RolloutProgress>,
}

impl AsgRollout {
    /// Wire an orchestrator over the two adapters
    pub fn new(asg: Arc<AsgClient>, kube: Arc<KubeClient>, config: RolloutConfig) -> Self {
        let bridge = Arc::new(NodeBridge::new(
            Arc::clone(&asg),
            Arc::clone(&kube),
            config.period_wait.new_node_asg_register(),
        ));
        Self {
            asg,
            kube,
            bridge,
            config,
            progress: Mutex::new(RolloutProgress::default()),
        }
    }

    /// The bridge used for instance/node translation
    pub fn bridge(&self) -> &NodeBridge {
        &self.bridge
    }

    fn drain_flags(&self) -> DrainFlags {
        DrainFlags {
            ignore_daemon_sets: true,
            force: self.config.force_delete_pods,
            delete_local_data: true,
            ignore_not_found: self.config.ignore_not_found,
        }
    }

    async fn emit_progress(&self, progress: &ProgressSender, steps_done: u32) {
        let snapshot = {
            let mut current = self.progress.lock().expect("progress lock");
            current.steps_done = steps_done;
            *current
        };
        let _ = progress.send(snapshot).await;
    }

    /// True once any node carries an `old` or `new` rollout label
    pub async fn upgrade_started(&self) -> Result<bool> {
        let inf = self.config.ignore_not_found;
        let old = self
            .kube
            .node_count_by_label(&NodeState::Old.selector(), inf)
            .await?;
        let new = self
            .kube
            .node_count_by_label(&NodeState::New.selector(), inf)
            .await?;
        Ok(old + new > 0)
    }

    /// True once no node carries the `old` label
    pub async fn rollout_completed(&self) -> Result<bool> {
        let old = self
            .kube
            .node_count_by_label(&NodeState::Old.selector(), self.config.ignore_not_found)
            .await?;
        Ok(old == 0)
    }

    /// Up to `batch_size` nodes still labelled `old`.
    ///
    /// Enumeration order is the server's. Returns nothing when fewer than a
    /// full batch remains.
    pub async fn nodes_to_drain(&self, batch_size: usize) -> Result<Vec<String>> {
        let nodes = self
            .kube
            .nodes_by_label(&NodeState::Old.selector(), self.config.ignore_not_found)
            .await?;
        let names = nodes
            .into_iter()
            .filter_map(|n| n.metadata.name)
            .collect::<Vec<_>>();
        Ok(take_batch(names, batch_size))
    }

    /// Idempotent pre-rollout: label every node old or new, snapshot the
    /// group's capacity into tags (first run only), cordon every node and
    /// protect the group from scale-in.
    ///
    /// Labels and tags already written are not rolled back on error; a
    /// repeated call observes them and skips re-writing.
    pub async fn pre_rollout(
        &self,
        asg_name: &str,
        events: &EventSender,
        progress: &ProgressSender,
    ) -> Result<()> {
        emit(events, "Starting prerollout execution").await;
        info!(asg = %asg_name, "started prerollout execution");

        let inf = self.config.ignore_not_found;
        let snapshot = self.asg.describe(asg_name).await?;
        let classification = self.asg.classify_instances(&snapshot).await?;

        for instance_id in &classification.new {
            let node = self.bridge.node_name_from_instance_id(instance_id).await?;
            if node.is_empty() {
                continue;
            }
            emit(events, format!("Ignoring node {node} for rollout")).await;
            self.kube
                .add_label(&node, NODE_STATE_LABEL, NodeState::New.as_str(), inf)
                .await?;
        }

        for instance_id in &classification.old {
            let node = self.bridge.node_name_from_instance_id(instance_id).await?;
            if node.is_empty() {
                continue;
            }
            emit(events, format!("Marking node {node} for rollout")).await;
            self.kube
                .add_label(&node, NODE_STATE_LABEL, NodeState::Old.as_str(), inf)
                .await?;
        }

        let max = self.asg.max_size(asg_name).await?;
        let min = self.asg.min_size(asg_name).await?;
        let desired = self.asg.desired_capacity(asg_name).await?;

        // Tags already present mean a resumed rollout; the snapshot must
        // stay the values from before the first pre-rollout.
        let stored_desired = self.asg.tag_value(asg_name, TAG_DESIRED).await.unwrap_or(0);
        if stored_desired == 0 {
            emit(events, "Storing initial asg state in asg tags").await;
            self.asg.add_tag(asg_name, TAG_MIN, &min.to_string()).await?;
            self.asg.add_tag(asg_name, TAG_MAX, &max.to_string()).await?;
            self.asg
                .add_tag(asg_name, TAG_DESIRED, &desired.to_string())
                .await?;
        }

        let current = self.asg.describe(asg_name).await?;
        for instance_id in current.instance_ids() {
            let node = self.bridge.node_name_from_instance_id(&instance_id).await?;
            if node.is_empty() {
                continue;
            }
            emit(events, format!("Cordon node {node}")).await;
            self.kube.cordon(&node, inf).await?;
        }

        emit(
            events,
            format!("Enabling new instance protection for asg {asg_name}"),
        )
        .await;
        self.asg.enable_instance_protection(asg_name).await?;

        self.emit_progress(progress, 1).await;
        emit(events, "Pre rollout steps executed").await;
        info!(asg = %asg_name, "pre rollout steps executed");
        Ok(())
    }

    /// Run the batched replacement loop to completion.
    ///
    /// The caller is expected to wait `PERIOD_WAIT.BEFORE_POST` and then run
    /// [`AsgRollout::post_rollout`], passing whether this returned success.
    pub async fn start_rollout(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        asg_name: &str,
        batch_size: usize,
        events: &EventSender,
        progress: &ProgressSender,
    ) -> Result<()> {
        if batch_size == 0 {
            return Err(RolloutError::config("batch size must be at least 1"));
        }

        let snapshot = self.asg.describe(asg_name).await?;
        let classification = self.asg.classify_instances(&snapshot).await?;
        let old_count = classification.old.len();

        {
            let mut current = self.progress.lock().expect("progress lock");
            *current = progress_totals(old_count, batch_size);
        }
        self.emit_progress(progress, 0).await;

        self.pre_rollout(asg_name, events, progress).await?;

        let steps = batch_steps(old_count, batch_size);
        info!(asg = %asg_name, steps, old_count, "number of iterations for entire rollout");

        let max = self.asg.max_size(asg_name).await?;
        let desired = self.asg.desired_capacity(asg_name).await?;
        let (target, new_max) = raised_capacity(desired, max, batch_size as i32);

        if let Some(new_max) = new_max {
            self.asg.set_max_size(asg_name, new_max).await?;
            emit(events, format!("Updating max count of asg to {new_max}")).await;
        }
        self.asg.set_min_size(asg_name, target).await?;
        emit(events, format!("Updating min count of asg to {target}")).await;
        self.asg.set_desired_capacity(asg_name, target).await?;
        emit(events, format!("Updating desired count of asg to {target}")).await;

        for step in 0..steps {
            // instances replacing the last batch must come up unprotected
            let last_batch = step == steps - 1;

            let nodes = self.nodes_to_drain(batch_size).await?;
            if nodes.is_empty() {
                break;
            }

            let (result_tx, mut result_rx) = mpsc::channel::<Result<()>>(batch_size);
            for node in nodes {
                emit(events, format!("Rollout started for node {node}")).await;
                info!(asg = %asg_name, node = %node, "rollout started for node");
                tokio::spawn(replace_node(
                    Arc::clone(self),
                    cancel.clone(),
                    asg_name.to_string(),
                    node,
                    last_batch,
                    events.clone(),
                    result_tx.clone(),
                ));
            }
            drop(result_tx);

            let mut failures = Vec::new();
            while let Some(result) = result_rx.recv().await {
                self.emit_progress(progress, 1).await;
                if let Err(err) = result {
                    failures.push(err.to_string());
                }
            }

            if !failures.is_empty() {
                error!(asg = %asg_name, failures = failures.len(), "unable to rollout batch");
                return Err(RolloutError::Rollout(failures.join(",")));
            }

            tokio::time::sleep(self.config.period_wait.after_batch()).await;
        }

        Ok(())
    }

    /// Idempotent post-rollout cleanup: strip rollout labels, uncordon,
    /// restore min/max from the capacity tags and delete them, then clear
    /// per-instance scale-in protection.
    pub async fn post_rollout(
        &self,
        asg_name: &str,
        events: &EventSender,
        progress: &ProgressSender,
        success: bool,
    ) -> Result<()> {
        emit(events, "Starting post rollout execution").await;
        info!(asg = %asg_name, "starting post rollout execution");
        let inf = self.config.ignore_not_found;

        for state in [NodeState::New, NodeState::Old] {
            let nodes = self.kube.nodes_by_label(&state.selector(), inf).await?;
            for node in nodes {
                let Some(name) = node.metadata.name else {
                    continue;
                };
                emit(events, format!("Removing labels of node {name}")).await;
                self.kube.remove_label(&name, NODE_STATE_LABEL, inf).await?;
            }
        }

        let snapshot = self.asg.describe(asg_name).await?;
        for instance_id in snapshot.instance_ids() {
            let node = self
                .bridge
                .node_name_from_instance_id(&instance_id)
                .await
                .unwrap_or_default();
            if node.is_empty() {
                continue;
            }
            emit(events, format!("Uncordon node {node}")).await;
            self.kube.uncordon(&node, inf).await?;
        }

        let min = self.asg.tag_value(asg_name, TAG_MIN).await?;
        let max = self.asg.tag_value(asg_name, TAG_MAX).await?;
        let desired = self.asg.tag_value(asg_name, TAG_DESIRED).await?;

        for (key, value) in [(TAG_MIN, min), (TAG_MAX, max), (TAG_DESIRED, desired)] {
            emit(events, format!("Deleting tag {key} of asg {asg_name}")).await;
            self.asg.delete_tag(asg_name, key, &value.to_string()).await?;
        }

        // desired is deliberately not restored: with min back at its
        // pre-rollout value the group scales in by itself.
        self.asg.set_min_size(asg_name, min).await?;
        emit(
            events,
            format!("Updating min count of asg {asg_name} to previous state"),
        )
        .await;
        self.asg.set_max_size(asg_name, max).await?;
        emit(
            events,
            format!("Updating max count of asg {asg_name} to previous state"),
        )
        .await;

        tokio::time::sleep(POST_ROLLOUT_SETTLE).await;

        let snapshot = self.asg.describe(asg_name).await?;
        for instance_id in snapshot.instance_ids() {
            emit(
                events,
                format!("Removing instance scale in protection for instance {instance_id}"),
            )
            .await;
            self.asg
                .remove_instance_scale_in_protection(asg_name, &instance_id)
                .await?;
        }

        if !success {
            emit(
                events,
                format!("Disabling new Instance Protection for asg {asg_name}"),
            )
            .await;
            self.asg.disable_instance_protection(asg_name).await?;
            emit(events, "Post rollout steps executed").await;
            info!(asg = %asg_name, "post rollout steps executed after failed rollout");
            return Ok(());
        }

        self.emit_progress(progress, 1).await;
        emit(events, "Post rollout steps executed").await;
        info!(asg = %asg_name, "post rollout steps executed");
        Ok(())
    }
}

/// One per-node replacement workflow, spawned per batch member. Every
/// terminal error is reported through `result_tx`.
async fn replace_node(
    rollout: Arc<AsgRollout>,
    cancel: CancellationToken,
    asg_name: String,
    node_name: String,
    last_batch: bool,
    events: EventSender,
    result_tx: mpsc::Sender<Result<()>>,
) {
    let result = rollout
        .replace_one(&cancel, &asg_name, &node_name, last_batch, &events)
        .await;
    if let Err(err) = &result {
        warn!(asg = %asg_name, node = %node_name, error = %err, "node replacement failed");
    }
    let _ = result_tx.send(result).await;
}

impl AsgRollout {
    /// Replace one old node: acquire a fresh instance, wait for it to be a
    /// ready cluster member, then drain, delete and terminate the old one.
    ///
    /// A node is never terminated before it is drained, and never drained
    /// before its replacement is observed ready.
    async fn replace_one(
        &self,
        cancel: &CancellationToken,
        asg_name: &str,
        node_name: &str,
        last_batch: bool,
        events: &EventSender,
    ) -> Result<()> {
        let inf = self.config.ignore_not_found;

        info!(asg = %asg_name, "waiting to provision new node");
        let wait = self.bridge.wait_for_new_node(asg_name, events);
        let new_node = tokio::select! {
            outcome = tokio::time::timeout(self.config.timeouts.new_node(), wait) => {
                match outcome {
                    Ok(Ok(node)) => node,
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(RolloutError::NewNodeTimeout),
                }
            }
            _ = cancel.cancelled() => return Err(RolloutError::Cancelled),
        };

        emit(events, "Waiting for new k8s node to be in Ready state").await;
        loop {
            // Transient API errors surface immediately; the operator
            // resumes from persisted state.
            let ready = tokio::select! {
                ready = self.kube.is_node_ready(&new_node, inf) => ready?,
                _ = cancel.cancelled() => return Err(RolloutError::Cancelled),
            };
            if ready {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.period_wait.k8s_ready()) => {}
                _ = cancel.cancelled() => return Err(RolloutError::Cancelled),
            }
        }

        emit(events, format!("New Node {new_node} is in Ready state")).await;
        info!(node = %new_node, "new node registered with the cluster");
        self.kube
            .add_label(&new_node, NODE_STATE_LABEL, NodeState::New.as_str(), inf)
            .await?;

        emit(events, format!("Started draining node {node_name}")).await;
        info!(node = %node_name, "started draining node");
        let failures = self
            .kube
            .drain_node(node_name, &self.drain_flags(), events)
            .await;
        if !failures.is_empty() {
            return Err(RolloutError::drain(node_name, &failures));
        }

        emit(events, format!("Node {node_name} drained successfully")).await;
        self.kube
            .add_label(node_name, NODE_STATE_LABEL, NodeState::Drained.as_str(), inf)
            .await?;

        emit(events, format!("Deleting node {node_name}")).await;
        info!(node = %node_name, "deleting node");
        self.kube.delete_node(node_name, inf).await?;

        if last_batch {
            // replacements provisioned from here on stay unprotected
            self.asg.disable_instance_protection(asg_name).await?;
        }

        emit(events, format!("Terminating instance of node {node_name}")).await;
        info!(asg = %asg_name, node = %node_name, "terminating instance");
        let instance_id = self
            .bridge
            .instance_id_from_node_name(node_name, asg_name)
            .await?;
        self.asg.terminate_instance(&instance_id).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_steps_integer_division() {
        assert_eq!(batch_steps(4, 2), 2);
        assert_eq!(batch_steps(5, 2), 2);
        assert_eq!(batch_steps(1, 2), 0);
        assert_eq!(batch_steps(3, 1), 3);
        assert_eq!(batch_steps(0, 2), 0);
    }

    #[test]
    fn test_take_batch_full() {
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(take_batch(nodes, 2), vec!["a", "b"]);
    }

    #[test]
    fn test_take_batch_partial_remainder_is_skipped() {
        let nodes = vec!["a".to_string()];
        assert!(take_batch(nodes, 2).is_empty());
    }

    #[test]
    fn test_take_batch_exact() {
        let nodes = vec!["a".to_string(), "b".to_string()];
        assert_eq!(take_batch(nodes, 2), vec!["a", "b"]);
    }

    #[test]
    fn test_raised_capacity_within_max() {
        // desired 4, max 6, batch 2: target 6 fits, max untouched
        assert_eq!(raised_capacity(4, 6, 2), (6, None));
    }

    #[test]
    fn test_raised_capacity_grows_max() {
        assert_eq!(raised_capacity(5, 6, 2), (7, Some(8)));
        assert_eq!(raised_capacity(6, 6, 1), (7, Some(7)));
    }

    #[test]
    fn test_progress_totals() {
        let progress = progress_totals(4, 2);
        assert_eq!(progress.steps_size, 2);
        assert_eq!(progress.steps_done, 0);
        assert_eq!(progress.total_size, 6);
    }

    #[test]
    fn test_node_state_selectors() {
        assert_eq!(NodeState::Old.selector(), "dockyard.io/node-state=old");
        assert_eq!(NodeState::New.selector(), "dockyard.io/node-state=new");
        assert_eq!(
            NodeState::Drained.selector(),
            "dockyard.io/node-state=drained"
        );
    }

    #[test]
    fn test_state_keys_share_namespace() {
        for key in [NODE_STATE_LABEL, TAG_MIN, TAG_MAX, TAG_DESIRED] {
            assert!(key.starts_with(STATE_NAMESPACE));
        }
    }

    #[test]
    fn test_rollout_error_joins_workflow_failures() {
        let err = RolloutError::Rollout(
            ["unable to get new node, Timeout Exceeded", "unable to get new node"].join(","),
        );
        assert_eq!(
            err.to_string(),
            "unable to rollout nodes unable to get new node, Timeout Exceeded,unable to get new node"
        );
    }
}
