//! Instance–node bridge
//!
//! Translates between EC2 instance ids and cluster node names (an instance's
//! private DNS name is its node name on EKS) and watches the ASG for
//! replacement instances that have joined but are not yet part of a rollout.

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_ec2::types::{InstanceStatus, SummaryStatus};
use tracing::debug;

use crate::asg::AsgClient;
use crate::error::{Result, RolloutError};
use crate::kube::{is_not_found, KubeClient};
use crate::progress::{emit, EventSender};
use crate::rollout::{NodeState, NODE_STATE_LABEL};

/// EC2 system health: the first reported status entry must be "ok".
/// No status entries means the instance is still initializing.
pub fn system_status_ok(statuses: &[InstanceStatus]) -> bool {
    statuses
        .first()
        .and_then(|s| s.system_status())
        .and_then(|summary| summary.status())
        == Some(&SummaryStatus::Ok)
}

/// Bridge between the ASG and the cluster membership views
pub struct NodeBridge {
    asg: Arc<AsgClient>,
    kube: Arc<KubeClient>,
    poll_interval: Duration,
}

impl NodeBridge {
    /// Build a bridge polling at the configured new-node period
    pub fn new(asg: Arc<AsgClient>, kube: Arc<KubeClient>, poll_interval: Duration) -> Self {
        Self {
            asg,
            kube,
            poll_interval,
        }
    }

    /// Private DNS name of an instance, which is its node name.
    ///
    /// The name can be empty for an instance that has not finished
    /// provisioning; callers skip those.
    pub async fn node_name_from_instance_id(&self, instance_id: &str) -> Result<String> {
        let instances = self.asg.describe_instances(vec![instance_id.to_string()]).await?;
        instances
            .first()
            .map(|i| i.private_dns_name().unwrap_or_default().to_string())
            .ok_or_else(|| RolloutError::NodeNameNotFound(instance_id.to_string()))
    }

    /// Instance id backing a node name, scanned from the ASG's instances
    pub async fn instance_id_from_node_name(
        &self,
        node_name: &str,
        asg_name: &str,
    ) -> Result<String> {
        let snapshot = self.asg.describe(asg_name).await?;
        let instances = self.asg.describe_instances(snapshot.instance_ids()).await?;

        instances
            .iter()
            .find(|i| i.private_dns_name() == Some(node_name))
            .and_then(|i| i.instance_id())
            .map(str::to_string)
            .ok_or_else(|| RolloutError::InstanceNotFound(node_name.to_string()))
    }

    /// EC2 system health of one instance
    pub async fn is_instance_healthy(&self, instance_id: &str) -> Result<bool> {
        let statuses = self.asg.instance_statuses(instance_id).await?;
        Ok(system_status_ok(&statuses))
    }

    /// Node names of instances carrying neither the `old` nor the `new`
    /// rollout label — joiners not yet claimed by a workflow.
    pub async fn new_nodes(&self, asg_name: &str) -> Result<Vec<String>> {
        let snapshot = self.asg.describe(asg_name).await?;
        let mut joined = Vec::new();

        for instance_id in snapshot.instance_ids() {
            let node_name = self.node_name_from_instance_id(&instance_id).await?;
            if node_name.is_empty() {
                continue;
            }
            if self.is_unclaimed(&node_name).await? == Some(true) {
                joined.push(node_name);
            }
        }
        Ok(joined)
    }

    /// Poll the ASG until an instance qualifies as a fresh replacement: it is
    /// attached, EC2 reports it healthy, it has a cluster node object, and
    /// that node carries neither the `old` nor the `new` label.
    ///
    /// Loops until found or a fatal error; the caller bounds it with a
    /// deadline and cancellation.
    pub async fn wait_for_new_node(&self, asg_name: &str, events: &EventSender) -> Result<String> {
        emit(events, format!("Waiting for new node to join ASG {asg_name}")).await;

        loop {
            let snapshot = self.asg.describe(asg_name).await?;

            for instance_id in snapshot.instance_ids() {
                if !self.is_instance_healthy(&instance_id).await? {
                    continue;
                }
                let node_name = self.node_name_from_instance_id(&instance_id).await?;
                if node_name.is_empty() {
                    continue;
                }
                match self.is_unclaimed(&node_name).await? {
                    // The instance is healthy but its node has not
                    // registered with the cluster yet.
                    None => continue,
                    Some(false) => continue,
                    Some(true) => {
                        debug!(asg = %asg_name, node = %node_name, "found unclaimed replacement");
                        emit(events, format!("New node has joined ASG {asg_name}")).await;
                        return Ok(node_name);
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// `Some(true)` when the node exists without a rollout label,
    /// `Some(false)` when labelled, `None` when the node object is absent.
    ///
    /// The label lookup runs without the NotFound shortcut so that a node
    /// that has not registered with the cluster yet stays distinguishable
    /// from a registered, unlabelled one.
    async fn is_unclaimed(&self, node_name: &str) -> Result<Option<bool>> {
        let state = match self.kube.label_value(node_name, NODE_STATE_LABEL, false).await {
            Ok(state) => state,
            Err(RolloutError::Kube(err)) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err),
        };

        Ok(Some(
            state.as_deref() != Some(NodeState::Old.as_str())
                && state.as_deref() != Some(NodeState::New.as_str()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::InstanceStatusSummary;

    fn status(value: SummaryStatus) -> InstanceStatus {
        InstanceStatus::builder()
            .system_status(InstanceStatusSummary::builder().status(value).build())
            .build()
    }

    #[test]
    fn test_system_status_ok() {
        assert!(system_status_ok(&[status(SummaryStatus::Ok)]));
        assert!(!system_status_ok(&[status(SummaryStatus::Impaired)]));
        assert!(!system_status_ok(&[status(SummaryStatus::Initializing)]));
    }

    #[test]
    fn test_empty_status_is_unhealthy() {
        assert!(!system_status_ok(&[]));
    }

    #[test]
    fn test_first_status_entry_decides() {
        let statuses = vec![status(SummaryStatus::Initializing), status(SummaryStatus::Ok)];
        assert!(!system_status_ok(&statuses));
    }

    #[test]
    fn test_status_without_summary_is_unhealthy() {
        assert!(!system_status_ok(&[InstanceStatus::builder().build()]));
    }
}
