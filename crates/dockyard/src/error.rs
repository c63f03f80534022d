//! Error types for the rollout engine

use std::time::Duration;
use thiserror::Error;

/// Rollout result type
pub type Result<T> = std::result::Result<T, RolloutError>;

/// Errors that can occur during an ASG rollout
#[derive(Error, Debug)]
pub enum RolloutError {
    /// Auto Scaling API error
    #[error("autoscaling error: {0}")]
    Asg(#[from] aws_sdk_autoscaling::Error),

    /// EC2 API error
    #[error("ec2 error: {0}")]
    Ec2(#[from] aws_sdk_ec2::Error),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file parse error
    #[error("config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No ASG with the given name exists in the region
    #[error("no autoscaling group found with name {0}")]
    AsgNotFound(String),

    /// No instance backing the given node name in the ASG
    #[error("unable to fetch instance id of node {0}")]
    InstanceNotFound(String),

    /// Instance id did not resolve to a private DNS name
    #[error("no node name found for instance {0}")]
    NodeNameNotFound(String),

    /// Capacity tag missing on the ASG
    #[error("tag with key {key} for asg {asg} not found")]
    TagNotFound {
        /// ASG name
        asg: String,
        /// Tag key
        key: String,
    },

    /// New-node wait exceeded its deadline
    #[error("unable to get new node, Timeout Exceeded")]
    NewNodeTimeout,

    /// New-node wait was cancelled
    #[error("unable to get new node")]
    Cancelled,

    /// Generic bounded wait expired
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Node drain finished with pod-level failures
    #[error("unable to drain node {node}, {reasons}")]
    Drain {
        /// Node that was being drained
        node: String,
        /// Comma-joined per-pod failures
        reasons: String,
    },

    /// One or more per-node workflows failed; the rollout was aborted
    #[error("unable to rollout nodes {0}")]
    Rollout(String),
}

impl RolloutError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a drain error from accumulated pod failures
    pub fn drain(node: impl Into<String>, errors: &[String]) -> Self {
        Self::Drain {
            node: node.into(),
            reasons: errors.join(","),
        }
    }

    /// Convert from a raw autoscaling SDK error
    pub fn from_asg<E>(err: E) -> Self
    where
        aws_sdk_autoscaling::Error: From<E>,
    {
        Self::Asg(aws_sdk_autoscaling::Error::from(err))
    }

    /// Convert from a raw EC2 SDK error
    pub fn from_ec2<E>(err: E) -> Self
    where
        aws_sdk_ec2::Error: From<E>,
    {
        Self::Ec2(aws_sdk_ec2::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_timeout_message() {
        assert_eq!(
            RolloutError::NewNodeTimeout.to_string(),
            "unable to get new node, Timeout Exceeded"
        );
    }

    #[test]
    fn test_cancelled_message() {
        assert_eq!(RolloutError::Cancelled.to_string(), "unable to get new node");
    }

    #[test]
    fn test_drain_error_joins_reasons() {
        let err = RolloutError::drain(
            "ip-10-0-0-1.ec2.internal",
            &["pod a evicted with error".to_string(), "pod b stuck".to_string()],
        );
        assert_eq!(
            err.to_string(),
            "unable to drain node ip-10-0-0-1.ec2.internal, pod a evicted with error,pod b stuck"
        );
    }

    #[test]
    fn test_tag_not_found_names_key_and_asg() {
        let err = RolloutError::TagNotFound {
            asg: "workers".to_string(),
            key: "dockyard.io/min".to_string(),
        };
        assert!(err.to_string().contains("dockyard.io/min"));
        assert!(err.to_string().contains("workers"));
    }
}
