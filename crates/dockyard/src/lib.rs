//! # dockyard
//!
//! In-place rolling replacement of the worker ASGs behind an EKS cluster.
//!
//! ## Architecture
//!
//! ```text
//! Rollout orchestrator
//! ├── ASG adapter        ──▶ autoscaling / EC2 APIs
//! ├── Cluster adapter    ──▶ Kubernetes API (nodes, pods, evictions)
//! ├── Instance–node bridge (instance id ⇄ node name, new-node watch)
//! └── Event & progress channels ──▶ observer (CLI, UI, ...)
//! ```
//!
//! After the ASG's launch template or configuration is updated, the
//! orchestrator retires instances still on the previous version in batches:
//! it raises capacity so replacements come up first, waits for each
//! replacement to become a Ready cluster member, drains the outgoing node
//! under its disruption budgets, then deletes the node object and terminates
//! the instance.
//!
//! Rollout state is persisted in ASG tags (`dockyard.io/min`, `/max`,
//! `/desired`) and node labels (`dockyard.io/node-state`), never in process
//! memory, so an interrupted run can simply be re-invoked.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod asg;
pub mod bridge;
pub mod config;
pub mod error;
pub mod kube;
pub mod preflight;
pub mod progress;
pub mod retry;
pub mod rollout;

// Orchestration
pub use rollout::{
    AsgRollout, NodeState, NODE_STATE_LABEL, STATE_NAMESPACE, TAG_DESIRED, TAG_MAX, TAG_MIN,
};

// Adapters and the bridge
pub use asg::{AsgClient, AsgInfo, AsgSnapshot, Classification, LaunchRef, LaunchSpec};
pub use bridge::NodeBridge;
pub use kube::{DrainFlags, KubeClient};

// Streams
pub use progress::{
    event_channel, progress_channel, EventReceiver, EventSender, ProgressReceiver, ProgressSender,
    RolloutProgress,
};

// Error handling
pub use error::{Result, RolloutError};

// Configuration
pub use config::{Config, DEFAULT_CONFIG_FILE};

// Preflight checks
pub use preflight::{PreflightChecker, PreflightReport};
