//! Configuration loading
//!
//! Reads `config.yaml` from the working directory and overlays the
//! `AWS_REGION` / `AWS_PROFILE` environment variables. Key names mirror the
//! YAML document:
//!
//! ```yaml
//! AWS_CONFIG:
//!   AWS_REGION: eu-west-1
//!   AWS_PROFILE: production
//! ASG_ROLLOUT:
//!   IGNORE_NOT_FOUND: true
//!   PERIOD_WAIT:
//!     AFTER_BATCH: 30
//! LOGGING:
//!   LEVEL: debug
//! ```

use crate::error::{Result, RolloutError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default config file name, resolved against the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Top-level dockyard configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// AWS credentials and region selection
    #[serde(rename = "AWS_CONFIG", default)]
    pub aws: AwsConfig,

    /// Logging configuration
    #[serde(rename = "LOGGING", default)]
    pub logging: LoggingConfig,

    /// Rollout behavior knobs
    #[serde(rename = "ASG_ROLLOUT", default)]
    pub rollout: RolloutConfig,
}

/// AWS region and credentials profile
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AwsConfig {
    /// Target region
    #[serde(rename = "AWS_REGION", default)]
    pub region: String,

    /// Shared-credentials profile name
    #[serde(rename = "AWS_PROFILE", default)]
    pub profile: String,
}

/// Log level selection
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// One of trace/debug/info/warn/error
    #[serde(rename = "LEVEL", default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rollout behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RolloutConfig {
    /// Treat NotFound from the cluster API as success
    #[serde(rename = "IGNORE_NOT_FOUND", default = "default_true")]
    pub ignore_not_found: bool,

    /// Force-delete pods whose eviction is rejected
    #[serde(rename = "FORCE_DELETE_PODS", default)]
    pub force_delete_pods: bool,

    /// Substring marking private registry images (preflight only)
    #[serde(rename = "PRIVATE_REGISTRY", default)]
    pub private_registry: Option<String>,

    /// EKS cluster name used for ASG tag filtering
    #[serde(rename = "EKS_CLUSTER_NAME", default)]
    pub eks_cluster_name: Option<String>,

    /// Poll intervals and settle pauses
    #[serde(rename = "PERIOD_WAIT", default)]
    pub period_wait: PeriodWait,

    /// Hard deadlines
    #[serde(rename = "TIMEOUTS", default)]
    pub timeouts: Timeouts,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            ignore_not_found: true,
            force_delete_pods: false,
            private_registry: None,
            eks_cluster_name: None,
            period_wait: PeriodWait::default(),
            timeouts: Timeouts::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Wait periods, all in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct PeriodWait {
    /// Pause between the rollout loop finishing and post-rollout
    #[serde(rename = "BEFORE_POST", default = "default_before_post")]
    pub before_post: u64,

    /// Pause between batches
    #[serde(rename = "AFTER_BATCH", default = "default_thirty")]
    pub after_batch: u64,

    /// Node readiness poll interval
    #[serde(rename = "K8S_READY", default = "default_thirty")]
    pub k8s_ready: u64,

    /// New-instance poll interval
    #[serde(rename = "NEW_NODE_ASG_REGISTER", default = "default_thirty")]
    pub new_node_asg_register: u64,
}

impl Default for PeriodWait {
    fn default() -> Self {
        Self {
            before_post: default_before_post(),
            after_batch: default_thirty(),
            k8s_ready: default_thirty(),
            new_node_asg_register: default_thirty(),
        }
    }
}

/// Hard deadlines, all in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Deadline for a new instance to join the ASG and the cluster
    #[serde(rename = "NEW_NODE_ASG_REGISTER", default = "default_new_node_timeout")]
    pub new_node_asg_register: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            new_node_asg_register: default_new_node_timeout(),
        }
    }
}

fn default_before_post() -> u64 {
    60
}

fn default_thirty() -> u64 {
    30
}

fn default_new_node_timeout() -> u64 {
    600
}

impl PeriodWait {
    /// Pause before post-rollout
    pub fn before_post(&self) -> Duration {
        Duration::from_secs(self.before_post)
    }

    /// Pause between batches
    pub fn after_batch(&self) -> Duration {
        Duration::from_secs(self.after_batch)
    }

    /// Node readiness poll interval
    pub fn k8s_ready(&self) -> Duration {
        Duration::from_secs(self.k8s_ready)
    }

    /// New-instance poll interval
    pub fn new_node_asg_register(&self) -> Duration {
        Duration::from_secs(self.new_node_asg_register)
    }
}

impl Timeouts {
    /// Deadline for the new-node wait
    pub fn new_node(&self) -> Duration {
        Duration::from_secs(self.new_node_asg_register)
    }
}

impl Config {
    /// Load configuration from `config.yaml`, then overlay the environment.
    ///
    /// A missing file is not an error as long as `AWS_REGION` and
    /// `AWS_PROFILE` are present in the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<Config>(&raw)?
        } else {
            Config::default()
        };

        if let Ok(region) = std::env::var("AWS_REGION") {
            if !region.is_empty() {
                config.aws.region = region;
            }
        }
        if let Ok(profile) = std::env::var("AWS_PROFILE") {
            if !profile.is_empty() {
                config.aws.profile = profile;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.aws.region.is_empty() {
            return Err(RolloutError::config(
                "AWS_CONFIG.AWS_REGION is required (config.yaml or AWS_REGION env)",
            ));
        }
        if self.aws.profile.is_empty() {
            return Err(RolloutError::config(
                "AWS_CONFIG.AWS_PROFILE is required (config.yaml or AWS_PROFILE env)",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
AWS_CONFIG:
  AWS_REGION: eu-west-1
  AWS_PROFILE: staging
"#,
        )
        .unwrap();

        assert!(config.rollout.ignore_not_found);
        assert!(!config.rollout.force_delete_pods);
        assert_eq!(config.rollout.period_wait.before_post, 60);
        assert_eq!(config.rollout.period_wait.after_batch, 30);
        assert_eq!(config.rollout.period_wait.k8s_ready, 30);
        assert_eq!(config.rollout.period_wait.new_node_asg_register, 30);
        assert_eq!(config.rollout.timeouts.new_node_asg_register, 600);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_explicit_values_win() {
        let config: Config = serde_yaml::from_str(
            r#"
AWS_CONFIG:
  AWS_REGION: us-east-1
  AWS_PROFILE: prod
ASG_ROLLOUT:
  IGNORE_NOT_FOUND: false
  FORCE_DELETE_PODS: true
  EKS_CLUSTER_NAME: example-cluster
  PERIOD_WAIT:
    AFTER_BATCH: 5
  TIMEOUTS:
    NEW_NODE_ASG_REGISTER: 60
LOGGING:
  LEVEL: debug
"#,
        )
        .unwrap();

        assert!(!config.rollout.ignore_not_found);
        assert!(config.rollout.force_delete_pods);
        assert_eq!(
            config.rollout.eks_cluster_name.as_deref(),
            Some("example-cluster")
        );
        assert_eq!(config.rollout.period_wait.after_batch, 5);
        // untouched siblings keep their defaults
        assert_eq!(config.rollout.period_wait.k8s_ready, 30);
        assert_eq!(config.rollout.timeouts.new_node_asg_register, 60);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_duration_accessors() {
        let periods = PeriodWait::default();
        assert_eq!(periods.after_batch(), Duration::from_secs(30));
        assert_eq!(periods.before_post(), Duration::from_secs(60));
        assert_eq!(Timeouts::default().new_node(), Duration::from_secs(600));
    }

    #[test]
    fn test_validate_requires_region_and_profile() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }
}
