//! Auto Scaling group adapter
//!
//! Wraps the autoscaling and EC2 APIs behind the operations the rollout
//! needs: describing a group as an owned snapshot, classifying its instances
//! as old or new against the current launch specification, capacity and tag
//! CRUD, scale-in protection, and instance termination.
//!
//! Capacity reads and writes share one mutex. The cloud API accepts
//! concurrent updates, but a describe racing an in-flight update can return
//! the pre-write value; serializing in-process keeps every caller reading its
//! own writes.

use std::collections::HashMap;

use aws_config::BehaviorVersion;
use aws_sdk_autoscaling::types::{Filter, Tag, TagDescription};
use aws_sdk_ec2::types::{Image, Instance, InstanceStatus};
use aws_types::region::Region;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::AwsConfig;
use crate::error::{Result, RolloutError};

/// Tag filter value marking ASGs owned by an EKS cluster
const CLUSTER_OWNED: &str = "owned";

/// How new instances are launched, per the group's current configuration.
///
/// Detection priority is launch configuration, then launch template, then
/// mixed-instances policy; a group carrying none of the three yields `None`
/// in [`AsgSnapshot::launch_spec`] and every instance classifies as old.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSpec {
    /// Classic launch configuration, matched by name
    Config {
        /// Launch configuration name
        name: String,
    },
    /// Launch template, matched by id and numeric version
    Template {
        /// Launch template id
        template_id: String,
    },
    /// Mixed-instances policy wrapping a launch template
    Mixed {
        /// Launch template id inside the policy
        template_id: String,
    },
}

impl LaunchSpec {
    /// Template id for the template-backed variants
    pub fn template_id(&self) -> Option<&str> {
        match self {
            LaunchSpec::Template { template_id } | LaunchSpec::Mixed { template_id } => {
                Some(template_id)
            }
            LaunchSpec::Config { .. } => None,
        }
    }
}

/// The launch reference an individual instance was created from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchRef {
    /// Created from a launch configuration
    Config {
        /// Launch configuration name
        name: String,
    },
    /// Created from a launch template version
    Template {
        /// Launch template id
        template_id: String,
        /// Version string as reported by the API; may be symbolic ("$Latest")
        version: String,
    },
}

/// One instance attached to the group
#[derive(Debug, Clone)]
pub struct AsgInstance {
    /// EC2 instance id
    pub instance_id: String,
    /// Health as reported by the ASG ("Healthy" / "Unhealthy")
    pub health_status: String,
    /// Launch reference, absent for instances attached out-of-band
    pub launch_ref: Option<LaunchRef>,
}

/// Owned view of one Auto Scaling group
#[derive(Debug, Clone)]
pub struct AsgSnapshot {
    /// Group name
    pub name: String,
    /// Minimum capacity
    pub min_size: i32,
    /// Desired capacity
    pub desired_capacity: i32,
    /// Maximum capacity
    pub max_size: i32,
    /// Current launch specification, if any
    pub launch_spec: Option<LaunchSpec>,
    /// Instances currently attached
    pub instances: Vec<AsgInstance>,
}

impl AsgSnapshot {
    /// Instance ids of everything attached to the group
    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.instance_id.clone()).collect()
    }

    /// True iff every attached instance reports "Healthy"
    pub fn is_healthy(&self) -> bool {
        self.instances.iter().all(|i| i.health_status == "Healthy")
    }
}

/// One version of a launch template, in API response order
#[derive(Debug, Clone)]
pub struct TemplateVersion {
    /// Launch template id
    pub template_id: String,
    /// Numeric version
    pub version_number: i64,
    /// Image baked into this version
    pub image_id: Option<String>,
}

/// Result of splitting a group's instances into old and new
#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// Instances still on a previous launch specification
    pub old: Vec<String>,
    /// Instances on the current launch specification
    pub new: Vec<String>,
    /// Image id new instances boot from, for display only
    pub default_image_id: Option<String>,
}

/// Display row for one ASG, consumed by the CLI listing
#[derive(Debug, Clone)]
pub struct AsgInfo {
    /// Group name
    pub name: String,
    /// Desired capacity
    pub desired: i32,
    /// Minimum capacity
    pub min: i32,
    /// Maximum capacity
    pub max: i32,
    /// Default image id, when resolvable
    pub ami_id: Option<String>,
    /// Default image name, when resolvable
    pub ami_name: Option<String>,
    /// Percentage of instances already on the current launch spec
    pub progress_pct: Option<u32>,
    /// All attached instance ids
    pub instance_ids: Vec<String>,
}

/// Classify a group's instances against the current launch specification.
///
/// Template-backed groups compare each instance's template id and parsed
/// numeric version with the greatest `VersionNumber` across `versions`; a
/// launch-configuration group compares names. An absent or unparseable
/// launch reference always classifies old.
pub fn classify(snapshot: &AsgSnapshot, versions: &[TemplateVersion]) -> Classification {
    let mut result = Classification::default();

    let latest = versions
        .iter()
        .max_by_key(|v| v.version_number)
        .map(|v| (v.template_id.as_str(), v.version_number));
    result.default_image_id = versions.first().and_then(|v| v.image_id.clone());

    for instance in &snapshot.instances {
        let is_new = match (&snapshot.launch_spec, &instance.launch_ref) {
            (Some(LaunchSpec::Config { name }), Some(LaunchRef::Config { name: have })) => {
                have == name
            }
            (
                Some(LaunchSpec::Template { .. }) | Some(LaunchSpec::Mixed { .. }),
                Some(LaunchRef::Template { template_id, version }),
            ) => match (latest, version.parse::<i64>()) {
                (Some((latest_id, latest_version)), Ok(have)) => {
                    template_id == latest_id && have == latest_version
                }
                _ => false,
            },
            _ => false,
        };

        if is_new {
            result.new.push(instance.instance_id.clone());
        } else {
            result.old.push(instance.instance_id.clone());
        }
    }

    result
}

/// Client for the autoscaling and EC2 APIs
pub struct AsgClient {
    autoscaling: aws_sdk_autoscaling::Client,
    ec2: aws_sdk_ec2::Client,
    capacity_lock: Mutex<()>,
}

impl AsgClient {
    /// Build a client for the configured region and profile
    pub async fn new(aws: &AwsConfig) -> Self {
        debug!(region = %aws.region, profile = %aws.profile, "creating AWS clients");
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(aws.region.clone()))
            .profile_name(&aws.profile)
            .load()
            .await;

        Self {
            autoscaling: aws_sdk_autoscaling::Client::new(&shared),
            ec2: aws_sdk_ec2::Client::new(&shared),
            capacity_lock: Mutex::new(()),
        }
    }

    /// Build a client from an already-loaded AWS config (tests, embedding)
    pub fn from_conf(shared: &aws_types::SdkConfig) -> Self {
        Self {
            autoscaling: aws_sdk_autoscaling::Client::new(shared),
            ec2: aws_sdk_ec2::Client::new(shared),
            capacity_lock: Mutex::new(()),
        }
    }

    /// Fetch one group as a snapshot. Unknown names, including an empty
    /// response from the API, fail with [`RolloutError::AsgNotFound`].
    pub async fn describe(&self, asg_name: &str) -> Result<AsgSnapshot> {
        let result = self
            .autoscaling
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(asg_name)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;

        let group = result
            .auto_scaling_groups()
            .first()
            .ok_or_else(|| RolloutError::AsgNotFound(asg_name.to_string()))?;

        Ok(snapshot_from(group))
    }

    /// Split the group's instances into old and new, resolving the default
    /// image through the same variant dispatch.
    pub async fn classify_instances(&self, snapshot: &AsgSnapshot) -> Result<Classification> {
        match &snapshot.launch_spec {
            Some(LaunchSpec::Config { name }) => {
                let mut classification = classify(snapshot, &[]);
                classification.default_image_id = self.launch_configuration_image(name).await?;
                Ok(classification)
            }
            Some(LaunchSpec::Template { template_id }) | Some(LaunchSpec::Mixed { template_id }) => {
                let versions = self.template_versions(template_id).await?;
                Ok(classify(snapshot, &versions))
            }
            None => Ok(classify(snapshot, &[])),
        }
    }

    /// All versions of a launch template, preserving API response order
    pub async fn template_versions(&self, template_id: &str) -> Result<Vec<TemplateVersion>> {
        let result = self
            .ec2
            .describe_launch_template_versions()
            .launch_template_id(template_id)
            .send()
            .await
            .map_err(RolloutError::from_ec2)?;

        Ok(result
            .launch_template_versions()
            .iter()
            .filter_map(|v| {
                Some(TemplateVersion {
                    template_id: v.launch_template_id()?.to_string(),
                    version_number: v.version_number()?,
                    image_id: v
                        .launch_template_data()
                        .and_then(|d| d.image_id())
                        .map(str::to_string),
                })
            })
            .collect())
    }

    async fn launch_configuration_image(&self, name: &str) -> Result<Option<String>> {
        let result = self
            .autoscaling
            .describe_launch_configurations()
            .launch_configuration_names(name)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;

        Ok(result
            .launch_configurations()
            .first()
            .and_then(|lc| lc.image_id())
            .map(str::to_string))
    }

    /// Current desired capacity
    pub async fn desired_capacity(&self, asg_name: &str) -> Result<i32> {
        let _guard = self.capacity_lock.lock().await;
        Ok(self.describe(asg_name).await?.desired_capacity)
    }

    /// Set desired capacity, honoring the group's cooldown
    pub async fn set_desired_capacity(&self, asg_name: &str, capacity: i32) -> Result<()> {
        let _guard = self.capacity_lock.lock().await;
        self.autoscaling
            .set_desired_capacity()
            .auto_scaling_group_name(asg_name)
            .desired_capacity(capacity)
            .honor_cooldown(true)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;
        Ok(())
    }

    /// Current minimum capacity
    pub async fn min_size(&self, asg_name: &str) -> Result<i32> {
        let _guard = self.capacity_lock.lock().await;
        Ok(self.describe(asg_name).await?.min_size)
    }

    /// Set minimum capacity
    pub async fn set_min_size(&self, asg_name: &str, capacity: i32) -> Result<()> {
        let _guard = self.capacity_lock.lock().await;
        self.autoscaling
            .update_auto_scaling_group()
            .auto_scaling_group_name(asg_name)
            .min_size(capacity)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;
        Ok(())
    }

    /// Current maximum capacity
    pub async fn max_size(&self, asg_name: &str) -> Result<i32> {
        let _guard = self.capacity_lock.lock().await;
        Ok(self.describe(asg_name).await?.max_size)
    }

    /// Set maximum capacity
    pub async fn set_max_size(&self, asg_name: &str, capacity: i32) -> Result<()> {
        let _guard = self.capacity_lock.lock().await;
        self.autoscaling
            .update_auto_scaling_group()
            .auto_scaling_group_name(asg_name)
            .max_size(capacity)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;
        Ok(())
    }

    /// Protect the whole group from scale-in
    pub async fn enable_instance_protection(&self, asg_name: &str) -> Result<()> {
        self.set_group_protection(asg_name, true).await
    }

    /// Stop protecting the group from scale-in
    pub async fn disable_instance_protection(&self, asg_name: &str) -> Result<()> {
        self.set_group_protection(asg_name, false).await
    }

    async fn set_group_protection(&self, asg_name: &str, protected: bool) -> Result<()> {
        self.autoscaling
            .update_auto_scaling_group()
            .auto_scaling_group_name(asg_name)
            .new_instances_protected_from_scale_in(protected)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;
        Ok(())
    }

    /// Clear scale-in protection on one instance
    pub async fn remove_instance_scale_in_protection(
        &self,
        asg_name: &str,
        instance_id: &str,
    ) -> Result<()> {
        self.autoscaling
            .set_instance_protection()
            .auto_scaling_group_name(asg_name)
            .instance_ids(instance_id)
            .protected_from_scale_in(false)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;
        Ok(())
    }

    /// Create or overwrite one tag on the group
    pub async fn add_tag(&self, asg_name: &str, key: &str, value: &str) -> Result<()> {
        let tag = Tag::builder()
            .resource_id(asg_name)
            .resource_type("auto-scaling-group")
            .key(key)
            .value(value)
            .propagate_at_launch(false)
            .build();

        self.autoscaling
            .create_or_update_tags()
            .tags(tag)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;
        info!(asg = %asg_name, key = %key, value = %value, "tagged asg");
        Ok(())
    }

    /// Numeric value of one tag. A missing tag is
    /// [`RolloutError::TagNotFound`]; an unparseable value reads as zero.
    pub async fn tag_value(&self, asg_name: &str, key: &str) -> Result<i32> {
        let filter = Filter::builder()
            .name("auto-scaling-group")
            .values(asg_name)
            .build();

        let result = self
            .autoscaling
            .describe_tags()
            .filters(filter)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;

        for tag in result.tags() {
            if tag.key() == Some(key) {
                return Ok(parse_tag_value(tag));
            }
        }
        Err(RolloutError::TagNotFound {
            asg: asg_name.to_string(),
            key: key.to_string(),
        })
    }

    /// Delete one tag from the group
    pub async fn delete_tag(&self, asg_name: &str, key: &str, value: &str) -> Result<()> {
        let tag = Tag::builder()
            .resource_id(asg_name)
            .resource_type("auto-scaling-group")
            .key(key)
            .value(value)
            .build();

        self.autoscaling
            .delete_tags()
            .tags(tag)
            .send()
            .await
            .map_err(RolloutError::from_asg)?;
        Ok(())
    }

    /// Terminate one instance
    pub async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        info!(instance = %instance_id, "terminating instance");
        self.ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(RolloutError::from_ec2)?;
        Ok(())
    }

    /// EC2 detail records for a set of instance ids
    pub async fn describe_instances(&self, instance_ids: Vec<String>) -> Result<Vec<Instance>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let result = self
            .ec2
            .describe_instances()
            .set_instance_ids(Some(instance_ids))
            .send()
            .await
            .map_err(RolloutError::from_ec2)?;

        Ok(result
            .reservations()
            .iter()
            .flat_map(|r| r.instances().iter().cloned())
            .collect())
    }

    /// Raw status records for one instance
    pub async fn instance_statuses(&self, instance_id: &str) -> Result<Vec<InstanceStatus>> {
        let result = self
            .ec2
            .describe_instance_status()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(RolloutError::from_ec2)?;
        Ok(result.instance_statuses().to_vec())
    }

    /// Image records for a set of image ids
    pub async fn image_details(&self, image_ids: Vec<String>) -> Result<Vec<Image>> {
        if image_ids.is_empty() {
            return Ok(Vec::new());
        }
        let result = self
            .ec2
            .describe_images()
            .set_image_ids(Some(image_ids))
            .send()
            .await
            .map_err(RolloutError::from_ec2)?;
        Ok(result.images().to_vec())
    }

    /// All groups in the region, as display rows
    pub async fn list_asgs(&self) -> Result<Vec<AsgInfo>> {
        self.list_asgs_with_tag(None).await
    }

    /// Groups owned by one EKS cluster, selected via the
    /// `kubernetes.io/cluster/<name> = owned` tag
    pub async fn list_asgs_of_cluster(&self, cluster: &str) -> Result<Vec<AsgInfo>> {
        debug!(cluster = %cluster, "fetching asgs registered with cluster");
        self.list_asgs_with_tag(Some(format!("tag:kubernetes.io/cluster/{cluster}")))
            .await
    }

    async fn list_asgs_with_tag(&self, tag_filter: Option<String>) -> Result<Vec<AsgInfo>> {
        let mut request = self.autoscaling.describe_auto_scaling_groups();
        if let Some(name) = tag_filter {
            request = request.filters(Filter::builder().name(name).values(CLUSTER_OWNED).build());
        }
        let result = request.send().await.map_err(RolloutError::from_asg)?;

        let mut infos = Vec::new();
        let mut ami_ids = Vec::new();

        for group in result.auto_scaling_groups() {
            let snapshot = snapshot_from(group);
            let classification = self.classify_instances(&snapshot).await?;

            let total = classification.old.len() + classification.new.len();
            let progress_pct = if total > 0 {
                Some((classification.new.len() * 100 / total) as u32)
            } else {
                Some(0)
            };

            if let Some(id) = &classification.default_image_id {
                ami_ids.push(id.clone());
            }

            infos.push(AsgInfo {
                name: snapshot.name.clone(),
                desired: snapshot.desired_capacity,
                min: snapshot.min_size,
                max: snapshot.max_size,
                ami_id: classification.default_image_id.clone(),
                ami_name: None,
                progress_pct,
                instance_ids: snapshot.instance_ids(),
            });
        }

        let names: HashMap<String, String> = self
            .image_details(ami_ids)
            .await?
            .into_iter()
            .filter_map(|img| Some((img.image_id()?.to_string(), img.name()?.to_string())))
            .collect();

        for info in &mut infos {
            info.ami_name = info.ami_id.as_ref().and_then(|id| names.get(id)).cloned();
        }

        Ok(infos)
    }
}

fn parse_tag_value(tag: &TagDescription) -> i32 {
    tag.value().and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Convert an API group record to the owned snapshot model.
///
/// Variant priority follows the API contract: launch configuration first,
/// then launch template, then mixed-instances policy.
fn snapshot_from(group: &aws_sdk_autoscaling::types::AutoScalingGroup) -> AsgSnapshot {
    let launch_spec = if let Some(name) = group.launch_configuration_name() {
        Some(LaunchSpec::Config {
            name: name.to_string(),
        })
    } else if let Some(id) = group.launch_template().and_then(|lt| lt.launch_template_id()) {
        Some(LaunchSpec::Template {
            template_id: id.to_string(),
        })
    } else {
        group
            .mixed_instances_policy()
            .and_then(|p| p.launch_template())
            .and_then(|lt| lt.launch_template_specification())
            .and_then(|spec| spec.launch_template_id())
            .map(|id| LaunchSpec::Mixed {
                template_id: id.to_string(),
            })
    };

    let instances = group
        .instances()
        .iter()
        .filter_map(|instance| {
            let launch_ref = if let Some(name) = instance.launch_configuration_name() {
                Some(LaunchRef::Config {
                    name: name.to_string(),
                })
            } else {
                instance.launch_template().and_then(|lt| {
                    Some(LaunchRef::Template {
                        template_id: lt.launch_template_id()?.to_string(),
                        version: lt.version()?.to_string(),
                    })
                })
            };

            Some(AsgInstance {
                instance_id: instance.instance_id()?.to_string(),
                health_status: instance.health_status().unwrap_or_default().to_string(),
                launch_ref,
            })
        })
        .collect();

    AsgSnapshot {
        name: group.auto_scaling_group_name().unwrap_or_default().to_string(),
        min_size: group.min_size().unwrap_or_default(),
        desired_capacity: group.desired_capacity().unwrap_or_default(),
        max_size: group.max_size().unwrap_or_default(),
        launch_spec,
        instances,
    }
}

/// Parse the EKS version out of an AMI name, e.g.
/// `amazon-eks-node-1.27-v20230728` yields `1.27`.
pub fn eks_version_from_ami_name(ami_name: &str) -> Result<String> {
    let marker = Regex::new(r"eks-\d+\.\d+|node-\d+\.\d+").expect("static pattern");
    let version = Regex::new(r"\d+\.\d+").expect("static pattern");

    marker
        .find(ami_name)
        .and_then(|m| version.find(m.as_str()))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            RolloutError::config(format!("couldn't parse version from ami name: {ami_name}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_instance(id: &str, template_id: &str, version: &str) -> AsgInstance {
        AsgInstance {
            instance_id: id.to_string(),
            health_status: "Healthy".to_string(),
            launch_ref: Some(LaunchRef::Template {
                template_id: template_id.to_string(),
                version: version.to_string(),
            }),
        }
    }

    fn template_snapshot(instances: Vec<AsgInstance>) -> AsgSnapshot {
        AsgSnapshot {
            name: "workers".to_string(),
            min_size: 4,
            desired_capacity: 4,
            max_size: 6,
            launch_spec: Some(LaunchSpec::Template {
                template_id: "lt-1".to_string(),
            }),
            instances,
        }
    }

    fn versions(numbers: &[i64]) -> Vec<TemplateVersion> {
        numbers
            .iter()
            .map(|n| TemplateVersion {
                template_id: "lt-1".to_string(),
                version_number: *n,
                image_id: Some(format!("ami-{n}")),
            })
            .collect()
    }

    #[test]
    fn test_classify_mixed_versions() {
        // versions {1,2,5,3} on the template, instances on {1,5,5,"$Latest"}
        let snapshot = template_snapshot(vec![
            template_instance("i-a", "lt-1", "1"),
            template_instance("i-b", "lt-1", "5"),
            template_instance("i-c", "lt-1", "5"),
            template_instance("i-d", "lt-1", "$Latest"),
        ]);

        let result = classify(&snapshot, &versions(&[1, 2, 5, 3]));

        assert_eq!(result.new, vec!["i-b", "i-c"]);
        assert_eq!(result.old, vec!["i-a", "i-d"]);
        // first returned version is the display image, whatever its number
        assert_eq!(result.default_image_id.as_deref(), Some("ami-1"));
    }

    #[test]
    fn test_classify_foreign_template_is_old() {
        let snapshot = template_snapshot(vec![
            template_instance("i-a", "lt-other", "5"),
            template_instance("i-b", "lt-1", "5"),
        ]);

        let result = classify(&snapshot, &versions(&[5]));
        assert_eq!(result.new, vec!["i-b"]);
        assert_eq!(result.old, vec!["i-a"]);
    }

    #[test]
    fn test_classify_missing_launch_ref_is_old() {
        let mut snapshot = template_snapshot(vec![template_instance("i-a", "lt-1", "5")]);
        snapshot.instances.push(AsgInstance {
            instance_id: "i-detached".to_string(),
            health_status: "Healthy".to_string(),
            launch_ref: None,
        });

        let result = classify(&snapshot, &versions(&[5]));
        assert_eq!(result.new, vec!["i-a"]);
        assert_eq!(result.old, vec!["i-detached"]);
    }

    #[test]
    fn test_classify_launch_configuration_by_name() {
        let snapshot = AsgSnapshot {
            name: "workers".to_string(),
            min_size: 2,
            desired_capacity: 2,
            max_size: 4,
            launch_spec: Some(LaunchSpec::Config {
                name: "workers-v2".to_string(),
            }),
            instances: vec![
                AsgInstance {
                    instance_id: "i-current".to_string(),
                    health_status: "Healthy".to_string(),
                    launch_ref: Some(LaunchRef::Config {
                        name: "workers-v2".to_string(),
                    }),
                },
                AsgInstance {
                    instance_id: "i-stale".to_string(),
                    health_status: "Healthy".to_string(),
                    launch_ref: Some(LaunchRef::Config {
                        name: "workers-v1".to_string(),
                    }),
                },
            ],
        };

        let result = classify(&snapshot, &[]);
        assert_eq!(result.new, vec!["i-current"]);
        assert_eq!(result.old, vec!["i-stale"]);
    }

    #[test]
    fn test_classify_no_launch_spec_everything_old() {
        let mut snapshot = template_snapshot(vec![template_instance("i-a", "lt-1", "5")]);
        snapshot.launch_spec = None;

        let result = classify(&snapshot, &[]);
        assert!(result.new.is_empty());
        assert_eq!(result.old, vec!["i-a"]);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let snapshot = template_snapshot(vec![
            template_instance("i-a", "lt-1", "1"),
            template_instance("i-b", "lt-1", "5"),
        ]);
        let vs = versions(&[1, 2, 5, 3]);

        let first = classify(&snapshot, &vs);
        let second = classify(&snapshot, &vs);
        assert_eq!(first.old, second.old);
        assert_eq!(first.new, second.new);
    }

    #[test]
    fn test_snapshot_health() {
        let mut snapshot = template_snapshot(vec![template_instance("i-a", "lt-1", "5")]);
        assert!(snapshot.is_healthy());
        snapshot.instances[0].health_status = "Unhealthy".to_string();
        assert!(!snapshot.is_healthy());
    }

    #[test]
    fn test_eks_version_from_ami_name() {
        assert_eq!(
            eks_version_from_ami_name("amazon-eks-node-1.27-v20230728").unwrap(),
            "1.27"
        );
        assert_eq!(
            eks_version_from_ami_name("custom-eks-1.24-build-7").unwrap(),
            "1.24"
        );
        assert!(eks_version_from_ami_name("ubuntu-22.04-server").is_err());
    }
}
