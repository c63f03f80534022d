//! Pre-rollout cluster checks
//!
//! Read-only checks an operator runs before kicking off a rollout: PDBs that
//! would block every eviction, pods already stuck Pending, node readiness
//! across the cluster, and deployments pulling images from outside the
//! private registry. The rollout itself does not depend on any of these.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, ListParams};

use crate::error::Result;
use crate::kube::node_is_ready;

/// A PDB currently allowing zero disruptions; every eviction under it will
/// be rejected until it frees up
#[derive(Debug, Clone)]
pub struct BlockedPdb {
    /// PDB name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Pods the PDB expects
    pub expected_pods: i32,
}

/// A deployment container image not served from the private registry
#[derive(Debug, Clone)]
pub struct PublicImage {
    /// Deployment name
    pub deployment: String,
    /// Namespace
    pub namespace: String,
    /// Offending image reference
    pub image: String,
}

/// Aggregated preflight results
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    /// PDBs with zero allowed disruptions
    pub blocked_pdbs: Vec<BlockedPdb>,
    /// `namespace/name` of pods stuck Pending
    pub pending_pods: Vec<String>,
    /// Whether every node reports Ready
    pub all_nodes_ready: bool,
    /// Images pulled from outside the private registry
    pub public_images: Vec<PublicImage>,
}

/// True when the PDB would reject any eviction right now
pub fn pdb_is_blocking(pdb: &PodDisruptionBudget) -> bool {
    pdb.status
        .as_ref()
        .map(|s| s.disruptions_allowed == 0)
        .unwrap_or(false)
}

/// An image is public when it does not mention the private registry
pub fn is_public_image(image: &str, private_registry: &str) -> bool {
    !image.contains(private_registry)
}

/// Runs the read-only checks against one cluster
pub struct PreflightChecker {
    client: kube::Client,
    private_registry: Option<String>,
}

impl PreflightChecker {
    /// Build a checker; `private_registry` enables the image scan
    pub fn new(client: kube::Client, private_registry: Option<String>) -> Self {
        Self {
            client,
            private_registry,
        }
    }

    /// PDBs that currently allow zero disruptions
    pub async fn blocked_pdbs(&self) -> Result<Vec<BlockedPdb>> {
        let api: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        let pdbs = api.list(&ListParams::default()).await?;

        Ok(pdbs
            .items
            .into_iter()
            .filter(pdb_is_blocking)
            .map(|pdb| BlockedPdb {
                name: pdb.metadata.name.unwrap_or_default(),
                namespace: pdb.metadata.namespace.unwrap_or_default(),
                expected_pods: pdb.status.map(|s| s.expected_pods).unwrap_or_default(),
            })
            .collect())
    }

    /// `namespace/name` of every pod in phase Pending
    pub async fn pending_pods(&self) -> Result<Vec<String>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields("status.phase=Pending");
        let pods = api.list(&params).await?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| {
                format!(
                    "{}/{}",
                    pod.metadata.namespace.unwrap_or_default(),
                    pod.metadata.name.unwrap_or_default()
                )
            })
            .collect())
    }

    /// Whether every node in the cluster reports Ready
    pub async fn all_nodes_ready(&self) -> Result<bool> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().all(node_is_ready))
    }

    /// Deployments whose container images live outside the private
    /// registry. Empty when no registry is configured.
    pub async fn public_images(&self) -> Result<Vec<PublicImage>> {
        let Some(registry) = &self.private_registry else {
            return Ok(Vec::new());
        };

        let api: Api<Deployment> = Api::all(self.client.clone());
        let deployments = api.list(&ListParams::default()).await?;

        let mut images = Vec::new();
        for deployment in deployments.items {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
            let containers = deployment
                .spec
                .and_then(|s| s.template.spec)
                .map(|s| s.containers)
                .unwrap_or_default();

            for container in containers {
                if let Some(image) = container.image {
                    if is_public_image(&image, registry) {
                        images.push(PublicImage {
                            deployment: name.clone(),
                            namespace: namespace.clone(),
                            image,
                        });
                    }
                }
            }
        }
        Ok(images)
    }

    /// Run every check and aggregate the results
    pub async fn run(&self) -> Result<PreflightReport> {
        Ok(PreflightReport {
            blocked_pdbs: self.blocked_pdbs().await?,
            pending_pods: self.pending_pods().await?,
            all_nodes_ready: self.all_nodes_ready().await?,
            public_images: self.public_images().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::policy::v1::PodDisruptionBudgetStatus;

    fn pdb(disruptions_allowed: i32) -> PodDisruptionBudget {
        PodDisruptionBudget {
            status: Some(PodDisruptionBudgetStatus {
                disruptions_allowed,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pdb_blocking() {
        assert!(pdb_is_blocking(&pdb(0)));
        assert!(!pdb_is_blocking(&pdb(1)));
        assert!(!pdb_is_blocking(&PodDisruptionBudget::default()));
    }

    #[test]
    fn test_is_public_image() {
        assert!(is_public_image("docker.io/nginx:latest", "registry.internal"));
        assert!(!is_public_image(
            "registry.internal/team/app:1.2",
            "registry.internal"
        ));
    }
}
