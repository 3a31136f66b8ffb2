//! Typed builders for the Deployment + Service pair applied per service.
//!
//! Manifests stay as `k8s-openapi` structs until a cluster client needs them;
//! `to_yaml` is the only place they become text.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Deserialize;

use crate::config::ControllerConfig;
use crate::error::{DeployError, Result};
use crate::types::validate_service_name;

pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "deploy-controller";
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

// ---------------------------------------------------------------------------
// ManifestTemplate
// ---------------------------------------------------------------------------

/// Cluster-wide settings shared by every rendered manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestTemplate {
    pub namespace: String,
    pub image_prefix: String,
    pub tag: String,
    pub container_port: i32,
    pub excluded_host: Option<String>,
}

impl ManifestTemplate {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            namespace: config.cluster.namespace.clone(),
            image_prefix: config.registry.image_prefix.clone(),
            tag: config.registry.tag.clone(),
            container_port: config.cluster.container_port,
            excluded_host: config.cluster.excluded_host.clone(),
        }
    }

    pub fn image_for(&self, service: &str) -> String {
        let prefix = self.image_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            format!("{service}:{}", self.tag)
        } else {
            format!("{prefix}/{service}:{}", self.tag)
        }
    }

    /// Render the Deployment and Service for `service` with `replicas` pods.
    pub fn render(&self, service: &str, replicas: i32) -> Result<ServiceManifest> {
        validate_service_name(service)?;
        if replicas < 0 {
            return Err(DeployError::Manifest(format!(
                "replicas must not be negative, got {replicas}"
            )));
        }
        Ok(ServiceManifest {
            deployment: self.deployment(service, replicas),
            service: self.service(service),
        })
    }

    fn deployment(&self, service: &str, replicas: i32) -> Deployment {
        let selector = app_labels(service);
        let mut labels = selector.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        Deployment {
            metadata: ObjectMeta {
                name: Some(service.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        affinity: self.affinity(),
                        containers: vec![Container {
                            name: service.to_string(),
                            image: Some(self.image_for(service)),
                            image_pull_policy: Some("Always".to_string()),
                            ports: Some(vec![ContainerPort {
                                container_port: self.container_port,
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service(&self, service: &str) -> Service {
        let selector = app_labels(service);
        let mut labels = selector.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        Service {
            metadata: ObjectMeta {
                name: Some(service.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    port: self.container_port,
                    target_port: Some(IntOrString::Int(self.container_port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn affinity(&self) -> Option<Affinity> {
        let host = self.excluded_host.as_ref()?;
        Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: HOSTNAME_LABEL.to_string(),
                            operator: "NotIn".to_string(),
                            values: Some(vec![host.clone()]),
                        }]),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn app_labels(service: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), service.to_string())])
}

// ---------------------------------------------------------------------------
// ServiceManifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceManifest {
    pub deployment: Deployment,
    pub service: Service,
}

/// The fields of a manifest that identify what it deploys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSummary {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub image: Option<String>,
    pub container_ports: Vec<i32>,
}

impl ServiceManifest {
    pub fn name(&self) -> &str {
        self.deployment.metadata.name.as_deref().unwrap_or_default()
    }

    /// Serialize as a two-document YAML stream suitable for `kubectl apply -f -`.
    pub fn to_yaml(&self) -> Result<String> {
        let deployment = serde_yaml::to_string(&self.deployment)?;
        let service = serde_yaml::to_string(&self.service)?;
        Ok(format!("{deployment}---\n{service}"))
    }

    /// Parse a stream produced by `to_yaml` (documents in any order).
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut deployment = None;
        let mut service = None;
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            let value = serde_yaml::Value::deserialize(doc)?;
            if value.is_null() {
                continue;
            }
            match value.get("kind").and_then(|k| k.as_str()) {
                Some("Deployment") => deployment = Some(serde_yaml::from_value(value)?),
                Some("Service") => service = Some(serde_yaml::from_value(value)?),
                other => {
                    return Err(DeployError::Manifest(format!(
                        "unexpected document kind {other:?}"
                    )))
                }
            }
        }
        match (deployment, service) {
            (Some(deployment), Some(service)) => Ok(Self {
                deployment,
                service,
            }),
            _ => Err(DeployError::Manifest(
                "expected one Deployment and one Service".to_string(),
            )),
        }
    }

    pub fn summary(&self) -> ManifestSummary {
        let spec = self.deployment.spec.as_ref();
        let containers = spec
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers.as_slice())
            .unwrap_or_default();
        ManifestSummary {
            name: self.name().to_string(),
            namespace: self
                .deployment
                .metadata
                .namespace
                .clone()
                .unwrap_or_default(),
            replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
            image: containers.first().and_then(|c| c.image.clone()),
            container_ports: containers
                .iter()
                .flat_map(|c| c.ports.iter().flatten())
                .map(|p| p.container_port)
                .collect(),
        }
    }
}
