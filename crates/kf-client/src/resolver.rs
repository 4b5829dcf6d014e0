//! Picking a ready pod behind a service

use std::collections::BTreeMap;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Deserialize;

use kf_core::traits::TargetResolver;
use kf_core::{NegotiationError, Target};

use crate::api::ApiClient;
use crate::error::ClientError;

/// Resolves services to one of their ready pods, chosen at random
///
/// Pods resolve to themselves without touching the server. Every other
/// resource is refused.
#[derive(Debug, Clone)]
pub struct ReadyPodResolver {
    client: ApiClient,
}

impl ReadyPodResolver {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    async fn ready_pods(&self, service: &Target) -> Result<Vec<String>, NegotiationError> {
        let found: Service = self
            .client
            .get_json(&service.api_path())
            .await
            .map_err(api_error)?;
        if found.spec.selector.is_empty() {
            return Err(NegotiationError::Resolve(format!("{} has no pod selector", service)));
        }

        let selector = label_selector(&found.spec.selector);
        let path = format!("/api/v1/namespaces/{}/pods", service.namespace);
        let pods: PodList = self
            .client
            .get_json_query(&path, &[("labelSelector", selector.as_str())])
            .await
            .map_err(api_error)?;

        Ok(pods
            .items
            .into_iter()
            .filter(Pod::is_ready)
            .map(|pod| pod.metadata.name)
            .collect())
    }
}

#[async_trait]
impl TargetResolver for ReadyPodResolver {
    async fn resolve(&self, target: &Target) -> Result<Target, NegotiationError> {
        match target.resource.as_str() {
            "pods" => Ok(target.clone()),
            "services" => {
                let ready = self.ready_pods(target).await?;
                let chosen = ready.choose(&mut rand::thread_rng()).cloned();
                let name = chosen.ok_or_else(|| {
                    NegotiationError::Resolve(format!("no ready pods behind {}", target))
                })?;
                tracing::debug!(forward = %target, pod = %name, candidates = ready.len(), "Picked ready pod");
                Ok(Target::pod(target.namespace.clone(), name))
            }
            other => Err(NegotiationError::Rejected {
                status: 400,
                message: format!("cannot forward to resource type '{}'", other),
            }),
        }
    }
}

fn api_error(e: ClientError) -> NegotiationError {
    match e {
        ClientError::Status { status: status @ (401 | 403), body } => {
            NegotiationError::Rejected { status, message: body }
        }
        other => NegotiationError::Resolve(other.to_string()),
    }
}

/// `k1=v1,k2=v2`, in key order
fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Deserialize)]
struct Service {
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpec {
    #[serde(default)]
    selector: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMeta {
    name: String,
    #[serde(default)]
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

impl Pod {
    /// Ready condition is true and the pod is not being deleted
    fn is_ready(&self) -> bool {
        self.metadata.deletion_timestamp.is_none()
            && self
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kf_core::config::ApiConfig;

    fn unreachable() -> ReadyPodResolver {
        ReadyPodResolver::new(
            ApiClient::new(&ApiConfig {
                server: "http://127.0.0.1:1".to_string(),
                ..ApiConfig::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_readiness_rules() {
        let body = r#"{"items": [
            {"metadata": {"name": "ready"},
             "status": {"conditions": [{"type": "Ready", "status": "True"}]}},
            {"metadata": {"name": "starting"},
             "status": {"conditions": [{"type": "Ready", "status": "False"}]}},
            {"metadata": {"name": "leaving", "deletionTimestamp": "2026-01-01T00:00:00Z"},
             "status": {"conditions": [{"type": "Ready", "status": "True"}]}},
            {"metadata": {"name": "pending"}}
        ]}"#;
        let pods: PodList = serde_json::from_str(body).unwrap();
        let ready: Vec<_> = pods
            .items
            .iter()
            .filter(|p| p.is_ready())
            .map(|p| p.metadata.name.as_str())
            .collect();
        assert_eq!(ready, vec!["ready"]);
    }

    #[test]
    fn test_label_selector_is_ordered() {
        let labels = BTreeMap::from([
            ("tier".to_string(), "web".to_string()),
            ("app".to_string(), "shop".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "app=shop,tier=web");
    }

    #[tokio::test]
    async fn test_pods_resolve_without_a_request() {
        let target = Target::pod("default", "web-0");
        assert_eq!(unreachable().resolve(&target).await.unwrap(), target);
    }

    #[tokio::test]
    async fn test_other_resources_are_refused() {
        let target = Target {
            resource: "deployments".to_string(),
            ..Target::pod("default", "web")
        };
        let err = unreachable().resolve(&target).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
