use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fraction of usage added as the safety margin to the recommended request.
pub const DEFAULT_SAFETY_MARGIN_FRACTION: f64 = 0.15;
/// Minimum CPU recommendation for a pod.
pub const DEFAULT_POD_MIN_CPU_MILLICORES: f64 = 25.0;
/// Minimum memory recommendation for a pod.
pub const DEFAULT_POD_MIN_MEMORY_MB: f64 = 250.0;
pub const DEFAULT_RECOMMENDATION_ONLY: bool = false;
/// The updater will not evict pods that are the only replica.
pub const DEFAULT_MIN_REPLICAS: i64 = 2;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[kube(
    group = "autoscaling.openshift.io",
    version = "v1",
    kind = "VerticalPodAutoscalerController",
    status = "VerticalPodAutoscalerControllerStatus",
    shortname = "vpac",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerControllerSpec {
    #[schemars(range(min = 0.0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_margin_fraction: Option<f64>,

    #[schemars(range(min = 0.0))]
    #[serde(
        rename = "podMinCPUMillicores",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pod_min_cpu_millicores: Option<f64>,

    #[schemars(range(min = 0.0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_min_memory_mb: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_only: Option<bool>,

    #[schemars(range(min = 1))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i64>,

    #[serde(default)]
    pub deployment_overrides: DeploymentOverrides,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VerticalPodAutoscalerControllerStatus {}

/// Per-operand overrides for the deployments managed by the controller.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DeploymentOverrides {
    /// Overrides for the admission plugin deployment.
    #[serde(default)]
    pub admission: DeploymentOverride,
    /// Overrides for the recommender deployment.
    #[serde(default)]
    pub recommender: DeploymentOverride,
    /// Overrides for the updater deployment.
    #[serde(default)]
    pub updater: DeploymentOverride,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOverride {
    /// Overrides applied to the container running the operand.
    #[serde(default)]
    pub container: ContainerOverride,

    /// Replaces the pod's node selector, e.g. to run the operands on non-master nodes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Replaces the pod's tolerations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ContainerOverride {
    /// Appended to the container's argument list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Replaces the container's resource requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

impl ContainerOverride {
    /// Resources to apply, if the override carries any requirement at all.
    pub fn resources(&self) -> Option<&ResourceRequirements> {
        self.resources.as_ref().filter(|r| {
            r.limits.as_ref().map_or(false, |l| !l.is_empty())
                || r.requests.as_ref().map_or(false, |l| !l.is_empty())
                || r.claims.as_ref().map_or(false, |c| !c.is_empty())
        })
    }
}

impl VerticalPodAutoscalerControllerSpec {
    /// recommendation_only is tri-state; only an explicit `true` disables operands.
    pub fn is_recommendation_only(&self) -> bool {
        self.recommendation_only == Some(true)
    }
}

/// The instance created at startup when none exists yet.
pub fn default_instance(name: &str, namespace: &str) -> VerticalPodAutoscalerController {
    VerticalPodAutoscalerController {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        spec: VerticalPodAutoscalerControllerSpec {
            safety_margin_fraction: Some(DEFAULT_SAFETY_MARGIN_FRACTION),
            pod_min_cpu_millicores: Some(DEFAULT_POD_MIN_CPU_MILLICORES),
            pod_min_memory_mb: Some(DEFAULT_POD_MIN_MEMORY_MB),
            recommendation_only: Some(DEFAULT_RECOMMENDATION_ONLY),
            min_replicas: Some(DEFAULT_MIN_REPLICAS),
            deployment_overrides: DeploymentOverrides::default(),
        },
        status: None,
    }
}
