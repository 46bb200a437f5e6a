use crate::clusteroperator::{ClusterOperatorStatusCondition, ConditionStatus, ConditionType};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

/// Marks operand pods as critical to the cluster. Presence-only.
pub const CRITICAL_POD_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/critical-pod";

/// Records the operator release an object was last reconciled by.
pub const RELEASE_VERSION_ANNOTATION: &str = "release.openshift.io/version";

/// Whether the object's release version annotation matches `version`.
pub fn release_version_matches<K: ResourceExt>(obj: &K, version: &str) -> bool {
    obj.annotations()
        .get(RELEASE_VERSION_ANNOTATION)
        .map_or(false, |v| v == version)
}

/// Whether the deployment has finished rolling out its current generation.
pub fn deployment_updated(deployment: &Deployment) -> bool {
    let status = match &deployment.status {
        Some(s) => s,
        None => return false,
    };
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let replicas = status.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    status.observed_generation.unwrap_or(0) >= deployment.metadata.generation.unwrap_or(0)
        && updated == replicas
        && updated >= desired
        && available >= desired
        && available > 0
}

/// Sets the Progressing condition's transition time to `now`, adding the
/// condition if it is missing.
pub fn reset_progressing_time(conditions: &mut Vec<ClusterOperatorStatusCondition>, now: Time) {
    match conditions
        .iter_mut()
        .find(|c| c.type_ == ConditionType::Progressing)
    {
        Some(c) => c.last_transition_time = Some(now),
        None => {
            let mut c =
                ClusterOperatorStatusCondition::new(ConditionType::Progressing, ConditionStatus::Unknown);
            c.last_transition_time = Some(now);
            conditions.push(c);
        }
    }
}

/// Whether `args` already sets the flag `name`, either bare or as `name=value`.
pub fn arg_exists(args: &[String], name: &str) -> bool {
    args.iter().any(|arg| {
        arg == name
            || arg
                .strip_prefix(name)
                .map_or(false, |rest| rest.starts_with('='))
    })
}
