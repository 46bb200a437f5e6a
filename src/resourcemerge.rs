//! Merging a required ClusterOperator into the one read from the cluster,
//! tracking whether anything changed.

use crate::clusteroperator::{
    ClusterOperator, ClusterOperatorStatus, ClusterOperatorStatusCondition, ConditionType,
};
use crate::semantic::semantic_eq;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

pub fn find_condition(
    conditions: &[ClusterOperatorStatusCondition],
    type_: ConditionType,
) -> Option<&ClusterOperatorStatusCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Makes `existing` match `required` in metadata and status.
pub fn ensure_cluster_operator_status(
    modified: &mut bool,
    existing: &mut ClusterOperator,
    required: ClusterOperator,
) {
    ensure_object_meta(modified, &mut existing.metadata, required.metadata);
    let status = existing
        .status
        .get_or_insert_with(ClusterOperatorStatus::default);
    ensure_status(modified, status, required.status.unwrap_or_default());
}

fn ensure_status(
    modified: &mut bool,
    existing: &mut ClusterOperatorStatus,
    required: ClusterOperatorStatus,
) {
    if !semantic_eq(&existing.conditions, &required.conditions) {
        *modified = true;
        existing.conditions = required.conditions;
    }
    if !semantic_eq(&existing.versions, &required.versions) {
        *modified = true;
        existing.versions = required.versions;
    }
    if !semantic_eq(&existing.extension, &required.extension) {
        *modified = true;
        existing.extension = required.extension;
    }
    if !semantic_eq(&existing.related_objects, &required.related_objects) {
        *modified = true;
        existing.related_objects = required.related_objects;
    }
}

pub fn ensure_object_meta(modified: &mut bool, existing: &mut ObjectMeta, required: ObjectMeta) {
    set_string_if_set(modified, &mut existing.namespace, required.namespace);
    set_string_if_set(modified, &mut existing.name, required.name);
    merge_map(modified, &mut existing.labels, required.labels);
    merge_map(modified, &mut existing.annotations, required.annotations);
    merge_owner_refs(
        modified,
        &mut existing.owner_references,
        required.owner_references.unwrap_or_default(),
    );
}

/// Empty or missing required values leave `existing` alone.
pub fn set_string_if_set(modified: &mut bool, existing: &mut Option<String>, required: Option<String>) {
    let required = match required {
        Some(r) if !r.is_empty() => r,
        _ => return,
    };
    if existing.as_deref() != Some(required.as_str()) {
        *existing = Some(required);
        *modified = true;
    }
}

/// Adds or overwrites required keys; keys only in `existing` survive.
pub fn merge_map(
    modified: &mut bool,
    existing: &mut Option<BTreeMap<String, String>>,
    required: Option<BTreeMap<String, String>>,
) {
    let required = match required {
        Some(r) => r,
        None => return,
    };
    let existing = existing.get_or_insert_with(BTreeMap::new);
    for (k, v) in required {
        if existing.get(&k) != Some(&v) {
            existing.insert(k, v);
            *modified = true;
        }
    }
}

/// Owner references are matched by UID.
pub fn merge_owner_refs(
    modified: &mut bool,
    existing: &mut Option<Vec<OwnerReference>>,
    required: Vec<OwnerReference>,
) {
    if required.is_empty() {
        return;
    }
    let existing = existing.get_or_insert_with(Vec::new);
    for r in required {
        match existing.iter_mut().find(|e| e.uid == r.uid) {
            Some(e) => {
                if !semantic_eq(&*e, &r) {
                    *e = r;
                    *modified = true;
                }
            }
            None => {
                existing.push(r);
                *modified = true;
            }
        }
    }
}
