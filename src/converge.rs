//! Brings one managed object in line with its desired form.

use crate::crd::VerticalPodAutoscalerController;
use crate::errors::*;
use crate::resources::{annotate_config_map, annotate_deployment, annotate_service};
use crate::semantic::semantic_eq;
use crate::store::{Object, ObjectStore};
use crate::util::RELEASE_VERSION_ANNOTATION;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceSpec};
use kube::{Resource, ResourceExt};
use log::info;
use std::collections::BTreeMap;

/// A kind the operator owns a handful of fields of.
pub trait Managed: Object {
    /// How the kind is named in events and logs.
    const LABEL: &'static str;

    /// Event reason used when reading the current object fails.
    const GET_FAILURE_REASON: &'static str;

    /// Copies the fields the operator owns from `desired` onto `self`, leaving
    /// everything else as the server has it. Returns whether any of them
    /// differed.
    fn converge(&mut self, desired: &Self) -> bool;
}

fn release_of<K: ResourceExt>(obj: &K) -> String {
    obj.annotations()
        .get(RELEASE_VERSION_ANNOTATION)
        .cloned()
        .unwrap_or_default()
}

type Annotations = Option<BTreeMap<String, String>>;

impl Managed for Deployment {
    const LABEL: &'static str = "deployment";
    const GET_FAILURE_REASON: &'static str = "FailedGetDeployment";

    fn converge(&mut self, desired: &Self) -> bool {
        let want = desired.spec.clone().unwrap_or_default();
        let before: (Annotations, Annotations) = (
            self.metadata.annotations.clone(),
            self.spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.annotations.clone()),
        );

        let spec = self.spec.get_or_insert_with(DeploymentSpec::default);
        let mut changed = false;
        if spec.replicas != want.replicas {
            spec.replicas = want.replicas;
            changed = true;
        }
        if !semantic_eq(&spec.template.spec, &want.template.spec) {
            spec.template.spec = want.template.spec;
            changed = true;
        }

        annotate_deployment(self, &release_of(desired));
        let after = (
            self.metadata.annotations.clone(),
            self.spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.annotations.clone()),
        );
        changed || before != after
    }
}

impl Managed for Service {
    const LABEL: &'static str = "service";
    const GET_FAILURE_REASON: &'static str = "FailedGetService";

    fn converge(&mut self, desired: &Self) -> bool {
        let want = desired.spec.clone().unwrap_or_default();
        let before = self.metadata.annotations.clone();

        let spec = self.spec.get_or_insert_with(ServiceSpec::default);
        let mut changed = false;
        if !semantic_eq(&spec.ports, &want.ports) {
            spec.ports = want.ports;
            changed = true;
        }
        if !semantic_eq(&spec.selector, &want.selector) {
            spec.selector = want.selector;
            changed = true;
        }

        annotate_service(self, &release_of(desired));
        changed || before != self.metadata.annotations
    }
}

impl Managed for ConfigMap {
    const LABEL: &'static str = "ConfigMap";
    const GET_FAILURE_REASON: &'static str = "FailedGetConfigMap";

    fn converge(&mut self, desired: &Self) -> bool {
        let before = self.metadata.annotations.clone();
        annotate_config_map(self, &release_of(desired));
        before != self.metadata.annotations
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Get,
    Create,
    Update,
}

/// Where a converge step failed, with the API error untouched.
#[derive(Debug)]
pub struct Failure {
    pub stage: Stage,
    pub error: Error,
}

fn at(stage: Stage) -> impl FnOnce(Error) -> Failure {
    move |error| Failure { stage, error }
}

/// Creates `desired` if it does not exist, owned by `owner`; otherwise updates
/// the fields the operator owns if they drifted.
pub async fn reconcile_resource<S, K>(
    store: &S,
    owner: &VerticalPodAutoscalerController,
    mut desired: K,
) -> std::result::Result<Outcome, Failure>
where
    S: ObjectStore,
    K: Managed,
{
    let name = desired.name_any();
    let namespace = desired.namespace();

    let mut current = match store.get::<K>(namespace.as_deref(), &name).await {
        Ok(current) => current,
        Err(e) if is_not_found(&e) => {
            if let Some(owner_ref) = owner.controller_owner_ref(&()) {
                desired.meta_mut().owner_references = Some(vec![owner_ref]);
            }
            info!("Creating {} {}/{}", K::LABEL, namespace.as_deref().unwrap_or(""), name);
            store.create(&desired).await.map_err(at(Stage::Create))?;
            return Ok(Outcome::Created);
        }
        Err(e) => return Err(at(Stage::Get)(e)),
    };

    if !current.converge(&desired) {
        return Ok(Outcome::Unchanged);
    }
    info!("Updating {} {}/{}", K::LABEL, namespace.as_deref().unwrap_or(""), name);
    store.replace(&current).await.map_err(at(Stage::Update))?;
    Ok(Outcome::Updated)
}
