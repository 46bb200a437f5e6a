use crate::config::Config;
use crate::converge::{reconcile_resource, Failure, Managed, Outcome, Stage};
use crate::crd::{default_instance, VerticalPodAutoscalerController};
use crate::errors::*;
use crate::operand::Operand;
use crate::resources::{ca_config_map, deployment, webhook_service};
use crate::store::{EventSink, ObjectStore};
use k8s_openapi::api::core::v1::{Namespace, ObjectReference};
use kube::{Resource, ResourceExt};
use kube_runtime::events::EventType;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Name events are reported under.
pub const CONTROLLER_NAME: &str = "vertical-pod-autoscaler-controller";

/// Set on the watch namespace once the default instance has been created, so
/// that deleting it sticks.
pub const CREATED_DEFAULT_ANNOTATION: &str =
    "vertical-pod-autoscaler-controller/created-default-controller";

const DEFAULT_INSTANCE_ATTEMPTS: u32 = 60;

/// Reconciles the singleton VerticalPodAutoscalerController into its three
/// deployments, the webhook service and the CA config map.
pub struct Reconciler<S, E> {
    store: Arc<S>,
    events: Arc<E>,
    config: Arc<Config>,
    retry_interval: Duration,
}

impl<S: ObjectStore, E: EventSink> Reconciler<S, E> {
    pub fn new(store: Arc<S>, events: Arc<E>, config: Arc<Config>) -> Self {
        Reconciler {
            store,
            events,
            config,
            retry_interval: Duration::from_secs(1),
        }
    }

    /// Time between attempts to find or create the default instance.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Only the configured instance is acted on.
    pub fn name_matches(&self, name: &str) -> bool {
        if name != self.config.name {
            warn!(
                "Not processing VerticalPodAutoscalerController {}, only {} is supported",
                name, self.config.name
            );
            return false;
        }
        true
    }

    /// One pass over everything owned by the named instance. Stops at the
    /// first failing object.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        info!("Reconciling VerticalPodAutoscalerController {}/{}", namespace, name);
        if !self.name_matches(name) {
            return Ok(());
        }

        let vpa = match self
            .store
            .get::<VerticalPodAutoscalerController>(Some(namespace), name)
            .await
        {
            Ok(vpa) => vpa,
            Err(e) if is_not_found(&e) => {
                info!("VerticalPodAutoscalerController not found, will not reconcile");
                return Ok(());
            }
            Err(e) => {
                error!("Error reading VerticalPodAutoscalerController: {}", e);
                return Err(e);
            }
        };

        let reference = self.object_reference(&vpa);
        for operand in Operand::ALL.iter() {
            let desired = deployment(*operand, &vpa, &self.config);
            self.converge(&vpa, &reference, desired).await?;
        }
        self.converge(&vpa, &reference, webhook_service(&self.config))
            .await?;
        self.converge(&vpa, &reference, ca_config_map(&self.config))
            .await?;
        Ok(())
    }

    /// Reference events are attached to. Falls back to the operand namespace
    /// so events never land in `default`.
    pub fn object_reference(&self, vpa: &VerticalPodAutoscalerController) -> ObjectReference {
        let mut reference = vpa.object_ref(&());
        if reference.namespace.as_deref().map_or(true, str::is_empty) {
            reference.namespace = Some(self.config.namespace.clone());
        }
        reference
    }

    async fn converge<K: Managed>(
        &self,
        vpa: &VerticalPodAutoscalerController,
        reference: &ObjectReference,
        desired: K,
    ) -> Result<()> {
        let name = desired.name_any();
        let label = K::LABEL;

        match reconcile_resource(&*self.store, vpa, desired).await {
            Ok(Outcome::Created) => {
                let msg = format!("Created VerticalPodAutoscalerController {}: {}", label, name);
                info!("{}", msg);
                self.event(reference, EventType::Normal, "SuccessfulCreate", msg)
                    .await;
                Ok(())
            }
            Ok(Outcome::Updated) => {
                let msg = format!("Updated VerticalPodAutoscalerController {}: {}", label, name);
                info!("{}", msg);
                self.event(reference, EventType::Normal, "SuccessfulUpdate", msg)
                    .await;
                Ok(())
            }
            Ok(Outcome::Unchanged) => {
                debug!("{} {} is up to date", label, name);
                Ok(())
            }
            Err(Failure { stage, error }) => {
                let (reason, msg) = match stage {
                    Stage::Get => (
                        K::GET_FAILURE_REASON,
                        format!("Error getting vertical-pod-autoscaler {} {}: {}", label, name, error),
                    ),
                    Stage::Create => (
                        "FailedCreate",
                        format!("Error creating VerticalPodAutoscalerController {}: {}", label, error),
                    ),
                    Stage::Update => (
                        "FailedUpdate",
                        format!("Error updating vertical-pod-autoscaler {} {}: {}", label, name, error),
                    ),
                };
                error!("{}", msg);
                self.event(reference, EventType::Warning, reason, msg).await;
                Err(error)
            }
        }
    }

    async fn event(&self, reference: &ObjectReference, type_: EventType, reason: &str, note: String) {
        if let Err(e) = self.events.publish(reference, type_, reason, note).await {
            warn!("Failed to publish {} event: {}", reason, e);
        }
    }

    /// Waits for the API and creates the default instance if there is none.
    /// Gives up quietly after a minute of the API being unreachable.
    pub async fn ensure_default_instance(&self) {
        for _ in 0..DEFAULT_INSTANCE_ATTEMPTS {
            tokio::time::sleep(self.retry_interval).await;
            match self.try_default_instance().await {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    error!("Error ensuring default VerticalPodAutoscalerController: {}", e);
                    return;
                }
            }
        }
        error!("Unable to create default VerticalPodAutoscalerController instance: timed out waiting for the API");
    }

    /// Ok(false) means the API is not reachable yet.
    async fn try_default_instance(&self) -> Result<bool> {
        if !self.store.ready().await {
            info!("Waiting for the API before checking for a VerticalPodAutoscalerController instance");
            return Ok(false);
        }

        let config = &self.config;
        match self
            .store
            .get::<VerticalPodAutoscalerController>(Some(&config.watch_namespace), &config.name)
            .await
        {
            Ok(_) => return Ok(true),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e),
        }

        let mut namespace = match self
            .store
            .get::<Namespace>(None, &config.watch_namespace)
            .await
        {
            Ok(namespace) => Some(namespace),
            Err(e) => {
                warn!(
                    "Unable to read namespace {}, assuming no default instance was created before: {}",
                    config.watch_namespace, e
                );
                None
            }
        };
        if namespace
            .as_ref()
            .is_some_and(|ns| ns.annotations().contains_key(CREATED_DEFAULT_ANNOTATION))
        {
            info!(
                "Default VerticalPodAutoscalerController was deleted after being created, not recreating {}",
                config.name
            );
            return Ok(true);
        }

        info!(
            "No VerticalPodAutoscalerController exists. Creating instance {}/{}",
            config.watch_namespace, config.name
        );
        let vpa = default_instance(&config.name, &config.watch_namespace);
        match self.store.create(&vpa).await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {
                debug!("Default VerticalPodAutoscalerController created concurrently");
            }
            Err(e) => return Err(e),
        }

        if let Some(namespace) = namespace.as_mut() {
            namespace
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(CREATED_DEFAULT_ANNOTATION.to_string(), "true".to_string());
            self.store.replace(&*namespace).await?;
        }
        Ok(true)
    }
}
