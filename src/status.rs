//! Reports the operator's health to the cluster version operator through the
//! `vertical-pod-autoscaler` ClusterOperator.
//!
//! The reporter polls the recommender deployment and publishes one of three
//! condition sets:
//!
//! * available: the recommender is rolled out at the current release,
//! * progressing: it is missing, outdated or still rolling out,
//! * degraded: its state could not be read.
//!
//! Publishing is a no-op when nothing would change, so an unchanged cluster
//! never sees a status write.

use crate::clusteroperator::{
    ClusterOperator, ClusterOperatorSpec, ClusterOperatorStatus, ClusterOperatorStatusCondition,
    ConditionStatus, ConditionType, ObjectReference, OperandVersion,
};
use crate::config::Config;
use crate::crd::VerticalPodAutoscalerController;
use crate::errors::*;
use crate::operand::Operand;
use crate::resourcemerge::{ensure_cluster_operator_status, find_condition};
use crate::semantic::semantic_eq;
use crate::store::ObjectStore;
use crate::util::{deployment_updated, release_version_matches, reset_progressing_time};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const OPERATOR_NAME: &str = "vertical-pod-autoscaler";

pub const REASON_EMPTY: &str = "";
pub const REASON_SYNCING: &str = "SyncingResources";
pub const REASON_CHECK_AUTOSCALER: &str = "UnableToCheckAutoscalers";

const POLL_INTERVAL: Duration = Duration::from_secs(15);

pub type Clock = Arc<dyn Fn() -> Time + Send + Sync>;

/// The namespaces the operator works in, deduplicated and sorted.
pub fn related_objects(config: &Config) -> Vec<ObjectReference> {
    let mut objects: Vec<ObjectReference> = [&config.watch_namespace, &config.namespace]
        .iter()
        .map(|ns| ObjectReference {
            resource: "namespaces".to_string(),
            name: ns.to_string(),
            ..ObjectReference::default()
        })
        .collect();
    objects.sort();
    objects.dedup();
    objects
}

pub struct StatusReporter<S> {
    store: Arc<S>,
    config: Arc<Config>,
    related_objects: Vec<ObjectReference>,
    clock: Clock,
    token: CancellationToken,
}

impl<S: ObjectStore> StatusReporter<S> {
    /// Once `token` is cancelled the reporter stops publishing.
    pub fn new(store: Arc<S>, config: Arc<Config>, token: CancellationToken) -> Self {
        StatusReporter {
            related_objects: related_objects(&config),
            store,
            config,
            clock: Arc::new(|| Time(Utc::now())),
            token,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Polls and publishes every 15 seconds, starting immediately, until the
    /// token is cancelled. Failures are logged and polling continues.
    pub async fn start(&self) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.report_status().await {
                error!("Failed to report operator status: {}", e);
            }
        }
        info!("Status reporter stopped");
    }

    /// Checks the operands and publishes the matching status. Returns whether
    /// the operator is available at the current release.
    pub async fn report_status(&self) -> Result<bool> {
        let release = &self.config.release_version;
        match self.check_recommender().await {
            Err(e) => {
                let msg = format!("error checking VPA controllers status: {}", e);
                self.degraded(REASON_CHECK_AUTOSCALER, &msg).await?;
                Ok(false)
            }
            Ok(false) => {
                let msg = format!("updating to {}", release);
                self.progressing(REASON_SYNCING, &msg)
                    .await
                    .chain_err(|| "failed to set progressing status")?;
                Ok(false)
            }
            Ok(true) => {
                let msg = format!("at version {}", release);
                self.available(REASON_EMPTY, &msg)
                    .await
                    .chain_err(|| "failed to set available status")?;
                Ok(true)
            }
        }
    }

    /// Whether the recommender deployment is rolled out at the current
    /// release. No controller instance at all counts as healthy.
    pub async fn check_recommender(&self) -> Result<bool> {
        let config = &self.config;
        match self
            .store
            .get::<VerticalPodAutoscalerController>(Some(&config.watch_namespace), &config.name)
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {
                info!("No VerticalPodAutoscalerController. Reporting available.");
                return Ok(true);
            }
            Err(e) => {
                error!("Error getting VerticalPodAutoscalerController: {}", e);
                return Err(e);
            }
        }

        let name = Operand::Recommender.resource_name(&config.name);
        let deployment = match self
            .store
            .get::<Deployment>(Some(&config.namespace), &name)
            .await
        {
            Ok(d) => d,
            Err(e) if is_not_found(&e) => {
                info!("No vpa-recommender deployment. Reporting unavailable.");
                return Ok(false);
            }
            Err(e) => {
                error!("Error getting vpa-recommender deployment: {}", e);
                return Err(e);
            }
        };

        if !release_version_matches(&deployment, &config.release_version) {
            info!("vpa-recommender deployment version not current.");
            return Ok(false);
        }
        if !deployment_updated(&deployment) {
            info!("vpa-recommender deployment updating.");
            return Ok(false);
        }

        debug!("vpa-recommender deployment is available and updated.");
        Ok(true)
    }

    async fn available(&self, reason: &str, message: &str) -> Result<()> {
        let status = ClusterOperatorStatus {
            conditions: vec![
                ClusterOperatorStatusCondition::new(ConditionType::Available, ConditionStatus::True)
                    .with_reason(reason, message),
                ClusterOperatorStatusCondition::new(ConditionType::Progressing, ConditionStatus::False),
                ClusterOperatorStatusCondition::new(ConditionType::Degraded, ConditionStatus::False),
            ],
            versions: Some(vec![OperandVersion {
                name: "operator".to_string(),
                version: self.config.release_version.clone(),
            }]),
            ..ClusterOperatorStatus::default()
        };
        info!("Operator status available: {}", message);
        self.apply_status(status).await
    }

    async fn progressing(&self, reason: &str, message: &str) -> Result<()> {
        let status = ClusterOperatorStatus {
            conditions: vec![
                ClusterOperatorStatusCondition::new(ConditionType::Available, ConditionStatus::True),
                ClusterOperatorStatusCondition::new(ConditionType::Progressing, ConditionStatus::True)
                    .with_reason(reason, message),
                ClusterOperatorStatusCondition::new(ConditionType::Degraded, ConditionStatus::False),
            ],
            ..ClusterOperatorStatus::default()
        };
        info!("Operator status progressing: {}", message);
        self.apply_status(status).await
    }

    async fn degraded(&self, reason: &str, message: &str) -> Result<()> {
        let status = ClusterOperatorStatus {
            conditions: vec![
                ClusterOperatorStatusCondition::new(ConditionType::Available, ConditionStatus::True),
                ClusterOperatorStatusCondition::new(ConditionType::Progressing, ConditionStatus::False),
                ClusterOperatorStatusCondition::new(ConditionType::Degraded, ConditionStatus::True)
                    .with_reason(reason, message),
            ],
            ..ClusterOperatorStatus::default()
        };
        warn!("Operator status degraded: {}", message);
        self.apply_status(status).await
    }

    pub async fn get_or_create_cluster_operator(&self) -> Result<ClusterOperator> {
        match self.store.get::<ClusterOperator>(None, OPERATOR_NAME).await {
            Err(e) if is_not_found(&e) => {
                let co = ClusterOperator::new(OPERATOR_NAME, ClusterOperatorSpec {});
                self.store.create(&co).await
            }
            other => other,
        }
    }

    /// Publishes `status` with the configured related objects. Condition
    /// transition times only move when a condition's status flips, and
    /// versions left unset keep their previously reported value.
    pub async fn apply_status(&self, mut status: ClusterOperatorStatus) -> Result<()> {
        if self.token.is_cancelled() {
            return Ok(());
        }

        let mut co = self.get_or_create_cluster_operator().await?;
        let previous = co.status.clone().unwrap_or_default();
        let now = (self.clock)();

        status.related_objects = self.related_objects.clone();
        status.extension = previous.extension.clone();
        if status.versions.is_none() {
            status.versions = previous.versions.clone();
        }

        for condition in status.conditions.iter_mut() {
            condition.last_transition_time = match find_condition(&previous.conditions, condition.type_.clone()) {
                Some(p) if p.status == condition.status => p.last_transition_time.clone(),
                _ => None,
            };
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(now.clone());
            }
        }

        if !semantic_eq(&status.versions, &previous.versions) {
            reset_progressing_time(&mut status.conditions, now);
        }

        let mut required = co.clone();
        required.status = Some(status);
        let mut modified = false;
        ensure_cluster_operator_status(&mut modified, &mut co, required);

        if !modified {
            return Ok(());
        }
        if self.token.is_cancelled() {
            return Ok(());
        }
        self.store.replace_status(&co).await?;
        Ok(())
    }
}
