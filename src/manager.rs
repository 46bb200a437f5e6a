use crate::config::Config;
use crate::controller::{Reconciler, CONTROLLER_NAME};
use crate::crd::VerticalPodAutoscalerController;
use crate::errors::*;
use crate::status::StatusReporter;
use crate::store::{KubeEvents, KubeStore};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{api::Api, client::Client, CustomResourceExt, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::watcher;
use log::{error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

// Context for our reconciler
struct Data {
    reconciler: Arc<Reconciler<KubeStore, KubeEvents>>,
    /// consecutive failed passes per instance
    failures: Mutex<HashMap<String, u32>>,
}

impl Data {
    fn reset_failures(&self, name: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(name);
        }
    }

    fn record_failure(&self, name: &str) -> u32 {
        match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(name.to_string()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
            Err(_) => 1,
        }
    }
}

async fn reconcile(vpa: Arc<VerticalPodAutoscalerController>, ctx: Arc<Data>) -> Result<Action> {
    let name = vpa.name_any();
    let namespace = vpa
        .namespace()
        .unwrap_or_else(|| ctx.reconciler.config().watch_namespace.clone());

    ctx.reconciler.reconcile(&namespace, &name).await?;
    ctx.reset_failures(&name);
    Ok(Action::await_change())
}

/// Delay before retrying after `attempt` consecutive failures: doubling from
/// one second up to five minutes, plus up to 10% jitter.
fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE.saturating_mul(1 << exp).min(BACKOFF_MAX);
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    delay.mul_f64(1.0 + jitter)
}

fn error_policy(vpa: Arc<VerticalPodAutoscalerController>, error: &Error, ctx: Arc<Data>) -> Action {
    let attempt = ctx.record_failure(&vpa.name_any());
    let delay = backoff(attempt);
    warn!("reconcile failed: {}; retrying in {:?}", error, delay);
    Action::requeue(delay)
}

pub struct Manager {}

/// Manager that owns a Controller for VerticalPodAutoscalerController
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited.
    /// It is up to `main` to wait for the controller stream. The status reporter
    /// and the default instance check run on their own tasks; the status
    /// reporter stops once the controller does.
    pub async fn new(client: Client, config: Config) -> Result<(Self, BoxFuture<'static, ()>)> {
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        let crd_name = VerticalPodAutoscalerController::crd_name();
        crds.get(crd_name)
            .await
            .chain_err(|| format!("install the {} crd first", crd_name))?;

        let config = Arc::new(config);
        let store = Arc::new(KubeStore::new(client.clone()));
        let events = Arc::new(KubeEvents::new(client.clone(), CONTROLLER_NAME));
        let reconciler = Arc::new(Reconciler::new(store.clone(), events, config.clone()));

        let token = CancellationToken::new();
        let reporter = StatusReporter::new(store, config.clone(), token.clone());
        let status_task = tokio::spawn(async move { reporter.start().await });

        let heal = reconciler.clone();
        tokio::spawn(async move { heal.ensure_default_instance().await });

        let context = Arc::new(Data {
            reconciler,
            failures: Mutex::new(HashMap::new()),
        });

        let vpas = Api::<VerticalPodAutoscalerController>::namespaced(
            client.clone(),
            &config.watch_namespace,
        );
        let watch = watcher::Config::default().fields(&format!("metadata.name={}", config.name));
        let ns = &config.namespace;

        let controller = Controller::new(vpas, watch)
            .owns(
                Api::<Deployment>::namespaced(client.clone(), ns),
                watcher::Config::default(),
            )
            .owns(
                Api::<Service>::namespaced(client.clone(), ns),
                watcher::Config::default(),
            )
            .owns(
                Api::<ConfigMap>::namespaced(client, ns),
                watcher::Config::default(),
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(|o| {
                match o {
                    Ok(o) => info!("Reconciled {:?}", o),
                    Err(e) => warn!("Reconcile failed: {}", e),
                }
                futures::future::ready(())
            });

        // the controller stream has to be consumed; once it ends, stop the
        // status reporter and wait for it
        let drainer = async move {
            controller.await;
            token.cancel();
            if let Err(e) = status_task.await {
                error!("Status reporter task failed: {}", e);
            }
        }
        .boxed();

        Ok((Self {}, drainer))
    }
}
