use kube::{Client, CustomResourceExt};
use log::info;
use vpa_operator::{
    config::Config, crd::VerticalPodAutoscalerController, errors::*, manager::Manager,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // `vpa-operator crd` prints the CustomResourceDefinition and exits
    if std::env::args().nth(1).as_deref() == Some("crd") {
        print!(
            "{}",
            serde_yaml::to_string(&VerticalPodAutoscalerController::crd())?
        );
        return Ok(());
    }

    info!("Starting vpa-operator {}", env!("CARGO_PKG_VERSION"));
    let config = Config::from_env();
    info!(
        "Watching {} for VerticalPodAutoscalerController {}, operands in {}",
        config.watch_namespace, config.name, config.namespace
    );

    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default().await?;

    let (_manager, drainer) = Manager::new(client, config).await?;
    drainer.await;
    info!("Controller stopped");
    Ok(())
}
