use log::error;

/// Default namespace watched for VerticalPodAutoscalerController instances.
pub const DEFAULT_WATCH_NAMESPACE: &str = "openshift-vertical-pod-autoscaler";

/// Default namespace for operand deployments.
pub const DEFAULT_NAMESPACE: &str = "openshift-vertical-pod-autoscaler";

/// Default name of the singleton VerticalPodAutoscalerController.
pub const DEFAULT_NAME: &str = "default";

pub const DEFAULT_IMAGE: &str = "quay.io/openshift/origin-vertical-pod-autoscaler:4.16.0";

pub const DEFAULT_VERBOSITY: i32 = 1;

/// Runtime configuration for the operator, read once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Version the operator reports once its operands have reached level.
    pub release_version: String,

    /// Namespace watched for VerticalPodAutoscalerController instances.
    pub watch_namespace: String,

    /// Namespace the operand deployments, service and configmap live in.
    pub namespace: String,

    /// Name of the only VerticalPodAutoscalerController the operator acts on.
    pub name: String,

    /// Image used for all three operand containers.
    pub image: String,

    /// Log verbosity passed to the operands as `--v`.
    pub verbosity: i32,

    /// Extra arguments appended verbatim to every operand's argument list.
    /// Only settable through the environment, meant for debugging.
    pub extra_args: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            release_version: String::new(),
            watch_namespace: DEFAULT_WATCH_NAMESPACE.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: DEFAULT_NAME.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            verbosity: DEFAULT_VERBOSITY,
            extra_args: String::new(),
        }
    }
}

impl Config {
    /// Defaults overridden by whichever environment variables are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(v) = lookup("RELEASE_VERSION") {
            config.release_version = v;
        }
        if let Some(v) = lookup("WATCH_NAMESPACE") {
            config.watch_namespace = v;
        }
        if let Some(v) = lookup("VERTICAL_POD_AUTOSCALER_NAME") {
            config.name = v;
        }
        if let Some(v) = lookup("RELATED_IMAGE_VPA") {
            config.image = v;
        }
        if let Some(v) = lookup("VERTICAL_POD_AUTOSCALER_NAMESPACE") {
            config.namespace = v;
        }
        if let Some(v) = lookup("VERTICAL_POD_AUTOSCALER_VERBOSITY") {
            config.verbosity = v.trim().parse().unwrap_or_else(|e| {
                error!(
                    "Error parsing VERTICAL_POD_AUTOSCALER_VERBOSITY environment variable: {}",
                    e
                );
                DEFAULT_VERBOSITY
            });
        }
        if let Some(v) = lookup("VERTICAL_POD_AUTOSCALER_EXTRA_ARGS") {
            config.extra_args = v;
        }

        config
    }
}
