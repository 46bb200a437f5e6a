//! The three VPA operands and how their pod specs are derived from a
//! VerticalPodAutoscalerController.

use crate::config::Config;
use crate::crd::{DeploymentOverride, VerticalPodAutoscalerController};
use crate::resources::{CA_CERT_CONFIG_MAP_NAME, WEBHOOK_CERT_SECRET_NAME};
use crate::util::arg_exists;
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    ObjectFieldSelector, PodSecurityContext, PodSpec, ResourceRequirements, SeccompProfile,
    SecretVolumeSource, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;

pub const CONTAINER_NAME: &str = "vertical-pod-autoscaler";
pub const PRIORITY_CLASS_NAME: &str = "system-cluster-critical";
pub const ADMISSION_PORT: i32 = 8000;

const LOG_TO_STDERR_ARG: &str = "--logtostderr";
const VERBOSITY_ARG: &str = "--v";
const SAFETY_MARGIN_FRACTION_ARG: &str = "--recommendation-margin-fraction";
const POD_MIN_CPU_MILLICORES_ARG: &str = "--pod-recommendation-min-cpu-millicores";
const POD_MIN_MEMORY_MB_ARG: &str = "--pod-recommendation-min-memory-mb";
const MIN_REPLICAS_ARG: &str = "--min-replicas";
const KUBE_API_QPS_ARG: &str = "--kube-api-qps";
const KUBE_API_BURST_ARG: &str = "--kube-api-burst";
const TLS_CERT_FILE_ARG: &str = "--tls-cert-file";
const TLS_KEY_FILE_ARG: &str = "--tls-private-key";
const TLS_CA_CERT_FILE_ARG: &str = "--client-ca-file";
const WEBHOOK_TIMEOUT_ARG: &str = "--webhook-timeout-seconds";

const TLS_CERTS_VOLUME: &str = "tls-certs";
const TLS_CA_CERTS_VOLUME: &str = "tls-ca-certs";
const TLS_CERTS_PATH: &str = "/data/tls-certs";
const TLS_CA_CERTS_PATH: &str = "/data/tls-ca-certs";

fn arg(name: &str, value: impl fmt::Display) -> String {
    format!("{}={}", name, value)
}

/// One of the deployments the controller runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Recommender,
    Updater,
    Admission,
}

impl Operand {
    /// Reconciliation order.
    pub const ALL: [Operand; 3] = [Operand::Recommender, Operand::Updater, Operand::Admission];

    /// Name of the deployment owned by the given controller instance.
    pub fn resource_name(self, vpa_name: &str) -> String {
        let prefix = match self {
            Operand::Recommender => "vpa-recommender",
            Operand::Updater => "vpa-updater",
            Operand::Admission => "vpa-admission-plugin",
        };
        format!("{}-{}", prefix, vpa_name)
    }

    pub fn app_name(self) -> &'static str {
        match self {
            Operand::Recommender => "vpa-recommender",
            Operand::Updater => "vpa-updater",
            Operand::Admission => "vpa-admission-controller",
        }
    }

    pub fn command(self) -> &'static str {
        match self {
            Operand::Recommender => "recommender",
            Operand::Updater => "updater",
            Operand::Admission => "admission-controller",
        }
    }

    pub fn service_account(self) -> &'static str {
        self.app_name()
    }

    /// The updater and admission plugin only run when the VPA is allowed to
    /// act on its recommendations.
    pub fn is_enabled(self, vpa: &VerticalPodAutoscalerController) -> bool {
        match self {
            Operand::Recommender => true,
            Operand::Updater | Operand::Admission => !vpa.spec.is_recommendation_only(),
        }
    }

    pub fn replicas(self, vpa: &VerticalPodAutoscalerController) -> i32 {
        if self.is_enabled(vpa) {
            1
        } else {
            0
        }
    }

    pub fn override_for(self, vpa: &VerticalPodAutoscalerController) -> &DeploymentOverride {
        let overrides = &vpa.spec.deployment_overrides;
        match self {
            Operand::Recommender => &overrides.recommender,
            Operand::Updater => &overrides.updater,
            Operand::Admission => &overrides.admission,
        }
    }

    /// Operand command line derived from the controller spec. Does not include
    /// override arguments.
    pub fn args(self, vpa: &VerticalPodAutoscalerController, config: &Config) -> Vec<String> {
        let spec = &vpa.spec;
        let mut args = vec![
            LOG_TO_STDERR_ARG.to_string(),
            arg(VERBOSITY_ARG, config.verbosity),
        ];

        match self {
            Operand::Recommender => {
                if let Some(v) = spec.safety_margin_fraction {
                    args.push(arg(SAFETY_MARGIN_FRACTION_ARG, v));
                }
                if let Some(v) = spec.pod_min_cpu_millicores {
                    args.push(arg(POD_MIN_CPU_MILLICORES_ARG, v));
                }
                if let Some(v) = spec.pod_min_memory_mb {
                    args.push(arg(POD_MIN_MEMORY_MB_ARG, v));
                }
            }
            Operand::Updater => {
                if let Some(v) = spec.min_replicas {
                    args.push(arg(MIN_REPLICAS_ARG, v));
                }
            }
            Operand::Admission => {
                let user_args = &spec.deployment_overrides.admission.container.args;
                if !arg_exists(user_args, KUBE_API_QPS_ARG) {
                    args.push(arg(KUBE_API_QPS_ARG, "25.0"));
                }
                if !arg_exists(user_args, KUBE_API_BURST_ARG) {
                    args.push(arg(KUBE_API_BURST_ARG, "50.0"));
                }
                args.push(arg(TLS_CERT_FILE_ARG, format!("{}/tls.crt", TLS_CERTS_PATH)));
                args.push(arg(TLS_KEY_FILE_ARG, format!("{}/tls.key", TLS_CERTS_PATH)));
                args.push(arg(
                    TLS_CA_CERT_FILE_ARG,
                    format!("{}/service-ca.crt", TLS_CA_CERTS_PATH),
                ));
                args.push(arg(WEBHOOK_TIMEOUT_ARG, 10));
            }
        }

        if !config.extra_args.is_empty() {
            args.push(config.extra_args.clone());
        }
        args
    }

    /// Pod labels, also used as the deployment's selector.
    pub fn labels(self, vpa: &VerticalPodAutoscalerController) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("vertical-pod-autoscaler".to_string(), vpa.name_any()),
            ("app".to_string(), self.app_name().to_string()),
        ])
    }

    /// The expected pod spec: base spec, then overrides in a fixed order
    /// (resources, args, node selector, tolerations), then admission extras.
    pub fn pod_spec(self, vpa: &VerticalPodAutoscalerController, config: &Config) -> PodSpec {
        let mut spec = base_pod_spec(self, self.args(vpa, config), config);
        let overrides = self.override_for(vpa);
        let container = &mut spec.containers[0];

        if let Some(resources) = overrides.container.resources() {
            container.resources = Some(resources.clone());
        }
        if !overrides.container.args.is_empty() {
            container
                .args
                .get_or_insert_with(Vec::new)
                .extend(overrides.container.args.iter().cloned());
        }
        if !overrides.node_selector.is_empty() {
            spec.node_selector = Some(overrides.node_selector.clone());
        }
        if !overrides.tolerations.is_empty() {
            spec.tolerations = Some(overrides.tolerations.clone());
        }

        if self == Operand::Admission {
            add_admission_volumes(&mut spec);
        }
        spec
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

fn base_pod_spec(operand: Operand, args: Vec<String>, config: &Config) -> PodSpec {
    PodSpec {
        service_account_name: Some(operand.service_account().to_string()),
        service_account: Some(operand.service_account().to_string()),
        priority_class_name: Some(PRIORITY_CLASS_NAME.to_string()),
        node_selector: Some(BTreeMap::from([
            ("node-role.kubernetes.io/master".to_string(), String::new()),
            ("beta.kubernetes.io/os".to_string(), "linux".to_string()),
        ])),
        containers: vec![Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(config.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec![operand.command().to_string()]),
            args: Some(args),
            env: Some(vec![EnvVar {
                name: "NAMESPACE".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        api_version: Some("v1".to_string()),
                        field_path: "metadata.namespace".to_string(),
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            }]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity("25m".to_string())),
                    ("memory".to_string(), Quantity("25Mi".to_string())),
                ])),
                ..ResourceRequirements::default()
            }),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Capabilities::default()
                }),
                run_as_non_root: Some(true),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..SeccompProfile::default()
                }),
                ..SecurityContext::default()
            }),
            termination_message_path: Some("/dev/termination-log".to_string()),
            termination_message_policy: Some("File".to_string()),
            ..Container::default()
        }],
        dns_policy: Some("ClusterFirst".to_string()),
        restart_policy: Some("Always".to_string()),
        termination_grace_period_seconds: Some(30),
        scheduler_name: Some("default-scheduler".to_string()),
        security_context: Some(PodSecurityContext::default()),
        tolerations: Some(vec![
            Toleration {
                key: Some("CriticalAddonsOnly".to_string()),
                operator: Some("Exists".to_string()),
                ..Toleration::default()
            },
            Toleration {
                key: Some("node-role.kubernetes.io/master".to_string()),
                effect: Some("NoSchedule".to_string()),
                operator: Some("Exists".to_string()),
                ..Toleration::default()
            },
        ]),
        ..PodSpec::default()
    }
}

fn add_admission_volumes(spec: &mut PodSpec) {
    let default_mode = Some(0o644);
    let container = &mut spec.containers[0];

    container
        .ports
        .get_or_insert_with(Vec::new)
        .push(ContainerPort {
            container_port: ADMISSION_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        });

    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    mounts.push(VolumeMount {
        name: TLS_CERTS_VOLUME.to_string(),
        mount_path: TLS_CERTS_PATH.to_string(),
        read_only: Some(true),
        ..VolumeMount::default()
    });
    mounts.push(VolumeMount {
        name: TLS_CA_CERTS_VOLUME.to_string(),
        mount_path: TLS_CA_CERTS_PATH.to_string(),
        read_only: Some(true),
        ..VolumeMount::default()
    });

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    volumes.push(Volume {
        name: TLS_CERTS_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(WEBHOOK_CERT_SECRET_NAME.to_string()),
            default_mode,
            ..SecretVolumeSource::default()
        }),
        ..Volume::default()
    });
    volumes.push(Volume {
        name: TLS_CA_CERTS_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: CA_CERT_CONFIG_MAP_NAME.to_string(),
            default_mode,
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VerticalPodAutoscalerControllerSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_config() -> Config {
        Config {
            name: "test".to_string(),
            namespace: "test-namespace".to_string(),
            release_version: "v100".to_string(),
            image: "test/test:v100".to_string(),
            verbosity: 10,
            ..Config::default()
        }
    }

    fn test_vpa() -> VerticalPodAutoscalerController {
        VerticalPodAutoscalerController {
            metadata: ObjectMeta {
                name: Some("test".to_string()),
                namespace: Some("test-namespace".to_string()),
                ..ObjectMeta::default()
            },
            spec: VerticalPodAutoscalerControllerSpec {
                safety_margin_fraction: Some(0.5),
                pod_min_cpu_millicores: Some(0.1),
                pod_min_memory_mb: Some(25.0),
                recommendation_only: Some(false),
                ..VerticalPodAutoscalerControllerSpec::default()
            },
            status: None,
        }
    }

    fn container_args(spec: &PodSpec) -> Vec<String> {
        spec.containers[0].args.clone().unwrap_or_default()
    }

    #[test]
    fn recommender_args() {
        let args = Operand::Recommender.args(&test_vpa(), &test_config());

        assert_eq!(
            args,
            vec![
                "--logtostderr",
                "--v=10",
                "--recommendation-margin-fraction=0.5",
                "--pod-recommendation-min-cpu-millicores=0.1",
                "--pod-recommendation-min-memory-mb=25",
            ]
        );
        assert!(!args.iter().any(|a| a.starts_with("--scale-down-delay")));
    }

    #[test]
    fn unset_fields_are_omitted() {
        let mut vpa = test_vpa();
        vpa.spec = VerticalPodAutoscalerControllerSpec::default();

        assert_eq!(
            Operand::Recommender.args(&vpa, &test_config()),
            vec!["--logtostderr", "--v=10"]
        );
        assert_eq!(
            Operand::Updater.args(&vpa, &test_config()),
            vec!["--logtostderr", "--v=10"]
        );

        vpa.spec.min_replicas = Some(2);
        assert!(Operand::Updater
            .args(&vpa, &test_config())
            .contains(&"--min-replicas=2".to_string()));
    }

    #[test]
    fn default_instance_args() {
        let vpa = crate::crd::default_instance("default", "ns");
        let args = Operand::Recommender.args(&vpa, &test_config());
        assert!(args.contains(&"--recommendation-margin-fraction=0.15".to_string()));
        assert!(args.contains(&"--pod-recommendation-min-cpu-millicores=25".to_string()));
        assert!(args.contains(&"--pod-recommendation-min-memory-mb=250".to_string()));
    }

    #[test]
    fn admission_args() {
        let args = Operand::Admission.args(&test_vpa(), &test_config());

        for expected in &[
            "--kube-api-qps=25.0",
            "--kube-api-burst=50.0",
            "--tls-cert-file=/data/tls-certs/tls.crt",
            "--tls-private-key=/data/tls-certs/tls.key",
            "--client-ca-file=/data/tls-ca-certs/service-ca.crt",
            "--webhook-timeout-seconds=10",
        ] {
            assert!(args.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn admission_rate_limits_yield_to_overrides() {
        let mut vpa = test_vpa();
        vpa.spec.deployment_overrides.admission.container.args =
            vec!["--kube-api-qps=6.0".to_string()];

        let spec = Operand::Admission.pod_spec(&vpa, &test_config());
        let args = container_args(&spec);
        assert!(!args.contains(&"--kube-api-qps=25.0".to_string()));
        assert!(args.contains(&"--kube-api-burst=50.0".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--kube-api-qps=6.0"));
    }

    #[test]
    fn extra_args_are_appended_verbatim() {
        let config = Config {
            extra_args: "--foo=bar --baz".to_string(),
            ..test_config()
        };
        for operand in Operand::ALL.iter() {
            let args = operand.args(&test_vpa(), &config);
            assert_eq!(args.last().map(String::as_str), Some("--foo=bar --baz"));
        }
    }

    #[test]
    fn recommendation_only_disables_updater_and_admission() {
        let mut vpa = test_vpa();
        vpa.spec.recommendation_only = Some(true);

        assert_eq!(Operand::Recommender.replicas(&vpa), 1);
        assert_eq!(Operand::Updater.replicas(&vpa), 0);
        assert_eq!(Operand::Admission.replicas(&vpa), 0);

        vpa.spec.recommendation_only = None;
        for operand in Operand::ALL.iter() {
            assert_eq!(operand.replicas(&vpa), 1);
        }
    }

    #[test]
    fn names() {
        assert_eq!(Operand::Recommender.resource_name("test"), "vpa-recommender-test");
        assert_eq!(Operand::Updater.resource_name("test"), "vpa-updater-test");
        assert_eq!(Operand::Admission.resource_name("test"), "vpa-admission-plugin-test");
        assert_eq!(Operand::Admission.app_name(), "vpa-admission-controller");
    }

    #[test]
    fn empty_overrides_leave_the_baseline_alone() {
        let baseline = test_vpa();
        let mut with_empty = test_vpa();
        with_empty.spec.deployment_overrides.recommender.container.resources =
            Some(ResourceRequirements::default());

        for operand in Operand::ALL.iter() {
            assert_eq!(
                operand.pod_spec(&baseline, &test_config()),
                operand.pod_spec(&with_empty, &test_config())
            );
        }
    }

    #[test]
    fn overrides_apply_per_axis() {
        let resources = ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("90m".to_string())),
                ("memory".to_string(), Quantity("90Mi".to_string())),
            ])),
            ..ResourceRequirements::default()
        };
        let args = vec!["--kube-api-qps=6.0".to_string(), "--kube-api-burst=11.0".to_string()];
        let selector = BTreeMap::from([("node-role.kubernetes.io/infra".to_string(), String::new())]);
        let tolerations = vec![Toleration {
            key: Some("node-role.kubernetes.io/infra".to_string()),
            effect: Some("NoSchedule".to_string()),
            operator: Some("Exists".to_string()),
            ..Toleration::default()
        }];

        let mut vpa = test_vpa();
        for o in [
            &mut vpa.spec.deployment_overrides.recommender,
            &mut vpa.spec.deployment_overrides.updater,
            &mut vpa.spec.deployment_overrides.admission,
        ] {
            o.container.resources = Some(resources.clone());
            o.container.args = args.clone();
            o.node_selector = selector.clone();
            o.tolerations = tolerations.clone();
        }

        for operand in Operand::ALL.iter() {
            let base_args = operand.args(&vpa, &test_config());
            let spec = operand.pod_spec(&vpa, &test_config());
            let got = container_args(&spec);

            assert_eq!(spec.containers[0].resources.as_ref(), Some(&resources));
            assert_eq!(&got[..base_args.len()], &base_args[..], "{}", operand);
            assert_eq!(&got[base_args.len()..], &args[..], "{}", operand);
            assert_eq!(spec.node_selector.as_ref(), Some(&selector));
            assert_eq!(spec.tolerations.as_ref(), Some(&tolerations));
        }
    }

    #[test]
    fn only_admission_gets_port_and_volumes() {
        let vpa = test_vpa();
        let admission = Operand::Admission.pod_spec(&vpa, &test_config());
        let container = &admission.containers[0];

        assert_eq!(container.ports.as_ref().map(Vec::len), Some(1));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8000);
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().all(|m| m.read_only == Some(true)));
        let volumes = admission.volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0].secret.as_ref().and_then(|s| s.secret_name.as_deref()),
            Some("vpa-tls-certs")
        );
        assert_eq!(
            volumes[1].config_map.as_ref().map(|c| c.name.as_str()),
            Some("vpa-tls-ca-certs")
        );

        for operand in [Operand::Recommender, Operand::Updater] {
            let spec = operand.pod_spec(&vpa, &test_config());
            assert!(spec.volumes.is_none());
            assert!(spec.containers[0].ports.is_none());
            assert_eq!(spec.containers[0].command, Some(vec![operand.command().to_string()]));
        }
    }
}
