use crate::config::Config;
use crate::crd::VerticalPodAutoscalerController;
use crate::operand::{Operand, ADMISSION_PORT};
use crate::util::{CRITICAL_POD_ANNOTATION, RELEASE_VERSION_ANNOTATION};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

pub const WEBHOOK_SERVICE_NAME: &str = "vpa-webhook";
pub const WEBHOOK_CERT_SECRET_NAME: &str = "vpa-tls-certs";
pub const CA_CERT_CONFIG_MAP_NAME: &str = "vpa-tls-ca-certs";

pub const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";
pub const INJECT_CA_BUNDLE_ANNOTATION: &str = "service.beta.openshift.io/inject-cabundle";

fn common_annotations(annotations: &mut BTreeMap<String, String>, release: &str) {
    annotations.insert(CRITICAL_POD_ANNOTATION.to_string(), String::new());
    annotations.insert(RELEASE_VERSION_ANNOTATION.to_string(), release.to_string());
}

/// Stamps the deployment and its pod template with the release bookkeeping
/// annotations, leaving any other annotations alone.
pub fn annotate_deployment(deployment: &mut Deployment, release: &str) {
    common_annotations(
        deployment.metadata.annotations.get_or_insert_with(BTreeMap::new),
        release,
    );
    let template = &mut deployment
        .spec
        .get_or_insert_with(DeploymentSpec::default)
        .template;
    common_annotations(
        template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .annotations
            .get_or_insert_with(BTreeMap::new),
        release,
    );
}

pub fn annotate_service(service: &mut Service, release: &str) {
    let annotations = service.metadata.annotations.get_or_insert_with(BTreeMap::new);
    common_annotations(annotations, release);
    annotations.insert(
        SERVING_CERT_ANNOTATION.to_string(),
        WEBHOOK_CERT_SECRET_NAME.to_string(),
    );
}

pub fn annotate_config_map(config_map: &mut ConfigMap, release: &str) {
    let annotations = config_map.metadata.annotations.get_or_insert_with(BTreeMap::new);
    common_annotations(annotations, release);
    annotations.insert(INJECT_CA_BUNDLE_ANNOTATION.to_string(), "true".to_string());
}

/// The deployment running `operand` for the given controller instance.
pub fn deployment(
    operand: Operand,
    vpa: &VerticalPodAutoscalerController,
    config: &Config,
) -> Deployment {
    let labels = operand.labels(vpa);
    let mut deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(operand.resource_name(&vpa.name_any())),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(operand.replicas(vpa)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(operand.pod_spec(vpa, config)),
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    };
    annotate_deployment(&mut deployment, &config.release_version);
    deployment
}

/// Fronts the admission plugin's webhook endpoint.
pub fn webhook_service(config: &Config) -> Service {
    let mut service = Service {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_SERVICE_NAME.to_string()),
            namespace: Some(config.namespace.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 443,
                target_port: Some(IntOrString::Int(ADMISSION_PORT)),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                Operand::Admission.app_name().to_string(),
            )])),
            ..ServiceSpec::default()
        }),
        status: None,
    };
    annotate_service(&mut service, &config.release_version);
    service
}

/// Empty config map the service CA operator fills with its bundle.
pub fn ca_config_map(config: &Config) -> ConfigMap {
    let mut config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(CA_CERT_CONFIG_MAP_NAME.to_string()),
            namespace: Some(config.namespace.clone()),
            ..ObjectMeta::default()
        },
        ..ConfigMap::default()
    };
    annotate_config_map(&mut config_map, &config.release_version);
    config_map
}
