//! StatefulSet generation for replica set members.
//!
//! Every data member gets its own single-replica StatefulSet named after
//! its fronting Service, so members can be added and removed individually;
//! the arbiter gets one more. Update strategy is OnDelete: rolling
//! restarts are driven by the operator, never by the workload controller.

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::controller::labels::{
    LABEL_KEY_APP, LABEL_KEY_ARBITER, LABEL_KEY_REVISION_HASH, LABEL_VAL_TRUE, Labels, with_label,
};
use crate::crd::MongoDb;

use super::common::{
    CONFIG_MOUNT_PATH, DB_PATH, DEFAULT_PORT, KEYFILE_MOUNT_PATH, METRICS_PORT, METRICS_PORT_NAME,
    SUFFIX_CONFIG_VOLUME, SUFFIX_KEYFILE_SECRET, SUFFIX_KEYFILE_VOLUME, owner_reference,
    resource_requirements,
};

const CONTAINER_NAME: &str = "mongo";
const EXPORTER_CONTAINER_NAME: &str = "metrics-exporter";
const EXPORTER_IMAGE: &str = "percona/mongodb_exporter:0.40";
const SECRET_FILE_MODE: i32 = 0o400;

/// Build the StatefulSet for one member.
///
/// `labels` must already carry the member's role labels; the builder stamps
/// the revision hash and the per-workload app label on top.
pub fn mongo_statefulset(
    resource: &MongoDb,
    name: &str,
    labels: Labels,
    command: Vec<String>,
) -> StatefulSet {
    let namespace = resource.namespace();
    let revision = resource
        .status
        .as_ref()
        .map(|s| s.current_revision.clone())
        .unwrap_or_default();

    let labels = with_label(labels, LABEL_KEY_REVISION_HASH, &revision);
    let labels = with_label(labels, LABEL_KEY_APP, name);
    let is_arbiter = labels.get(LABEL_KEY_ARBITER).map(String::as_str) == Some(LABEL_VAL_TRUE);

    let mut containers = vec![Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(resource.spec.image.clone()),
        image_pull_policy: resource.spec.image_pull_policy.clone(),
        command: Some(command),
        resources: Some(resource_requirements(resource.spec.resources.as_ref())),
        ports: Some(vec![ContainerPort {
            container_port: DEFAULT_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(volume_mounts(resource, is_arbiter)),
        ..Default::default()
    }];

    if resource.spec.metrics_exporter.enable {
        containers.push(exporter_container(resource, is_arbiter));
    }

    let volume_claim_templates = if is_arbiter {
        // Arbiters hold no data.
        None
    } else {
        Some(vec![data_pvc(resource)])
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.clone(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(volumes(resource)),
                    node_selector: if resource.spec.scheduling.node_selector.is_empty() {
                        None
                    } else {
                        Some(resource.spec.scheduling.node_selector.clone())
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
            volume_claim_templates,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volumes(resource: &MongoDb) -> Vec<Volume> {
    let name = resource.name_any();
    let mut volumes = vec![Volume {
        name: format!("{}{}", name, SUFFIX_KEYFILE_VOLUME),
        secret: Some(SecretVolumeSource {
            secret_name: Some(format!("{}{}", name, SUFFIX_KEYFILE_SECRET)),
            default_mode: Some(SECRET_FILE_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }];

    if let Some(config_ref) = &resource.spec.custom_config_ref {
        volumes.push(Volume {
            name: format!("{}{}", name, SUFFIX_CONFIG_VOLUME),
            config_map: Some(ConfigMapVolumeSource {
                name: config_ref.clone(),
                default_mode: Some(SECRET_FILE_MODE),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    volumes
}

fn volume_mounts(resource: &MongoDb, is_arbiter: bool) -> Vec<VolumeMount> {
    let name = resource.name_any();
    let mut mounts = vec![VolumeMount {
        name: format!("{}{}", name, SUFFIX_KEYFILE_VOLUME),
        mount_path: KEYFILE_MOUNT_PATH.to_string(),
        ..Default::default()
    }];

    if resource.spec.custom_config_ref.is_some() {
        mounts.push(VolumeMount {
            name: format!("{}{}", name, SUFFIX_CONFIG_VOLUME),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }

    if !is_arbiter {
        mounts.push(VolumeMount {
            name: data_volume_name(resource),
            mount_path: DB_PATH.to_string(),
            ..Default::default()
        });
    }

    mounts
}

fn data_volume_name(resource: &MongoDb) -> String {
    format!("{}-replset", resource.name_any())
}

fn data_pvc(resource: &MongoDb) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(data_volume_name(resource)),
            namespace: resource.namespace(),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: resource.spec.persistence.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(
                    [(
                        "storage".to_string(),
                        Quantity(resource.spec.persistence.storage.clone()),
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Metrics exporter sidecar. Arbiters expose no credentialed access, so
/// their exporter dials without auth.
fn exporter_container(resource: &MongoDb, is_arbiter: bool) -> Container {
    let uri = if is_arbiter {
        format!("mongodb://127.0.0.1:{}/?connect=direct", DEFAULT_PORT)
    } else {
        format!(
            "mongodb://clusterMonitor:{}@127.0.0.1:{}/?authSource=admin&connect=direct",
            resource.spec.root_password.clone().unwrap_or_default(),
            DEFAULT_PORT
        )
    };

    Container {
        name: EXPORTER_CONTAINER_NAME.to_string(),
        image: Some(EXPORTER_IMAGE.to_string()),
        env: Some(vec![EnvVar {
            name: "MONGODB_URI".to_string(),
            value: Some(uri),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            name: Some(METRICS_PORT_NAME.to_string()),
            container_port: METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: Some(resource_requirements(
            resource.spec.metrics_exporter.resources.as_ref(),
        )),
        ..Default::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::controller::labels::arbiter_label;
    use crate::resources::common::mongod_command;

    fn sample() -> MongoDb {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "mongodb.operator.io/v1alpha1",
            "kind": "MongoDb",
            "metadata": {"name": "sample", "namespace": "default", "uid": "u1"},
            "spec": {"members": 3, "memberConfigRef": "sample-hosts"}
        }))
        .unwrap()
    }

    #[test]
    fn test_data_statefulset_has_pvc_and_on_delete() {
        let cr = sample();
        let sts = mongo_statefulset(&cr, "sample-svc-0", Labels::new(), mongod_command("rs0", false));

        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.update_strategy.unwrap().type_.as_deref(),
            Some("OnDelete")
        );
        assert_eq!(spec.volume_claim_templates.unwrap().len(), 1);

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.containers[0].name, "mongo");
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == DB_PATH));
    }

    #[test]
    fn test_arbiter_statefulset_has_no_pvc() {
        let cr = sample();
        let sts = mongo_statefulset(
            &cr,
            "sample-svc-arbiter",
            arbiter_label(Labels::new()),
            mongod_command("rs0", false),
        );

        let spec = sts.spec.unwrap();
        assert!(spec.volume_claim_templates.is_none());
        let pod = spec.template.spec.unwrap();
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert!(!mounts.iter().any(|m| m.mount_path == DB_PATH));
    }

    #[test]
    fn test_exporter_sidecar_added_when_enabled() {
        let mut cr = sample();
        cr.spec.metrics_exporter.enable = true;
        let sts = mongo_statefulset(&cr, "sample-svc-0", Labels::new(), mongod_command("rs0", false));
        let pod = sts.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[1].name, EXPORTER_CONTAINER_NAME);
    }

    #[test]
    fn test_owner_reference_set() {
        let cr = sample();
        let sts = mongo_statefulset(&cr, "sample-svc-0", Labels::new(), vec![]);
        let owners = sts.metadata.owner_references.unwrap();
        assert_eq!(owners[0].name, "sample");
        assert_eq!(owners[0].kind, "MongoDb");
    }
}
