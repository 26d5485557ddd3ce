//! Service generation.
//!
//! Each member's Service publishes a NodePort so the member is reachable at
//! `clusterVIP:nodePort` from outside the hosting cluster; the metrics
//! Service fronts the exporter sidecar.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::controller::labels::Labels;
use crate::crd::MongoDb;

use super::common::{DEFAULT_PORT, METRICS_PORT, METRICS_PORT_NAME, owner_reference};

/// Client Service for one member; NodePort unless headless.
pub fn member_service(
    resource: &MongoDb,
    name: &str,
    labels: Labels,
    selector: Labels,
    headless: bool,
) -> Service {
    let mut spec = ServiceSpec {
        ports: Some(vec![ServicePort {
            port: DEFAULT_PORT,
            target_port: Some(IntOrString::Int(DEFAULT_PORT)),
            ..Default::default()
        }]),
        selector: Some(selector),
        ..Default::default()
    };
    if headless {
        spec.cluster_ip = Some("None".to_string());
    } else {
        spec.type_ = Some("NodePort".to_string());
    }

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: resource.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// ClusterIP Service fronting the metrics exporter of one workload.
pub fn metric_service(resource: &MongoDb, name: &str, labels: Labels, selector: Labels) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: resource.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(METRICS_PORT_NAME.to_string()),
                port: METRICS_PORT,
                target_port: Some(IntOrString::Int(METRICS_PORT)),
                ..Default::default()
            }]),
            selector: Some(selector),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `<workload>-exporter`, the metrics Service name for a workload.
pub fn metric_service_name(sts_name: &str) -> String {
    format!("{}-exporter", sts_name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

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
    fn test_member_service_node_port() {
        let svc = member_service(&sample(), "sample-svc-0", Labels::new(), Labels::new(), false);
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.ports.unwrap()[0].port, DEFAULT_PORT);
    }

    #[test]
    fn test_member_service_headless() {
        let svc = member_service(&sample(), "sample-svc-0", Labels::new(), Labels::new(), true);
        assert_eq!(svc.spec.unwrap().cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn test_metric_service_name() {
        assert_eq!(metric_service_name("sample-svc-0"), "sample-svc-0-exporter");
    }
}
