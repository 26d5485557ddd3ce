//! Shared helpers for object generation.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::{MongoDb, ResourceSetting};

/// Default mongod client port.
pub const DEFAULT_PORT: i32 = 27017;
/// Exporter sidecar metrics port.
pub const METRICS_PORT: i32 = 9216;
pub const METRICS_PORT_NAME: &str = "metrics";

pub const KEYFILE_MOUNT_PATH: &str = "/etc/keyfile-secret";
pub const KEYFILE_SECRET_KEY: &str = "mongo-keyfile";
pub const CONFIG_MOUNT_PATH: &str = "/etc/mongo-config";
pub const CONFIG_MONGOD_KEY: &str = "mongod.yaml";
pub const DB_PATH: &str = "/data/db";

pub const SUFFIX_KEYFILE_SECRET: &str = "-keyfile-secret";
pub const SUFFIX_KEYFILE_VOLUME: &str = "-keyfile-secret-volume";
pub const SUFFIX_CONFIG_VOLUME: &str = "-config-volume";

/// Owner reference so owned objects are garbage collected with the CR.
pub fn owner_reference(resource: &MongoDb) -> OwnerReference {
    OwnerReference {
        api_version: MongoDb::api_version(&()).to_string(),
        kind: MongoDb::kind(&()).to_string(),
        name: resource.name_any(),
        uid: resource.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Quantity map for container resource requirements.
pub fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

/// Convert the CRD resource shape into container requirements.
pub fn resource_requirements(
    setting: Option<&ResourceSetting>,
) -> k8s_openapi::api::core::v1::ResourceRequirements {
    let setting = setting.cloned().unwrap_or_default();
    k8s_openapi::api::core::v1::ResourceRequirements {
        requests: quantities(&setting.requests),
        limits: quantities(&setting.limits),
        ..Default::default()
    }
}

/// The mongod launch command for a replica set member.
pub fn mongod_command(rs_name: &str, custom_config: bool) -> Vec<String> {
    let mut command = vec![
        "mongod".to_string(),
        "--port".to_string(),
        DEFAULT_PORT.to_string(),
        "--bind_ip".to_string(),
        "0.0.0.0".to_string(),
        "--replSet".to_string(),
        rs_name.to_string(),
        "--auth".to_string(),
        "--keyFile".to_string(),
        format!("{}/{}", KEYFILE_MOUNT_PATH, KEYFILE_SECRET_KEY),
    ];
    if custom_config {
        command.push("--config".to_string());
        command.push(format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_MONGOD_KEY));
    }
    command
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_mongod_command_shape() {
        let cmd = mongod_command("rs0", false);
        assert_eq!(cmd[0], "mongod");
        assert!(cmd.contains(&"--replSet".to_string()));
        assert!(cmd.contains(&"rs0".to_string()));
        assert!(cmd.contains(&"--auth".to_string()));
        assert!(!cmd.contains(&"--config".to_string()));

        let with_config = mongod_command("rs0", true);
        assert!(with_config.contains(&"--config".to_string()));
    }

    #[test]
    fn test_quantities_empty_is_none() {
        assert!(quantities(&BTreeMap::new()).is_none());
    }
}
