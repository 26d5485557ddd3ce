//! MongoDb Custom Resource Definition.
//!
//! Defines the MongoDb CRD for deploying and managing MongoDB replica sets
//! on Kubernetes. The status subresource carries everything the reconciler
//! needs to survive a restart of the operator process: coarse state, the
//! rolling-restart phase, bootstrap conditions and the last applied
//! ("current") info that requires a restart to change.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::client::types::ReplSetMemberStatus;

/// MongoDb is a custom resource for deploying MongoDB replica sets.
///
/// Example:
/// ```yaml
/// apiVersion: mongodb.operator.io/v1alpha1
/// kind: MongoDb
/// metadata:
///   name: sample
/// spec:
///   members: 3
///   arbiter: false
///   rsInit: true
///   memberConfigRef: sample-hosts
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mongodb.operator.io",
    version = "v1alpha1",
    kind = "MongoDb",
    plural = "mongodbs",
    shortname = "mdb",
    status = "MongoDbStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Members", "type":"integer", "jsonPath":".spec.members"}"#,
    printcolumn = r#"{"name":"Arbiter", "type":"boolean", "jsonPath":".spec.arbiter"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MongoDbSpec {
    /// Number of data-bearing replica set members.
    #[serde(default = "default_members")]
    pub members: i32,

    /// Whether the replica set includes a vote-only arbiter member.
    #[serde(default)]
    pub arbiter: bool,

    /// Suspend reconciliation for this instance.
    #[serde(default)]
    pub pause: bool,

    /// Whether this operator instance is allowed to run `rs.initiate` for
    /// the replica set. In a federated deployment only one cluster does.
    #[serde(default)]
    pub rs_init: bool,

    /// Topology mode. Only a single replica set is modeled today; the enum
    /// exists so additional modes fail loudly instead of silently falling
    /// through to the replica-set branch.
    #[serde(default)]
    pub mode: TopologyMode,

    /// MongoDB container image.
    #[serde(default = "default_image")]
    pub image: String,

    /// Image pull policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// CPU/memory shape for the mongod container. Changing this triggers a
    /// rolling restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSetting>,

    /// Root password. When unset a random one is generated into the root
    /// credential Secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,

    /// Name of the ConfigMap publishing the externally reachable
    /// `host:port` for every member (the host directory).
    pub member_config_ref: String,

    /// Optional ConfigMap holding a custom mongod.yaml.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config_ref: Option<String>,

    /// Application database user.
    #[serde(default)]
    pub db_user: DbUserSpec,

    /// Metrics exporter sidecar.
    #[serde(default)]
    pub metrics_exporter: MetricsExporterSpec,

    /// Persistent storage for data members.
    #[serde(default)]
    pub persistence: PersistenceSpec,

    /// Pod scheduling constraints.
    #[serde(default)]
    pub scheduling: SchedulingSpec,
}

fn default_members() -> i32 {
    3
}

fn default_image() -> String {
    "mongo:5.0".to_string()
}

/// Supported database topologies.
///
/// Deserialization of an unrecognized value is an error by design; there is
/// no default fallthrough branch in the reconciler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum TopologyMode {
    /// A single replica set with an optional arbiter.
    #[default]
    ReplicaSet,
}

/// CPU/memory requests and limits, expressed as resource quantity strings.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSetting {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Application database user managed alongside the cluster users.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DbUserSpec {
    /// Database the user is granted readWrite on.
    #[serde(default)]
    pub name: String,
    /// User name.
    #[serde(default)]
    pub user: String,
    /// Password; changing it updates the live user.
    #[serde(default)]
    pub password: String,
    /// Whether the user is managed at all.
    #[serde(default)]
    pub enable: bool,
}

/// Metrics exporter sidecar configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsExporterSpec {
    #[serde(default)]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSetting>,
}

/// Persistent storage configuration for data members.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Size of the PersistentVolumeClaim.
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Storage class; cluster default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

impl Default for PersistenceSpec {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            storage_class_name: None,
        }
    }
}

fn default_storage() -> String {
    "10Gi".to_string()
}

/// Pod scheduling constraints applied to every managed StatefulSet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingSpec {
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

// ============================================================================
// Status
// ============================================================================

/// Coarse health of the instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MongoState {
    Running,
    Pause,
    Reconciling,
    Error,
    #[default]
    Unknown,
}

impl std::fmt::Display for MongoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MongoState::Running => "Running",
            MongoState::Pause => "Pause",
            MongoState::Reconciling => "Reconciling",
            MongoState::Error => "Error",
            MongoState::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// Phase of the rolling-restart state machine.
///
/// Persisted in status because a restart spans several reconcile passes and
/// must survive an operator crash without double-deleting the primary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RestartState {
    #[default]
    NotInProcess,
    SecondaryDeleted,
    PrimaryDeleted,
}

impl std::fmt::Display for RestartState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RestartState::NotInProcess => "NotInProcess",
            RestartState::SecondaryDeleted => "SecondaryDeleted",
            RestartState::PrimaryDeleted => "PrimaryDeleted",
        };
        write!(f, "{}", s)
    }
}

/// One-time bootstrap steps recorded in conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MongoConditionType {
    #[serde(rename = "userRoot")]
    UserRoot,
    #[serde(rename = "userClusterAdmin")]
    UserClusterAdmin,
    #[serde(rename = "userClusterMonitor")]
    UserClusterMonitor,
    #[serde(rename = "userDB")]
    UserDb,
    #[serde(rename = "rsInit")]
    RsInit,
    #[serde(rename = "rsConfig")]
    RsConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MongoConditionStatus {
    True,
    False,
}

/// Idempotency marker for a non-repeatable bootstrap side effect.
///
/// Keyed by (type, message) where message carries the replica set name, so a
/// federated instance can track the same step independently per replica set.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MongoCondition {
    pub status: MongoConditionStatus,
    #[serde(rename = "type")]
    pub r#type: MongoConditionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Last applied settings that require a restart (or another deliberate
/// action) to take effect; drift against the spec drives the restart check.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CurrentInfo {
    /// Applied application-user password, used to detect password changes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub db_user_password: String,

    /// Applied resource shape; a mismatch with the spec triggers a rolling
    /// restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSetting>,

    /// Applied custom config reference.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom_config: String,

    /// Applied member count.
    #[serde(default)]
    pub members: i32,
}

/// MongoDbStatus defines the observed state of MongoDb.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MongoDbStatus {
    #[serde(default)]
    pub state: MongoState,

    #[serde(default)]
    pub restart_state: RestartState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_address: String,

    /// Last observed replica set member statuses.
    #[serde(default, rename = "replset", skip_serializing_if = "Vec::is_empty")]
    pub repl_set: Vec<ReplSetMemberStatus>,

    /// Hash of the applied spec, stamped onto managed pods.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_revision: String,

    #[serde(default)]
    pub current_info: CurrentInfo,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MongoCondition>,
}

impl MongoDb {
    /// Resource shape drift between spec and the applied current info.
    ///
    /// `None` means no current info has been recorded yet; the caller records
    /// the spec shape without restarting.
    pub fn resources_drifted(&self) -> Option<bool> {
        let current = self
            .status
            .as_ref()
            .and_then(|s| s.current_info.resources.as_ref());
        match current {
            None => None,
            Some(current) => Some(self.spec.resources.as_ref() != Some(current)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_rejects_unknown_value() {
        let err = serde_json::from_str::<TopologyMode>("\"Sharded\"");
        assert!(err.is_err());
        let ok: TopologyMode = serde_json::from_str("\"ReplicaSet\"").unwrap();
        assert_eq!(ok, TopologyMode::ReplicaSet);
    }

    #[test]
    fn test_condition_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MongoConditionType::UserClusterAdmin).unwrap(),
            "\"userClusterAdmin\""
        );
        assert_eq!(
            serde_json::to_string(&MongoConditionType::RsInit).unwrap(),
            "\"rsInit\""
        );
    }

    #[test]
    fn test_resources_drifted() {
        let spec = serde_json::json!({
            "members": 3,
            "memberConfigRef": "sample-hosts",
            "resources": {"limits": {"cpu": "1"}}
        });
        let mut cr: MongoDb = serde_json::from_value(serde_json::json!({
            "apiVersion": "mongodb.operator.io/v1alpha1",
            "kind": "MongoDb",
            "metadata": {"name": "sample", "namespace": "default"},
            "spec": spec
        }))
        .unwrap();

        // No status yet: nothing recorded.
        assert_eq!(cr.resources_drifted(), None);

        let mut status = MongoDbStatus::default();
        status.current_info.resources = Some(ResourceSetting {
            limits: [("cpu".to_string(), "1".to_string())].into(),
            ..Default::default()
        });
        cr.status = Some(status);
        assert_eq!(cr.resources_drifted(), Some(false));

        cr.spec.resources = Some(ResourceSetting {
            limits: [("cpu".to_string(), "2".to_string())].into(),
            ..Default::default()
        });
        assert_eq!(cr.resources_drifted(), Some(true));
    }
}
