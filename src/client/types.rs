//! Wire-protocol types for the MongoDB replication admin surface.
//!
//! Mirrors the documents exchanged with `replSetGetConfig`,
//! `replSetReconfig`, `replSetGetStatus` and `serverStatus`.

use bson::Document;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Admin database every replication command runs against.
pub const DB_ADMIN: &str = "admin";
/// The `local` database, readable by the monitor user.
pub const DB_LOCAL: &str = "local";

/// Hard cap on replica set size.
pub const MAX_MEMBERS: usize = 50;
/// At most this many members may hold a vote.
pub const MAX_VOTING_MEMBERS: usize = 7;

/// Role strings reported by `replSetGetStatus`.
pub const ROLE_PRIMARY: &str = "PRIMARY";
pub const ROLE_SECONDARY: &str = "SECONDARY";
pub const ROLE_ARBITER: &str = "ARBITER";

/// Numeric member states paired with the role strings above.
pub const STATE_PRIMARY: i32 = 1;
pub const STATE_SECONDARY: i32 = 2;
pub const STATE_ARBITER: i32 = 7;

/// Built-in user names managed by the operator.
pub const MONGO_ROOT: &str = "root";
pub const MONGO_CLUSTER_ADMIN: &str = "clusterAdmin";
pub const MONGO_CLUSTER_MONITOR: &str = "clusterMonitor";
pub const MONGO_READ_WRITE: &str = "readWrite";

/// Keys inside credential Secrets.
pub const SECRET_KEY_USER: &str = "MONGO_USER";
pub const SECRET_KEY_PASSWORD: &str = "MONGO_PASSWORD";
pub const SECRET_KEY_ROLE: &str = "MONGO_ROLE";
pub const SECRET_KEY_DB: &str = "MONGO_DB";

/// Errors surfaced by the wire client.
#[derive(Error, Debug)]
pub enum MongoError {
    /// The server answered but reported a non-success status code.
    #[error("command exec not ok: {0}")]
    CommandNotOk(String),

    /// Driver-level failure (connect, transport, server error document).
    #[error("mongo driver error: {0}")]
    Driver(#[from] mongodb::error::Error),

    /// The fixed per-command timeout elapsed; reported as a transport
    /// error, not a command failure.
    #[error("timed out running {0}")]
    Timeout(String),

    #[error("invalid server response: {0}")]
    Decode(#[from] bson::de::Error),

    #[error("invalid command document: {0}")]
    Encode(#[from] bson::ser::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// One member entry of the replica set configuration document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Member {
    #[serde(rename = "_id")]
    pub id: i32,
    pub host: String,
    pub priority: i32,
    #[serde(rename = "slaveDelay")]
    pub slave_delay: i64,
    pub votes: i32,
    #[serde(rename = "arbiterOnly")]
    pub arbiter_only: bool,
    #[serde(rename = "buildIndexes")]
    pub build_indexes: bool,
    pub hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

impl Member {
    /// A data-bearing member for the given host; votes and id are assigned
    /// by the directory resolution and membership algebra.
    pub fn data(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            build_indexes: true,
            ..Default::default()
        }
    }

    /// A vote-only arbiter member for the given host.
    pub fn arbiter(host: impl Into<String>) -> Self {
        Self {
            arbiter_only: true,
            ..Self::data(host)
        }
    }
}

/// Replica set configuration document from `replSetGetConfig`.
///
/// `settings` is carried as an opaque document so a reconfig round-trips
/// fields this operator does not model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplSetConfig {
    #[serde(rename = "_id")]
    pub id: String,
    pub members: Vec<Member>,
    pub version: i32,
    #[serde(
        rename = "protocolVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub protocol_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configsvr: Option<bool>,
    #[serde(
        rename = "writeConcernMajorityJournalDefault",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub write_concern_majority_journal_default: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Document>,
}

/// One member entry of `replSetGetStatus`, kept verbatim in the CR status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReplSetMemberStatus {
    #[serde(rename = "name")]
    pub host: String,
    #[serde(rename = "stateStr")]
    pub state_str: String,
    #[serde(rename = "syncSourceHost", skip_serializing_if = "String::is_empty")]
    pub sync_source_host: String,
    #[serde(rename = "_id")]
    pub id: i32,
    /// Reported as a double on the wire.
    pub health: f64,
    pub state: i32,
}

/// The `repl` section of `serverStatus`, describing a single node's own view.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerReplInfo {
    pub primary: String,
    pub me: String,
    #[serde(rename = "ismaster")]
    pub is_master: bool,
    pub secondary: bool,
    #[serde(rename = "arbiterOnly")]
    pub arbiter_only: bool,
}

/// Wrapper documents: every admin command response carries an `ok` code.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CommandResponse {
    pub ok: f64,
    pub errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplSetConfigWrap {
    pub config: Option<ReplSetConfig>,
    #[serde(default)]
    pub ok: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReplSetStatusResponse {
    pub members: Vec<ReplSetMemberStatus>,
    pub ok: f64,
}

#[derive(Debug, Deserialize)]
pub struct ServerStatusResponse {
    pub repl: ServerReplInfo,
    #[serde(default)]
    pub ok: f64,
}

/// Result of cross-referencing every member's role string against its
/// numeric state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemberHealth {
    /// Hosts whose role cannot be determined (role/state mismatch or an
    /// unrecognized role string).
    pub unknown_hosts: Vec<String>,
    /// Hosts whose role and state agree.
    pub healthy_hosts: Vec<String>,
}

/// Partition members into healthy and unknown hosts.
///
/// A PRIMARY must report state 1, a SECONDARY state 2 and an ARBITER state
/// 7; any mismatch, or a role string outside those three, marks the host
/// unknown.
pub fn classify_member_health(members: &[ReplSetMemberStatus]) -> MemberHealth {
    let mut health = MemberHealth::default();
    for m in members {
        let expected = match m.state_str.as_str() {
            ROLE_PRIMARY => Some(STATE_PRIMARY),
            ROLE_SECONDARY => Some(STATE_SECONDARY),
            ROLE_ARBITER => Some(STATE_ARBITER),
            _ => None,
        };
        match expected {
            Some(state) if m.state == state => health.healthy_hosts.push(m.host.clone()),
            _ => {
                tracing::info!(host = %m.host, role = %m.state_str, state = m.state,
                    "member role/state mismatch");
                health.unknown_hosts.push(m.host.clone());
            }
        }
    }
    health
}

/// The host reported as primary, if any member claims the role.
pub fn primary_host(members: &[ReplSetMemberStatus]) -> Option<String> {
    members
        .iter()
        .find(|m| m.state_str == ROLE_PRIMARY)
        .map(|m| m.host.clone())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn status(host: &str, role: &str, state: i32) -> ReplSetMemberStatus {
        ReplSetMemberStatus {
            host: host.to_string(),
            state_str: role.to_string(),
            state,
            health: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_all_healthy() {
        let members = vec![
            status("10.0.0.1:27017", ROLE_PRIMARY, 1),
            status("10.0.0.2:27017", ROLE_SECONDARY, 2),
            status("10.0.0.3:27017", ROLE_ARBITER, 7),
        ];
        let health = classify_member_health(&members);
        assert_eq!(health.healthy_hosts.len(), 3);
        assert!(health.unknown_hosts.is_empty());
    }

    #[test]
    fn test_classify_primary_with_secondary_state_is_unknown() {
        let members = vec![status("10.0.0.1:27017", ROLE_PRIMARY, 2)];
        let health = classify_member_health(&members);
        assert_eq!(health.unknown_hosts, vec!["10.0.0.1:27017".to_string()]);
        assert!(health.healthy_hosts.is_empty());
    }

    #[test]
    fn test_classify_unrecognized_role_is_unknown() {
        let members = vec![
            status("10.0.0.1:27017", "ROLLBACK", 9),
            status("10.0.0.2:27017", ROLE_SECONDARY, 2),
        ];
        let health = classify_member_health(&members);
        assert_eq!(health.unknown_hosts, vec!["10.0.0.1:27017".to_string()]);
        assert_eq!(health.healthy_hosts, vec!["10.0.0.2:27017".to_string()]);
    }

    #[test]
    fn test_primary_host() {
        let members = vec![
            status("10.0.0.2:27017", ROLE_SECONDARY, 2),
            status("10.0.0.1:27017", ROLE_PRIMARY, 1),
        ];
        assert_eq!(primary_host(&members), Some("10.0.0.1:27017".to_string()));
        assert_eq!(primary_host(&members[..1]), None);
    }

    #[test]
    fn test_member_status_decodes_double_health() {
        let doc = bson::doc! {
            "name": "10.0.0.1:27017",
            "stateStr": "PRIMARY",
            "_id": 0,
            "health": 1.0,
            "state": 1,
        };
        let status: ReplSetMemberStatus = bson::from_document(doc).unwrap();
        assert_eq!(status.state, 1);
        assert_eq!(status.health, 1.0);
    }

    #[test]
    fn test_member_wire_names() {
        let member = Member {
            id: 3,
            votes: 1,
            priority: 1,
            ..Member::data("10.0.0.1:27017")
        };
        let json = serde_json::to_value(&member).unwrap();
        assert_eq!(json["_id"], 3);
        assert_eq!(json["arbiterOnly"], false);
        assert_eq!(json["buildIndexes"], true);
        assert_eq!(json["slaveDelay"], 0);
    }
}
