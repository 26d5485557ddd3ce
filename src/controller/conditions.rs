//! Status persistence and the bootstrap condition ledger.
//!
//! Conditions record one-time bootstrap side effects (user creation,
//! replica set initiation) keyed by (type, replica set name): once a
//! condition is True it is never reconsidered, which is what keeps those
//! non-idempotent calls from running twice. Every status mutation goes
//! through [`Base::persist_status`], which re-reads the object on a write
//! conflict instead of assuming the in-memory copy is current.

use kube::api::PostParams;
use tracing::{debug, warn};

use crate::crd::{
    CurrentInfo, MongoCondition, MongoConditionStatus, MongoConditionType, MongoDbStatus,
    MongoState, ResourceSetting, RestartState,
};

use super::error::{Error, Result};
use super::instance::Base;
use super::labels::data_label;

/// Find a condition by its (type, message) key.
pub fn find_condition<'a>(
    conds: &'a [MongoCondition],
    r#type: MongoConditionType,
    message: &str,
) -> Option<&'a MongoCondition> {
    conds
        .iter()
        .find(|c| c.r#type == r#type && c.message == message)
}

/// Whether the condition exists and is True.
pub fn condition_true(conds: &[MongoCondition], r#type: MongoConditionType, message: &str) -> bool {
    find_condition(conds, r#type, message)
        .is_some_and(|c| c.status == MongoConditionStatus::True)
}

/// Append or update a condition in place, stamping the transition time.
/// Conditions are never removed.
pub fn upsert_condition(status: &mut MongoDbStatus, mut condition: MongoCondition) {
    condition.last_transition_time = Some(
        chrono::Utc::now()
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );

    match status
        .conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type && c.message == condition.message)
    {
        Some(existing) => *existing = condition,
        None => status.conditions.push(condition),
    }
}

impl Base {
    fn status_mut(&mut self) -> &mut MongoDbStatus {
        self.cr.status.get_or_insert_with(MongoDbStatus::default)
    }

    pub fn status(&self) -> MongoDbStatus {
        self.cr.status.clone().unwrap_or_default()
    }

    /// Write the whole status document back.
    ///
    /// On a conflict the object is re-fetched, our status is re-applied on
    /// top of the fresh copy and the write retried once; a concurrent
    /// external writer must never be clobbered with a stale
    /// resourceVersion.
    pub async fn persist_status(&mut self) -> Result<()> {
        let api = self.api();
        let name = self.name();
        let pp = PostParams::default();

        match api.replace_status(&name, &pp, serde_json::to_vec(&self.cr)?).await {
            Ok(updated) => {
                self.cr.metadata.resource_version = updated.metadata.resource_version;
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(name = %name, "status write conflicted, re-reading");
                let desired = self.status();
                let mut latest = api.get(&name).await?;
                latest.status = Some(desired);
                let updated = api
                    .replace_status(&name, &pp, serde_json::to_vec(&latest)?)
                    .await?;
                latest.metadata.resource_version = updated.metadata.resource_version;
                self.cr = latest;
                Ok(())
            }
            Err(e) => Err(Error::Kube(e)),
        }
    }

    pub async fn update_state(&mut self, state: MongoState) -> Result<()> {
        debug!(state = %state, "update instance state");
        self.status_mut().state = state;
        self.persist_status().await
    }

    pub async fn update_restart_state(&mut self, state: RestartState) -> Result<()> {
        self.status_mut().restart_state = state;
        self.persist_status().await
    }

    pub async fn update_conds(&mut self, conds: Vec<MongoCondition>) -> Result<()> {
        let status = self.status_mut();
        for cond in conds {
            upsert_condition(status, cond);
        }
        self.persist_status().await
    }

    pub async fn update_current_members(&mut self, members: i32) -> Result<()> {
        self.status_mut().current_info.members = members;
        self.persist_status().await
    }

    pub async fn update_current_resources(
        &mut self,
        resources: Option<ResourceSetting>,
    ) -> Result<()> {
        self.status_mut().current_info.resources = resources;
        self.persist_status().await
    }

    pub async fn update_current_db_user_password(&mut self, password: &str) -> Result<()> {
        if password.is_empty() {
            return Ok(());
        }
        self.status_mut().current_info.db_user_password = password.to_string();
        self.persist_status().await
    }

    pub fn current_info(&self) -> CurrentInfo {
        self.status().current_info
    }

    /// Refresh the replica set member statuses through the normal
    /// replica-set-aware client.
    pub async fn update_rs_status(&mut self) -> Result<()> {
        let members = self.repl_set_status().await?;
        self.status_mut().repl_set = members;
        self.persist_status().await
    }

    /// Best-effort status snapshot while the set is broken: walk the known
    /// addresses with direct connections and keep the first answer. An
    /// unresolvable node is skipped, not fatal.
    pub async fn update_err_rs_status(&mut self) -> Result<()> {
        let addrs = self.mongo_addrs().await?;
        for addr in addrs {
            let client = match self.mongo_client_direct(&addr).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(addr = %addr, error = %e, "create single node client failed");
                    continue;
                }
            };
            let members = client.repl_member_status().await;
            client.close().await;
            if let Ok(members) = members {
                self.status_mut().repl_set = members;
                break;
            }
        }
        self.persist_status().await
    }

    /// Stamp the revision hash of the current spec; pods carrying an older
    /// hash get replaced during a rolling restart.
    pub async fn update_revision(&mut self) -> Result<()> {
        let revision = self.calculate_revision()?;
        if self.status().current_revision == revision {
            return Ok(());
        }
        self.status_mut().current_revision = revision;
        self.persist_status().await
    }

    fn calculate_revision(&self) -> Result<String> {
        let bytes = serde_json::to_vec(&self.cr.spec)?;
        Ok(format!("{}-{:x}", self.name(), fnv1a32(&bytes)))
    }

    /// Diagnostic pod listing taken when a pass fails unclassified.
    pub async fn list_data_pods(&self) -> Result<Vec<k8s_openapi::api::core::v1::Pod>> {
        let selector = data_label(self.base_label());
        self.list_pods(&selector).await
    }
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
