//! Replica set reconciliation: scaling and member admission.
//!
//! Per-member workloads are provisioned one StatefulSet per fronting
//! Service. Scale-down evicts the member from the replica set
//! configuration before its workload goes away, stepping a primary down
//! first so a shrink never causes a write outage. Member admission
//! registers every healthy pod whose address the host directory publishes.

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::{Patch, PatchParams};
use tracing::{debug, info, warn};

use crate::client::members;
use crate::client::types::Member;
use crate::crd::MongoState;
use crate::resources::services::{metric_service, metric_service_name};
use crate::resources::statefulset::mongo_statefulset;
use crate::resources::common::mongod_command;

use super::conditions::condition_true;
use super::context::FIELD_MANAGER;
use super::directory::{ARBITER_HOSTS_KEY, ResolveScope};
use super::error::{Error, Result};
use super::instance::Base;
use super::labels::{
    LABEL_KEY_APP, LABEL_KEY_INSTANCE, LABEL_KEY_ROLE, LABEL_VAL_EXPORTER, Labels, arbiter_label,
    data_label,
};
use super::topology;
use super::{ARBITER_NAME, SERVICE_NAME_INFIX};
use crate::crd::MongoConditionType;

/// Poll cadence and bound while waiting for expected pods to appear.
const CHECK_POD_INTERVAL: Duration = Duration::from_secs(10);
const CHECK_POD_TIMEOUT: Duration = Duration::from_secs(100);

/// Grace window after a step-down for the election to settle.
pub(crate) const ELECTION_GRACE: Duration = Duration::from_secs(3);

/// Services that still need a workload created: every member Service
/// (arbiter excluded, it is provisioned separately) without a StatefulSet
/// of the same name.
pub fn scale_up_targets(service_names: &[String], sts_names: &[String]) -> Vec<String> {
    service_names
        .iter()
        .filter(|svc| !svc.ends_with(ARBITER_NAME))
        .filter(|svc| !sts_names.contains(*svc))
        .cloned()
        .collect()
}

/// Number of members to evict for a shrink from `provisioned` to `desired`.
pub fn scale_down_count(provisioned: usize, desired: usize) -> usize {
    provisioned.saturating_sub(desired)
}

/// Ordered actions evicting one member during scale-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionAction {
    StepDown,
    AwaitElection,
    RemoveMember,
    DeleteWorkload,
}

/// A victim reporting itself primary steps down before anything
/// destructive happens to it; the election grace applies either way.
pub fn eviction_sequence(reports_primary: bool) -> Vec<EvictionAction> {
    let mut seq = Vec::new();
    if reports_primary {
        seq.push(EvictionAction::StepDown);
    }
    seq.extend([
        EvictionAction::AwaitElection,
        EvictionAction::RemoveMember,
        EvictionAction::DeleteWorkload,
    ]);
    seq
}

impl Base {
    /// One full membership sync pass: scale workloads to the desired
    /// count, converge the arbiter, then admit every surviving pod into
    /// the replica set configuration.
    pub async fn sync_member(&mut self, selector: &Labels) -> Result<()> {
        info!(selector = ?selector, "sync members");
        let desired = self.cr.spec.members.max(0) as usize;
        let data_labels = data_label(selector.clone());

        let found = self.list_statefulsets(&data_labels).await?;
        if desired != found.len()
            && self.status().state != MongoState::Reconciling
        {
            self.update_state(MongoState::Reconciling)
                .await
                .map_err(Error::obj_sync)?;
        }

        if desired > found.len() {
            if found.is_empty() {
                info!(name = %self.name(), "start mongo");
            } else {
                info!(name = %self.name(), "scale up mongo");
            }
            self.scale_up_data_nodes(&found, &data_labels).await?;
        } else if desired < found.len() {
            self.scale_down_data_nodes(&found, desired, selector).await?;
        }

        if self.cr.spec.arbiter {
            let arbiter_labels = arbiter_label(selector.clone());
            let name = format!("{}-{}-{}", self.name(), SERVICE_NAME_INFIX, ARBITER_NAME);
            let rs = arbiter_labels
                .get(super::labels::LABEL_KEY_REPLSET_NAME)
                .cloned()
                .unwrap_or_default();
            let sts = mongo_statefulset(
                &self.cr,
                &name,
                arbiter_labels,
                mongod_command(&rs, self.cr.spec.custom_config_ref.is_some()),
            );
            self.ensure_statefulset(sts).await?;
        } else {
            self.scale_down_arbiter_node(selector).await?;
        }

        self.wait_expected_pods(selector).await?;

        let sts_list = self.list_statefulsets(selector).await?;
        let pods = self.list_pods(selector).await.map_err(Error::obj_sync)?;
        let pods = Self::filter_pods_of_live_sts(pods, &sts_list);
        if pods.is_empty() {
            warn!(selector = ?selector, "no pods satisfy the selector");
        }

        self.ensure_members(&pods).await
    }

    /// Create a workload for every member Service that lacks one.
    async fn scale_up_data_nodes(
        &mut self,
        found: &[StatefulSet],
        data_labels: &Labels,
    ) -> Result<()> {
        let instance_labels: Labels = [(LABEL_KEY_INSTANCE.to_string(), self.name())].into();
        let services = self.list_services(&instance_labels).await?;

        let service_names: Vec<String> = services.iter().map(|s| s.name_any()).collect();
        let sts_names: Vec<String> = found.iter().map(|s| s.name_any()).collect();
        let rs = data_labels
            .get(super::labels::LABEL_KEY_REPLSET_NAME)
            .cloned()
            .unwrap_or_default();

        for target in scale_up_targets(&service_names, &sts_names) {
            let sts = mongo_statefulset(
                &self.cr,
                &target,
                data_labels.clone(),
                mongod_command(&rs, self.cr.spec.custom_config_ref.is_some()),
            );
            self.ensure_statefulset(sts).await?;
        }
        Ok(())
    }

    /// Evict members until the provisioned count matches the desired one.
    ///
    /// Pods are visited in descending ordinal order so the truncated tail
    /// goes first. Each victim is asked for its own published address; a
    /// victim reporting itself primary is stepped down and given a grace
    /// window before its member entry is removed and its workload deleted.
    async fn scale_down_data_nodes(
        &mut self,
        found: &[StatefulSet],
        desired: usize,
        selector: &Labels,
    ) -> Result<()> {
        info!(name = %self.name(), "scale down mongo");
        let mut pods = self
            .list_pods(&data_label(selector.clone()))
            .await
            .map_err(Error::obj_sync)?;
        pods.reverse();

        let reduction = scale_down_count(found.len(), desired);
        let mut removed = 0usize;

        for pod in &pods {
            if removed == reduction {
                break;
            }

            let repl = self
                .data_node_repl_info(pod)
                .await
                .map_err(|e| Error::obj_sync(e))?;

            info!(pod = %topology::pod_name(pod), host = %repl.me, "scale down data node");
            for action in eviction_sequence(repl.is_master) {
                match action {
                    EvictionAction::StepDown => {
                        info!(pod = %topology::pod_name(pod), "victim is primary, stepping down");
                        self.step_down_pod(pod).await?;
                    }
                    // Let the election settle before the next destructive
                    // action.
                    EvictionAction::AwaitElection => tokio::time::sleep(ELECTION_GRACE).await,
                    EvictionAction::RemoveMember => {
                        self.remove_member(pod, &repl.me)
                            .await
                            .map_err(Error::obj_sync)?;
                    }
                    EvictionAction::DeleteWorkload => {
                        self.delete_member_workload(pod, self.cr.spec.metrics_exporter.enable)
                            .await?;
                    }
                }
            }
            removed += 1;
        }
        Ok(())
    }

    /// Decommission the arbiter when the spec no longer wants one.
    async fn scale_down_arbiter_node(&mut self, selector: &Labels) -> Result<()> {
        let arbiter_labels = arbiter_label(selector.clone());
        let found = self.list_statefulsets(&arbiter_labels).await?;
        if found.is_empty() {
            debug!("no arbiter workload, nothing to scale down");
            return Ok(());
        }

        warn!(name = %self.name(), "arbiter workload exists but spec.arbiter is false");
        let pods = self
            .list_pods(&arbiter_labels)
            .await
            .map_err(Error::obj_sync)?;
        let Some(pod) = pods.first() else {
            // Workload not up yet; retried next pass.
            return Err(Error::obj_sync("arbiter pod not running"));
        };

        // Arbiters carry no credentials; their published address comes from
        // a live shell probe.
        let host = self
            .arbiter_node_host(pod)
            .await
            .map_err(|e| Error::obj_sync(e))?;

        info!(pod = %topology::pod_name(pod), host = %host, "scale down arbiter node");
        self.remove_member_and_delete_workload(pod, &host, self.cr.spec.metrics_exporter.enable)
            .await?;
        self.clear_directory_arbiter_entry().await
    }

    /// Blank the arbiter list in the host directory so a later pass does
    /// not re-admit the decommissioned node.
    async fn clear_directory_arbiter_entry(&self) -> Result<()> {
        let patch = serde_json::json!({ "data": { ARBITER_HOSTS_KEY: "" } });
        self.config_maps()
            .patch(
                &self.cr.spec.member_config_ref,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(Error::obj_sync)?;
        Ok(())
    }

    /// Remove the member from the replica set config, then delete its
    /// workload and (when enabled) its metrics Service.
    pub(crate) async fn remove_member_and_delete_workload(
        &self,
        pod: &Pod,
        host: &str,
        exporter_enabled: bool,
    ) -> Result<()> {
        self.remove_member(pod, host)
            .await
            .map_err(Error::obj_sync)?;
        self.delete_member_workload(pod, exporter_enabled).await
    }

    /// Delete a member's workload and (when enabled) its metrics Service.
    async fn delete_member_workload(&self, pod: &Pod, exporter_enabled: bool) -> Result<()> {
        let owner = topology::owner_name(pod)
            .ok_or_else(|| Error::obj_sync("pod has no owning workload"))?
            .to_string();
        self.delete_statefulset(&owner).await?;

        if exporter_enabled {
            self.delete_service(&metric_service_name(&owner)).await?;
        }
        Ok(())
    }

    /// Remove one host from the live configuration via any reachable node.
    async fn remove_member(&self, pod: &Pod, host: &str) -> Result<()> {
        info!(host = %host, "remove member");
        if topology::is_not_need_reconfig(pod) {
            return Ok(());
        }
        let client = self.mongo_client().await?;
        let res = client.remove_members(&[Member::data(host)]).await;
        client.close().await;
        Ok(res?)
    }

    /// Bounded wait for the expected pod count to appear; expiry surfaces
    /// as an object-sync failure and the pass is retried.
    async fn wait_expected_pods(&self, selector: &Labels) -> Result<()> {
        let expected = self.cr.spec.members.max(0) as usize;
        let deadline = tokio::time::Instant::now() + CHECK_POD_TIMEOUT;

        loop {
            let pods = self.list_pods(selector).await.map_err(Error::obj_sync)?;
            if pods.len() >= expected {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::obj_sync(format!(
                    "expected {} pods, found {}",
                    expected,
                    pods.len()
                )));
            }
            debug!(expected, found = pods.len(), "waiting for pods to appear");
            tokio::time::sleep(CHECK_POD_INTERVAL).await;
        }
    }

    /// Admit every pod into the replica set and keep its metrics Service
    /// alive.
    async fn ensure_members(&mut self, pods: &[Pod]) -> Result<()> {
        if pods.is_empty() {
            return Ok(());
        }
        info!(pods = pods.len(), "ensure members");

        if self.cr.spec.metrics_exporter.enable {
            for pod in pods {
                let owner = topology::owner_name(pod)
                    .ok_or_else(|| Error::obj_sync("pod has no owning workload"))?
                    .to_string();
                let labels = self.with_base_label(
                    [(LABEL_KEY_ROLE.to_string(), LABEL_VAL_EXPORTER.to_string())].into(),
                );
                let selector: Labels = [(LABEL_KEY_APP.to_string(), owner.clone())].into();
                let svc =
                    metric_service(&self.cr, &metric_service_name(&owner), labels, selector);
                self.ensure_service(svc).await?;
            }
        }

        for pod in pods {
            debug!(pod = %topology::pod_name(pod), "ensure member config");
            self.ensure_member_config(pod).await?;
        }
        Ok(())
    }

    /// Register a single pod's member entry if the live configuration is
    /// missing it.
    ///
    /// Skipped for roles excluded from reconfiguration and until the
    /// clusterAdmin bootstrap condition holds (before that no credentialed
    /// client could write the config anyway).
    async fn ensure_member_config(&mut self, pod: &Pod) -> Result<()> {
        if topology::is_not_need_reconfig(pod) {
            return Ok(());
        }

        let rs = topology::rs_name(pod).to_string();
        if !condition_true(
            &self.status().conditions,
            MongoConditionType::UserClusterAdmin,
            &rs,
        ) {
            info!(name = %self.name(), "clusterAdmin bootstrap not recorded yet, skip member admission");
            return Ok(());
        }

        let directory = self.host_directory().await?;
        let my_host = self.pod_external_host(pod).await?;
        let member =
            directory.resolve(self.cr.spec.arbiter, ResolveScope::SelfAddr(&my_host));
        if member.is_empty() {
            warn!(host = %my_host, "directory does not publish this pod yet");
            return Ok(());
        }

        let client = self.mongo_client().await?;
        let result = async {
            let config = client.read_config().await?;
            debug!(existing = config.members.len(), add = member.len(), "check member exists");
            let (missing, changed) = members::diff(&config.members, &member);
            if changed {
                warn!(missing = ?members::member_hosts(&missing), "member absent from replica set config, adding");
                client.add_members(&missing).await?;
            }
            Ok::<_, crate::client::MongoError>(())
        }
        .await;
        client.close().await;
        Ok(result?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_up_creates_exactly_missing_workloads() {
        // desired 5 services, 3 provisioned workloads: exactly 2 creations.
        let services: Vec<String> = (0..5).map(|i| format!("sample-svc-{}", i)).collect();
        let sts: Vec<String> = (0..3).map(|i| format!("sample-svc-{}", i)).collect();

        let targets = scale_up_targets(&services, &sts);
        assert_eq!(targets, vec!["sample-svc-3", "sample-svc-4"]);
    }

    #[test]
    fn test_scale_up_skips_arbiter_service() {
        let services = vec![
            "sample-svc-0".to_string(),
            "sample-svc-arbiter".to_string(),
        ];
        let targets = scale_up_targets(&services, &[]);
        assert_eq!(targets, vec!["sample-svc-0"]);
    }

    #[test]
    fn test_scale_up_noop_when_all_present() {
        let services = vec!["sample-svc-0".to_string()];
        let sts = vec!["sample-svc-0".to_string()];
        assert!(scale_up_targets(&services, &sts).is_empty());
    }

    #[test]
    fn test_scale_down_count() {
        assert_eq!(scale_down_count(4, 2), 2);
        assert_eq!(scale_down_count(3, 3), 0);
        // Never negative even when provisioning lags the spec.
        assert_eq!(scale_down_count(2, 5), 0);
    }

    #[test]
    fn test_eviction_sequence_steps_primary_down_first() {
        assert_eq!(
            eviction_sequence(true),
            vec![
                EvictionAction::StepDown,
                EvictionAction::AwaitElection,
                EvictionAction::RemoveMember,
                EvictionAction::DeleteWorkload,
            ]
        );
    }

    #[test]
    fn test_eviction_sequence_secondary_is_not_stepped_down() {
        let seq = eviction_sequence(false);
        assert!(!seq.contains(&EvictionAction::StepDown));
        // Membership removal always precedes workload deletion.
        let remove = seq.iter().position(|a| *a == EvictionAction::RemoveMember);
        let delete = seq.iter().position(|a| *a == EvictionAction::DeleteWorkload);
        assert!(remove < delete);
    }
}
