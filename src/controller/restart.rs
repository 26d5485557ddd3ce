//! Rolling restart coordination.
//!
//! A restart replaces every pod of the replica set under a strict order:
//! all secondaries first, then a step-down of the primary, then the
//! primary itself. Each phase spans at least one reconcile pass (the
//! workload controller has to recreate pods in between), so the phase
//! lives in the persisted status, never in memory; losing it would either
//! stall the restart forever or delete the primary twice.

use k8s_openapi::api::core::v1::Pod;
use kube::api::PostParams;
use tracing::{info, warn};

use crate::crd::RestartState;
use crate::resources::common::resource_requirements;

use super::error::{Error, Result};
use super::instance::Base;
use super::labels::Labels;
use super::sync::ELECTION_GRACE;
use super::topology;
use super::CONTAINER_NAME;

/// Explicit result of one restart invocation, consumed directly by the
/// caller to decide whether the applied resource shape may be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartOutcome {
    pub complete: bool,
}

impl RestartOutcome {
    pub const IN_PROGRESS: Self = Self { complete: false };
    pub const COMPLETE: Self = Self { complete: true };
}

/// Phase progression: `NotInProcess → SecondaryDeleted → PrimaryDeleted →
/// NotInProcess`, the final re-entry signaling completion.
pub fn next_restart_state(state: RestartState) -> (RestartState, RestartOutcome) {
    match state {
        RestartState::NotInProcess => (RestartState::SecondaryDeleted, RestartOutcome::IN_PROGRESS),
        RestartState::SecondaryDeleted => {
            (RestartState::PrimaryDeleted, RestartOutcome::IN_PROGRESS)
        }
        RestartState::PrimaryDeleted => (RestartState::NotInProcess, RestartOutcome::COMPLETE),
    }
}

/// A pod needs replacing when its stamped revision differs from the one
/// the current spec hashes to.
pub fn needs_replacement(pod_revision: &str, desired_revision: &str) -> bool {
    pod_revision != desired_revision
}

impl Base {
    /// Drive the restart state machine one step.
    ///
    /// An unhealthy topology suspends the restart: no phase change, no
    /// error, `complete = false`. The StatefulSet templates are re-stamped
    /// with the desired resource shape before any pod is deleted so the
    /// workload controller recreates pods under the new shape.
    pub async fn restart(&mut self, selector: &Labels) -> Result<RestartOutcome> {
        let pods = self.list_pods(selector).await?;

        let expected = self.cr.spec.members.max(0) as usize;
        if self.check_pods_ready(expected, &pods).is_err() {
            info!("cannot start or continue restart: waiting for all replicas to be ready");
            return Ok(RestartOutcome::IN_PROGRESS);
        }

        let primary = self.primary_host().await?;

        for pod in &pods {
            self.apply_spec_resources_to_workload(pod).await?;
        }

        let state = self.status().restart_state;
        match state {
            RestartState::NotInProcess => {
                for pod in &pods {
                    if !self.pod_is_primary(pod, primary.as_deref()).await? {
                        info!(pod = %topology::pod_name(pod), "apply changes to secondary pod");
                        self.delete_pod_in_restart(pod).await?;
                    }
                }
                let (next, outcome) = next_restart_state(state);
                self.update_restart_state(next).await?;
                Ok(outcome)
            }
            RestartState::SecondaryDeleted => {
                for pod in &pods {
                    if self.pod_is_primary(pod, primary.as_deref()).await? {
                        info!(pod = %topology::pod_name(pod), "apply changes to primary pod");
                        info!("stepping primary down");
                        self.step_down_pod(pod).await?;
                        tokio::time::sleep(ELECTION_GRACE).await;
                        self.delete_pod_in_restart(pod).await?;
                    }
                }
                let (next, outcome) = next_restart_state(state);
                self.update_restart_state(next).await?;
                Ok(outcome)
            }
            RestartState::PrimaryDeleted => {
                let (next, outcome) = next_restart_state(state);
                self.update_restart_state(next).await?;
                Ok(outcome)
            }
        }
    }

    /// Primary identity is resolved by the pod's externally routable
    /// address, never by name: physical endpoints are remapped per cluster.
    async fn pod_is_primary(&self, pod: &Pod, primary: Option<&str>) -> Result<bool> {
        let Some(primary) = primary else {
            return Ok(false);
        };
        let my_host = self.pod_external_host(pod).await?;
        Ok(my_host == primary)
    }

    /// Delete a pod that still runs the previous revision; the owning
    /// workload recreates it under the updated template.
    async fn delete_pod_in_restart(&self, pod: &Pod) -> Result<()> {
        let desired = self.status().current_revision;
        if !needs_replacement(topology::revision_hash(pod), &desired) {
            info!(pod = %topology::pod_name(pod), "pod is already updated");
            return Ok(());
        }
        self.pods()
            .delete(topology::pod_name(pod), &Default::default())
            .await
            .map_err(|e| Error::Internal(format!("failed to delete pod: {}", e)))?;
        Ok(())
    }

    /// Re-stamp the owning StatefulSet's template with the spec's resource
    /// shape.
    async fn apply_spec_resources_to_workload(&self, pod: &Pod) -> Result<()> {
        let Some(owner) = topology::owner_name(pod) else {
            warn!(pod = %topology::pod_name(pod), "pod has no owning workload");
            return Ok(());
        };

        let api = self.statefulsets();
        let mut sts = api.get(owner).await?;
        sts.metadata.resource_version = None;

        let desired = resource_requirements(self.cr.spec.resources.as_ref());
        let mut changed = false;
        if let Some(spec) = sts.spec.as_mut() {
            if let Some(pod_spec) = spec.template.spec.as_mut() {
                for container in pod_spec.containers.iter_mut() {
                    if container.name == CONTAINER_NAME {
                        container.resources = Some(desired.clone());
                        changed = true;
                    }
                }
            }
        }
        if changed {
            api.replace(owner, &PostParams::default(), &sts).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_progression() {
        let (s1, o1) = next_restart_state(RestartState::NotInProcess);
        assert_eq!(s1, RestartState::SecondaryDeleted);
        assert!(!o1.complete);

        let (s2, o2) = next_restart_state(s1);
        assert_eq!(s2, RestartState::PrimaryDeleted);
        assert!(!o2.complete);

        let (s3, o3) = next_restart_state(s2);
        assert_eq!(s3, RestartState::NotInProcess);
        assert!(o3.complete);
    }

    #[test]
    fn test_full_cycle_visits_each_phase_once() {
        // Starting from NotInProcess, a full restart completes in exactly
        // three steps and ends where it began.
        let mut state = RestartState::NotInProcess;
        let mut visited = Vec::new();
        loop {
            let (next, outcome) = next_restart_state(state);
            visited.push(next);
            state = next;
            if outcome.complete {
                break;
            }
        }
        assert_eq!(
            visited,
            vec![
                RestartState::SecondaryDeleted,
                RestartState::PrimaryDeleted,
                RestartState::NotInProcess,
            ]
        );
    }

    #[test]
    fn test_needs_replacement() {
        assert!(needs_replacement("sample-aaa", "sample-bbb"));
        assert!(!needs_replacement("sample-aaa", "sample-aaa"));
    }
}
