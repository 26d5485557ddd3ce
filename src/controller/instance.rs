//! Per-reconcile instance state and shared lookups.
//!
//! `Base` owns the CR for the duration of one reconcile pass and provides
//! the lookups every stage needs: typed APIs, pod listings, the host
//! directory, wire clients and the external address mapping. All durable
//! state lives in the CR status; `Base` itself never outlives a pass.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::client::types::{MONGO_CLUSTER_ADMIN, SECRET_KEY_PASSWORD, SECRET_KEY_USER};
use crate::client::{MongoClient, ReplSetMemberStatus};
use crate::crd::MongoDb;

use super::context::Context;
use super::directory::HostDirectory;
use super::error::{Error, Result};
use super::exec;
use super::labels::{
    LABEL_KEY_CLUSTER_VIP, LABEL_KEY_INSTANCE, LABEL_KEY_MANAGED_BY, Labels, MANAGED_BY,
    merge_labels,
};
use super::topology;
use super::{CONTAINER_NAME, DEFAULT_PORT};

/// Shared core of the reconcile pass.
pub struct Base {
    pub ctx: Arc<Context>,
    pub cr: MongoDb,
}

impl Base {
    pub fn new(ctx: Arc<Context>, cr: MongoDb) -> Self {
        Self { ctx, cr }
    }

    pub fn name(&self) -> String {
        self.cr.name_any()
    }

    pub fn namespace(&self) -> String {
        self.cr.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Externally routable VIP of the hosting cluster, stamped on the CR by
    /// the scheduling layer.
    pub fn cluster_vip(&self) -> String {
        self.cr
            .labels()
            .get(LABEL_KEY_CLUSTER_VIP)
            .cloned()
            .unwrap_or_default()
    }

    // ========================================================================
    // Typed APIs
    // ========================================================================

    pub fn api(&self) -> Api<MongoDb> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace())
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace())
    }

    pub fn statefulsets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace())
    }

    pub fn services(&self) -> Api<Service> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace())
    }

    pub fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace())
    }

    pub fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace())
    }

    // ========================================================================
    // Labels
    // ========================================================================

    /// Managed-by and instance labels plus whatever the CR itself carries.
    pub fn base_label(&self) -> Labels {
        let defaults: Labels = [
            (LABEL_KEY_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            (LABEL_KEY_INSTANCE.to_string(), self.name()),
        ]
        .into();
        merge_labels([self.cr.labels(), &defaults])
    }

    pub fn with_base_label(&self, extra: Labels) -> Labels {
        merge_labels([&self.base_label(), &extra])
    }

    // ========================================================================
    // Pods
    // ========================================================================

    /// Live (non-terminating) pods matching the selector, sorted by ordinal.
    pub async fn list_pods(&self, selector: &Labels) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&super::labels::selector_string(selector));
        let mut pods: Vec<Pod> = self
            .pods()
            .list(&lp)
            .await?
            .items
            .into_iter()
            .filter(|p| !topology::is_terminating(p))
            .collect();
        topology::sort_by_ordinal(&mut pods);
        Ok(pods)
    }

    /// All expected pods run a ready mongod container; otherwise this is a
    /// benign wait.
    pub fn check_pods_ready(&self, expected: usize, pods: &[Pod]) -> Result<()> {
        let ready: Vec<&Pod> = pods
            .iter()
            .filter(|p| {
                topology::has_container(p, CONTAINER_NAME)
                    && topology::is_container_running(p, CONTAINER_NAME)
                    && topology::is_pod_ready(p)
            })
            .collect();

        if ready.len() < expected {
            debug!(
                ready = ready.len(),
                expected, "waiting for pods to become ready"
            );
            return Err(Error::wait("pod not ready"));
        }
        Ok(())
    }

    /// Drop pods whose owning workload is already being deleted; their
    /// membership was handled when the workload went away.
    pub fn filter_pods_of_live_sts(pods: Vec<Pod>, sts_list: &[StatefulSet]) -> Vec<Pod> {
        pods.into_iter()
            .filter(|pod| {
                topology::owner_name(pod).is_some_and(|owner| {
                    sts_list
                        .iter()
                        .any(|s| s.name_any() == owner && s.metadata.deletion_timestamp.is_none())
                })
            })
            .collect()
    }

    // ========================================================================
    // Host directory
    // ========================================================================

    /// Fetch and parse the host directory ConfigMap. Failure here is always
    /// retried by the caller, never fatal.
    pub async fn host_directory(&self) -> Result<HostDirectory> {
        let name = &self.cr.spec.member_config_ref;
        let cm = self
            .config_maps()
            .get(name)
            .await
            .map_err(|e| Error::DirectoryUnavailable(format!("{}: {}", name, e)))?;
        Ok(HostDirectory::from_config_map(&cm))
    }

    /// Published addresses of every data member.
    pub async fn mongo_addrs(&self) -> Result<Vec<String>> {
        Ok(self.host_directory().await?.data_addresses())
    }

    // ========================================================================
    // Wire clients
    // ========================================================================

    /// User/password from a managed credential Secret.
    pub async fn auth_info(&self, user: &str) -> Result<(String, String)> {
        let secret_name = format!("{}-{}", self.name(), user.to_lowercase());
        let secret = self
            .secrets()
            .get_opt(&secret_name)
            .await?
            .ok_or_else(|| Error::MissingSecret(secret_name.clone()))?;

        let get = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|b| String::from_utf8_lossy(&b.0).to_string())
                .unwrap_or_default()
        };
        Ok((get(SECRET_KEY_USER), get(SECRET_KEY_PASSWORD)))
    }

    /// Replica-set-aware client authenticated as the operator's
    /// clusterAdmin user.
    pub async fn mongo_client(&self) -> Result<MongoClient> {
        let addrs = self.mongo_addrs().await?;
        let (user, password) = self.auth_info(MONGO_CLUSTER_ADMIN).await?;
        Ok(MongoClient::connect(&addrs, &user, &password, false).await?)
    }

    /// Direct connection to a single node, bypassing topology discovery.
    pub async fn mongo_client_direct(&self, addr: &str) -> Result<MongoClient> {
        let (user, password) = self.auth_info(MONGO_CLUSTER_ADMIN).await?;
        Ok(MongoClient::connect(&[addr.to_string()], &user, &password, true).await?)
    }

    /// Member statuses as reported by the replica set.
    pub async fn repl_set_status(&self) -> Result<Vec<ReplSetMemberStatus>> {
        let client = self.mongo_client().await?;
        let members = client.repl_member_status().await;
        client.close().await;
        Ok(members?)
    }

    /// Host currently reported as primary, if any.
    pub async fn primary_host(&self) -> Result<Option<String>> {
        let members = self.repl_set_status().await?;
        Ok(crate::client::types::primary_host(&members))
    }

    /// One data node's own view of the replica set, via its pod IP.
    pub async fn data_node_repl_info(
        &self,
        pod: &Pod,
    ) -> Result<crate::client::types::ServerReplInfo> {
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or_else(|| Error::wait("pod has no ip yet"))?;
        let client = self
            .mongo_client_direct(&format!("{}:{}", ip, DEFAULT_PORT))
            .await?;
        let info = client.server_repl_info().await;
        client.close().await;
        Ok(info?)
    }

    /// Ask the node behind this pod to step down from primary.
    pub async fn step_down_pod(&self, pod: &Pod) -> Result<()> {
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or_else(|| Error::wait("pod has no ip yet"))?;
        let client = self
            .mongo_client_direct(&format!("{}:{}", ip, DEFAULT_PORT))
            .await?;
        let res = client.step_down().await;
        client.close().await;
        Ok(res?)
    }

    /// Keyfile plus one credential Secret per managed user; existing
    /// Secrets are left untouched so generated passwords stay stable.
    pub async fn ensure_cluster_secrets(&self) -> Result<()> {
        self.ensure_secret(crate::resources::secrets::keyfile_secret(&self.cr))
            .await?;
        for user in [
            crate::client::types::MONGO_ROOT,
            MONGO_CLUSTER_ADMIN,
            crate::client::types::MONGO_CLUSTER_MONITOR,
        ] {
            self.ensure_secret(crate::resources::secrets::admin_secret(&self.cr, user))
                .await?;
        }
        Ok(())
    }

    /// Every member must report a role consistent with its numeric state.
    pub async fn check_member_role(&self) -> Result<()> {
        let members = self.repl_set_status().await?;
        let health = crate::client::types::classify_member_health(&members);
        if let Some(host) = health.unknown_hosts.first() {
            return Err(Error::MemberRole(host.clone()));
        }
        Ok(())
    }

    // ========================================================================
    // External addressing
    // ========================================================================

    /// NodePort of the Service fronting this pod (the Service shares its
    /// name with the owning workload).
    pub async fn service_node_port(&self, pod: &Pod) -> Result<i32> {
        let owner = topology::owner_name(pod)
            .ok_or_else(|| Error::Internal(format!("pod {} has no owner", topology::pod_name(pod))))?;
        let svc = self.services().get(owner).await?;
        svc.spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .and_then(|p| p.first())
            .and_then(|p| p.node_port)
            .ok_or_else(|| Error::Internal(format!("service {} has no nodePort", owner)))
    }

    /// This pod's externally visible `vip:nodePort` address; physical
    /// endpoints are remapped per cluster, so pod names never identify a
    /// member.
    pub async fn pod_external_host(&self, pod: &Pod) -> Result<String> {
        let node_port = self.service_node_port(pod).await?;
        Ok(format!("{}:{}", self.cluster_vip(), node_port))
    }

    /// An arbiter's published address, learned through a shell probe:
    /// arbiters expose no credentialed access.
    pub async fn arbiter_node_host(&self, pod: &Pod) -> Result<String> {
        let cmd = crate::client::scripts::shell_eval_no_auth(crate::client::scripts::SERVER_REPL_ME);
        let out = exec::exec_shell(self, pod, &cmd).await?;
        // The shell prints a four-line preamble before the eval result.
        out.stdout
            .split('\n')
            .nth(4)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Internal("unexpected shell output probing arbiter".to_string()))
    }
}
