//! Replica set self-healing.
//!
//! Invoked after a reconcile pass fails for an unclassified reason: the
//! wire configuration may reference members that are unreachable or
//! misreporting their role. The engine repairs only the configuration to
//! match currently reachable reality; it never guesses which node should
//! become primary, deferring elections to the database itself.

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, error, info, warn};

use crate::client::MongoClient;
use crate::client::members;
use crate::client::types::{Member, MemberHealth};

use super::directory::ResolveScope;
use super::error::{Error, Result};
use super::instance::Base;
use super::topology;

impl Base {
    /// Scan the known member addresses with direct connections, stopping
    /// at the first node that answers, then evict and re-admit every
    /// member whose role cannot be determined.
    ///
    /// With no surviving node at all this only logs and stops: a
    /// destructive rebuild needs an administrator, not an operator.
    pub async fn restore_repl_set(&mut self, pods: &[Pod]) -> Result<()> {
        if topology::available_pod(pods).is_none() {
            return Err(Error::wait("no data pod available"));
        }

        debug!("start replica set recovery scan");
        let addrs = self.mongo_addrs().await?;

        info!("scanning members over single node clients");
        let mut health = MemberHealth::default();
        for addr in &addrs {
            let client = match self.mongo_client_direct(addr).await {
                Ok(c) => c,
                Err(e) => {
                    // Best-effort scan; an unresolvable node is skipped.
                    error!(addr = %addr, error = %e, "create single node client failed");
                    continue;
                }
            };
            let res = client.check_member_status().await;
            client.close().await;
            match res {
                Ok(h) => {
                    health = h;
                    break;
                }
                Err(e) => debug!(addr = %addr, error = %e, "member status scan failed"),
            }
        }

        if health.healthy_hosts.is_empty() {
            error!("no surviving replica set node; administrator intervention required");
            return Ok(());
        }
        if health.unknown_hosts.is_empty() {
            return Ok(());
        }

        for unknown in &health.unknown_hosts {
            let pod = self.pod_for_host(pods, unknown).await;
            if pod.is_none() {
                warn!(host = %unknown, "unknown member has no matching pod, leaving it evicted");
            }

            self.evict_member(unknown, &health.healthy_hosts).await?;

            if pod.is_some() {
                info!(host = %unknown, "re-admit repaired member");
                self.readmit_member(unknown).await?;
            }
        }
        Ok(())
    }

    /// Pod whose externally routable address matches the given host.
    async fn pod_for_host<'a>(&self, pods: &'a [Pod], host: &str) -> Option<&'a Pod> {
        for pod in pods {
            match self.pod_external_host(pod).await {
                Ok(h) if h == host => return Some(pod),
                _ => continue,
            }
        }
        None
    }

    /// Remove the host from the configuration as seen by every healthy
    /// node.
    async fn evict_member(&self, host: &str, healthy: &[String]) -> Result<()> {
        for addr in healthy {
            let client = self.mongo_client_direct(addr).await?;
            let res = client.remove_members(&[Member::data(host)]).await;
            client.close().await;
            res?;
        }
        Ok(())
    }

    /// Re-add the host's published entry through the canonical write path,
    /// bumping the version once for this admission.
    async fn readmit_member(&self, host: &str) -> Result<()> {
        let directory = self.host_directory().await?;
        let entry: Vec<Member> = directory
            .resolve(self.cr.spec.arbiter, ResolveScope::All)
            .into_iter()
            .filter(|m| m.host == host)
            .collect();
        if entry.is_empty() {
            warn!(host = %host, "directory no longer publishes this member, skipping re-admission");
            return Ok(());
        }

        let addrs = self.mongo_addrs().await?;
        let client = self.mongo_client_direct_any(&addrs).await?;
        let res = async {
            let mut config = client.read_config().await?;
            let (merged, changed) = members::merge(&config.members, &entry);
            if !changed {
                return Ok(());
            }
            config.members = merged;
            config.version += 1;
            client.write_config(&config).await
        }
        .await;
        client.close().await;
        Ok(res?)
    }

    /// First known address that accepts a direct connection.
    async fn mongo_client_direct_any(&self, addrs: &[String]) -> Result<MongoClient> {
        let mut last_err = None;
        for addr in addrs {
            match self.mongo_client_direct(addr).await {
                Ok(c) => return Ok(c),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::wait("no member address published")))
    }
}
