//! Topology mode dispatch.
//!
//! Only the replica set topology exists today, but dispatch is an
//! exhaustive match over [`TopologyMode`]: a new mode forces a compile
//! error here instead of silently running the wrong branch.

use std::sync::Arc;

use tracing::{error, info};

use crate::crd::{MongoDb, MongoState, TopologyMode};

use super::context::Context;
use super::error::{Error, Result};
use super::instance::Base;
use super::labels::{
    LABEL_KEY_INSTANCE, LABEL_KEY_REPLSET_NAME, LABEL_KEY_ROLE, LABEL_VAL_REPLSET, Labels,
    arbiter_label,
};
use super::restart::RestartOutcome;

/// The concrete engine for one topology mode.
pub enum MongoInstance {
    Replica(ReplicaSetInstance),
}

impl MongoInstance {
    pub fn new(ctx: Arc<Context>, cr: MongoDb) -> Self {
        match cr.spec.mode {
            TopologyMode::ReplicaSet => {
                MongoInstance::Replica(ReplicaSetInstance::new(Base::new(ctx, cr)))
            }
        }
    }

    pub fn base(&self) -> &Base {
        match self {
            MongoInstance::Replica(r) => &r.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut Base {
        match self {
            MongoInstance::Replica(r) => &mut r.base,
        }
    }

    pub async fn pre_config(&mut self) -> Result<()> {
        match self {
            MongoInstance::Replica(r) => r.pre_config().await,
        }
    }

    pub async fn sync(&mut self) -> Result<()> {
        match self {
            MongoInstance::Replica(r) => r.sync().await,
        }
    }

    pub async fn post_config(&mut self) -> Result<()> {
        match self {
            MongoInstance::Replica(r) => r.post_config().await,
        }
    }

    pub async fn restart(&mut self) -> Result<RestartOutcome> {
        match self {
            MongoInstance::Replica(r) => r.restart().await,
        }
    }
}

/// Replica set topology engine.
pub struct ReplicaSetInstance {
    pub base: Base,
    expected_count: usize,
}

impl ReplicaSetInstance {
    pub fn new(base: Base) -> Self {
        Self {
            base,
            expected_count: 0,
        }
    }

    /// Base labels plus role and replica set name; a single replica set is
    /// modeled, so the name is fixed.
    fn repl_set_label(&self, arbiter: bool) -> Labels {
        let labels = self.base.with_base_label(
            [
                (LABEL_KEY_ROLE.to_string(), LABEL_VAL_REPLSET.to_string()),
                (
                    LABEL_KEY_REPLSET_NAME.to_string(),
                    format!("{}-0", LABEL_VAL_REPLSET),
                ),
            ]
            .into(),
        );
        if arbiter { arbiter_label(labels) } else { labels }
    }

    /// Preconditions: revision stamp, Services and host directory present,
    /// credential Secrets in place.
    pub async fn pre_config(&mut self) -> Result<()> {
        self.base.update_revision().await?;

        info!(name = %self.base.name(), "check services");
        let members = self.base.cr.spec.members.max(0) as usize;
        let instance_labels: Labels =
            [(LABEL_KEY_INSTANCE.to_string(), self.base.name())].into();
        let services = self.base.list_services(&instance_labels).await?;
        // Scale-down leaves extra Services around; only too few is a
        // problem here.
        if services.len() < members
            && self.base.status().state != MongoState::Reconciling
        {
            error!("service count below member count, marking Reconciling");
            self.base
                .update_state(MongoState::Reconciling)
                .await
                .map_err(Error::obj_sync)?;
        }

        info!(name = %self.base.name(), "check host directory");
        if let Err(Error::DirectoryUnavailable(msg)) = self.base.host_directory().await {
            error!(error = %msg, "host directory configmap missing");
            if self.base.status().state != MongoState::Reconciling {
                self.base
                    .update_state(MongoState::Reconciling)
                    .await
                    .map_err(Error::obj_sync)?;
            }
        }

        info!(name = %self.base.name(), "ensure secrets");
        self.base.ensure_cluster_secrets().await?;

        if let Some(config_ref) = self.base.cr.spec.custom_config_ref.clone() {
            info!(name = %self.base.name(), config = %config_ref, "check custom config");
            if self
                .base
                .config_maps()
                .get_opt(&config_ref)
                .await?
                .is_none()
                && self.base.status().state != MongoState::Reconciling
            {
                error!(config = %config_ref, "custom config configmap missing");
                self.base
                    .update_state(MongoState::Reconciling)
                    .await
                    .map_err(Error::obj_sync)?;
            }
        }
        Ok(())
    }

    /// Converge workloads and replica set membership to the spec.
    pub async fn sync(&mut self) -> Result<()> {
        self.expected_count = self.base.cr.spec.members.max(0) as usize;
        self.base.sync_member(&self.repl_set_label(false)).await
    }

    /// Post-sync configuration: initiate the set, manage users, refresh
    /// status, verify roles.
    pub async fn post_config(&mut self) -> Result<()> {
        let selector = self.repl_set_label(false);
        let pods = self.base.list_pods(&selector).await?;
        let directory = self.base.host_directory().await?;

        self.base.check_pods_ready(self.expected_count, &pods)?;

        self.base.repl_set_init(&pods, &directory).await?;

        let current = self.base.current_info();
        let password_changed = self.base.cr.spec.db_user.password != current.db_user_password
            && !current.db_user_password.is_empty();
        self.base
            .create_mongo_users(&pods, &directory, password_changed)
            .await?;
        let password = self.base.cr.spec.db_user.password.clone();
        self.base.update_current_db_user_password(&password).await?;

        info!("update replica set status");
        self.base.update_rs_status().await?;

        info!("check member roles");
        self.base.check_member_role().await
    }

    /// One step of the rolling restart.
    pub async fn restart(&mut self) -> Result<RestartOutcome> {
        self.base.restart(&self.repl_set_label(false)).await
    }
}
