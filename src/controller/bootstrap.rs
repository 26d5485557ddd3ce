//! One-time bootstrap: replica set initiation and cluster users.
//!
//! Runs before any credentialed client exists, so the first steps go
//! through the shell sub-protocol in [`crate::client::scripts`] and parse
//! fixed output markers. Every step is guarded by a persisted condition
//! keyed by (step, replica set name): the underlying calls are not
//! idempotent from the database's point of view, the conditions make them
//! so from the operator's.

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use crate::client::scripts;
use crate::client::types::{
    MONGO_CLUSTER_ADMIN, MONGO_CLUSTER_MONITOR, MONGO_READ_WRITE, MONGO_ROOT, SECRET_KEY_DB,
    SECRET_KEY_ROLE,
};
use crate::crd::{MongoCondition, MongoConditionStatus, MongoConditionType};

use super::conditions::condition_true;
use super::directory::{HostDirectory, ResolveScope};
use super::error::{Error, Result};
use super::exec;
use super::instance::Base;
use super::topology;

/// Settle time for mongod start and for the first election.
const SYNC_WAIT: std::time::Duration = std::time::Duration::from_secs(10);

impl Base {
    /// Initiate the replica set through the shell of one available pod.
    ///
    /// No-auth first; when the output reports enforced auth the command is
    /// retried with root credentials. A failed initiate falls back to a
    /// forced reconfig (concurrent initiation across clusters can produce
    /// divergent replica set ids).
    pub async fn repl_set_init(&mut self, pods: &[Pod], directory: &HostDirectory) -> Result<()> {
        info!("init replica set config");
        let Some(pod) = topology::available_pod(pods) else {
            return Err(Error::wait("no data pod available"));
        };
        let pod = pod.clone();
        let rs = topology::rs_name(&pod).to_string();

        if condition_true(&self.status().conditions, MongoConditionType::RsInit, &rs) {
            return Ok(());
        }
        if !self.cr.spec.rs_init {
            return Ok(());
        }

        // mongod may still be coming up; connecting to 127.0.0.1 flakes
        // right after pod start.
        debug!("waiting for mongod start");
        tokio::time::sleep(SYNC_WAIT).await;

        let members = directory.resolve(self.cr.spec.arbiter, ResolveScope::All);
        info!(members = ?crate::client::members::member_hosts(&members), "initiating with members");
        let members_json = serde_json::to_string(&members)?;

        let js = scripts::rs_initiate(&rs, &members_json);
        let mut out = self.exec_eval(&pod, &js).await?;
        if out.stdout.contains(scripts::MARKER_NO_USERS_AUTHENTICATED) {
            info!("init replica set with auth");
            out = self.exec_eval_with_auth(&pod, &js).await?;
        }

        if !out.stdout.contains(scripts::MARKER_OK)
            && !out.stdout.contains(scripts::MARKER_ALREADY_INITIALIZED)
            && !out.stdout.contains(scripts::MARKER_CONFIG_INCOMPATIBLE)
        {
            // The set may already exist with an incompatible id; force it
            // over to ours.
            info!("reconfig replica set");
            let js = scripts::rs_reconfig(&rs, &members_json);
            let out = self.exec_eval(&pod, &js).await?;
            if !out.ok && out.stdout.contains(scripts::MARKER_RECONFIG_UNAUTHORIZED) {
                info!("reconfig replica set with auth");
                self.exec_eval_with_auth(&pod, &js).await?;
            }
            return Err(Error::RsInitFailed(rs));
        }

        // Members all come up secondary; give the first election room.
        debug!("waiting for elections");
        tokio::time::sleep(SYNC_WAIT).await;

        self.check_repl_set_initiated(&pod).await
    }

    /// Verify `rs.status()` reports ok and record the rsInit condition.
    /// Still shell-driven: no user may exist yet.
    async fn check_repl_set_initiated(&mut self, pod: &Pod) -> Result<()> {
        debug!("check replica set config");
        let mut out = self.exec_eval(pod, scripts::RS_STATUS).await?;
        if out.stdout.contains(scripts::MARKER_NO_USERS_AUTHENTICATED) {
            out = self.exec_eval_with_auth(pod, scripts::RS_STATUS).await?;
        }
        if !out.stdout.contains(scripts::MARKER_OK) {
            return Err(Error::RsStatusNotOk);
        }

        self.update_conds(vec![MongoCondition {
            status: MongoConditionStatus::True,
            r#type: MongoConditionType::RsInit,
            message: topology::rs_name(pod).to_string(),
            reason: String::new(),
            last_transition_time: None,
        }])
        .await
    }

    /// Create every managed user, then converge the application user's
    /// password if the spec moved.
    pub async fn create_mongo_users(
        &mut self,
        pods: &[Pod],
        directory: &HostDirectory,
        password_changed: bool,
    ) -> Result<()> {
        self.create_root_user(pods).await?;
        self.create_cluster_user(pods, directory, MONGO_CLUSTER_ADMIN).await?;
        self.create_cluster_user(pods, directory, MONGO_CLUSTER_MONITOR).await?;
        self.create_or_update_db_user(pods, directory, password_changed)
            .await
    }

    /// Create the root user through the localhost exception.
    ///
    /// There is no way to know which pod is primary yet, so every data pod
    /// is tried in turn: `not master` means try the next one, an
    /// unauthenticated marker means some cluster already created the user.
    async fn create_root_user(&mut self, pods: &[Pod]) -> Result<()> {
        let Some(first) = pods.first() else {
            return Err(Error::wait("no pods to bootstrap"));
        };
        let rs = topology::rs_name(first).to_string();

        if condition_true(&self.status().conditions, MongoConditionType::UserRoot, &rs) {
            return Ok(());
        }

        let (user, password) = self.auth_info(MONGO_ROOT).await?;
        let js = scripts::create_root_user(&user, &password);

        let data_pods: Vec<&Pod> = pods
            .iter()
            .filter(|p| !topology::is_arbiter(p) && !topology::is_exporter(p))
            .collect();

        let mut create_err = Some(Error::Internal("root user create failed".to_string()));
        for pod in data_pods {
            let out = self.exec_eval(pod, &js).await?;
            if !out.ok {
                if out.stdout.contains(scripts::MARKER_NO_USERS_AUTHENTICATED) {
                    // Auth already enforced: another cluster won the race.
                    warn!("root user already created elsewhere");
                    return self.record_user_condition(MongoConditionType::UserRoot, &rs).await;
                }
                if out.stdout.contains(scripts::MARKER_NOT_MASTER) {
                    continue;
                }
                return Err(Error::Internal(format!(
                    "create root user failed: {}",
                    out.stderr
                )));
            }

            if out.stdout.contains(scripts::MARKER_CREATE_USER_SUCCESS) {
                create_err = None;
                break;
            }
            create_err = Some(Error::Internal(format!(
                "create root user fail, stdout: {}",
                out.stdout
            )));
        }

        if let Some(err) = create_err {
            return Err(err);
        }
        self.record_user_condition(MongoConditionType::UserRoot, &rs).await
    }

    /// Create an operator-facing cluster user (clusterAdmin for config
    /// writes, clusterMonitor for the exporter) as root over the wire.
    async fn create_cluster_user(
        &mut self,
        pods: &[Pod],
        directory: &HostDirectory,
        user: &str,
    ) -> Result<()> {
        let Some(first) = pods.first() else {
            return Err(Error::wait("no pods to bootstrap"));
        };
        let rs = topology::rs_name(first).to_string();

        let condition_type = match user {
            MONGO_CLUSTER_ADMIN => MongoConditionType::UserClusterAdmin,
            MONGO_CLUSTER_MONITOR => {
                if !self.cr.spec.metrics_exporter.enable {
                    return Ok(());
                }
                MongoConditionType::UserClusterMonitor
            }
            _ => return Err(Error::Internal(format!("unmanaged cluster user {}", user))),
        };

        if condition_true(&self.status().conditions, condition_type, &rs) {
            return Ok(());
        }

        let (root_user, root_password) = self.auth_info(MONGO_ROOT).await?;
        let (new_user, new_password) = self.auth_info(user).await?;
        let (role, db) = self.secret_role_and_db(user).await?;

        let client = crate::client::MongoClient::connect(
            &directory.data_addresses(),
            &root_user,
            &root_password,
            false,
        )
        .await?;
        let res = client
            .create_user_from_secret(&new_user, &new_password, &role, &db)
            .await;
        client.close().await;
        res?;

        self.record_user_condition(condition_type, &rs).await
    }

    /// Create the application user, or rotate its password when the spec
    /// changed it after creation.
    async fn create_or_update_db_user(
        &mut self,
        pods: &[Pod],
        directory: &HostDirectory,
        password_changed: bool,
    ) -> Result<()> {
        if !self.cr.spec.db_user.enable {
            return Ok(());
        }
        let Some(first) = pods.first() else {
            return Err(Error::wait("no pods to bootstrap"));
        };
        let rs = topology::rs_name(first).to_string();

        let (root_user, root_password) = self.auth_info(MONGO_ROOT).await?;
        let client = crate::client::MongoClient::connect(
            &directory.data_addresses(),
            &root_user,
            &root_password,
            false,
        )
        .await?;

        let spec = self.cr.spec.db_user.clone();
        let res = if condition_true(&self.status().conditions, MongoConditionType::UserDb, &rs) {
            if password_changed {
                info!(db = %spec.name, user = %spec.user, "application user password changed, updating");
                client.change_user_password(&spec.user, &spec.password).await
            } else {
                Ok(())
            }
        } else {
            client
                .create_user(
                    &spec.user,
                    &spec.password,
                    vec![bson::Bson::Document(
                        bson::doc! { "role": MONGO_READ_WRITE, "db": &spec.name },
                    )]
                    .into(),
                )
                .await
        };
        let already_created =
            condition_true(&self.status().conditions, MongoConditionType::UserDb, &rs);
        client.close().await;
        res?;

        if already_created {
            return Ok(());
        }
        self.record_user_condition(MongoConditionType::UserDb, &rs).await
    }

    async fn record_user_condition(
        &mut self,
        r#type: MongoConditionType,
        rs: &str,
    ) -> Result<()> {
        self.update_conds(vec![MongoCondition {
            status: MongoConditionStatus::True,
            r#type,
            message: rs.to_string(),
            reason: String::new(),
            last_transition_time: None,
        }])
        .await
    }

    /// Role and database recorded in a user's credential Secret.
    async fn secret_role_and_db(&self, user: &str) -> Result<(String, String)> {
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
        Ok((get(SECRET_KEY_ROLE), get(SECRET_KEY_DB)))
    }

    async fn exec_eval(&self, pod: &Pod, js: &str) -> Result<exec::ShellOutput> {
        exec::exec_shell(self, pod, &scripts::shell_eval_no_auth(js)).await
    }

    async fn exec_eval_with_auth(&self, pod: &Pod, js: &str) -> Result<exec::ShellOutput> {
        let password = self.cr.spec.root_password.clone().unwrap_or_default();
        exec::exec_shell(self, pod, &scripts::shell_eval_with_auth(&password, js)).await
    }
}
