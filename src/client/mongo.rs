//! MongoDB admin client for replica set configuration management.
//!
//! Wraps the official driver with the small command surface the reconciler
//! needs: read/write the replica set config, query member status, step a
//! primary down and manage the bootstrap users. Every command runs against
//! the `admin` database under a fixed timeout; an elapsed timeout is
//! reported as a transport error, never as a command failure.

use std::time::Duration;

use bson::{Bson, Document, doc};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use tracing::{debug, info, instrument};

use super::members;
use super::types::{
    CommandResponse, DB_ADMIN, DB_LOCAL, Member, MemberHealth, MongoError,
    MONGO_CLUSTER_MONITOR, ReplSetConfig, ReplSetConfigWrap, ReplSetMemberStatus,
    ReplSetStatusResponse, ServerReplInfo, ServerStatusResponse, classify_member_health,
};

/// Bound on every admin command and on connection establishment.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period passed to `replSetStepDown`.
const STEP_DOWN_SECS: i32 = 60;

/// A connection to one node (direct) or to the replica set as a whole.
pub struct MongoClient {
    client: mongodb::Client,
    addrs: Vec<String>,
}

impl MongoClient {
    /// Connect with clusterAdmin/root credentials.
    ///
    /// `direct` bypasses replica-set topology discovery and talks to exactly
    /// the given node; required while the set is broken or unelected.
    #[instrument(skip(password))]
    pub async fn connect(
        addrs: &[String],
        user: &str,
        password: &str,
        direct: bool,
    ) -> Result<Self, MongoError> {
        info!(addrs = ?addrs, direct, "dial mongo");

        let hosts = addrs
            .iter()
            .map(|a| {
                ServerAddress::parse(a).map_err(|e| MongoError::InvalidAddress(format!("{a}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let credential = Credential::builder()
            .username(user.to_string())
            .password(password.to_string())
            .source(DB_ADMIN.to_string())
            .build();

        let options = ClientOptions::builder()
            .hosts(hosts)
            .credential(credential)
            .direct_connection(direct)
            .connect_timeout(COMMAND_TIMEOUT)
            .server_selection_timeout(COMMAND_TIMEOUT)
            .build();

        let client = mongodb::Client::with_options(options)?;
        Ok(Self {
            client,
            addrs: addrs.to_vec(),
        })
    }

    /// Addresses this client was dialed with.
    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Tear down the connection pool.
    pub async fn close(self) {
        self.client.shutdown().await;
    }

    /// Run an admin command under the fixed timeout.
    async fn run_admin(&self, name: &str, cmd: Document) -> Result<Document, MongoError> {
        debug!(command = name, "run mongo command");
        let db = self.client.database(DB_ADMIN);
        let fut = db.run_command(cmd, None);
        match tokio::time::timeout(COMMAND_TIMEOUT, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(MongoError::Timeout(name.to_string())),
        }
    }

    fn check_ok(name: &str, resp: &CommandResponse) -> Result<(), MongoError> {
        if resp.ok == 1.0 {
            Ok(())
        } else {
            Err(MongoError::CommandNotOk(format!(
                "{}: {}",
                name,
                resp.errmsg.as_deref().unwrap_or("unknown error")
            )))
        }
    }

    /// Read the live replica set configuration.
    #[instrument(skip(self))]
    pub async fn read_config(&self) -> Result<ReplSetConfig, MongoError> {
        let doc = self.run_admin("replSetGetConfig", doc! { "replSetGetConfig": 1 }).await?;
        let wrap: ReplSetConfigWrap = bson::from_document(doc)?;
        if wrap.ok != 1.0 {
            return Err(MongoError::CommandNotOk("replSetGetConfig".to_string()));
        }
        wrap.config
            .ok_or_else(|| MongoError::CommandNotOk("replSetGetConfig: missing config".to_string()))
    }

    /// Write a configuration whose version the caller has already bumped.
    ///
    /// Always forced so the write is accepted even without an elected
    /// primary, which is exactly the situation during bootstrap and
    /// recovery.
    #[instrument(skip(self, cfg), fields(version = cfg.version, members = cfg.members.len()))]
    pub async fn write_config(&self, cfg: &ReplSetConfig) -> Result<(), MongoError> {
        info!(version = cfg.version, "write replica set config");
        let cfg_doc = bson::to_document(cfg)?;
        let doc = self
            .run_admin(
                "replSetReconfig",
                doc! { "replSetReconfig": cfg_doc, "force": true },
            )
            .await?;
        let resp: CommandResponse = bson::from_document(doc)?;
        Self::check_ok("replSetReconfig", &resp)
    }

    /// Merge the given members into the live config; no-op write skipped.
    #[instrument(skip(self, add), fields(add = add.len()))]
    pub async fn add_members(&self, add: &[Member]) -> Result<(), MongoError> {
        let mut cfg = self.read_config().await?;
        let (merged, changed) = members::merge(&cfg.members, add);
        if !changed {
            return Ok(());
        }
        cfg.members = merged;
        cfg.version += 1;
        info!("add members to replica set config");
        self.write_config(&cfg).await
    }

    /// Remove the given members (by host) from the live config; no-op write
    /// skipped.
    #[instrument(skip(self, del), fields(del = del.len()))]
    pub async fn remove_members(&self, del: &[Member]) -> Result<(), MongoError> {
        let mut cfg = self.read_config().await?;
        let (remaining, changed) = members::remove(&cfg.members, del);
        if !changed {
            return Ok(());
        }
        cfg.members = remaining;
        cfg.version += 1;
        self.write_config(&cfg).await
    }

    /// Member statuses from `replSetGetStatus`, kept in the CR status.
    #[instrument(skip(self))]
    pub async fn repl_member_status(&self) -> Result<Vec<ReplSetMemberStatus>, MongoError> {
        let doc = self.run_admin("replSetGetStatus", doc! { "replSetGetStatus": 1 }).await?;
        let resp: ReplSetStatusResponse = bson::from_document(doc)?;
        if resp.ok != 1.0 {
            return Err(MongoError::CommandNotOk("replSetGetStatus".to_string()));
        }
        Ok(resp.members)
    }

    /// Whether the replica set answers `replSetGetStatus` at all, i.e. has
    /// been initiated.
    #[instrument(skip(self))]
    pub async fn check_repl_set_init(&self) -> Result<(), MongoError> {
        let doc = self.run_admin("replSetGetStatus", doc! { "replSetGetStatus": 1 }).await?;
        let resp: CommandResponse = bson::from_document(doc)?;
        Self::check_ok("replSetGetStatus", &resp)
    }

    /// Cross-reference every member's role against its numeric state.
    #[instrument(skip(self))]
    pub async fn check_member_status(&self) -> Result<MemberHealth, MongoError> {
        let members = self.repl_member_status().await?;
        Ok(classify_member_health(&members))
    }

    /// This node's own view of the replica set (`serverStatus.repl`).
    #[instrument(skip(self))]
    pub async fn server_repl_info(&self) -> Result<ServerReplInfo, MongoError> {
        let doc = self
            .run_admin("serverStatus", doc! { "serverStatus": 1, "repl": 1 })
            .await?;
        let resp: ServerStatusResponse = bson::from_document(doc)?;
        if resp.ok != 1.0 {
            return Err(MongoError::CommandNotOk("serverStatus".to_string()));
        }
        Ok(resp.repl)
    }

    /// Ask the current primary to relinquish its role.
    ///
    /// A successful step-down severs every client connection, so a network
    /// error in the response is the expected side effect of success and is
    /// not reported as a failure.
    #[instrument(skip(self))]
    pub async fn step_down(&self) -> Result<(), MongoError> {
        let res = self
            .run_admin("replSetStepDown", doc! { "replSetStepDown": STEP_DOWN_SECS })
            .await;
        let doc = match res {
            Ok(doc) => doc,
            Err(MongoError::Driver(e)) if is_stepdown_disconnect(&e) => {
                debug!("connection dropped during step down, treating as success");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let resp: CommandResponse = bson::from_document(doc)?;
        Self::check_ok("replSetStepDown", &resp)
    }

    /// Create a user from credential-secret fields. The clusterMonitor user
    /// additionally gets read on `local` for oplog metrics.
    #[instrument(skip(self, password))]
    pub async fn create_user_from_secret(
        &self,
        user: &str,
        password: &str,
        role: &str,
        db: &str,
    ) -> Result<(), MongoError> {
        let mut roles = vec![Bson::Document(doc! { "role": role, "db": db })];
        if user == MONGO_CLUSTER_MONITOR {
            roles.push(Bson::Document(doc! { "role": "read", "db": DB_LOCAL }));
        }
        self.create_user(user, password, roles.into()).await
    }

    /// Create a user with explicit role documents. An already existing user
    /// is treated as success.
    #[instrument(skip(self, password, roles))]
    pub async fn create_user(
        &self,
        user: &str,
        password: &str,
        roles: bson::Array,
    ) -> Result<(), MongoError> {
        let res = self
            .run_admin(
                "createUser",
                doc! { "createUser": user, "pwd": password, "roles": roles },
            )
            .await;
        let doc = match res {
            Ok(doc) => doc,
            Err(e) if e.to_string().contains("already exists") => {
                info!(user, "user already exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let resp: CommandResponse = bson::from_document(doc)?;
        Self::check_ok("createUser", &resp)
    }

    /// Update an existing user's password.
    #[instrument(skip(self, password))]
    pub async fn change_user_password(
        &self,
        user: &str,
        password: &str,
    ) -> Result<(), MongoError> {
        let doc = self
            .run_admin("updateUser", doc! { "updateUser": user, "pwd": password })
            .await?;
        let resp: CommandResponse = bson::from_document(doc)?;
        Self::check_ok("updateUser", &resp)
    }
}

/// Step-down closes the connection on success; both a raw I/O error and the
/// driver's NetworkError label mean the command went through.
fn is_stepdown_disconnect(err: &mongodb::error::Error) -> bool {
    err.contains_label("NetworkError")
        || matches!(*err.kind, mongodb::error::ErrorKind::Io(_))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_check_ok() {
        let ok = CommandResponse {
            ok: 1.0,
            errmsg: None,
        };
        assert!(MongoClient::check_ok("x", &ok).is_ok());

        let not_ok = CommandResponse {
            ok: 0.0,
            errmsg: Some("boom".to_string()),
        };
        let err = MongoClient::check_ok("x", &not_ok).unwrap_err();
        assert!(matches!(err, MongoError::CommandNotOk(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_stepdown_disconnect_detection() {
        let io_err = mongodb::error::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_stepdown_disconnect(&io_err));
    }
}
