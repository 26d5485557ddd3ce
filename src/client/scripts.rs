//! Shell bootstrap sub-protocol.
//!
//! Before any credentialed client can connect (no users exist yet), the
//! operator drives mongod through a literal `mongo --eval` command executed
//! inside the target container and branches on fixed substrings of its
//! textual output. The command shapes and the recognized markers below are
//! load-bearing: the auth-retry ordering and the marker set are externally
//! observed behavior and must not change.

/// The script placed in `--eval` must not contain single quotes.
pub fn shell_eval_no_auth(script: &str) -> String {
    format!("mongo --eval '{}'", script)
}

pub fn shell_eval_with_auth(password: &str, script: &str) -> String {
    format!("mongo -u root -p '{}' --eval '{}'", password, script)
}

/// `rs.initiate({_id: "rs0", members: [{_id:0,host:'10.29.13.87:27017'}]});`
pub fn rs_initiate(rs_name: &str, members_json: &str) -> String {
    format!(r#"rs.initiate({{_id: "{}", members: {}}});"#, rs_name, members_json)
}

/// Forced reconfig used when concurrent initiation produced divergent
/// replica set ids.
pub fn rs_reconfig(rs_name: &str, members_json: &str) -> String {
    format!(
        r#"rs.reconfig({{_id: "{}", members: {}, force: true }});"#,
        rs_name, members_json
    )
}

pub const RS_STATUS: &str = "rs.status();";

/// Prints the node's own `host:port` (arbiters expose no credentialed
/// access, so this is the only way to learn their published address).
pub const SERVER_REPL_ME: &str = "db.serverStatus().repl.me;";

/// First user must be created through the localhost exception.
pub fn create_root_user(user: &str, password: &str) -> String {
    format!(
        r#"
db.getSiblingDB("admin").createUser({{
    user: "{}",
    pwd: "{}",
    roles: [{{role: "root", db: "admin"}}]
}});
"#,
        user, password
    )
}

// Output markers. Success looks like `"ok" : 1`; failures carry an error
// code name or a driver message.
pub const MARKER_OK: &str = r#""ok" : 1"#;
pub const MARKER_ALREADY_INITIALIZED: &str = "AlreadyInitialized";
pub const MARKER_CONFIG_INCOMPATIBLE: &str = "NewReplicaSetConfigurationIncompatible";
pub const MARKER_CREATE_USER_SUCCESS: &str = "Successfully added user";
/// Auth is already enforced, meaning the user exists; retry with root auth.
pub const MARKER_NO_USERS_AUTHENTICATED: &str = "no users authenticated";
/// createUser ran against a node that is not primary; try the next pod.
pub const MARKER_NOT_MASTER: &str = "not master";
pub const MARKER_RECONFIG_UNAUTHORIZED: &str = "not authorized on admin to execute command";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_eval_shapes() {
        assert_eq!(
            shell_eval_no_auth("rs.status();"),
            "mongo --eval 'rs.status();'"
        );
        assert_eq!(
            shell_eval_with_auth("pw", "rs.status();"),
            "mongo -u root -p 'pw' --eval 'rs.status();'"
        );
    }

    #[test]
    fn test_rs_initiate_shape() {
        let js = rs_initiate("rs0", r#"[{"_id":0,"host":"10.0.0.1:27017"}]"#);
        assert_eq!(
            js,
            r#"rs.initiate({_id: "rs0", members: [{"_id":0,"host":"10.0.0.1:27017"}]});"#
        );
    }

    #[test]
    fn test_rs_reconfig_forces() {
        let js = rs_reconfig("rs0", "[]");
        assert!(js.contains("force: true"));
        assert!(js.starts_with("rs.reconfig"));
    }

    #[test]
    fn test_create_root_user_roles() {
        let js = create_root_user("root", "secret");
        assert!(js.contains(r#"user: "root""#));
        assert!(js.contains(r#"roles: [{role: "root", db: "admin"}]"#));
    }
}
