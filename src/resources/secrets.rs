//! Secret generation for cluster credentials.
//!
//! One keyfile Secret shared by all members for intra-cluster auth, plus
//! one credential Secret per managed user (root, clusterAdmin,
//! clusterMonitor). The keyfile must be identical across every cluster
//! hosting members of the same replica set, so it derives from the spec's
//! root password.

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::client::types::{
    DB_ADMIN, SECRET_KEY_DB, SECRET_KEY_PASSWORD, SECRET_KEY_ROLE, SECRET_KEY_USER,
};
use crate::crd::MongoDb;

use super::common::{KEYFILE_SECRET_KEY, SUFFIX_KEYFILE_SECRET, owner_reference};

const PASSWORD_LEN: usize = 8;

/// Keyfile used for member-to-member authentication.
pub fn keyfile_secret(resource: &MongoDb) -> Secret {
    let name = resource.name_any();
    Secret {
        metadata: ObjectMeta {
            name: Some(format!("{}{}", name, SUFFIX_KEYFILE_SECRET)),
            namespace: resource.namespace(),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        data: Some(
            [(
                KEYFILE_SECRET_KEY.to_string(),
                ByteString(
                    resource
                        .spec
                        .root_password
                        .clone()
                        .unwrap_or_default()
                        .into_bytes(),
                ),
            )]
            .into(),
        ),
        ..Default::default()
    }
}

/// Credential Secret for one managed admin user. The role matches the user
/// name; a missing spec password means a random one is generated once (the
/// Secret is never overwritten).
pub fn admin_secret(resource: &MongoDb, user: &str) -> Secret {
    let password = resource
        .spec
        .root_password
        .clone()
        .unwrap_or_else(random_password);

    Secret {
        metadata: ObjectMeta {
            name: Some(user_secret_name(resource, user)),
            namespace: resource.namespace(),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        data: Some(
            [
                (SECRET_KEY_USER.to_string(), ByteString(user.into())),
                (SECRET_KEY_PASSWORD.to_string(), ByteString(password.into_bytes())),
                (SECRET_KEY_ROLE.to_string(), ByteString(user.into())),
                (SECRET_KEY_DB.to_string(), ByteString(DB_ADMIN.into())),
            ]
            .into(),
        ),
        ..Default::default()
    }
}

/// `<instance>-<user>` in lowercase; object names cannot carry capitals.
pub fn user_secret_name(resource: &MongoDb, user: &str) -> String {
    format!("{}-{}", resource.name_any(), user.to_lowercase())
}

fn random_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::client::types::MONGO_CLUSTER_ADMIN;

    fn sample(root_password: Option<&str>) -> MongoDb {
        let mut spec = serde_json::json!({
            "members": 3,
            "memberConfigRef": "sample-hosts"
        });
        if let Some(pw) = root_password {
            spec["rootPassword"] = serde_json::json!(pw);
        }
        serde_json::from_value(serde_json::json!({
            "apiVersion": "mongodb.operator.io/v1alpha1",
            "kind": "MongoDb",
            "metadata": {"name": "sample", "namespace": "default", "uid": "u1"},
            "spec": spec
        }))
        .unwrap()
    }

    #[test]
    fn test_user_secret_name_lowercased() {
        assert_eq!(
            user_secret_name(&sample(None), MONGO_CLUSTER_ADMIN),
            "sample-clusteradmin"
        );
    }

    #[test]
    fn test_admin_secret_uses_spec_password() {
        let secret = admin_secret(&sample(Some("s3cret")), "root");
        let data = secret.data.unwrap();
        assert_eq!(data[SECRET_KEY_PASSWORD].0, b"s3cret");
        assert_eq!(data[SECRET_KEY_ROLE].0, b"root");
        assert_eq!(data[SECRET_KEY_DB].0, b"admin");
    }

    #[test]
    fn test_admin_secret_generates_password_when_unset() {
        let secret = admin_secret(&sample(None), "root");
        let data = secret.data.unwrap();
        assert_eq!(data[SECRET_KEY_PASSWORD].0.len(), PASSWORD_LEN);
    }

    #[test]
    fn test_keyfile_secret_name() {
        let secret = keyfile_secret(&sample(Some("pw")));
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("sample-keyfile-secret")
        );
    }
}
