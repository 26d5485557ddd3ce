//! Label scheme shared by every managed object.

use std::collections::BTreeMap;

pub const LABEL_KEY_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_KEY_INSTANCE: &str = "app.kubernetes.io/instance";
/// Externally routable VIP of the hosting cluster, stamped on the CR by the
/// scheduling layer.
pub const LABEL_KEY_CLUSTER_VIP: &str = "mongodb.operator.io/vip";
pub const LABEL_KEY_APP: &str = "app";
pub const LABEL_KEY_ROLE: &str = "role";
pub const LABEL_KEY_REPLSET_NAME: &str = "replSetName";
pub const LABEL_KEY_ARBITER: &str = "arbiter";
pub const LABEL_KEY_DATA: &str = "data";
/// Stamped on every managed workload from `status.currentRevision`;
/// compared against the desired revision during rolling restarts.
pub const LABEL_KEY_REVISION_HASH: &str = "mongodb.operator.io/revision-hash";

pub const LABEL_VAL_REPLSET: &str = "replset";
pub const LABEL_VAL_STANDALONE: &str = "standalone";
pub const LABEL_VAL_MONGOS: &str = "mongos";
pub const LABEL_VAL_CONFIGSVR: &str = "configsvr";
pub const LABEL_VAL_SHARDSVR: &str = "shardsvr";
pub const LABEL_VAL_EXPORTER: &str = "exporter";
pub const LABEL_VAL_TRUE: &str = "true";

pub const MANAGED_BY: &str = "mongodb-operator";

pub type Labels = BTreeMap<String, String>;

/// Merge label maps left to right; later maps win on key collisions.
pub fn merge_labels<const N: usize>(maps: [&Labels; N]) -> Labels {
    let mut out = Labels::new();
    for m in maps {
        for (k, v) in m {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

pub fn with_label(mut labels: Labels, key: &str, value: &str) -> Labels {
    labels.insert(key.to_string(), value.to_string());
    labels
}

pub fn arbiter_label(labels: Labels) -> Labels {
    with_label(labels, LABEL_KEY_ARBITER, LABEL_VAL_TRUE)
}

pub fn data_label(labels: Labels) -> Labels {
    with_label(labels, LABEL_KEY_DATA, LABEL_VAL_TRUE)
}

/// Render a label map as a `k1=v1,k2=v2` selector string.
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_later_wins() {
        let a: Labels = [("x".to_string(), "1".to_string())].into();
        let b: Labels = [("x".to_string(), "2".to_string())].into();
        let merged = merge_labels([&a, &b]);
        assert_eq!(merged.get("x"), Some(&"2".to_string()));
    }

    #[test]
    fn test_selector_string_sorted() {
        let labels: Labels = [
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]
        .into();
        assert_eq!(selector_string(&labels), "a=1,b=2");
    }
}
