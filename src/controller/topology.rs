//! Pod topology classification.
//!
//! Partitions the live pods of an instance against the desired ordinal
//! count into disjoint buckets, from which the reconciler derives all scale
//! and admission work. Classification is a pure computation over a pod
//! snapshot; nothing here touches the API server.

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, warn};

use super::labels::{
    LABEL_KEY_ARBITER, LABEL_KEY_REPLSET_NAME, LABEL_KEY_REVISION_HASH, LABEL_KEY_ROLE,
    LABEL_VAL_CONFIGSVR, LABEL_VAL_EXPORTER, LABEL_VAL_MONGOS, LABEL_VAL_SHARDSVR,
    LABEL_VAL_STANDALONE, LABEL_VAL_TRUE,
};

/// Disjoint pod buckets, recomputed every reconcile pass.
#[derive(Debug, Default)]
pub struct PodBucket {
    /// Ordinals in `[0, desired)` with no pod.
    pub miss: Vec<usize>,
    /// Healthy pods at an ordinal below the desired count.
    pub ok: Vec<Pod>,
    /// Terminating or orchestrator-pending pods.
    pub pending: Vec<Pod>,
    /// Pods neither running nor pending nor terminating.
    pub failed: Vec<Pod>,
    /// Pods at an ordinal at or beyond the desired count.
    pub redundant: Vec<Pod>,
}

/// Classify pods against the desired member count.
///
/// Each pod is slotted by its ordinal; a second pod claiming an occupied
/// slot wins (an orchestrator anomaly we only flag, see DESIGN.md).
pub fn classify(pods: &[Pod], expected: usize) -> PodBucket {
    let mut bucket = PodBucket::default();
    let mut slots: Vec<Option<Pod>> = vec![None; expected];

    for pod in pods {
        let Some(ord) = ordinal(pod) else {
            continue;
        };
        if ord >= expected {
            bucket.redundant.push(pod.clone());
        } else {
            if slots[ord].is_some() {
                warn!(ordinal = ord, pod = %pod_name(pod),
                    "two pods claim the same ordinal, keeping the later one");
            }
            slots[ord] = Some(pod.clone());
        }
    }

    let mut occupied = Vec::new();
    for (i, slot) in slots.into_iter().enumerate() {
        match slot {
            None => bucket.miss.push(i),
            Some(pod) => occupied.push(pod),
        }
    }

    for pod in occupied {
        if is_healthy(&pod) {
            bucket.ok.push(pod);
        } else if is_terminating(&pod) || is_phase(&pod, "Pending") {
            // image pull failures and unbound PVCs also show up as Pending
            bucket.pending.push(pod);
        } else {
            bucket.failed.push(pod);
        }
    }

    debug!(
        ok = ?pod_names(&bucket.ok),
        pending = ?pod_names(&bucket.pending),
        failed = ?pod_names(&bucket.failed),
        miss = ?bucket.miss,
        redundant = ?pod_names(&bucket.redundant),
        "classified pods"
    );

    bucket
}

// ============================================================================
// Pod identity
// ============================================================================

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub fn pod_names(pods: &[Pod]) -> Vec<String> {
    pods.iter().map(|p| pod_name(p).to_string()).collect()
}

/// Ordinal from the trailing `-<n>` of a workload-generated pod name.
pub fn ordinal(pod: &Pod) -> Option<usize> {
    let name = pod.metadata.name.as_deref()?;
    let (_, suffix) = name.rsplit_once('-')?;
    suffix.parse().ok()
}

/// Name of the workload owning this pod.
pub fn owner_name(pod: &Pod) -> Option<&str> {
    pod.metadata
        .owner_references
        .as_ref()?
        .first()
        .map(|o| o.name.as_str())
}

pub fn sort_by_ordinal(pods: &mut [Pod]) {
    pods.sort_by_key(|p| ordinal(p).unwrap_or(usize::MAX));
}

// ============================================================================
// Labels
// ============================================================================

fn label<'a>(pod: &'a Pod, key: &str) -> &'a str {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

pub fn role(pod: &Pod) -> &str {
    label(pod, LABEL_KEY_ROLE)
}

pub fn rs_name(pod: &Pod) -> &str {
    label(pod, LABEL_KEY_REPLSET_NAME)
}

pub fn revision_hash(pod: &Pod) -> &str {
    label(pod, LABEL_KEY_REVISION_HASH)
}

pub fn is_arbiter(pod: &Pod) -> bool {
    label(pod, LABEL_KEY_ARBITER) == LABEL_VAL_TRUE
}

pub fn is_exporter(pod: &Pod) -> bool {
    role(pod) == LABEL_VAL_EXPORTER
}

/// Roles excluded from membership reconfiguration: the config server count
/// is fixed and shard/standalone/mongos nodes carry no managed users.
pub fn is_not_need_reconfig(pod: &Pod) -> bool {
    matches!(
        role(pod),
        r if r == LABEL_VAL_STANDALONE
            || r == LABEL_VAL_MONGOS
            || r == LABEL_VAL_CONFIGSVR
            || r == LABEL_VAL_SHARDSVR
    )
}

/// First data-bearing pod, skipping arbiters and exporters.
pub fn available_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter().find(|p| !is_arbiter(p) && !is_exporter(p))
}

// ============================================================================
// Health predicates
// ============================================================================

fn is_phase(pod: &Pod, phase: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == phase)
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Running, ready and not being deleted.
pub fn is_healthy(pod: &Pod) -> bool {
    is_phase(pod, "Running") && is_pod_ready(pod) && !is_terminating(pod)
}

/// The named container exists and reports a running state.
pub fn is_container_running(pod: &Pod, container: &str) -> bool {
    if !is_phase(pod, "Running") {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses.iter().any(|c| {
                c.name == container && c.state.as_ref().is_some_and(|s| s.running.is_some())
            })
        })
}

/// The pod spec declares the named container.
pub fn has_container(pod: &Pod, container: &str) -> bool {
    pod.spec
        .as_ref()
        .is_some_and(|s| s.containers.iter().any(|c| c.name == container))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    pub(crate) fn make_pod(name: &str, phase: &str, ready: bool, terminating: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                deletion_timestamp: terminating
                    .then(|| Time(chrono::Utc::now())),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_ordinal_parsing() {
        assert_eq!(ordinal(&make_pod("sample-svc-0", "Running", true, false)), Some(0));
        assert_eq!(ordinal(&make_pod("sample-12", "Running", true, false)), Some(12));
        assert_eq!(ordinal(&make_pod("nodashnumber", "Running", true, false)), None);
        assert_eq!(ordinal(&make_pod("name-x", "Running", true, false)), None);
    }

    #[test]
    fn test_classify_partitions_completely() {
        // desired 5: ordinals 0 (ok), 1 (pending), 3 (failed), 6 (redundant);
        // 2 and 4 missing.
        let pods = vec![
            make_pod("s-0", "Running", true, false),
            make_pod("s-1", "Pending", false, false),
            make_pod("s-3", "Failed", false, false),
            make_pod("s-6", "Running", true, false),
        ];
        let bucket = classify(&pods, 5);

        assert_eq!(bucket.miss, vec![2, 4]);
        assert_eq!(pod_names(&bucket.ok), vec!["s-0"]);
        assert_eq!(pod_names(&bucket.pending), vec!["s-1"]);
        assert_eq!(pod_names(&bucket.failed), vec!["s-3"]);
        assert_eq!(pod_names(&bucket.redundant), vec!["s-6"]);

        // Every occupied ordinal below the desired count lands in exactly
        // one of ok/pending/failed, and misses fill the remainder.
        let occupied = bucket.ok.len() + bucket.pending.len() + bucket.failed.len();
        assert_eq!(occupied + bucket.miss.len(), 5);
    }

    #[test]
    fn test_classify_terminating_is_pending() {
        let pods = vec![make_pod("s-0", "Running", true, true)];
        let bucket = classify(&pods, 1);
        assert!(bucket.ok.is_empty());
        assert_eq!(pod_names(&bucket.pending), vec!["s-0"]);
    }

    #[test]
    fn test_classify_duplicate_ordinal_last_wins() {
        let mut a = make_pod("s-0", "Running", true, false);
        a.metadata.uid = Some("a".to_string());
        let mut b = make_pod("other-0", "Running", true, false);
        b.metadata.uid = Some("b".to_string());

        let bucket = classify(&[a, b], 1);
        assert_eq!(bucket.ok.len(), 1);
        assert_eq!(bucket.ok[0].metadata.uid.as_deref(), Some("b"));
    }

    #[test]
    fn test_classify_all_redundant_when_zero_desired() {
        let pods = vec![make_pod("s-0", "Running", true, false)];
        let bucket = classify(&pods, 0);
        assert!(bucket.miss.is_empty());
        assert_eq!(bucket.redundant.len(), 1);
    }

    #[test]
    fn test_available_pod_skips_arbiter_and_exporter() {
        let mut arbiter = make_pod("s-arbiter-0", "Running", true, false);
        arbiter.metadata.labels = Some(
            [(LABEL_KEY_ARBITER.to_string(), LABEL_VAL_TRUE.to_string())].into(),
        );
        let data = make_pod("s-0", "Running", true, false);

        let pods = vec![arbiter, data];
        assert_eq!(pod_name(available_pod(&pods).unwrap()), "s-0");
    }

    #[test]
    fn test_is_not_need_reconfig() {
        let mut pod = make_pod("s-0", "Running", true, false);
        pod.metadata.labels = Some(
            [(LABEL_KEY_ROLE.to_string(), LABEL_VAL_MONGOS.to_string())].into(),
        );
        assert!(is_not_need_reconfig(&pod));

        let plain = make_pod("s-1", "Running", true, false);
        assert!(!is_not_need_reconfig(&plain));
    }

    #[test]
    fn test_sort_by_ordinal() {
        let mut pods = vec![
            make_pod("s-2", "Running", true, false),
            make_pod("s-0", "Running", true, false),
            make_pod("s-1", "Running", true, false),
        ];
        sort_by_ordinal(&mut pods);
        assert_eq!(pod_names(&pods), vec!["s-0", "s-1", "s-2"]);
    }
}
