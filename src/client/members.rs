//! Pure set operations over replica set member lists.
//!
//! All operations key on `host`, not `_id`: ids are assigned late, when an
//! entry is appended to a live configuration, as `max(existing ids) + n`.
//! None of these functions perform I/O; callers read the live config, apply
//! an operation and write the result back only when `changed` is true.

use super::types::Member;

/// Hosts of the given members, in order.
pub fn member_hosts(members: &[Member]) -> Vec<String> {
    members.iter().map(|m| m.host.clone()).collect()
}

/// Union-merge `incoming` into `existing`.
///
/// Incoming hosts already present keep their existing entry untouched (id
/// stability). New hosts are appended in incoming order with ids continuing
/// past the current maximum. Returns `changed = false` when nothing was
/// added, in which case the caller must skip the config write.
pub fn merge(existing: &[Member], incoming: &[Member]) -> (Vec<Member>, bool) {
    let max_id = existing.iter().map(|m| m.id).max().unwrap_or(0);

    let mut merged = existing.to_vec();
    let mut offset = 0;
    for m in incoming {
        if existing.iter().any(|e| e.host == m.host) {
            continue;
        }
        offset += 1;
        let mut added = m.clone();
        added.id = max_id + offset;
        merged.push(added);
    }

    let changed = offset > 0;
    if changed { (merged, true) } else { (existing.to_vec(), false) }
}

/// Like [`merge`], but returns only the entries that would be added, with
/// their ids already assigned. Used when the caller wants to inspect what is
/// missing before committing a write.
pub fn diff(existing: &[Member], incoming: &[Member]) -> (Vec<Member>, bool) {
    let max_id = existing.iter().map(|m| m.id).max().unwrap_or(0);

    let mut missing = Vec::new();
    for m in incoming {
        if existing.iter().any(|e| e.host == m.host) {
            continue;
        }
        let mut added = m.clone();
        added.id = max_id + 1 + missing.len() as i32;
        missing.push(added);
    }

    let changed = !missing.is_empty();
    (missing, changed)
}

/// Remove every member of `to_remove` (matched by host) from `existing`.
///
/// Returns `changed = false` when no host matched.
pub fn remove(existing: &[Member], to_remove: &[Member]) -> (Vec<Member>, bool) {
    let remaining: Vec<Member> = existing
        .iter()
        .filter(|m| !to_remove.iter().any(|r| r.host == m.host))
        .cloned()
        .collect();

    let changed = remaining.len() != existing.len();
    (remaining, changed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn member(id: i32, host: &str) -> Member {
        Member {
            id,
            ..Member::data(host)
        }
    }

    #[test]
    fn test_merge_appends_with_next_ids() {
        let existing = vec![member(0, "a:27017"), member(1, "b:27017")];
        let incoming = vec![member(0, "c:27017"), member(0, "d:27017")];

        let (merged, changed) = merge(&existing, &incoming);
        assert!(changed);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[2].host, "c:27017");
        assert_eq!(merged[2].id, 2);
        assert_eq!(merged[3].host, "d:27017");
        assert_eq!(merged[3].id, 3);
    }

    #[test]
    fn test_merge_noop_when_all_present() {
        let existing = vec![member(0, "a:27017"), member(1, "b:27017")];
        let incoming = vec![member(7, "a:27017")];

        let (merged, changed) = merge(&existing, &incoming);
        assert!(!changed);
        assert_eq!(merged, existing);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let existing = vec![member(0, "a:27017")];
        let incoming = vec![member(0, "b:27017"), member(0, "c:27017")];

        let (once, changed) = merge(&existing, &incoming);
        assert!(changed);
        let (twice, changed) = merge(&once, &incoming);
        assert!(!changed);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_no_duplicate_ids_or_hosts() {
        // Gapped ids must still yield unique new ids.
        let existing = vec![member(0, "a:27017"), member(5, "b:27017")];
        let incoming = vec![member(0, "c:27017"), member(0, "d:27017")];

        let (merged, _) = merge(&existing, &incoming);
        let mut ids: Vec<i32> = merged.iter().map(|m| m.id).collect();
        let mut hosts: Vec<&str> = merged.iter().map(|m| m.host.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        hosts.sort_unstable();
        hosts.dedup();
        assert_eq!(ids.len(), merged.len());
        assert_eq!(hosts.len(), merged.len());
        assert_eq!(ids, vec![0, 5, 6, 7]);
    }

    #[test]
    fn test_diff_reports_only_missing() {
        let existing = vec![member(0, "a:27017"), member(1, "b:27017")];
        let incoming = vec![member(0, "b:27017"), member(0, "c:27017")];

        let (missing, changed) = diff(&existing, &incoming);
        assert!(changed);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].host, "c:27017");
        assert_eq!(missing[0].id, 2);
    }

    #[test]
    fn test_diff_empty_incoming_is_unchanged() {
        let existing = vec![member(0, "a:27017")];
        let (missing, changed) = diff(&existing, &[]);
        assert!(!changed);
        assert!(missing.is_empty());
    }

    #[test]
    fn test_remove_by_host() {
        let existing = vec![member(0, "a:27017"), member(1, "b:27017"), member(2, "c:27017")];
        let (remaining, changed) = remove(&existing, &[member(9, "b:27017")]);
        assert!(changed);
        assert_eq!(member_hosts(&remaining), vec!["a:27017", "c:27017"]);
    }

    #[test]
    fn test_remove_noop_when_absent() {
        let existing = vec![member(0, "a:27017")];
        let (remaining, changed) = remove(&existing, &[member(0, "z:27017")]);
        assert!(!changed);
        assert_eq!(remaining, existing);
    }
}
