//! Membership convergence scenarios across directory resolution, the
//! membership algebra and member health classification.

use mongodb_operator::client::members::{diff, merge, remove};
use mongodb_operator::client::types::{
    Member, ReplSetMemberStatus, classify_member_health,
};
use mongodb_operator::controller::directory::{HostDirectory, ResolveScope};
use mongodb_operator::controller::sync::{scale_down_count, scale_up_targets};

fn directory(data: usize, arbiters: usize) -> HostDirectory {
    let data = (0..data)
        .map(|i| format!("_id:{},host:'10.0.0.{}:3{}017'", i, i, i))
        .collect::<Vec<_>>()
        .join("\n");
    let arbiters = (0..arbiters)
        .map(|i| format!("_id:{},host:'10.0.1.{}:37017'", i, i))
        .collect::<Vec<_>>()
        .join("\n");
    HostDirectory { data, arbiters }
}

#[test]
fn bootstrap_membership_matches_directory_order() {
    let dir = directory(3, 1);
    let members = dir.resolve(true, ResolveScope::All);

    assert_eq!(members.len(), 4);
    let ids: Vec<i32> = members.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert!(members[3].arbiter_only);
    assert!(members.iter().all(|m| m.votes == 1));
}

#[test]
fn growing_directory_admits_only_new_hosts() {
    // The replica set was initiated with three members; the directory now
    // publishes five.
    let initial = directory(3, 0).resolve(false, ResolveScope::All);
    let grown = directory(5, 0).resolve(false, ResolveScope::All);

    let (missing, changed) = diff(&initial, &grown);
    assert!(changed);
    assert_eq!(missing.len(), 2);
    // Ids continue past the live maximum, regardless of directory ids.
    assert_eq!(missing[0].id, 3);
    assert_eq!(missing[1].id, 4);

    let (merged, changed) = merge(&initial, &grown);
    assert!(changed);
    assert_eq!(merged.len(), 5);

    // Converged: a second pass is a no-op and must skip the config write.
    let (_, changed) = merge(&merged, &grown);
    assert!(!changed);
}

#[test]
fn scale_down_removes_only_the_truncated_tail() {
    let members = directory(4, 0).resolve(false, ResolveScope::All);

    // Workload plan: from four provisioned members down to two.
    assert_eq!(scale_down_count(4, 2), 2);

    let victims: Vec<Member> = members[2..].to_vec();
    let (remaining, changed) = remove(&members, &victims);
    assert!(changed);
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|m| m.id < 2));
}

#[test]
fn provisioning_plan_counts_match_spec() {
    // Five member Services, three provisioned workloads: exactly two
    // creations and no removals.
    let services: Vec<String> = (0..5).map(|i| format!("db-svc-{}", i)).collect();
    let workloads: Vec<String> = (0..3).map(|i| format!("db-svc-{}", i)).collect();

    assert_eq!(scale_up_targets(&services, &workloads).len(), 2);
    assert_eq!(scale_down_count(workloads.len(), 5), 0);
}

#[test]
fn broken_member_is_classified_unknown_and_survivors_healthy() {
    let status = |host: &str, role: &str, state: i32| ReplSetMemberStatus {
        host: host.to_string(),
        state_str: role.to_string(),
        state,
        health: 1.0,
        ..Default::default()
    };

    let members = vec![
        status("10.0.0.0:30017", "PRIMARY", 1),
        status("10.0.0.1:31017", "SECONDARY", 2),
        // Role string says primary but the state code disagrees.
        status("10.0.0.2:32017", "PRIMARY", 2),
        status("10.0.1.0:37017", "ARBITER", 7),
    ];

    let health = classify_member_health(&members);
    assert_eq!(health.unknown_hosts, vec!["10.0.0.2:32017".to_string()]);
    assert_eq!(health.healthy_hosts.len(), 3);

    // Recovery evicts the unknown host and re-admits its directory entry.
    let config = directory(3, 1).resolve(true, ResolveScope::All);
    let evicted: Vec<Member> = health
        .unknown_hosts
        .iter()
        .map(|h| Member::data(h.clone()))
        .collect();
    let (without, changed) = remove(&config, &evicted);
    assert!(changed);
    assert_eq!(without.len(), 3);

    let entry: Vec<Member> = config
        .iter()
        .filter(|m| health.unknown_hosts.contains(&m.host))
        .cloned()
        .collect();
    let (repaired, changed) = merge(&without, &entry);
    assert!(changed);
    assert_eq!(repaired.len(), 4);
}
