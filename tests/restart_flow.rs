//! Rolling-restart lifecycle tests.
//!
//! Drives the pure restart state machine through full cycles the way the
//! reconciler does: one step per pass, phase persisted between passes,
//! an unhealthy topology suspending progress without losing the phase.

use mongodb_operator::controller::restart::{
    RestartOutcome, needs_replacement, next_restart_state,
};
use mongodb_operator::crd::RestartState;

/// Simulated cluster driving the coordinator across reconcile passes.
struct MockCluster {
    restart_state: RestartState,
    ready_pods: usize,
    expected_pods: usize,
    secondary_deletions: usize,
    primary_deletions: usize,
    step_downs: usize,
}

impl MockCluster {
    fn new(expected_pods: usize) -> Self {
        Self {
            restart_state: RestartState::NotInProcess,
            ready_pods: expected_pods,
            expected_pods,
            secondary_deletions: 0,
            primary_deletions: 0,
            step_downs: 0,
        }
    }

    /// One reconcile pass worth of restart work.
    fn step(&mut self) -> RestartOutcome {
        // Gate: an unhealthy topology suspends the restart entirely.
        if self.ready_pods < self.expected_pods {
            return RestartOutcome::IN_PROGRESS;
        }

        match self.restart_state {
            RestartState::NotInProcess => {
                self.secondary_deletions += self.expected_pods - 1;
            }
            RestartState::SecondaryDeleted => {
                self.step_downs += 1;
                self.primary_deletions += 1;
            }
            RestartState::PrimaryDeleted => {}
        }

        let (next, outcome) = next_restart_state(self.restart_state);
        self.restart_state = next;
        outcome
    }
}

#[test]
fn full_restart_takes_three_passes() {
    let mut cluster = MockCluster::new(3);

    assert!(!cluster.step().complete);
    assert_eq!(cluster.restart_state, RestartState::SecondaryDeleted);
    assert_eq!(cluster.secondary_deletions, 2);
    assert_eq!(cluster.primary_deletions, 0);

    assert!(!cluster.step().complete);
    assert_eq!(cluster.restart_state, RestartState::PrimaryDeleted);
    assert_eq!(cluster.step_downs, 1);
    assert_eq!(cluster.primary_deletions, 1);

    assert!(cluster.step().complete);
    assert_eq!(cluster.restart_state, RestartState::NotInProcess);
}

#[test]
fn primary_is_never_deleted_before_secondaries() {
    let mut cluster = MockCluster::new(3);
    while !cluster.step().complete {
        // While any secondaries still await deletion, the primary must be
        // untouched.
        if cluster.restart_state == RestartState::SecondaryDeleted {
            assert_eq!(cluster.primary_deletions, 0);
        }
    }
    assert_eq!(cluster.secondary_deletions, 2);
    assert_eq!(cluster.primary_deletions, 1);
    // Step-down always precedes the primary deletion.
    assert_eq!(cluster.step_downs, cluster.primary_deletions);
}

#[test]
fn unhealthy_topology_suspends_without_losing_phase() {
    let mut cluster = MockCluster::new(3);

    assert!(!cluster.step().complete);
    assert_eq!(cluster.restart_state, RestartState::SecondaryDeleted);

    // Secondaries are being recreated; the phase must hold with no
    // progress and no error.
    cluster.ready_pods = 1;
    for _ in 0..5 {
        assert!(!cluster.step().complete);
        assert_eq!(cluster.restart_state, RestartState::SecondaryDeleted);
        assert_eq!(cluster.primary_deletions, 0);
    }

    // Recovered: the restart resumes exactly where it paused.
    cluster.ready_pods = 3;
    assert!(!cluster.step().complete);
    assert_eq!(cluster.restart_state, RestartState::PrimaryDeleted);
    assert!(cluster.step().complete);
}

#[test]
fn each_phase_visited_exactly_once_per_cycle() {
    let mut cluster = MockCluster::new(5);
    let mut phases = Vec::new();
    loop {
        let outcome = cluster.step();
        phases.push(cluster.restart_state);
        if outcome.complete {
            break;
        }
    }
    assert_eq!(
        phases,
        vec![
            RestartState::SecondaryDeleted,
            RestartState::PrimaryDeleted,
            RestartState::NotInProcess,
        ]
    );

    // A second cycle behaves identically; completion resets the machine.
    let deletions_before = cluster.primary_deletions;
    let mut phases = Vec::new();
    loop {
        let outcome = cluster.step();
        phases.push(cluster.restart_state);
        if outcome.complete {
            break;
        }
    }
    assert_eq!(phases.len(), 3);
    assert_eq!(cluster.primary_deletions, deletions_before + 1);
}

#[test]
fn replacement_predicate_tracks_revision_drift() {
    assert!(needs_replacement("sample-1a2b3c", "sample-9f8e7d"));
    assert!(!needs_replacement("sample-1a2b3c", "sample-1a2b3c"));
    // A pod with no stamped revision is always replaced.
    assert!(needs_replacement("", "sample-1a2b3c"));
}
