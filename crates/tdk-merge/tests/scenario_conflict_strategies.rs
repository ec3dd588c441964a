use chrono::{Duration, TimeZone, Utc};
use tdk_merge::*;
use tdk_schemas::{Actor, Task, VectorClock};

fn base_task(title: &str) -> Task {
    let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut t = Task::new("42", "ws1", title, t0);
    t.sequence_num = 7;
    t
}

/// Local and remote copies of task 42 with concurrent clocks:
/// local {user:3} edited the title to "A", the server push carries
/// {user:2, server:4} and title "B".
fn concurrent_pair() -> (Task, Task) {
    let mut local = base_task("A");
    local.actor = Actor::User;
    local.vector_clock = [(Actor::User, 3)].into_iter().collect::<VectorClock>();

    let mut remote = base_task("B");
    remote.actor = Actor::Server;
    remote.vector_clock = [(Actor::User, 2), (Actor::Server, 4)]
        .into_iter()
        .collect::<VectorClock>();
    remote.updated_at = remote.updated_at + Duration::seconds(30);

    (local, remote)
}

#[test]
fn scenario_server_authoritative_takes_remote_title() {
    let (local, remote) = concurrent_pair();
    let report = merge_tasks(&local, &remote, MergeStrategy::ServerAuthoritative);

    assert_eq!(report.merged.title, "B");
    assert!(!report.is_clean());
    let c = report
        .conflicts
        .iter()
        .find(|c| c.field == "title")
        .expect("title conflict recorded");
    assert_eq!(c.winner, Winner::Remote);
}

#[test]
fn scenario_last_write_wins_prefers_newer_stamp() {
    let (local, remote) = concurrent_pair();
    // Remote updated_at is 30s newer.
    let report = merge_tasks(&local, &remote, MergeStrategy::LastWriteWins);
    assert_eq!(report.merged.title, "B");

    // Flip the stamps: the local edit becomes the newer write.
    let (mut local, mut remote) = concurrent_pair();
    std::mem::swap(&mut local.updated_at, &mut remote.updated_at);
    let report = merge_tasks(&local, &remote, MergeStrategy::LastWriteWins);
    assert_eq!(report.merged.title, "A");
}

#[test]
fn scenario_timestamp_tie_falls_back_to_actor_rank() {
    let (local, mut remote) = concurrent_pair();
    remote.updated_at = local.updated_at;

    // server (100) outranks user (60).
    let report = merge_tasks(&local, &remote, MergeStrategy::LastWriteWins);
    assert_eq!(report.merged.title, "B");
    assert_eq!(report.metadata.local_rank, 60);
    assert_eq!(report.metadata.remote_rank, 100);
}

#[test]
fn scenario_merged_clock_is_componentwise_max() {
    let (local, remote) = concurrent_pair();
    let report = merge_tasks(&local, &remote, MergeStrategy::ServerAuthoritative);
    assert_eq!(report.merged.vector_clock.get(Actor::User), 3);
    assert_eq!(report.merged.vector_clock.get(Actor::Server), 4);
}

#[test]
fn scenario_label_sets_union_under_field_merge() {
    let (mut local, mut remote) = concurrent_pair();
    remote.title = local.title.clone();
    local.labels = vec!["red".into(), "deep-dive".into()];
    remote.labels = vec!["red".into(), "follow-up".into()];

    let report = merge_tasks(&local, &remote, MergeStrategy::FieldMerge);
    assert_eq!(
        report.merged.labels,
        vec!["red".to_string(), "deep-dive".into(), "follow-up".into()]
    );
    let c = report
        .conflicts
        .iter()
        .find(|c| c.field == "labels")
        .expect("labels conflict recorded");
    assert_eq!(c.winner, Winner::Union);
}

#[test]
fn scenario_server_authoritative_replaces_sets_including_removals() {
    let (mut local, mut remote) = concurrent_pair();
    remote.title = local.title.clone();
    local.assignee_ids = vec!["u1".into(), "u2".into()];
    remote.assignee_ids = vec!["u1".into()];

    let report = merge_tasks(&local, &remote, MergeStrategy::ServerAuthoritative);
    assert_eq!(report.merged.assignee_ids, vec!["u1".to_string()]);
}

#[test]
fn scenario_causally_newer_side_wins_without_strategy() {
    let (mut local, mut remote) = concurrent_pair();
    // Make remote a strict descendant of local.
    remote.vector_clock = [(Actor::User, 3), (Actor::Server, 4)]
        .into_iter()
        .collect::<VectorClock>();
    local.updated_at = remote.updated_at + Duration::seconds(300);

    // Even with LWW and a newer local stamp, the causal descendant wins.
    let report = merge_tasks(&local, &remote, MergeStrategy::LastWriteWins);
    assert_eq!(report.merged.title, "B");
}

#[test]
fn scenario_identical_inputs_merge_clean_and_deterministic() {
    let (local, remote) = concurrent_pair();
    let a = merge_tasks(&local, &remote, MergeStrategy::LastWriteWins);
    let b = merge_tasks(&local, &remote, MergeStrategy::LastWriteWins);
    assert_eq!(a.merged, b.merged);
    assert_eq!(a.conflicts, b.conflicts);

    let same = merge_tasks(&local, &local.clone(), MergeStrategy::ServerAuthoritative);
    assert!(same.is_clean());
    assert_eq!(same.merged.title, "A");
}
