use serde::Serialize;
use serde_json::Value;

use tdk_schemas::{ClockOrder, Task};

use crate::types::{FieldConflict, MergeMetadata, MergeReport, MergeStrategy, Winner};

/// Which side wins a differing scalar field under the active strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

struct Resolution {
    scalar_winner: Side,
    union_arrays: bool,
}

fn resolve(strategy: MergeStrategy, local: &Task, remote: &Task) -> Resolution {
    match strategy {
        MergeStrategy::ServerAuthoritative => Resolution {
            scalar_winner: Side::Remote,
            // Authoritative includes removals: the remote set replaces ours.
            union_arrays: false,
        },
        MergeStrategy::LastWriteWins | MergeStrategy::FieldMerge => Resolution {
            scalar_winner: last_write_winner(local, remote),
            union_arrays: true,
        },
        MergeStrategy::ActorRank => Resolution {
            scalar_winner: rank_winner(local, remote),
            union_arrays: true,
        },
    }
}

fn last_write_winner(local: &Task, remote: &Task) -> Side {
    if remote.updated_at > local.updated_at {
        Side::Remote
    } else if local.updated_at > remote.updated_at {
        Side::Local
    } else {
        rank_winner(local, remote)
    }
}

fn rank_winner(local: &Task, remote: &Task) -> Side {
    if local.actor.rank() > remote.actor.rank() {
        Side::Local
    } else {
        Side::Remote
    }
}

/// Merge `remote` into `local` under `strategy`.
///
/// System fields (`id`, `workspace_id`, `meeting_id`, `created_at`,
/// `sequence_num`, `checksum`) are taken from the remote record when it is
/// server-sequenced (non-zero `sequence_num`), otherwise kept local; they are
/// never treated as conflicts. The merged vector clock is the componentwise
/// maximum of both sides.
pub fn merge_tasks(local: &Task, remote: &Task, strategy: MergeStrategy) -> MergeReport {
    let clock_order = local.vector_clock.compare(&remote.vector_clock);

    // Causally-ordered inputs need no strategy: the descendant is simply
    // newer. Only equal/concurrent clocks consult the strategy table.
    let res = match clock_order {
        ClockOrder::Before => Resolution {
            scalar_winner: Side::Remote,
            union_arrays: false,
        },
        ClockOrder::After => Resolution {
            scalar_winner: Side::Local,
            union_arrays: false,
        },
        ClockOrder::Equal | ClockOrder::Concurrent => resolve(strategy, local, remote),
    };

    let mut conflicts: Vec<FieldConflict> = Vec::new();
    let mut merged = if system_source_is_remote(remote) {
        remote.clone()
    } else {
        local.clone()
    };

    // Scalar (single-winner) fields.
    merged.title = pick(
        "title",
        &local.title,
        &remote.title,
        res.scalar_winner,
        &mut conflicts,
    );
    merged.description = pick(
        "description",
        &local.description,
        &remote.description,
        res.scalar_winner,
        &mut conflicts,
    );
    merged.status = pick(
        "status",
        &local.status,
        &remote.status,
        res.scalar_winner,
        &mut conflicts,
    );
    merged.priority = pick(
        "priority",
        &local.priority,
        &remote.priority,
        res.scalar_winner,
        &mut conflicts,
    );
    merged.due_date = pick(
        "due_date",
        &local.due_date,
        &remote.due_date,
        res.scalar_winner,
        &mut conflicts,
    );
    merged.snoozed_until = pick(
        "snoozed_until",
        &local.snoozed_until,
        &remote.snoozed_until,
        res.scalar_winner,
        &mut conflicts,
    );
    merged.completed_at = pick(
        "completed_at",
        &local.completed_at,
        &remote.completed_at,
        res.scalar_winner,
        &mut conflicts,
    );
    merged.deleted_at = pick(
        "deleted_at",
        &local.deleted_at,
        &remote.deleted_at,
        res.scalar_winner,
        &mut conflicts,
    );
    merged.suggest_state = pick(
        "suggest_state",
        &local.suggest_state,
        &remote.suggest_state,
        res.scalar_winner,
        &mut conflicts,
    );
    merged.extraction_context = pick(
        "extraction_context",
        &local.extraction_context,
        &remote.extraction_context,
        res.scalar_winner,
        &mut conflicts,
    );

    // Set-valued fields: union-merge unless the strategy replaces.
    merged.assignee_ids = pick_set(
        "assignee_ids",
        &local.assignee_ids,
        &remote.assignee_ids,
        &res,
        &mut conflicts,
    );
    merged.labels = pick_set("labels", &local.labels, &remote.labels, &res, &mut conflicts);

    // Bookkeeping: clocks never regress, the newer wall-clock stamp sticks.
    merged.vector_clock = local.vector_clock.clone();
    merged.vector_clock.merge(&remote.vector_clock);
    merged.updated_at = local.updated_at.max(remote.updated_at);
    merged.sequence_num = local.sequence_num.max(remote.sequence_num);
    merged.actor = match res.scalar_winner {
        Side::Remote => remote.actor,
        Side::Local => local.actor,
    };
    // The stored checksum described one input, not the merge result.
    if !conflicts.is_empty() {
        merged.checksum = None;
    }

    MergeReport {
        merged,
        conflicts,
        metadata: MergeMetadata {
            strategy,
            clock_order: clock_order.into(),
            local_rank: local.actor.rank(),
            remote_rank: remote.actor.rank(),
        },
    }
}

/// Server-sequenced records own the system fields.
fn system_source_is_remote(remote: &Task) -> bool {
    remote.sequence_num > 0 || !remote.is_temp()
}

fn pick<T: Clone + PartialEq + Serialize>(
    field: &str,
    local: &T,
    remote: &T,
    winner: Side,
    conflicts: &mut Vec<FieldConflict>,
) -> T {
    if local == remote {
        return local.clone();
    }
    conflicts.push(FieldConflict {
        field: field.to_string(),
        local: to_value(local),
        remote: to_value(remote),
        winner: match winner {
            Side::Local => Winner::Local,
            Side::Remote => Winner::Remote,
        },
    });
    match winner {
        Side::Local => local.clone(),
        Side::Remote => remote.clone(),
    }
}

fn pick_set(
    field: &str,
    local: &[String],
    remote: &[String],
    res: &Resolution,
    conflicts: &mut Vec<FieldConflict>,
) -> Vec<String> {
    if local == remote {
        return local.to_vec();
    }

    let (merged, winner) = if res.union_arrays {
        (union_preserving_order(local, remote), Winner::Union)
    } else {
        match res.scalar_winner {
            Side::Local => (local.to_vec(), Winner::Local),
            Side::Remote => (remote.to_vec(), Winner::Remote),
        }
    };

    conflicts.push(FieldConflict {
        field: field.to_string(),
        local: to_value(&local.to_vec()),
        remote: to_value(&remote.to_vec()),
        winner,
    });

    merged
}

/// Union keeping local order first, remote additions appended, duplicates
/// dropped.
fn union_preserving_order(local: &[String], remote: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(local.len() + remote.len());
    for v in local.iter().chain(remote.iter()) {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}

fn to_value<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}
