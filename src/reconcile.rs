//! Crash recovery planning.
//!
//! [`plan`] looks at both documents and the time and decides what has to
//! change: stale sessions end, claims nobody owns reopen, and the session
//! pointers are brought back in line with the task tags. It is a pure function
//! of its inputs, so the same documents and `now` always produce the same
//! actions. `Board::reconcile` applies them.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::{SessionId, TaskId, TaskStatus};
use crate::sessions::SessionRegistry;
use crate::tasks::TaskList;

// ── Actions (what to do, not how) ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReopenReason {
    /// The holder stopped heartbeating.
    Stale,
    /// The holder is not in the registry.
    Orphaned,
}

impl ReopenReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Orphaned => "orphaned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Remove a session whose heartbeat is too old.
    EndStale { session: SessionId },
    /// Return a claimed task to Open.
    Reopen {
        task: TaskId,
        session: SessionId,
        reason: ReopenReason,
    },
    /// A live session holds a task tag but its pointer is empty.
    Adopt { session: SessionId, task: TaskId },
    /// A live session points at a task it does not hold.
    ClearPointer { session: SessionId, task: TaskId },
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub ended: Vec<SessionId>,
    pub reopened: Vec<TaskId>,
    pub adopted: Vec<TaskId>,
    pub cleared: Vec<SessionId>,
    /// Session rows that could not be parsed and were left alone.
    pub skipped: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.ended.is_empty()
            && self.reopened.is_empty()
            && self.adopted.is_empty()
            && self.cleared.is_empty()
    }
}

// ── Pure decision function ─────────────────────────────────────────────

pub fn plan(
    tasks: &TaskList,
    sessions: &SessionRegistry,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Vec<ReconcileAction> {
    let mut actions = Vec::new();

    let stale: Vec<&SessionId> = sessions.stale(now, stale_after).map(|s| &s.id).collect();
    for session in &stale {
        actions.push(ReconcileAction::EndStale {
            session: (*session).clone(),
        });
    }

    for task in tasks.iter().filter(|t| t.status == TaskStatus::Claimed) {
        let Some(claim) = &task.claimed_by else {
            continue;
        };
        let reopen = |reason| ReconcileAction::Reopen {
            task: task.id.clone(),
            session: claim.session.clone(),
            reason,
        };
        match sessions.get(&claim.session) {
            // Its row exists but does not parse; leave the claim alone.
            Err(_) if sessions.has_malformed_row(&claim.session) => {}
            Err(_) => actions.push(reopen(ReopenReason::Orphaned)),
            Ok(s) if stale.contains(&&s.id) => actions.push(reopen(ReopenReason::Stale)),
            Ok(s) => match &s.claimed_task {
                None => actions.push(ReconcileAction::Adopt {
                    session: s.id.clone(),
                    task: task.id.clone(),
                }),
                Some(pointer) if *pointer == task.id => {}
                // The pointer names the claim the session is working on.
                Some(_) => actions.push(reopen(ReopenReason::Orphaned)),
            },
        }
    }

    for session in sessions.active() {
        if stale.contains(&&session.id) {
            continue;
        }
        let Some(pointer) = &session.claimed_task else {
            continue;
        };
        let holds = tasks
            .get(pointer)
            .is_ok_and(|t| t.is_claimed_by(&session.id));
        if !holds {
            actions.push(ReconcileAction::ClearPointer {
                session: session.id.clone(),
                task: pointer.clone(),
            });
        }
    }

    actions
}
