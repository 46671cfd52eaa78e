use serde::Serialize;

use crate::conflict::Conflict;
use crate::error::Result;
use crate::model::{Session, Task, TaskStatus};
use crate::ops::Board;
use crate::reconcile::ReconcileReport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub open: usize,
    pub claimed: usize,
    pub completed: usize,
}

/// The whole board as one serializable value.
#[derive(Debug, Serialize)]
pub struct BoardSummary<'a> {
    pub counts: StatusCounts,
    pub tasks: Vec<&'a Task>,
    pub sessions: Vec<&'a Session>,
    pub malformed_session_rows: usize,
}

impl<'a> BoardSummary<'a> {
    pub fn new(board: &'a Board) -> Self {
        let mut counts = StatusCounts::default();
        for task in board.tasks().iter() {
            match task.status {
                TaskStatus::Open => counts.open += 1,
                TaskStatus::Claimed => counts.claimed += 1,
                TaskStatus::Completed => counts.completed += 1,
            }
        }
        Self {
            counts,
            tasks: board.tasks().iter().collect(),
            sessions: board.sessions().active().collect(),
            malformed_session_rows: board.sessions().malformed().count(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub fn format_task_detail(task: &Task) -> String {
    let mut out = String::new();
    out.push_str(&format!("Id:          {}\n", task.id));
    out.push_str(&format!("Status:      {}\n", task.status));
    if let Some(ref p) = task.phase {
        out.push_str(&format!("Phase:       {}\n", p));
    }
    if let Some(ref s) = task.section {
        out.push_str(&format!("Section:     {}\n", s));
    }
    out.push_str(&format!("Description: {}\n", task.description));
    if let Some(ref c) = task.claimed_by {
        out.push_str(&format!("Claimed by:  @{} #{}\n", c.agent, c.session));
    }
    if let Some(ref c) = task.completed_by {
        out.push_str(&format!("Completed by: @{} #{}\n", c.agent, c.session));
    }

    if !task.history.is_empty() {
        out.push('\n');
        out.push_str("History:\n");
        for entry in &task.history {
            out.push_str(&format!("  {}\n", entry));
        }
    }

    out
}

pub fn format_task_list<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> String {
    let mut out = String::new();
    for task in tasks {
        let holder = task
            .claimed_by
            .as_ref()
            .map(|c| format!(" (@{})", c.agent))
            .unwrap_or_default();
        out.push_str(&format!(
            "{} {}  {}{}\n",
            task.status.icon(),
            task.id,
            task.description,
            holder
        ));
    }
    out
}

pub fn format_sessions<'a>(sessions: impl IntoIterator<Item = &'a Session>) -> String {
    let mut out = String::new();
    for s in sessions {
        let task = s
            .claimed_task
            .as_ref()
            .map(|t| format!(" on {t}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "{} @{} [{}]{} last seen {}\n",
            s.id,
            s.agent,
            s.status,
            task,
            s.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
        ));
        if !s.resources.is_empty() {
            out.push_str(&format!("    editing {}\n", s.resources.join(", ")));
        }
    }
    out
}

pub fn format_conflicts(conflicts: &[Conflict]) -> String {
    let mut out = String::new();
    for c in conflicts {
        out.push_str(&format!(
            "{} overlaps {} held by @{} #{}\n",
            c.requested, c.held, c.agent, c.session
        ));
    }
    out
}

pub fn format_report(report: &ReconcileReport) -> String {
    if report.is_empty() && report.skipped == 0 {
        return "nothing to reconcile\n".into();
    }
    let join = |items: Vec<String>| items.join(", ");
    let mut out = String::new();
    if !report.ended.is_empty() {
        out.push_str(&format!(
            "ended:    {}\n",
            join(report.ended.iter().map(|s| s.to_string()).collect())
        ));
    }
    if !report.reopened.is_empty() {
        out.push_str(&format!(
            "reopened: {}\n",
            join(report.reopened.iter().map(|t| t.to_string()).collect())
        ));
    }
    if !report.adopted.is_empty() {
        out.push_str(&format!(
            "adopted:  {}\n",
            join(report.adopted.iter().map(|t| t.to_string()).collect())
        ));
    }
    if !report.cleared.is_empty() {
        out.push_str(&format!(
            "cleared:  {}\n",
            join(report.cleared.iter().map(|s| s.to_string()).collect())
        ));
    }
    if report.skipped > 0 {
        out.push_str(&format!("skipped:  {} malformed session rows\n", report.skipped));
    }
    out
}
