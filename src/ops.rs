//! Compound operations over both documents.
//!
//! A [`Board`] is the parsed task list plus the parsed session registry. Each
//! mutating method keeps the claim invariant: a task is Claimed by a session
//! exactly when that session's row points at it. The coordinator runs these
//! methods inside a backend transaction, so a failed call leaves both
//! documents untouched.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::{info, warn};

use crate::conflict::{find_conflicts, normalize_patterns, Conflict};
use crate::error::{Error, Result};
use crate::model::{Session, SessionId, SessionStatus, TaskId, TaskStatus};
use crate::reconcile::{self, ReconcileAction, ReconcileReport};
use crate::sessions::SessionRegistry;
use crate::store::Documents;
use crate::tasks::{TaskFilter, TaskList};

/// Result of registering a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub session: SessionId,
    pub claimed: Option<TaskId>,
    /// Advisory overlaps with other sessions' declared resources.
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Board {
    tasks: TaskList,
    sessions: SessionRegistry,
}

impl Board {
    pub fn from_documents(docs: &Documents) -> Result<Self> {
        Ok(Self {
            tasks: TaskList::parse(&docs.tasks)?,
            sessions: SessionRegistry::parse(&docs.sessions),
        })
    }

    pub(crate) fn write_documents(&self, docs: &mut Documents) {
        docs.tasks = self.tasks.render();
        docs.sessions = self.sessions.render();
    }

    pub fn tasks(&self) -> &TaskList {
        &self.tasks
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// The task `session` holds according to the task tags.
    fn held_task(&self, session: &SessionId) -> Option<TaskId> {
        self.tasks.claimed_by(session).map(|t| t.id.clone())
    }

    fn touch(&mut self, session: &SessionId, now: DateTime<Utc>) -> Result<()> {
        self.sessions.heartbeat(session, now)
    }

    /// Reopen `task` and record who let it go.
    fn reopen(&mut self, task: &TaskId, entry: String) -> Result<()> {
        self.tasks.set_status(task, TaskStatus::Open, None)?;
        self.tasks.note(task, &entry)
    }

    // ── Sessions ───────────────────────────────────────────────────────

    pub(crate) fn register<S: AsRef<str>>(
        &mut self,
        agent: &str,
        task: Option<&TaskId>,
        resources: &[S],
        now: DateTime<Utc>,
    ) -> Result<Registration> {
        let session = self.sessions.register(agent, now)?;
        if let Some(task) = task {
            self.claim(&session, task, now)?;
        }
        let conflicts = if resources.is_empty() {
            Vec::new()
        } else {
            self.declare_resources(&session, resources, now)?
        };
        info!("registered session {session}");
        Ok(Registration {
            session,
            claimed: task.cloned(),
            conflicts,
        })
    }

    pub(crate) fn heartbeat(&mut self, session: &SessionId, now: DateTime<Utc>) -> Result<()> {
        self.touch(session, now)
    }

    /// Pause, resume or end a session. Ending releases its claim and drops
    /// its resource declarations along with its row.
    pub(crate) fn update_status(
        &mut self,
        session: &SessionId,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if status != SessionStatus::Ended {
            self.sessions.update_status(session, status)?;
            return self.touch(session, now);
        }
        let s = self.sessions.get(session)?;
        let entry = format!("{} released by @{} #{} (ended)", stamp(now), s.agent, s.id);
        if let Some(task) = self.held_task(session) {
            self.reopen(&task, entry)?;
        }
        self.sessions.update_status(session, SessionStatus::Ended)?;
        info!("session {session} ended");
        Ok(())
    }

    // ── Claims ─────────────────────────────────────────────────────────

    pub(crate) fn claim(
        &mut self,
        session: &SessionId,
        task: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let s = self.sessions.get(session)?;
        if s.status != SessionStatus::Active {
            return Err(Error::SessionNotActive {
                session: session.clone(),
                status: s.status.as_str(),
            });
        }
        let claim = s.claim();
        if let Some(held) = self.held_task(session) {
            if held != *task {
                return Err(Error::SessionBusy {
                    session: session.clone(),
                    task: held,
                });
            }
        }
        self.tasks.set_status(task, TaskStatus::Claimed, Some(&claim))?;
        self.sessions.get_mut(session)?.claimed_task = Some(task.clone());
        self.touch(session, now)?;
        info!("session {session} claimed task {task}");
        Ok(())
    }

    /// Claim the first Open task in document order, optionally within one
    /// phase. `None` when nothing is claimable.
    pub(crate) fn claim_next(
        &mut self,
        session: &SessionId,
        phase: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskId>> {
        let mut filter = TaskFilter::status(TaskStatus::Open);
        if let Some(p) = phase {
            filter = filter.in_phase(p);
        }
        let next = self.tasks.tasks(&filter).next().map(|t| t.id.clone());
        match next {
            Some(task) => {
                self.claim(session, &task, now)?;
                Ok(Some(task))
            }
            None => {
                // Still reject unknown or paused sessions.
                let s = self.sessions.get(session)?;
                if s.status != SessionStatus::Active {
                    return Err(Error::SessionNotActive {
                        session: session.clone(),
                        status: s.status.as_str(),
                    });
                }
                self.touch(session, now)?;
                Ok(None)
            }
        }
    }

    /// Give the held task back. Releasing with nothing held changes nothing.
    pub(crate) fn release(
        &mut self,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskId>> {
        let s = self.sessions.get(session)?;
        let Some(task) = self.held_task(session) else {
            return Ok(None);
        };
        let entry = format!("{} released by @{} #{}", stamp(now), s.agent, s.id);
        self.reopen(&task, entry)?;
        let s = self.sessions.get_mut(session)?;
        s.claimed_task = None;
        s.resources.clear();
        self.touch(session, now)?;
        info!("session {session} released task {task}");
        Ok(Some(task))
    }

    pub(crate) fn complete(&mut self, session: &SessionId, now: DateTime<Utc>) -> Result<TaskId> {
        let claim = self.sessions.get(session)?.claim();
        let task = self
            .held_task(session)
            .ok_or_else(|| Error::NoActiveClaim(session.clone()))?;
        self.tasks
            .set_status(&task, TaskStatus::Completed, Some(&claim))?;
        let s = self.sessions.get_mut(session)?;
        s.claimed_task = None;
        s.resources.clear();
        self.touch(session, now)?;
        info!("session {session} completed task {task}");
        Ok(task)
    }

    /// Reopen a task whose holder is stale or gone. Returns the previous
    /// holder.
    pub(crate) fn force_release(
        &mut self,
        requester: &SessionId,
        task: &TaskId,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<SessionId> {
        let who = self.sessions.get(requester)?.claim();
        let t = self.tasks.get(task)?;
        let Some(holder) = t.claimed_by.clone().filter(|_| t.status == TaskStatus::Claimed) else {
            return Err(Error::InvalidTransition {
                subject: format!("task '{task}'"),
                from: t.status.as_str(),
                to: TaskStatus::Open.as_str(),
            });
        };
        if let Ok(owner) = self.sessions.get(&holder.session) {
            if owner.id != *requester && !owner.is_stale(now, stale_after) {
                return Err(Error::OwnerStillLive {
                    task: task.clone(),
                    owner: owner.id.clone(),
                });
            }
        }
        let entry = format!(
            "{} force-released by @{} #{} from @{} #{}",
            stamp(now),
            who.agent,
            who.session,
            holder.agent,
            holder.session
        );
        self.reopen(task, entry)?;
        if let Ok(owner) = self.sessions.get_mut(&holder.session) {
            owner.claimed_task = None;
            owner.resources.clear();
        }
        self.touch(requester, now)?;
        warn!(
            "task {task} force-released from {} by {requester}",
            holder.session
        );
        Ok(holder.session)
    }

    /// End stale sessions, reopen abandoned claims and repair session
    /// pointers. Individual failures are logged and skipped.
    pub(crate) fn reconcile(&mut self, now: DateTime<Utc>, stale_after: Duration) -> ReconcileReport {
        let mut report = ReconcileReport {
            skipped: self.sessions.malformed().count(),
            ..Default::default()
        };
        for action in reconcile::plan(&self.tasks, &self.sessions, now, stale_after) {
            match action {
                ReconcileAction::EndStale { session } => match self.sessions.remove(&session) {
                    Ok(_) => {
                        info!("ended stale session {session}");
                        report.ended.push(session);
                    }
                    Err(e) => warn!("could not end stale session {session}: {e}"),
                },
                ReconcileAction::Reopen {
                    task,
                    session,
                    reason,
                } => {
                    let agent = self
                        .tasks
                        .get(&task)
                        .ok()
                        .and_then(|t| t.claimed_by.as_ref())
                        .map(|c| c.agent.clone())
                        .unwrap_or_default();
                    let entry = format!(
                        "{} released by @{agent} #{session} ({})",
                        stamp(now),
                        reason.as_str()
                    );
                    match self.reopen(&task, entry) {
                        Ok(()) => {
                            info!("reopened task {task} held by {session} ({})", reason.as_str());
                            if let Ok(s) = self.sessions.get_mut(&session) {
                                if s.claimed_task.as_ref() == Some(&task) {
                                    s.claimed_task = None;
                                }
                            }
                            report.reopened.push(task);
                        }
                        Err(e) => warn!("could not reopen task {task}: {e}"),
                    }
                }
                ReconcileAction::Adopt { session, task } => {
                    if let Ok(s) = self.sessions.get_mut(&session) {
                        info!("session {session} adopts its claim on task {task}");
                        s.claimed_task = Some(task.clone());
                        report.adopted.push(task);
                    }
                }
                ReconcileAction::ClearPointer { session, task } => {
                    if let Ok(s) = self.sessions.get_mut(&session) {
                        info!("clearing dangling pointer {session} -> {task}");
                        s.claimed_task = None;
                        report.cleared.push(session);
                    }
                }
            }
        }
        report
    }

    pub(crate) fn append_task(&mut self, description: &str, phase: Option<&str>) -> Result<TaskId> {
        let id = self.tasks.append(description, phase)?;
        info!("appended task {id}");
        Ok(id)
    }

    // ── Resources ──────────────────────────────────────────────────────

    /// Add patterns to a session's declarations and report overlaps with
    /// other live sessions.
    pub(crate) fn declare_resources<S: AsRef<str>>(
        &mut self,
        session: &SessionId,
        patterns: &[S],
        now: DateTime<Utc>,
    ) -> Result<Vec<Conflict>> {
        let patterns = normalize_patterns(patterns)?;
        self.sessions.get(session)?;
        let conflicts = find_conflicts(self.sessions.active(), Some(session), &patterns);
        for c in &conflicts {
            warn!(
                "{session} declared {} which overlaps {} held by {}",
                c.requested, c.held, c.session
            );
        }
        let s = self.sessions.get_mut(session)?;
        for p in patterns {
            if !s.resources.contains(&p) {
                s.resources.push(p);
            }
        }
        self.touch(session, now)?;
        Ok(conflicts)
    }

    pub fn check_conflicts<S: AsRef<str>>(
        &self,
        requester: Option<&SessionId>,
        patterns: &[S],
    ) -> Result<Vec<Conflict>> {
        let patterns = normalize_patterns(patterns)?;
        Ok(find_conflicts(self.sessions.active(), requester, &patterns))
    }

    pub(crate) fn clear_resources(&mut self, session: &SessionId, now: DateTime<Utc>) -> Result<()> {
        self.sessions.get_mut(session)?.resources.clear();
        self.touch(session, now)
    }

    // ── Checks ─────────────────────────────────────────────────────────

    /// Descriptions of every place the claim invariant does not hold. Empty
    /// for a consistent board.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        for task in self.tasks.iter() {
            match (task.status, &task.claimed_by) {
                (TaskStatus::Claimed, None) => {
                    out.push(format!("task {} is claimed with no holder", task.id))
                }
                (TaskStatus::Claimed, Some(c)) => match self.sessions.get(&c.session) {
                    Ok(s) if s.claimed_task.as_ref() == Some(&task.id) => {}
                    Ok(s) => out.push(format!(
                        "task {} is claimed by {} which points at {:?}",
                        task.id, s.id, s.claimed_task
                    )),
                    Err(_) => out.push(format!(
                        "task {} is claimed by unknown session {}",
                        task.id, c.session
                    )),
                },
                (_, Some(c)) => out.push(format!(
                    "task {} is {} but tagged with {}",
                    task.id, task.status, c.session
                )),
                (_, None) => {}
            }
        }
        for s in self.sessions.active() {
            if let Some(pointer) = &s.claimed_task {
                let held = self.tasks.get(pointer).is_ok_and(|t| t.is_claimed_by(&s.id));
                if !held {
                    out.push(format!("session {} points at {pointer} without holding it", s.id));
                }
            }
            let count = self.tasks.iter().filter(|t| t.is_claimed_by(&s.id)).count();
            if count > 1 {
                out.push(format!("session {} holds {count} tasks", s.id));
            }
        }
        out
    }

    /// Live sessions in registry order.
    pub fn active_sessions(&self) -> impl Iterator<Item = &Session> + Clone + '_ {
        self.sessions.active()
    }
}

fn stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TASKS: &str = "\
# Tasks

## Phase 1: Foundation
- [ ] Add health endpoint ^7
- [ ] Write README ^8

## Phase 2: Polish
- [ ] Fix bug #42 ^9
";

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 29, h, m, s).unwrap()
    }

    fn board() -> Board {
        Board::from_documents(&Documents {
            tasks: TASKS.into(),
            sessions: String::new(),
        })
        .unwrap()
    }

    fn register(board: &mut Board, agent: &str, now: DateTime<Utc>) -> SessionId {
        board
            .register::<&str>(agent, None, &[], now)
            .unwrap()
            .session
    }

    #[test]
    fn claim_sets_both_sides() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 30, 22));
        b.claim(&a, &"7".into(), at(14, 31, 0)).unwrap();
        let t = b.tasks().get(&"7".into()).unwrap();
        assert!(t.is_claimed_by(&a));
        let s = b.sessions().get(&a).unwrap();
        assert_eq!(s.claimed_task, Some(TaskId::new("7")));
        assert_eq!(s.last_heartbeat, at(14, 31, 0));
        assert!(b.invariant_violations().is_empty());
    }

    #[test]
    fn claim_errors() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 30, 22));
        let c = register(&mut b, "y", at(14, 30, 22));
        b.claim(&a, &"7".into(), at(14, 31, 0)).unwrap();

        let err = b.claim(&c, &"7".into(), at(14, 31, 0)).unwrap_err();
        assert!(err.is_claim_conflict(), "{err}");

        let err = b.claim(&a, &"8".into(), at(14, 31, 0)).unwrap_err();
        assert!(matches!(err, Error::SessionBusy { .. }), "{err}");

        let err = b.claim(&c, &"nope".into(), at(14, 31, 0)).unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)), "{err}");

        let err = b
            .claim(&"20241229-000000-ghost".into(), &"8".into(), at(14, 31, 0))
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)), "{err}");

        b.update_status(&c, SessionStatus::Paused, at(14, 32, 0)).unwrap();
        let err = b.claim(&c, &"8".into(), at(14, 33, 0)).unwrap_err();
        assert!(matches!(err, Error::SessionNotActive { status: "paused", .. }), "{err}");
    }

    #[test]
    fn reclaim_is_idempotent() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 30, 22));
        b.claim(&a, &"7".into(), at(14, 31, 0)).unwrap();
        b.claim(&a, &"7".into(), at(14, 32, 0)).unwrap();
        assert!(b.invariant_violations().is_empty());
    }

    #[test]
    fn claim_next_respects_order_and_phase() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 30, 22));
        let c = register(&mut b, "y", at(14, 30, 22));
        assert_eq!(
            b.claim_next(&a, Some("Phase 2: Polish"), at(14, 31, 0)).unwrap(),
            Some(TaskId::new("9"))
        );
        assert_eq!(
            b.claim_next(&c, None, at(14, 31, 0)).unwrap(),
            Some(TaskId::new("7"))
        );
        let d = register(&mut b, "z", at(14, 30, 22));
        assert_eq!(b.claim_next(&d, Some("Phase 2: Polish"), at(14, 31, 0)).unwrap(), None);
    }

    #[test]
    fn release_is_idempotent_and_audited() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 30, 22));
        b.declare_resources(&a, &["src/api"], at(14, 30, 30)).unwrap();
        b.claim(&a, &"7".into(), at(14, 31, 0)).unwrap();

        assert_eq!(b.release(&a, at(14, 40, 0)).unwrap(), Some(TaskId::new("7")));
        let once = b.clone();
        assert_eq!(b.release(&a, at(14, 50, 0)).unwrap(), None);
        assert_eq!(b, once);

        let t = b.tasks().get(&"7".into()).unwrap();
        assert_eq!(t.status, TaskStatus::Open);
        assert_eq!(
            t.history,
            vec!["2024-12-29T14:40:00Z released by @x #20241229-143022-x"]
        );
        let s = b.sessions().get(&a).unwrap();
        assert!(s.claimed_task.is_none());
        assert!(s.resources.is_empty());
    }

    #[test]
    fn complete_requires_claim() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 30, 22));
        let err = b.complete(&a, at(14, 31, 0)).unwrap_err();
        assert!(matches!(err, Error::NoActiveClaim(_)), "{err}");

        b.claim(&a, &"7".into(), at(14, 31, 0)).unwrap();
        assert_eq!(b.complete(&a, at(14, 45, 0)).unwrap(), TaskId::new("7"));
        let t = b.tasks().get(&"7".into()).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.completed_by.as_ref().map(|c| &c.session), Some(&a));
        assert!(b.sessions().get(&a).unwrap().claimed_task.is_none());
        assert!(b.invariant_violations().is_empty());
    }

    #[test]
    fn ending_a_session_releases_its_claim() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 30, 22));
        b.claim(&a, &"7".into(), at(14, 31, 0)).unwrap();
        b.update_status(&a, SessionStatus::Ended, at(14, 40, 0)).unwrap();
        assert!(b.sessions().get(&a).is_err());
        let t = b.tasks().get(&"7".into()).unwrap();
        assert_eq!(t.status, TaskStatus::Open);
        assert!(t.history[0].ends_with("(ended)"));
        assert!(b.invariant_violations().is_empty());
    }

    #[test]
    fn force_release_rules() {
        let mut b = board();
        let owner = register(&mut b, "x", at(14, 30, 22));
        let other = register(&mut b, "y", at(14, 30, 22));
        b.claim(&owner, &"7".into(), at(14, 31, 0)).unwrap();
        let ten = Duration::minutes(10);

        let err = b
            .force_release(&other, &"7".into(), at(14, 35, 0), ten)
            .unwrap_err();
        assert!(matches!(err, Error::OwnerStillLive { .. }), "{err}");

        let err = b
            .force_release(&other, &"8".into(), at(14, 35, 0), ten)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }), "{err}");

        let prev = b
            .force_release(&other, &"7".into(), at(14, 41, 1), ten)
            .unwrap();
        assert_eq!(prev, owner);
        let t = b.tasks().get(&"7".into()).unwrap();
        assert_eq!(t.status, TaskStatus::Open);
        assert!(t.history[0].contains("force-released by @y"));
        assert!(b.sessions().get(&owner).unwrap().claimed_task.is_none());
        assert!(b.invariant_violations().is_empty());
    }

    #[test]
    fn reconcile_ends_stale_and_reopens() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 0, 0));
        let c = register(&mut b, "y", at(14, 0, 0));
        b.claim(&a, &"7".into(), at(14, 0, 0)).unwrap();
        b.heartbeat(&c, at(14, 20, 0)).unwrap();

        let report = b.reconcile(at(14, 15, 1), Duration::minutes(15));
        assert_eq!(report.ended, vec![a.clone()]);
        assert_eq!(report.reopened, vec![TaskId::new("7")]);
        assert!(b.sessions().get(&a).is_err());
        assert!(b.sessions().get(&c).is_ok());
        let t = b.tasks().get(&"7".into()).unwrap();
        assert!(t.history[0].ends_with("(stale)"));
        assert!(b.invariant_violations().is_empty());

        let again = b.reconcile(at(14, 15, 1), Duration::minutes(15));
        assert!(again.is_empty());
    }

    #[test]
    fn resources_report_conflicts() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 30, 22));
        let c = register(&mut b, "y", at(14, 30, 22));
        assert!(b
            .declare_resources(&a, &["src/api/", "./src/api"], at(14, 31, 0))
            .unwrap()
            .is_empty());
        assert_eq!(b.sessions().get(&a).unwrap().resources, vec!["src/api"]);

        let conflicts = b
            .declare_resources(&c, &["src/api/routes.rs"], at(14, 31, 0))
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].session, a);

        assert_eq!(b.check_conflicts(None, &["src/**"]).unwrap().len(), 2);
        assert_eq!(b.check_conflicts(Some(&a), &["src/**"]).unwrap().len(), 1);

        b.clear_resources(&a, at(14, 32, 0)).unwrap();
        assert!(b.check_conflicts(Some(&c), &["src/api"]).unwrap().is_empty());
    }

    #[test]
    fn register_with_task_and_resources() {
        let mut b = board();
        let reg = b
            .register("x", Some(&"8".into()), &["docs"], at(14, 30, 22))
            .unwrap();
        assert_eq!(reg.session.as_str(), "20241229-143022-x");
        assert_eq!(reg.claimed, Some(TaskId::new("8")));
        assert!(b.tasks().get(&"8".into()).unwrap().is_claimed_by(&reg.session));
    }

    #[test]
    fn documents_round_trip_through_board() {
        let mut b = board();
        let a = register(&mut b, "x", at(14, 30, 22));
        b.claim(&a, &"7".into(), at(14, 31, 0)).unwrap();
        let mut docs = Documents::default();
        b.write_documents(&mut docs);
        assert!(docs.tasks.contains("- [ ] Add health endpoint @x #20241229-143022-x ^7"));
        let reparsed = Board::from_documents(&docs).unwrap();
        assert_eq!(reparsed.tasks(), b.tasks());
        assert!(reparsed.invariant_violations().is_empty());
    }
}
