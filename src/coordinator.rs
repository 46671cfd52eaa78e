//! The single entry point for agents.
//!
//! Every operation reads both documents, applies one [`Board`] method and
//! writes the result back inside one backend transaction. Two agents racing
//! for the same task are serialized by the backend's lock, so exactly one of
//! them wins and the other sees [`Error::TaskAlreadyClaimed`].
//!
//! [`Error::TaskAlreadyClaimed`]: crate::Error::TaskAlreadyClaimed

use chrono::{DateTime, Duration, Utc};
use log::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::conflict::Conflict;
use crate::error::Result;
use crate::model::{Session, SessionId, SessionStatus, Task, TaskId, TaskStatus};
use crate::ops::{Board, Registration};
use crate::reconcile::ReconcileReport;
use crate::store::Backend;
use crate::tasks::TaskFilter;

pub struct Coordinator<B: Backend, C: Clock = SystemClock> {
    backend: B,
    clock: C,
    stale_after: Duration,
}

impl<B: Backend> Coordinator<B, SystemClock> {
    pub fn new(backend: B, config: &Config) -> Self {
        Self::with_clock(backend, config, SystemClock)
    }
}

impl<B: Backend, C: Clock> Coordinator<B, C> {
    pub fn with_clock(backend: B, config: &Config, clock: C) -> Self {
        Self {
            backend,
            clock,
            stale_after: config.stale_after(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Parse, mutate and write back both documents in one transaction.
    fn update<T>(&self, f: impl FnOnce(&mut Board, DateTime<Utc>) -> Result<T>) -> Result<T> {
        let now = self.clock.now();
        self.backend.transact(|docs| {
            let mut board = Board::from_documents(docs)?;
            let out = f(&mut board, now)?;
            board.write_documents(docs);
            Ok(out)
        })
    }

    /// A consistent read-only view of both documents.
    pub fn snapshot(&self) -> Result<Board> {
        Board::from_documents(&self.backend.read()?)
    }

    // ── Sessions ───────────────────────────────────────────────────────

    /// Register a new Active session, optionally claiming `task` and
    /// declaring `resources` in the same transaction.
    pub fn register<S: AsRef<str>>(
        &self,
        agent: &str,
        task: Option<&TaskId>,
        resources: &[S],
    ) -> Result<Registration> {
        self.update(|board, now| board.register(agent, task, resources, now))
    }

    pub fn heartbeat(&self, session: &SessionId) -> Result<()> {
        self.update(|board, now| board.heartbeat(session, now))
    }

    /// Pause, resume or end a session. Ending releases its claim.
    pub fn update_status(&self, session: &SessionId, status: SessionStatus) -> Result<()> {
        self.update(|board, now| board.update_status(session, status, now))
    }

    pub fn list_active(&self) -> Result<Vec<Session>> {
        Ok(self.snapshot()?.active_sessions().cloned().collect())
    }

    // ── Claims ─────────────────────────────────────────────────────────

    pub fn claim(&self, session: &SessionId, task: &TaskId) -> Result<()> {
        self.update(|board, now| board.claim(session, task, now))
    }

    pub fn claim_next(&self, session: &SessionId, phase: Option<&str>) -> Result<Option<TaskId>> {
        self.update(|board, now| board.claim_next(session, phase, now))
    }

    pub fn release(&self, session: &SessionId) -> Result<Option<TaskId>> {
        self.update(|board, now| board.release(session, now))
    }

    pub fn complete(&self, session: &SessionId) -> Result<TaskId> {
        self.update(|board, now| board.complete(session, now))
    }

    /// Take a claim away from a stale or vanished session.
    pub fn force_release(&self, requester: &SessionId, task: &TaskId) -> Result<SessionId> {
        let stale_after = self.stale_after;
        self.update(|board, now| board.force_release(requester, task, now, stale_after))
    }

    /// Reconcile against the clock, then list Open tasks.
    pub fn list_claimable(&self) -> Result<Vec<Task>> {
        let (report, tasks) = self.update(|board, now| {
            let report = board.reconcile(now, self.stale_after);
            let open = TaskFilter::status(TaskStatus::Open);
            let tasks: Vec<Task> = board.tasks().tasks(&open).cloned().collect();
            Ok((report, tasks))
        })?;
        if !report.is_empty() {
            debug!("reconciled before listing: {report:?}");
        }
        Ok(tasks)
    }

    /// End sessions idle for more than `stale_after` at `now` and reopen
    /// their claims. Deterministic in the stored documents and the inputs.
    pub fn reconcile(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<ReconcileReport> {
        self.update(|board, _| Ok(board.reconcile(now, stale_after)))
    }

    // ── Tasks ──────────────────────────────────────────────────────────

    pub fn append_task(&self, description: &str, phase: Option<&str>) -> Result<TaskId> {
        self.update(|board, _| board.append_task(description, phase))
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.snapshot()?.tasks().get(id).cloned()
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.snapshot()?.tasks().tasks(filter).cloned().collect())
    }

    // ── Resources ──────────────────────────────────────────────────────

    pub fn declare_resources<S: AsRef<str>>(
        &self,
        session: &SessionId,
        patterns: &[S],
    ) -> Result<Vec<Conflict>> {
        self.update(|board, now| board.declare_resources(session, patterns, now))
    }

    /// Advisory: other live sessions whose declarations overlap `patterns`.
    pub fn check_conflicts<S: AsRef<str>>(
        &self,
        requester: Option<&SessionId>,
        patterns: &[S],
    ) -> Result<Vec<Conflict>> {
        self.snapshot()?.check_conflicts(requester, patterns)
    }

    pub fn clear_resources(&self, session: &SessionId) -> Result<()> {
        self.update(|board, now| board.clear_resources(session, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    const TASKS: &str = "\
## Phase 1
- [ ] Add health endpoint ^7
- [ ] Fix bug #42 ^9
";

    fn setup() -> (Coordinator<MemoryStore, ManualClock>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 12, 29, 14, 30, 22).unwrap());
        let store = MemoryStore::with_documents(TASKS, "");
        let coord = Coordinator::with_clock(store, &Config::default(), clock.clone());
        (coord, clock)
    }

    #[test]
    fn failed_call_writes_nothing() {
        let (coord, _) = setup();
        let before = coord.backend().read().unwrap();
        let err = coord.claim(&"20241229-143022-x".into(), &"7".into()).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)), "{err}");
        assert_eq!(coord.backend().read().unwrap(), before);
    }

    #[test]
    fn session_lifecycle_persists() {
        let (coord, clock) = setup();
        let reg = coord.register::<&str>("x", None, &[]).unwrap();
        assert_eq!(reg.session.as_str(), "20241229-143022-x");
        clock.advance(Duration::seconds(30));
        coord.heartbeat(&reg.session).unwrap();
        let active = coord.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].last_heartbeat, clock.now());

        coord.update_status(&reg.session, SessionStatus::Paused).unwrap();
        assert_eq!(coord.list_active().unwrap()[0].status, SessionStatus::Paused);
        coord.update_status(&reg.session, SessionStatus::Ended).unwrap();
        assert!(coord.list_active().unwrap().is_empty());
        let err = coord.heartbeat(&reg.session).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)), "{err}");
    }

    #[test]
    fn list_claimable_reconciles_first() {
        let (coord, clock) = setup();
        let reg = coord.register::<&str>("c", Some(&"9".into()), &[]).unwrap();
        let ids = |tasks: Vec<Task>| tasks.into_iter().map(|t| t.id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids(coord.list_claimable().unwrap()), vec!["7"]);

        clock.advance(coord.stale_after() + Duration::seconds(1));
        assert_eq!(ids(coord.list_claimable().unwrap()), vec!["7", "9"]);
        assert!(coord.list_active().unwrap().iter().all(|s| s.id != reg.session));
    }

    #[test]
    fn append_and_get_task() {
        let (coord, _) = setup();
        let id = coord.append_task("Write docs", Some("Phase 2")).unwrap();
        let task = coord.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.phase.as_deref(), Some("Phase 2"));
        let phase2 = TaskFilter::all().in_phase("Phase 2");
        assert_eq!(coord.list_tasks(&phase2).unwrap().len(), 1);
        assert!(matches!(coord.get_task(&"nope".into()), Err(Error::TaskNotFound(_))));
    }

    #[test]
    fn resources_through_coordinator() {
        let (coord, _) = setup();
        let a = coord.register("a", None, &["src/api"]).unwrap().session;
        let b = coord.register::<&str>("b", None, &[]).unwrap().session;
        let conflicts = coord.declare_resources(&b, &["src/api/mod.rs"]).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(coord.check_conflicts(None, &["src"]).unwrap().len(), 2);
        coord.clear_resources(&a).unwrap();
        assert!(coord.check_conflicts(Some(&b), &["src"]).unwrap().is_empty());
    }
}
