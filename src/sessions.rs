//! The Markdown session registry.
//!
//! ```text
//! # Active Sessions
//!
//! | Agent | Session | Task | Status | Resources | Started | Heartbeat |
//! |-------|---------|------|--------|-----------|---------|-----------|
//! | x | 20241229-143022-x | 7 | active | src/api, docs/api.md | 2024-12-29T14:30:22Z | 2024-12-29T14:35:00Z |
//! ```
//!
//! A row exists only while its session is Active or Paused. Columns are
//! located by header name, so reordered tables still parse. Rows that cannot
//! be understood are kept verbatim and skipped.

use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use log::warn;

use crate::error::{Error, Result};
use crate::model::{Session, SessionId, SessionStatus, TaskId};
use crate::validate::validate_agent_name;

const COLUMNS: [&str; 7] = [
    "Agent",
    "Session",
    "Task",
    "Status",
    "Resources",
    "Started",
    "Heartbeat",
];

const DEFAULT_TITLE: &str = "# Active Sessions";

/// Written for an empty Task or Resources cell.
const EMPTY_CELL: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Row {
    Session(Session),
    /// Kept verbatim. `session` is the id cell when it still reads as one.
    Malformed {
        raw: String,
        session: Option<SessionId>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Columns {
    agent: usize,
    session: usize,
    task: Option<usize>,
    status: usize,
    resources: Option<usize>,
    started: Option<usize>,
    heartbeat: Option<usize>,
    count: usize,
}

impl Columns {
    fn from_header(cells: &[String]) -> Option<Self> {
        let find = |name: &str| cells.iter().position(|c| c.eq_ignore_ascii_case(name));
        let columns = Self {
            agent: find("agent")?,
            session: find("session")?,
            task: find("task"),
            status: find("status")?,
            resources: find("resources"),
            started: find("started"),
            heartbeat: find("heartbeat"),
            count: cells.len(),
        };
        if columns.started.is_none() && columns.heartbeat.is_none() {
            return None;
        }
        Some(columns)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRegistry {
    preamble: Vec<String>,
    rows: Vec<Row>,
    epilogue: Vec<String>,
}

impl SessionRegistry {
    /// Parse a session document. Never fails: rows that do not parse are
    /// logged and preserved.
    pub fn parse(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().collect();

        let header = lines.iter().enumerate().find_map(|(i, line)| {
            if !is_table_line(line) {
                return None;
            }
            let columns = Columns::from_header(&split_cells(line))?;
            if !lines.get(i + 1).is_some_and(|l| is_separator(l)) {
                return None;
            }
            Some((i, columns))
        });

        let Some((at, columns)) = header else {
            let mut preamble: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
            if preamble.last().is_some_and(|l| !l.trim().is_empty()) {
                preamble.push(String::new());
            }
            return Self {
                preamble,
                rows: Vec::new(),
                epilogue: Vec::new(),
            };
        };

        let mut registry = Self {
            preamble: lines[..at].iter().map(|l| l.to_string()).collect(),
            rows: Vec::new(),
            epilogue: Vec::new(),
        };

        let body_start = at + 2;
        let body_len = lines[body_start..]
            .iter()
            .take_while(|l| is_table_line(l))
            .count();
        for raw in &lines[body_start..body_start + body_len] {
            let row = match parse_row(&columns, raw) {
                Ok(session) if session.status == SessionStatus::Ended => {
                    warn!("dropping session row for ended session '{}'", session.id);
                    continue;
                }
                Ok(session) if registry.get(&session.id).is_ok() => {
                    warn!("duplicate session row '{}' kept verbatim", session.id);
                    Row::Malformed {
                        raw: raw.to_string(),
                        session: None,
                    }
                }
                Ok(session) => Row::Session(session),
                Err(reason) => {
                    warn!("malformed session row kept verbatim ({reason}): {raw}");
                    Row::Malformed {
                        raw: raw.to_string(),
                        session: session_cell(&columns, raw),
                    }
                }
            };
            registry.rows.push(row);
        }
        registry.epilogue = lines[body_start + body_len..]
            .iter()
            .map(|l| l.to_string())
            .collect();
        registry
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// All sessions in the registry, which are exactly the Active and Paused
    /// ones.
    pub fn active(&self) -> impl Iterator<Item = &Session> + Clone + '_ {
        self.rows.iter().filter_map(|r| match r {
            Row::Session(s) if s.is_live() => Some(s),
            _ => None,
        })
    }

    /// Sessions whose last heartbeat is more than `stale_after` before `now`.
    pub fn stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> impl Iterator<Item = &Session> + Clone + '_ {
        self.active().filter(move |s| s.is_stale(now, stale_after))
    }

    /// Raw text of rows that could not be parsed.
    pub fn malformed(&self) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().filter_map(|r| match r {
            Row::Malformed { raw, .. } => Some(raw.as_str()),
            _ => None,
        })
    }

    /// True when a malformed row names `id`. Claims held by such a session
    /// are left alone until the row is repaired.
    pub fn has_malformed_row(&self, id: &SessionId) -> bool {
        self.rows
            .iter()
            .any(|r| matches!(r, Row::Malformed { session: Some(s), .. } if s == id))
    }

    pub fn get(&self, id: &SessionId) -> Result<&Session> {
        self.active()
            .find(|s| s.id == *id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Result<&mut Session> {
        self.rows
            .iter_mut()
            .find_map(|r| match r {
                Row::Session(s) if s.id == *id => Some(s),
                _ => None,
            })
            .ok_or_else(|| Error::SessionNotFound(id.clone()))
    }

    /// The live session whose claim pointer names `task`.
    pub fn holder_of(&self, task: &TaskId) -> Option<&Session> {
        self.active().find(|s| s.claimed_task.as_ref() == Some(task))
    }

    /// Create an Active session for `agent`. Ids that collide with a live
    /// session get a `-2`, `-3`, ... suffix.
    pub fn register(&mut self, agent: &str, now: DateTime<Utc>) -> Result<SessionId> {
        validate_agent_name(agent)?;
        let now = now.trunc_subsecs(0);
        let mut attempt = 0;
        let id = loop {
            let candidate = SessionId::generate(now, agent, attempt);
            if self.get(&candidate).is_err() && !self.has_malformed_row(&candidate) {
                break candidate;
            }
            attempt += 1;
        };
        self.insert(Session::new(id.clone(), agent, now))?;
        Ok(id)
    }

    /// Insert a session under its own id.
    pub fn insert(&mut self, mut session: Session) -> Result<()> {
        validate_agent_name(&session.agent)?;
        if self.get(&session.id).is_ok() {
            return Err(Error::DuplicateSessionId(session.id));
        }
        session.started_at = session.started_at.trunc_subsecs(0);
        session.last_heartbeat = session.last_heartbeat.trunc_subsecs(0);
        self.rows.push(Row::Session(session));
        Ok(())
    }

    pub fn heartbeat(&mut self, id: &SessionId, now: DateTime<Utc>) -> Result<()> {
        self.get_mut(id)?.last_heartbeat = now.trunc_subsecs(0);
        Ok(())
    }

    /// Switch between Active and Paused, or end the session. An ended
    /// session leaves the registry and is returned.
    pub fn update_status(
        &mut self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<Option<Session>> {
        self.get_mut(id)?.set_status(status)?;
        if status == SessionStatus::Ended {
            return self.remove(id).map(Some);
        }
        Ok(None)
    }

    pub fn remove(&mut self, id: &SessionId) -> Result<Session> {
        let at = self
            .rows
            .iter()
            .position(|r| matches!(r, Row::Session(s) if s.id == *id))
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        match self.rows.remove(at) {
            Row::Session(s) => Ok(s),
            Row::Malformed { .. } => Err(Error::SessionNotFound(id.clone())),
        }
    }
}

impl fmt::Display for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.preamble.is_empty() {
            writeln!(f, "{DEFAULT_TITLE}")?;
            writeln!(f)?;
        }
        for line in &self.preamble {
            writeln!(f, "{line}")?;
        }
        writeln!(f, "| {} |", COLUMNS.join(" | "))?;
        let rule: Vec<String> = COLUMNS.iter().map(|c| "-".repeat(c.len() + 2)).collect();
        writeln!(f, "|{}|", rule.join("|"))?;
        for row in &self.rows {
            match row {
                Row::Session(s) if s.is_live() => writeln!(f, "{}", format_row(s))?,
                Row::Session(_) => {}
                Row::Malformed { raw, .. } => writeln!(f, "{raw}")?,
            }
        }
        for line in &self.epilogue {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

fn format_row(s: &Session) -> String {
    let task = s.claimed_task.as_ref().map_or(EMPTY_CELL, TaskId::as_str);
    let resources = if s.resources.is_empty() {
        EMPTY_CELL.to_string()
    } else {
        s.resources.join(", ")
    };
    format!(
        "| {} | {} | {} | {} | {} | {} | {} |",
        s.agent,
        s.id,
        task,
        s.status,
        resources,
        format_time(s.started_at),
        format_time(s.last_heartbeat),
    )
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{s}': {e}"))
}

fn is_table_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn is_separator(line: &str) -> bool {
    let cells = split_cells(line);
    !cells.is_empty()
        && cells
            .iter()
            .all(|c| !c.is_empty() && c.chars().all(|ch| matches!(ch, '-' | ':')))
}

fn split_cells(line: &str) -> Vec<String> {
    let inner = line.trim();
    let inner = inner.strip_prefix('|').unwrap_or(inner);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|c| c.trim().to_string()).collect()
}

fn session_cell(columns: &Columns, raw: &str) -> Option<SessionId> {
    split_cells(raw)
        .get(columns.session)
        .filter(|c| SessionId::looks_valid(c))
        .map(|c| SessionId::new(c.as_str()))
}

fn parse_row(columns: &Columns, raw: &str) -> std::result::Result<Session, String> {
    let cells = split_cells(raw);
    if cells.len() != columns.count {
        return Err(format!(
            "expected {} cells, found {}",
            columns.count,
            cells.len()
        ));
    }
    let cell = |i: Option<usize>| {
        i.map(|i| cells[i].as_str())
            .filter(|c| !c.is_empty() && *c != EMPTY_CELL)
    };

    let agent = cells[columns.agent].as_str();
    validate_agent_name(agent).map_err(|e| e.to_string())?;
    let id = cells[columns.session].as_str();
    if !SessionId::looks_valid(id) {
        return Err(format!("bad session id '{id}'"));
    }
    let status = SessionStatus::parse(&cells[columns.status]).map_err(|e| e.to_string())?;

    let started = cell(columns.started).map(parse_time).transpose()?;
    let heartbeat = cell(columns.heartbeat).map(parse_time).transpose()?;
    let (started_at, last_heartbeat) = match (started, heartbeat) {
        (Some(s), Some(h)) => (s, h),
        (Some(s), None) => (s, s),
        (None, Some(h)) => (h, h),
        (None, None) => return Err("no timestamps".into()),
    };

    let mut resources: Vec<String> = Vec::new();
    for pattern in cell(columns.resources)
        .into_iter()
        .flat_map(|c| c.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        if !resources.iter().any(|r| r == pattern) {
            resources.push(pattern.to_string());
        }
    }

    Ok(Session {
        id: SessionId::new(id),
        agent: agent.to_string(),
        claimed_task: cell(columns.task).map(TaskId::new),
        resources,
        status,
        started_at,
        last_heartbeat,
    })
}
