use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// Stable task identifier, written as a trailing `^id` marker on the task line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Session identifier of the form `YYYYMMDD-HHMMSS-<agent>[-N]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the id for a session started at `started` by `agent`. `attempt`
    /// 0 is the plain form; later attempts append `-2`, `-3`, ...
    pub fn generate(started: DateTime<Utc>, agent: &str, attempt: u32) -> Self {
        let stamp = started.format("%Y%m%d-%H%M%S");
        match attempt {
            0 => Self(format!("{stamp}-{agent}")),
            n => Self(format!("{stamp}-{agent}-{}", n + 1)),
        }
    }

    /// Whether `s` has the timestamp shape of a session id. Used to tell a
    /// `#<session>` claim tag apart from an ordinary `#42` in a description.
    pub fn looks_valid(s: &str) -> bool {
        let b = s.as_bytes();
        if b.len() < 15 || b[8] != b'-' {
            return false;
        }
        let digits = |r: std::ops::Range<usize>| b[r].iter().all(u8::is_ascii_digit);
        if !digits(0..8) || !digits(9..15) {
            return false;
        }
        match &s[15..] {
            "" => true,
            rest => {
                rest.len() > 1
                    && rest.starts_with('-')
                    && rest[1..]
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Claimed,
    Completed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            _ => Err(Error::InvalidName(format!(
                "invalid task status '{s}': must be open, claimed, or completed"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
        }
    }

    /// Display icon: x=completed, *=claimed, .=open
    pub fn icon(self) -> &'static str {
        match self {
            Self::Open => ".",
            Self::Claimed => "*",
            Self::Completed => "x",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Ended,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "ended" => Ok(Self::Ended),
            _ => Err(Error::InvalidName(format!(
                "invalid session status '{s}': must be active, paused, or ended"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who holds (or held) a task: the session plus its agent name, which is
/// what the `@agent #session` tag pair on a task line records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub session: SessionId,
    pub agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub phase: Option<String>,
    pub section: Option<String>,
    pub status: TaskStatus,
    pub claimed_by: Option<Claim>,
    pub completed_by: Option<Claim>,
    /// Audit entries, oldest first.
    pub history: Vec<String>,
}

impl Task {
    pub fn is_claimed_by(&self, session: &SessionId) -> bool {
        self.status == TaskStatus::Claimed
            && self.claimed_by.as_ref().map(|c| &c.session) == Some(session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub agent: String,
    pub claimed_task: Option<TaskId>,
    /// Declared path patterns, normalized and de-duplicated.
    pub resources: Vec<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, agent: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            agent: agent.to_string(),
            claimed_task: None,
            resources: Vec::new(),
            status: SessionStatus::Active,
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// Active or Paused.
    pub fn is_live(&self) -> bool {
        self.status != SessionStatus::Ended
    }

    /// Strictly more than `stale_after` has passed since the last heartbeat.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) > stale_after
    }

    pub fn claim(&self) -> Claim {
        Claim {
            session: self.id.clone(),
            agent: self.agent.clone(),
        }
    }

    /// Active and Paused switch freely; Ended is terminal.
    pub fn set_status(&mut self, status: SessionStatus) -> Result<()> {
        if self.status == SessionStatus::Ended {
            return Err(Error::InvalidTransition {
                subject: format!("session '{}'", self.id),
                from: self.status.as_str(),
                to: status.as_str(),
            });
        }
        self.status = status;
        Ok(())
    }
}
