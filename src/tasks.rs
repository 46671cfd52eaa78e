//! The Markdown task list.
//!
//! A task is a checkbox bullet, optionally followed by the claim tag pair and
//! an id marker:
//!
//! ```text
//! ## Phase 1: Foundation
//! ### API
//! - [ ] Add health endpoint @x #20241229-143022-x ^7
//!   <!-- 2024-12-29T15:00:00Z released by @y #20241229-140000-y (stale) -->
//! - [x] Write README ~~@x~~ ~~#20241229-143022-x~~ ^8
//! ```
//!
//! `##` headings set the phase, `###` headings the section. Indented HTML
//! comments directly under a task are its audit history. Every other line is
//! kept verbatim.

use std::collections::HashSet;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{Claim, SessionId, Task, TaskId, TaskStatus};
use crate::validate::{validate_agent_name, validate_description, validate_phase, validate_task_id};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Heading {
        level: usize,
        text: String,
        raw: String,
    },
    Task(TaskLine),
    Text(String),
}

impl Line {
    fn is_blank(&self) -> bool {
        matches!(self, Line::Text(t) if t.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskLine {
    indent: String,
    bullet: char,
    task: Task,
}

/// Optional phase and status filter for [`TaskList::tasks`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub phase: Option<String>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            phase: None,
            status: Some(status),
        }
    }

    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        let phase_ok = match &self.phase {
            Some(p) => task.phase.as_deref() == Some(p.as_str()),
            None => true,
        };
        let status_ok = self.status.map_or(true, |s| task.status == s);
        phase_ok && status_ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskList {
    lines: Vec<Line>,
    trailing_newline: bool,
}

impl TaskList {
    /// Parse a task document. Fails only on duplicate task ids.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines: Vec<Line> = Vec::new();
        let mut seen = HashSet::new();
        let mut position = 0;

        for raw in text.lines() {
            if let Some((level, label)) = parse_heading(raw) {
                lines.push(Line::Heading {
                    level,
                    text: label,
                    raw: raw.to_string(),
                });
                continue;
            }
            if let Some(entry) = parse_history(raw) {
                if let Some(Line::Task(tl)) = lines.last_mut() {
                    tl.task.history.push(entry);
                    continue;
                }
            }
            if let Some(raw_task) = split_task_line(raw) {
                position += 1;
                let task = raw_task.to_task(position);
                if !seen.insert(task.id.clone()) {
                    return Err(Error::DuplicateId(task.id.to_string()));
                }
                lines.push(Line::Task(TaskLine {
                    indent: raw_task.indent.to_string(),
                    bullet: raw_task.bullet,
                    task,
                }));
                continue;
            }
            lines.push(Line::Text(raw.to_string()));
        }

        let mut list = Self {
            lines,
            trailing_newline: text.ends_with('\n'),
        };
        list.regroup();
        Ok(list)
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// All tasks in document order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> + Clone + '_ {
        self.lines.iter().filter_map(|l| match l {
            Line::Task(tl) => Some(&tl.task),
            _ => None,
        })
    }

    /// Tasks matching `filter`, in document order. The iterator is lazy and
    /// can be cloned to restart it.
    pub fn tasks<'a>(&'a self, filter: &'a TaskFilter) -> impl Iterator<Item = &'a Task> + Clone + 'a {
        self.iter().filter(move |t| filter.matches(t))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn get(&self, id: &TaskId) -> Result<&Task> {
        self.iter()
            .find(|t| t.id == *id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.lines
            .iter_mut()
            .find_map(|l| match l {
                Line::Task(tl) if tl.task.id == *id => Some(&mut tl.task),
                _ => None,
            })
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// The task currently claimed by `session`, if any.
    pub fn claimed_by(&self, session: &SessionId) -> Option<&Task> {
        self.iter().find(|t| t.is_claimed_by(session))
    }

    /// Move a task through `Open -> Claimed -> Completed`, or back from
    /// `Claimed` to `Open`. Re-claiming by the holder is a no-op. Completed
    /// tasks never change again.
    pub fn set_status(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        claim: Option<&Claim>,
    ) -> Result<()> {
        let task = self.get_mut(id)?;
        match (task.status, status) {
            (TaskStatus::Open, TaskStatus::Claimed) => {
                let Some(claim) = claim else {
                    return Err(invalid_transition(task, status));
                };
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(claim.clone());
            }
            (TaskStatus::Claimed, TaskStatus::Claimed) => {
                let holder = holder_of(task);
                if claim.map(|c| &c.session) != Some(&holder) {
                    return Err(Error::TaskAlreadyClaimed {
                        task: id.clone(),
                        holder,
                    });
                }
            }
            (TaskStatus::Claimed, TaskStatus::Open) => {
                task.status = TaskStatus::Open;
                task.claimed_by = None;
            }
            (TaskStatus::Claimed, TaskStatus::Completed) => {
                let holder = holder_of(task);
                if let Some(c) = claim {
                    if c.session != holder {
                        return Err(Error::TaskAlreadyClaimed {
                            task: id.clone(),
                            holder,
                        });
                    }
                }
                task.completed_by = claim.cloned().or_else(|| task.claimed_by.take());
                task.claimed_by = None;
                task.status = TaskStatus::Completed;
            }
            _ => return Err(invalid_transition(task, status)),
        }
        Ok(())
    }

    /// Append an Open task at the end of `phase` (created if missing), or at
    /// the end of the document. The id is derived from position and text.
    pub fn append(&mut self, description: &str, phase: Option<&str>) -> Result<TaskId> {
        let id = derived_id(self.len() + 1, description.trim());
        self.append_with_id(id, description, phase)
    }

    pub fn append_with_id(
        &mut self,
        id: TaskId,
        description: &str,
        phase: Option<&str>,
    ) -> Result<TaskId> {
        validate_task_id(id.as_str())?;
        validate_description(description)?;
        if ends_with_tag(description) {
            return Err(Error::InvalidName(format!(
                "task description '{}' must not end with an @agent #session tag",
                description.trim()
            )));
        }
        if let Some(p) = phase {
            validate_phase(p)?;
        }
        if self.iter().any(|t| t.id == id) {
            return Err(Error::DuplicateId(id.to_string()));
        }

        let line = Line::Task(TaskLine {
            indent: String::new(),
            bullet: '-',
            task: Task {
                id: id.clone(),
                description: description.trim().to_string(),
                phase: None,
                section: None,
                status: TaskStatus::Open,
                claimed_by: None,
                completed_by: None,
                history: Vec::new(),
            },
        });

        match phase.map(str::trim) {
            None => {
                let at = self.end_of_content(0, self.lines.len());
                self.lines.insert(at, line);
            }
            Some(label) => match self.phase_insert_point(label) {
                Some(at) => self.lines.insert(at, line),
                None => {
                    let mut at = self.end_of_content(0, self.lines.len());
                    if at > 0 {
                        self.lines.insert(at, Line::Text(String::new()));
                        at += 1;
                    }
                    self.lines.insert(
                        at,
                        Line::Heading {
                            level: 2,
                            text: label.to_string(),
                            raw: format!("## {label}"),
                        },
                    );
                    self.lines.insert(at + 1, line);
                }
            },
        }

        self.trailing_newline = true;
        self.regroup();
        Ok(id)
    }

    /// Append an audit entry under a task.
    pub fn note(&mut self, id: &TaskId, entry: &str) -> Result<()> {
        let entry = entry.replace(['\n', '\r'], " ").replace("-->", "->");
        self.get_mut(id)?.history.push(entry.trim().to_string());
        Ok(())
    }

    /// Index just past the last non-blank line in `lines[from..to]`, or `from`.
    fn end_of_content(&self, from: usize, to: usize) -> usize {
        self.lines[from..to]
            .iter()
            .rposition(|l| !l.is_blank())
            .map_or(from, |i| from + i + 1)
    }

    fn phase_insert_point(&self, phase: &str) -> Option<usize> {
        let heading = self.lines.iter().position(
            |l| matches!(l, Line::Heading { level: 2, text, .. } if text == phase),
        )?;
        let block_end = self.lines[heading + 1..]
            .iter()
            .position(|l| matches!(l, Line::Heading { level, .. } if *level <= 2))
            .map_or(self.lines.len(), |i| heading + 1 + i);
        Some(self.end_of_content(heading + 1, block_end))
    }

    /// Recompute phase and section labels from the headings above each task.
    fn regroup(&mut self) {
        let mut phase: Option<String> = None;
        let mut section: Option<String> = None;
        for line in &mut self.lines {
            match line {
                Line::Heading { level: 1, .. } => {
                    phase = None;
                    section = None;
                }
                Line::Heading { level: 2, text, .. } => {
                    phase = Some(text.clone());
                    section = None;
                }
                Line::Heading { level: 3, text, .. } => section = Some(text.clone()),
                Line::Task(tl) => {
                    tl.task.phase = phase.clone();
                    tl.task.section = section.clone();
                }
                _ => {}
            }
        }
    }
}

impl fmt::Display for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            match line {
                Line::Heading { raw, .. } => f.write_str(raw)?,
                Line::Text(t) => f.write_str(t)?,
                Line::Task(tl) => write_task_line(f, tl)?,
            }
        }
        if self.trailing_newline && !self.lines.is_empty() {
            f.write_str("\n")?;
        }
        Ok(())
    }
}

fn write_task_line(f: &mut fmt::Formatter<'_>, tl: &TaskLine) -> fmt::Result {
    let task = &tl.task;
    let mark = if task.status == TaskStatus::Completed { 'x' } else { ' ' };
    write!(f, "{}{} [{}]", tl.indent, tl.bullet, mark)?;
    if !task.description.is_empty() {
        write!(f, " {}", task.description)?;
    }
    match (&task.status, &task.claimed_by, &task.completed_by) {
        (TaskStatus::Claimed, Some(c), _) => write!(f, " @{} #{}", c.agent, c.session)?,
        (TaskStatus::Completed, _, Some(c)) => write!(f, " ~~@{}~~ ~~#{}~~", c.agent, c.session)?,
        _ => {}
    }
    write!(f, " ^{}", task.id)?;
    for entry in &task.history {
        write!(f, "\n{}  <!-- {} -->", tl.indent, entry)?;
    }
    Ok(())
}

fn invalid_transition(task: &Task, to: TaskStatus) -> Error {
    Error::InvalidTransition {
        subject: format!("task '{}'", task.id),
        from: task.status.as_str(),
        to: to.as_str(),
    }
}

fn holder_of(task: &Task) -> SessionId {
    task.claimed_by
        .as_ref()
        .map(|c| c.session.clone())
        .unwrap_or_else(|| SessionId::new("unknown"))
}

/// `t<position>-<first 4 bytes of sha256(description) in hex>`
fn derived_id(position: usize, description: &str) -> TaskId {
    let digest = Sha256::digest(description.as_bytes());
    let hash: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    TaskId::new(format!("t{position}-{hash}"))
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let level = line.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some((level, rest.trim().to_string()))
}

fn parse_history(line: &str) -> Option<String> {
    if !line.starts_with([' ', '\t']) {
        return None;
    }
    let inner = line.trim().strip_prefix("<!--")?.strip_suffix("-->")?;
    Some(inner.trim().to_string())
}

struct RawTask<'a> {
    indent: &'a str,
    bullet: char,
    done: bool,
    body: &'a str,
}

fn split_task_line(line: &str) -> Option<RawTask<'_>> {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];
    let mut chars = trimmed.chars();
    let bullet = chars.next()?;
    if !matches!(bullet, '-' | '*' | '+') {
        return None;
    }
    let rest = chars.as_str();
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let rest = rest.trim_start();
    let (done, body) = if let Some(b) = rest.strip_prefix("[ ]") {
        (false, b)
    } else if let Some(b) = rest.strip_prefix("[x]").or_else(|| rest.strip_prefix("[X]")) {
        (true, b)
    } else {
        return None;
    };
    if !body.is_empty() && !body.starts_with([' ', '\t']) {
        return None;
    }
    Some(RawTask {
        indent,
        bullet,
        done,
        body: body.trim(),
    })
}

impl RawTask<'_> {
    fn to_task(&self, position: usize) -> Task {
        let mut rest = self.body;

        let mut id = None;
        if let Some((head, token)) = last_token(rest) {
            if let Some(raw) = token.strip_prefix('^') {
                if validate_task_id(raw).is_ok() {
                    id = Some(TaskId::new(raw));
                    rest = head;
                }
            }
        }

        // Struck tags only mean something on a checked line.
        let mut tag = None;
        if let Some((head, session_token)) = last_token(rest) {
            if let Some((head, agent_token)) = last_token(head) {
                if let Some((claim, struck)) = parse_tag_pair(agent_token, session_token) {
                    if self.done || !struck {
                        tag = Some(claim);
                        rest = head;
                    }
                }
            }
        }

        let description = rest.trim().to_string();
        let id = id.unwrap_or_else(|| derived_id(position, &description));
        let (status, claimed_by, completed_by) = match (self.done, tag) {
            (true, tag) => (TaskStatus::Completed, None, tag),
            (false, Some(claim)) => (TaskStatus::Claimed, Some(claim), None),
            (false, None) => (TaskStatus::Open, None, None),
        };
        Task {
            id,
            description,
            phase: None,
            section: None,
            status,
            claimed_by,
            completed_by,
            history: Vec::new(),
        }
    }
}

/// Split off the last whitespace-separated token: `(head, token)`.
fn last_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_end();
    if s.is_empty() {
        return None;
    }
    match s.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
        Some((i, c)) => Some((&s[..i], &s[i + c.len_utf8()..])),
        None => Some(("", s)),
    }
}

/// True when the last two tokens would be read back as a claim tag.
fn ends_with_tag(text: &str) -> bool {
    last_token(text)
        .and_then(|(head, session)| last_token(head).map(|(_, agent)| (agent, session)))
        .is_some_and(|(agent, session)| parse_tag_pair(agent, session).is_some())
}

/// `@agent #session`, or the struck form `~~@agent~~ ~~#session~~`.
fn parse_tag_pair(agent: &str, session: &str) -> Option<(Claim, bool)> {
    fn unstrike(t: &str) -> Option<&str> {
        t.strip_prefix("~~").and_then(|t| t.strip_suffix("~~"))
    }
    let (agent, session, struck) = match (unstrike(agent), unstrike(session)) {
        (Some(a), Some(s)) => (a, s, true),
        (None, None) => (agent, session, false),
        _ => return None,
    };
    let agent = agent.strip_prefix('@')?;
    let session = session.strip_prefix('#')?;
    if validate_agent_name(agent).is_err() || !SessionId::looks_valid(session) {
        return None;
    }
    Some((
        Claim {
            session: SessionId::new(session),
            agent: agent.to_string(),
        },
        struck,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
# Tasks

Intro prose stays put.

## Phase 1: Foundation
### API
- [ ] Add health endpoint @x #20241229-143022-x ^7
- [x] Write README ~~@x~~ ~~#20241229-143022-x~~ ^8
- [ ] Fix bug #42 ^9
  <!-- 2024-12-29T15:00:00Z released by @y #20241229-140000-y -->

## Phase 2: Polish
- [X] Hand-checked item ^10
* [ ] Star bullet ^11
";

    fn claim(agent: &str, session: &str) -> Claim {
        Claim {
            session: SessionId::new(session),
            agent: agent.into(),
        }
    }

    #[test]
    fn parses_tasks_in_document_order() {
        let list = TaskList::parse(DOC).unwrap();
        let ids: Vec<_> = list.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["7", "8", "9", "10", "11"]);
    }

    #[test]
    fn parses_claim_tags() {
        let list = TaskList::parse(DOC).unwrap();
        let t7 = list.get(&"7".into()).unwrap();
        assert_eq!(t7.status, TaskStatus::Claimed);
        assert_eq!(t7.description, "Add health endpoint");
        assert_eq!(t7.claimed_by, Some(claim("x", "20241229-143022-x")));
        assert_eq!(t7.phase.as_deref(), Some("Phase 1: Foundation"));
        assert_eq!(t7.section.as_deref(), Some("API"));

        let t8 = list.get(&"8".into()).unwrap();
        assert_eq!(t8.status, TaskStatus::Completed);
        assert!(t8.claimed_by.is_none());
        assert_eq!(t8.completed_by, Some(claim("x", "20241229-143022-x")));
    }

    #[test]
    fn issue_reference_is_not_a_session_tag() {
        let list = TaskList::parse(DOC).unwrap();
        let t9 = list.get(&"9".into()).unwrap();
        assert_eq!(t9.status, TaskStatus::Open);
        assert_eq!(t9.description, "Fix bug #42");
        assert_eq!(t9.history.len(), 1);
        assert!(t9.history[0].contains("released by @y"));
    }

    #[test]
    fn hand_checked_task_has_no_completer() {
        let list = TaskList::parse(DOC).unwrap();
        let t10 = list.get(&"10".into()).unwrap();
        assert_eq!(t10.status, TaskStatus::Completed);
        assert!(t10.completed_by.is_none());
        assert_eq!(t10.phase.as_deref(), Some("Phase 2: Polish"));
        assert!(t10.section.is_none());
    }

    #[test]
    fn render_is_lossless_for_canonical_documents() {
        let doc = DOC.replace("[X]", "[x]");
        let list = TaskList::parse(&doc).unwrap();
        assert_eq!(list.render(), doc);
    }

    #[test]
    fn derived_ids_are_written_back() {
        let list = TaskList::parse("- [ ] First\n- [ ] Second\n").unwrap();
        let ids: Vec<_> = list.iter().map(|t| t.id.to_string()).collect();
        assert!(ids[0].starts_with("t1-"), "{ids:?}");
        assert!(ids[1].starts_with("t2-"), "{ids:?}");
        let rendered = list.render();
        assert!(rendered.contains(&format!("- [ ] First ^{}", ids[0])));

        let reparsed = TaskList::parse(&rendered).unwrap();
        let again: Vec<_> = reparsed.iter().map(|t| t.id.to_string()).collect();
        assert_eq!(ids, again);
    }

    #[test]
    fn duplicate_explicit_ids_fail() {
        let err = TaskList::parse("- [ ] a ^1\n- [ ] b ^1\n").unwrap_err();
        assert!(matches!(err, Error::DuplicateId(ref id) if id == "1"), "{err}");
    }

    #[test]
    fn struck_tags_on_open_line_stay_in_description() {
        let list = TaskList::parse("- [ ] Redo ~~@x~~ ~~#20241229-143022-x~~ ^1\n").unwrap();
        let t = list.get(&"1".into()).unwrap();
        assert_eq!(t.status, TaskStatus::Open);
        assert_eq!(t.description, "Redo ~~@x~~ ~~#20241229-143022-x~~");
    }

    #[test]
    fn non_task_bullets_are_text() {
        let list = TaskList::parse("- plain bullet\n-[ ] no space\n- [ ]x glued\n").unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn filter_by_phase_and_status() {
        let list = TaskList::parse(DOC).unwrap();
        let open = TaskFilter::status(TaskStatus::Open);
        let ids: Vec<_> = list.tasks(&open).map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["9", "11"]);

        let phase2 = TaskFilter::status(TaskStatus::Open).in_phase("Phase 2: Polish");
        let iter = list.tasks(&phase2);
        let restarted = iter.clone();
        assert_eq!(iter.count(), 1);
        assert_eq!(restarted.map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["11"]);
    }

    #[test]
    fn claim_then_complete() {
        let mut list = TaskList::parse(DOC).unwrap();
        let c = claim("z", "20241229-150000-z");
        list.set_status(&"9".into(), TaskStatus::Claimed, Some(&c)).unwrap();
        assert_eq!(list.claimed_by(&c.session).unwrap().id.as_str(), "9");
        list.set_status(&"9".into(), TaskStatus::Completed, Some(&c)).unwrap();
        let t = list.get(&"9".into()).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.completed_by, Some(c));
        assert!(t.claimed_by.is_none());
        assert!(list.render().contains("- [x] Fix bug #42 ~~@z~~ ~~#20241229-150000-z~~ ^9"));
    }

    #[test]
    fn claim_by_other_session_fails() {
        let mut list = TaskList::parse(DOC).unwrap();
        let other = claim("y", "20241229-150000-y");
        let err = list
            .set_status(&"7".into(), TaskStatus::Claimed, Some(&other))
            .unwrap_err();
        assert!(
            matches!(err, Error::TaskAlreadyClaimed { ref holder, .. } if holder.as_str() == "20241229-143022-x"),
            "{err}"
        );
    }

    #[test]
    fn reclaim_by_holder_is_noop() {
        let mut list = TaskList::parse(DOC).unwrap();
        let holder = claim("x", "20241229-143022-x");
        list.set_status(&"7".into(), TaskStatus::Claimed, Some(&holder)).unwrap();
        assert_eq!(list.get(&"7".into()).unwrap().claimed_by, Some(holder));
    }

    #[test]
    fn release_returns_to_open() {
        let mut list = TaskList::parse(DOC).unwrap();
        list.set_status(&"7".into(), TaskStatus::Open, None).unwrap();
        let t = list.get(&"7".into()).unwrap();
        assert_eq!(t.status, TaskStatus::Open);
        assert!(t.claimed_by.is_none());
        assert!(list.render().contains("- [ ] Add health endpoint ^7"));
    }

    #[test]
    fn completed_is_immutable() {
        let mut list = TaskList::parse(DOC).unwrap();
        let c = claim("x", "20241229-143022-x");
        for status in [TaskStatus::Open, TaskStatus::Claimed, TaskStatus::Completed] {
            let err = list.set_status(&"8".into(), status, Some(&c)).unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }), "{err}");
        }
    }

    #[test]
    fn open_cannot_complete_directly() {
        let mut list = TaskList::parse(DOC).unwrap();
        let err = list.set_status(&"9".into(), TaskStatus::Completed, None).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }), "{err}");
    }

    #[test]
    fn unknown_task_not_found() {
        let mut list = TaskList::parse(DOC).unwrap();
        assert!(matches!(list.get(&"nope".into()), Err(Error::TaskNotFound(_))));
        let err = list.set_status(&"nope".into(), TaskStatus::Open, None).unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[test]
    fn append_into_existing_phase() {
        let mut list = TaskList::parse(DOC).unwrap();
        let id = list.append("Add metrics endpoint", Some("Phase 1: Foundation")).unwrap();
        let t = list.get(&id).unwrap();
        assert_eq!(t.status, TaskStatus::Open);
        assert_eq!(t.phase.as_deref(), Some("Phase 1: Foundation"));
        assert_eq!(t.section.as_deref(), Some("API"));
        let rendered = list.render();
        let appended = format!("- [ ] Add metrics endpoint ^{id}");
        let pos_new = rendered.find(&appended).unwrap();
        let pos_phase2 = rendered.find("## Phase 2").unwrap();
        let pos_history = rendered.find("released by @y").unwrap();
        assert!(pos_history < pos_new && pos_new < pos_phase2, "{rendered}");
    }

    #[test]
    fn append_creates_missing_phase() {
        let mut list = TaskList::parse(DOC).unwrap();
        let id = list.append("Ship it", Some("Phase 3: Release")).unwrap();
        let rendered = list.render();
        assert!(
            rendered.ends_with(&format!("^11\n\n## Phase 3: Release\n- [ ] Ship it ^{id}\n")),
            "{rendered}"
        );
        assert_eq!(list.get(&id).unwrap().phase.as_deref(), Some("Phase 3: Release"));
    }

    #[test]
    fn append_to_empty_document() {
        let mut list = TaskList::parse("").unwrap();
        let id = list.append("First", None).unwrap();
        assert_eq!(list.render(), format!("- [ ] First ^{id}\n"));
    }

    #[test]
    fn append_duplicate_id_fails() {
        let mut list = TaskList::parse(DOC).unwrap();
        let err = list.append_with_id("7".into(), "Again", None).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)), "{err}");
    }

    #[test]
    fn append_rejects_bad_input() {
        let mut list = TaskList::parse("").unwrap();
        assert!(list.append("", None).is_err());
        assert!(list.append("two\nlines", None).is_err());
        assert!(list.append_with_id("bad id".into(), "ok", None).is_err());
    }

    #[test]
    fn append_rejects_trailing_claim_tags() {
        let mut list = TaskList::parse("").unwrap();
        for desc in [
            "Reply to @bob #20241229-143022-bob",
            "Reply to ~~@bob~~ ~~#20241229-143022-bob~~",
        ] {
            let err = list.append(desc, Some("Phase 1")).unwrap_err();
            assert!(matches!(err, Error::InvalidName(_)), "{desc}: {err}");
        }
        assert!(list.is_empty());
    }

    #[test]
    fn tag_text_inside_description_round_trips() {
        let mut list = TaskList::parse("").unwrap();
        let desc = "Ask @bob #20241229-143022-bob about it";
        let id = list.append(desc, Some("Phase 1")).unwrap();
        let reparsed = TaskList::parse(&list.render()).unwrap();
        let t = reparsed.get(&id).unwrap();
        assert_eq!(t.status, TaskStatus::Open);
        assert_eq!(t.description, desc);
        assert!(t.claimed_by.is_none());
    }

    #[test]
    fn notes_are_sanitized() {
        let mut list = TaskList::parse(DOC).unwrap();
        list.note(&"11".into(), "line one\nline two --> done").unwrap();
        let t = list.get(&"11".into()).unwrap();
        assert_eq!(t.history, vec!["line one line two -> done"]);
        let reparsed = TaskList::parse(&list.render()).unwrap();
        assert_eq!(reparsed.get(&"11".into()).unwrap().history, t.history);
    }
}
