//! Advisory overlap detection between declared path patterns.
//!
//! Nothing here blocks: a conflict is information for the caller, who decides
//! whether to edit anyway.

use glob::{MatchOptions, Pattern};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{Session, SessionId};
use crate::validate::validate_pattern;

/// The repository root, which overlaps every other pattern.
const ROOT: &str = ".";

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Another session's declaration that overlaps a requested pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub session: SessionId,
    pub agent: String,
    pub requested: String,
    pub held: String,
}

/// Collapse `.`, `..`, duplicate and trailing separators. The root is `.`.
pub fn normalize_pattern(pattern: &str) -> String {
    let pattern = pattern.trim().replace('\\', "/");
    let mut components: Vec<&str> = Vec::new();
    for component in pattern.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }
    if components.is_empty() {
        ROOT.to_string()
    } else {
        components.join("/")
    }
}

/// Validate, normalize and de-duplicate a batch of patterns, keeping order.
pub fn normalize_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for raw in patterns {
        let raw = raw.as_ref();
        validate_pattern(raw)?;
        let normalized = normalize_pattern(raw);
        if is_glob(&normalized) {
            Pattern::new(&normalized)
                .map_err(|e| Error::InvalidName(format!("bad glob '{raw}': {e}")))?;
        }
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    Ok(out)
}

/// Whether two patterns can name the same file: equal paths, one path inside
/// the other's directory, or a glob matching the path or a directory above
/// it.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let a = normalize_pattern(a);
    let b = normalize_pattern(b);
    match (is_glob(&a), is_glob(&b)) {
        (false, false) => contains(&a, &b) || contains(&b, &a),
        (true, false) => glob_overlaps_path(&a, &b),
        (false, true) => glob_overlaps_path(&b, &a),
        (true, true) => globs_overlap(&a, &b),
    }
}

/// Compares the two globs segment by segment up to the shorter one or the
/// first `**`. A shorter glob can match a directory holding the other's files.
fn globs_overlap(a: &str, b: &str) -> bool {
    let sa: Vec<&str> = a.split('/').collect();
    let sb: Vec<&str> = b.split('/').collect();
    let deep = |s: &[&str]| s.iter().position(|c| *c == "**").unwrap_or(s.len());
    let n = sa.len().min(sb.len()).min(deep(&sa)).min(deep(&sb));
    sa[..n]
        .iter()
        .zip(&sb[..n])
        .all(|(x, y)| segments_overlap(x, y))
}

fn segments_overlap(x: &str, y: &str) -> bool {
    match (is_glob(x), is_glob(y)) {
        (false, false) => x == y,
        (true, false) => segment_matches(x, y),
        (false, true) => segment_matches(y, x),
        // Every match starts with both literal heads and ends with both
        // literal tails.
        (true, true) => {
            let (hx, hy) = (wild_head(x), wild_head(y));
            let (tx, ty) = (wild_tail(x), wild_tail(y));
            (hx.starts_with(hy) || hy.starts_with(hx)) && (tx.ends_with(ty) || ty.ends_with(tx))
        }
    }
}

fn segment_matches(glob: &str, literal: &str) -> bool {
    Pattern::new(glob).map_or(true, |p| p.matches_with(literal, MATCH))
}

fn wild_head(segment: &str) -> &str {
    &segment[..segment.find(['*', '?', '[']).unwrap_or(segment.len())]
}

fn wild_tail(segment: &str) -> &str {
    &segment[segment.rfind(['*', '?', ']']).map_or(0, |i| i + 1)..]
}

/// Declarations of other live sessions that overlap `patterns`. `requester`
/// is excluded from the scan.
pub fn find_conflicts<'a>(
    sessions: impl IntoIterator<Item = &'a Session>,
    requester: Option<&SessionId>,
    patterns: &[String],
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for session in sessions {
        if !session.is_live() || Some(&session.id) == requester {
            continue;
        }
        for requested in patterns {
            for held in &session.resources {
                if patterns_overlap(requested, held) {
                    conflicts.push(Conflict {
                        session: session.id.clone(),
                        agent: session.agent.clone(),
                        requested: requested.clone(),
                        held: held.clone(),
                    });
                }
            }
        }
    }
    conflicts
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// `dir` is `path` itself or one of its ancestors.
fn contains(dir: &str, path: &str) -> bool {
    if dir == ROOT {
        return true;
    }
    path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

/// Directory part of a glob before its first wildcard: `src/api` for
/// `src/api/*.rs`, the root for `*.md`.
fn literal_prefix(glob: &str) -> &str {
    let first = glob.find(['*', '?', '[']).unwrap_or(glob.len());
    match glob[..first].rfind('/') {
        Some(i) => &glob[..i],
        None => ROOT,
    }
}

fn glob_overlaps_path(glob: &str, path: &str) -> bool {
    if contains(path, literal_prefix(glob)) {
        return true;
    }
    if let Some(stem) = glob.strip_suffix("/**") {
        if !is_glob(stem) && contains(stem, path) {
            return true;
        }
    }
    let Ok(pattern) = Pattern::new(glob) else {
        return contains(literal_prefix(glob), path);
    };
    // A glob matching a directory covers the files inside it.
    let mut candidate = path;
    loop {
        if pattern.matches_with(candidate, MATCH) {
            return true;
        }
        match candidate.rfind('/') {
            Some(i) => candidate = &candidate[..i],
            None => return false,
        }
    }
}
