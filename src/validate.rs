use crate::error::{Error, Result};

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Validate an agent name: must be non-empty and match [a-zA-Z0-9_-]+
pub fn validate_agent_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("agent name must not be empty".into()));
    }
    if !name.chars().all(is_name_char) {
        return Err(Error::InvalidName(format!(
            "agent name '{name}' contains invalid characters: only a-z, A-Z, 0-9, _, - allowed"
        )));
    }
    Ok(())
}

/// Validate an explicit task id (the part after `^`): same alphabet as agent names.
pub fn validate_task_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(is_name_char) {
        return Err(Error::InvalidName(format!(
            "task id '{id}' must be non-empty and use only a-z, A-Z, 0-9, _, -"
        )));
    }
    Ok(())
}

/// A description lives on a single task line.
pub fn validate_description(description: &str) -> Result<()> {
    if description.trim().is_empty() {
        return Err(Error::InvalidName("task description must not be empty".into()));
    }
    if description.contains(['\n', '\r']) {
        return Err(Error::InvalidName(
            "task description must be a single line".into(),
        ));
    }
    Ok(())
}

/// Phase labels become `##` headings.
pub fn validate_phase(phase: &str) -> Result<()> {
    if phase.trim().is_empty() || phase.contains(['\n', '\r']) {
        return Err(Error::InvalidName(format!(
            "phase '{phase}' must be a non-empty single line"
        )));
    }
    Ok(())
}

/// Resource patterns are stored comma-separated inside a table cell.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(Error::InvalidName("resource pattern must not be empty".into()));
    }
    if pattern.contains([',', '|', '\n', '\r']) || pattern.trim() == "-" {
        return Err(Error::InvalidName(format!(
            "resource pattern '{pattern}' must not contain ',', '|' or newlines"
        )));
    }
    Ok(())
}
