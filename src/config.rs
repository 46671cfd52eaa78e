use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = "claimboard.toml";

const DEFAULT_STALE_AFTER_SECS: u64 = 600;
const MAX_STALE_AFTER_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_TASKS_FILE: &str = "TASKS.md";
const DEFAULT_SESSIONS_FILE: &str = "SESSIONS.md";
const DEFAULT_LOCK_FILE: &str = ".claimboard.lock";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesConfig {
    pub tasks: Option<String>,
    pub sessions: Option<String>,
    pub lock: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsConfig {
    pub stale_after_secs: Option<u64>,
}

impl Config {
    /// Load `claimboard.toml` from `dir`.
    /// Returns default config if the file doesn't exist.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_from(&dir.join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| Error::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => {
                return Err(Error::Config {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };
        config.validate(path)?;
        Ok(config)
    }

    pub fn tasks_file(&self) -> &str {
        self.files.tasks.as_deref().unwrap_or(DEFAULT_TASKS_FILE)
    }

    pub fn sessions_file(&self) -> &str {
        self.files.sessions.as_deref().unwrap_or(DEFAULT_SESSIONS_FILE)
    }

    pub fn lock_file(&self) -> &str {
        self.files.lock.as_deref().unwrap_or(DEFAULT_LOCK_FILE)
    }

    /// Heartbeat age after which a session counts as stale.
    pub fn stale_after(&self) -> chrono::Duration {
        let secs = self
            .sessions
            .stale_after_secs
            .unwrap_or(DEFAULT_STALE_AFTER_SECS)
            .clamp(1, MAX_STALE_AFTER_SECS);
        // In range after the clamp.
        chrono::Duration::seconds(secs as i64)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let fail = |message: String| Error::Config {
            path: path.to_path_buf(),
            message,
        };
        if let Some(secs) = self.sessions.stale_after_secs {
            if secs == 0 || secs > MAX_STALE_AFTER_SECS {
                return Err(fail(format!(
                    "sessions.stale_after_secs must be between 1 and {MAX_STALE_AFTER_SECS}, got {secs}"
                )));
            }
        }
        let names = [
            ("files.tasks", self.tasks_file()),
            ("files.sessions", self.sessions_file()),
            ("files.lock", self.lock_file()),
        ];
        for (key, name) in names {
            if name.trim().is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(fail(format!("{key} must be a plain file name, got '{name}'")));
            }
        }
        for (i, (key, name)) in names.iter().enumerate() {
            if let Some((other, _)) = names[i + 1..].iter().find(|(_, n)| n == name) {
                return Err(fail(format!("{key} and {other} both name '{name}'")));
            }
        }
        Ok(())
    }

    /// Paths of the two documents and the lock file inside `dir`.
    pub fn paths(&self, dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
        (
            dir.join(self.tasks_file()),
            dir.join(self.sessions_file()),
            dir.join(self.lock_file()),
        )
    }
}
