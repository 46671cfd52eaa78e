//! Directory backend: the two documents as plain files next to a lock file.
//!
//! Readers take a shared `fs2` lock and writers an exclusive one, so a
//! transaction's read-modify-write of both files is serialized across
//! processes. Each document is replaced atomically through a temp file in the
//! same directory, so a crash never leaves a torn document behind.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use log::{debug, warn};
use notify::RecommendedWatcher;
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::error::{Result, StoreContext};
use crate::store::{Backend, Documents};
use crate::watch;

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    tasks: PathBuf,
    sessions: PathBuf,
    lock: PathBuf,
}

/// Releases the advisory lock when dropped.
struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.0);
    }
}

impl FileStore {
    /// Open the documents in `dir` using the file names from `config`. The
    /// directory is created if missing; missing documents read as empty.
    pub fn open(dir: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .store_context(|| format!("failed to create {}", dir.display()))?;
        let (tasks, sessions, lock) = config.paths(&dir);
        Ok(Self {
            dir,
            tasks,
            sessions,
            lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tasks_path(&self) -> &Path {
        &self.tasks
    }

    pub fn sessions_path(&self) -> &Path {
        &self.sessions
    }

    /// Watch both documents for changes made by any writer.
    pub fn watch(&self) -> Result<(RecommendedWatcher, Receiver<()>)> {
        let names: Vec<&str> = [&self.tasks, &self.sessions]
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        watch::watch_dir(&self.dir, &names)
    }

    fn open_lock(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock)
            .store_context(|| format!("failed to open lock file {}", self.lock.display()))
    }

    fn lock_shared(&self) -> Result<LockGuard> {
        let file = self.open_lock()?;
        fs2::FileExt::lock_shared(&file)
            .store_context(|| format!("failed to lock {}", self.lock.display()))?;
        Ok(LockGuard(file))
    }

    fn lock_exclusive(&self) -> Result<LockGuard> {
        let file = self.open_lock()?;
        fs2::FileExt::lock_exclusive(&file)
            .store_context(|| format!("failed to lock {}", self.lock.display()))?;
        Ok(LockGuard(file))
    }

    fn read_unlocked(&self) -> Result<Documents> {
        Ok(Documents {
            tasks: read_or_empty(&self.tasks)?,
            sessions: read_or_empty(&self.sessions)?,
        })
    }

    fn replace(&self, path: &Path, content: &str) -> Result<()> {
        let context = || format!("failed to write {}", path.display());
        let mut tmp = NamedTempFile::new_in(&self.dir).store_context(context)?;
        tmp.write_all(content.as_bytes()).store_context(context)?;
        tmp.as_file().sync_all().store_context(context)?;
        tmp.persist(path).store_context(context)?;
        debug!("wrote {}", path.display());
        Ok(())
    }
}

impl Backend for FileStore {
    fn read(&self) -> Result<Documents> {
        let _lock = self.lock_shared()?;
        self.read_unlocked()
    }

    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Documents) -> Result<T>,
    {
        let _lock = self.lock_exclusive()?;
        let before = self.read_unlocked()?;
        let mut working = before.clone();
        let out = f(&mut working)?;
        self.commit(&before, &working, |path, content| self.replace(path, content))?;
        Ok(out)
    }
}

impl FileStore {
    /// Write the changed documents, tasks first. If the session document
    /// cannot be written the task document is put back, so readers never see
    /// one without the other. A crash between the two renames is repaired by
    /// the next reconcile.
    fn commit(
        &self,
        before: &Documents,
        after: &Documents,
        write: impl Fn(&Path, &str) -> Result<()>,
    ) -> Result<()> {
        let tasks_changed = after.tasks != before.tasks;
        if tasks_changed {
            write(&self.tasks, &after.tasks)?;
        }
        if after.sessions != before.sessions {
            if let Err(e) = write(&self.sessions, &after.sessions) {
                if tasks_changed {
                    if let Err(undo) = write(&self.tasks, &before.tasks) {
                        warn!(
                            "could not restore {} after a failed write: {undo}",
                            self.tasks.display()
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

fn read_or_empty(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).store_context(|| format!("failed to read {}", path.display())),
    }
}
