//! Task claiming and session coordination for agents that share a Markdown
//! task list and a Markdown session table.
//!
//! ```no_run
//! use claimboard::{Config, Coordinator, FileStore};
//!
//! # fn main() -> claimboard::Result<()> {
//! let config = Config::load(std::path::Path::new("."))?;
//! let board = Coordinator::new(FileStore::open(".", &config)?, &config);
//! let me = board.register::<&str>("x", None, &[])?.session;
//! if let Some(task) = board.claim_next(&me, None)? {
//!     // ... work on it, calling board.heartbeat(&me) now and then ...
//!     board.complete(&me)?;
//!     println!("finished {task}");
//! }
//! board.update_status(&me, claimboard::SessionStatus::Ended)?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod file_store;
pub mod model;
pub mod ops;
pub mod output;
pub mod reconcile;
pub mod sessions;
pub mod store;
pub mod tasks;
pub mod validate;
pub mod watch;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use conflict::Conflict;
pub use coordinator::Coordinator;
pub use db::SqliteStore;
pub use error::{Error, Result};
pub use file_store::FileStore;
pub use model::{Claim, Session, SessionId, SessionStatus, Task, TaskId, TaskStatus};
pub use ops::{Board, Registration};
pub use reconcile::{ReconcileAction, ReconcileReport, ReopenReason};
pub use sessions::SessionRegistry;
pub use store::{Backend, Documents, MemoryStore};
pub use tasks::{TaskFilter, TaskList};
