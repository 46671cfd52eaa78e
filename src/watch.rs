use std::ffi::OsString;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use log::debug;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Result, StoreContext};

/// Watch `dir` for changes to any of the files in `names` and return a
/// receiver that gets a unit message per change. The watcher must be kept
/// alive for events to be received.
pub fn watch_dir(dir: &Path, names: &[&str]) -> Result<(RecommendedWatcher, Receiver<()>)> {
    let (tx, rx) = mpsc::channel();
    let names: Vec<OsString> = names.iter().map(OsString::from).collect();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else { return };
        // Atomic replaces show up as a rename of the temp file onto the
        // document, so match on every path in the event.
        let relevant = event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|n| names.iter().any(|w| w == n)));
        if relevant {
            debug!("coordination document changed: {:?}", event.kind);
            // Ignore send errors (receiver dropped)
            let _ = tx.send(());
        }
    })
    .store_context(|| "failed to create file watcher".into())?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .store_context(|| format!("failed to watch {}", dir.display()))?;

    Ok((watcher, rx))
}

/// Waits for a change event with timeout.
/// Returns true if an event was received, false on timeout.
pub fn wait_for_change(rx: &Receiver<()>, timeout: Duration) -> bool {
    rx.recv_timeout(timeout).is_ok()
}

/// Drains any pending events from the receiver.
pub fn drain_events(rx: &Receiver<()>) {
    while rx.try_recv().is_ok() {}
}
