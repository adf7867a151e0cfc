// imbued - Cleaner Module
//
// This module handles cleanup on termination:
// - Signal handling (SIGINT, SIGTERM, SIGHUP)
// - Removal of daemon socket files
// - Flushing the audit log

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::tracking::Tracker;

/// Global set of socket files to remove on shutdown
static SOCKETS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

/// Trackers to close on shutdown
static TRACKERS: OnceLock<Mutex<Vec<Arc<dyn Tracker>>>> = OnceLock::new();

fn sockets() -> MutexGuard<'static, HashSet<PathBuf>> {
    SOCKETS
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn trackers() -> MutexGuard<'static, Vec<Arc<dyn Tracker>>> {
    TRACKERS
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Register a socket file to be removed on cleanup
///
/// # Example
/// ```no_run
/// use imbued::cleaner::register_socket;
///
/// register_socket("/tmp/imbued.sock");
/// ```
pub fn register_socket(path: impl AsRef<Path>) {
    sockets().insert(path.as_ref().to_path_buf());
}

/// Register a tracker to be closed on cleanup
pub fn register_tracker(tracker: Arc<dyn Tracker>) {
    trackers().push(tracker);
}

/// Setup signal handlers for graceful shutdown
///
/// With the `termination` feature of `ctrlc` this covers SIGINT, SIGTERM and
/// SIGHUP. The handler cleans up and exits the process.
pub fn setup_signal_handlers() {
    if let Err(e) = ctrlc::set_handler(|| {
        eprintln!("\n🛑 Received termination signal");
        cleanup();
        std::process::exit(0);
    }) {
        tracing::warn!(error = %e, "failed to set signal handler");
        return;
    }

    tracing::debug!("signal handlers registered");
}

/// Remove registered sockets and close registered trackers
///
/// This function is idempotent - safe to call multiple times.
pub fn cleanup() {
    let paths: Vec<PathBuf> = sockets().drain().collect();
    for path in paths {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::info!(socket = %path.display(), "removed socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = %path.display(), error = %e, "failed to remove socket"),
        }
    }

    let closing: Vec<Arc<dyn Tracker>> = trackers().drain(..).collect();
    for tracker in closing {
        if let Err(e) = tracker.close() {
            tracing::warn!(error = %e, "failed to close audit log");
        }
    }
}
