//! Project rules file, reloaded in the background when it changes.

use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Heading the rules text is placed under in the system prompt.
pub const RULES_HEADING: &str = "# Project Rules";

/// Holds the current rules text and the task that keeps it fresh.
pub struct RulesWatcher {
    path: PathBuf,
    content: Arc<RwLock<Option<String>>>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RulesWatcher {
    /// Load `path` once and start polling it. A missing file means no rules.
    /// Must be called inside a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        Self::spawn_with_interval(path, POLL_INTERVAL)
    }

    pub fn spawn_with_interval(path: impl Into<PathBuf>, interval: Duration) -> Self {
        let path = path.into();
        let content = Arc::new(RwLock::new(read_rules(&path)));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(poll_loop(
            path.clone(),
            Arc::clone(&content),
            shutdown.clone(),
            interval,
        ));

        Self {
            path,
            content,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current rules text, `None` when the file is missing or blank.
    pub fn content(&self) -> Option<String> {
        self.content.read().clone()
    }

    /// `system` with the rules appended under their heading.
    pub fn augment(&self, system: &str) -> String {
        match self.content() {
            Some(rules) if system.is_empty() => format!("{}\n\n{}", RULES_HEADING, rules),
            Some(rules) => format!("{}\n\n{}\n\n{}", system, RULES_HEADING, rules),
            None => system.to_string(),
        }
    }

    /// Stop polling and wait for the poller to exit. Idempotent.
    pub async fn close(&self) -> Result<(), crate::interfaces::RuntimeError> {
        self.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| {
                crate::interfaces::RuntimeError::ConfigError(format!(
                    "Rules watcher task failed: {}",
                    e
                ))
            })?;
        }
        Ok(())
    }
}

async fn poll_loop(
    path: PathBuf,
    content: Arc<RwLock<Option<String>>>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    let mut last_modified = file_modified(&path);
    debug!("Rules watcher started: {}", path.display());

    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = shutdown.cancelled() => {
                debug!("Rules watcher stopped");
                return;
            }
        }

        let current = file_modified(&path);
        if current == last_modified {
            continue;
        }
        last_modified = current;

        let rules = read_rules(&path);
        info!(
            "Rules reloaded from {} ({})",
            path.display(),
            if rules.is_some() { "present" } else { "absent" }
        );
        *content.write() = rules;
    }
}

fn file_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_rules(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to read rules file {}: {}", path.display(), e);
            None
        }
    }
}
