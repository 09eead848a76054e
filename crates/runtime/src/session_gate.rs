//! Per-session exclusive permits: at most one in-flight turn per session id.

use crate::interfaces::RuntimeError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Registry of one-permit semaphores keyed by session id.
///
/// Entries are created lazily and never removed; their number is bounded by
/// the number of distinct sessions, which the history store already bounds.
#[derive(Default)]
pub struct SessionGate {
    permits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the session's permit without waiting.
    ///
    /// Fails with `ConcurrentExecution` when another turn holds it, and with
    /// `Cancelled` when the caller has already given up. The permit is
    /// returned when the `SessionPermit` is dropped.
    pub fn acquire(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> Result<SessionPermit, RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let semaphore = {
            let mut permits = self.permits.lock();
            Arc::clone(
                permits
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            )
        };

        match semaphore.try_acquire_owned() {
            Ok(permit) => {
                debug!("Acquired session gate: {}", session_id);
                Ok(SessionPermit {
                    session_id: session_id.to_string(),
                    acquired_at: Instant::now(),
                    _permit: permit,
                })
            }
            Err(_) => {
                warn!("Session already running a turn: {}", session_id);
                crate::metrics::increment_gate_contention();
                Err(RuntimeError::ConcurrentExecution(session_id.to_string()))
            }
        }
    }

    /// Whether a turn currently holds the session's permit.
    pub fn is_held(&self, session_id: &str) -> bool {
        self.permits
            .lock()
            .get(session_id)
            .is_some_and(|s| s.available_permits() == 0)
    }

    /// Number of sessions that have ever been gated.
    pub fn len(&self) -> usize {
        self.permits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.lock().is_empty()
    }
}

/// Held permit for one session. Dropping it releases the session.
pub struct SessionPermit {
    session_id: String,
    acquired_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl SessionPermit {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        debug!(
            "Released session gate: {} after {:?}",
            self.session_id,
            self.acquired_at.elapsed()
        );
    }
}
