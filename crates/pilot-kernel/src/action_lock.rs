//! [`ActionLock`] – priority-leveled, time-bounded advisory mutex over the
//! shared actuator.
//!
//! The lock records which subsystem currently has *permission* to drive the
//! actuator; it enforces nothing physically.  Callers that are denied simply
//! skip their action this cycle (denial is a normal condition, not an error).
//!
//! # Precedence
//!
//! [`ActionLock::try_acquire`] grants when:
//!
//! | current holder | requester | result |
//! |---|---|---|
//! | none / expired | anyone | granted |
//! | same source | same source | granted (deadline refreshed) |
//! | lower [`LockLevel`] | strictly higher level | granted (preempts) |
//! | same or higher level | different source | denied |
//!
//! Expiry is lazy: the deadline is checked whenever the lock is inspected,
//! so no timer task is needed.

use std::time::{Duration, Instant};

use pilot_types::LockLevel;
use tracing::debug;

/// Snapshot of the current holder, as reported by [`ActionLock::holder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// Identity of the subsystem holding the lock.
    pub source: String,
    /// Precedence level the lock was acquired at.
    pub level: LockLevel,
}

struct LockState {
    source: String,
    level: LockLevel,
    acquired_at: Instant,
    expires_at: Instant,
}

/// Advisory mutex over the single shared actuator.
///
/// One instance exists process-wide, passed explicitly to the subsystems
/// that drive the actuator.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use pilot_kernel::action_lock::ActionLock;
/// use pilot_types::LockLevel;
///
/// let mut lock = ActionLock::new();
/// assert!(lock.try_acquire("task_manager", LockLevel::Task, Duration::from_secs(5)));
/// // A reflex outranks a task and preempts it.
/// assert!(lock.try_acquire("reflex", LockLevel::Reflex, Duration::from_secs(1)));
/// // The task can no longer reclaim it.
/// assert!(!lock.try_acquire("task_manager", LockLevel::Task, Duration::from_secs(5)));
/// ```
#[derive(Default)]
pub struct ActionLock {
    state: Option<LockState>,
}

impl ActionLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire or refresh the lock for `duration`.
    ///
    /// Returns `true` when `source` now holds the lock.  Re-acquiring as the
    /// current holder re-arms the expiry deadline (and may change the level).
    pub fn try_acquire(&mut self, source: &str, level: LockLevel, duration: Duration) -> bool {
        self.expire_if_due();

        if let Some(state) = &self.state {
            let preempts = level > state.level;
            if state.source != source && !preempts {
                debug!(
                    requester = source,
                    holder = %state.source,
                    "action lock denied"
                );
                return false;
            }
            if preempts && state.source != source {
                debug!(
                    requester = source,
                    preempted = %state.source,
                    "action lock preempted"
                );
            }
        }

        let now = Instant::now();
        self.state = Some(LockState {
            source: source.to_string(),
            level,
            acquired_at: now,
            expires_at: now + duration,
        });
        true
    }

    /// Release the lock.  Succeeds only when `source` is the current holder;
    /// returns `false` otherwise (including when the lock is unheld).
    pub fn release(&mut self, source: &str) -> bool {
        self.expire_if_due();
        match &self.state {
            Some(state) if state.source == source => {
                self.state = None;
                true
            }
            _ => false,
        }
    }

    /// Unconditionally clear the lock.  Used on fatal resets.
    pub fn force_release(&mut self) {
        if self.state.is_some() {
            debug!("action lock force-released");
        }
        self.state = None;
    }

    /// The current live holder, or `None` when unheld or expired.
    pub fn holder(&mut self) -> Option<LockHolder> {
        self.expire_if_due();
        self.state.as_ref().map(|s| LockHolder {
            source: s.source.clone(),
            level: s.level,
        })
    }

    /// `true` when `source` currently holds the lock.
    pub fn is_held_by(&mut self, source: &str) -> bool {
        self.holder().is_some_and(|h| h.source == source)
    }

    /// How long the current holder has held the lock, if held.
    pub fn held_for(&mut self) -> Option<Duration> {
        self.expire_if_due();
        self.state.as_ref().map(|s| s.acquired_at.elapsed())
    }

    fn expire_if_due(&mut self) {
        if let Some(state) = &self.state {
            if Instant::now() >= state.expires_at {
                debug!(holder = %state.source, "action lock expired");
                self.state = None;
            }
        }
    }
}
