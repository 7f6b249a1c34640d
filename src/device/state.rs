use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::state::models::{ActionKind, HostMdmActions};

/// Outcome of the action behind a stored reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOutcome {
    Pending,
    Succeeded,
    Failed,
}

/// How an unlock reference is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockObservation {
    /// Unlock runs as a script or command whose outcome is tracked.
    Tracked(ActionOutcome),
    /// Unlock is performed by a person entering the PIN. The reference is
    /// the time it became possible; `requested_at` is set once someone
    /// actually asked for the unlock.
    Manual { requested_at: Option<DateTime<Utc>> },
}

/// Resolved outcomes for the references present on a host's actions row.
///
/// A reference with no observation is treated as still pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observations {
    pub lock: Option<ActionOutcome>,
    pub unlock: Option<UnlockObservation>,
    pub wipe: Option<ActionOutcome>,
}

/// Lock/wipe state of a device, derived from its actions row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceState {
    Unlocked,
    LockPending {
        lock_ref: String,
    },
    Locked,
    UnlockPending {
        unlock_ref: String,
        unlock_pin: Option<String>,
        requested_at: Option<DateTime<Utc>>,
    },
    WipePending {
        wipe_ref: String,
    },
    Wiped,
}

impl DeviceState {
    pub fn is_locked(&self) -> bool {
        matches!(self, DeviceState::Locked | DeviceState::UnlockPending { .. })
    }

    pub fn is_wipe_in_progress_or_done(&self) -> bool {
        matches!(self, DeviceState::WipePending { .. } | DeviceState::Wiped)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Unlocked => f.write_str("unlocked"),
            DeviceState::LockPending { .. } => f.write_str("lock pending"),
            DeviceState::Locked => f.write_str("locked"),
            DeviceState::UnlockPending { .. } => f.write_str("unlock pending"),
            DeviceState::WipePending { .. } => f.write_str("wipe pending"),
            DeviceState::Wiped => f.write_str("wiped"),
        }
    }
}

/// Derive the device state from stored references and their outcomes.
///
/// A confirmed wipe dominates everything; a pending wipe dominates lock
/// and unlock. Failed actions behave as if the reference were absent.
pub fn derive_state(row: &HostMdmActions, obs: &Observations) -> DeviceState {
    let outcome = |present: Option<&String>, seen: Option<ActionOutcome>| {
        present.map(|_| seen.unwrap_or(ActionOutcome::Pending))
    };

    if let Some(wipe_ref) = &row.wipe_ref {
        match outcome(Some(wipe_ref), obs.wipe) {
            Some(ActionOutcome::Succeeded) => return DeviceState::Wiped,
            Some(ActionOutcome::Pending) => {
                return DeviceState::WipePending {
                    wipe_ref: wipe_ref.clone(),
                }
            }
            _ => {}
        }
    }

    let lock = outcome(row.lock_ref.as_ref(), obs.lock);
    let lock_confirmed = lock == Some(ActionOutcome::Succeeded);

    if let Some(unlock_ref) = &row.unlock_ref {
        let unlock = obs
            .unlock
            .unwrap_or(UnlockObservation::Tracked(ActionOutcome::Pending));
        match unlock {
            // Without a request the reference only says the PIN may be used.
            UnlockObservation::Manual {
                requested_at: Some(at),
            } if lock_confirmed => {
                return DeviceState::UnlockPending {
                    unlock_ref: unlock_ref.clone(),
                    unlock_pin: row.unlock_pin.clone(),
                    requested_at: Some(at),
                };
            }
            UnlockObservation::Tracked(ActionOutcome::Pending) => {
                return DeviceState::UnlockPending {
                    unlock_ref: unlock_ref.clone(),
                    unlock_pin: row.unlock_pin.clone(),
                    requested_at: None,
                };
            }
            UnlockObservation::Tracked(ActionOutcome::Succeeded) => {
                return DeviceState::Unlocked;
            }
            _ => {}
        }
    }

    match (lock, &row.lock_ref) {
        (Some(ActionOutcome::Pending), Some(lock_ref)) => DeviceState::LockPending {
            lock_ref: lock_ref.clone(),
        },
        (Some(ActionOutcome::Succeeded), _) => DeviceState::Locked,
        _ => DeviceState::Unlocked,
    }
}

/// Column changes applied to an actions row when an action completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefUpdate {
    pub clear_lock: bool,
    pub clear_unlock: bool,
    pub clear_wipe: bool,
    pub clear_pin: bool,
    /// Forget a recorded manual unlock request.
    pub clear_unlock_request: bool,
    /// Set `unlock_ref` to the completion time: the device can be unlocked
    /// manually from now on.
    pub mark_unlock_eligible: bool,
}

impl RefUpdate {
    /// Transition for a completed action.
    ///
    /// A failure clears only the failed reference so the host stays in its
    /// previous state. A successful lock keeps the PIN stored with it.
    pub fn on_completion(kind: ActionKind, succeeded: bool, unlock_eligible_after_lock: bool) -> Self {
        if !succeeded {
            return RefUpdate {
                clear_lock: kind == ActionKind::Lock,
                clear_unlock: kind == ActionKind::Unlock,
                clear_wipe: kind == ActionKind::Wipe,
                clear_unlock_request: kind == ActionKind::Unlock,
                ..Default::default()
            };
        }
        match kind {
            ActionKind::Lock => RefUpdate {
                clear_unlock: !unlock_eligible_after_lock,
                clear_wipe: true,
                clear_unlock_request: true,
                mark_unlock_eligible: unlock_eligible_after_lock,
                ..Default::default()
            },
            ActionKind::Unlock => RefUpdate {
                clear_lock: true,
                clear_unlock: true,
                clear_wipe: true,
                clear_pin: true,
                clear_unlock_request: true,
                ..Default::default()
            },
            ActionKind::Wipe => RefUpdate {
                clear_lock: true,
                clear_unlock: true,
                clear_pin: true,
                clear_unlock_request: true,
                ..Default::default()
            },
        }
    }

    /// Columns this update sets to NULL.
    pub fn cleared_columns(&self) -> Vec<&'static str> {
        let mut cols = Vec::new();
        if self.clear_lock {
            cols.push("lock_ref");
        }
        if self.clear_unlock {
            cols.push("unlock_ref");
        }
        if self.clear_wipe {
            cols.push("wipe_ref");
        }
        if self.clear_pin {
            cols.push("unlock_pin");
        }
        if self.clear_unlock_request {
            cols.push("unlock_requested_at");
        }
        cols
    }

    /// Apply to an in-memory row.
    pub fn apply(&self, row: &mut HostMdmActions, now: &str) {
        if self.clear_lock {
            row.lock_ref = None;
        }
        if self.clear_unlock {
            row.unlock_ref = None;
        }
        if self.clear_wipe {
            row.wipe_ref = None;
        }
        if self.clear_pin {
            row.unlock_pin = None;
        }
        if self.clear_unlock_request {
            row.unlock_requested_at = None;
        }
        if self.mark_unlock_eligible {
            row.unlock_ref = Some(now.to_string());
        }
    }
}
