//! Tenant pause handling

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Outcome of reading `spec.pausedUntil`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PauseState {
    Running,
    /// Paused until the user clears the field
    Indefinite,
    /// Paused until the given time; requeue after the duration
    Until(Duration),
}

/// Interprets `pausedUntil`, which holds either a boolean or an RFC3339 timestamp
pub fn pause_state(paused_until: Option<&str>, now: DateTime<Utc>) -> Result<PauseState> {
    let Some(raw) = paused_until else {
        return Ok(PauseState::Running);
    };

    if let Ok(until) = DateTime::parse_from_rfc3339(raw) {
        let until = until.with_timezone(&Utc);
        return Ok(match (until - now).to_std() {
            Ok(remaining) if remaining > Duration::ZERO => PauseState::Until(remaining),
            _ => PauseState::Running,
        });
    }

    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(PauseState::Indefinite),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(PauseState::Running),
        other => Err(Error::ConfigError(format!(
            "invalid value for pausedUntil {other:?}: expected a boolean or an RFC3339 timestamp"
        ))),
    }
}
