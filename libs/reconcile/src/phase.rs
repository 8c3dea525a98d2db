//! Release phases and the state machine between them.
//!
//! ```text
//! (unset) ──► Pending ──► Deployed ──► Superseded
//!                │            │
//!                │            └──────► Suspended
//!                ├──────────────────► Superseded
//!                └──────────────────► Suspended
//! ```
//!
//! Only the controller moves a release between phases. Every transition
//! stamps the transition time; message writes that would not change the
//! stored text are reported as no-ops so callers can skip the store write.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle phase of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Waiting to be selected and activated.
    Pending,
    /// Active on disk; exactly one per module.
    Deployed,
    /// Replaced by (or obsoleted in favor of) a newer release.
    Superseded,
    /// Activation failed; kept out of service until something changes.
    Suspended,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Deployed => "Deployed",
            Self::Superseded => "Superseded",
            Self::Suspended => "Suspended",
        }
    }

    /// Value used for the `status` label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deployed => "deployed",
            Self::Superseded => "superseded",
            Self::Suspended => "suspended",
        }
    }

    /// Returns true if moving from `from` to `self` is a legal transition.
    pub fn can_follow(&self, from: Option<Phase>) -> bool {
        match (from, self) {
            (None, Phase::Pending) => true,
            (Some(Phase::Pending), Phase::Deployed | Phase::Superseded | Phase::Suspended) => true,
            (Some(Phase::Deployed), Phase::Superseded | Phase::Suspended) => true,
            (Some(from), to) => from == *to,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Deployed" => Ok(Self::Deployed),
            "Superseded" => Ok(Self::Superseded),
            "Suspended" => Ok(Self::Suspended),
            other => Err(PhaseError::Unknown(other.to_string())),
        }
    }
}

/// Phase errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PhaseError {
    #[error("unknown phase: {0}")]
    Unknown(String),

    #[error("illegal phase transition: {from} -> {to}")]
    IllegalTransition { from: String, to: Phase },
}

/// Observed status of a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<DateTime<Utc>>,
}

impl ReleaseStatus {
    /// Move an unset phase to `Pending`. Returns false if the phase was already set.
    pub fn normalize(&mut self, now: DateTime<Utc>) -> bool {
        if self.phase.is_some() {
            return false;
        }
        self.phase = Some(Phase::Pending);
        self.transition_time = Some(now);
        true
    }

    /// Transition to `to`, replacing the message.
    pub fn transition(
        &mut self,
        to: Phase,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PhaseError> {
        if !to.can_follow(self.phase) {
            return Err(PhaseError::IllegalTransition {
                from: self
                    .phase
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_else(|| "<unset>".to_string()),
                to,
            });
        }

        self.phase = Some(to);
        self.message = message.into();
        self.transition_time = Some(now);
        Ok(())
    }

    /// Replace the message. Returns false when the message is unchanged.
    pub fn set_message(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if self.message == message {
            return false;
        }
        self.message = message;
        true
    }

    pub fn is(&self, phase: Phase) -> bool {
        self.phase == Some(phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unset_phase() {
        let now = Utc::now();
        let mut status = ReleaseStatus::default();

        assert!(status.normalize(now));
        assert_eq!(status.phase, Some(Phase::Pending));
        assert_eq!(status.transition_time, Some(now));

        // Second call is a no-op
        assert!(!status.normalize(Utc::now()));
        assert_eq!(status.transition_time, Some(now));
    }

    #[test]
    fn test_legal_transitions() {
        assert!(Phase::Pending.can_follow(None));
        assert!(Phase::Deployed.can_follow(Some(Phase::Pending)));
        assert!(Phase::Superseded.can_follow(Some(Phase::Pending)));
        assert!(Phase::Suspended.can_follow(Some(Phase::Pending)));
        assert!(Phase::Superseded.can_follow(Some(Phase::Deployed)));
        assert!(Phase::Suspended.can_follow(Some(Phase::Deployed)));
        assert!(Phase::Suspended.can_follow(Some(Phase::Suspended)));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Phase::Deployed.can_follow(None));
        assert!(!Phase::Pending.can_follow(Some(Phase::Deployed)));
        assert!(!Phase::Deployed.can_follow(Some(Phase::Superseded)));
        assert!(!Phase::Deployed.can_follow(Some(Phase::Suspended)));

        let mut status = ReleaseStatus {
            phase: Some(Phase::Superseded),
            ..Default::default()
        };
        let err = status
            .transition(Phase::Deployed, "", Utc::now())
            .unwrap_err();
        assert!(matches!(err, PhaseError::IllegalTransition { .. }));
        assert_eq!(status.phase, Some(Phase::Superseded));
    }

    #[test]
    fn test_transition_stamps_time_and_message() {
        let now = Utc::now();
        let mut status = ReleaseStatus {
            phase: Some(Phase::Pending),
            message: "Waiting for manual approval".to_string(),
            transition_time: None,
        };

        status.transition(Phase::Deployed, "", now).unwrap();
        assert!(status.is(Phase::Deployed));
        assert!(status.message.is_empty());
        assert_eq!(status.transition_time, Some(now));
    }

    #[test]
    fn test_redundant_message_is_suppressed() {
        let mut status = ReleaseStatus::default();
        assert!(status.set_message("Waiting for manual approval"));
        assert!(!status.set_message("Waiting for manual approval"));
        assert!(status.set_message(""));
    }

    #[test]
    fn test_phase_parse_and_label() {
        assert_eq!("Deployed".parse::<Phase>().unwrap(), Phase::Deployed);
        assert!("deployed".parse::<Phase>().is_err());
        assert_eq!(Phase::Superseded.label(), "superseded");
    }

    #[test]
    fn test_status_serde_shape() {
        let status = ReleaseStatus {
            phase: Some(Phase::Suspended),
            message: "validation failed".to_string(),
            transition_time: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Suspended");
        assert_eq!(json["message"], "validation failed");
        assert!(json.get("transitionTime").is_none());
    }
}
