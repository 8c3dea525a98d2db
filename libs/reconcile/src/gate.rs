//! Update policy gate.
//!
//! Decides whether the desired release may be activated right now. Every
//! blocking outcome carries the human-readable message to store on the
//! release; the caller retries after a fixed delay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::window::Windows;

/// Label on a release naming its update policy.
pub const UPDATE_POLICY_LABEL: &str = "modules.extmod.io/update-policy";

/// Annotation on a release carrying manual approval.
pub const APPROVAL_ANNOTATION: &str = "modules.extmod.io/approved";

/// Message for releases waiting on manual approval.
pub const MANUAL_APPROVAL_REQUIRED: &str = "Waiting for manual approval";

/// How a policy lets releases through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyMode {
    /// Every release needs the approval annotation.
    Manual,
    /// Releases go through inside maintenance windows.
    Auto,
}

/// The policy referenced by a release, as resolved by the caller.
#[derive(Debug, Clone, Copy)]
pub enum PolicyRef<'a> {
    /// The release carries no policy label.
    Unset,
    /// The label names a policy that does not exist.
    Missing(&'a str),
    /// The policy exists.
    Found {
        mode: PolicyMode,
        windows: &'a Windows,
    },
}

/// Gate outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Blocked { message: String },
}

impl GateDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// Evaluate the gate for a desired release.
///
/// `approval` is the raw value of [`APPROVAL_ANNOTATION`], if present.
pub fn evaluate(policy: PolicyRef<'_>, approval: Option<&str>, now: DateTime<Utc>) -> GateDecision {
    match policy {
        PolicyRef::Unset => GateDecision::Blocked {
            message: format!(
                "Update policy not set. Create a ModuleUpdatePolicy object and label the release '{}=<policy_name>'",
                UPDATE_POLICY_LABEL
            ),
        },
        PolicyRef::Missing(name) => GateDecision::Blocked {
            message: format!("Update policy {} not found", name),
        },
        PolicyRef::Found {
            mode: PolicyMode::Manual,
            ..
        } if !is_approved(approval) => GateDecision::Blocked {
            message: MANUAL_APPROVAL_REQUIRED.to_string(),
        },
        PolicyRef::Found {
            mode: PolicyMode::Auto,
            windows,
        } if !windows.is_allowed(now) => GateDecision::Blocked {
            message: format!(
                "Release is waiting for the update window: {}",
                windows.next_allowed_time(now).to_rfc3339()
            ),
        },
        PolicyRef::Found { .. } => GateDecision::Proceed,
    }
}

/// Interpret an approval annotation value.
///
/// Accepts the usual boolean spellings; anything else is "not approved".
pub fn is_approved(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "t" | "T" | "true" | "TRUE" | "True"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Window;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-14T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[rstest]
    #[case(Some("true"), true)]
    #[case(Some("True"), true)]
    #[case(Some("1"), true)]
    #[case(Some("t"), true)]
    #[case(Some("false"), false)]
    #[case(Some("0"), false)]
    #[case(Some("not-a-bool"), false)]
    #[case(Some(""), false)]
    #[case(Some("yes"), false)]
    #[case(None, false)]
    fn test_is_approved(#[case] value: Option<&str>, #[case] expected: bool) {
        assert_eq!(is_approved(value), expected);
    }

    #[test]
    fn test_unset_policy_blocks() {
        let decision = evaluate(PolicyRef::Unset, Some("true"), now());
        match decision {
            GateDecision::Blocked { message } => {
                assert!(message.starts_with("Update policy not set"));
                assert!(message.contains(UPDATE_POLICY_LABEL));
            }
            GateDecision::Proceed => panic!("expected block"),
        }
    }

    #[test]
    fn test_missing_policy_blocks() {
        let decision = evaluate(PolicyRef::Missing("nightly"), None, now());
        assert_eq!(
            decision,
            GateDecision::Blocked {
                message: "Update policy nightly not found".to_string()
            }
        );
    }

    #[rstest]
    #[case(None)]
    #[case(Some("false"))]
    #[case(Some("not-a-bool"))]
    fn test_manual_without_approval_blocks(#[case] approval: Option<&str>) {
        let windows = Windows::default();
        let policy = PolicyRef::Found {
            mode: PolicyMode::Manual,
            windows: &windows,
        };
        assert_eq!(
            evaluate(policy, approval, now()),
            GateDecision::Blocked {
                message: MANUAL_APPROVAL_REQUIRED.to_string()
            }
        );
    }

    #[test]
    fn test_manual_with_approval_ignores_windows() {
        let windows = Windows(vec![Window {
            from: "01:00".to_string(),
            to: "02:00".to_string(),
            days: vec![],
        }]);
        let policy = PolicyRef::Found {
            mode: PolicyMode::Manual,
            windows: &windows,
        };
        assert!(evaluate(policy, Some("true"), now()).is_proceed());
    }

    #[test]
    fn test_auto_outside_window_names_next_time() {
        let windows = Windows(vec![Window {
            from: "20:00".to_string(),
            to: "22:00".to_string(),
            days: vec![],
        }]);
        let policy = PolicyRef::Found {
            mode: PolicyMode::Auto,
            windows: &windows,
        };

        match evaluate(policy, None, now()) {
            GateDecision::Blocked { message } => {
                assert_eq!(
                    message,
                    "Release is waiting for the update window: 2026-10-14T20:00:00+00:00"
                );
            }
            GateDecision::Proceed => panic!("expected block"),
        }
    }

    #[test]
    fn test_auto_inside_window_proceeds() {
        let windows = Windows(vec![Window {
            from: "11:00".to_string(),
            to: "13:00".to_string(),
            days: vec![],
        }]);
        let policy = PolicyRef::Found {
            mode: PolicyMode::Auto,
            windows: &windows,
        };
        assert!(evaluate(policy, None, now()).is_proceed());
    }
}
