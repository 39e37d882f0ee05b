use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display format for expiry timestamps in listings and command output.
pub const EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Shorten a token for logs: first and last four characters only.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}…{}", head, tail)
    } else {
        "****".to_string()
    }
}

/// A single issued key.
///
/// `token` and `expires_at` never change after issuance. `bound_hwid` is set
/// once on first successful validation and only cleared by an explicit reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub bound_hwid: Option<String>,
}

impl KeyRecord {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
            bound_hwid: None,
        }
    }

    /// Expired keys stay in the store until the sweeper removes them.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Why a validation was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowReason {
    /// The key was unbound and is now bound to the caller's hardware.
    Linked,
    /// The key was already bound to the caller's hardware.
    Verified,
}

impl AllowReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllowReason::Linked => "linked",
            AllowReason::Verified => "verified",
        }
    }
}

/// Outcome of validating a key against a hardware identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed(AllowReason),
    HwidMismatch,
    Expired,
    NotFound,
}

impl Decision {
    /// Stable label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allowed(AllowReason::Linked) => "linked",
            Decision::Allowed(AllowReason::Verified) => "verified",
            Decision::HwidMismatch => "hwid_mismatch",
            Decision::Expired => "expired",
            Decision::NotFound => "not_found",
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }
}

/// Result of the store's bind-if-unbound operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    AlreadyBound(String),
    NotFound,
}

/// Read-only view of a key, as reported by `check_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyStatus {
    Valid { expires_at: DateTime<Utc> },
    Expired { expires_at: DateTime<Utc> },
    NotFound,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Valid { expires_at } => {
                write!(f, "valid, expires on {}", expires_at.format(EXPIRY_FORMAT))
            }
            KeyStatus::Expired { expires_at } => {
                write!(f, "expired, expired on {}", expires_at.format(EXPIRY_FORMAT))
            }
            KeyStatus::NotFound => f.write_str("not found"),
        }
    }
}

/// Parameters for issuing a key. Defaults match the `generate_key` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueRequest {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub length: usize,
}

impl Default for IssueRequest {
    fn default() -> Self {
        Self {
            days: 0,
            hours: 0,
            minutes: 0,
            length: 64,
        }
    }
}
