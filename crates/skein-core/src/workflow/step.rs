use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::queue::QueueToken;
use crate::{Result, SkeinError};

/// What a history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    /// A registered activity body.
    Activity,
    /// A durable timer.
    Delay,
    /// A wait for one of a set of named events.
    Event,
    /// A child workflow start.
    Workflow,
}

impl ActivityKind {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Delay => "delay",
            Self::Event => "event",
            Self::Workflow => "workflow",
        }
    }
}

impl FromStr for ActivityKind {
    type Err = SkeinError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "activity" => Ok(Self::Activity),
            "delay" => Ok(Self::Delay),
            "event" => Ok(Self::Event),
            "workflow" => Ok(Self::Workflow),
            other => Err(SkeinError::Deserialization(format!(
                "unknown activity kind '{}'",
                other
            ))),
        }
    }
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    /// Scheduled, not resolved yet.
    Running,
    /// Resolved with a result.
    Completed,
    /// Resolved with an error.
    Failed,
}

impl ActivityStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for ActivityStatus {
    type Err = SkeinError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SkeinError::Deserialization(format!(
                "unknown activity status '{}'",
                other
            ))),
        }
    }
}

/// Idempotency key of a call site.
///
/// Together with the owning workflow ID this identifies exactly one
/// [`ActivityStep`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityKey {
    pub kind: ActivityKind,
    /// Lowercase hex SHA-256 of `key`.
    pub key_hash: String,
    pub key: String,
}

/// One history entry per deterministic call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStep {
    /// Owning workflow.
    pub workflow_id: String,
    /// Per-workflow sequence number, assigned by storage on insert.
    pub sequence_id: i64,
    pub kind: ActivityKind,
    /// Activity name, event names or child workflow type.
    pub name: String,
    pub key_hash: String,
    pub key: String,
    /// Earliest time the step may resolve.
    pub eta: DateTime<Utc>,
    pub status: ActivityStatus,
    pub parameters: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Wake-up registered for `eta`.
    pub queue_token: Option<QueueToken>,
    pub created_at: DateTime<Utc>,
    /// Resolution time; the workflow clock advances to it on replay.
    pub last_updated: DateTime<Utc>,
}

impl ActivityStep {
    /// Create a new running step. `sequence_id` is filled in by storage.
    pub fn new(
        workflow_id: impl Into<String>,
        key: &ActivityKey,
        name: impl Into<String>,
        parameters: serde_json::Value,
        eta: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            sequence_id: 0,
            kind: key.kind,
            name: name.into(),
            key_hash: key.key_hash.clone(),
            key: key.key.clone(),
            eta,
            status: ActivityStatus::Running,
            parameters,
            result: None,
            error: None,
            queue_token: None,
            created_at: now,
            last_updated: now,
        }
    }

    /// The lookup key of this step.
    pub fn activity_key(&self) -> ActivityKey {
        ActivityKey {
            kind: self.kind,
            key_hash: self.key_hash.clone(),
            key: self.key.clone(),
        }
    }

    /// Mark step as completed with result.
    pub fn complete(&mut self, result: serde_json::Value, at: DateTime<Utc>) {
        self.status = ActivityStatus::Completed;
        self.result = Some(result);
        self.last_updated = at;
    }

    /// Mark step as failed with error.
    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = ActivityStatus::Failed;
        self.error = Some(error.into());
        self.last_updated = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::key::derive_key;

    #[test]
    fn test_status_conversion() {
        assert_eq!(ActivityStatus::Running.as_str(), "running");
        assert_eq!(ActivityStatus::Completed.as_str(), "completed");
        assert_eq!(
            "failed".parse::<ActivityStatus>().unwrap(),
            ActivityStatus::Failed
        );
        assert!("compensated".parse::<ActivityStatus>().is_err());
    }

    #[test]
    fn test_kind_conversion() {
        for kind in [
            ActivityKind::Activity,
            ActivityKind::Delay,
            ActivityKind::Event,
            ActivityKind::Workflow,
        ] {
            assert_eq!(kind.as_str().parse::<ActivityKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_step_transitions() {
        let now = Utc::now();
        let key = derive_key(ActivityKind::Activity, "send_email", "{}", None);
        let mut step =
            ActivityStep::new("wf-1", &key, "send_email", serde_json::json!({}), now, now);
        assert_eq!(step.status, ActivityStatus::Running);
        assert!(!step.status.is_terminal());

        let later = now + chrono::Duration::seconds(3);
        step.complete(serde_json::json!("ok"), later);
        assert_eq!(step.status, ActivityStatus::Completed);
        assert_eq!(step.last_updated, later);
        assert_eq!(step.activity_key(), key);
    }

    #[test]
    fn test_step_survives_json_round_trip() {
        use chrono::TimeZone;

        let created = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let eta = created + chrono::Duration::microseconds(15 * 60 * 1_000_000 + 123_456);
        let key = derive_key(ActivityKind::Event, "Resend,Verify", "[]", None);

        for status in [
            ActivityStatus::Running,
            ActivityStatus::Completed,
            ActivityStatus::Failed,
        ] {
            let mut step = ActivityStep::new(
                "wf-1",
                &key,
                "Resend,Verify",
                serde_json::json!(["Resend", "Verify"]),
                eta,
                created,
            );
            step.sequence_id = 7;
            step.queue_token = Some(QueueToken::new());
            match status {
                ActivityStatus::Running => {}
                ActivityStatus::Completed => step.complete(
                    serde_json::json!({ "name": "Verify", "value": { "code": 1234 } }),
                    eta,
                ),
                ActivityStatus::Failed => step.fail("smtp unavailable", eta),
            }

            let json = serde_json::to_string(&step).unwrap();
            let back: ActivityStep = serde_json::from_str(&json).unwrap();
            assert_eq!(back, step);
            assert_eq!(back.status, status);
            assert_eq!(back.eta, eta);
            assert_eq!(back.result, step.result);
        }
    }
}
