use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, single-use handle of a pending wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueToken(Uuid);

impl QueueToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for QueueToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A due wake-up request for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowQueueItem {
    pub workflow_id: String,
    pub token: QueueToken,
    pub due_at: DateTime<Utc>,
    /// Set while a poller holds the item.
    pub leased_until: Option<DateTime<Utc>>,
}

impl WorkflowQueueItem {
    pub fn new(workflow_id: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            token: QueueToken::new(),
            due_at,
            leased_until: None,
        }
    }

    /// Whether a poller at `now` may take this item.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now && self.leased_until.map_or(true, |until| until <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_availability_respects_lease() {
        let now = Utc::now();
        let mut item = WorkflowQueueItem::new("wf", now - Duration::seconds(1));
        assert!(item.is_available(now));

        item.leased_until = Some(now + Duration::minutes(5));
        assert!(!item.is_available(now));
        assert!(item.is_available(now + Duration::minutes(5)));
    }

    #[test]
    fn test_future_item_not_available() {
        let now = Utc::now();
        let item = WorkflowQueueItem::new("wf", now + Duration::hours(1));
        assert!(!item.is_available(now));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(QueueToken::new(), QueueToken::new());
    }
}
