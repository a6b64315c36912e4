use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Result, SkeinError};

/// Outcome of resolving one call site.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// The call site has a result.
    Ready(T),
    /// The call site is not due before `wake_at`.
    Pending { wake_at: DateTime<Utc> },
}

impl<T> Resolution<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Self::Ready(value) => Resolution::Ready(f(value)),
            Self::Pending { wake_at } => Resolution::Pending { wake_at },
        }
    }

    /// Surface a pending resolution as the suspension error, so workflow code
    /// can propagate it with `?`.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending { wake_at } => Err(SkeinError::Suspended { wake_at }),
        }
    }
}

/// Payload delivered to a waiting workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    /// Name of the event that was raised.
    pub name: String,
    pub value: serde_json::Value,
}

impl EventResult {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Get the payload as a typed value.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| SkeinError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_becomes_suspension() {
        let wake_at = Utc::now();
        let pending: Resolution<u32> = Resolution::Pending { wake_at };
        assert!(pending.is_pending());

        let err = pending.into_result().unwrap_err();
        assert!(err.is_suspended());
        assert!(matches!(err, SkeinError::Suspended { wake_at: w } if w == wake_at));
    }

    #[test]
    fn test_ready_maps_value() {
        let ready = Resolution::Ready(2).map(|v| v * 21);
        assert_eq!(ready.into_result().unwrap(), 42);
    }

    #[test]
    fn test_event_payload() {
        let event = EventResult::new("Verify", serde_json::json!({ "code": 1234 }));

        #[derive(Deserialize)]
        struct Code {
            code: u32,
        }

        assert_eq!(event.value_as::<Code>().unwrap().code, 1234);
        assert!(event.value_as::<String>().is_err());
    }
}
