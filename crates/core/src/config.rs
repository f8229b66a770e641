//! Incoming batch configuration.
//!
//! A [`BatchConfig`] is what a caller submits when starting a job. Every field is
//! optional: absent fields leave the stored record untouched, present ones overwrite it
//! (see [`crate::BatchRecord::apply_config`]). Defaults are resolved by the record's
//! accessors, never written back on read.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::{BatchError, BatchResult};

/// Upper bound on any configured duration (100 years).
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Registered handler serving the job.
    pub handler_name: Option<String>,
    /// Items fetched per chunk.
    pub chunk_size: Option<u64>,
    /// Total items expected (pacing only).
    pub expected_count: Option<u64>,
    #[serde(with = "crate::duration_ms::option")]
    pub target_duration: Option<Duration>,
    #[serde(with = "crate::duration_ms::option")]
    pub base_delay: Option<Duration>,
    #[serde(with = "crate::duration_ms::option")]
    pub deadline: Option<Duration>,
    #[serde(with = "crate::duration_ms::option")]
    pub retention: Option<Duration>,
    /// Per-action handler override.
    pub action_bindings: Option<BTreeMap<Action, String>>,
    pub notification_templates: Option<BTreeMap<Action, String>>,
    pub notification_channels: Option<BTreeMap<Action, String>>,
    /// Opaque parameters passed to `get`.
    pub query_arguments: Option<BTreeMap<String, String>>,
}

impl BatchConfig {
    pub fn new(handler_name: impl Into<String>) -> Self {
        Self {
            handler_name: Some(handler_name.into()),
            ..Default::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_expected_count(mut self, expected: u64) -> Self {
        self.expected_count = Some(expected);
        self
    }

    pub fn with_target_duration(mut self, target: Duration) -> Self {
        self.target_duration = Some(target);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_binding(mut self, action: Action, handler_name: impl Into<String>) -> Self {
        self.action_bindings
            .get_or_insert_with(BTreeMap::new)
            .insert(action, handler_name.into());
        self
    }

    pub fn with_notification(
        mut self,
        action: Action,
        template: impl Into<String>,
        channel: Option<String>,
    ) -> Self {
        self.notification_templates
            .get_or_insert_with(BTreeMap::new)
            .insert(action, template.into());
        if let Some(channel) = channel {
            self.notification_channels
                .get_or_insert_with(BTreeMap::new)
                .insert(action, channel);
        }
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_arguments
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Reject values no record should ever hold.
    pub fn validate(&self) -> BatchResult<()> {
        if let Some(name) = &self.handler_name {
            if name.trim().is_empty() {
                return Err(BatchError::validation("handler_name must not be empty"));
            }
        }
        if let Some(bindings) = &self.action_bindings {
            if let Some((action, _)) = bindings.iter().find(|(_, name)| name.trim().is_empty()) {
                return Err(BatchError::validation(format!(
                    "binding for {action} must name a handler"
                )));
            }
        }
        for (field, value) in [
            ("target_duration", self.target_duration),
            ("deadline", self.deadline),
            ("retention", self.retention),
        ] {
            if value == Some(Duration::ZERO) {
                return Err(BatchError::validation(format!("{field} must be positive")));
            }
        }
        for (field, value) in [
            ("target_duration", self.target_duration),
            ("base_delay", self.base_delay),
            ("deadline", self.deadline),
            ("retention", self.retention),
        ] {
            if value.is_some_and(|d| d > MAX_DURATION) {
                return Err(BatchError::validation(format!(
                    "{field} must be at most 100 years"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_travel_as_milliseconds() {
        let config = BatchConfig::new("reindex").with_target_duration(Duration::from_secs(90));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["target_duration"], 90_000);

        let back: BatchConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn missing_fields_deserialize_as_absent() {
        let config: BatchConfig = serde_json::from_str(r#"{"chunk_size": 50}"#).unwrap();
        assert_eq!(config.chunk_size, Some(50));
        assert!(config.handler_name.is_none());
        assert!(config.query_arguments.is_none());
    }

    #[test]
    fn validate_rejects_blank_names_and_zero_durations() {
        assert!(BatchConfig::new(" ").validate().is_err());
        assert!(BatchConfig::new("h")
            .with_binding(Action::Finish, "")
            .validate()
            .is_err());
        assert!(BatchConfig::new("h")
            .with_deadline(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BatchConfig::new("h").with_chunk_size(0).validate().is_ok());
    }

    #[test]
    fn validate_bounds_durations_from_above() {
        let huge = Duration::from_millis(u64::MAX);
        assert!(BatchConfig::new("h").with_deadline(huge).validate().is_err());
        assert!(BatchConfig::new("h").with_retention(huge).validate().is_err());
        assert!(BatchConfig::new("h").with_base_delay(huge).validate().is_err());
        let err = BatchConfig::new("h")
            .with_target_duration(MAX_DURATION + Duration::from_secs(1))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("target_duration"));

        assert!(BatchConfig::new("h")
            .with_deadline(MAX_DURATION)
            .with_base_delay(Duration::ZERO)
            .validate()
            .is_ok());
    }
}
