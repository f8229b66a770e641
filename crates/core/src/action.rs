//! The five handler operations a batch job is made of.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// One of the handler operations invoked by the orchestrator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// A fresh job begins (no cursor yet).
    Start,
    /// A job with a cursor continues.
    Resume,
    /// Fetch the next chunk.
    Get,
    /// Process a single item.
    Execute,
    /// `get` returned nothing; the job is done.
    Finish,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Start,
        Action::Resume,
        Action::Get,
        Action::Execute,
        Action::Finish,
    ];

    /// Canonical operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Resume => "resume",
            Action::Get => "get",
            Action::Execute => "execute",
            Action::Finish => "finish",
        }
    }

    /// Whether a notification may be emitted for this action.
    pub fn is_notifiable(&self) -> bool {
        matches!(self, Action::Start | Action::Resume | Action::Finish)
    }
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| BatchError::validation(format!("unknown action: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_names() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert_eq!("FINISH".parse::<Action>().unwrap(), Action::Finish);
        assert!("rollback".parse::<Action>().is_err());
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&Action::Execute).unwrap();
        assert_eq!(json, "\"execute\"");
    }
}
