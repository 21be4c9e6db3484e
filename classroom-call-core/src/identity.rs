//! Participant identity
//!
//! Call participants are platform users (students, instructors). Their ids end
//! up inside document paths, so they are validated once at construction.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

/// Invalid participant identifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Empty identifier
    #[error("participant id cannot be empty")]
    Empty,

    /// Identifier contains a path separator
    #[error("participant id cannot contain '/': {0}")]
    PathSeparator(String),
}

/// Identifier of a call participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create a participant id, rejecting empty ids and ids containing `/`
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] if the id is not usable as a path segment
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdentityError::Empty);
        }
        if id.contains('/') {
            return Err(IdentityError::PathSeparator(id));
        }
        Ok(Self(id))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id() {
        let id = ParticipantId::new("student-42").unwrap();
        assert_eq!(id.to_string(), "student-42");
        assert_eq!(id.as_str(), "student-42");
    }

    #[test]
    fn test_participant_id_rejects_bad_input() {
        assert_eq!(ParticipantId::new(""), Err(IdentityError::Empty));
        assert_eq!(ParticipantId::new("   "), Err(IdentityError::Empty));
        assert!(matches!(
            "calls/evil".parse::<ParticipantId>(),
            Err(IdentityError::PathSeparator(_))
        ));
    }

    #[test]
    fn test_participant_id_serialization() {
        let id = ParticipantId::new("instructor-7").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"instructor-7\"");
        let back: ParticipantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<ParticipantId>("\"a/b\"").is_err());
    }
}
