//! Error types for the workflow crate.
//!
//! Errors are plain enums; callers layer them into rootcause reports:
//! - `ValidationError`: a definition or step configuration is malformed
//! - `TransitionError`: an illegal execution or step status change
//! - `StoreError`: a storage port failed (classified transient or permanent)
//! - `EngineError`: the engine could not make progress on an execution
//!
//! Handler failures are not errors of the engine: they are recorded on the
//! execution (see [`crate::handler::ActionError`]).

use std::fmt;

/// Errors raised while validating workflow definitions and steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The workflow name is empty.
    EmptyName,
    /// Two steps share the same position.
    DuplicatePosition { position: i32 },
    /// The trigger kind is not one of the supported kinds.
    UnknownTriggerKind { kind: String },
    /// The action kind is not one of the supported kinds.
    UnknownActionKind { kind: String },
    /// The action configuration does not match its kind.
    InvalidActionConfig { kind: String, reason: String },
    /// A create-activity step has an empty title.
    EmptyActivityTitle { position: i32 },
    /// A send-notification step has an empty message.
    EmptyNotificationMessage { position: i32 },
    /// An update-deal step targets a field automation may not touch.
    FieldNotWhitelisted { position: i32, field: String },
    /// A wait step has a zero duration.
    ZeroWait { position: i32 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "workflow name must not be empty"),
            Self::DuplicatePosition { position } => {
                write!(f, "more than one step at position {position}")
            }
            Self::UnknownTriggerKind { kind } => write!(f, "unknown trigger kind '{kind}'"),
            Self::UnknownActionKind { kind } => write!(f, "unknown action kind '{kind}'"),
            Self::InvalidActionConfig { kind, reason } => {
                write!(f, "invalid configuration for '{kind}' step: {reason}")
            }
            Self::EmptyActivityTitle { position } => {
                write!(f, "activity title must not be empty (step {position})")
            }
            Self::EmptyNotificationMessage { position } => {
                write!(f, "notification message must not be empty (step {position})")
            }
            Self::FieldNotWhitelisted { position, field } => {
                write!(f, "deal field '{field}' cannot be updated by automation (step {position})")
            }
            Self::ZeroWait { position } => {
                write!(f, "wait duration must be positive (step {position})")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// An attempted status change that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    /// What kind of record was being transitioned ("execution" or "step").
    pub entity: &'static str,
    /// The current status.
    pub from: &'static str,
    /// The requested status.
    pub to: &'static str,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid {} state transition from {} to {}",
            self.entity, self.from, self.to
        )
    }
}

impl std::error::Error for TransitionError {}

/// Errors from storage ports (definitions, execution log, CRM data).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced row does not exist (or is not visible to the tenant).
    NotFound { entity: &'static str, id: String },
    /// A uniqueness or consistency constraint rejected the write.
    Conflict { reason: String },
    /// The backend could not be reached or timed out.
    Unavailable { reason: String },
    /// A stored row could not be decoded into a domain value.
    Corrupt { reason: String },
    /// Any other backend failure.
    Backend { reason: String },
}

impl StoreError {
    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict { reason } => write!(f, "store conflict: {reason}"),
            Self::Unavailable { reason } => write!(f, "store unavailable: {reason}"),
            Self::Corrupt { reason } => write!(f, "corrupt stored data: {reason}"),
            Self::Backend { reason } => write!(f, "store failure: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors that stop the engine from processing an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A storage port failed.
    Store(StoreError),
    /// The engine attempted an illegal status change.
    Transition(TransitionError),
}

impl EngineError {
    /// Returns true if the same job may succeed when retried later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "engine store error: {e}"),
            Self::Transition(e) => write!(f, "engine state error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<TransitionError> for EngineError {
    fn from(e: TransitionError) -> Self {
        Self::Transition(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = ValidationError::FieldNotWhitelisted {
            position: 2,
            field: "name".to_string(),
        };
        assert!(err.to_string().contains("'name'"));
        assert!(err.to_string().contains("step 2"));
    }

    #[test]
    fn transition_error_display() {
        let err = TransitionError {
            entity: "execution",
            from: "completed",
            to: "running",
        };
        assert_eq!(
            err.to_string(),
            "invalid execution state transition from completed to running"
        );
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(
            StoreError::Unavailable {
                reason: "timeout".to_string()
            }
            .is_transient()
        );
        assert!(
            !StoreError::Conflict {
                reason: "dup".to_string()
            }
            .is_transient()
        );
        assert!(
            EngineError::from(StoreError::Unavailable {
                reason: "pool".to_string()
            })
            .is_transient()
        );
    }
}
