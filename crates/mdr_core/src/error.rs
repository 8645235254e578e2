use thiserror::Error;

use crate::types::Status;

#[derive(Debug, Error)]
pub enum MdrError {
    #[error("malformed urn: {0}")]
    MalformedUrn(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: Status, to: String },

    #[error("status mismatch: {element} element in {namespace} namespace")]
    StatusMismatch { namespace: Status, element: Status },

    #[error("incomplete members: {} unreleased member(s): {}", .0.len(), .0.join(", "))]
    IncompleteMembers(Vec<String>),

    #[error("namespace not released: {0}")]
    NamespaceNotReleased(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unsupported element type: {0}")]
    UnsupportedElementType(String),

    #[error("conversion failed for staged element {staging_id}: {reason}")]
    ConversionFailed { staging_id: String, reason: String },

    #[error("cyclic membership: {0}")]
    CyclicMembership(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MdrError {
    /// Stable machine-readable code, recorded on failed staged elements.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedUrn(_) => "MALFORMED_URN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::StatusMismatch { .. } => "STATUS_MISMATCH",
            Self::IncompleteMembers(_) => "INCOMPLETE_MEMBERS",
            Self::NamespaceNotReleased(_) => "NAMESPACE_NOT_RELEASED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::UnsupportedElementType(_) => "UNSUPPORTED_ELEMENT_TYPE",
            Self::ConversionFailed { .. } => "CONVERSION_FAILED",
            Self::CyclicMembership(_) => "CYCLIC_MEMBERSHIP",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub(crate) fn transition(from: Status, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from,
            to: to.into(),
        }
    }
}
