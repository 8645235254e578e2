//! Lifecycle state machine: pure functions, zero DB dependencies.
//!
//! ```text
//! DRAFT  → STAGED | RELEASED | deleted
//! STAGED → RELEASED | deleted
//! RELEASED → OUTDATED
//! OUTDATED (terminal)
//! ```
//!
//! Called by the registry before it builds a `WriteBatch`.

use crate::error::MdrError;
use crate::types::{ElementType, Status};
use crate::urn::Urn;

/// What `delete` does to a row in a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAction {
    /// Remove the row and everything attached to it.
    HardDelete,
    /// Keep the row, flip it to OUTDATED.
    Outdate,
}

/// How an update of content is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// DRAFT / STAGED: overwrite content, same version.
    InPlace,
    /// RELEASED: new identity at version + 1, old one retired.
    Revise,
}

/// Whether `from → to` is an edge of the state machine.
pub fn is_legal(from: Status, to: Status) -> bool {
    matches!(
        (from, to),
        (Status::Draft, Status::Staged)
            | (Status::Draft, Status::Released)
            | (Status::Staged, Status::Released)
            | (Status::Released, Status::Outdated)
    )
}

pub fn check_transition(from: Status, to: Status) -> Result<(), MdrError> {
    if is_legal(from, to) {
        Ok(())
    } else {
        Err(MdrError::transition(from, to.as_ref()))
    }
}

/// Statuses a brand new identity may start in.
pub fn check_initial(status: Status) -> Result<(), MdrError> {
    match status {
        Status::Draft | Status::Staged | Status::Released => Ok(()),
        Status::Outdated => Err(MdrError::transition(Status::Outdated, "created")),
    }
}

pub fn delete_action(status: Status) -> Result<DeleteAction, MdrError> {
    match status {
        s if s.is_mutable() => Ok(DeleteAction::HardDelete),
        Status::Released => Ok(DeleteAction::Outdate),
        _ => Err(MdrError::transition(status, "deleted")),
    }
}

pub fn update_mode(status: Status) -> Result<UpdateMode, MdrError> {
    match status {
        s if s.is_mutable() => Ok(UpdateMode::InPlace),
        Status::Released => Ok(UpdateMode::Revise),
        _ => Err(MdrError::transition(status, "updated")),
    }
}

/// A DRAFT/STAGED namespace may only contain DRAFT/STAGED elements.
pub fn check_containment(namespace: Status, element: Status) -> Result<(), MdrError> {
    if !namespace.is_released_or_later() && element.is_released_or_later() {
        Err(MdrError::StatusMismatch { namespace, element })
    } else {
        Ok(())
    }
}

/// Preconditions of `release`.
///
/// `unreleased` lists the URNs of transitive members (or the value domain of a
/// data element) that are not RELEASED. `namespace` is the owning namespace's
/// URN and status, `None` when releasing a namespace itself.
pub fn check_release(
    status: Status,
    element_type: ElementType,
    unreleased: &[Urn],
    namespace: Option<(&Urn, Status)>,
) -> Result<(), MdrError> {
    check_transition(status, Status::Released)?;
    check_release_ready(element_type, unreleased, namespace)
}

/// Release preconditions without the transition itself; used when a new
/// identity is created or revised directly into RELEASED.
pub fn check_release_ready(
    element_type: ElementType,
    unreleased: &[Urn],
    namespace: Option<(&Urn, Status)>,
) -> Result<(), MdrError> {
    if element_type != ElementType::Namespace && !unreleased.is_empty() {
        return Err(MdrError::IncompleteMembers(
            unreleased.iter().map(|u| u.to_string()).collect(),
        ));
    }
    match namespace {
        Some((urn, ns_status)) if ns_status != Status::Released => {
            Err(MdrError::NamespaceNotReleased(format!("{urn} is {ns_status}")))
        }
        _ => Ok(()),
    }
}
