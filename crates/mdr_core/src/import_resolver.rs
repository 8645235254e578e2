//! Namespace import resolver.
//!
//! When an element references something that lives in another namespace, the
//! referenced element is copied into the referencing namespace under a freshly
//! allocated identifier, and a provenance relation `new = source` is recorded.
//! Everything is staged into the caller's `WriteBatch`, so the imports commit
//! together with the mutation that needed them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::content::{self, Content};
use crate::error::MdrError;
use crate::ports::{ContentStore, IdentityRef, IdentityStore, Result, WriteBatch};
use crate::types::{Identity, NamespaceId, NamespaceSlot, NewIdentity, RelationKind, Status};
use crate::urn::Urn;

/// The namespace receiving imports, with the status that decides imported statuses.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportTarget {
    /// Current URN of the namespace identity.
    pub urn: Urn,
    pub namespace: NamespaceId,
    pub identifier: String,
    pub status: Status,
    pub actor: String,
}

impl ImportTarget {
    /// Build from the namespace's current identity.
    pub fn from_namespace(namespace: &Identity, actor: impl Into<String>) -> Self {
        Self {
            urn: namespace.urn(),
            namespace: namespace.namespace_id,
            identifier: namespace.identifier.clone(),
            status: namespace.status,
            actor: actor.into(),
        }
    }

    pub fn owns(&self, urn: &Urn) -> bool {
        urn.namespace == self.identifier
    }

    pub(crate) fn slot(&self) -> NamespaceSlot {
        NamespaceSlot::Existing {
            id: self.namespace,
            identifier: self.identifier.clone(),
        }
    }

    /// Status of a copy: RELEASED only when both source and target are released.
    fn imported_status(&self, source: Status) -> Status {
        if source == Status::Released && self.status == Status::Released {
            Status::Released
        } else {
            Status::Draft
        }
    }
}

/// Per-call memo: each source element is copied at most once per batch.
#[derive(Debug, Clone, Default)]
pub struct ImportMemo {
    imported: HashMap<Urn, (IdentityRef, Urn)>,
}

impl ImportMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: &Urn) -> Option<&(IdentityRef, Urn)> {
        self.imported.get(source)
    }

    pub fn len(&self) -> usize {
        self.imported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.imported.is_empty()
    }
}

enum Frame {
    Enter(Identity),
    Exit(Identity, Content),
}

#[derive(Clone)]
pub struct ImportResolver {
    identities: Arc<dyn IdentityStore>,
    contents: Arc<dyn ContentStore>,
}

impl ImportResolver {
    pub fn new(identities: Arc<dyn IdentityStore>, contents: Arc<dyn ContentStore>) -> Self {
        Self {
            identities,
            contents,
        }
    }

    async fn lookup(&self, urn: &Urn) -> Result<Identity> {
        self.identities
            .find(urn)
            .await?
            .ok_or_else(|| MdrError::NotFound(urn.to_string()))
    }

    /// The ref and URN to use for `urn` from inside `target`: unchanged when it
    /// already lives there, otherwise an import staged into `batch`.
    pub async fn resolve_reference(
        &self,
        batch: &mut WriteBatch,
        memo: &mut ImportMemo,
        urn: &Urn,
        target: &ImportTarget,
    ) -> Result<(IdentityRef, Urn)> {
        if let Some(hit) = memo.get(urn) {
            return Ok(hit.clone());
        }
        let identity = self.lookup(urn).await?;
        if target.owns(urn) {
            return Ok((IdentityRef::Existing(identity.id), urn.clone()));
        }
        self.import_into(batch, memo, &identity, target).await
    }

    /// Stage a copy of `source` (and of its out-of-namespace references) into `target`.
    pub async fn import_into(
        &self,
        batch: &mut WriteBatch,
        memo: &mut ImportMemo,
        source: &Identity,
        target: &ImportTarget,
    ) -> Result<(IdentityRef, Urn)> {
        if source.is_namespace() {
            return Err(MdrError::InvalidInput(format!(
                "namespace {} cannot be imported",
                source.urn()
            )));
        }
        if source.namespace_id == target.namespace {
            return Ok((IdentityRef::Existing(source.id), source.urn()));
        }

        let mut in_progress = HashSet::new();
        let mut stack = vec![Frame::Enter(source.clone())];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(node) => {
                    let urn = node.urn();
                    if memo.get(&urn).is_some() {
                        continue;
                    }
                    if !in_progress.insert(urn.clone()) {
                        return Err(MdrError::CyclicMembership(format!(
                            "{urn} references itself while importing"
                        )));
                    }
                    if node.status == Status::Outdated {
                        return Err(MdrError::transition(Status::Outdated, "imported"));
                    }
                    let content = self.contents.load_content(node.id).await?;
                    let mut deps = Vec::new();
                    for r in content.body.references() {
                        if target.owns(r) || memo.get(r).is_some() {
                            continue;
                        }
                        deps.push(self.lookup(r).await?);
                    }
                    stack.push(Frame::Exit(node, content));
                    stack.extend(deps.into_iter().rev().map(Frame::Enter));
                }
                Frame::Exit(node, content) => {
                    let source_urn = node.urn();
                    in_progress.remove(&source_urn);
                    if memo.get(&source_urn).is_some() {
                        continue;
                    }
                    let mut refs: HashMap<Urn, (IdentityRef, Urn)> = HashMap::new();
                    for r in content.body.references() {
                        let resolved = match memo.get(r) {
                            Some(hit) => hit.clone(),
                            None if target.owns(r) => {
                                (IdentityRef::Existing(self.lookup(r).await?.id), r.clone())
                            }
                            None => {
                                return Err(MdrError::Internal(anyhow::anyhow!(
                                    "dependency {r} of {source_urn} was not imported"
                                )))
                            }
                        };
                        refs.insert(r.clone(), resolved);
                    }
                    let body = content.body.map_references(|u| {
                        refs.get(u)
                            .map(|(_, new_urn)| new_urn.clone())
                            .ok_or_else(|| MdrError::NotFound(u.to_string()))
                    })?;
                    let members: Vec<IdentityRef> = content
                        .body
                        .members()
                        .iter()
                        .filter_map(|u| refs.get(u).map(|(r, _)| *r))
                        .collect();

                    let identifier = self
                        .identities
                        .next_identifier(Some(target.namespace), node.element_type)
                        .await?;
                    let new_identity = NewIdentity {
                        element_type: node.element_type,
                        namespace: target.slot(),
                        identifier: identifier.to_string(),
                        version: node.element_type.base_version(),
                        status: target.imported_status(node.status),
                        created_by: target.actor.clone(),
                    };
                    let new_urn = new_identity.urn();
                    let copy = Content { body, ..content };
                    let new_ref = content::attach(batch, new_identity, copy, &members);
                    batch.add_relation(new_ref, IdentityRef::Existing(node.id), RelationKind::Equal);
                    tracing::debug!(source = %source_urn, target = %new_urn, "staged import");
                    memo.imported.insert(source_urn, (new_ref, new_urn));
                }
            }
        }

        memo.get(&source.urn()).cloned().ok_or_else(|| {
            MdrError::Internal(anyhow::anyhow!("import of {} produced nothing", source.urn()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(status: Status) -> ImportTarget {
        ImportTarget {
            urn: Urn::namespace("2", 1),
            namespace: NamespaceId(2),
            identifier: "2".into(),
            status,
            actor: "alice".into(),
        }
    }

    #[test]
    fn imported_status_needs_both_sides_released() {
        assert_eq!(
            target(Status::Released).imported_status(Status::Released),
            Status::Released
        );
        assert_eq!(
            target(Status::Draft).imported_status(Status::Released),
            Status::Draft
        );
        assert_eq!(
            target(Status::Released).imported_status(Status::Staged),
            Status::Draft
        );
    }

    #[test]
    fn target_owns_its_urns() {
        let t = target(Status::Draft);
        assert!(t.owns(&Urn::parse("urn:2:dataelement:4:1").unwrap()));
        assert!(!t.owns(&Urn::parse("urn:3:dataelement:4:1").unwrap()));
    }
}
