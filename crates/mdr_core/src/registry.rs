//! IdentityRegistry: versioned identities, their content and the lifecycle
//! operations that mutate them.
//!
//! Every mutation is planned into one `WriteBatch` (identity rows, content,
//! membership edges, imports, provenance relations) and committed through
//! `RegistryWriter::commit`. Authorization is the caller's job.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::content::{self, Content, ElementBody};
use crate::error::MdrError;
use crate::import_resolver::{ImportMemo, ImportResolver, ImportTarget};
use crate::lifecycle::{self, DeleteAction, UpdateMode};
use crate::membership::MembershipGraph;
use crate::ports::{
    ContentStore, IdentityRef, IdentityStore, MembershipStore, RegistryWriter, Result, WriteBatch,
};
use crate::types::*;
use crate::urn::Urn;

/// Result of `delete`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// DRAFT/STAGED row removed with everything attached.
    Deleted(Urn),
    /// RELEASED row kept, now OUTDATED.
    Outdated(Identity),
}

#[derive(Clone)]
pub struct IdentityRegistry {
    identities: Arc<dyn IdentityStore>,
    contents: Arc<dyn ContentStore>,
    membership: Arc<dyn MembershipStore>,
    writer: Arc<dyn RegistryWriter>,
    imports: ImportResolver,
}

impl IdentityRegistry {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        contents: Arc<dyn ContentStore>,
        membership: Arc<dyn MembershipStore>,
        writer: Arc<dyn RegistryWriter>,
    ) -> Self {
        let imports = ImportResolver::new(identities.clone(), contents.clone());
        Self {
            identities,
            contents,
            membership,
            writer,
            imports,
        }
    }

    pub fn identities(&self) -> &dyn IdentityStore {
        self.identities.as_ref()
    }

    pub fn membership(&self) -> &dyn MembershipStore {
        self.membership.as_ref()
    }

    pub fn imports(&self) -> &ImportResolver {
        &self.imports
    }

    // ── Reads ─────────────────────────────────────────────────

    pub async fn resolve(&self, urn: &Urn) -> Result<Identity> {
        self.identities
            .find(urn)
            .await?
            .ok_or_else(|| MdrError::NotFound(urn.to_string()))
    }

    /// All versions of the logical element behind `urn`, ascending.
    pub async fn history(&self, urn: &Urn) -> Result<Vec<Identity>> {
        let namespace = self.namespace_id(&urn.namespace).await?;
        self.identities
            .versions(namespace, urn.element_type, &urn.identifier)
            .await
    }

    /// Highest version of the logical element behind `urn`; the version token is ignored.
    pub async fn resolve_latest(&self, urn: &Urn) -> Result<Identity> {
        self.history(urn)
            .await?
            .pop()
            .ok_or_else(|| MdrError::NotFound(urn.to_string()))
    }

    /// Current identity of the namespace with this identifier.
    pub async fn namespace_head(&self, identifier: &str) -> Result<Identity> {
        self.resolve_latest(&Urn::namespace(identifier, 1)).await
    }

    async fn namespace_id(&self, identifier: &str) -> Result<NamespaceId> {
        self.identities
            .find_namespace(identifier)
            .await?
            .ok_or_else(|| MdrError::NotFound(format!("namespace {identifier}")))
    }

    pub async fn content(&self, id: IdentityId) -> Result<Content> {
        self.contents.load_content(id).await
    }

    /// Direct members in ordinal order.
    pub async fn members(&self, identity: &Identity) -> Result<Vec<Identity>> {
        let edges = self.membership.children(identity.id).await?;
        let ids: Vec<IdentityId> = edges.iter().map(|e| e.sub_id).collect();
        let mut by_id: HashMap<IdentityId, Identity> = self
            .identities
            .get_many(&ids)
            .await?
            .into_iter()
            .map(|i| (i.id, i))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    pub async fn visible_roots(
        &self,
        namespace: &Identity,
        types: &[ElementType],
        hide_transitive: bool,
    ) -> Result<Vec<Identity>> {
        let graph = MembershipGraph::load_namespace(
            self.identities.as_ref(),
            self.membership.as_ref(),
            namespace.namespace_id,
            types,
        )
        .await?;
        Ok(graph
            .visible_roots(namespace.namespace_id, types, hide_transitive)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Reserve the next free numeric identifier for `(namespace, type)`.
    /// `None` is the registry-wide scope namespaces are numbered in.
    pub async fn allocate_free_identifier(
        &self,
        namespace: Option<NamespaceId>,
        element_type: ElementType,
    ) -> Result<String> {
        let next = self
            .identities
            .next_identifier(namespace, element_type)
            .await?;
        Ok(next.to_string())
    }

    // ── Planning ──────────────────────────────────────────────

    /// Stage a new element into `batch`, importing out-of-namespace references.
    pub async fn plan_create(
        &self,
        batch: &mut WriteBatch,
        memo: &mut ImportMemo,
        target: &ImportTarget,
        content: Content,
        status: Status,
    ) -> Result<IdentityRef> {
        let element_type = content.element_type();
        if element_type == ElementType::Namespace {
            return Err(MdrError::InvalidInput(
                "namespaces are created with create_namespace".into(),
            ));
        }
        content.validate()?;
        lifecycle::check_initial(status)?;
        lifecycle::check_containment(target.status, status)?;
        if status == Status::Released {
            let unreleased = self.unreleased_references(&content.body).await?;
            lifecycle::check_release_ready(
                element_type,
                &unreleased,
                Some((&target.urn, target.status)),
            )?;
        }

        let (body, members) = self.localize(batch, memo, &content.body, target).await?;
        let identifier = self
            .allocate_free_identifier(Some(target.namespace), element_type)
            .await?;
        let identity = NewIdentity {
            element_type,
            namespace: target.slot(),
            identifier,
            version: element_type.base_version(),
            status,
            created_by: target.actor.clone(),
        };
        Ok(content::attach(batch, identity, Content { body, ..content }, &members))
    }

    /// Rewrite the body's references to URNs living in `target`, staging imports
    /// as needed. Returns the rewritten body and the member refs in body order.
    async fn localize(
        &self,
        batch: &mut WriteBatch,
        memo: &mut ImportMemo,
        body: &ElementBody,
        target: &ImportTarget,
    ) -> Result<(ElementBody, Vec<IdentityRef>)> {
        let mut refs: HashMap<Urn, (IdentityRef, Urn)> = HashMap::new();
        for r in body.references() {
            if refs.contains_key(r) {
                continue;
            }
            let resolved = self.imports.resolve_reference(batch, memo, r, target).await?;
            refs.insert(r.clone(), resolved);
        }
        let localized = body.map_references(|u| {
            refs.get(u)
                .map(|(_, local)| local.clone())
                .ok_or_else(|| MdrError::NotFound(u.to_string()))
        })?;
        let members = body
            .members()
            .iter()
            .filter_map(|u| refs.get(u).map(|(r, _)| *r))
            .collect();
        Ok((localized, members))
    }

    /// URNs among the body's references and their transitive members that are not RELEASED.
    async fn unreleased_references(&self, body: &ElementBody) -> Result<Vec<Urn>> {
        let mut out = Vec::new();
        for r in body.references() {
            let referenced = self.resolve(r).await?;
            let urn = referenced.urn();
            if referenced.status != Status::Released && !out.contains(&urn) {
                out.push(urn);
            }
            self.collect_unreleased_below(&referenced, &mut out).await?;
        }
        Ok(out)
    }

    async fn collect_unreleased_below(&self, root: &Identity, out: &mut Vec<Urn>) -> Result<()> {
        if !root.element_type.is_composite() {
            return Ok(());
        }
        let graph = MembershipGraph::load_subtree(
            self.identities.as_ref(),
            self.membership.as_ref(),
            root,
        )
        .await?;
        for node in graph.unreleased_descendants(root.id) {
            let urn = node.urn();
            if !out.contains(&urn) {
                out.push(urn);
            }
        }
        Ok(())
    }

    /// What blocks releasing an existing identity: unreleased transitive members,
    /// plus the value domain of a data element.
    async fn unreleased_dependencies(&self, identity: &Identity) -> Result<Vec<Urn>> {
        let mut out = Vec::new();
        self.collect_unreleased_below(identity, &mut out).await?;
        if identity.element_type == ElementType::DataElement {
            let content = self.contents.load_content(identity.id).await?;
            for urn in self.unreleased_references(&content.body).await? {
                if !out.contains(&urn) {
                    out.push(urn);
                }
            }
        }
        Ok(out)
    }

    /// A namespace moving to `status` must still be able to hold what it owns.
    async fn check_owned_statuses(&self, namespace: &Identity, status: Status) -> Result<()> {
        if status.is_released_or_later() {
            return Ok(());
        }
        let owned = self
            .identities
            .list_in_namespace(namespace.namespace_id, &ElementType::all_elements())
            .await?;
        match owned.iter().find(|i| i.status.is_released_or_later()) {
            Some(element) => Err(MdrError::StatusMismatch {
                namespace: status,
                element: element.status,
            }),
            None => Ok(()),
        }
    }

    /// Live identities whose body points at `identity` outside membership edges.
    async fn referrers(&self, identity: &Identity) -> Result<Vec<Identity>> {
        if !identity.element_type.is_value_domain() {
            return Ok(Vec::new());
        }
        let urn = identity.urn();
        let candidates = self
            .identities
            .list_in_namespace(identity.namespace_id, &[ElementType::DataElement])
            .await?;
        let mut out = Vec::new();
        for candidate in candidates {
            if candidate.status == Status::Outdated {
                continue;
            }
            let content = self.contents.load_content(candidate.id).await?;
            if content.body.references().contains(&&urn) {
                out.push(candidate);
            }
        }
        Ok(out)
    }

    async fn check_no_cycle(&self, identity: &Identity, members: &[IdentityRef]) -> Result<()> {
        let mut graph = MembershipGraph::load_ancestors(
            self.identities.as_ref(),
            self.membership.as_ref(),
            identity,
        )
        .await?;
        for (ordinal, member) in members.iter().enumerate() {
            if let IdentityRef::Existing(sub) = member {
                graph.add_edge(identity.id, *sub, ordinal as i32)?;
            }
        }
        Ok(())
    }

    async fn commit_single(&self, batch: WriteBatch, target: IdentityRef) -> Result<Identity> {
        let inserted = self.writer.commit(batch).await?;
        match target {
            IdentityRef::Pending(slot) => inserted.into_iter().nth(slot).ok_or_else(|| {
                MdrError::Internal(anyhow::anyhow!("commit returned no row for slot {slot}"))
            }),
            IdentityRef::Existing(id) => self.identities.get(id).await,
        }
    }

    pub async fn commit(&self, batch: WriteBatch) -> Result<Vec<Identity>> {
        self.writer.commit(batch).await
    }

    // ── Mutations ─────────────────────────────────────────────

    /// New namespace with an identifier from the registry-wide counter.
    pub async fn create_namespace(
        &self,
        actor: &str,
        content: Content,
        status: Status,
    ) -> Result<Identity> {
        if content.element_type() != ElementType::Namespace {
            return Err(MdrError::InvalidInput(format!(
                "expected namespace content, got {}",
                content.element_type()
            )));
        }
        content.validate()?;
        lifecycle::check_initial(status)?;
        let identifier = self
            .allocate_free_identifier(None, ElementType::Namespace)
            .await?;
        let mut batch = WriteBatch::new();
        let slot = batch.insert(
            NewIdentity {
                element_type: ElementType::Namespace,
                namespace: NamespaceSlot::Create,
                identifier,
                version: ElementType::Namespace.base_version(),
                status,
                created_by: actor.to_string(),
            },
            content,
        );
        let created = self.commit_single(batch, slot).await?;
        tracing::info!(urn = %created.urn(), status = %created.status, "namespace created");
        Ok(created)
    }

    /// New element in the namespace described by `target`, at the base version.
    pub async fn create(
        &self,
        target: &ImportTarget,
        content: Content,
        status: Status,
    ) -> Result<Identity> {
        let mut batch = WriteBatch::new();
        let mut memo = ImportMemo::new();
        let slot = self
            .plan_create(&mut batch, &mut memo, target, content, status)
            .await?;
        let created = self.commit_single(batch, slot).await?;
        tracing::info!(
            urn = %created.urn(),
            status = %created.status,
            imports = memo.len(),
            "element created"
        );
        Ok(created)
    }

    /// Change the content of an identity. DRAFT/STAGED rows are overwritten in
    /// place; RELEASED rows get a new version and the old one is outdated.
    /// `status` optionally moves the result to another legal status.
    pub async fn update(
        &self,
        actor: &str,
        identity: &Identity,
        content: Content,
        status: Option<Status>,
    ) -> Result<Identity> {
        if content.element_type() != identity.element_type {
            return Err(MdrError::InvalidInput(format!(
                "cannot replace {} content with {}",
                identity.element_type,
                content.element_type()
            )));
        }
        content.validate()?;
        let mode = lifecycle::update_mode(identity.status)?;
        let new_status = status.unwrap_or(identity.status);

        let target = if identity.is_namespace() {
            ImportTarget::from_namespace(identity, actor)
        } else {
            let namespace = self.namespace_head(&identity.namespace_identifier).await?;
            ImportTarget::from_namespace(&namespace, actor)
        };

        match mode {
            UpdateMode::InPlace => {
                if new_status != identity.status {
                    lifecycle::check_transition(identity.status, new_status)?;
                }
            }
            UpdateMode::Revise => lifecycle::check_initial(new_status)?,
        }
        if identity.is_namespace() {
            self.check_owned_statuses(identity, new_status).await?;
        } else {
            lifecycle::check_containment(target.status, new_status)?;
            if new_status == Status::Released {
                let unreleased = self.unreleased_references(&content.body).await?;
                lifecycle::check_release_ready(
                    identity.element_type,
                    &unreleased,
                    Some((&target.urn, target.status)),
                )?;
            }
        }

        let mut batch = WriteBatch::new();
        let mut memo = ImportMemo::new();
        let (body, members) = self.localize(&mut batch, &mut memo, &content.body, &target).await?;
        let content = Content { body, ..content };

        let result = match mode {
            UpdateMode::InPlace => {
                self.check_no_cycle(identity, &members).await?;
                content::replace(&mut batch, identity.id, content, &members);
                if new_status != identity.status {
                    batch.set_status(identity.id, new_status);
                }
                let updated = self
                    .commit_single(batch, IdentityRef::Existing(identity.id))
                    .await?;
                tracing::info!(urn = %updated.urn(), status = %updated.status, "element updated in place");
                updated
            }
            UpdateMode::Revise => {
                let revision = NewIdentity {
                    element_type: identity.element_type,
                    namespace: NamespaceSlot::Existing {
                        id: identity.namespace_id,
                        identifier: identity.namespace_identifier.clone(),
                    },
                    identifier: identity.identifier.clone(),
                    version: identity.version + 1,
                    status: new_status,
                    created_by: actor.to_string(),
                };
                let slot = content::attach(&mut batch, revision, content, &members);
                if lifecycle::delete_action(identity.status)? == DeleteAction::Outdate {
                    batch.set_status(identity.id, Status::Outdated);
                }
                let revised = self.commit_single(batch, slot).await?;
                tracing::info!(
                    previous = %identity.urn(),
                    urn = %revised.urn(),
                    "element revised"
                );
                revised
            }
        };
        Ok(result)
    }

    /// DRAFT/STAGED: hard delete. RELEASED: outdate. OUTDATED: rejected.
    pub async fn delete(&self, identity: &Identity) -> Result<DeleteOutcome> {
        let mut batch = WriteBatch::new();
        match lifecycle::delete_action(identity.status)? {
            DeleteAction::HardDelete => {
                if identity.is_namespace() {
                    let owned = self
                        .identities
                        .list_in_namespace(identity.namespace_id, &ElementType::all_elements())
                        .await?;
                    if !owned.is_empty() {
                        return Err(MdrError::Conflict(format!(
                            "{} still owns {} element(s)",
                            identity.urn(),
                            owned.len()
                        )));
                    }
                } else {
                    let parents = self.membership.parents(&[identity.id]).await?;
                    if let Some(edge) = parents.first() {
                        let parent = self.identities.get(edge.super_id).await?;
                        return Err(MdrError::Conflict(format!(
                            "{} is a member of {}",
                            identity.urn(),
                            parent.urn()
                        )));
                    }
                    if let Some(referrer) = self.referrers(identity).await?.first() {
                        return Err(MdrError::Conflict(format!(
                            "{} is referenced by {}",
                            identity.urn(),
                            referrer.urn()
                        )));
                    }
                }
                content::detach(&mut batch, identity.id);
                self.writer.commit(batch).await?;
                tracing::info!(urn = %identity.urn(), "identity deleted");
                Ok(DeleteOutcome::Deleted(identity.urn()))
            }
            DeleteAction::Outdate => {
                batch.set_status(identity.id, Status::Outdated);
                let outdated = self
                    .commit_single(batch, IdentityRef::Existing(identity.id))
                    .await?;
                tracing::info!(urn = %outdated.urn(), "identity outdated");
                Ok(DeleteOutcome::Outdated(outdated))
            }
        }
    }

    /// DRAFT → STAGED.
    pub async fn stage(&self, identity: &Identity) -> Result<Identity> {
        lifecycle::check_transition(identity.status, Status::Staged)?;
        let mut batch = WriteBatch::new();
        batch.set_status(identity.id, Status::Staged);
        let staged = self
            .commit_single(batch, IdentityRef::Existing(identity.id))
            .await?;
        tracing::info!(urn = %staged.urn(), "identity staged");
        Ok(staged)
    }

    /// DRAFT/STAGED → RELEASED once every dependency and the namespace are released.
    pub async fn release(&self, identity: &Identity) -> Result<Identity> {
        let (unreleased, namespace) = if identity.is_namespace() {
            (Vec::new(), None)
        } else {
            let unreleased = self.unreleased_dependencies(identity).await?;
            let namespace = self.namespace_head(&identity.namespace_identifier).await?;
            (unreleased, Some(namespace))
        };
        let namespace_urn = namespace.as_ref().map(|n| n.urn());
        lifecycle::check_release(
            identity.status,
            identity.element_type,
            &unreleased,
            namespace
                .as_ref()
                .zip(namespace_urn.as_ref())
                .map(|(n, urn)| (urn, n.status)),
        )?;
        let mut batch = WriteBatch::new();
        batch.set_status(identity.id, Status::Released);
        let released = self
            .commit_single(batch, IdentityRef::Existing(identity.id))
            .await?;
        tracing::info!(urn = %released.urn(), "identity released");
        Ok(released)
    }
}
