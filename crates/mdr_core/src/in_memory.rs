//! In-memory adapter implementing every port. Used by tests and by tooling that
//! does not need a database.
//!
//! `commit` applies a batch to a copy of the state and swaps it in only when
//! every op succeeded, which gives the same all-or-nothing behaviour as a
//! database transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::content::Content;
use crate::error::MdrError;
use crate::export::ExportJob;
use crate::ports::*;
use crate::service::RegistryServiceImpl;
use crate::staging::{ImportJob, StagedElement};
use crate::types::*;
use crate::urn::Urn;

#[derive(Debug, Clone, Default)]
struct State {
    next_identity: i64,
    next_namespace: i64,
    namespaces: HashMap<String, NamespaceId>,
    identities: BTreeMap<IdentityId, Identity>,
    contents: HashMap<IdentityId, Content>,
    edges: Vec<MembershipEdge>,
    relations: Vec<Relation>,
    counters: HashMap<(Option<NamespaceId>, ElementType), i64>,
    import_jobs: HashMap<Uuid, ImportJob>,
    staged: HashMap<Uuid, Vec<StagedElement>>,
    export_jobs: HashMap<Uuid, ExportJob>,
}

impl State {
    fn identity(&self, id: IdentityId) -> Result<&Identity> {
        self.identities
            .get(&id)
            .ok_or_else(|| MdrError::NotFound(id.to_string()))
    }

    fn find(&self, urn: &Urn) -> Option<&Identity> {
        let namespace = self.namespaces.get(&urn.namespace)?;
        self.identities.values().find(|i| {
            i.namespace_id == *namespace
                && i.element_type == urn.element_type
                && i.identifier == urn.identifier
                && i.version == urn.version
        })
    }

    fn reaches(&self, from: IdentityId, to: IdentityId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![from];
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            for e in self.edges.iter().filter(|e| e.super_id == n) {
                if !seen.contains(&e.sub_id) {
                    seen.push(e.sub_id);
                    stack.push(e.sub_id);
                }
            }
        }
        false
    }

    fn max_identifier(&self, scope: Option<NamespaceId>, element_type: ElementType) -> i64 {
        self.identities
            .values()
            .filter(|i| i.element_type == element_type)
            .filter(|i| scope.map_or(true, |ns| i.namespace_id == ns))
            .filter_map(|i| i.identifier.parse::<i64>().ok())
            .max()
            .unwrap_or(0)
    }

    fn insert(&mut self, new: NewIdentity, content: Content) -> Result<Identity> {
        let urn = new.urn();
        if self.find(&urn).is_some() {
            return Err(MdrError::Conflict(format!("{urn} already exists")));
        }
        let namespace_id = match &new.namespace {
            NamespaceSlot::Existing { id, .. } => *id,
            NamespaceSlot::Create => {
                if self.namespaces.contains_key(&new.identifier) {
                    return Err(MdrError::Conflict(format!(
                        "namespace {} already exists",
                        new.identifier
                    )));
                }
                self.next_namespace += 1;
                let id = NamespaceId(self.next_namespace);
                self.namespaces.insert(new.identifier.clone(), id);
                id
            }
        };
        self.next_identity += 1;
        let identity = Identity {
            id: IdentityId(self.next_identity),
            element_type: new.element_type,
            namespace_id,
            namespace_identifier: new.namespace_identifier().to_string(),
            identifier: new.identifier,
            version: new.version,
            status: new.status,
            uuid: Uuid::new_v4(),
            created_by: new.created_by,
            created_at: Utc::now(),
        };
        self.identities.insert(identity.id, identity.clone());
        self.contents.insert(identity.id, content);
        Ok(identity)
    }

    fn apply(&mut self, batch: WriteBatch) -> Result<Vec<Identity>> {
        let mut inserted: Vec<Identity> = Vec::new();
        let resolve = |inserted: &[Identity], r: IdentityRef| -> Result<IdentityId> {
            match r {
                IdentityRef::Existing(id) => Ok(id),
                IdentityRef::Pending(slot) => inserted
                    .get(slot)
                    .map(|i| i.id)
                    .ok_or_else(|| MdrError::Internal(anyhow::anyhow!("unknown slot {slot}"))),
            }
        };
        for op in batch.into_ops() {
            match op {
                WriteOp::Insert { identity, content } => {
                    inserted.push(self.insert(identity, content)?);
                }
                WriteOp::ReplaceContent { id, content } => {
                    self.identity(id)?;
                    self.contents.insert(id, content);
                }
                WriteOp::SetStatus { id, status } => {
                    self.identity(id)?;
                    if let Some(identity) = self.identities.get_mut(&id) {
                        identity.status = status;
                    }
                }
                WriteOp::ClearMembers { id } => self.edges.retain(|e| e.super_id != id),
                WriteOp::Delete { id } => {
                    let removed = self
                        .identities
                        .remove(&id)
                        .ok_or_else(|| MdrError::NotFound(id.to_string()))?;
                    self.contents.remove(&id);
                    self.edges.retain(|e| e.super_id != id && e.sub_id != id);
                    self.relations.retain(|r| r.left != id && r.right != id);
                    if removed.is_namespace()
                        && !self
                            .identities
                            .values()
                            .any(|i| i.is_namespace() && i.namespace_id == removed.namespace_id)
                    {
                        self.namespaces.remove(&removed.identifier);
                    }
                }
                WriteOp::AddEdge {
                    super_ref,
                    sub_ref,
                    ordinal,
                } => {
                    let super_id = resolve(&inserted, super_ref)?;
                    let sub_id = resolve(&inserted, sub_ref)?;
                    self.identity(sub_id)?;
                    if self
                        .edges
                        .iter()
                        .any(|e| e.super_id == super_id && e.sub_id == sub_id)
                    {
                        continue;
                    }
                    if self.reaches(sub_id, super_id) {
                        return Err(MdrError::CyclicMembership(format!(
                            "{super_id} -> {sub_id}"
                        )));
                    }
                    self.edges.push(MembershipEdge {
                        super_id,
                        sub_id,
                        ordinal,
                    });
                }
                WriteOp::AddRelation { left, right, kind } => {
                    self.relations.push(Relation {
                        left: resolve(&inserted, left)?,
                        right: resolve(&inserted, right)?,
                        kind,
                    });
                }
            }
        }
        Ok(inserted)
    }
}

/// Every registry and job port over one shared in-memory state.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: RwLock<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A service wired entirely to this store and an in-memory bundle store.
    pub fn service(self: &Arc<Self>) -> RegistryServiceImpl {
        RegistryServiceImpl::new(
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            Arc::new(InMemoryBundleStore::default()),
        )
    }

    pub async fn identity_count(&self) -> usize {
        self.state.read().await.identities.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.state.read().await.edges.len()
    }
}

#[async_trait]
impl IdentityStore for InMemoryRegistry {
    async fn find_namespace(&self, identifier: &str) -> Result<Option<NamespaceId>> {
        Ok(self.state.read().await.namespaces.get(identifier).copied())
    }

    async fn find(&self, urn: &Urn) -> Result<Option<Identity>> {
        Ok(self.state.read().await.find(urn).cloned())
    }

    async fn get(&self, id: IdentityId) -> Result<Identity> {
        self.state.read().await.identity(id).cloned()
    }

    async fn get_many(&self, ids: &[IdentityId]) -> Result<Vec<Identity>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.identities.get(id).cloned())
            .collect())
    }

    async fn versions(
        &self,
        namespace: NamespaceId,
        element_type: ElementType,
        identifier: &str,
    ) -> Result<Vec<Identity>> {
        let state = self.state.read().await;
        let mut versions: Vec<Identity> = state
            .identities
            .values()
            .filter(|i| {
                i.namespace_id == namespace
                    && i.element_type == element_type
                    && i.identifier == identifier
            })
            .cloned()
            .collect();
        versions.sort_by_key(|i| i.version);
        Ok(versions)
    }

    async fn list_in_namespace(
        &self,
        namespace: NamespaceId,
        types: &[ElementType],
    ) -> Result<Vec<Identity>> {
        let state = self.state.read().await;
        Ok(state
            .identities
            .values()
            .filter(|i| i.namespace_id == namespace && !i.is_namespace())
            .filter(|i| types.contains(&i.element_type))
            .cloned()
            .collect())
    }

    async fn next_identifier(
        &self,
        scope: Option<NamespaceId>,
        element_type: ElementType,
    ) -> Result<i64> {
        let mut state = self.state.write().await;
        let seeded = state.max_identifier(scope, element_type);
        let counter = state.counters.entry((scope, element_type)).or_insert(0);
        *counter = (*counter).max(seeded) + 1;
        Ok(*counter)
    }
}

#[async_trait]
impl ContentStore for InMemoryRegistry {
    async fn load_content(&self, id: IdentityId) -> Result<Content> {
        self.state
            .read()
            .await
            .contents
            .get(&id)
            .cloned()
            .ok_or_else(|| MdrError::NotFound(format!("content of {id}")))
    }
}

#[async_trait]
impl MembershipStore for InMemoryRegistry {
    async fn children(&self, id: IdentityId) -> Result<Vec<MembershipEdge>> {
        let state = self.state.read().await;
        let mut edges: Vec<MembershipEdge> = state
            .edges
            .iter()
            .filter(|e| e.super_id == id)
            .copied()
            .collect();
        edges.sort_by_key(|e| e.ordinal);
        Ok(edges)
    }

    async fn parents(&self, ids: &[IdentityId]) -> Result<Vec<MembershipEdge>> {
        let state = self.state.read().await;
        Ok(state
            .edges
            .iter()
            .filter(|e| ids.contains(&e.sub_id))
            .copied()
            .collect())
    }
}

#[async_trait]
impl RelationStore for InMemoryRegistry {
    async fn relations_of(&self, id: IdentityId) -> Result<Vec<Relation>> {
        let state = self.state.read().await;
        Ok(state
            .relations
            .iter()
            .filter(|r| r.left == id || r.right == id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RegistryWriter for InMemoryRegistry {
    async fn commit(&self, batch: WriteBatch) -> Result<Vec<Identity>> {
        let mut state = self.state.write().await;
        let mut draft = state.clone();
        let inserted = draft.apply(batch)?;
        *state = draft;
        Ok(inserted)
    }
}

#[async_trait]
impl JobStore for InMemoryRegistry {
    async fn create_import_job(&self, job: &ImportJob, elements: &[StagedElement]) -> Result<()> {
        let mut state = self.state.write().await;
        if state.import_jobs.contains_key(&job.id) {
            return Err(MdrError::Conflict(format!("import job {} exists", job.id)));
        }
        state.import_jobs.insert(job.id, job.clone());
        state.staged.insert(job.id, elements.to_vec());
        Ok(())
    }

    async fn get_import_job(&self, id: Uuid) -> Result<ImportJob> {
        self.state
            .read()
            .await
            .import_jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| MdrError::NotFound(format!("import job {id}")))
    }

    async fn set_import_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .import_jobs
            .get_mut(&id)
            .ok_or_else(|| MdrError::NotFound(format!("import job {id}")))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn list_staged(&self, job_id: Uuid) -> Result<Vec<StagedElement>> {
        let state = self.state.read().await;
        state
            .staged
            .get(&job_id)
            .cloned()
            .ok_or_else(|| MdrError::NotFound(format!("import job {job_id}")))
    }

    async fn mark_converted(
        &self,
        job_id: Uuid,
        staging_id: &str,
        identity: IdentityId,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let row = staged_row(&mut state, job_id, staging_id)?;
        row.converted = Some(identity);
        row.error = None;
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, staging_id: &str, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        staged_row(&mut state, job_id, staging_id)?.error = Some(error.to_string());
        Ok(())
    }

    async fn delete_import_job(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .import_jobs
            .remove(&id)
            .ok_or_else(|| MdrError::NotFound(format!("import job {id}")))?;
        state.staged.remove(&id);
        Ok(())
    }

    async fn create_export_job(&self, job: &ExportJob) -> Result<()> {
        self.state
            .write()
            .await
            .export_jobs
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn get_export_job(&self, id: Uuid) -> Result<ExportJob> {
        self.state
            .read()
            .await
            .export_jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| MdrError::NotFound(format!("export job {id}")))
    }

    async fn update_export_job(&self, job: &ExportJob) -> Result<()> {
        let mut state = self.state.write().await;
        match state.export_jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(MdrError::NotFound(format!("export job {}", job.id))),
        }
    }
}

fn staged_row<'a>(
    state: &'a mut State,
    job_id: Uuid,
    staging_id: &str,
) -> Result<&'a mut StagedElement> {
    state
        .staged
        .get_mut(&job_id)
        .and_then(|rows| rows.iter_mut().find(|r| r.staging_id == staging_id))
        .ok_or_else(|| MdrError::NotFound(format!("staged element {staging_id} of {job_id}")))
}

/// Bundle store keeping bytes in a map under `memory://<uuid>` locations.
#[derive(Debug, Default)]
pub struct InMemoryBundleStore {
    bundles: RwLock<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl BundleStore for InMemoryBundleStore {
    async fn store(&self, bytes: Vec<u8>) -> Result<String> {
        let location = format!("memory://{}", Uuid::new_v4());
        self.bundles
            .write()
            .await
            .insert(location.clone(), bytes);
        Ok(location)
    }

    async fn load(&self, location: &str) -> Result<Vec<u8>> {
        self.bundles
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| MdrError::NotFound(format!("bundle {location}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ElementBody;

    fn namespace(identifier: &str) -> NewIdentity {
        NewIdentity {
            element_type: ElementType::Namespace,
            namespace: NamespaceSlot::Create,
            identifier: identifier.into(),
            version: 1,
            status: Status::Draft,
            created_by: "t".into(),
        }
    }

    fn ns_content() -> Content {
        Content::new(ElementBody::Namespace { hidden: false }).with_definition("en", "ns", "")
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_trace() {
        let store = InMemoryRegistry::new();
        let mut batch = WriteBatch::new();
        batch.insert(namespace("1"), ns_content());
        batch.set_status(IdentityId(999), Status::Released);
        assert!(store.commit(batch).await.is_err());
        assert_eq!(store.identity_count().await, 0);
        assert_eq!(store.find_namespace("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_urn_is_a_conflict() {
        let store = InMemoryRegistry::new();
        let mut batch = WriteBatch::new();
        batch.insert(namespace("1"), ns_content());
        store.commit(batch).await.unwrap();

        let mut again = WriteBatch::new();
        again.insert(namespace("1"), ns_content());
        assert!(matches!(
            store.commit(again).await,
            Err(MdrError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn counter_is_seeded_from_existing_identifiers() {
        let store = InMemoryRegistry::new();
        let mut batch = WriteBatch::new();
        batch.insert(namespace("41"), ns_content());
        store.commit(batch).await.unwrap();
        assert_eq!(
            store.next_identifier(None, ElementType::Namespace).await.unwrap(),
            42
        );
        assert_eq!(
            store.next_identifier(None, ElementType::Namespace).await.unwrap(),
            43
        );
        let ns = store.find_namespace("41").await.unwrap().unwrap();
        assert_eq!(
            store
                .next_identifier(Some(ns), ElementType::Record)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn edges_reject_cycles_within_a_batch() {
        let store = InMemoryRegistry::new();
        let mut batch = WriteBatch::new();
        let a = batch.insert(namespace("1"), ns_content());
        let b = batch.insert(namespace("2"), ns_content());
        batch.add_edge(a, b, 0);
        batch.add_edge(b, a, 0);
        assert!(matches!(
            store.commit(batch).await,
            Err(MdrError::CyclicMembership(_))
        ));
        assert_eq!(store.edge_count().await, 0);
    }
}
