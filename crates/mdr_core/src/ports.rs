//! Storage port traits. Implemented by `mdr_postgres` and by `in_memory`;
//! core logic depends only on these traits.
//!
//! Every mutation goes through `RegistryWriter::commit`, which applies a whole
//! `WriteBatch` atomically or not at all.

use async_trait::async_trait;
use uuid::Uuid;

use crate::content::Content;
use crate::error::MdrError;
use crate::export::ExportJob;
use crate::principal::Principal;
use crate::staging::{ImportJob, StagedElement};
use crate::types::*;
use crate::urn::Urn;

pub type Result<T> = std::result::Result<T, MdrError>;

// ── WriteBatch ────────────────────────────────────────────────

/// Reference to an identity from inside a batch: an existing row, or the
/// n-th `Insert` of the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityRef {
    Existing(IdentityId),
    Pending(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        identity: NewIdentity,
        content: Content,
    },
    ReplaceContent {
        id: IdentityId,
        content: Content,
    },
    SetStatus {
        id: IdentityId,
        status: Status,
    },
    /// Removes outgoing membership edges of `id`.
    ClearMembers {
        id: IdentityId,
    },
    /// Hard delete: row, content, every edge and relation touching it.
    Delete {
        id: IdentityId,
    },
    AddEdge {
        super_ref: IdentityRef,
        sub_ref: IdentityRef,
        ordinal: i32,
    },
    AddRelation {
        left: IdentityRef,
        right: IdentityRef,
        kind: RelationKind,
    },
}

/// Ordered list of row mutations committed in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    inserts: Vec<Urn>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: NewIdentity, content: Content) -> IdentityRef {
        let slot = self.inserts.len();
        self.inserts.push(identity.urn());
        self.ops.push(WriteOp::Insert { identity, content });
        IdentityRef::Pending(slot)
    }

    pub fn replace_content(&mut self, id: IdentityId, content: Content) {
        self.ops.push(WriteOp::ReplaceContent { id, content });
    }

    pub fn set_status(&mut self, id: IdentityId, status: Status) {
        self.ops.push(WriteOp::SetStatus { id, status });
    }

    pub fn clear_members(&mut self, id: IdentityId) {
        self.ops.push(WriteOp::ClearMembers { id });
    }

    pub fn delete(&mut self, id: IdentityId) {
        self.ops.push(WriteOp::Delete { id });
    }

    pub fn add_edge(&mut self, super_ref: IdentityRef, sub_ref: IdentityRef, ordinal: i32) {
        self.ops.push(WriteOp::AddEdge {
            super_ref,
            sub_ref,
            ordinal,
        });
    }

    pub fn add_relation(&mut self, left: IdentityRef, right: IdentityRef, kind: RelationKind) {
        self.ops.push(WriteOp::AddRelation { left, right, kind });
    }

    /// URN a pending insert will have once committed.
    pub fn pending_urn(&self, slot: usize) -> Option<&Urn> {
        self.inserts.get(slot)
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ── Registry ports ────────────────────────────────────────────

/// Read side of the identity table plus the identifier allocator.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Internal id of the namespace with this URN identifier.
    async fn find_namespace(&self, identifier: &str) -> Result<Option<NamespaceId>>;

    /// Exact `(namespace, type, identifier, version)` lookup.
    async fn find(&self, urn: &Urn) -> Result<Option<Identity>>;

    async fn get(&self, id: IdentityId) -> Result<Identity>;

    /// Missing ids are skipped.
    async fn get_many(&self, ids: &[IdentityId]) -> Result<Vec<Identity>>;

    /// All versions of one logical element, ascending by version.
    async fn versions(
        &self,
        namespace: NamespaceId,
        element_type: ElementType,
        identifier: &str,
    ) -> Result<Vec<Identity>>;

    /// Identities of the given types owned by a namespace (namespace rows excluded).
    async fn list_in_namespace(
        &self,
        namespace: NamespaceId,
        types: &[ElementType],
    ) -> Result<Vec<Identity>>;

    /// Atomically reserve the next numeric identifier for `(scope, type)`.
    /// `scope = None` is the registry-wide scope used for namespaces.
    async fn next_identifier(
        &self,
        scope: Option<NamespaceId>,
        element_type: ElementType,
    ) -> Result<i64>;
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn load_content(&self, id: IdentityId) -> Result<Content>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Outgoing edges, ordered by ordinal.
    async fn children(&self, id: IdentityId) -> Result<Vec<MembershipEdge>>;

    /// Incoming edges of every id in `ids`.
    async fn parents(&self, ids: &[IdentityId]) -> Result<Vec<MembershipEdge>>;
}

#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Relations where `id` is on either side.
    async fn relations_of(&self, id: IdentityId) -> Result<Vec<Relation>>;
}

#[async_trait]
pub trait RegistryWriter: Send + Sync {
    /// Apply the batch in one transaction. Returns the inserted identities in
    /// insert order.
    async fn commit(&self, batch: WriteBatch) -> Result<Vec<Identity>>;
}

// ── Job ports ─────────────────────────────────────────────────

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a job with its staged elements atomically.
    async fn create_import_job(&self, job: &ImportJob, elements: &[StagedElement]) -> Result<()>;

    async fn get_import_job(&self, id: Uuid) -> Result<ImportJob>;

    async fn set_import_status(&self, id: Uuid, status: JobStatus) -> Result<()>;

    async fn list_staged(&self, job_id: Uuid) -> Result<Vec<StagedElement>>;

    async fn mark_converted(
        &self,
        job_id: Uuid,
        staging_id: &str,
        identity: IdentityId,
    ) -> Result<()>;

    async fn mark_failed(&self, job_id: Uuid, staging_id: &str, error: &str) -> Result<()>;

    /// Removes the job and all of its staged rows.
    async fn delete_import_job(&self, id: Uuid) -> Result<()>;

    async fn create_export_job(&self, job: &ExportJob) -> Result<()>;

    async fn get_export_job(&self, id: Uuid) -> Result<ExportJob>;

    /// Overwrite status, location, report and error of an export job.
    async fn update_export_job(&self, job: &ExportJob) -> Result<()>;
}

// ── External collaborators ────────────────────────────────────

/// Capability check. `namespace = None` asks for a registry-wide grant.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn authorize(
        &self,
        principal: &Principal,
        namespace: Option<NamespaceId>,
        level: AccessLevel,
    ) -> Result<bool>;
}

/// Storage for serialised interchange bundles.
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn store(&self, bytes: Vec<u8>) -> Result<String>;

    async fn load(&self, location: &str) -> Result<Vec<u8>>;
}
