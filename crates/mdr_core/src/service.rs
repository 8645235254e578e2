//! RegistryService: the single entry point the CLI (and any transport) calls.
//!
//! Takes port traits via `Arc<dyn PortTrait>` so the same logic runs against
//! Postgres or the in-memory adapter. Every method takes `&Principal`
//! explicitly; writes require `Write`, reads require `Read` on the namespace.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::RoleAccessControl;
use crate::content::Content;
use crate::error::MdrError;
use crate::export::{ExportBundle, ExportJob, ExportOutcome};
use crate::import_resolver::{ImportMemo, ImportTarget};
use crate::ports::{
    AccessControl, BundleStore, ContentStore, IdentityRef, IdentityStore, JobStore,
    MembershipStore, RegistryWriter, RelationStore, Result, WriteBatch,
};
use crate::jobs::JobRunner;
use crate::principal::Principal;
use crate::registry::{DeleteOutcome, IdentityRegistry};
use crate::staging::{
    ConversionReport, ImportJob, ImportReport, StagedElement, StagedElementPayload,
};
use crate::types::*;
use crate::urn::Urn;

/// An identity with its content and the designation picked by language preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementView {
    pub urn: Urn,
    pub identity: Identity,
    pub designation: Option<String>,
    pub content: Content,
}

// ── RegistryService trait ─────────────────────────────────────

#[async_trait]
pub trait RegistryService: Send + Sync {
    /// Create a namespace; needs a registry-wide `Write` grant.
    async fn create_namespace(
        &self,
        principal: &Principal,
        content: Content,
        status: Status,
    ) -> Result<Identity>;

    /// Create an element in `namespace` at the base version.
    async fn create_element(
        &self,
        principal: &Principal,
        namespace: &Urn,
        content: Content,
        status: Status,
    ) -> Result<Identity>;

    /// Replace content in place (DRAFT/STAGED) or revise (RELEASED).
    async fn update_element(
        &self,
        principal: &Principal,
        urn: &Urn,
        content: Content,
        status: Option<Status>,
    ) -> Result<Identity>;

    async fn delete_element(&self, principal: &Principal, urn: &Urn) -> Result<DeleteOutcome>;

    async fn release_element(&self, principal: &Principal, urn: &Urn) -> Result<Identity>;

    async fn stage_element(&self, principal: &Principal, urn: &Urn) -> Result<Identity>;

    async fn resolve(&self, principal: &Principal, urn: &Urn) -> Result<Identity>;

    async fn resolve_latest(&self, principal: &Principal, urn: &Urn) -> Result<Identity>;

    async fn history(&self, principal: &Principal, urn: &Urn) -> Result<Vec<Identity>>;

    /// Identity, content and preferred designation.
    async fn describe(&self, principal: &Principal, urn: &Urn) -> Result<ElementView>;

    async fn members(&self, principal: &Principal, urn: &Urn) -> Result<Vec<Identity>>;

    /// Provenance and concept relations touching the identity.
    async fn relations(&self, principal: &Principal, urn: &Urn) -> Result<Vec<Relation>>;

    async fn visible_roots(
        &self,
        principal: &Principal,
        namespace: &Urn,
        types: &[ElementType],
        hide_transitive: bool,
    ) -> Result<Vec<Identity>>;

    /// Copy `source` into `namespace` under a new identifier.
    async fn import_element(
        &self,
        principal: &Principal,
        source: &Urn,
        namespace: &Urn,
    ) -> Result<Identity>;

    /// Persist an import job and start converting it in the background.
    async fn submit_import(
        &self,
        principal: &Principal,
        namespace: &Urn,
        payloads: Vec<StagedElementPayload>,
    ) -> Result<Uuid>;

    /// Convert selected staged elements of a job now.
    async fn convert_staged(
        &self,
        principal: &Principal,
        job_id: Uuid,
        staging_ids: &[String],
    ) -> Result<ConversionReport>;

    async fn convert_all(&self, principal: &Principal, job_id: Uuid) -> Result<ConversionReport>;

    async fn import_status(&self, principal: &Principal, job_id: Uuid) -> Result<ImportReport>;

    async fn delete_import(&self, principal: &Principal, job_id: Uuid) -> Result<()>;

    /// Persist an export job and assemble its bundle in the background.
    async fn submit_export(
        &self,
        principal: &Principal,
        roots: &[Urn],
        full_export: bool,
    ) -> Result<Uuid>;

    async fn export_status(&self, principal: &Principal, job_id: Uuid) -> Result<ExportJob>;

    /// Compute an export closure synchronously.
    async fn export_closure(
        &self,
        principal: &Principal,
        roots: &[Urn],
        full_export: bool,
    ) -> Result<ExportOutcome>;

    /// Read a stored bundle back as staged payloads.
    async fn load_bundle(
        &self,
        principal: &Principal,
        location: &str,
    ) -> Result<Vec<StagedElementPayload>>;
}

// ── CoreServiceImpl-style implementation ──────────────────────

pub struct RegistryServiceImpl {
    pub registry: IdentityRegistry,
    pub relations: Arc<dyn RelationStore>,
    pub jobs: Arc<dyn JobStore>,
    pub bundles: Arc<dyn BundleStore>,
    pub access: Arc<dyn AccessControl>,
    pub runner: JobRunner,
    pub settings: RegistrySettings,
}

impl RegistryServiceImpl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        contents: Arc<dyn ContentStore>,
        membership: Arc<dyn MembershipStore>,
        relations: Arc<dyn RelationStore>,
        writer: Arc<dyn RegistryWriter>,
        jobs: Arc<dyn JobStore>,
        bundles: Arc<dyn BundleStore>,
    ) -> Self {
        let registry = IdentityRegistry::new(identities, contents, membership, writer);
        let runner = JobRunner::new(registry.clone(), jobs.clone(), bundles.clone());
        Self {
            registry,
            relations,
            jobs,
            bundles,
            access: Arc::new(RoleAccessControl::new()),
            runner,
            settings: RegistrySettings::default(),
        }
    }

    /// Set the access control port (builder pattern).
    pub fn with_access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn with_settings(mut self, settings: RegistrySettings) -> Self {
        self.settings = settings;
        self
    }

    async fn require(
        &self,
        principal: &Principal,
        namespace: Option<NamespaceId>,
        level: AccessLevel,
    ) -> Result<()> {
        if self.access.authorize(principal, namespace, level).await? {
            Ok(())
        } else {
            let scope = namespace.map_or_else(|| "registry".to_string(), |ns| ns.to_string());
            Err(MdrError::Unauthorized(format!(
                "{} lacks {level:?} access on {scope}",
                principal.actor_id
            )))
        }
    }

    /// Resolve and check access in one step.
    async fn authorized(
        &self,
        principal: &Principal,
        urn: &Urn,
        level: AccessLevel,
    ) -> Result<Identity> {
        let identity = self.registry.resolve(urn).await?;
        self.require(principal, Some(identity.namespace_id), level)
            .await?;
        Ok(identity)
    }

    async fn namespace_target(
        &self,
        principal: &Principal,
        namespace: &Urn,
        level: AccessLevel,
    ) -> Result<ImportTarget> {
        if !namespace.is_namespace() {
            return Err(MdrError::InvalidInput(format!(
                "{namespace} is not a namespace urn"
            )));
        }
        let head = self.registry.namespace_head(&namespace.identifier).await?;
        self.require(principal, Some(head.namespace_id), level)
            .await?;
        Ok(ImportTarget::from_namespace(&head, principal.actor_id.clone()))
    }

    async fn import_job(&self, principal: &Principal, job_id: Uuid) -> Result<ImportJob> {
        let job = self.jobs.get_import_job(job_id).await?;
        self.namespace_target(principal, &job.target_namespace, AccessLevel::Write)
            .await?;
        Ok(job)
    }
}

#[async_trait]
impl RegistryService for RegistryServiceImpl {
    async fn create_namespace(
        &self,
        principal: &Principal,
        content: Content,
        status: Status,
    ) -> Result<Identity> {
        self.require(principal, None, AccessLevel::Write).await?;
        self.registry
            .create_namespace(&principal.actor_id, content, status)
            .await
    }

    async fn create_element(
        &self,
        principal: &Principal,
        namespace: &Urn,
        content: Content,
        status: Status,
    ) -> Result<Identity> {
        let target = self
            .namespace_target(principal, namespace, AccessLevel::Write)
            .await?;
        self.registry.create(&target, content, status).await
    }

    async fn update_element(
        &self,
        principal: &Principal,
        urn: &Urn,
        content: Content,
        status: Option<Status>,
    ) -> Result<Identity> {
        let identity = self.authorized(principal, urn, AccessLevel::Write).await?;
        self.registry
            .update(&principal.actor_id, &identity, content, status)
            .await
    }

    async fn delete_element(&self, principal: &Principal, urn: &Urn) -> Result<DeleteOutcome> {
        let identity = self.authorized(principal, urn, AccessLevel::Write).await?;
        self.registry.delete(&identity).await
    }

    async fn release_element(&self, principal: &Principal, urn: &Urn) -> Result<Identity> {
        let identity = self.authorized(principal, urn, AccessLevel::Write).await?;
        self.registry.release(&identity).await
    }

    async fn stage_element(&self, principal: &Principal, urn: &Urn) -> Result<Identity> {
        let identity = self.authorized(principal, urn, AccessLevel::Write).await?;
        self.registry.stage(&identity).await
    }

    async fn resolve(&self, principal: &Principal, urn: &Urn) -> Result<Identity> {
        self.authorized(principal, urn, AccessLevel::Read).await
    }

    async fn resolve_latest(&self, principal: &Principal, urn: &Urn) -> Result<Identity> {
        let latest = self.registry.resolve_latest(urn).await?;
        self.require(principal, Some(latest.namespace_id), AccessLevel::Read)
            .await?;
        Ok(latest)
    }

    async fn history(&self, principal: &Principal, urn: &Urn) -> Result<Vec<Identity>> {
        let versions = self.registry.history(urn).await?;
        if let Some(first) = versions.first() {
            self.require(principal, Some(first.namespace_id), AccessLevel::Read)
                .await?;
        }
        Ok(versions)
    }

    async fn describe(&self, principal: &Principal, urn: &Urn) -> Result<ElementView> {
        let identity = self.authorized(principal, urn, AccessLevel::Read).await?;
        let content = self.registry.content(identity.id).await?;
        let designation = content
            .definition_for(&self.settings.default_languages)
            .map(|d| d.designation.clone());
        Ok(ElementView {
            urn: identity.urn(),
            identity,
            designation,
            content,
        })
    }

    async fn members(&self, principal: &Principal, urn: &Urn) -> Result<Vec<Identity>> {
        let identity = self.authorized(principal, urn, AccessLevel::Read).await?;
        self.registry.members(&identity).await
    }

    async fn relations(&self, principal: &Principal, urn: &Urn) -> Result<Vec<Relation>> {
        let identity = self.authorized(principal, urn, AccessLevel::Read).await?;
        self.relations.relations_of(identity.id).await
    }

    async fn visible_roots(
        &self,
        principal: &Principal,
        namespace: &Urn,
        types: &[ElementType],
        hide_transitive: bool,
    ) -> Result<Vec<Identity>> {
        let head = self.authorized(principal, namespace, AccessLevel::Read).await?;
        if !head.is_namespace() {
            return Err(MdrError::InvalidInput(format!(
                "{namespace} is not a namespace urn"
            )));
        }
        self.registry
            .visible_roots(&head, types, hide_transitive)
            .await
    }

    async fn import_element(
        &self,
        principal: &Principal,
        source: &Urn,
        namespace: &Urn,
    ) -> Result<Identity> {
        let source = self.authorized(principal, source, AccessLevel::Read).await?;
        let target = self
            .namespace_target(principal, namespace, AccessLevel::Write)
            .await?;
        let mut batch = WriteBatch::new();
        let mut memo = ImportMemo::new();
        let (slot, _) = self
            .registry
            .imports()
            .import_into(&mut batch, &mut memo, &source, &target)
            .await?;
        let imported = match slot {
            IdentityRef::Existing(_) => source.clone(),
            IdentityRef::Pending(n) => self
                .registry
                .commit(batch)
                .await?
                .into_iter()
                .nth(n)
                .ok_or_else(|| MdrError::Internal(anyhow::anyhow!("import returned no row")))?,
        };
        tracing::info!(
            source = %source.urn(),
            urn = %imported.urn(),
            copies = memo.len(),
            "element imported"
        );
        Ok(imported)
    }

    async fn submit_import(
        &self,
        principal: &Principal,
        namespace: &Urn,
        payloads: Vec<StagedElementPayload>,
    ) -> Result<Uuid> {
        let target = self
            .namespace_target(principal, namespace, AccessLevel::Write)
            .await?;
        if payloads.is_empty() {
            return Err(MdrError::InvalidInput("import has no elements".into()));
        }
        let job = ImportJob::new(target.urn.clone(), principal.actor_id.clone());
        let mut rows: Vec<StagedElement> = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let row = StagedElement::new(job.id, payload)?;
            if rows.iter().any(|r| r.staging_id == row.staging_id) {
                return Err(MdrError::InvalidInput(format!(
                    "duplicate staging id {}",
                    row.staging_id
                )));
            }
            rows.push(row);
        }
        self.jobs.create_import_job(&job, &rows).await?;
        tracing::info!(job_id = %job.id, namespace = %target.urn, elements = rows.len(), "import submitted");
        self.runner.spawn_import(job.id);
        Ok(job.id)
    }

    async fn convert_staged(
        &self,
        principal: &Principal,
        job_id: Uuid,
        staging_ids: &[String],
    ) -> Result<ConversionReport> {
        self.import_job(principal, job_id).await?;
        self.runner.pipeline().convert(job_id, staging_ids).await
    }

    async fn convert_all(&self, principal: &Principal, job_id: Uuid) -> Result<ConversionReport> {
        self.import_job(principal, job_id).await?;
        self.runner.pipeline().convert_all(job_id).await
    }

    async fn import_status(&self, principal: &Principal, job_id: Uuid) -> Result<ImportReport> {
        let job = self.import_job(principal, job_id).await?;
        let rows = self.jobs.list_staged(job_id).await?;
        Ok(ImportReport::new(job, &rows))
    }

    async fn delete_import(&self, principal: &Principal, job_id: Uuid) -> Result<()> {
        self.import_job(principal, job_id).await?;
        let pipeline = self.runner.pipeline();
        let _guard = pipeline.locks().acquire(job_id).await;
        self.jobs.delete_import_job(job_id).await?;
        pipeline.locks().forget(job_id).await;
        tracing::info!(job_id = %job_id, "import job deleted");
        Ok(())
    }

    async fn submit_export(
        &self,
        principal: &Principal,
        roots: &[Urn],
        full_export: bool,
    ) -> Result<Uuid> {
        if roots.is_empty() {
            return Err(MdrError::InvalidInput("export needs at least one root".into()));
        }
        for root in roots {
            self.authorized(principal, root, AccessLevel::Read).await?;
        }
        let job = ExportJob::new(principal.actor_id.clone(), roots.to_vec(), full_export);
        self.jobs.create_export_job(&job).await?;
        let job_id = job.id;
        self.runner.spawn_export(job);
        Ok(job_id)
    }

    async fn export_status(&self, principal: &Principal, job_id: Uuid) -> Result<ExportJob> {
        let job = self.jobs.get_export_job(job_id).await?;
        if job.created_by != principal.actor_id {
            principal.require_admin()?;
        }
        Ok(job)
    }

    async fn export_closure(
        &self,
        principal: &Principal,
        roots: &[Urn],
        full_export: bool,
    ) -> Result<ExportOutcome> {
        let mut identities = Vec::with_capacity(roots.len());
        for root in roots {
            identities.push(self.authorized(principal, root, AccessLevel::Read).await?);
        }
        self.runner.exports().export(&identities, full_export).await
    }

    async fn load_bundle(
        &self,
        principal: &Principal,
        location: &str,
    ) -> Result<Vec<StagedElementPayload>> {
        self.require(principal, None, AccessLevel::Read).await?;
        let bytes = self.bundles.load(location).await?;
        Ok(ExportBundle::decode(&bytes)?.elements)
    }
}
