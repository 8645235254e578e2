//! StagingPipeline: converts staged elements of an import job into identities.
//!
//! Conversion is dependency-driven: before an element is materialised, every
//! staged element it references is converted first. The walk is an explicit
//! stack of Enter/Exit frames over a memo keyed by staging id. The memo is
//! seeded from rows already converted, so re-running a job resumes it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::MdrError;
use crate::import_resolver::{ImportMemo, ImportTarget};
use crate::ports::{IdentityRef, JobStore, Result, WriteBatch};
use crate::registry::IdentityRegistry;
use crate::staging::{StagedElement, Unconvertable};
use crate::types::{ElementType, Identity, IdentityId, JobStatus, Status};
use crate::urn::Urn;

/// Per-job async locks; conversions of the same job run one at a time.
#[derive(Debug, Clone, Default)]
pub struct JobLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl JobLocks {
    pub async fn acquire(&self, job_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(job_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn forget(&self, job_id: Uuid) {
        self.inner.lock().await.remove(&job_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedItem {
    pub staging_id: String,
    pub urn: Urn,
}

/// Outcome of one conversion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReport {
    pub converted: Vec<ConvertedItem>,
    pub unconvertable: Vec<Unconvertable>,
}

enum Frame {
    Enter(String),
    Exit(String),
}

/// State of one run over one job.
struct Run {
    job_id: Uuid,
    target: ImportTarget,
    staged: HashMap<String, StagedElement>,
    memo: HashMap<String, Urn>,
    failed: HashSet<String>,
    report: ConversionReport,
}

#[derive(Clone)]
pub struct StagingPipeline {
    registry: IdentityRegistry,
    jobs: Arc<dyn JobStore>,
    locks: JobLocks,
}

impl StagingPipeline {
    pub fn new(registry: IdentityRegistry, jobs: Arc<dyn JobStore>) -> Self {
        Self {
            registry,
            jobs,
            locks: JobLocks::default(),
        }
    }

    pub fn locks(&self) -> &JobLocks {
        &self.locks
    }

    /// Convert the given staged elements (and whatever they depend on).
    pub async fn convert(&self, job_id: Uuid, staging_ids: &[String]) -> Result<ConversionReport> {
        let _guard = self.locks.acquire(job_id).await;
        let mut run = self.start(job_id).await?;
        for id in staging_ids {
            self.walk(&mut run, id).await?;
        }
        tracing::debug!(
            job_id = %job_id,
            converted = run.report.converted.len(),
            failed = run.report.unconvertable.len(),
            "conversion run finished"
        );
        Ok(run.report)
    }

    /// Convert everything still unconverted, leaves first, then mark the job
    /// DONE. A fatal error marks it ABORTED.
    pub async fn convert_all(&self, job_id: Uuid) -> Result<ConversionReport> {
        let outcome = self.convert_pending(job_id).await;
        let status = match &outcome {
            Ok(_) => JobStatus::Done,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "import job aborted");
                JobStatus::Aborted
            }
        };
        self.jobs.set_import_status(job_id, status).await?;
        outcome
    }

    async fn convert_pending(&self, job_id: Uuid) -> Result<ConversionReport> {
        let mut pending: Vec<StagedElement> = self
            .jobs
            .list_staged(job_id)
            .await?
            .into_iter()
            .filter(|row| row.converted.is_none())
            .collect();
        pending.sort_by(|a, b| {
            (a.element_type.conversion_priority(), &a.staging_id)
                .cmp(&(b.element_type.conversion_priority(), &b.staging_id))
        });
        let ids: Vec<String> = pending.into_iter().map(|row| row.staging_id).collect();
        self.convert(job_id, &ids).await
    }

    async fn start(&self, job_id: Uuid) -> Result<Run> {
        let job = self.jobs.get_import_job(job_id).await?;
        let namespace = self
            .registry
            .namespace_head(&job.target_namespace.identifier)
            .await?;
        let target = ImportTarget::from_namespace(&namespace, job.created_by.clone());

        let rows = self.jobs.list_staged(job_id).await?;
        let converted_ids: Vec<IdentityId> = rows.iter().filter_map(|r| r.converted).collect();
        let urns: HashMap<IdentityId, Urn> = self
            .registry
            .identities()
            .get_many(&converted_ids)
            .await?
            .into_iter()
            .map(|i| (i.id, i.urn()))
            .collect();
        let memo = rows
            .iter()
            .filter_map(|r| {
                let urn = urns.get(&r.converted?)?;
                Some((r.staging_id.clone(), urn.clone()))
            })
            .collect();
        let staged = rows
            .into_iter()
            .map(|r| (r.staging_id.clone(), r))
            .collect();

        Ok(Run {
            job_id,
            target,
            staged,
            memo,
            failed: HashSet::new(),
            report: ConversionReport::default(),
        })
    }

    async fn walk(&self, run: &mut Run, root: &str) -> Result<()> {
        let mut in_progress: HashSet<String> = HashSet::new();
        let mut stack = vec![Frame::Enter(root.to_string())];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    if run.memo.contains_key(&id) || run.failed.contains(&id) {
                        continue;
                    }
                    if !run.staged.contains_key(&id) {
                        let cause = MdrError::NotFound(format!("staged element {id}"));
                        self.fail(run, &id, cause).await?;
                        continue;
                    }
                    if !in_progress.insert(id.clone()) {
                        let cause = MdrError::CyclicMembership(format!("{id} depends on itself"));
                        self.fail(run, &id, cause).await?;
                        continue;
                    }
                    let deps: Vec<String> = run
                        .staged
                        .get(&id)
                        .map(|row| row.payload.dependencies())
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|d| run.staged.contains_key(*d) && !run.memo.contains_key(*d))
                        .map(str::to_string)
                        .collect();
                    stack.push(Frame::Exit(id));
                    stack.extend(deps.into_iter().rev().map(Frame::Enter));
                }
                Frame::Exit(id) => {
                    in_progress.remove(&id);
                    if run.memo.contains_key(&id) || run.failed.contains(&id) {
                        continue;
                    }
                    match self.convert_one(run, &id).await {
                        Ok(identity) => {
                            self.jobs
                                .mark_converted(run.job_id, &id, identity.id)
                                .await?;
                            tracing::debug!(job_id = %run.job_id, staging_id = %id, urn = %identity.urn(), "staged element converted");
                            let urn = identity.urn();
                            run.memo.insert(id.clone(), urn.clone());
                            run.report.converted.push(ConvertedItem {
                                staging_id: id,
                                urn,
                            });
                        }
                        Err(e @ MdrError::Internal(_)) => return Err(e),
                        Err(e) => self.fail(run, &id, e).await?,
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail(&self, run: &mut Run, staging_id: &str, cause: MdrError) -> Result<()> {
        tracing::warn!(job_id = %run.job_id, staging_id, error = %cause, "staged element not convertable");
        let item = Unconvertable::new(staging_id, &cause);
        if run.staged.contains_key(staging_id) {
            self.jobs
                .mark_failed(run.job_id, staging_id, &item.to_row_error())
                .await?;
        }
        run.failed.insert(staging_id.to_string());
        run.report.unconvertable.push(item);
        Ok(())
    }

    async fn convert_one(&self, run: &Run, staging_id: &str) -> Result<Identity> {
        let row = run
            .staged
            .get(staging_id)
            .ok_or_else(|| MdrError::NotFound(format!("staged element {staging_id}")))?;

        if row.element_type == ElementType::Namespace {
            return self.registry.resolve(&run.target.urn).await;
        }

        let content = row.payload.to_content(|reference| {
            if run.staged.contains_key(reference) {
                run.memo
                    .get(reference)
                    .cloned()
                    .ok_or_else(|| MdrError::ConversionFailed {
                        staging_id: staging_id.to_string(),
                        reason: format!("dependency {reference} was not converted"),
                    })
            } else {
                Urn::parse(reference)
            }
        })?;

        let mut batch = WriteBatch::new();
        let mut imports = ImportMemo::new();
        let slot = self
            .registry
            .plan_create(&mut batch, &mut imports, &run.target, content, Status::Draft)
            .await?;
        let inserted = self.registry.commit(batch).await?;
        match slot {
            IdentityRef::Pending(n) => inserted.into_iter().nth(n).ok_or_else(|| {
                MdrError::Internal(anyhow::anyhow!("commit returned no row for {staging_id}"))
            }),
            IdentityRef::Existing(id) => self.registry.identities().get(id).await,
        }
    }
}
