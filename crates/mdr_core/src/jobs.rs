//! JobRunner: runs import and export jobs as tokio background tasks.
//!
//! Callers get the job id back immediately; the persisted job record is the
//! only channel through which progress and outcome are observed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::export::{ExportAssembler, ExportBundle, ExportJob};
use crate::ports::{BundleStore, JobStore, Result};
use crate::registry::IdentityRegistry;
use crate::staging::{ConversionReport, StagingPipeline};
use crate::urn::Urn;

#[derive(Clone)]
pub struct JobRunner {
    registry: IdentityRegistry,
    pipeline: StagingPipeline,
    exports: ExportAssembler,
    jobs: Arc<dyn JobStore>,
    bundles: Arc<dyn BundleStore>,
}

impl JobRunner {
    pub fn new(
        registry: IdentityRegistry,
        jobs: Arc<dyn JobStore>,
        bundles: Arc<dyn BundleStore>,
    ) -> Self {
        Self {
            pipeline: StagingPipeline::new(registry.clone(), jobs.clone()),
            exports: ExportAssembler::new(registry.clone()),
            registry,
            jobs,
            bundles,
        }
    }

    pub fn pipeline(&self) -> &StagingPipeline {
        &self.pipeline
    }

    pub fn exports(&self) -> &ExportAssembler {
        &self.exports
    }

    /// Convert a whole import job in the background.
    pub fn spawn_import(&self, job_id: Uuid) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run_import(job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "import job failed");
            }
        })
    }

    pub async fn run_import(&self, job_id: Uuid) -> Result<ConversionReport> {
        tracing::info!(job_id = %job_id, "import job started");
        let report = self.pipeline.convert_all(job_id).await?;
        tracing::info!(
            job_id = %job_id,
            converted = report.converted.len(),
            unconvertable = report.unconvertable.len(),
            "import job done"
        );
        Ok(report)
    }

    /// Assemble and store an export bundle in the background.
    pub fn spawn_export(&self, job: ExportJob) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            let job_id = job.id;
            if let Err(e) = runner.run_export(job).await {
                tracing::error!(job_id = %job_id, error = %e, "export job failed");
            }
        })
    }

    /// Run an export to completion and persist the final job record.
    pub async fn run_export(&self, mut job: ExportJob) -> Result<ExportJob> {
        tracing::info!(job_id = %job.id, roots = job.roots.len(), full = job.full_export, "export job started");
        match self.assemble(&job).await {
            Ok((location, non_exportable)) => {
                job.finish(location, non_exportable);
                tracing::info!(
                    job_id = %job.id,
                    location = job.location.as_deref().unwrap_or_default(),
                    non_exportable = job.non_exportable.len(),
                    "export job done"
                );
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "export job aborted");
                job.abort(&e);
            }
        }
        self.jobs.update_export_job(&job).await?;
        Ok(job)
    }

    async fn assemble(&self, job: &ExportJob) -> Result<(String, Vec<Urn>)> {
        let mut roots = Vec::with_capacity(job.roots.len());
        for urn in &job.roots {
            roots.push(self.registry.resolve(urn).await?);
        }
        let outcome = self.exports.export(&roots, job.full_export).await?;
        let bytes = ExportBundle::encode(&outcome)?;
        let location = self.bundles.store(bytes).await?;
        Ok((location, outcome.non_exportable))
    }
}
