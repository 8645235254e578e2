//! Import and export job records.

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use mdr_core::error::MdrError;
use mdr_core::export::ExportJob;
use mdr_core::ports::{JobStore, Result};
use mdr_core::staging::{ImportJob, StagedElement};
use mdr_core::types::{IdentityId, JobStatus};

use crate::rows::{ExportJobRow, ImportJobRow, StagedRow};
use crate::store::db_error;

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn update_staged(
        &self,
        job_id: Uuid,
        staging_id: &str,
        converted: Option<IdentityId>,
        error: Option<&str>,
    ) -> Result<()> {
        let done = sqlx::query(
            "UPDATE mdr.staged_elements SET converted = $3, error = $4 \
             WHERE job_id = $1 AND staging_id = $2",
        )
        .bind(job_id)
        .bind(staging_id)
        .bind(converted.map(|id| id.0))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        if done.rows_affected() == 0 {
            return Err(MdrError::NotFound(format!(
                "staged element {staging_id} of {job_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_import_job(&self, job: &ImportJob, elements: &[StagedElement]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        sqlx::query(
            r#"
            INSERT INTO mdr.import_jobs
                (id, target_namespace, status, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id)
        .bind(job.target_namespace.to_string())
        .bind(job.status.as_ref())
        .bind(&job.created_by)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error(e, || format!("import job {}", job.id)))?;

        for (position, row) in elements.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO mdr.staged_elements
                    (job_id, staging_id, element_type, payload, converted, error, position)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(job.id)
            .bind(&row.staging_id)
            .bind(row.element_type.as_ref())
            .bind(Json(&row.payload))
            .bind(row.converted.map(|id| id.0))
            .bind(row.error.as_deref())
            .bind(position as i32)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error(e, || format!("staged element {}", row.staging_id)))?;
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn get_import_job(&self, id: Uuid) -> Result<ImportJob> {
        let row = sqlx::query_as::<_, ImportJobRow>(
            "SELECT id, target_namespace, status, created_by, created_at, updated_at \
             FROM mdr.import_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.ok_or_else(|| MdrError::NotFound(format!("import job {id}")))?
            .try_into()
    }

    async fn set_import_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        let done = sqlx::query(
            "UPDATE mdr.import_jobs SET status = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_ref())
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        if done.rows_affected() == 0 {
            return Err(MdrError::NotFound(format!("import job {id}")));
        }
        Ok(())
    }

    async fn list_staged(&self, job_id: Uuid) -> Result<Vec<StagedElement>> {
        let rows = sqlx::query_as::<_, StagedRow>(
            "SELECT job_id, staging_id, element_type, payload, converted, error \
             FROM mdr.staged_elements WHERE job_id = $1 ORDER BY position",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        if rows.is_empty() {
            // Distinguish an unknown job from an empty one.
            self.get_import_job(job_id).await?;
        }
        rows.into_iter().map(StagedElement::try_from).collect()
    }

    async fn mark_converted(
        &self,
        job_id: Uuid,
        staging_id: &str,
        identity: IdentityId,
    ) -> Result<()> {
        self.update_staged(job_id, staging_id, Some(identity), None)
            .await
    }

    async fn mark_failed(&self, job_id: Uuid, staging_id: &str, error: &str) -> Result<()> {
        self.update_staged(job_id, staging_id, None, Some(error))
            .await
    }

    async fn delete_import_job(&self, id: Uuid) -> Result<()> {
        let done = sqlx::query("DELETE FROM mdr.import_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        if done.rows_affected() == 0 {
            return Err(MdrError::NotFound(format!("import job {id}")));
        }
        Ok(())
    }

    async fn create_export_job(&self, job: &ExportJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mdr.export_jobs
                (id, status, created_by, full_export, roots, location, non_exportable,
                 error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_ref())
        .bind(&job.created_by)
        .bind(job.full_export)
        .bind(Json(&job.roots))
        .bind(job.location.as_deref())
        .bind(Json(&job.non_exportable))
        .bind(job.error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error(e, || format!("export job {}", job.id)))?;
        Ok(())
    }

    async fn get_export_job(&self, id: Uuid) -> Result<ExportJob> {
        let row = sqlx::query_as::<_, ExportJobRow>(
            "SELECT id, status, created_by, full_export, roots, location, non_exportable, \
                    error, created_at, updated_at \
             FROM mdr.export_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.ok_or_else(|| MdrError::NotFound(format!("export job {id}")))?
            .try_into()
    }

    async fn update_export_job(&self, job: &ExportJob) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE mdr.export_jobs
            SET status = $2, location = $3, non_exportable = $4, error = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_ref())
        .bind(job.location.as_deref())
        .bind(Json(&job.non_exportable))
        .bind(job.error.as_deref())
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        if done.rows_affected() == 0 {
            return Err(MdrError::NotFound(format!("export job {}", job.id)));
        }
        Ok(())
    }
}
