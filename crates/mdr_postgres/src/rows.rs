//! `FromRow` structs and their conversion into core types.
//!
//! Enum columns are stored as text and parsed back with the core's strum
//! derives; a value that no longer parses is an `Internal` error.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use mdr_core::error::MdrError;
use mdr_core::export::ExportJob;
use mdr_core::staging::{ImportJob, StagedElement, StagedElementPayload};
use mdr_core::types::{
    ElementType, Identity, IdentityId, JobStatus, MembershipEdge, NamespaceId, Relation,
    RelationKind, Status,
};
use mdr_core::Urn;

/// Columns selected for an identity; alias `s` is `scoped_identifiers`, `n` is `namespaces`.
pub(crate) const IDENTITY_COLUMNS: &str = "s.id, s.element_type, s.namespace_id, \
     n.identifier AS namespace_identifier, s.identifier, s.version, s.status, s.uuid, \
     s.created_by, s.created_at";

fn parse_text<T: std::str::FromStr>(column: &str, value: &str) -> Result<T, MdrError> {
    value
        .parse::<T>()
        .map_err(|_| MdrError::Internal(anyhow!("bad {column} value '{value}' in database")))
}

// ── Identities ─────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct IdentityRow {
    id: i64,
    element_type: String,
    namespace_id: i64,
    namespace_identifier: String,
    identifier: String,
    version: i32,
    status: String,
    uuid: Uuid,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = MdrError;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: IdentityId(row.id),
            element_type: parse_text::<ElementType>("element_type", &row.element_type)?,
            namespace_id: NamespaceId(row.namespace_id),
            namespace_identifier: row.namespace_identifier,
            identifier: row.identifier,
            version: row.version,
            status: parse_text::<Status>("status", &row.status)?,
            uuid: row.uuid,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

pub(crate) fn identities(rows: Vec<IdentityRow>) -> Result<Vec<Identity>, MdrError> {
    rows.into_iter().map(Identity::try_from).collect()
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EdgeRow {
    super_id: i64,
    sub_id: i64,
    ordinal: i32,
}

impl From<EdgeRow> for MembershipEdge {
    fn from(row: EdgeRow) -> Self {
        Self {
            super_id: IdentityId(row.super_id),
            sub_id: IdentityId(row.sub_id),
            ordinal: row.ordinal,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RelationRow {
    left_id: i64,
    right_id: i64,
    kind: String,
}

impl TryFrom<RelationRow> for Relation {
    type Error = MdrError;

    fn try_from(row: RelationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            left: IdentityId(row.left_id),
            right: IdentityId(row.right_id),
            kind: parse_text::<RelationKind>("kind", &row.kind)?,
        })
    }
}

// ── Jobs ───────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ImportJobRow {
    id: Uuid,
    target_namespace: String,
    status: String,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ImportJobRow> for ImportJob {
    type Error = MdrError;

    fn try_from(row: ImportJobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            target_namespace: Urn::parse(&row.target_namespace)?,
            status: parse_text::<JobStatus>("status", &row.status)?,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StagedRow {
    job_id: Uuid,
    staging_id: String,
    element_type: String,
    payload: Json<StagedElementPayload>,
    converted: Option<i64>,
    error: Option<String>,
}

impl TryFrom<StagedRow> for StagedElement {
    type Error = MdrError;

    fn try_from(row: StagedRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: row.job_id,
            staging_id: row.staging_id,
            element_type: parse_text::<ElementType>("element_type", &row.element_type)?,
            payload: row.payload.0,
            converted: row.converted.map(IdentityId),
            error: row.error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ExportJobRow {
    id: Uuid,
    status: String,
    created_by: String,
    full_export: bool,
    roots: Json<Vec<Urn>>,
    location: Option<String>,
    non_exportable: Json<Vec<Urn>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ExportJobRow> for ExportJob {
    type Error = MdrError;

    fn try_from(row: ExportJobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            status: parse_text::<JobStatus>("status", &row.status)?,
            created_by: row.created_by,
            full_export: row.full_export,
            roots: row.roots.0,
            location: row.location,
            non_exportable: row.non_exportable.0,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
