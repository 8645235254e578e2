//! Postgres implementations of the registry ports.
//!
//! Each adapter is a newtype wrapping PgPool. All SQL is runtime-checked
//! (sqlx::query, not sqlx::query!) to avoid a compile-time DB requirement.

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use mdr_core::content::Content;
use mdr_core::error::MdrError;
use mdr_core::ports::{
    ContentStore, IdentityRef, IdentityStore, MembershipStore, RegistryWriter, RelationStore,
    Result, WriteBatch, WriteOp,
};
use mdr_core::types::*;
use mdr_core::Urn;

use crate::rows::{identities, EdgeRow, IdentityRow, RelationRow, IDENTITY_COLUMNS};

/// Advisory lock key serialising membership edge inserts across sessions.
const GRAPH_LOCK: i64 = 0x6d64_725f_6772_6170;

fn select_identities(filter: &str) -> String {
    format!(
        "SELECT {IDENTITY_COLUMNS} FROM mdr.scoped_identifiers s \
         JOIN mdr.namespaces n ON n.namespace_id = s.namespace_id WHERE {filter}"
    )
}

/// Unique violations become `Conflict`; anything else is internal.
pub(crate) fn db_error(e: sqlx::Error, what: impl FnOnce() -> String) -> MdrError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            MdrError::Conflict(format!("{} already exists", what()))
        }
        _ => MdrError::Internal(anyhow!(e)),
    }
}

// ── PgIdentityStore ────────────────────────────────────────────

pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_namespace(&self, identifier: &str) -> Result<Option<NamespaceId>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT namespace_id FROM mdr.namespaces WHERE identifier = $1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(id.map(NamespaceId))
    }

    async fn find(&self, urn: &Urn) -> Result<Option<Identity>> {
        let row = sqlx::query_as::<_, IdentityRow>(&select_identities(
            "n.identifier = $1 AND s.element_type = $2 AND s.identifier = $3 AND s.version = $4",
        ))
        .bind(&urn.namespace)
        .bind(urn.element_type.as_ref())
        .bind(&urn.identifier)
        .bind(urn.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.map(Identity::try_from).transpose()
    }

    async fn get(&self, id: IdentityId) -> Result<Identity> {
        let row = sqlx::query_as::<_, IdentityRow>(&select_identities("s.id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        row.ok_or_else(|| MdrError::NotFound(id.to_string()))?
            .try_into()
    }

    async fn get_many(&self, ids: &[IdentityId]) -> Result<Vec<Identity>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let raw: Vec<i64> = ids.iter().map(|i| i.0).collect();
        let rows = sqlx::query_as::<_, IdentityRow>(&select_identities(
            "s.id = ANY($1) ORDER BY s.id",
        ))
        .bind(&raw)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        identities(rows)
    }

    async fn versions(
        &self,
        namespace: NamespaceId,
        element_type: ElementType,
        identifier: &str,
    ) -> Result<Vec<Identity>> {
        let rows = sqlx::query_as::<_, IdentityRow>(&select_identities(
            "s.namespace_id = $1 AND s.element_type = $2 AND s.identifier = $3 \
             ORDER BY s.version",
        ))
        .bind(namespace.0)
        .bind(element_type.as_ref())
        .bind(identifier)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        identities(rows)
    }

    async fn list_in_namespace(
        &self,
        namespace: NamespaceId,
        types: &[ElementType],
    ) -> Result<Vec<Identity>> {
        let types: Vec<String> = types
            .iter()
            .filter(|t| **t != ElementType::Namespace)
            .map(|t| t.to_string())
            .collect();
        if types.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query_as::<_, IdentityRow>(&select_identities(
            "s.namespace_id = $1 AND s.element_type = ANY($2) ORDER BY s.id",
        ))
        .bind(namespace.0)
        .bind(&types)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        identities(rows)
    }

    async fn next_identifier(
        &self,
        scope: Option<NamespaceId>,
        element_type: ElementType,
    ) -> Result<i64> {
        // A missing counter row is seeded from the highest numeric identifier
        // in use; an existing one never falls behind it.
        let next = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO mdr.identifier_counters (namespace_id, element_type, last_value)
            SELECT $1::bigint, $2::text,
                   COALESCE(MAX(CASE WHEN s.identifier ~ '^[0-9]+$'
                                     THEN s.identifier::bigint END), 0) + 1
            FROM mdr.scoped_identifiers s
            WHERE s.element_type = $2::text AND ($1::bigint = 0 OR s.namespace_id = $1::bigint)
            ON CONFLICT (namespace_id, element_type) DO UPDATE
                SET last_value = GREATEST(mdr.identifier_counters.last_value,
                                          EXCLUDED.last_value - 1) + 1
            RETURNING last_value
            "#,
        )
        .bind(scope.map_or(0, |ns| ns.0))
        .bind(element_type.as_ref())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(next)
    }
}

// ── PgContentStore ─────────────────────────────────────────────

pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn load_content(&self, id: IdentityId) -> Result<Content> {
        let content = sqlx::query_scalar::<_, Json<Content>>(
            "SELECT content FROM mdr.scoped_identifiers WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        content
            .map(|c| c.0)
            .ok_or_else(|| MdrError::NotFound(format!("content of {id}")))
    }
}

// ── PgMembershipStore / PgRelationStore ───────────────────────

pub struct PgMembershipStore {
    pool: PgPool,
}

impl PgMembershipStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn children(&self, id: IdentityId) -> Result<Vec<MembershipEdge>> {
        let rows = sqlx::query_as::<_, EdgeRow>(
            "SELECT super_id, sub_id, ordinal FROM mdr.membership_edges \
             WHERE super_id = $1 ORDER BY ordinal",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(rows.into_iter().map(MembershipEdge::from).collect())
    }

    async fn parents(&self, ids: &[IdentityId]) -> Result<Vec<MembershipEdge>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let raw: Vec<i64> = ids.iter().map(|i| i.0).collect();
        let rows = sqlx::query_as::<_, EdgeRow>(
            "SELECT super_id, sub_id, ordinal FROM mdr.membership_edges WHERE sub_id = ANY($1)",
        )
        .bind(&raw)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(rows.into_iter().map(MembershipEdge::from).collect())
    }
}

pub struct PgRelationStore {
    pool: PgPool,
}

impl PgRelationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationStore for PgRelationStore {
    async fn relations_of(&self, id: IdentityId) -> Result<Vec<Relation>> {
        let rows = sqlx::query_as::<_, RelationRow>(
            "SELECT left_id, right_id, kind FROM mdr.relations \
             WHERE left_id = $1 OR right_id = $1 ORDER BY left_id, right_id",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        rows.into_iter().map(Relation::try_from).collect()
    }
}

// ── PgRegistryWriter ───────────────────────────────────────────

/// Applies a `WriteBatch` inside one transaction.
pub struct PgRegistryWriter {
    pool: PgPool,
}

impl PgRegistryWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        new: NewIdentity,
        content: Content,
    ) -> Result<Identity> {
        let urn = new.urn();
        let namespace_id = match &new.namespace {
            NamespaceSlot::Existing { id, .. } => *id,
            NamespaceSlot::Create => {
                let id = sqlx::query_scalar::<_, i64>(
                    "INSERT INTO mdr.namespaces (identifier) VALUES ($1) RETURNING namespace_id",
                )
                .bind(&new.identifier)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| db_error(e, || format!("namespace {}", new.identifier)))?;
                NamespaceId(id)
            }
        };
        let uuid = Uuid::new_v4();
        let (id, created_at) = sqlx::query_as::<_, (i64, chrono::DateTime<chrono::Utc>)>(
            r#"
            INSERT INTO mdr.scoped_identifiers
                (element_type, namespace_id, identifier, version, status, uuid, created_by, content)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, created_at
            "#,
        )
        .bind(new.element_type.as_ref())
        .bind(namespace_id.0)
        .bind(&new.identifier)
        .bind(new.version)
        .bind(new.status.as_ref())
        .bind(uuid)
        .bind(&new.created_by)
        .bind(Json(&content))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| db_error(e, || urn.to_string()))?;

        Ok(Identity {
            id: IdentityId(id),
            element_type: new.element_type,
            namespace_id,
            namespace_identifier: new.namespace_identifier().to_string(),
            identifier: new.identifier,
            version: new.version,
            status: new.status,
            uuid,
            created_by: new.created_by,
            created_at,
        })
    }

    async fn delete(tx: &mut Transaction<'_, Postgres>, id: IdentityId) -> Result<()> {
        let removed = sqlx::query_as::<_, (String, i64)>(
            "DELETE FROM mdr.scoped_identifiers WHERE id = $1 RETURNING element_type, namespace_id",
        )
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| anyhow!(e))?
        .ok_or_else(|| MdrError::NotFound(id.to_string()))?;

        if removed.0 == ElementType::Namespace.as_ref() {
            sqlx::query(
                r#"
                DELETE FROM mdr.namespaces n
                WHERE n.namespace_id = $1
                  AND NOT EXISTS (SELECT 1 FROM mdr.scoped_identifiers s
                                  WHERE s.namespace_id = n.namespace_id)
                "#,
            )
            .bind(removed.1)
            .execute(&mut **tx)
            .await
            .map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }

    async fn add_edge(
        tx: &mut Transaction<'_, Postgres>,
        super_id: IdentityId,
        sub_id: IdentityId,
        ordinal: i32,
    ) -> Result<()> {
        let (exists, cyclic) = sqlx::query_as::<_, (bool, bool)>(
            r#"
            WITH RECURSIVE reach(id) AS (
                SELECT $2::bigint
                UNION
                SELECT e.sub_id FROM mdr.membership_edges e JOIN reach r ON e.super_id = r.id
            )
            SELECT EXISTS (SELECT 1 FROM mdr.membership_edges
                           WHERE super_id = $1 AND sub_id = $2),
                   EXISTS (SELECT 1 FROM reach WHERE id = $1)
            "#,
        )
        .bind(super_id.0)
        .bind(sub_id.0)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| anyhow!(e))?;
        if exists {
            return Ok(());
        }
        if cyclic {
            return Err(MdrError::CyclicMembership(format!("{super_id} -> {sub_id}")));
        }
        sqlx::query(
            "INSERT INTO mdr.membership_edges (super_id, sub_id, ordinal) VALUES ($1, $2, $3)",
        )
        .bind(super_id.0)
        .bind(sub_id.0)
        .bind(ordinal)
        .execute(&mut **tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

fn resolve_ref(inserted: &[Identity], r: IdentityRef) -> Result<IdentityId> {
    match r {
        IdentityRef::Existing(id) => Ok(id),
        IdentityRef::Pending(slot) => inserted
            .get(slot)
            .map(|i| i.id)
            .ok_or_else(|| MdrError::Internal(anyhow!("unknown slot {slot}"))),
    }
}

fn require_row(affected: u64, id: IdentityId) -> Result<()> {
    if affected == 0 {
        Err(MdrError::NotFound(id.to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl RegistryWriter for PgRegistryWriter {
    async fn commit(&self, batch: WriteBatch) -> Result<Vec<Identity>> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        if batch
            .ops()
            .iter()
            .any(|op| matches!(op, WriteOp::AddEdge { .. }))
        {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(GRAPH_LOCK)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
        }

        let mut inserted: Vec<Identity> = Vec::with_capacity(batch.insert_count());
        for op in batch.into_ops() {
            match op {
                WriteOp::Insert { identity, content } => {
                    inserted.push(Self::insert(&mut tx, identity, content).await?);
                }
                WriteOp::ReplaceContent { id, content } => {
                    let done = sqlx::query(
                        "UPDATE mdr.scoped_identifiers SET content = $2 WHERE id = $1",
                    )
                    .bind(id.0)
                    .bind(Json(&content))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                    require_row(done.rows_affected(), id)?;
                }
                WriteOp::SetStatus { id, status } => {
                    let done = sqlx::query(
                        "UPDATE mdr.scoped_identifiers SET status = $2 WHERE id = $1",
                    )
                    .bind(id.0)
                    .bind(status.as_ref())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                    require_row(done.rows_affected(), id)?;
                }
                WriteOp::ClearMembers { id } => {
                    sqlx::query("DELETE FROM mdr.membership_edges WHERE super_id = $1")
                        .bind(id.0)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| anyhow!(e))?;
                }
                WriteOp::Delete { id } => Self::delete(&mut tx, id).await?,
                WriteOp::AddEdge {
                    super_ref,
                    sub_ref,
                    ordinal,
                } => {
                    let super_id = resolve_ref(&inserted, super_ref)?;
                    let sub_id = resolve_ref(&inserted, sub_ref)?;
                    Self::add_edge(&mut tx, super_id, sub_id, ordinal).await?;
                }
                WriteOp::AddRelation { left, right, kind } => {
                    sqlx::query(
                        "INSERT INTO mdr.relations (left_id, right_id, kind) VALUES ($1, $2, $3) \
                         ON CONFLICT DO NOTHING",
                    )
                    .bind(resolve_ref(&inserted, left)?.0)
                    .bind(resolve_ref(&inserted, right)?.0)
                    .bind(kind.as_ref())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                }
            }
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        tracing::debug!(inserted = inserted.len(), "batch committed");
        Ok(inserted)
    }
}
