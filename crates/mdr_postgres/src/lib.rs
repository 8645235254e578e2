//! PostgreSQL adapter for the metadata registry.
//!
//! `PgStores` bundles one adapter per port over a shared pool;
//! `bootstrap_schema` applies the idempotent schema in `migrations/`.

mod bundles;
mod jobs;
mod rows;
mod store;

use std::sync::Arc;

use sqlx::PgPool;

use mdr_core::ports::BundleStore;
use mdr_core::RegistryServiceImpl;

pub use bundles::FsBundleStore;
pub use jobs::PgJobStore;
pub use store::{
    PgContentStore, PgIdentityStore, PgMembershipStore, PgRegistryWriter, PgRelationStore,
};

const SCHEMA: &str = include_str!("../../../migrations/001_registry.sql");

/// Every Postgres-backed port, sharing one pool.
#[derive(Clone)]
pub struct PgStores {
    pub identities: Arc<PgIdentityStore>,
    pub contents: Arc<PgContentStore>,
    pub membership: Arc<PgMembershipStore>,
    pub relations: Arc<PgRelationStore>,
    pub writer: Arc<PgRegistryWriter>,
    pub jobs: Arc<PgJobStore>,
}

impl PgStores {
    pub fn new(pool: PgPool) -> Self {
        Self {
            identities: Arc::new(PgIdentityStore::new(pool.clone())),
            contents: Arc::new(PgContentStore::new(pool.clone())),
            membership: Arc::new(PgMembershipStore::new(pool.clone())),
            relations: Arc::new(PgRelationStore::new(pool.clone())),
            writer: Arc::new(PgRegistryWriter::new(pool.clone())),
            jobs: Arc::new(PgJobStore::new(pool)),
        }
    }

    /// Registry service over these stores.
    pub fn service(&self, bundles: Arc<dyn BundleStore>) -> RegistryServiceImpl {
        RegistryServiceImpl::new(
            self.identities.clone(),
            self.contents.clone(),
            self.membership.clone(),
            self.relations.clone(),
            self.writer.clone(),
            self.jobs.clone(),
            bundles,
        )
    }
}

/// Create the `mdr` schema and its tables if they do not exist yet.
pub async fn bootstrap_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::info!("registry schema ready");
    Ok(())
}
