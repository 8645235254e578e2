//! Metadata registry core.
//!
//! Versioned, namespace-scoped identities with a lifecycle, a membership DAG,
//! cross-namespace imports and the staged import/export pipeline. Storage is
//! reached only through the traits in [`ports`]; `mdr_postgres` and
//! [`in_memory`] implement them.

pub mod access;
pub mod content;
pub mod error;
pub mod export;
pub mod import_resolver;
pub mod in_memory;
pub mod jobs;
pub mod lifecycle;
pub mod membership;
pub mod ports;
pub mod principal;
pub mod registry;
pub mod service;
pub mod staging;
pub mod types;
pub mod urn;

pub use error::MdrError;
pub use principal::Principal;
pub use service::{RegistryService, RegistryServiceImpl};
pub use urn::Urn;
