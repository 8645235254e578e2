//! Core domain types for the metadata registry.
//! These are pure value types with no sqlx, no DB dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

use crate::error::MdrError;
use crate::urn::Urn;

// ── Enums ─────────────────────────────────────────────────────

/// Element type: discriminator for the shared identities table and the URN type token.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ElementType {
    Namespace,
    DataElement,
    DataElementGroup,
    Record,
    DescribedValueDomain,
    EnumeratedValueDomain,
    PermissibleValue,
}

impl ElementType {
    /// Parse the lowercase URN tag.
    pub fn parse(s: &str) -> Result<Self, MdrError> {
        s.parse()
            .map_err(|_| MdrError::UnsupportedElementType(s.to_string()))
    }

    /// Every type a namespace can own.
    pub fn all_elements() -> Vec<Self> {
        Self::iter().filter(|t| *t != Self::Namespace).collect()
    }

    /// First version number assigned to a new logical element.
    pub fn base_version(self) -> i32 {
        1
    }

    /// Types whose body lists members held as membership edges.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            Self::DataElementGroup | Self::Record | Self::EnumeratedValueDomain
        )
    }

    pub fn is_value_domain(self) -> bool {
        matches!(
            self,
            Self::DescribedValueDomain | Self::EnumeratedValueDomain
        )
    }

    /// Batch conversion order: leaves first, containers last.
    pub fn conversion_priority(self) -> u8 {
        match self {
            Self::PermissibleValue => 0,
            Self::DescribedValueDomain | Self::EnumeratedValueDomain => 1,
            Self::DataElement => 2,
            Self::DataElementGroup | Self::Record => 3,
            Self::Namespace => 4,
        }
    }
}

/// Identity lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Draft,
    Staged,
    Released,
    Outdated,
}

impl Status {
    pub fn parse(s: &str) -> Result<Self, MdrError> {
        s.parse()
            .map_err(|_| MdrError::InvalidInput(format!("unknown status '{s}'")))
    }

    /// Draft and staged identities are mutated in place; everything else is copy-on-write.
    pub fn is_mutable(self) -> bool {
        matches!(self, Self::Draft | Self::Staged)
    }

    /// Released or outdated: the "released-ness" used by namespace containment.
    pub fn is_released_or_later(self) -> bool {
        matches!(self, Self::Released | Self::Outdated)
    }
}

/// Kind of a relation between two identities (provenance, concept links).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RelationKind {
    #[default]
    Equal,
    Equivalent,
    Wider,
    Narrower,
    Related,
}

/// Background job status. The only coordination channel for async jobs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Processing,
    Done,
    Aborted,
}

/// Access level required by an operation, checked through `AccessControl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

// ── ID newtypes ───────────────────────────────────────────────

/// Internal identity row id. Never leaks into URNs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub i64);

/// Stable internal namespace id, shared by every revision of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceId(pub i64);

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl std::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ns#{}", self.0)
    }
}

// ── Identity ──────────────────────────────────────────────────

/// A versioned, namespace-scoped identity (one row per version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub element_type: ElementType,
    pub namespace_id: NamespaceId,
    /// Identifier of the owning namespace, the first URN token.
    pub namespace_identifier: String,
    pub identifier: String,
    pub version: i32,
    pub status: Status,
    pub uuid: Uuid,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn urn(&self) -> Urn {
        Urn {
            namespace: self.namespace_identifier.clone(),
            element_type: self.element_type,
            identifier: self.identifier.clone(),
            version: self.version,
        }
    }

    pub fn is_namespace(&self) -> bool {
        self.element_type == ElementType::Namespace
    }
}

/// Where a new identity lives: an existing namespace, or a namespace created with it.
#[derive(Debug, Clone, PartialEq)]
pub enum NamespaceSlot {
    Existing { id: NamespaceId, identifier: String },
    /// Registers a new namespace whose identifier is the identity's identifier.
    Create,
}

/// Input row for inserting an identity. Not a DB row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIdentity {
    pub element_type: ElementType,
    pub namespace: NamespaceSlot,
    pub identifier: String,
    pub version: i32,
    pub status: Status,
    pub created_by: String,
}

impl NewIdentity {
    pub fn namespace_identifier(&self) -> &str {
        match &self.namespace {
            NamespaceSlot::Existing { identifier, .. } => identifier,
            NamespaceSlot::Create => &self.identifier,
        }
    }

    pub fn urn(&self) -> Urn {
        Urn {
            namespace: self.namespace_identifier().to_string(),
            element_type: self.element_type,
            identifier: self.identifier.clone(),
            version: self.version,
        }
    }
}

/// Directed membership edge `super ⊃ sub`, ordered within its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MembershipEdge {
    pub super_id: IdentityId,
    pub sub_id: IdentityId,
    pub ordinal: i32,
}

/// An entry in the relation ledger (distinct from the membership graph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub left: IdentityId,
    pub right: IdentityId,
    pub kind: RelationKind,
}

// ── Settings ──────────────────────────────────────────────────

/// Service-wide settings handed in at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Language preference used when a caller asks for "the" definition.
    pub default_languages: Vec<String>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_languages: vec!["en".into()],
        }
    }
}
