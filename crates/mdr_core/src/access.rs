//! Role-based capability check. The default `AccessControl` when no external
//! ACL service is wired in.
//!
//! - `admin`: everything, including registry-wide grants
//! - `steward`: read + write inside any namespace
//! - `viewer`: read only
//!
//! Per-namespace grants can be layered with `with_grant`.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::ports::{AccessControl, Result};
use crate::principal::Principal;
use crate::types::{AccessLevel, NamespaceId};

#[derive(Debug, Clone, Default)]
pub struct RoleAccessControl {
    grants: HashMap<(String, NamespaceId), AccessLevel>,
}

impl RoleAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `actor` `level` on one namespace regardless of roles.
    pub fn with_grant(
        mut self,
        actor: impl Into<String>,
        namespace: NamespaceId,
        level: AccessLevel,
    ) -> Self {
        self.grants.insert((actor.into(), namespace), level);
        self
    }

    fn role_level(role: &str, namespace: Option<NamespaceId>) -> Option<AccessLevel> {
        match (role, namespace) {
            ("admin", _) => Some(AccessLevel::Admin),
            ("steward", Some(_)) => Some(AccessLevel::Write),
            ("steward", None) => Some(AccessLevel::Read),
            ("viewer", _) => Some(AccessLevel::Read),
            _ => None,
        }
    }
}

#[async_trait]
impl AccessControl for RoleAccessControl {
    async fn authorize(
        &self,
        principal: &Principal,
        namespace: Option<NamespaceId>,
        level: AccessLevel,
    ) -> Result<bool> {
        let granted = namespace
            .and_then(|ns| self.grants.get(&(principal.actor_id.clone(), ns)))
            .copied();
        let best = principal
            .roles
            .iter()
            .filter_map(|r| Self::role_level(r, namespace))
            .chain(granted)
            .max();
        Ok(best.is_some_and(|b| b >= level))
    }
}
