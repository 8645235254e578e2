//! Membership graph: arena of identities keyed by id plus parent/child adjacency.
//!
//! The graph is an in-memory view over the edges the stores hold. Loaders pull
//! exactly the part of the DAG a query needs; every traversal is an explicit
//! worklist, never recursion.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::MdrError;
use crate::ports::{IdentityStore, MembershipStore, Result};
use crate::types::{ElementType, Identity, IdentityId, MembershipEdge, NamespaceId, Status};

#[derive(Debug, Clone, Default)]
pub struct MembershipGraph {
    nodes: HashMap<IdentityId, Identity>,
    children: HashMap<IdentityId, Vec<(i32, IdentityId)>>,
    parents: HashMap<IdentityId, BTreeSet<IdentityId>>,
}

impl MembershipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&mut self, identity: Identity) {
        self.nodes.insert(identity.id, identity);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert `super ⊃ sub`. Returns `false` when the edge already exists.
    /// Self-loops and edges closing a cycle are rejected.
    pub fn add_edge(&mut self, super_id: IdentityId, sub_id: IdentityId, ordinal: i32) -> Result<bool> {
        if super_id == sub_id {
            return Err(MdrError::CyclicMembership(format!(
                "{super_id} cannot contain itself"
            )));
        }
        if self.has_edge(super_id, sub_id) {
            return Ok(false);
        }
        if self.reaches(sub_id, super_id) {
            return Err(MdrError::CyclicMembership(format!(
                "{sub_id} already contains {super_id}"
            )));
        }
        let kids = self.children.entry(super_id).or_default();
        kids.push((ordinal, sub_id));
        kids.sort_by_key(|(o, _)| *o);
        self.parents.entry(sub_id).or_default().insert(super_id);
        Ok(true)
    }

    fn add_loaded_edge(&mut self, edge: &MembershipEdge) {
        if !self.has_edge(edge.super_id, edge.sub_id) {
            let kids = self.children.entry(edge.super_id).or_default();
            kids.push((edge.ordinal, edge.sub_id));
            kids.sort_by_key(|(o, _)| *o);
            self.parents
                .entry(edge.sub_id)
                .or_default()
                .insert(edge.super_id);
        }
    }

    pub fn has_edge(&self, super_id: IdentityId, sub_id: IdentityId) -> bool {
        self.children
            .get(&super_id)
            .is_some_and(|kids| kids.iter().any(|(_, k)| *k == sub_id))
    }

    /// Direct children in ordinal order.
    pub fn member_ids(&self, id: IdentityId) -> Vec<IdentityId> {
        self.children
            .get(&id)
            .map(|kids| kids.iter().map(|(_, k)| *k).collect())
            .unwrap_or_default()
    }

    /// Direct children that are loaded in the arena.
    pub fn members(&self, id: IdentityId) -> Vec<&Identity> {
        self.member_ids(id)
            .into_iter()
            .filter_map(|k| self.nodes.get(&k))
            .collect()
    }

    pub fn parent_ids(&self, id: IdentityId) -> Vec<IdentityId> {
        self.parents
            .get(&id)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Transitive children, breadth-first, each once.
    pub fn descendants(&self, id: IdentityId) -> Vec<IdentityId> {
        self.walk(id, |g, n| g.member_ids(n))
    }

    /// Transitive parents, breadth-first, each once.
    pub fn ancestors(&self, id: IdentityId) -> Vec<IdentityId> {
        self.walk(id, |g, n| g.parent_ids(n))
    }

    fn walk<F>(&self, start: IdentityId, next: F) -> Vec<IdentityId>
    where
        F: Fn(&Self, IdentityId) -> Vec<IdentityId>,
    {
        let mut seen = HashSet::from([start]);
        let mut out = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(n) = queue.pop_front() {
            for k in next(self, n) {
                if seen.insert(k) {
                    out.push(k);
                    queue.push_back(k);
                }
            }
        }
        out
    }

    /// True when `to` is reachable from `from` following child edges.
    pub fn reaches(&self, from: IdentityId, to: IdentityId) -> bool {
        from == to || self.descendants(from).contains(&to)
    }

    /// Transitive members that are not RELEASED.
    pub fn unreleased_descendants(&self, id: IdentityId) -> Vec<&Identity> {
        self.descendants(id)
            .into_iter()
            .filter_map(|k| self.nodes.get(&k))
            .filter(|n| n.status != Status::Released)
            .collect()
    }

    pub fn all_descendants_released(&self, id: IdentityId) -> bool {
        self.unreleased_descendants(id).is_empty()
    }

    /// Non-outdated identities of `namespace` with a type in `types`. With
    /// `hide_transitive`, anything with at least one non-OUTDATED parent is dropped.
    pub fn visible_roots(
        &self,
        namespace: NamespaceId,
        types: &[ElementType],
        hide_transitive: bool,
    ) -> Vec<&Identity> {
        let mut roots: Vec<&Identity> = self
            .nodes
            .values()
            .filter(|n| n.namespace_id == namespace && !n.is_namespace())
            .filter(|n| types.contains(&n.element_type))
            .filter(|n| n.status != Status::Outdated)
            .filter(|n| {
                !hide_transitive
                    || self.parent_ids(n.id).into_iter().all(|p| {
                        self.nodes
                            .get(&p)
                            .map_or(true, |parent| parent.status == Status::Outdated)
                    })
            })
            .collect();
        roots.sort_by(|a, b| {
            (a.element_type, &a.identifier, a.version).cmp(&(b.element_type, &b.identifier, b.version))
        });
        roots
    }

    // ── Loaders ───────────────────────────────────────────────

    /// Load `root` and everything below it.
    pub async fn load_subtree(
        identities: &dyn IdentityStore,
        membership: &dyn MembershipStore,
        root: &Identity,
    ) -> Result<Self> {
        let mut graph = Self::new();
        graph.insert_node(root.clone());
        let mut frontier = vec![root.id];
        while !frontier.is_empty() {
            let mut next_ids = Vec::new();
            for id in frontier {
                for edge in membership.children(id).await? {
                    graph.add_loaded_edge(&edge);
                    if !graph.nodes.contains_key(&edge.sub_id) && !next_ids.contains(&edge.sub_id) {
                        next_ids.push(edge.sub_id);
                    }
                }
            }
            for node in identities.get_many(&next_ids).await? {
                graph.insert_node(node);
            }
            frontier = next_ids;
        }
        Ok(graph)
    }

    /// Load `start` and everything above it.
    pub async fn load_ancestors(
        identities: &dyn IdentityStore,
        membership: &dyn MembershipStore,
        start: &Identity,
    ) -> Result<Self> {
        let mut graph = Self::new();
        graph.insert_node(start.clone());
        let mut frontier = vec![start.id];
        while !frontier.is_empty() {
            let edges = membership.parents(&frontier).await?;
            let mut next_ids = Vec::new();
            for edge in &edges {
                graph.add_loaded_edge(edge);
                if !graph.nodes.contains_key(&edge.super_id) && !next_ids.contains(&edge.super_id) {
                    next_ids.push(edge.super_id);
                }
            }
            for node in identities.get_many(&next_ids).await? {
                graph.insert_node(node);
            }
            frontier = next_ids;
        }
        Ok(graph)
    }

    /// Load the identities of a namespace with their direct parents, enough for
    /// `visible_roots`.
    pub async fn load_namespace(
        identities: &dyn IdentityStore,
        membership: &dyn MembershipStore,
        namespace: NamespaceId,
        types: &[ElementType],
    ) -> Result<Self> {
        let mut graph = Self::new();
        let members = identities.list_in_namespace(namespace, types).await?;
        let ids: Vec<IdentityId> = members.iter().map(|m| m.id).collect();
        for m in members {
            graph.insert_node(m);
        }
        let edges = membership.parents(&ids).await?;
        let mut missing = Vec::new();
        for edge in &edges {
            graph.add_loaded_edge(edge);
            if !graph.nodes.contains_key(&edge.super_id) && !missing.contains(&edge.super_id) {
                missing.push(edge.super_id);
            }
        }
        for parent in identities.get_many(&missing).await? {
            graph.insert_node(parent);
        }
        Ok(graph)
    }
}
