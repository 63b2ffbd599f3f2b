//! Scope hierarchy (`base -> dev -> staging -> prod`).
//!
//! Each scope has at most one upstream. Scopes remember their creation order,
//! which fixes the order downstream scopes are visited during propagation.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ScopeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ScopeEntry {
    upstream: Option<ScopeId>,
    created: u64,
}

/// Directed forest of scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeTree {
    scopes: BTreeMap<ScopeId, ScopeEntry>,
    next: u64,
}

impl ScopeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A linear chain, each scope downstream of the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateScope`] if a name repeats.
    pub fn chain<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ScopeId>,
    {
        let mut tree = Self::new();
        let mut previous: Option<ScopeId> = None;
        for name in names {
            let scope = name.into();
            tree.add_scope(scope.clone(), previous.clone())?;
            previous = Some(scope);
        }
        Ok(tree)
    }

    /// Register a scope. Its upstream must already exist.
    ///
    /// # Errors
    ///
    /// Returns an error for a duplicate scope or an unknown upstream.
    pub fn add_scope(&mut self, scope: ScopeId, upstream: Option<ScopeId>) -> Result<()> {
        if self.scopes.contains_key(&scope) {
            return Err(Error::DuplicateScope {
                scope: scope.to_string(),
            });
        }
        if let Some(up) = upstream.as_ref().filter(|up| !self.contains(up)) {
            return Err(Error::scope_not_found(up.as_str()));
        }
        let created = self.next;
        self.next = self.next.saturating_add(1);
        self.scopes.insert(scope, ScopeEntry { upstream, created });
        Ok(())
    }

    /// Re-link `scope` under `upstream`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown scopes or when the link would form a cycle.
    pub fn set_upstream(&mut self, scope: &ScopeId, upstream: Option<ScopeId>) -> Result<()> {
        if !self.contains(scope) {
            return Err(Error::scope_not_found(scope.as_str()));
        }
        if let Some(up) = &upstream {
            if !self.contains(up) {
                return Err(Error::scope_not_found(up.as_str()));
            }
            if up == scope || self.ancestors(up).any(|a| a == scope) {
                return Err(Error::ScopeCycle {
                    scope: scope.to_string(),
                    upstream: up.to_string(),
                });
            }
        }
        if let Some(entry) = self.scopes.get_mut(scope) {
            entry.upstream = upstream;
        }
        Ok(())
    }

    pub fn contains(&self, scope: &ScopeId) -> bool {
        self.scopes.contains_key(scope)
    }

    pub fn upstream(&self, scope: &ScopeId) -> Option<&ScopeId> {
        self.scopes.get(scope).and_then(|e| e.upstream.as_ref())
    }

    /// Walk upstream from `scope` (exclusive) to the root.
    pub fn ancestors<'a>(&'a self, scope: &'a ScopeId) -> impl Iterator<Item = &'a ScopeId> + 'a {
        std::iter::successors(self.upstream(scope), |current| self.upstream(current))
            .take(self.scopes.len())
    }

    /// Immediate downstream scopes in creation order.
    pub fn children(&self, scope: &ScopeId) -> Vec<&ScopeId> {
        let mut children: Vec<(&ScopeId, u64)> = self
            .scopes
            .iter()
            .filter(|(_, entry)| entry.upstream.as_ref() == Some(scope))
            .map(|(id, entry)| (id, entry.created))
            .collect();
        children.sort_by_key(|(_, created)| *created);
        children.into_iter().map(|(id, _)| id).collect()
    }

    /// All transitive downstream scopes, breadth-first, siblings in creation order.
    pub fn descendants(&self, scope: &ScopeId) -> Vec<ScopeId> {
        let mut order = Vec::new();
        let mut frontier: VecDeque<&ScopeId> = self.children(scope).into_iter().collect();
        while let Some(next) = frontier.pop_front() {
            if order.contains(next) {
                continue;
            }
            order.push(next.clone());
            frontier.extend(self.children(next));
        }
        order
    }

    /// All scopes in creation order.
    pub fn scopes(&self) -> Vec<&ScopeId> {
        let mut all: Vec<(&ScopeId, u64)> = self
            .scopes
            .iter()
            .map(|(id, entry)| (id, entry.created))
            .collect();
        all.sort_by_key(|(_, created)| *created);
        all.into_iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn id(name: &str) -> ScopeId {
        ScopeId::from(name)
    }

    #[test]
    fn test_chain_links_each_scope_to_previous() {
        let tree = ScopeTree::chain(["base", "dev", "staging", "prod"]).unwrap();
        assert_eq!(tree.upstream(&id("dev")), Some(&id("base")));
        assert_eq!(tree.upstream(&id("base")), None);
        assert_eq!(
            tree.descendants(&id("base")),
            vec![id("dev"), id("staging"), id("prod")]
        );
    }

    #[test]
    fn test_descendants_are_breadth_first_in_creation_order() {
        let mut tree = ScopeTree::new();
        tree.add_scope(id("base"), None).unwrap();
        tree.add_scope(id("eu"), Some(id("base"))).unwrap();
        tree.add_scope(id("us"), Some(id("base"))).unwrap();
        tree.add_scope(id("eu-prod"), Some(id("eu"))).unwrap();
        tree.add_scope(id("us-prod"), Some(id("us"))).unwrap();

        assert_eq!(
            tree.descendants(&id("base")),
            vec![id("eu"), id("us"), id("eu-prod"), id("us-prod")]
        );
    }

    #[test]
    fn test_unknown_upstream_is_rejected() {
        let mut tree = ScopeTree::new();
        assert!(matches!(
            tree.add_scope(id("dev"), Some(id("base"))),
            Err(Error::ScopeNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_scope_is_rejected() {
        let mut tree = ScopeTree::chain(["base"]).unwrap();
        assert!(tree.add_scope(id("base"), None).is_err());
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut tree = ScopeTree::chain(["base", "dev", "prod"]).unwrap();
        let result = tree.set_upstream(&id("base"), Some(id("prod")));
        assert!(matches!(result, Err(Error::ScopeCycle { .. })));
        assert!(tree.set_upstream(&id("dev"), Some(id("dev"))).is_err());
        assert_eq!(tree.upstream(&id("base")), None);
    }
}
