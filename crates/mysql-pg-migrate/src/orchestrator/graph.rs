//! Dependency ordering between entities.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::{MigrateError, Result};
use crate::mapping::SchemaMapping;

/// Partial order over entities: a child is migrated after all its parents.
///
/// Nodes keep their insertion order, which is used to break ties so the
/// resulting schedule is deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    parents: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from declared `depends_on` lists.
    ///
    /// Unknown parents and cycles are configuration errors.
    pub fn from_mappings(mappings: &[SchemaMapping]) -> Result<Self> {
        let mut graph = Self::new();
        for m in mappings {
            graph.add_node(m.entity());
        }
        for m in mappings {
            for parent in &m.depends_on {
                if !graph.contains(parent) {
                    return Err(MigrateError::Config(format!(
                        "mapping '{}' depends on unknown entity '{}'",
                        m.entity(),
                        parent
                    )));
                }
                graph.add_edge(m.entity(), parent);
            }
        }
        graph.topological_order()?;
        Ok(graph)
    }

    pub fn add_node(&mut self, name: &str) {
        if !self.parents.contains_key(name) {
            self.nodes.push(name.to_string());
            self.parents.insert(name.to_string(), BTreeSet::new());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parents.contains_key(name)
    }

    /// Record that `child` depends on `parent`. Self-references are ignored.
    pub fn add_edge(&mut self, child: &str, parent: &str) {
        if child == parent {
            return;
        }
        self.add_node(child);
        self.add_node(parent);
        if let Some(set) = self.parents.get_mut(child) {
            set.insert(parent.to_string());
        }
    }

    /// Add an edge only if it keeps the graph acyclic. Returns whether it was added.
    pub fn add_edge_if_acyclic(&mut self, child: &str, parent: &str) -> bool {
        if child == parent || self.depends_transitively(parent, child) {
            return false;
        }
        self.add_edge(child, parent);
        true
    }

    /// Whether `node` (transitively) depends on `ancestor`.
    fn depends_transitively(&self, node: &str, ancestor: &str) -> bool {
        let mut stack = vec![node];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(ps) = self.parents.get(current) {
                stack.extend(ps.iter().map(String::as_str));
            }
        }
        false
    }

    pub fn parents(&self, name: &str) -> impl Iterator<Item = &str> {
        self.parents
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keep only the given nodes. Edges to removed nodes are dropped.
    pub fn restrict(&self, keep: &HashSet<String>) -> Self {
        let mut graph = Self::new();
        for node in self.nodes.iter().filter(|n| keep.contains(*n)) {
            graph.add_node(node);
        }
        for node in graph.nodes.clone() {
            for parent in self.parents(&node) {
                if keep.contains(parent) {
                    graph.add_edge(&node, parent);
                }
            }
        }
        graph
    }

    /// Parents-first order (Kahn), ties broken by insertion order.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut remaining: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.parents[n].len()))
            .collect();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for parent in &self.parents[node] {
                children.entry(parent.as_str()).or_default().push(node.as_str());
            }
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(String::as_str)
            .filter(|n| remaining[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            for child in children.get(node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&str> = self
                .nodes
                .iter()
                .map(String::as_str)
                .filter(|n| remaining[n] > 0)
                .collect();
            return Err(MigrateError::Config(format!(
                "dependency cycle between entities: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

/// Readiness tracker driven by the scheduler loop.
///
/// A node becomes ready once every parent has been marked finished,
/// whatever its outcome.
#[derive(Debug)]
pub struct ReadyQueue {
    pending: Vec<String>,
    waiting_on: HashMap<String, HashSet<String>>,
}

impl ReadyQueue {
    pub fn new(graph: &DependencyGraph, order: Vec<String>) -> Self {
        let waiting_on = order
            .iter()
            .map(|n| (n.clone(), graph.parents(n).map(str::to_string).collect()))
            .collect();
        Self {
            pending: order,
            waiting_on,
        }
    }

    /// Take the first pending node whose parents have all finished.
    pub fn next_ready(&mut self) -> Option<String> {
        let pos = self
            .pending
            .iter()
            .position(|n| self.waiting_on.get(n).map_or(true, HashSet::is_empty))?;
        Some(self.pending.remove(pos))
    }

    pub fn mark_finished(&mut self, name: &str) {
        for waiting in self.waiting_on.values_mut() {
            waiting.remove(name);
        }
    }

    /// Drain every node not yet started.
    pub fn drain_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)], nodes: &[&str]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_node(n);
        }
        for (child, parent) in edges {
            g.add_edge(child, parent);
        }
        g
    }

    #[test]
    fn test_topological_order_parents_first() {
        let g = graph(
            &[("orders", "users"), ("order_items", "orders"), ("order_items", "products")],
            &["order_items", "orders", "products", "users"],
        );
        let order = g.topological_order().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("users") < pos("orders"));
        assert!(pos("orders") < pos("order_items"));
        assert!(pos("products") < pos("order_items"));
    }

    #[test]
    fn test_topological_order_is_stable() {
        let g = graph(&[], &["c", "a", "b"]);
        assert_eq!(g.topological_order().unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_cycle_detected() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a")], &["a", "b", "c", "d"]);
        let err = g.topological_order().unwrap_err();
        assert!(err.to_string().ends_with("cycle between entities: a, b, c"));
    }

    #[test]
    fn test_self_edge_ignored() {
        let g = graph(&[("categories", "categories")], &["categories"]);
        assert_eq!(g.parents("categories").count(), 0);
    }

    #[test]
    fn test_add_edge_if_acyclic() {
        let mut g = graph(&[("orders", "users")], &["users", "orders"]);
        assert!(!g.add_edge_if_acyclic("users", "orders"));
        assert!(g.topological_order().is_ok());
    }

    #[test]
    fn test_restrict_drops_edges_to_removed_nodes() {
        let g = graph(&[("orders", "users")], &["users", "orders"]);
        let keep: HashSet<String> = ["orders".to_string()].into_iter().collect();
        let r = g.restrict(&keep);
        assert_eq!(r.len(), 1);
        assert_eq!(r.parents("orders").count(), 0);
    }

    #[test]
    fn test_ready_queue_releases_children_after_parents() {
        let g = graph(&[("orders", "users")], &["users", "orders", "products"]);
        let order = g.topological_order().unwrap();
        let mut q = ReadyQueue::new(&g, order);

        assert_eq!(q.next_ready().as_deref(), Some("users"));
        assert_eq!(q.next_ready().as_deref(), Some("products"));
        assert_eq!(q.next_ready(), None);
        assert!(!q.is_empty());

        q.mark_finished("users");
        assert_eq!(q.next_ready().as_deref(), Some("orders"));
        assert!(q.is_empty());
    }
}
