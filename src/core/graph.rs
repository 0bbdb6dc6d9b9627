//! Dependency graph.
//!
//! An arena of [`Package`] records indexed by a dense integer id. Edges are
//! id pairs; both directions are kept so fan-in and fan-out enumerate in
//! O(deg). The graph is acyclic by construction: the resolver rejects an edge
//! that would close a cycle before it is inserted.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::package::{Package, PackageKey};

/// Dense handle into the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(u32);

impl PackageId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub struct DependencyGraph {
    packages: Vec<Package>,
    dependencies: Vec<Vec<PackageId>>,
    dependents: Vec<Vec<PackageId>>,
    by_key: HashMap<PackageKey, PackageId>,
    root: PackageId,
}

impl DependencyGraph {
    /// Create a graph containing only the root package.
    pub fn new(root: Package) -> Self {
        let mut by_key = HashMap::new();
        by_key.insert(root.key(), PackageId(0));
        Self {
            packages: vec![root],
            dependencies: vec![Vec::new()],
            dependents: vec![Vec::new()],
            by_key,
            root: PackageId(0),
        }
    }

    pub fn root(&self) -> PackageId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn package(&self, id: PackageId) -> &Package {
        &self.packages[id.index()]
    }

    pub fn lookup(&self, key: &PackageKey) -> Option<PackageId> {
        self.by_key.get(key).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = PackageId> + '_ {
        (0..self.packages.len() as u32).map(PackageId)
    }

    /// Direct dependencies of `id` (fan-out).
    pub fn dependencies(&self, id: PackageId) -> &[PackageId] {
        &self.dependencies[id.index()]
    }

    /// Direct dependents of `id` (fan-in).
    pub fn dependents(&self, id: PackageId) -> &[PackageId] {
        &self.dependents[id.index()]
    }

    /// Insert a package, returning its id. Inserting the same (name, version)
    /// twice returns the existing id.
    pub fn add_package(&mut self, package: Package) -> PackageId {
        let key = package.key();
        if let Some(&id) = self.by_key.get(&key) {
            return id;
        }
        let id = PackageId(self.packages.len() as u32);
        self.packages.push(package);
        self.dependencies.push(Vec::new());
        self.dependents.push(Vec::new());
        self.by_key.insert(key, id);
        id
    }

    /// Insert the edge `from -> to` ("from depends on to").
    ///
    /// Fails with the offending path (from `from` back around to `from`) when
    /// the edge would close a cycle. Duplicate edges are ignored.
    pub fn add_edge(&mut self, from: PackageId, to: PackageId) -> Result<(), Vec<PackageKey>> {
        if self.dependencies[from.index()].contains(&to) {
            return Ok(());
        }
        if from == to {
            let key = self.packages[from.index()].key();
            return Err(vec![key.clone(), key]);
        }
        // A path to -> ... -> from means from -> to completes a cycle.
        if let Some(mut path) = self.find_path(to, from) {
            path.push(to);
            let mut keys: Vec<PackageKey> = Vec::with_capacity(path.len());
            for id in path {
                keys.push(self.packages[id.index()].key());
            }
            return Err(keys);
        }
        self.dependencies[from.index()].push(to);
        self.dependents[to.index()].push(from);
        Ok(())
    }

    /// Depth-first path from `start` to `goal` along dependency edges.
    fn find_path(&self, start: PackageId, goal: PackageId) -> Option<Vec<PackageId>> {
        let mut stack = vec![(start, 0usize)];
        let mut path = vec![start];
        let mut visited = vec![false; self.packages.len()];
        visited[start.index()] = true;

        if start == goal {
            return Some(path);
        }
        while let Some(&(node, next_child)) = stack.last() {
            let children = &self.dependencies[node.index()];
            if next_child >= children.len() {
                stack.pop();
                path.pop();
                continue;
            }
            stack.last_mut().expect("stack is non-empty").1 += 1;
            let child = children[next_child];
            if visited[child.index()] {
                continue;
            }
            visited[child.index()] = true;
            path.push(child);
            if child == goal {
                return Some(path);
            }
            stack.push((child, 0));
        }
        None
    }

    /// Kahn's algorithm: dependencies before dependents. Ties are broken by
    /// (name, version) so the order is identical across runs.
    pub fn topological_order(&self) -> Vec<PackageId> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: Vec<PackageId> = self
            .ids()
            .filter(|id| in_degree[id.index()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.packages.len());

        while !ready.is_empty() {
            ready.sort_by(|a, b| {
                self.packages[b.index()]
                    .key()
                    .cmp(&self.packages[a.index()].key())
            });
            let id = ready.pop().expect("ready set is non-empty");
            order.push(id);
            for &dependent in &self.dependents[id.index()] {
                in_degree[dependent.index()] -= 1;
                if in_degree[dependent.index()] == 0 {
                    ready.push(dependent);
                }
            }
        }
        debug_assert_eq!(order.len(), self.packages.len());
        order
    }

    /// Transitive dependencies of `id` in breadth-first order: direct
    /// dependencies first, deduplicated by first occurrence.
    pub fn transitive_dependencies(&self, id: PackageId) -> Vec<PackageId> {
        let mut seen = vec![false; self.packages.len()];
        let mut queue: std::collections::VecDeque<PackageId> =
            self.dependencies[id.index()].iter().copied().collect();
        let mut out = Vec::new();
        for &dep in &self.dependencies[id.index()] {
            seen[dep.index()] = true;
        }
        while let Some(dep) = queue.pop_front() {
            out.push(dep);
            for &next in &self.dependencies[dep.index()] {
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// JSON export of the vertex and edge sets, for inspection tooling.
    pub fn export(&self) -> GraphExport {
        let nodes = self
            .ids()
            .map(|id| {
                let p = self.package(id);
                GraphNode {
                    name: p.name().to_string(),
                    version: p.version().to_string(),
                    package_type: p.manifest().package_type.to_string(),
                }
            })
            .collect();
        let mut edges = Vec::new();
        for id in self.ids() {
            for &dep in self.dependencies(id) {
                edges.push(GraphEdge {
                    from: self.package(id).name().to_string(),
                    to: self.package(dep).name().to_string(),
                });
            }
        }
        GraphExport { nodes, edges }
    }
}

#[derive(Debug, Serialize)]
pub struct GraphExport {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Serialize)]
pub struct GraphNode {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub package_type: String,
}

#[derive(Debug, Serialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::Manifest;
    use crate::core::package::PackageOrigin;
    use std::path::PathBuf;

    fn pkg(name: &str, version: &str) -> Package {
        let text = format!("name: {name}\nversion: {version}\ntype: library\n");
        Package::new(
            Manifest::parse(text.as_bytes()).unwrap(),
            PathBuf::from(format!("/pkg/{name}")),
            PackageOrigin::Local,
        )
    }

    #[test]
    fn add_package_dedupes_by_key() {
        let mut g = DependencyGraph::new(pkg("root", "1.0.0"));
        let a1 = g.add_package(pkg("a", "1.0.0"));
        let a2 = g.add_package(pkg("a", "1.0.0"));
        assert_eq!(a1, a2);
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn edge_cycle_rejected_with_path() {
        let mut g = DependencyGraph::new(pkg("root", "1.0.0"));
        let p = g.add_package(pkg("p", "1.0.0"));
        let q = g.add_package(pkg("q", "1.0.0"));
        g.add_edge(g.root(), p).unwrap();
        g.add_edge(p, q).unwrap();

        let err = g.add_edge(q, p).unwrap_err();
        let names: Vec<&str> = err.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["p", "q", "p"]);
    }

    #[test]
    fn self_edge_rejected() {
        let mut g = DependencyGraph::new(pkg("root", "1.0.0"));
        assert!(g.add_edge(g.root(), g.root()).is_err());
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let mut g = DependencyGraph::new(pkg("root", "1.0.0"));
        let a = g.add_package(pkg("a", "1.0.0"));
        let b = g.add_package(pkg("b", "1.0.0"));
        let c = g.add_package(pkg("c", "1.1.0"));
        g.add_edge(g.root(), a).unwrap();
        g.add_edge(g.root(), b).unwrap();
        g.add_edge(a, c).unwrap();
        g.add_edge(b, c).unwrap();

        let order = g.topological_order();
        let position = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(position(c) < position(a));
        assert!(position(c) < position(b));
        assert!(position(a) < position(g.root()));
        assert!(position(b) < position(g.root()));
    }

    #[test]
    fn topological_order_is_deterministic() {
        let build = || {
            let mut g = DependencyGraph::new(pkg("root", "1.0.0"));
            let a = g.add_package(pkg("alpha", "1.0.0"));
            let b = g.add_package(pkg("beta", "1.0.0"));
            g.add_edge(g.root(), a).unwrap();
            g.add_edge(g.root(), b).unwrap();
            g
        };
        let names = |g: &DependencyGraph| -> Vec<String> {
            g.topological_order()
                .iter()
                .map(|&id| g.package(id).name().to_string())
                .collect()
        };
        assert_eq!(names(&build()), names(&build()));
    }

    #[test]
    fn transitive_dependencies_direct_first() {
        let mut g = DependencyGraph::new(pkg("root", "1.0.0"));
        let a = g.add_package(pkg("a", "1.0.0"));
        let b = g.add_package(pkg("b", "1.0.0"));
        let c = g.add_package(pkg("c", "1.0.0"));
        g.add_edge(g.root(), a).unwrap();
        g.add_edge(g.root(), b).unwrap();
        g.add_edge(a, c).unwrap();
        g.add_edge(b, c).unwrap();

        let deps = g.transitive_dependencies(g.root());
        assert_eq!(deps, vec![a, b, c]);
    }
}
