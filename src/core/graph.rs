//! Dependency graph analysis for a session's tasks.
//!
//! The session's task map is the source of truth for statuses; this graph
//! is a throwaway view built on demand to answer structural questions:
//! which tasks sit on a cycle, which name a dependency that does not exist,
//! and why a pending task can never become ready.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const REASON_DEPENDENCY_FAILED: &str = "unreachable: dependency failed";
pub const REASON_DEPENDENCY_CYCLE: &str = "unreachable: dependency cycle";
pub const REASON_NO_WORKERS: &str = "unreachable: no workers available";

pub fn unknown_dependency_reason(dep: &TaskId) -> String {
    format!("unreachable: unknown dependency {}", dep)
}

/// Edges point from a dependency to its dependent.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    names: HashMap<TaskId, String>,
    statuses: HashMap<TaskId, TaskStatus>,
    unknown: BTreeMap<TaskId, TaskId>,
    cyclic: HashSet<TaskId>,
}

impl DependencyGraph {
    pub fn from_tasks<'a, I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut names = HashMap::new();
        let mut statuses = HashMap::new();

        for task in &tasks {
            index.insert(task.id, graph.add_node(task.id));
            names.insert(task.id, task.name.clone());
            statuses.insert(task.id, task.status);
        }

        let mut unknown = BTreeMap::new();
        for task in &tasks {
            let to = index[&task.id];
            for dep in &task.dependencies {
                match index.get(dep) {
                    Some(&from) => {
                        graph.update_edge(from, to, ());
                    }
                    None => {
                        unknown.entry(task.id).or_insert(*dep);
                    }
                }
            }
        }

        let cyclic = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.find_edge(scc[0], scc[0]).is_some())
            .flatten()
            .map(|node| graph[node])
            .collect();

        Self {
            graph,
            index,
            names,
            statuses,
            unknown,
            cyclic,
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Tasks that lie on a dependency cycle (including self-dependencies).
    pub fn cyclic_tasks(&self) -> &HashSet<TaskId> {
        &self.cyclic
    }

    pub fn has_cycle(&self) -> bool {
        !self.cyclic.is_empty()
    }

    /// First dependency of `id` that is not part of the graph.
    pub fn unknown_dependency(&self, id: &TaskId) -> Option<TaskId> {
        self.unknown.get(id).copied()
    }

    /// Task ids ordered so each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self.graph[cycle.node_id()];
            let name = self.names.get(&id).map(String::as_str).unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", name))
        })?;
        Ok(sorted.into_iter().map(|node| self.graph[node]).collect())
    }

    /// Every task `id` transitively depends on, nearest first.
    fn ancestors(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut out = Vec::new();
        while let Some(node) = bfs.next(reversed) {
            if node != start {
                out.push(self.graph[node]);
            }
        }
        out
    }

    /// Why a pending task can never become ready.
    ///
    /// A failed ancestor wins over a cycle, which wins over a missing
    /// dependency.
    pub fn unreachable_reason(&self, id: &TaskId) -> String {
        let ancestors = self.ancestors(id);

        if ancestors
            .iter()
            .any(|a| self.statuses.get(a) == Some(&TaskStatus::Failed))
        {
            return REASON_DEPENDENCY_FAILED.to_string();
        }
        if self.cyclic.contains(id) || ancestors.iter().any(|a| self.cyclic.contains(a)) {
            return REASON_DEPENDENCY_CYCLE.to_string();
        }
        if let Some(dep) = std::iter::once(id)
            .chain(ancestors.iter())
            .find_map(|a| self.unknown_dependency(a))
        {
            return unknown_dependency_reason(&dep);
        }
        REASON_DEPENDENCY_FAILED.to_string()
    }
}
