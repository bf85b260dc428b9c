use super::node::{Node, TaskNode, ValueSource, WorkflowDefinition};
use crate::context::FieldPath;
use crate::error::DefinitionError;
use crate::types::StateName;
use super::branch::Target;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

/// Transition graph of a workflow's top-level states
pub struct WorkflowGraph {
    graph: DiGraph<StateName, ()>,
    indices: HashMap<StateName, NodeIndex>,
    start: NodeIndex,
}

impl WorkflowGraph {
    /// Build and validate the graph for a definition
    pub fn from_definition(definition: &WorkflowDefinition) -> Result<Self, DefinitionError> {
        if definition.states.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        let mut waits = HashSet::new();

        for state in &definition.states {
            if indices.contains_key(&state.name) {
                return Err(DefinitionError::DuplicateState(state.name.to_string()));
            }
            let index = graph.add_node(state.name.clone());
            indices.insert(state.name.clone(), index);
            if matches!(state.node, Node::Wait(_)) {
                waits.insert(index);
            }
        }

        let start = *indices
            .get(&definition.start_at)
            .ok_or_else(|| DefinitionError::MissingStart(definition.start_at.to_string()))?;

        for state in &definition.states {
            let name = state.name.as_str();
            check_node(name, &state.node, true)?;

            let mut targets: Vec<&StateName> = Vec::new();
            match &state.node {
                Node::Branch(branch) => {
                    for choice in &branch.choices {
                        if let Target::Goto { state } = &choice.target {
                            targets.push(state);
                        }
                    }
                    if let Target::Goto { state } = &branch.default {
                        targets.push(state);
                    }
                }
                Node::Wait(_) if state.next.is_none() => {
                    return Err(DefinitionError::WaitWithoutNext(name.to_string()));
                }
                _ => targets.extend(state.next.as_ref()),
            }

            let from = indices[&state.name];
            for target in targets {
                let to = indices.get(target).ok_or_else(|| DefinitionError::UnknownState {
                    from: name.to_string(),
                    to: target.to_string(),
                })?;
                graph.update_edge(from, *to, ());
            }
        }

        // Every cycle must pass through a wait, otherwise it spins without
        // ever suspending
        for component in petgraph::algo::tarjan_scc(&graph) {
            let cyclic = component.len() > 1
                || graph.find_edge(component[0], component[0]).is_some();
            if cyclic && !component.iter().any(|n| waits.contains(n)) {
                let mut names: Vec<String> =
                    component.iter().map(|n| graph[*n].to_string()).collect();
                names.sort();
                return Err(DefinitionError::BusyLoop(names));
            }
        }

        let built = Self {
            graph,
            indices,
            start,
        };
        for state in built.unreachable() {
            tracing::warn!(
                "State {} of workflow {} is unreachable",
                state,
                definition.name
            );
        }
        Ok(built)
    }

    /// States that cannot be reached from the start state
    pub fn unreachable(&self) -> Vec<StateName> {
        let mut seen = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, self.start);
        while let Some(node) = dfs.next(&self.graph) {
            seen.insert(node);
        }

        let mut missing: Vec<StateName> = self
            .graph
            .node_indices()
            .filter(|n| !seen.contains(n))
            .map(|n| self.graph[n].clone())
            .collect();
        missing.sort();
        missing
    }

    /// All `(from, to)` transitions
    pub fn transitions(&self) -> Vec<(StateName, StateName)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (self.graph[a].clone(), self.graph[b].clone()))
            .collect();
        edges.sort();
        edges
    }
}

fn check_path(state: &str, path: &str) -> Result<(), DefinitionError> {
    FieldPath::parse(path)
        .map(|_| ())
        .map_err(|_| DefinitionError::InvalidPath {
            state: state.to_string(),
            path: path.to_string(),
        })
}

fn check_task(state: &str, task: &TaskNode) -> Result<(), DefinitionError> {
    for source in task.parameters.values() {
        for path in source.required_paths() {
            check_path(state, path)?;
        }
        if let ValueSource::Format { template, args } = source {
            let expected = template.matches("{}").count();
            if expected != args.len() {
                return Err(DefinitionError::FormatArity {
                    state: state.to_string(),
                    expected,
                    given: args.len(),
                });
            }
        }
    }
    Ok(())
}

fn check_node(state: &str, node: &Node, top_level: bool) -> Result<(), DefinitionError> {
    match node {
        Node::Task(task) => check_task(state, task),
        Node::Wait(_) if !top_level => {
            Err(DefinitionError::NestedControlNode(state.to_string(), "wait"))
        }
        Node::Branch(_) if !top_level => {
            Err(DefinitionError::NestedControlNode(state.to_string(), "branch"))
        }
        Node::Wait(_) => Ok(()),
        Node::Branch(branch) => {
            for choice in &branch.choices {
                for path in choice.predicate.paths() {
                    check_path(state, path)?;
                }
            }
            Ok(())
        }
        Node::Parallel(parallel) => {
            if parallel.branches.is_empty() {
                return Err(DefinitionError::EmptyParallel(state.to_string()));
            }
            parallel
                .branches
                .iter()
                .try_for_each(|b| check_node(state, b, false))
        }
        Node::Map(map) => {
            check_path(state, &map.items_path)?;
            check_node(state, &map.iterator, false)
        }
        Node::Sequence { steps } => steps.iter().try_for_each(|s| check_node(state, s, false)),
    }
}
