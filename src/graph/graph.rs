use crate::graph::types::*;
use crate::registry::DeviceId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Node key '{0}' already exists in this graph")]
    DuplicateKey(String),
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),
    #[error("Node key '{0}' not found")]
    KeyNotFound(String),
    #[error("Edge {upstream} -> {downstream} would create a cycle")]
    CycleDetected {
        upstream: NodeId,
        downstream: NodeId,
    },
    #[error("A node cannot reference itself")]
    SelfReference,
    #[error("Chain node '{0}' already has a master")]
    MasterAlreadySet(String),
}

/// Directed task graph for one device.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PollGraph {
    pub device_id: DeviceId,
    nodes: HashMap<NodeId, PollNode>,
    key_index: HashMap<String, NodeId>,
    edges: Vec<GraphEdge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u32,
}

impl PollGraph {
    pub fn new(device_id: DeviceId) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            nodes: HashMap::new(),
            key_index: HashMap::new(),
            edges: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Add a node from a specification. A `master_key` makes it a chain
    /// node and records the corresponding chain edge.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        if self.key_index.contains_key(&spec.key) {
            return Err(GraphError::DuplicateKey(spec.key));
        }

        let master_node = match &spec.master_key {
            Some(master_key) => Some(
                self.node_id_by_key(master_key)
                    .ok_or_else(|| GraphError::KeyNotFound(master_key.clone()))?,
            ),
            None => None,
        };

        let now = Utc::now();
        let node = PollNode {
            id: Uuid::new_v4(),
            key: spec.key.clone(),
            name: spec.name,
            task_class: spec.task_class,
            interval_seconds: spec.interval_seconds,
            priority: spec.priority,
            enabled: spec.enabled,
            next_run_at: now,
            last_run_at: None,
            last_success_at: None,
            last_failure_at: None,
            consecutive_failures: 0,
            is_chain_node: master_node.is_some(),
            master_node,
            template_id: None,
            overrides: FieldOverrides::default(),
            parameters: spec.parameters,
            created_at: now,
            updated_at: now,
        };

        let node_id = node.id;
        self.key_index.insert(node.key.clone(), node_id);
        self.nodes.insert(node_id, node);

        if let Some(master) = master_node {
            // add_edge runs the cycle check; a fresh node cannot be an
            // ancestor of its master, so this never fails here.
            self.add_edge(master, node_id, EdgeType::Chain, EdgeCondition::Always)?;
        }

        self.touch();
        debug!("Added node {} to graph for device {}", node_id, self.device_id);
        Ok(node_id)
    }

    /// Record an execution-precedence edge. Rejects edges that would route
    /// a path back to an ancestor.
    pub fn add_edge(
        &mut self,
        upstream: NodeId,
        downstream: NodeId,
        edge_type: EdgeType,
        condition: EdgeCondition,
    ) -> Result<(), GraphError> {
        if upstream == downstream {
            return Err(GraphError::SelfReference);
        }
        if !self.nodes.contains_key(&upstream) {
            return Err(GraphError::NodeNotFound(upstream));
        }
        if !self.nodes.contains_key(&downstream) {
            return Err(GraphError::NodeNotFound(downstream));
        }
        if self.reaches(downstream, upstream) {
            return Err(GraphError::CycleDetected {
                upstream,
                downstream,
            });
        }

        self.edges.push(GraphEdge {
            upstream,
            downstream,
            edge_type,
            condition,
        });
        self.touch();
        Ok(())
    }

    /// Whether `to` is reachable from `from` following edges downstream.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];

        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for edge in self.edges.iter().filter(|e| e.upstream == current) {
                stack.push(edge.downstream);
            }
        }
        false
    }

    pub fn node(&self, node_id: NodeId) -> Result<&PollNode, GraphError> {
        self.nodes
            .get(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> Result<&mut PollNode, GraphError> {
        self.updated_at = Utc::now();
        self.nodes
            .get_mut(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))
    }

    pub fn node_id_by_key(&self, key: &str) -> Option<NodeId> {
        self.key_index.get(key).copied()
    }

    pub fn node_by_key(&self, key: &str) -> Option<&PollNode> {
        self.node_id_by_key(key).and_then(|id| self.nodes.get(&id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PollNode> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut PollNode> {
        self.nodes.values_mut()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes eligible for time-based dispatch, ordered by priority then
    /// how long they have been due. Chain nodes are never returned.
    pub fn due_nodes(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let mut due: Vec<&PollNode> = self.nodes.values().filter(|n| n.is_due(now)).collect();
        due.sort_by(|a, b| {
            b.priority
                .value()
                .cmp(&a.priority.value())
                .then(a.next_run_at.cmp(&b.next_run_at))
        });
        due.into_iter().map(|n| n.id).collect()
    }

    /// Chain edges hanging off a master node, with their trigger
    /// conditions. Disabled downstream nodes are skipped.
    pub fn chain_children(&self, master: NodeId) -> Vec<(NodeId, EdgeCondition)> {
        self.edges
            .iter()
            .filter(|e| e.upstream == master && e.edge_type == EdgeType::Chain)
            .filter(|e| {
                self.nodes
                    .get(&e.downstream)
                    .map(|n| n.enabled)
                    .unwrap_or(false)
            })
            .map(|e| (e.downstream, e.condition))
            .collect()
    }

    /// Expected completions per period for one task class: the sum over
    /// the class's enabled master nodes of `period / interval`, at least
    /// one per node.
    pub fn expected_per_period(&self, task_class: TaskClass, period_secs: i64) -> u32 {
        self.nodes
            .values()
            .filter(|n| n.enabled && !n.is_chain_node && n.task_class == task_class)
            .map(|n| {
                let runs = period_secs / n.interval_seconds.max(1) as i64;
                runs.max(1) as u32
            })
            .sum()
    }

    /// Cheap structural fingerprint of the enabled node set, stable across
    /// runtime-only field changes (timestamps, failure counters).
    pub fn fingerprint(&self) -> String {
        let mut lines: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.enabled)
            .map(|n| {
                format!(
                    "{}|{}|{}|{}|{}",
                    n.key,
                    n.task_class.as_str(),
                    n.interval_seconds,
                    n.priority.value(),
                    n.is_chain_node
                )
            })
            .collect();
        lines.sort();

        let mut hasher = Sha256::new();
        for line in lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

/// Keyed collection of all device graphs. The dashmap entry lock keeps
/// per-device mutation exclusive without a global write lock.
#[derive(Default)]
pub struct GraphStore {
    graphs: DashMap<DeviceId, PollGraph>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, graph: PollGraph) {
        self.graphs.insert(graph.device_id, graph);
    }

    pub fn ensure(&self, device_id: DeviceId) {
        self.graphs
            .entry(device_id)
            .or_insert_with(|| PollGraph::new(device_id));
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.graphs.contains_key(&device_id)
    }

    pub fn with_graph<R>(
        &self,
        device_id: DeviceId,
        f: impl FnOnce(&PollGraph) -> R,
    ) -> Option<R> {
        self.graphs.get(&device_id).map(|graph| f(&graph))
    }

    pub fn with_graph_mut<R>(
        &self,
        device_id: DeviceId,
        f: impl FnOnce(&mut PollGraph) -> R,
    ) -> Option<R> {
        self.graphs.get_mut(&device_id).map(|mut graph| f(&mut graph))
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.graphs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}
