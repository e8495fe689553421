use crate::graph::graph::{GraphError, PollGraph};
use crate::graph::types::{NodeId, NodePriority, NodeSpec, TaskClass};
use crate::registry::DeviceId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub type TemplateId = Uuid;

/// Device-independent mirror of a graph node
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TemplateNode {
    pub key: String,
    pub name: String,
    pub task_class: TaskClass,
    pub interval_seconds: u32,
    pub priority: NodePriority,
    pub enabled: bool,
    /// Key of the master template node when this is a chain node
    pub chain_of: Option<String>,
    pub parameters: serde_json::Value,
}

/// Reusable task-set definition applied to many device graphs.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskTemplate {
    pub id: TemplateId,
    pub name: String,
    /// When set, template node changes are resynchronized into every
    /// linked graph.
    pub auto_sync: bool,
    pub nodes: Vec<TemplateNode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskTemplate {
    pub fn new(name: &str, auto_sync: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            auto_sync,
            nodes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_node(mut self, node: TemplateNode) -> Self {
        self.nodes.push(node);
        self
    }
}

/// Apply a template to a graph, creating one node per template node.
/// Masters are created before the chain nodes that reference them.
pub fn apply_template(template: &TaskTemplate, graph: &mut PollGraph) -> Result<Vec<NodeId>, GraphError> {
    let mut created = Vec::new();

    let (masters, chains): (Vec<_>, Vec<_>) =
        template.nodes.iter().partition(|n| n.chain_of.is_none());

    for template_node in masters.into_iter().chain(chains) {
        let mut spec = NodeSpec::new(
            &template_node.key,
            template_node.task_class,
            template_node.interval_seconds,
        )
        .with_name(&template_node.name)
        .with_priority(template_node.priority)
        .with_parameters(template_node.parameters.clone());
        spec.enabled = template_node.enabled;
        spec.master_key = template_node.chain_of.clone();

        let node_id = graph.add_node(spec)?;
        graph.node_mut(node_id)?.template_id = Some(template.id);
        created.push(node_id);
    }

    Ok(created)
}

/// Overwrite a bound graph's nodes from the template, honoring per-field
/// override flags. Idempotent: a second pass with the same template is a
/// no-op.
pub fn sync_graph_from_template(template: &TaskTemplate, graph: &mut PollGraph) -> usize {
    let mut synced = 0;

    for template_node in &template.nodes {
        let Some(node_id) = graph.node_id_by_key(&template_node.key) else {
            continue;
        };
        let Ok(node) = graph.node_mut(node_id) else {
            continue;
        };
        if node.template_id != Some(template.id) {
            continue;
        }

        let mut changed = false;
        if !node.overrides.interval && node.interval_seconds != template_node.interval_seconds {
            node.interval_seconds = template_node.interval_seconds;
            changed = true;
        }
        if !node.overrides.priority && node.priority != template_node.priority {
            node.priority = template_node.priority;
            changed = true;
        }
        if !node.overrides.enabled && node.enabled != template_node.enabled {
            node.enabled = template_node.enabled;
            changed = true;
        }
        if !node.overrides.parameters && node.parameters != template_node.parameters {
            node.parameters = template_node.parameters.clone();
            changed = true;
        }

        if changed {
            node.updated_at = Utc::now();
            synced += 1;
        }
    }

    if synced > 0 {
        debug!(
            "Synced {} nodes from template {} into device {}",
            synced, template.name, graph.device_id
        );
    }
    synced
}

/// Registry of templates and the devices each one is linked to.
#[derive(Default)]
pub struct TemplateStore {
    templates: DashMap<TemplateId, TaskTemplate>,
    links: DashMap<TemplateId, Vec<DeviceId>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, template: TaskTemplate) -> TemplateId {
        let id = template.id;
        self.templates.insert(id, template);
        id
    }

    pub fn get(&self, template_id: TemplateId) -> Option<TaskTemplate> {
        self.templates.get(&template_id).map(|t| t.clone())
    }

    /// Record that a template has been applied to a device graph.
    pub fn link(&self, template_id: TemplateId, device_id: DeviceId) {
        let mut devices = self.links.entry(template_id).or_default();
        if !devices.contains(&device_id) {
            devices.push(device_id);
        }
    }

    pub fn linked_devices(&self, template_id: TemplateId) -> Vec<DeviceId> {
        self.links
            .get(&template_id)
            .map(|devices| devices.clone())
            .unwrap_or_default()
    }

    /// Replace a template node definition. Returns the devices that must
    /// be resynchronized (empty unless `auto_sync` is set).
    pub fn update_node(&self, template_id: TemplateId, updated: TemplateNode) -> Vec<DeviceId> {
        let Some(mut template) = self.templates.get_mut(&template_id) else {
            return Vec::new();
        };

        match template.nodes.iter_mut().find(|n| n.key == updated.key) {
            Some(existing) => *existing = updated,
            None => template.nodes.push(updated),
        }
        template.updated_at = Utc::now();

        if !template.auto_sync {
            return Vec::new();
        }

        let devices = self.linked_devices(template_id);
        if !devices.is_empty() {
            info!(
                "Template {} changed, resyncing {} linked devices",
                template.name,
                devices.len()
            );
        }
        devices
    }
}
