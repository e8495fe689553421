//! Per-device task graphs: nodes, chain edges, and reusable templates.

pub mod graph;
pub mod template;
pub mod types;


pub use graph::{GraphError, GraphStore, PollGraph};
pub use template::{
    TaskTemplate, TemplateId, TemplateNode, TemplateStore, apply_template,
    sync_graph_from_template,
};
pub use types::{
    EdgeCondition, EdgeType, FieldOverrides, GraphEdge, NodeId, NodePriority, NodeSpec, PollNode,
    TaskClass,
};
