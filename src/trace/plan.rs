//! Executor plan shape as handed over by the server.
//!
//! Nodes are addressed by their preorder position in the tree ([`NodeId`]),
//! which is how executor events refer to them.

use serde_json::{Map, Value, json};

use crate::trace::model::NodeTraceData;

/// Preorder index of a plan node, root is 0.
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    /// Explain node type, e.g. `Seq Scan`.
    pub node_type: String,
    /// Remaining explain properties (`Relation Name`, `Startup Cost`, ...).
    pub details: Map<String, Value>,
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            details: Map::new(),
            children: Vec::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_child(mut self, child: PlanNode) -> Self {
        self.children.push(child);
        self
    }

    /// Nodes in preorder, so `preorder()[id]` is the node with that id.
    pub fn preorder(&self) -> Vec<&PlanNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Explain properties of this node alone.
    pub fn explain_node(&self) -> Value {
        Value::Object(self.node_properties())
    }

    fn node_properties(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("Node Type".to_string(), json!(self.node_type));
        for (k, v) in &self.details {
            obj.insert(k.clone(), v.clone());
        }
        obj
    }

    /// Explain tree in the usual JSON explain shape.
    pub fn explain(&self) -> Value {
        self.explain_annotated(&mut 0, &|_| None)
    }

    /// Explain tree with `traceData` on every node that ran.
    pub fn explain_with_stats(&self, stats: &[NodeTraceData]) -> Value {
        self.explain_annotated(&mut 0, &|id| {
            stats
                .get(id)
                .filter(|s| s.total_calls > 0)
                .map(|s| json!(s))
        })
    }

    fn explain_annotated(&self, next_id: &mut NodeId, annotate: &dyn Fn(NodeId) -> Option<Value>) -> Value {
        let id = *next_id;
        *next_id += 1;
        let mut obj = self.node_properties();
        if let Some(data) = annotate(id) {
            obj.insert("traceData".to_string(), data);
        }
        if !self.children.is_empty() {
            let plans: Vec<Value> = self
                .children
                .iter()
                .map(|c| c.explain_annotated(next_id, annotate))
                .collect();
            obj.insert("Plans".to_string(), Value::Array(plans));
        }
        Value::Object(obj)
    }
}

/// Plan of one executor run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub query_text: String,
    pub root: PlanNode,
}

impl ExecutionPlan {
    pub fn new(query_text: impl Into<String>, root: PlanNode) -> Self {
        Self {
            query_text: query_text.into(),
            root,
        }
    }
}
