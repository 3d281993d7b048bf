use crate::definition::{FlowSpec, NodeKind, NodeSpec, ProcessModel, TimerSpec};
use serde_json::Value;
use std::collections::HashMap;

/// Fluent builder for `ProcessModel`, mainly for tests and embedders
/// that construct definitions programmatically instead of loading YAML.
pub struct DefinitionBuilder {
    id: String,
    name: String,
    version: u32,
    variables: HashMap<String, Value>,
    nodes: Vec<NodeSpec>,
    flows: Vec<FlowSpec>,
    flow_seq: u32,
}

impl DefinitionBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            version: 1,
            variables: HashMap::new(),
            nodes: Vec::new(),
            flows: Vec::new(),
            flow_seq: 0,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    fn node(mut self, id: &str, kind: NodeKind) -> Self {
        self.nodes.push(NodeSpec {
            id: id.to_string(),
            kind,
        });
        self
    }

    pub fn start(self, id: &str) -> Self {
        self.node(id, NodeKind::StartEvent)
    }

    pub fn end(self, id: &str) -> Self {
        self.node(id, NodeKind::EndEvent)
    }

    pub fn task(self, id: &str) -> Self {
        self.node(id, NodeKind::Task)
    }

    pub fn service_task(self, id: &str, task: &str) -> Self {
        self.node(
            id,
            NodeKind::ServiceTask {
                task: task.to_string(),
                properties: serde_json::Map::new(),
                extensions: serde_json::Map::new(),
            },
        )
    }

    pub fn service_task_with(self, id: &str, task: &str, properties: Value) -> Self {
        let properties = properties.as_object().cloned().unwrap_or_default();
        self.node(
            id,
            NodeKind::ServiceTask {
                task: task.to_string(),
                properties,
                extensions: serde_json::Map::new(),
            },
        )
    }

    pub fn script_task(self, id: &str, script: &str) -> Self {
        self.node(
            id,
            NodeKind::ScriptTask {
                script: script.to_string(),
            },
        )
    }

    pub fn exclusive(self, id: &str) -> Self {
        self.node(id, NodeKind::ExclusiveGateway)
    }

    pub fn parallel(self, id: &str) -> Self {
        self.node(id, NodeKind::ParallelGateway)
    }

    pub fn inclusive(self, id: &str) -> Self {
        self.node(id, NodeKind::InclusiveGateway)
    }

    pub fn timer(self, id: &str, timer: TimerSpec) -> Self {
        self.node(id, NodeKind::TimerCatchEvent { timer })
    }

    pub fn boundary_timer(self, id: &str, attached_to: &str, timer: TimerSpec) -> Self {
        self.node(
            id,
            NodeKind::BoundaryTimer {
                attached_to: attached_to.to_string(),
                timer,
            },
        )
    }

    fn flow(mut self, source: &str, target: &str, condition: Option<String>) -> Self {
        self.flow_seq += 1;
        self.flows.push(FlowSpec {
            id: format!("f{}", self.flow_seq),
            source: source.to_string(),
            target: target.to_string(),
            condition,
        });
        self
    }

    pub fn connect(self, source: &str, target: &str) -> Self {
        self.flow(source, target, None)
    }

    pub fn connect_if(self, source: &str, target: &str, condition: &str) -> Self {
        self.flow(source, target, Some(condition.to_string()))
    }

    pub fn build(self) -> ProcessModel {
        ProcessModel {
            id: self.id,
            name: self.name,
            version: self.version,
            variables: self.variables,
            nodes: self.nodes,
            flows: self.flows,
        }
    }
}
