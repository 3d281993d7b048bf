pub mod builder;
pub mod loader;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Index into `ProcessDefinition::flows`, in declared order.
pub type FlowIndex = usize;

/// Timer configuration for catch events and boundary events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TimerSpec {
    /// Relative duration from the moment the token parks.
    Duration { ms: u64 },
    /// Absolute deadline (epoch milliseconds, UTC).
    Until { at_ms: i64 },
}

impl TimerSpec {
    /// Resolve the absolute deadline given the current wall clock.
    pub fn due_at(&self, now_ms: i64) -> i64 {
        match self {
            TimerSpec::Duration { ms } => now_ms + *ms as i64,
            TimerSpec::Until { at_ms } => *at_ms,
        }
    }
}

/// Node variants, one tagged config per BPMN element kind so the engine
/// can match exhaustively. Vendor extension attributes are carried as an
/// opaque side-channel (`extensions`) and handed to the task dispatcher
/// uninterpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    /// Abstract task: synchronous pass-through.
    Task,
    ServiceTask {
        task: String,
        #[serde(default)]
        properties: serde_json::Map<String, Value>,
        #[serde(default)]
        extensions: serde_json::Map<String, Value>,
    },
    ScriptTask {
        script: String,
    },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    TimerCatchEvent {
        timer: TimerSpec,
    },
    /// Interrupting timer attached to a task. Never entered via a flow.
    BoundaryTimer {
        attached_to: String,
        timer: TimerSpec,
    },
}

impl NodeKind {
    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            NodeKind::ExclusiveGateway | NodeKind::ParallelGateway | NodeKind::InclusiveGateway
        )
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self, NodeKind::BoundaryTimer { .. })
    }

    /// Node kinds a boundary timer may attach to.
    pub fn accepts_boundary(&self) -> bool {
        matches!(self, NodeKind::Task | NodeKind::ServiceTask { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub id: String,
    pub source: String,
    pub target: String,
    /// A flow without a condition out of an exclusive/inclusive gateway
    /// is the gateway's default flow.
    #[serde(default)]
    pub condition: Option<String>,
}

/// Raw, serializable process model as handed over by an importer or
/// loaded from YAML. Validated into a `ProcessDefinition` by `parse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub nodes: Vec<NodeSpec>,
    pub flows: Vec<FlowSpec>,
}

fn default_version() -> u32 {
    1
}

/// Definition-time rejection. An instance can never start from a model
/// that fails validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MalformedGraph {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("duplicate flow id: {0}")]
    DuplicateFlow(String),
    #[error("flow {flow} references unknown node: {node}")]
    DanglingFlow { flow: String, node: String },
    #[error("definition must contain exactly one start event, found {0}")]
    StartEventCount(usize),
    #[error("definition contains no end event")]
    NoEndEvent,
    #[error("node {0} has no incoming flow")]
    NoIncoming(String),
    #[error("node {0} has no outgoing flow")]
    NoOutgoing(String),
    #[error("node {0} has multiple outgoing flows but is not a gateway")]
    ImplicitFork(String),
    #[error("gateway {0} has more than one default (unconditioned) flow")]
    MultipleDefaults(String),
    #[error("gateway {0} has no conditioned outgoing flow and no single default")]
    NoViableFlow(String),
    #[error("boundary event {event} attached to missing or non-task node: {host}")]
    BadBoundaryHost { event: String, host: String },
    #[error("boundary event {0} must not have incoming flows")]
    BoundaryIncoming(String),
    #[error("node {0} is unreachable from the start event")]
    Unreachable(String),
}

/// Validated, immutable process graph with adjacency lookups.
///
/// One `ProcessDefinition` is shared read-only (behind an `Arc`) across
/// every instance pinned to its `(id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    pub version: u32,
    /// Defaults written into the root scope before caller-supplied
    /// initial variables.
    pub initial_variables: HashMap<String, Value>,
    nodes: Vec<NodeSpec>,
    flows: Vec<FlowSpec>,
    node_index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<FlowIndex>>,
    incoming: HashMap<String, Vec<FlowIndex>>,
    /// Host task id -> boundary event ids, declared order.
    boundaries: HashMap<String, Vec<String>>,
    start_id: String,
}

impl ProcessDefinition {
    /// Validate a raw model into an executable definition.
    pub fn parse(model: ProcessModel) -> Result<Self, MalformedGraph> {
        let mut node_index: HashMap<String, usize> = HashMap::new();
        for (idx, node) in model.nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), idx).is_some() {
                return Err(MalformedGraph::DuplicateNode(node.id.clone()));
            }
        }

        let mut flow_ids: HashSet<&str> = HashSet::new();
        let mut outgoing: HashMap<String, Vec<FlowIndex>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<FlowIndex>> = HashMap::new();
        for (idx, flow) in model.flows.iter().enumerate() {
            if !flow_ids.insert(&flow.id) {
                return Err(MalformedGraph::DuplicateFlow(flow.id.clone()));
            }
            for endpoint in [&flow.source, &flow.target] {
                if !node_index.contains_key(endpoint) {
                    return Err(MalformedGraph::DanglingFlow {
                        flow: flow.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
            outgoing.entry(flow.source.clone()).or_default().push(idx);
            incoming.entry(flow.target.clone()).or_default().push(idx);
        }

        let starts: Vec<&NodeSpec> = model
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::StartEvent)
            .collect();
        if starts.len() != 1 {
            return Err(MalformedGraph::StartEventCount(starts.len()));
        }
        let start_id = starts[0].id.clone();

        if !model.nodes.iter().any(|n| n.kind == NodeKind::EndEvent) {
            return Err(MalformedGraph::NoEndEvent);
        }

        let mut boundaries: HashMap<String, Vec<String>> = HashMap::new();
        for node in &model.nodes {
            if let NodeKind::BoundaryTimer { attached_to, .. } = &node.kind {
                let host_ok = node_index
                    .get(attached_to)
                    .map(|&i| model.nodes[i].kind.accepts_boundary())
                    .unwrap_or(false);
                if !host_ok {
                    return Err(MalformedGraph::BadBoundaryHost {
                        event: node.id.clone(),
                        host: attached_to.clone(),
                    });
                }
                if incoming.contains_key(&node.id) {
                    return Err(MalformedGraph::BoundaryIncoming(node.id.clone()));
                }
                boundaries
                    .entry(attached_to.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }

        for node in &model.nodes {
            let n_in = incoming.get(&node.id).map(Vec::len).unwrap_or(0);
            let n_out = outgoing.get(&node.id).map(Vec::len).unwrap_or(0);

            let needs_incoming =
                !matches!(node.kind, NodeKind::StartEvent) && !node.kind.is_boundary();
            if needs_incoming && n_in == 0 {
                return Err(MalformedGraph::NoIncoming(node.id.clone()));
            }

            if !matches!(node.kind, NodeKind::EndEvent) && n_out == 0 {
                return Err(MalformedGraph::NoOutgoing(node.id.clone()));
            }
            if !node.kind.is_gateway() && n_out > 1 {
                return Err(MalformedGraph::ImplicitFork(node.id.clone()));
            }

            if matches!(
                node.kind,
                NodeKind::ExclusiveGateway | NodeKind::InclusiveGateway
            ) {
                let flows = outgoing.get(&node.id).map(Vec::as_slice).unwrap_or(&[]);
                let unconditioned = flows
                    .iter()
                    .filter(|&&i| model.flows[i].condition.is_none())
                    .count();
                let conditioned = flows.len() - unconditioned;
                if unconditioned > 1 {
                    return Err(MalformedGraph::MultipleDefaults(node.id.clone()));
                }
                if conditioned == 0 && flows.len() != 1 {
                    return Err(MalformedGraph::NoViableFlow(node.id.clone()));
                }
            }
        }

        // Reachability from the start event. Boundary events hang off their
        // host, so a reachable host makes its boundaries reachable too.
        let mut reached: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<String> = VecDeque::new();
        reached.insert(start_id.clone());
        frontier.push_back(start_id.clone());
        while let Some(current) = frontier.pop_front() {
            let mut successors: Vec<String> = outgoing
                .get(&current)
                .map(Vec::as_slice)
                .unwrap_or(&[])
                .iter()
                .map(|&i| model.flows[i].target.clone())
                .collect();
            if let Some(events) = boundaries.get(&current) {
                successors.extend(events.iter().cloned());
            }
            for next in successors {
                if reached.insert(next.clone()) {
                    frontier.push_back(next);
                }
            }
        }
        for node in &model.nodes {
            if !reached.contains(&node.id) {
                return Err(MalformedGraph::Unreachable(node.id.clone()));
            }
        }

        Ok(Self {
            id: model.id,
            name: model.name,
            version: model.version,
            initial_variables: model.variables,
            nodes: model.nodes,
            flows: model.flows,
            node_index,
            outgoing,
            incoming,
            boundaries,
            start_id,
        })
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn start_node(&self) -> &NodeSpec {
        // Validated in parse: exactly one start event exists.
        self.node(&self.start_id).unwrap()
    }

    /// Outgoing flows in declared order. Declared order is the tie-break
    /// for exclusive-gateway selection.
    pub fn outgoing_flows(&self, node_id: &str) -> Vec<&FlowSpec> {
        self.outgoing
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .map(|&i| &self.flows[i])
            .collect()
    }

    pub fn incoming_flows(&self, node_id: &str) -> Vec<&FlowSpec> {
        self.incoming
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .map(|&i| &self.flows[i])
            .collect()
    }

    /// Boundary event ids attached to a task, declared order.
    pub fn boundaries(&self, host_id: &str) -> &[String] {
        self.boundaries
            .get(host_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::builder::DefinitionBuilder;

    #[test]
    fn parse_rejects_dangling_flow() {
        let mut model = DefinitionBuilder::new("p").start("s").end("e").build();
        model.flows.push(FlowSpec {
            id: "bad".into(),
            source: "s".into(),
            target: "nowhere".into(),
            condition: None,
        });
        let err = ProcessDefinition::parse(model).unwrap_err();
        assert!(matches!(err, MalformedGraph::DanglingFlow { .. }));
    }

    #[test]
    fn parse_rejects_unreachable_end() {
        let model = DefinitionBuilder::new("p")
            .start("s")
            .end("e1")
            .end("e2")
            .connect("s", "e1")
            .build();
        let err = ProcessDefinition::parse(model).unwrap_err();
        assert_eq!(err, MalformedGraph::Unreachable("e2".into()));
    }

    #[test]
    fn parse_rejects_gateway_with_two_defaults() {
        let model = DefinitionBuilder::new("p")
            .start("s")
            .exclusive("gw")
            .end("e1")
            .end("e2")
            .connect("s", "gw")
            .connect("gw", "e1")
            .connect("gw", "e2")
            .build();
        let err = ProcessDefinition::parse(model).unwrap_err();
        assert_eq!(err, MalformedGraph::MultipleDefaults("gw".into()));
    }

    #[test]
    fn outgoing_flows_keep_declared_order() {
        let model = DefinitionBuilder::new("p")
            .start("s")
            .exclusive("gw")
            .end("e1")
            .end("e2")
            .connect("s", "gw")
            .connect_if("gw", "e1", "amount > 50")
            .connect_if("gw", "e2", "amount > 0")
            .build();
        let def = ProcessDefinition::parse(model).unwrap();
        let flows = def.outgoing_flows("gw");
        assert_eq!(flows[0].target, "e1");
        assert_eq!(flows[1].target, "e2");
    }
}
