//! The per-container deployment descriptor: the wire contract telling a remote
//! worker exactly what to instantiate and how to wire it.
//!
//! Descriptors are a computed view over current assignment state. They are
//! regenerated on demand and never patched in place: an edge whose peer container
//! was unassigned at one generation acquires that peer's address simply by being
//! generated again later. With unchanged assignment state, regeneration is
//! byte-identical.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use skein_plan::attributes::{keys, Attributes};
use skein_plan::physical::{OperatorKind, PhysicalEdge, PhysicalPlan};

/// Last completed checkpoint window per physical operator, cached in-process
/// from heartbeats so descriptor generation performs no store I/O.
pub type CheckpointCache = BTreeMap<u32, u64>;

/// The data-plane address published by a producing container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferServer {
    /// Host the producing container publishes on.
    pub host: String,
    /// Port the producing container publishes on.
    pub port: u16,
}

/// Wiring for one incoming stream edge of a deployed operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDeployInfo {
    /// The declared logical stream name.
    pub declared_stream_id: String,
    /// Local port to attach the input to.
    pub port_name: String,
    /// The exact upstream physical instance feeding this input. For a unifier
    /// input, this is the specific partition replica, not the logical operator.
    pub source_node_id: u32,
    /// Port name on the upstream instance.
    pub source_port_name: String,
    /// Key subset this input accepts; set exactly when the edge comes off a
    /// partitioned fan-out that has not been unified.
    pub partition_keys: Option<BTreeSet<u32>>,
    /// Custom partition codec class reference, if the stream declares one.
    pub codec_class: Option<String>,
    /// Direct in-process hand-off; no network hop.
    pub inline: bool,
    /// Address to subscribe on. `None` when inline, or while the source
    /// container is not yet assigned.
    pub buffer_server: Option<BufferServer>,
    /// Copy of the relevant port attribute scope.
    pub attributes: Attributes,
}

/// Wiring for one outgoing stream edge of a deployed operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDeployInfo {
    /// The declared logical stream name.
    pub declared_stream_id: String,
    /// Local port to attach the output to.
    pub port_name: String,
    /// Direct in-process hand-off; no network hop.
    pub inline: bool,
    /// Address downstream consumers must dial; always the producing container's
    /// own address, since the producer is the publisher.
    pub buffer_server: Option<BufferServer>,
    /// Copy of the relevant port attribute scope.
    pub attributes: Attributes,
}

/// Everything a worker needs to instantiate and wire one operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorDeployInfo {
    /// The declared logical operator name.
    pub declared_id: String,
    /// The physical operator id.
    pub id: u32,
    /// Kind tag dispatched on by the worker's operator factory.
    pub kind: OperatorKind,
    /// Checkpoint window to resume from; `None` means start from empty state.
    pub checkpoint_window: Option<u64>,
    /// Copy of the operator attribute scope.
    pub attributes: Attributes,
    /// One entry per incoming stream edge.
    pub inputs: Vec<InputDeployInfo>,
    /// One entry per outgoing (port, stream) pair.
    pub outputs: Vec<OutputDeployInfo>,
}

/// Generates the deployment descriptor for the container at `container`.
///
/// Pure over `plan` and `checkpoints`; all addresses are read from the current
/// container bindings at generation time.
pub fn deploy_info(
    plan: &PhysicalPlan,
    container: usize,
    checkpoints: &CheckpointCache,
) -> Vec<OperatorDeployInfo> {
    let inbound: Vec<&PhysicalEdge> = plan.edges_into_container(container).collect();
    plan.containers[container]
        .operators
        .iter()
        .map(|&id| {
            let op = &plan.operators[&id];
            let inputs = inbound
                .iter()
                .filter(|e| e.target == id)
                .map(|e| input_info(plan, e))
                .collect();
            let outputs = plan
                .edges
                .iter()
                .filter(|e| e.source == id)
                .unique_by(|e| (e.source_port.clone(), e.stream))
                .map(|e| output_info(plan, e))
                .collect();
            OperatorDeployInfo {
                declared_id: op.name.clone(),
                id,
                kind: op.kind,
                checkpoint_window: checkpoints.get(&id).copied(),
                attributes: operator_attributes(plan, op.logical),
                inputs,
                outputs,
            }
        })
        .collect()
}

/// Serializes a descriptor list; byte-stable for unchanged input.
pub fn encode(infos: &[OperatorDeployInfo]) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(infos)
}

/// Deserializes a descriptor list produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Vec<OperatorDeployInfo>, bincode::Error> {
    bincode::deserialize(bytes)
}

fn input_info(plan: &PhysicalPlan, edge: &PhysicalEdge) -> InputDeployInfo {
    let stream = plan.graph.stream(edge.stream);
    let target = &plan.operators[&edge.target];
    // A unifier input has no declared port of its own; it carries the upstream
    // replica's output-port attributes instead.
    let attributes = if target.kind == OperatorKind::Unifier {
        let source = &plan.operators[&edge.source];
        output_port_attributes(plan, source.logical, &edge.source_port)
    } else {
        input_port_attributes(plan, target.logical, &edge.target_port)
    };
    InputDeployInfo {
        declared_stream_id: stream.name.clone(),
        port_name: edge.target_port.clone(),
        source_node_id: edge.source,
        source_port_name: edge.source_port.clone(),
        partition_keys: edge.partition_keys.clone(),
        codec_class: stream.codec.clone(),
        inline: edge.inline,
        buffer_server: if edge.inline {
            None
        } else {
            source_address(plan, edge.source)
        },
        attributes,
    }
}

fn output_info(plan: &PhysicalPlan, edge: &PhysicalEdge) -> OutputDeployInfo {
    let stream = plan.graph.stream(edge.stream);
    let source = &plan.operators[&edge.source];
    // Symmetric to the unifier input case: the merged output re-exposes the
    // stream to the downstream consumer and carries its input-port attributes.
    let attributes = if source.kind == OperatorKind::Unifier {
        let target = &plan.operators[&edge.target];
        input_port_attributes(plan, target.logical, &edge.target_port)
    } else {
        output_port_attributes(plan, source.logical, &edge.source_port)
    };
    OutputDeployInfo {
        declared_stream_id: stream.name.clone(),
        port_name: edge.source_port.clone(),
        inline: edge.inline,
        buffer_server: if edge.inline {
            None
        } else {
            source_address(plan, edge.source)
        },
        attributes,
    }
}

/// The operator attribute copy shipped in the descriptor. The checkpoint
/// interval resolves through the graph scope, so a worker never needs the
/// graph to learn its cadence.
fn operator_attributes(plan: &PhysicalPlan, logical: skein_plan::logical::OperatorId) -> Attributes {
    let mut attributes = plan.graph.operator(logical).attributes.clone();
    if attributes.get(keys::CHECKPOINT_INTERVAL_MILLIS).is_none() {
        if let Some(interval) = plan.graph.attributes().get(keys::CHECKPOINT_INTERVAL_MILLIS) {
            attributes.set(keys::CHECKPOINT_INTERVAL_MILLIS, interval.clone());
        }
    }
    attributes
}

/// The current address of the container holding `operator`, if assigned.
fn source_address(plan: &PhysicalPlan, operator: u32) -> Option<BufferServer> {
    plan.container_of(operator)
        .and_then(|index| plan.containers[index].address.as_ref())
        .map(|(host, port)| BufferServer {
            host: host.clone(),
            port: *port,
        })
}

fn input_port_attributes(
    plan: &PhysicalPlan,
    logical: skein_plan::logical::OperatorId,
    port: &str,
) -> Attributes {
    plan.graph
        .operator(logical)
        .inputs
        .iter()
        .find(|p| p.name == port)
        .map(|p| p.attributes.clone())
        .unwrap_or_default()
}

fn output_port_attributes(
    plan: &PhysicalPlan,
    logical: skein_plan::logical::OperatorId,
    port: &str,
) -> Attributes {
    plan.graph
        .operator(logical)
        .outputs
        .iter()
        .find(|p| p.name == port)
        .map(|p| p.attributes.clone())
        .unwrap_or_default()
}
