//! The physical plan: operator instances, their connections, and their grouping
//! into deployable containers.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::logical::{LogicalGraph, OperatorId, StreamId};

/// The kind tag dispatched on when a worker instantiates an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorKind {
    /// A source operator with no connected inputs.
    Input,
    /// An ordinary operator.
    Generic,
    /// A synthesized merge point for a partitioned stream.
    Unifier,
}

/// One runtime instance of a logical operator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhysicalOperator {
    /// Plan-wide unique numeric id.
    pub id: u32,
    /// The kind tag carried into the deploy descriptor.
    pub kind: OperatorKind,
    /// The logical operator this instantiates. A unifier references the upstream
    /// operator whose partitioned output it merges.
    pub logical: OperatorId,
    /// The declared name; a unifier carries its upstream operator's name.
    pub name: String,
    /// The disjoint key subset owned by this replica; `None` unless partitioned.
    pub partition_keys: Option<BTreeSet<u32>>,
    /// Index of the owning container in [`PhysicalPlan::containers`].
    pub container: Option<usize>,
}

/// Lifecycle state of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    /// Planned, not yet bound to a resource.
    New,
    /// Bound to an allocated process.
    Allocated,
    /// Heartbeating; the worker has reported in since assignment.
    Active,
}

/// A grouping of physical operators destined for one worker process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhysicalContainer {
    /// Generated container id. A replacement container after restart gets a
    /// fresh id; only the member operator set is inherited.
    pub id: u64,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Member operator ids, in deployment order.
    pub operators: Vec<u32>,
    /// Operators awaiting deployment on the next heartbeat exchange.
    pub pending_deploy: BTreeSet<u32>,
    /// Operators awaiting undeployment on the next heartbeat exchange.
    pub pending_undeploy: BTreeSet<u32>,
    /// External allocation id, once assigned.
    pub external_id: Option<String>,
    /// Host of the allocated process, once assigned.
    pub host: Option<String>,
    /// Resolved buffer-server address published for cross-container edges.
    pub address: Option<(String, u16)>,
    /// Memory grant of the allocation, in megabytes.
    pub memory_mb: u64,
}

impl PhysicalContainer {
    /// Creates a new, unassigned container with the given members.
    pub fn new(id: u64, operators: Vec<u32>) -> Self {
        Self {
            id,
            state: ContainerState::New,
            operators,
            pending_deploy: BTreeSet::new(),
            pending_undeploy: BTreeSet::new(),
            external_id: None,
            host: None,
            address: None,
            memory_mb: 0,
        }
    }
}

/// One physical connection between two operator instances.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhysicalEdge {
    /// The logical stream this connection realizes.
    pub stream: StreamId,
    /// Producing operator instance.
    pub source: u32,
    /// Port name on the producer.
    pub source_port: String,
    /// Consuming operator instance.
    pub target: u32,
    /// Port name on the consumer.
    pub target_port: String,
    /// Key subset accepted by the consumer; set exactly when the consumer is a
    /// partitioned replica on a fan-out stream.
    pub partition_keys: Option<BTreeSet<u32>>,
    /// Direct in-process hand-off, implying co-location.
    pub inline: bool,
}

/// The partitioned, container-grouped realization of a logical graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhysicalPlan {
    /// The logical graph this plan realizes.
    pub graph: LogicalGraph,
    /// All operator instances, by id.
    pub operators: BTreeMap<u32, PhysicalOperator>,
    /// All physical connections.
    pub edges: Vec<PhysicalEdge>,
    /// Containers, in resource-request order.
    pub containers: Vec<PhysicalContainer>,
    next_operator_id: u32,
    next_container_id: u64,
}

impl PhysicalPlan {
    pub(crate) fn new(graph: LogicalGraph) -> Self {
        Self {
            graph,
            operators: BTreeMap::new(),
            edges: Vec::new(),
            containers: Vec::new(),
            next_operator_id: 0,
            next_container_id: 0,
        }
    }

    pub(crate) fn allocate_operator_id(&mut self) -> u32 {
        self.next_operator_id += 1;
        self.next_operator_id
    }

    /// Generates a fresh container id. Also used when a lost container is
    /// replaced, so a replacement is distinguishable from its predecessor.
    pub fn allocate_container_id(&mut self) -> u64 {
        self.next_container_id += 1;
        self.next_container_id
    }

    /// Instances of the given logical operator, excluding unifiers.
    pub fn operators_of(&self, logical: OperatorId) -> Vec<&PhysicalOperator> {
        self.operators
            .values()
            .filter(|op| op.logical == logical && op.kind != OperatorKind::Unifier)
            .collect()
    }

    /// The unifier synthesized for `stream`, if any.
    pub fn unifier_for(&self, stream: StreamId) -> Option<&PhysicalOperator> {
        self.operators.values().find(|op| {
            op.kind == OperatorKind::Unifier
                && self.edges.iter().any(|e| e.target == op.id && e.stream == stream)
        })
    }

    /// Index of the container holding operator `id`.
    pub fn container_of(&self, id: u32) -> Option<usize> {
        self.operators.get(&id).and_then(|op| op.container)
    }

    /// Edges whose consumer lives in the container at `index`.
    pub fn edges_into_container(&self, index: usize) -> impl Iterator<Item = &PhysicalEdge> {
        let members: BTreeSet<u32> = self.containers[index].operators.iter().copied().collect();
        self.edges.iter().filter(move |e| members.contains(&e.target))
    }
}
