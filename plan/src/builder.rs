//! Translation of a logical graph into a physical plan.
//!
//! The translation runs in three passes: partition expansion (one instance per
//! replica), unifier insertion (a pure rewrite adding one merge operator per
//! partitioned stream that converges on a single downstream input), and container
//! packing under the maximum-container bound. Each pass is deterministic, so two
//! builds of the same graph yield identical plans.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::attributes::{keys, AttrValue};
use crate::logical::{LogicalGraph, OperatorId, StreamId};
use crate::physical::{
    OperatorKind, PhysicalContainer, PhysicalEdge, PhysicalOperator, PhysicalPlan,
};

/// Errors raised while building a physical plan. All are configuration errors:
/// fatal, surfaced to the operator of the system, never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The graph declares no operators.
    #[error("graph declares no operators")]
    EmptyGraph,
    /// The maximum-container bound is zero.
    #[error("maximum container count must be at least 1")]
    NoContainers,
    /// The graph contains a cycle.
    #[error("graph contains a cycle")]
    Cyclic,
    /// An inline stream's endpoints cannot share a container because one of them
    /// is partitioned.
    #[error("inline stream `{0}` touches a partitioned operator")]
    InlineConflict(String),
}

/// A container-packing policy.
///
/// `units` are groups of operator ids that must be placed whole (an inline
/// cluster, or a single operator), in topological order of their first member.
/// Implementations return the member lists of the containers to create, and must
/// never return more than `max_containers` groups.
pub trait Packing {
    /// Groups `units` into at most `max_containers` container member lists.
    fn pack(&self, units: &[Vec<u32>], max_containers: usize) -> Vec<Vec<u32>>;
}

/// The default policy: fill containers greedily in unit order, with a
/// per-container capacity of `ceil(total / max_containers)`. A unit that would
/// overflow the current container opens the next one while the bound allows;
/// the final container absorbs any remainder.
pub struct DefaultPacking;

impl Packing for DefaultPacking {
    fn pack(&self, units: &[Vec<u32>], max_containers: usize) -> Vec<Vec<u32>> {
        let total: usize = units.iter().map(Vec::len).sum();
        let capacity = total.div_ceil(max_containers);
        let mut containers: Vec<Vec<u32>> = Vec::new();
        for unit in units {
            let at_bound = containers.len() == max_containers;
            match containers.last_mut() {
                Some(last) if last.len() + unit.len() <= capacity || at_bound => {
                    last.extend(unit);
                }
                _ => containers.push(unit.clone()),
            }
        }
        containers
    }
}

/// Builds a physical plan with the default packing policy.
pub fn build(graph: LogicalGraph, max_containers: usize) -> Result<PhysicalPlan, BuildError> {
    build_with(graph, max_containers, &DefaultPacking)
}

/// Builds a physical plan with an explicit packing policy.
pub fn build_with(
    graph: LogicalGraph,
    max_containers: usize,
    packing: &dyn Packing,
) -> Result<PhysicalPlan, BuildError> {
    if graph.operators().next().is_none() {
        return Err(BuildError::EmptyGraph);
    }
    if max_containers == 0 {
        return Err(BuildError::NoContainers);
    }

    let order = topological_order(&graph)?;
    check_inline_feasibility(&graph)?;

    let mut plan = PhysicalPlan::new(graph);

    // Partition expansion: one instance per replica, keys split over the codec
    // key space as `j % k == i`.
    let mut replicas: BTreeMap<OperatorId, Vec<u32>> = BTreeMap::new();
    for &op in &order {
        let meta = plan.graph.operator(op);
        let name = meta.name.clone();
        let kind = if plan.graph.input_streams(op).next().is_none() {
            OperatorKind::Input
        } else {
            OperatorKind::Generic
        };
        let k = plan.graph.partition_count(op);
        let key_space = match plan.graph.resolve_operator_attr(op, keys::PARTITION_KEY_SPACE) {
            Some(AttrValue::Int(s)) if *s >= k as i64 => *s as usize,
            _ => k,
        };
        let mut ids = Vec::with_capacity(k);
        for i in 0..k {
            let id = plan.allocate_operator_id();
            let partition_keys = if k > 1 {
                Some((0..key_space as u32).filter(|j| *j as usize % k == i).collect())
            } else {
                None
            };
            plan.operators.insert(
                id,
                PhysicalOperator {
                    id,
                    kind,
                    logical: op,
                    name: name.clone(),
                    partition_keys,
                    container: None,
                },
            );
            ids.push(id);
        }
        replicas.insert(op, ids);
    }

    // Unifier insertion and edge expansion, stream by stream.
    let mut unifiers: BTreeMap<OperatorId, Vec<u32>> = BTreeMap::new();
    let stream_ids: Vec<StreamId> = plan.graph.streams().map(|(id, _)| id).collect();
    for stream in stream_ids {
        expand_stream(&mut plan, stream, &replicas, &mut unifiers);
    }

    // Packing order: replicas in topological order, each operator's unifiers
    // immediately after its replicas and before any consumer.
    let mut packing_order = Vec::with_capacity(plan.operators.len());
    for &op in &order {
        packing_order.extend(replicas[&op].iter().copied());
        if let Some(merge) = unifiers.get(&op) {
            packing_order.extend(merge.iter().copied());
        }
    }

    let units = inline_units(&plan, &packing_order);
    let members = packing.pack(&units, max_containers);
    assert!(members.len() <= max_containers);
    for ops in members {
        let id = plan.allocate_container_id();
        for &op in &ops {
            let index = plan.containers.len();
            if let Some(operator) = plan.operators.get_mut(&op) {
                operator.container = Some(index);
            }
        }
        plan.containers.push(PhysicalContainer::new(id, ops));
    }

    debug!(
        operators = plan.operators.len(),
        edges = plan.edges.len(),
        containers = plan.containers.len(),
        "physical plan built"
    );
    Ok(plan)
}

/// Expands one logical stream into physical edges, synthesizing a unifier when
/// the source is partitioned.
fn expand_stream(
    plan: &mut PhysicalPlan,
    stream: StreamId,
    replicas: &BTreeMap<OperatorId, Vec<u32>>,
    unifiers: &mut BTreeMap<OperatorId, Vec<u32>>,
) {
    let meta = plan.graph.stream(stream).clone();
    let source_op = meta.source.operator;
    let source_port = plan.graph.operator(source_op).outputs[meta.source.port].name.clone();
    let sources = &replicas[&source_op];

    // A partitioned output converging on single logical inputs merges through
    // exactly one unifier; its port name embeds the original port name.
    let (upstream, upstream_port) = if sources.len() > 1 {
        let merge_port = format!("<merge#{}>", source_port);
        let id = plan.allocate_operator_id();
        plan.operators.insert(
            id,
            PhysicalOperator {
                id,
                kind: OperatorKind::Unifier,
                logical: source_op,
                name: plan.graph.operator(source_op).name.clone(),
                partition_keys: None,
                container: None,
            },
        );
        unifiers.entry(source_op).or_default().push(id);
        for &replica in sources {
            plan.edges.push(PhysicalEdge {
                stream,
                source: replica,
                source_port: source_port.clone(),
                target: id,
                target_port: merge_port.clone(),
                partition_keys: None,
                inline: false,
            });
        }
        (id, merge_port)
    } else {
        (sources[0], source_port)
    };

    for sink in &meta.sinks {
        let sink_port = plan.graph.operator(sink.operator).inputs[sink.port].name.clone();
        for &target in &replicas[&sink.operator] {
            let partition_keys = plan.operators[&target].partition_keys.clone();
            plan.edges.push(PhysicalEdge {
                stream,
                source: upstream,
                source_port: upstream_port.clone(),
                target,
                target_port: sink_port.clone(),
                partition_keys,
                inline: meta.inline,
            });
        }
    }
}

/// Operators in an order where every stream's source precedes its sinks.
fn topological_order(graph: &LogicalGraph) -> Result<Vec<OperatorId>, BuildError> {
    let count = graph.operators().count();
    let mut indegree = vec![0usize; count];
    for (_, stream) in graph.streams() {
        for sink in &stream.sinks {
            indegree[sink.operator.0] += 1;
        }
    }
    // Kept sorted descending so `pop` yields the smallest ready id.
    let mut ready: Vec<OperatorId> = (0..count)
        .filter(|i| indegree[*i] == 0)
        .map(OperatorId)
        .collect();
    ready.reverse();
    let mut order = Vec::with_capacity(count);
    while let Some(op) = ready.pop() {
        order.push(op);
        for (_, stream) in graph.output_streams(op) {
            for sink in &stream.sinks {
                indegree[sink.operator.0] -= 1;
                if indegree[sink.operator.0] == 0 {
                    ready.push(sink.operator);
                }
            }
        }
        ready.sort();
        ready.reverse();
    }
    if order.len() == count {
        Ok(order)
    } else {
        Err(BuildError::Cyclic)
    }
}

/// Rejects inline streams whose endpoints cannot share a container.
fn check_inline_feasibility(graph: &LogicalGraph) -> Result<(), BuildError> {
    for (_, stream) in graph.streams() {
        if !stream.inline {
            continue;
        }
        let partitioned = std::iter::once(stream.source.operator)
            .chain(stream.sinks.iter().map(|s| s.operator))
            .any(|op| graph.partition_count(op) > 1);
        if partitioned {
            return Err(BuildError::InlineConflict(stream.name.clone()));
        }
    }
    Ok(())
}

/// Groups operators that must be co-located by inline streams into placement
/// units, preserving `packing_order` for unit order and unit contents.
fn inline_units(plan: &PhysicalPlan, packing_order: &[u32]) -> Vec<Vec<u32>> {
    let count = plan.graph.operators().count();
    let mut parent: Vec<usize> = (0..count).collect();
    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        if parent[x] != x {
            let root = find(parent, parent[x]);
            parent[x] = root;
        }
        parent[x]
    }
    let mut inlined = vec![false; count];
    for (_, stream) in plan.graph.streams() {
        if stream.inline {
            inlined[stream.source.operator.0] = true;
            let a = find(&mut parent, stream.source.operator.0);
            for sink in &stream.sinks {
                inlined[sink.operator.0] = true;
                let b = find(&mut parent, sink.operator.0);
                parent[b] = a;
            }
        }
    }

    // Only operators an inline stream touches cluster through the union-find;
    // replicas of a partitioned operator and unifiers are each their own unit.
    let mut units: Vec<Vec<u32>> = Vec::new();
    let mut unit_of: BTreeMap<usize, usize> = BTreeMap::new();
    for &op in packing_order {
        let operator = &plan.operators[&op];
        if operator.kind == OperatorKind::Unifier || !inlined[operator.logical.0] {
            units.push(vec![op]);
            continue;
        }
        let root = find(&mut parent, operator.logical.0);
        match unit_of.get(&root) {
            Some(&unit) => units[unit].push(op),
            None => {
                unit_of.insert(root, units.len());
                units.push(vec![op]);
            }
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{keys, AttrValue};
    use crate::logical::LogicalGraph;

    fn chain() -> LogicalGraph {
        let mut graph = LogicalGraph::new();
        let node1 = graph.add_operator("node1", &[], &["out"]).unwrap();
        let node2 = graph.add_operator("node2", &["in"], &["out"]).unwrap();
        let node3 = graph.add_operator("node3", &["in"], &[]).unwrap();
        graph.add_stream("n1n2", (node1, "out"), &[(node2, "in")]).unwrap();
        graph.add_stream("n2n3", (node2, "out"), &[(node3, "in")]).unwrap();
        graph
    }

    #[test]
    fn chain_packs_under_bound() {
        let plan = build(chain(), 2).unwrap();
        assert_eq!(plan.operators.len(), 3);
        assert_eq!(plan.containers.len(), 2);
        assert_eq!(plan.containers[0].operators.len(), 2);
        assert_eq!(plan.containers[1].operators.len(), 1);
        for op in plan.operators.values() {
            assert!(op.container.is_some());
        }
    }

    #[test]
    fn inline_endpoints_share_a_container() {
        let mut graph = chain();
        let n2n3 = graph.streams().find(|(_, s)| s.name == "n2n3").map(|(id, _)| id).unwrap();
        graph.set_stream_inline(n2n3, true);
        let plan = build(graph, 2).unwrap();

        // node1 is alone; node2 and node3 are forced together.
        assert_eq!(plan.containers.len(), 2);
        assert_eq!(plan.containers[0].operators.len(), 1);
        assert_eq!(plan.containers[1].operators.len(), 2);
        let inline_edge = plan.edges.iter().find(|e| e.inline).unwrap();
        assert_eq!(plan.container_of(inline_edge.source), plan.container_of(inline_edge.target));
    }

    #[test]
    fn each_operator_gets_a_container_when_bound_allows() {
        let plan = build(chain(), 3).unwrap();
        assert_eq!(plan.containers.len(), 3);
        for container in &plan.containers {
            assert_eq!(container.operators.len(), 1);
        }
    }

    fn partitioned() -> LogicalGraph {
        let mut graph = LogicalGraph::new();
        let node1 = graph.add_operator("node1", &[], &["out"]).unwrap();
        let node2 = graph.add_operator("node2", &["in"], &["out"]).unwrap();
        let node3 = graph.add_operator("node3", &["in"], &[]).unwrap();
        graph.set_operator_attr(node2, keys::PARTITION_COUNT, AttrValue::Int(3));
        graph.add_stream("n1n2", (node1, "out"), &[(node2, "in")]).unwrap();
        graph.add_stream("n2n3", (node2, "out"), &[(node3, "in")]).unwrap();
        graph
    }

    #[test]
    fn partitioning_expands_replicas_and_inserts_one_unifier() {
        let plan = build(partitioned(), 6).unwrap();

        // node1 + three node2 replicas + unifier + node3.
        assert_eq!(plan.operators.len(), 6);
        assert_eq!(plan.containers.len(), 6);

        let node2 = OperatorId(1);
        let replicas = plan.operators_of(node2);
        assert_eq!(replicas.len(), 3);
        let mut seen = std::collections::BTreeSet::new();
        for replica in &replicas {
            let keys = replica.partition_keys.as_ref().unwrap();
            assert_eq!(keys.len(), 1);
            seen.extend(keys.iter().copied());
        }
        assert_eq!(seen, (0..3).collect());

        let unifiers: Vec<_> = plan
            .operators
            .values()
            .filter(|op| op.kind == OperatorKind::Unifier)
            .collect();
        assert_eq!(unifiers.len(), 1);
        let unifier = unifiers[0];
        assert_eq!(unifier.name, "node2");

        let inputs: Vec<_> = plan.edges.iter().filter(|e| e.target == unifier.id).collect();
        assert_eq!(inputs.len(), 3);
        for edge in &inputs {
            assert_eq!(edge.target_port, "<merge#out>");
            assert!(replicas.iter().any(|r| r.id == edge.source));
        }

        // Replica inputs carry the replica's keys; the merged output does not.
        for replica in &replicas {
            let input = plan.edges.iter().find(|e| e.target == replica.id).unwrap();
            assert_eq!(input.partition_keys.as_ref(), replica.partition_keys.as_ref());
        }
        let merged = plan.edges.iter().find(|e| e.source == unifier.id).unwrap();
        assert_eq!(merged.source_port, "<merge#out>");
        assert_eq!(merged.partition_keys, None);

        let n2n3 = plan.graph.streams().find(|(_, s)| s.name == "n2n3").map(|(id, _)| id).unwrap();
        assert_eq!(plan.unifier_for(n2n3).unwrap().id, unifier.id);
        let n1n2 = plan.graph.streams().find(|(_, s)| s.name == "n1n2").map(|(id, _)| id).unwrap();
        assert!(plan.unifier_for(n1n2).is_none());
    }

    #[test]
    fn replicas_spread_across_containers_while_inline_pair_stays_whole() {
        let mut graph = LogicalGraph::new();
        let node1 = graph.add_operator("node1", &[], &["out"]).unwrap();
        let node2 = graph.add_operator("node2", &["in"], &["out"]).unwrap();
        let node3 = graph.add_operator("node3", &["in"], &["out"]).unwrap();
        let node4 = graph.add_operator("node4", &["in"], &[]).unwrap();
        graph.set_operator_attr(node2, keys::PARTITION_COUNT, AttrValue::Int(2));
        graph.add_stream("n1n2", (node1, "out"), &[(node2, "in")]).unwrap();
        graph.add_stream("n2n3", (node2, "out"), &[(node3, "in")]).unwrap();
        let n3n4 = graph.add_stream("n3n4", (node3, "out"), &[(node4, "in")]).unwrap();
        graph.set_stream_inline(n3n4, true);

        // node1, two node2 replicas, unifier, node3+node4 inline: five units.
        let plan = build(graph, 6).unwrap();
        assert_eq!(plan.containers.len(), 5);
        let replicas = plan.operators_of(OperatorId(1));
        assert_eq!(replicas.len(), 2);
        assert_ne!(
            plan.container_of(replicas[0].id),
            plan.container_of(replicas[1].id)
        );
        let node3_op = plan.operators_of(OperatorId(2))[0].id;
        let node4_op = plan.operators_of(OperatorId(3))[0].id;
        assert_eq!(plan.container_of(node3_op), plan.container_of(node4_op));
    }

    #[test]
    fn last_container_absorbs_overflow_at_bound() {
        let units = vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]];
        let packed = DefaultPacking.pack(&units, 2);
        assert_eq!(packed, vec![vec![1, 2, 3], vec![4, 5, 6, 7, 8, 9]]);
    }

    #[test]
    fn negative_key_space_falls_back_to_partition_count() {
        let mut graph = LogicalGraph::new();
        let node1 = graph.add_operator("node1", &[], &["out"]).unwrap();
        let node2 = graph.add_operator("node2", &["in"], &[]).unwrap();
        graph.set_operator_attr(node2, keys::PARTITION_COUNT, AttrValue::Int(2));
        graph.set_operator_attr(node2, keys::PARTITION_KEY_SPACE, AttrValue::Int(-4));
        graph.add_stream("n1n2", (node1, "out"), &[(node2, "in")]).unwrap();

        let plan = build(graph, 4).unwrap();
        let keys: Vec<_> = plan
            .operators_of(OperatorId(1))
            .iter()
            .map(|op| op.partition_keys.clone().unwrap())
            .collect();
        assert_eq!(keys[0], [0].into_iter().collect());
        assert_eq!(keys[1], [1].into_iter().collect());
    }

    #[test]
    fn unifier_follows_replicas_in_container_order() {
        let plan = build(partitioned(), 6).unwrap();
        let names: Vec<_> = plan
            .containers
            .iter()
            .map(|c| {
                let op = &plan.operators[&c.operators[0]];
                (op.name.as_str(), op.kind)
            })
            .collect();
        assert_eq!(
            names,
            vec![
                ("node1", OperatorKind::Input),
                ("node2", OperatorKind::Generic),
                ("node2", OperatorKind::Generic),
                ("node2", OperatorKind::Generic),
                ("node2", OperatorKind::Unifier),
                ("node3", OperatorKind::Generic),
            ]
        );
    }

    #[test]
    fn wider_key_space_splits_round_robin() {
        let mut graph = LogicalGraph::new();
        let node1 = graph.add_operator("node1", &[], &["out"]).unwrap();
        let node2 = graph.add_operator("node2", &["in"], &[]).unwrap();
        graph.set_operator_attr(node2, keys::PARTITION_COUNT, AttrValue::Int(2));
        graph.set_operator_attr(node2, keys::PARTITION_KEY_SPACE, AttrValue::Int(4));
        graph.add_stream("n1n2", (node1, "out"), &[(node2, "in")]).unwrap();

        let plan = build(graph, 4).unwrap();
        let keys: Vec<_> = plan
            .operators_of(OperatorId(1))
            .iter()
            .map(|op| op.partition_keys.clone().unwrap())
            .collect();
        assert_eq!(keys[0], [0, 2].into_iter().collect());
        assert_eq!(keys[1], [1, 3].into_iter().collect());
    }

    #[test]
    fn inline_across_partitions_is_rejected() {
        let mut graph = partitioned();
        let n1n2 = graph.streams().find(|(_, s)| s.name == "n1n2").map(|(id, _)| id).unwrap();
        graph.set_stream_inline(n1n2, true);
        assert_eq!(
            build(graph, 6).unwrap_err(),
            BuildError::InlineConflict("n1n2".to_owned())
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = LogicalGraph::new();
        let a = graph.add_operator("a", &["in"], &["out"]).unwrap();
        let b = graph.add_operator("b", &["in"], &["out"]).unwrap();
        graph.add_stream("ab", (a, "out"), &[(b, "in")]).unwrap();
        graph.add_stream("ba", (b, "out"), &[(a, "in")]).unwrap();
        assert_eq!(build(graph, 2).unwrap_err(), BuildError::Cyclic);
    }

    #[test]
    fn zero_containers_is_rejected() {
        assert_eq!(build(chain(), 0).unwrap_err(), BuildError::NoContainers);
        assert_eq!(build(LogicalGraph::new(), 2).unwrap_err(), BuildError::EmptyGraph);
    }
}
