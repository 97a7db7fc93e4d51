//! Container loss, restart scheduling, and downstream re-wiring.

use std::collections::BTreeSet;

use skein::heartbeat::{ContainerHeartbeat, OperatorStats};
use skein::{ContainerResource, Orchestrator};
use skein_plan::physical::ContainerState;
use skein_plan::LogicalGraph;

/// node1 -> node2 -> node3 in two containers: {node1, node2} and {node3}.
fn two_container_chain() -> Orchestrator {
    let mut graph = LogicalGraph::new();
    let node1 = graph.add_operator("node1", &[], &["out"]).unwrap();
    let node2 = graph.add_operator("node2", &["in"], &["out"]).unwrap();
    let node3 = graph.add_operator("node3", &["in"], &[]).unwrap();
    graph.add_stream("n1n2", (node1, "out"), &[(node2, "in")]).unwrap();
    graph.add_stream("n2n3", (node2, "out"), &[(node3, "in")]).unwrap();
    Orchestrator::with_max_containers(graph, 2).unwrap()
}

fn resource(external_id: &str) -> ContainerResource {
    ContainerResource {
        resource_id: 0,
        external_id: external_id.to_owned(),
        host: "localhost".to_owned(),
        memory_mb: 1024,
    }
}

fn heartbeat(external_id: &str) -> ContainerHeartbeat {
    ContainerHeartbeat {
        external_id: external_id.to_owned(),
        operators: Vec::new(),
    }
}

#[test]
fn restart_marks_downstream_for_redeploy() {
    let orchestrator = two_container_chain();
    let snapshot = orchestrator.plan_snapshot();
    assert_eq!(snapshot.containers.len(), 2);
    assert_eq!(snapshot.containers[0].operators.len(), 2);
    assert_eq!(snapshot.containers[1].operators.len(), 1);

    orchestrator
        .assign_container(resource("container1"), ("host1".to_owned(), 9001))
        .unwrap();
    orchestrator
        .assign_container(resource("container2"), ("host2".to_owned(), 9002))
        .unwrap();

    let lost = orchestrator.plan_snapshot().containers[0].clone();
    orchestrator.schedule_container_restart("container1");

    let snapshot = orchestrator.plan_snapshot();
    let replacement = &snapshot.containers[0];
    let survivor = &snapshot.containers[1];

    // A fresh container inherits the member set but nothing else: it does not
    // exist yet, so it carries no pending entries and no binding.
    assert_ne!(replacement.id, lost.id);
    assert_eq!(replacement.operators, lost.operators);
    assert_eq!(replacement.state, ContainerState::New);
    assert_eq!(replacement.external_id, None);
    assert!(replacement.pending_deploy.is_empty());
    assert!(replacement.pending_undeploy.is_empty());

    // The survivor's consumer of the dead container's output must be torn down
    // and re-wired: exactly node3, in both pending sets.
    let node3 = survivor.operators[0];
    assert_eq!(survivor.pending_undeploy, BTreeSet::from([node3]));
    assert_eq!(survivor.pending_deploy, BTreeSet::from([node3]));

    // Exactly one start request, for the replacement.
    assert_eq!(snapshot.start_requests.len(), 1);
    assert_eq!(snapshot.start_requests[0].container, replacement.id);

    // A second report for the same container coalesces.
    orchestrator.schedule_container_restart("container1");
    assert_eq!(orchestrator.plan_snapshot().start_requests.len(), 1);
}

#[test]
fn rewired_input_acquires_replacement_address() {
    let orchestrator = two_container_chain();
    orchestrator
        .assign_container(resource("container1"), ("host1".to_owned(), 9001))
        .unwrap();
    orchestrator
        .assign_container(resource("container2"), ("host2".to_owned(), 9002))
        .unwrap();

    // Drain container2's initial deployment, then lose container1.
    let initial = orchestrator.process_heartbeat(&heartbeat("container2")).unwrap();
    assert_eq!(initial.deploy.len(), 1);
    assert_eq!(initial.undeploy.len(), 0);

    orchestrator.schedule_container_restart("container1");

    // The redeploy arrives with no upstream address: the replacement is not
    // yet assigned.
    let rewire = orchestrator.process_heartbeat(&heartbeat("container2")).unwrap();
    assert_eq!(rewire.undeploy, rewire.deploy.iter().map(|d| d.id).collect::<Vec<_>>());
    let node3 = &rewire.deploy[0];
    assert_eq!(node3.declared_id, "node3");
    assert_eq!(node3.inputs[0].buffer_server, None);

    // Once the replacement is assigned, regeneration picks up its address.
    orchestrator
        .assign_container(resource("container3"), ("host3".to_owned(), 9003))
        .unwrap();
    let regenerated = orchestrator
        .container_agent("container2")
        .unwrap()
        .deploy_info();
    let address = regenerated[0].inputs[0].buffer_server.as_ref().unwrap();
    assert_eq!((address.host.as_str(), address.port), ("host3", 9003));
}

#[test]
fn heartbeat_drain_is_atomic_and_once() {
    let orchestrator = two_container_chain();
    orchestrator
        .assign_container(resource("container1"), ("host1".to_owned(), 9001))
        .unwrap();

    let first = orchestrator.process_heartbeat(&heartbeat("container1")).unwrap();
    assert_eq!(first.deploy.len(), 2);

    // Pending sets were cleared with response construction.
    let second = orchestrator.process_heartbeat(&heartbeat("container1")).unwrap();
    assert!(second.deploy.is_empty());
    assert!(second.undeploy.is_empty());

    let snapshot = orchestrator.plan_snapshot();
    assert_eq!(snapshot.containers[0].state, ContainerState::Active);

    assert_eq!(
        orchestrator.process_heartbeat(&heartbeat("nobody")).unwrap_err(),
        skein::OrchestratorError::UnknownContainer("nobody".to_owned())
    );
}

/// Checkpoint windows reported over heartbeats are what a rebuilt operator
/// resumes from.
#[test]
fn reported_checkpoints_survive_restart() {
    let orchestrator = two_container_chain();
    orchestrator
        .assign_container(resource("container1"), ("host1".to_owned(), 9001))
        .unwrap();
    orchestrator
        .assign_container(resource("container2"), ("host2".to_owned(), 9002))
        .unwrap();

    let members = orchestrator.plan_snapshot().containers[0].operators.clone();
    let report = ContainerHeartbeat {
        external_id: "container1".to_owned(),
        operators: members
            .iter()
            .map(|&operator_id| OperatorStats {
                operator_id,
                checkpoint_window: Some(42),
                tuples_processed: 1000,
                tuples_emitted: 900,
            })
            .collect(),
    };
    orchestrator.process_heartbeat(&report).unwrap();

    orchestrator.schedule_container_restart("container1");
    let agent = orchestrator
        .assign_container(resource("container3"), ("host3".to_owned(), 9003))
        .unwrap();

    for info in agent.deploy_info() {
        assert_eq!(info.checkpoint_window, Some(42));
    }
}

/// An agent whose container has been lost and replaced has nothing to deploy.
#[test]
fn stale_agent_reports_empty_descriptor() {
    let orchestrator = two_container_chain();
    let agent = orchestrator
        .assign_container(resource("container1"), ("host1".to_owned(), 9001))
        .unwrap();
    assert_eq!(agent.deploy_info().len(), 2);

    orchestrator.schedule_container_restart("container1");
    assert!(agent.deploy_info().is_empty());
}
