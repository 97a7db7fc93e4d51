//! skein is the control plane of a distributed streaming-dataflow engine.
//!
//! A logical operator graph (see the `skein_plan` crate) is turned into a
//! physical deployment plan; this crate binds the plan's abstract containers to
//! concrete allocated worker processes and keeps the deployment consistent as
//! workers join, fail, and restart.
//!
//! The pieces, in dependency order:
//!
//! **Deployment descriptors**: the [`deploy`] module defines the serializable
//! per-container contract a remote worker consumes to instantiate and wire its
//! operators. Descriptors are a computed view over current assignment state,
//! regenerated rather than cached.
//!
//! **Orchestration**: the [`orchestrator`] module owns the live mapping from
//! planned containers to allocated resources, the FIFO queue of pending
//! allocation requests, and the restart machinery that marks downstream
//! consumers for redeploy when an upstream container is lost.
//!
//! **Heartbeats**: the [`heartbeat`] module defines the periodic worker
//! exchange through which pending deployment changes are delivered.
//!
//! **Checkpoint recovery**: the [`checkpoint`] module defines the persisted
//! store contract and the coordinator that decides which durable window a
//! rebuilt operator resumes from.
//!
//! # Examples
//!
//! ```
//! use skein::{ContainerResource, Orchestrator};
//! use skein_plan::LogicalGraph;
//!
//! let mut graph = LogicalGraph::new();
//! let source = graph.add_operator("source", &[], &["out"]).unwrap();
//! let sink = graph.add_operator("sink", &["in"], &[]).unwrap();
//! graph.add_stream("events", (source, "out"), &[(sink, "in")]).unwrap();
//!
//! let orchestrator = Orchestrator::with_max_containers(graph, 2).unwrap();
//! let resource = ContainerResource {
//!     resource_id: 0,
//!     external_id: "container1".to_owned(),
//!     host: "host1".to_owned(),
//!     memory_mb: 1024,
//! };
//! let agent = orchestrator
//!     .assign_container(resource, ("host1".to_owned(), 9001))
//!     .unwrap();
//! assert_eq!(agent.deploy_info()[0].declared_id, "source");
//! ```

#![forbid(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod deploy;
pub mod heartbeat;
pub mod orchestrator;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, CheckpointWindow, InMemoryStore,
    RecoveryCoordinator,
};
pub use config::Config;
pub use deploy::{BufferServer, InputDeployInfo, OperatorDeployInfo, OutputDeployInfo};
pub use heartbeat::{ContainerHeartbeat, HeartbeatResponse, OperatorStats};
pub use orchestrator::{
    ContainerAgent, ContainerResource, ContainerStartRequest, Orchestrator, OrchestratorError,
};
