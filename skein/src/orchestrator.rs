//! The container orchestrator: the single authority over live plan state.
//!
//! The orchestrator owns the mapping from planned containers to allocated
//! cluster resources, the FIFO queue of pending allocation requests, and the
//! heartbeat-driven restart machinery. Resource grants, heartbeats, and failure
//! notifications arrive from independent external callbacks, so every mutation
//! runs inside one critical section guarded by a single lock per instance.
//! Nothing under the lock performs I/O: descriptor generation and checkpoint
//! lookups use data already cached in-process.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use skein_plan::attributes::{keys, AttrValue};
use skein_plan::builder::BuildError;
use skein_plan::logical::LogicalGraph;
use skein_plan::physical::{ContainerState, PhysicalContainer, PhysicalPlan};

use crate::deploy::{self, CheckpointCache, OperatorDeployInfo};
use crate::heartbeat::{ContainerHeartbeat, HeartbeatResponse};

/// Containers a plan may occupy when the graph does not bound it itself.
pub const DEFAULT_MAX_CONTAINERS: usize = 10;

/// A resource allocation granted by the external cluster resource manager.
/// Consumed exactly once by [`Orchestrator::assign_container`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerResource {
    /// Resource-manager-assigned allocation sequence number.
    pub resource_id: i32,
    /// The external container id the grant refers to.
    pub external_id: String,
    /// Host the process was allocated on.
    pub host: String,
    /// Memory grant in megabytes.
    pub memory_mb: u64,
}

/// A queued intent to obtain one allocation for one planned container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerStartRequest {
    /// The planned container awaiting a resource.
    pub container: u64,
}

/// Errors raised by orchestrator operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// A resource was granted with no start request outstanding. The cluster
    /// handed out more capacity than the plan asked for; a configuration
    /// error, not transient.
    #[error("no container start request pending")]
    NoPendingRequest,
    /// A grant arrived for an external id that is already bound; the grant is
    /// stale and must be discarded.
    #[error("container `{0}` is already assigned")]
    StaleResource(String),
    /// No live container is bound to the given external id.
    #[error("unknown container `{0}`")]
    UnknownContainer(String),
}

struct State {
    plan: PhysicalPlan,
    start_requests: VecDeque<ContainerStartRequest>,
    /// External allocation id to planned container id, for live containers.
    external: BTreeMap<String, u64>,
    /// Last completed checkpoint window per operator, fed by heartbeats.
    checkpoints: CheckpointCache,
}

impl State {
    fn index_of(&self, container: u64) -> Option<usize> {
        self.plan.containers.iter().position(|c| c.id == container)
    }
}

/// The long-lived manager of one deployed plan.
///
/// Cheap to share: handles and agents clone the inner state handle.
pub struct Orchestrator {
    state: Arc<Mutex<State>>,
}

impl Orchestrator {
    /// Builds the physical plan for `graph` and queues one start request per
    /// container, in plan emission order.
    ///
    /// The container bound is taken from the graph's `containers.max`
    /// attribute, defaulting to [`DEFAULT_MAX_CONTAINERS`].
    pub fn new(graph: LogicalGraph) -> Result<Self, BuildError> {
        let max = match graph.attributes().get(keys::MAX_CONTAINERS) {
            Some(AttrValue::Int(x)) if *x > 0 => *x as usize,
            _ => DEFAULT_MAX_CONTAINERS,
        };
        Self::with_max_containers(graph, max)
    }

    /// Builds the physical plan under the supplied configuration.
    pub fn with_config(graph: LogicalGraph, config: &crate::config::Config) -> Result<Self, BuildError> {
        match config.max_containers {
            Some(max) => Self::with_max_containers(graph, max),
            None => Self::new(graph),
        }
    }

    /// Builds the physical plan with an explicit container bound.
    pub fn with_max_containers(graph: LogicalGraph, max: usize) -> Result<Self, BuildError> {
        let plan = skein_plan::build(graph, max)?;
        let start_requests = plan
            .containers
            .iter()
            .map(|c| ContainerStartRequest { container: c.id })
            .collect();
        info!(
            containers = plan.containers.len(),
            operators = plan.operators.len(),
            "plan deployed to orchestrator"
        );
        Ok(Self {
            state: Arc::new(Mutex::new(State {
                plan,
                start_requests,
                external: BTreeMap::new(),
                checkpoints: CheckpointCache::new(),
            })),
        })
    }

    /// Binds the next pending container to a granted resource.
    ///
    /// Pops the FIFO head, transitions the container NEW → ALLOCATED, records
    /// the resolved buffer-server address, and resets the container's
    /// pending-deploy set to exactly its member operators. The returned agent
    /// generates its deployment descriptor lazily, from assignment state as of
    /// the moment it is asked.
    pub fn assign_container(
        &self,
        resource: ContainerResource,
        buffer_server: (String, u16),
    ) -> Result<ContainerAgent, OrchestratorError> {
        let mut state = self.locked();
        if state.external.contains_key(&resource.external_id) {
            warn!(external_id = %resource.external_id, "discarding stale resource grant");
            return Err(OrchestratorError::StaleResource(resource.external_id));
        }
        let request = state
            .start_requests
            .pop_front()
            .ok_or(OrchestratorError::NoPendingRequest)?;
        let index = state
            .index_of(request.container)
            .ok_or(OrchestratorError::NoPendingRequest)?;

        let container = &mut state.plan.containers[index];
        container.state = ContainerState::Allocated;
        container.external_id = Some(resource.external_id.clone());
        container.host = Some(resource.host);
        container.address = Some(buffer_server);
        container.memory_mb = resource.memory_mb;
        container.pending_deploy = container.operators.iter().copied().collect();
        container.pending_undeploy.clear();

        info!(
            container = request.container,
            external_id = %resource.external_id,
            operators = container.operators.len(),
            "container assigned"
        );
        state.external.insert(resource.external_id, request.container);
        Ok(ContainerAgent {
            state: Arc::clone(&self.state),
            container: request.container,
        })
    }

    /// Reacts to the resource manager reporting a container lost.
    ///
    /// The dead container's operator membership is kept for planning: a fresh
    /// container with a new id inherits it and a start request for it joins the
    /// queue. Every live container holding a consumer of the dead container's
    /// output has that consumer marked for undeploy and redeploy, so no
    /// downstream input is left pointing at a stale upstream address. A repeat
    /// call for the same external id coalesces into a no-op.
    pub fn schedule_container_restart(&self, external_id: &str) {
        let mut state = self.locked();
        let Some(container_id) = state.external.remove(external_id) else {
            warn!(external_id, "restart already scheduled or container unknown");
            return;
        };
        let Some(index) = state.index_of(container_id) else {
            warn!(external_id, container = container_id, "lost container not in plan");
            return;
        };

        let dead: BTreeSet<u32> = state.plan.containers[index].operators.iter().copied().collect();

        // Downstream consumers in other live containers must be torn down and
        // re-wired once the replacement is assigned and its address is known.
        let dependents: Vec<(usize, u32)> = state
            .plan
            .edges
            .iter()
            .filter(|e| dead.contains(&e.source) && !dead.contains(&e.target))
            .filter_map(|e| state.plan.container_of(e.target).map(|c| (c, e.target)))
            .filter(|(c, _)| state.plan.containers[*c].state != ContainerState::New)
            .collect();
        for (container, operator) in dependents {
            let holder = &mut state.plan.containers[container];
            holder.pending_undeploy.insert(operator);
            holder.pending_deploy.insert(operator);
            debug!(operator, container = holder.id, "marked dependent operator for redeploy");
        }

        // The replacement gets a fresh identity and no pending entries; it does
        // not exist until a future assignment binds it.
        let members = state.plan.containers[index].operators.clone();
        let fresh = state.plan.allocate_container_id();
        state.plan.containers[index] = PhysicalContainer::new(fresh, members);
        state
            .start_requests
            .push_back(ContainerStartRequest { container: fresh });
        info!(
            external_id,
            lost = container_id,
            replacement = fresh,
            "container restart scheduled"
        );
    }

    /// Processes one worker heartbeat and drains the container's pending
    /// deployment changes into the response, atomically with its construction.
    pub fn process_heartbeat(
        &self,
        heartbeat: &ContainerHeartbeat,
    ) -> Result<HeartbeatResponse, OrchestratorError> {
        let mut state = self.locked();
        let container_id = *state
            .external
            .get(&heartbeat.external_id)
            .ok_or_else(|| OrchestratorError::UnknownContainer(heartbeat.external_id.clone()))?;
        let index = state
            .index_of(container_id)
            .ok_or_else(|| OrchestratorError::UnknownContainer(heartbeat.external_id.clone()))?;

        for stats in &heartbeat.operators {
            if let Some(window) = stats.checkpoint_window {
                let entry = state.checkpoints.entry(stats.operator_id).or_insert(window);
                *entry = (*entry).max(window);
            }
        }

        let pending_deploy = state.plan.containers[index].pending_deploy.clone();
        let deploy: Vec<OperatorDeployInfo> =
            deploy::deploy_info(&state.plan, index, &state.checkpoints)
                .into_iter()
                .filter(|info| pending_deploy.contains(&info.id))
                .collect();
        let container = &mut state.plan.containers[index];
        container.state = ContainerState::Active;
        let undeploy: Vec<u32> = container.pending_undeploy.iter().copied().collect();
        container.pending_deploy.clear();
        container.pending_undeploy.clear();

        if !deploy.is_empty() || !undeploy.is_empty() {
            debug!(
                external_id = %heartbeat.external_id,
                deploy = deploy.len(),
                undeploy = undeploy.len(),
                "drained pending deployment changes"
            );
        }
        Ok(HeartbeatResponse {
            deploy,
            undeploy,
            shutdown: false,
        })
    }

    /// An agent handle for the container bound to `external_id`, if any.
    pub fn container_agent(&self, external_id: &str) -> Option<ContainerAgent> {
        let state = self.locked();
        state.external.get(external_id).map(|&container| ContainerAgent {
            state: Arc::clone(&self.state),
            container,
        })
    }

    /// A consistent snapshot of current plan state for external reporting.
    pub fn plan_snapshot(&self) -> PlanSnapshot {
        let state = self.locked();
        PlanSnapshot {
            containers: state
                .plan
                .containers
                .iter()
                .map(|c| ContainerSnapshot {
                    id: c.id,
                    external_id: c.external_id.clone(),
                    state: c.state,
                    operators: c.operators.clone(),
                    address: c.address.clone(),
                    pending_deploy: c.pending_deploy.clone(),
                    pending_undeploy: c.pending_undeploy.clone(),
                })
                .collect(),
            start_requests: state.start_requests.iter().copied().collect(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("orchestrator state poisoned")
    }
}

/// Handle to one assigned container, returned by a successful assignment.
pub struct ContainerAgent {
    state: Arc<Mutex<State>>,
    container: u64,
}

impl std::fmt::Debug for ContainerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerAgent")
            .field("container", &self.container)
            .finish()
    }
}

impl ContainerAgent {
    /// The planned container id this agent refers to.
    pub fn container_id(&self) -> u64 {
        self.container
    }

    /// Generates the container's deployment descriptor from current assignment
    /// state. Regenerating without intervening changes yields identical output.
    pub fn deploy_info(&self) -> Vec<OperatorDeployInfo> {
        let state = self.state.lock().expect("orchestrator state poisoned");
        match state.plan.containers.iter().position(|c| c.id == self.container) {
            Some(index) => deploy::deploy_info(&state.plan, index, &state.checkpoints),
            // The container was since lost and replaced; nothing to deploy.
            None => Vec::new(),
        }
    }
}

/// Reporting view of one container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSnapshot {
    /// Planned container id.
    pub id: u64,
    /// External allocation id, once assigned.
    pub external_id: Option<String>,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Member operator ids.
    pub operators: Vec<u32>,
    /// Published buffer-server address, once assigned.
    pub address: Option<(String, u16)>,
    /// Operators awaiting deployment.
    pub pending_deploy: BTreeSet<u32>,
    /// Operators awaiting undeployment.
    pub pending_undeploy: BTreeSet<u32>,
}

/// Reporting view of the whole plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanSnapshot {
    /// Containers in plan order.
    pub containers: Vec<ContainerSnapshot>,
    /// Outstanding start requests, FIFO order.
    pub start_requests: Vec<ContainerStartRequest>,
}
