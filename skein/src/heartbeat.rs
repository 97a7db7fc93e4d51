//! The worker/orchestrator heartbeat protocol.
//!
//! Workers report liveness and per-operator progress; the orchestrator answers
//! with whatever deployment changes accumulated for that container since the
//! last exchange.

use serde::{Deserialize, Serialize};

use crate::deploy::OperatorDeployInfo;

/// Per-operator progress reported with each heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStats {
    /// The reporting physical operator.
    pub operator_id: u32,
    /// Last checkpoint window the operator completed, if any.
    pub checkpoint_window: Option<u64>,
    /// Tuples consumed since the previous report.
    pub tuples_processed: u64,
    /// Tuples produced since the previous report.
    pub tuples_emitted: u64,
}

/// A periodic worker-to-orchestrator liveness report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHeartbeat {
    /// The external allocation id of the reporting container.
    pub external_id: String,
    /// Progress for each operator the container currently runs.
    pub operators: Vec<OperatorStats>,
}

impl ContainerHeartbeat {
    /// Serializes the heartbeat for the control channel.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserializes a heartbeat produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// The orchestrator's answer: deployment changes drained atomically with
/// response construction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Operators the container must instantiate and wire.
    pub deploy: Vec<OperatorDeployInfo>,
    /// Physical operator ids the container must tear down.
    pub undeploy: Vec<u32>,
    /// Orders the container to exit.
    pub shutdown: bool,
}

impl HeartbeatResponse {
    /// Serializes the response for the control channel.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserializes a response produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_roundtrip() {
        let response = HeartbeatResponse {
            deploy: Vec::new(),
            undeploy: vec![3, 4],
            shutdown: false,
        };
        let bytes = response.encode().unwrap();
        assert_eq!(HeartbeatResponse::decode(&bytes).unwrap(), response);
    }
}
