//! The logical dataflow graph: operators, typed ports, and the streams connecting them.
//!
//! This is the input contract of the plan builder. The authoring surface here is
//! deliberately small; a graph is read once at plan-build time and treated as
//! immutable for the lifetime of that plan generation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attributes::{AttrValue, Attributes};

/// Identifies an operator within its declaring graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperatorId(pub usize);

/// Identifies a stream within its declaring graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub usize);

/// A port on a specific operator, by index into its input or output port list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRef {
    /// The operator owning the port.
    pub operator: OperatorId,
    /// Index into the owning operator's port list.
    pub port: usize,
}

/// A declared input or output port.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortMeta {
    /// The port name, unique among ports of the same direction on one operator.
    pub name: String,
    /// Port-scope attributes.
    pub attributes: Attributes,
}

/// A named logical operator with declared ports and an attribute scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorMeta {
    /// The declared operator name, unique within the graph.
    pub name: String,
    /// Declared input ports.
    pub inputs: Vec<PortMeta>,
    /// Declared output ports.
    pub outputs: Vec<PortMeta>,
    /// Operator-scope attributes.
    pub attributes: Attributes,
}

/// A named logical edge from exactly one source port to one or more sink ports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamMeta {
    /// The declared stream name, unique within the graph.
    pub name: String,
    /// The single source output port.
    pub source: PortRef,
    /// The sink input ports; never empty.
    pub sinks: Vec<PortRef>,
    /// Forces both endpoints into the same container for direct in-process hand-off.
    pub inline: bool,
    /// Optional custom partition codec class reference, carried opaquely into descriptors.
    pub codec: Option<String>,
    /// Stream-scope attributes.
    pub attributes: Attributes,
}

/// Errors raised while declaring a logical graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// An operator with the same name was already declared.
    #[error("operator `{0}` already declared")]
    DuplicateOperator(String),
    /// A stream with the same name was already declared.
    #[error("stream `{0}` already declared")]
    DuplicateStream(String),
    /// A named port does not exist on the referenced operator.
    #[error("no port `{port}` on operator `{operator}`")]
    UnknownPort {
        /// The operator searched.
        operator: String,
        /// The missing port name.
        port: String,
    },
    /// The referenced port is already connected to a stream.
    #[error("port `{port}` on operator `{operator}` is already connected")]
    PortInUse {
        /// The operator owning the port.
        operator: String,
        /// The occupied port name.
        port: String,
    },
    /// A stream was declared without any sink.
    #[error("stream `{0}` has no sinks")]
    NoSinks(String),
}

/// A user-declared operator graph, immutable once handed to the plan builder.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogicalGraph {
    operators: Vec<OperatorMeta>,
    streams: Vec<StreamMeta>,
    attributes: Attributes,
}

impl LogicalGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an operator with the given input and output port names.
    pub fn add_operator(
        &mut self,
        name: &str,
        inputs: &[&str],
        outputs: &[&str],
    ) -> Result<OperatorId, GraphError> {
        if self.operators.iter().any(|op| op.name == name) {
            return Err(GraphError::DuplicateOperator(name.to_owned()));
        }
        let port = |n: &&str| PortMeta {
            name: (*n).to_owned(),
            attributes: Attributes::new(),
        };
        self.operators.push(OperatorMeta {
            name: name.to_owned(),
            inputs: inputs.iter().map(port).collect(),
            outputs: outputs.iter().map(port).collect(),
            attributes: Attributes::new(),
        });
        Ok(OperatorId(self.operators.len() - 1))
    }

    /// Declares a stream from one source output port to one or more sink input ports.
    pub fn add_stream(
        &mut self,
        name: &str,
        source: (OperatorId, &str),
        sinks: &[(OperatorId, &str)],
    ) -> Result<StreamId, GraphError> {
        if self.streams.iter().any(|s| s.name == name) {
            return Err(GraphError::DuplicateStream(name.to_owned()));
        }
        if sinks.is_empty() {
            return Err(GraphError::NoSinks(name.to_owned()));
        }
        let source = self.output_port(source.0, source.1)?;
        if self.streams.iter().any(|s| s.source == source) {
            return Err(GraphError::PortInUse {
                operator: self.operators[source.operator.0].name.clone(),
                port: self.operators[source.operator.0].outputs[source.port].name.clone(),
            });
        }
        let mut sink_refs = Vec::with_capacity(sinks.len());
        for (op, port) in sinks {
            let sink = self.input_port(*op, port)?;
            if self.streams.iter().any(|s| s.sinks.contains(&sink)) {
                return Err(GraphError::PortInUse {
                    operator: self.operators[sink.operator.0].name.clone(),
                    port: self.operators[sink.operator.0].inputs[sink.port].name.clone(),
                });
            }
            sink_refs.push(sink);
        }
        self.streams.push(StreamMeta {
            name: name.to_owned(),
            source,
            sinks: sink_refs,
            inline: false,
            codec: None,
            attributes: Attributes::new(),
        });
        Ok(StreamId(self.streams.len() - 1))
    }

    /// Marks a stream as inline, requiring both endpoints to share a container.
    pub fn set_stream_inline(&mut self, stream: StreamId, inline: bool) {
        self.streams[stream.0].inline = inline;
    }

    /// Attaches a custom partition codec class reference to a stream.
    pub fn set_stream_codec(&mut self, stream: StreamId, codec: &str) {
        self.streams[stream.0].codec = Some(codec.to_owned());
    }

    /// Sets a graph-scope attribute.
    pub fn set_attr(&mut self, key: &str, value: AttrValue) {
        self.attributes.set(key, value);
    }

    /// Sets an operator-scope attribute.
    pub fn set_operator_attr(&mut self, operator: OperatorId, key: &str, value: AttrValue) {
        self.operators[operator.0].attributes.set(key, value);
    }

    /// Sets an attribute on a named input port.
    pub fn set_input_port_attr(
        &mut self,
        operator: OperatorId,
        port: &str,
        key: &str,
        value: AttrValue,
    ) -> Result<(), GraphError> {
        let port = self.input_port(operator, port)?;
        self.operators[port.operator.0].inputs[port.port].attributes.set(key, value);
        Ok(())
    }

    /// Sets an attribute on a named output port.
    pub fn set_output_port_attr(
        &mut self,
        operator: OperatorId,
        port: &str,
        key: &str,
        value: AttrValue,
    ) -> Result<(), GraphError> {
        let port = self.output_port(operator, port)?;
        self.operators[port.operator.0].outputs[port.port].attributes.set(key, value);
        Ok(())
    }

    /// The graph-scope attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// The metadata of `operator`.
    pub fn operator(&self, operator: OperatorId) -> &OperatorMeta {
        &self.operators[operator.0]
    }

    /// The metadata of `stream`.
    pub fn stream(&self, stream: StreamId) -> &StreamMeta {
        &self.streams[stream.0]
    }

    /// Iterates all operators with their ids, in declaration order.
    pub fn operators(&self) -> impl Iterator<Item = (OperatorId, &OperatorMeta)> {
        self.operators.iter().enumerate().map(|(i, op)| (OperatorId(i), op))
    }

    /// Iterates all streams with their ids, in declaration order.
    pub fn streams(&self) -> impl Iterator<Item = (StreamId, &StreamMeta)> {
        self.streams.iter().enumerate().map(|(i, s)| (StreamId(i), s))
    }

    /// Streams whose source is a port of `operator`.
    pub fn output_streams(&self, operator: OperatorId) -> impl Iterator<Item = (StreamId, &StreamMeta)> {
        self.streams().filter(move |(_, s)| s.source.operator == operator)
    }

    /// Streams with at least one sink port on `operator`.
    pub fn input_streams(&self, operator: OperatorId) -> impl Iterator<Item = (StreamId, &StreamMeta)> {
        self.streams()
            .filter(move |(_, s)| s.sinks.iter().any(|p| p.operator == operator))
    }

    /// Operators with no connected input port.
    pub fn root_operators(&self) -> Vec<OperatorId> {
        self.operators()
            .map(|(id, _)| id)
            .filter(|id| self.input_streams(*id).next().is_none())
            .collect()
    }

    /// Resolves an operator-scope attribute, falling back to the graph scope.
    pub fn resolve_operator_attr(&self, operator: OperatorId, key: &str) -> Option<&AttrValue> {
        self.operators[operator.0]
            .attributes
            .get(key)
            .or_else(|| self.attributes.get(key))
    }

    /// The declared partition count of `operator` (default 1).
    pub fn partition_count(&self, operator: OperatorId) -> usize {
        match self.resolve_operator_attr(operator, crate::attributes::keys::PARTITION_COUNT) {
            Some(AttrValue::Int(k)) if *k > 1 => *k as usize,
            _ => 1,
        }
    }

    fn output_port(&self, operator: OperatorId, name: &str) -> Result<PortRef, GraphError> {
        let meta = &self.operators[operator.0];
        meta.outputs
            .iter()
            .position(|p| p.name == name)
            .map(|port| PortRef { operator, port })
            .ok_or_else(|| GraphError::UnknownPort {
                operator: meta.name.clone(),
                port: name.to_owned(),
            })
    }

    fn input_port(&self, operator: OperatorId, name: &str) -> Result<PortRef, GraphError> {
        let meta = &self.operators[operator.0];
        meta.inputs
            .iter()
            .position(|p| p.name == name)
            .map(|port| PortRef { operator, port })
            .ok_or_else(|| GraphError::UnknownPort {
                operator: meta.name.clone(),
                port: name.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_and_query() {
        let mut graph = LogicalGraph::new();
        let node1 = graph.add_operator("node1", &[], &["out"]).unwrap();
        let node2 = graph.add_operator("node2", &["in"], &["out"]).unwrap();
        let node3 = graph.add_operator("node3", &["in"], &[]).unwrap();
        graph.add_stream("n1n2", (node1, "out"), &[(node2, "in")]).unwrap();
        graph.add_stream("n2n3", (node2, "out"), &[(node3, "in")]).unwrap();

        assert_eq!(graph.root_operators(), vec![node1]);
        assert_eq!(graph.output_streams(node2).count(), 1);
        assert_eq!(graph.input_streams(node3).count(), 1);
    }

    #[test]
    fn rejects_misdeclarations() {
        let mut graph = LogicalGraph::new();
        let node1 = graph.add_operator("node1", &[], &["out"]).unwrap();
        let node2 = graph.add_operator("node2", &["in"], &[]).unwrap();
        assert_eq!(
            graph.add_operator("node1", &[], &[]),
            Err(GraphError::DuplicateOperator("node1".to_owned()))
        );
        graph.add_stream("s", (node1, "out"), &[(node2, "in")]).unwrap();
        assert!(matches!(
            graph.add_stream("s2", (node1, "out"), &[(node2, "in")]),
            Err(GraphError::PortInUse { .. })
        ));
        assert!(matches!(
            graph.add_stream("s3", (node1, "nope"), &[(node2, "in")]),
            Err(GraphError::UnknownPort { .. })
        ));
    }
}
