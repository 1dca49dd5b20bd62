//! Model serialization: the wire round trip for graphs, nodes and edges.
//!
//! Edges are encoded as `"<producer-name>:<output-index>"` strings, with
//! index −1 for control edges, so decoding is necessarily two-phase: first
//! every node of every graph is created and each reference string is
//! recorded unresolved, then one resolution pass runs over the accumulated
//! records against per-graph name→node maps. Forward references are
//! therefore fine regardless of declaration order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use protobuf::Message;

use crate::attr::AttrStore;
use crate::attr_serializer::{deserialize_all_attrs, serialize_all_attrs};
use crate::error::{Error, Result};
use crate::graph::{ComputeGraph, GraphRef, NodeRef};
use crate::op_desc::OpDesc;
use crate::protos;

/// Edge-string index marking a control edge.
const CONTROL_INDEX: i64 = -1;

/// A serializable model: a root graph plus model-level metadata.
pub struct Model {
    name: String,
    version: u32,
    custom_version: String,
    attrs: AttrStore,
    graph: Option<GraphRef>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            custom_version: String::new(),
            attrs: AttrStore::new(),
            graph: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn custom_version(&self) -> &str {
        &self.custom_version
    }

    pub fn set_custom_version(&mut self, version: impl Into<String>) {
        self.custom_version = version.into();
    }

    pub fn with_attrs<R>(&self, f: impl FnOnce(&AttrStore) -> R) -> R {
        f(&self.attrs)
    }

    pub fn with_attrs_mut<R>(&mut self, f: impl FnOnce(&mut AttrStore) -> R) -> R {
        f(&mut self.attrs)
    }

    /// Install the root graph.
    pub fn set_graph(&mut self, graph: ComputeGraph) {
        self.graph = Some(Rc::new(RefCell::new(graph)));
    }

    pub fn graph(&self) -> Option<GraphRef> {
        self.graph.as_ref().map(Rc::clone)
    }

    /// Emit the wire message: the root graph first, then every subgraph it
    /// owns, in declaration order.
    pub fn to_proto(&self) -> Result<protos::ModelDef> {
        let root = self
            .graph
            .as_ref()
            .ok_or_else(|| Error::InvalidParam("model has no graph".into()))?;

        let mut wire = protos::ModelDef::new();
        wire.name = self.name.clone();
        wire.version = self.version;
        wire.custom_version = self.custom_version.clone();
        wire.attr = serialize_all_attrs(&self.attrs, &[])?;

        let root = root.borrow();
        wire.graph.push(serialize_graph(&root)?);
        for sub in root.subgraphs() {
            wire.graph.push(serialize_graph(&sub.borrow())?);
        }
        Ok(wire)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_proto()?.write_to_bytes()?)
    }

    /// Decode a model. Phase 1 creates every node of every graph and
    /// records reference strings; a re-parenting pass attaches subgraphs
    /// to the root and to the nodes naming them; phase 2 resolves all
    /// accumulated references at once.
    pub fn from_proto(wire: &protos::ModelDef) -> Result<Model> {
        if wire.graph.is_empty() {
            return Err(Error::InvalidParam("model has no graph".into()));
        }

        // Phase 1: nodes only, references recorded.
        let mut decoded = Vec::with_capacity(wire.graph.len());
        for graph_def in &wire.graph {
            decoded.push(DecodedGraph::create_nodes(graph_def)?);
        }

        // Ownership pass: graph[0] is the root, the rest are subgraphs
        // re-parented under the nodes that name them. Parents are resolved
        // before the root is borrowed for attachment.
        let root_ref = Rc::clone(&decoded[0].graph);
        let parents: Vec<Option<String>> = decoded[1..]
            .iter()
            .map(|sub| {
                let name = sub.graph.borrow().name().to_string();
                find_parent_node(&decoded, &name)
            })
            .collect();
        for (sub, parent) in decoded[1..].iter().zip(parents) {
            match parent {
                Some(parent) => sub.graph.borrow_mut().set_parent_node_name(parent),
                None => log::warn!(
                    "subgraph '{}' is referenced by no node",
                    sub.graph.borrow().name()
                ),
            }
            root_ref.borrow_mut().add_subgraph(Rc::clone(&sub.graph))?;
        }

        // Phase 2: resolve every recorded reference.
        for graph in &decoded {
            graph.resolve_refs()?;
        }

        root_ref.borrow().validate()?;

        let mut model = Model::new(wire.name.clone());
        model.version = wire.version;
        model.custom_version = wire.custom_version.clone();
        model.attrs = deserialize_all_attrs(&wire.attr)?;
        model.graph = Some(root_ref);
        Ok(model)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Model> {
        let wire = protos::ModelDef::parse_from_bytes(bytes)?;
        Self::from_proto(&wire)
    }
}

impl core::fmt::Debug for Model {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("has_graph", &self.graph.is_some())
            .finish()
    }
}

/// Serialize one graph: nodes in insertion order, each with its full edge
/// encoding, and graph-level IO as reference strings.
pub fn serialize_graph(graph: &ComputeGraph) -> Result<protos::GraphDef> {
    let mut wire = protos::GraphDef::new();
    wire.name = graph.name().to_string();
    wire.attr = graph.with_attrs(|a| serialize_all_attrs(a, &[]))?;

    for (node, index) in graph.graph_inputs() {
        wire.input.push(format!("{}:{}", node.borrow().name(), index));
    }
    for (node, index) in graph.graph_outputs() {
        wire.output.push(format!("{}:{}", node.borrow().name(), index));
    }

    for node in graph.nodes() {
        let node = node.borrow();
        let mut op_wire = node.op_desc().to_proto()?;

        // Data anchors first, one entry per anchor so indices stay
        // aligned; unconnected anchors hold an empty placeholder.
        for anchor in 0..node.in_anchor_count() {
            match node.producer_of_input(anchor) {
                Some((producer, out_index)) => {
                    op_wire
                        .input
                        .push(format!("{}:{}", producer.borrow().name(), out_index));
                }
                None => op_wire.input.push(String::new()),
            }
        }
        for producer in node.control_in_nodes() {
            op_wire
                .input
                .push(format!("{}:{}", producer.borrow().name(), CONTROL_INDEX));
        }
        wire.op.push(op_wire);
    }
    Ok(wire)
}

/// Decode a standalone graph, resolving references within it.
pub fn deserialize_graph(wire: &protos::GraphDef) -> Result<ComputeGraph> {
    let decoded = DecodedGraph::create_nodes(wire)?;
    decoded.resolve_refs()?;
    let graph = Rc::try_unwrap(decoded.graph)
        .map_err(|_| Error::InvalidGraph("decoded graph is still shared".into()))?;
    Ok(graph.into_inner())
}

/// One unresolved reference recorded during phase 1.
struct PendingRef {
    dst_node: NodeRef,
    /// Data anchor index, or `None` for a control edge.
    dst_index: Option<usize>,
    src_name: String,
    src_index: usize,
}

struct DecodedGraph {
    graph: GraphRef,
    nodes_by_name: HashMap<String, NodeRef>,
    pending: Vec<PendingRef>,
    io_inputs: Vec<String>,
    io_outputs: Vec<String>,
}

impl DecodedGraph {
    fn create_nodes(wire: &protos::GraphDef) -> Result<DecodedGraph> {
        let mut graph = ComputeGraph::new(wire.name.clone());
        graph.with_attrs_mut(|attrs| -> Result<()> {
            *attrs = deserialize_all_attrs(&wire.attr)?;
            Ok(())
        })?;

        let mut nodes_by_name = HashMap::new();
        let mut pending = Vec::new();

        for op_def in &wire.op {
            let op_desc = OpDesc::from_proto(op_def)?;
            let node = graph.add_node(op_desc);
            let prev = nodes_by_name.insert(op_def.name.clone(), Rc::clone(&node));
            if prev.is_some() {
                return Err(Error::InvalidGraph(format!(
                    "duplicate node name '{}' in graph '{}'",
                    op_def.name, wire.name
                )));
            }

            for (position, reference) in op_def.input.iter().enumerate() {
                if reference.is_empty() {
                    continue;
                }
                let (src_name, index) = parse_ref(reference)?;
                if index == CONTROL_INDEX {
                    pending.push(PendingRef {
                        dst_node: Rc::clone(&node),
                        dst_index: None,
                        src_name,
                        src_index: 0,
                    });
                } else {
                    pending.push(PendingRef {
                        dst_node: Rc::clone(&node),
                        dst_index: Some(position),
                        src_name,
                        src_index: index as usize,
                    });
                }
            }
        }

        Ok(DecodedGraph {
            graph: Rc::new(RefCell::new(graph)),
            nodes_by_name,
            pending,
            io_inputs: wire.input.clone(),
            io_outputs: wire.output.clone(),
        })
    }

    /// Phase 2: connect every recorded reference and the graph-level IO.
    fn resolve_refs(&self) -> Result<()> {
        let mut graph = self.graph.borrow_mut();
        for pending in &self.pending {
            let src = self.nodes_by_name.get(&pending.src_name).ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "node '{}' references unknown producer '{}'",
                    pending.dst_node.borrow().name(),
                    pending.src_name
                ))
            })?;
            match pending.dst_index {
                Some(dst_index) => {
                    graph.add_edge(src, pending.src_index, &pending.dst_node, dst_index)?;
                }
                None => graph.add_control_edge(src, &pending.dst_node)?,
            }
        }

        for reference in &self.io_inputs {
            let (node, index) = self.resolve_io(reference)?;
            graph.add_graph_input(&node, index);
        }
        for reference in &self.io_outputs {
            let (node, index) = self.resolve_io(reference)?;
            graph.add_graph_output(&node, index);
        }
        Ok(())
    }

    fn resolve_io(&self, reference: &str) -> Result<(NodeRef, usize)> {
        let (name, index) = parse_ref(reference)?;
        if index < 0 {
            return Err(Error::InvalidParam(format!(
                "graph io reference '{reference}' has a negative index"
            )));
        }
        let node = self.nodes_by_name.get(&name).ok_or_else(|| {
            Error::InvalidGraph(format!("graph io references unknown node '{name}'"))
        })?;
        Ok((Rc::clone(node), index as usize))
    }
}

/// Which node's descriptor lists `instance` as a subgraph instance.
fn find_parent_node(decoded: &[DecodedGraph], instance: &str) -> Option<String> {
    for graph in decoded {
        for node in graph.graph.borrow().nodes() {
            let node = node.borrow();
            if node
                .op_desc()
                .subgraph_instance_names()
                .iter()
                .any(|n| n == instance)
            {
                return Some(node.name());
            }
        }
    }
    None
}

/// Split `"<name>:<index>"`, tolerating colons inside the node name.
fn parse_ref(reference: &str) -> Result<(String, i64)> {
    let (name, index) = reference
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidParam(format!("malformed edge reference '{reference}'")))?;
    let index: i64 = index
        .parse()
        .map_err(|_| Error::InvalidParam(format!("malformed edge index in '{reference}'")))?;
    Ok((name.to_string(), index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_builder::GraphBuilder;
    use crate::operator::Operator;
    use crate::tensor_desc::TensorDesc;
    use crate::types::{DataType, Format};

    fn data_op(name: &str) -> Operator {
        let mut desc = OpDesc::new(name, "Data");
        desc.add_output_desc(
            "y",
            TensorDesc::with_shape(vec![2, 3], Format::Nd, DataType::Float),
        )
        .unwrap();
        Operator::from_op_desc(desc)
    }

    fn compute_op(name: &str) -> Operator {
        let mut desc = OpDesc::new(name, "TestOp");
        desc.add_input_desc("x", TensorDesc::new()).unwrap();
        desc.add_optional_input_desc("bias", TensorDesc::new()).unwrap();
        desc.add_output_desc("y", TensorDesc::new()).unwrap();
        Operator::from_op_desc(desc)
    }

    fn two_node_model() -> Model {
        let a = data_op("a");
        let mut b = compute_op("b");
        b.set_input("x", &a).unwrap();
        let mut graph = GraphBuilder::build("main", &[b]).unwrap();
        let node_a = graph.find_node("a").unwrap();
        let node_b = graph.find_node("b").unwrap();
        graph.add_graph_input(&node_a, 0);
        graph.add_graph_output(&node_b, 0);

        let mut model = Model::new("m");
        model.set_version(3);
        model.with_attrs_mut(|attrs| attrs.set_str("producer", "graph-ir"));
        model.set_graph(graph);
        model
    }

    #[test]
    fn model_round_trip_preserves_topology() {
        let model = two_node_model();
        let bytes = model.to_bytes().unwrap();
        let back = Model::from_bytes(&bytes).unwrap();

        assert_eq!(back.name(), "m");
        assert_eq!(back.version(), 3);
        assert_eq!(back.with_attrs(|a| a.get_str("producer").map(String::from)),
            Some("graph-ir".into()));

        let graph = back.graph().unwrap();
        let graph = graph.borrow();
        assert_eq!(graph.node_count(), 2);
        let node_b = graph.find_node("b").unwrap();
        let (producer, idx) = node_b.borrow().producer_of_input(0).unwrap();
        assert_eq!(producer.borrow().name(), "a");
        assert_eq!(idx, 0);
        // The unconnected optional anchor stayed unconnected.
        assert!(node_b.borrow().producer_of_input(1).is_none());
        assert_eq!(graph.graph_inputs().len(), 1);
        assert_eq!(graph.graph_outputs().len(), 1);
    }

    #[test]
    fn serialization_is_idempotent() {
        let model = two_node_model();
        let bytes = model.to_bytes().unwrap();
        let once = Model::from_bytes(&bytes).unwrap();
        let bytes_again = once.to_bytes().unwrap();
        assert_eq!(bytes, bytes_again);
        let twice = Model::from_bytes(&bytes_again).unwrap();
        assert_eq!(twice.to_bytes().unwrap(), bytes_again);
    }

    #[test]
    fn forward_references_resolve() {
        // Consumer declared before its producer: resolution must not
        // depend on declaration order.
        let mut graph_def = protos::GraphDef::new();
        graph_def.name = "g".into();

        let mut consumer = OpDesc::new("consumer", "TestOp");
        consumer.add_input_desc("x", TensorDesc::new()).unwrap();
        let mut consumer_wire = consumer.to_proto().unwrap();
        consumer_wire.input.push("producer:0".into());
        graph_def.op.push(consumer_wire);

        let mut producer = OpDesc::new("producer", "Data");
        producer.add_output_desc("y", TensorDesc::new()).unwrap();
        graph_def.op.push(producer.to_proto().unwrap());

        let graph = deserialize_graph(&graph_def).unwrap();
        let consumer = graph.find_node("consumer").unwrap();
        let (src, _) = consumer.borrow().producer_of_input(0).unwrap();
        assert_eq!(src.borrow().name(), "producer");
    }

    #[test]
    fn dangling_reference_fails_decode() {
        let mut graph_def = protos::GraphDef::new();
        graph_def.name = "g".into();
        let mut consumer = OpDesc::new("consumer", "TestOp");
        consumer.add_input_desc("x", TensorDesc::new()).unwrap();
        let mut wire = consumer.to_proto().unwrap();
        wire.input.push("ghost:0".into());
        graph_def.op.push(wire);

        assert!(matches!(
            deserialize_graph(&graph_def),
            Err(Error::InvalidGraph(_))
        ));
    }

    #[test]
    fn control_edges_round_trip() {
        let a = data_op("a");
        let mut b = compute_op("b");
        b.add_control_input(&a).unwrap();
        let graph = GraphBuilder::build("main", &[b]).unwrap();

        let mut model = Model::new("m");
        model.set_graph(graph);
        let back = Model::from_bytes(&model.to_bytes().unwrap()).unwrap();

        let graph = back.graph().unwrap();
        let graph = graph.borrow();
        let node_b = graph.find_node("b").unwrap();
        let ctrl = node_b.borrow().control_in_nodes();
        assert_eq!(ctrl.len(), 1);
        assert_eq!(ctrl[0].borrow().name(), "a");
    }

    #[test]
    fn subgraphs_round_trip_with_reparenting() {
        let mut holder = compute_op("holder");
        holder.subgraph_register("body", false).unwrap();
        holder
            .set_subgraph_builder("body", || {
                let inner = data_op("inner_data");
                GraphBuilder::build("body_g", &[inner])
            })
            .unwrap();
        let feed = data_op("feed");
        holder.set_input("x", &feed).unwrap();

        let graph = GraphBuilder::build("main", &[holder]).unwrap();
        let mut model = Model::new("m");
        model.set_graph(graph);

        let back = Model::from_bytes(&model.to_bytes().unwrap()).unwrap();
        let root = back.graph().unwrap();
        let root = root.borrow();
        let sub = root.subgraph("body_g").expect("subgraph re-attached");
        assert_eq!(sub.borrow().parent_node_name(), Some("holder"));
        assert_eq!(sub.borrow().node_count(), 1);
        root.validate().unwrap();
    }

    #[test]
    fn malformed_references_are_param_errors() {
        assert!(matches!(parse_ref("no-colon"), Err(Error::InvalidParam(_))));
        assert!(matches!(parse_ref("x:notanum"), Err(Error::InvalidParam(_))));
        assert_eq!(parse_ref("a:b:2").unwrap(), ("a:b".into(), 2));
    }
}
