//! The materialized graph: nodes, anchored edges and root-owned subgraphs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::attr::AttrStore;
use crate::error::{Error, Result};
use crate::op_desc::OpDesc;

/// Shared handle to a node.
pub type NodeRef = Rc<RefCell<Node>>;

/// Shared handle to a graph.
pub type GraphRef = Rc<RefCell<ComputeGraph>>;

/// The producer side of a data edge, seen from a consumer's input anchor.
#[derive(Clone)]
pub(crate) struct PeerOut {
    pub node: Weak<RefCell<Node>>,
    pub index: usize,
}

/// The consumer side of a data edge, seen from a producer's output anchor.
#[derive(Clone)]
pub(crate) struct PeerIn {
    pub node: Weak<RefCell<Node>>,
    pub index: usize,
}

/// One node of a materialized graph.
///
/// A node owns its [`OpDesc`] handle (shared with the operator it was built
/// from). Data edges connect indexed output anchors to indexed input
/// anchors; control edges are index-less. Peer references are weak, the
/// graph's node list is the owning side.
pub struct Node {
    op_desc: OpDesc,
    in_data: Vec<Option<PeerOut>>,
    out_data: Vec<Vec<PeerIn>>,
    in_ctrl: Vec<Weak<RefCell<Node>>>,
    out_ctrl: Vec<Weak<RefCell<Node>>>,
}

impl Node {
    fn new(op_desc: OpDesc) -> Self {
        let in_len = op_desc.all_inputs_size();
        let out_len = op_desc.outputs_size();
        Self {
            op_desc,
            in_data: vec![None; in_len],
            out_data: vec![Vec::new(); out_len],
            in_ctrl: Vec::new(),
            out_ctrl: Vec::new(),
        }
    }

    pub fn name(&self) -> String {
        self.op_desc.name()
    }

    pub fn op_type(&self) -> String {
        self.op_desc.op_type()
    }

    /// The node's descriptor (shared handle).
    pub fn op_desc(&self) -> OpDesc {
        self.op_desc.clone()
    }

    /// Number of input anchors.
    pub fn in_anchor_count(&self) -> usize {
        self.in_data.len()
    }

    /// Number of output anchors.
    pub fn out_anchor_count(&self) -> usize {
        self.out_data.len()
    }

    /// The producer connected to input anchor `index`.
    pub fn producer_of_input(&self, index: usize) -> Option<(NodeRef, usize)> {
        let peer = self.in_data.get(index)?.as_ref()?;
        Some((peer.node.upgrade()?, peer.index))
    }

    /// All consumers connected to output anchor `index`.
    pub fn consumers_of_output(&self, index: usize) -> Vec<(NodeRef, usize)> {
        match self.out_data.get(index) {
            Some(peers) => peers
                .iter()
                .filter_map(|p| Some((p.node.upgrade()?, p.index)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Nodes this one control-depends on.
    pub fn control_in_nodes(&self) -> Vec<NodeRef> {
        self.in_ctrl.iter().filter_map(Weak::upgrade).collect()
    }

    /// Nodes control-depending on this one.
    pub fn control_out_nodes(&self) -> Vec<NodeRef> {
        self.out_ctrl.iter().filter_map(Weak::upgrade).collect()
    }

    fn ensure_in_anchor(&mut self, index: usize) {
        if self.in_data.len() <= index {
            self.in_data.resize(index + 1, None);
        }
    }

    fn ensure_out_anchor(&mut self, index: usize) {
        if self.out_data.len() <= index {
            self.out_data.resize(index + 1, Vec::new());
        }
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("type", &self.op_type())
            .field("in_anchors", &self.in_data.len())
            .field("out_anchors", &self.out_data.len())
            .finish()
    }
}

/// A named node container with anchored edges.
///
/// Subgraphs are owned by the **root** graph in declaration order and are
/// referenced from node descriptors by instance name only.
pub struct ComputeGraph {
    name: String,
    nodes: Vec<NodeRef>,
    inputs: Vec<(NodeRef, usize)>,
    outputs: Vec<(NodeRef, usize)>,
    subgraphs: Vec<GraphRef>,
    subgraph_index: HashMap<String, usize>,
    parent_node_name: Option<String>,
    attrs: AttrStore,
}

impl ComputeGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            subgraphs: Vec::new(),
            subgraph_index: HashMap::new(),
            parent_node_name: None,
            attrs: AttrStore::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The node whose subgraph slot references this graph, when this graph
    /// is a subgraph.
    pub fn parent_node_name(&self) -> Option<&str> {
        self.parent_node_name.as_deref()
    }

    pub fn set_parent_node_name(&mut self, name: impl Into<String>) {
        self.parent_node_name = Some(name.into());
    }

    pub fn with_attrs<R>(&self, f: impl FnOnce(&AttrStore) -> R) -> R {
        f(&self.attrs)
    }

    pub fn with_attrs_mut<R>(&mut self, f: impl FnOnce(&mut AttrStore) -> R) -> R {
        f(&mut self.attrs)
    }

    /// Materialize a node from a descriptor. Name collisions are caught by
    /// [`ComputeGraph::validate`], not here.
    pub fn add_node(&mut self, op_desc: OpDesc) -> NodeRef {
        let node = Rc::new(RefCell::new(Node::new(op_desc)));
        self.nodes.push(Rc::clone(&node));
        node
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn find_node(&self, name: &str) -> Option<NodeRef> {
        self.nodes
            .iter()
            .find(|n| n.borrow().name() == name)
            .map(Rc::clone)
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, name: &str) -> Result<()> {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.borrow().name() == name)
            .ok_or_else(|| Error::NotFound(format!("node '{name}'")))?;
        let node = self.nodes.remove(pos);
        let target = Rc::downgrade(&node);
        for other in &self.nodes {
            let mut other = other.borrow_mut();
            for slot in other.in_data.iter_mut() {
                let points_at_target = matches!(slot, Some(peer) if peer.node.ptr_eq(&target));
                if points_at_target {
                    *slot = None;
                }
            }
            for peers in other.out_data.iter_mut() {
                peers.retain(|p| !p.node.ptr_eq(&target));
            }
            other.in_ctrl.retain(|w| !w.ptr_eq(&target));
            other.out_ctrl.retain(|w| !w.ptr_eq(&target));
        }
        self.inputs.retain(|(n, _)| !Rc::ptr_eq(n, &node));
        self.outputs.retain(|(n, _)| !Rc::ptr_eq(n, &node));
        Ok(())
    }

    /// Connect `src`'s output anchor to `dst`'s input anchor. A destination
    /// anchor can hold at most one edge.
    pub fn add_edge(
        &mut self,
        src: &NodeRef,
        src_index: usize,
        dst: &NodeRef,
        dst_index: usize,
    ) -> Result<()> {
        if Rc::ptr_eq(src, dst) {
            return Err(Error::InvalidParam(format!(
                "self edge on node '{}'",
                src.borrow().name()
            )));
        }
        {
            let mut dst_node = dst.borrow_mut();
            dst_node.ensure_in_anchor(dst_index);
            if dst_node.in_data[dst_index].is_some() {
                return Err(Error::InvalidGraph(format!(
                    "input anchor {dst_index} of '{}' already connected",
                    dst_node.name()
                )));
            }
            dst_node.in_data[dst_index] = Some(PeerOut {
                node: Rc::downgrade(src),
                index: src_index,
            });
        }
        let mut src_node = src.borrow_mut();
        src_node.ensure_out_anchor(src_index);
        src_node.out_data[src_index].push(PeerIn {
            node: Rc::downgrade(dst),
            index: dst_index,
        });
        Ok(())
    }

    /// Add a control edge. Duplicate control edges are a no-op.
    pub fn add_control_edge(&mut self, src: &NodeRef, dst: &NodeRef) -> Result<()> {
        if Rc::ptr_eq(src, dst) {
            return Err(Error::InvalidParam(format!(
                "control self edge on node '{}'",
                src.borrow().name()
            )));
        }
        let dst_weak = Rc::downgrade(dst);
        let mut src_node = src.borrow_mut();
        if src_node.out_ctrl.iter().any(|w| w.ptr_eq(&dst_weak)) {
            return Ok(());
        }
        src_node.out_ctrl.push(dst_weak);
        dst.borrow_mut().in_ctrl.push(Rc::downgrade(src));
        Ok(())
    }

    /// Declare a graph-level input anchored at `(node, index)`.
    pub fn add_graph_input(&mut self, node: &NodeRef, index: usize) {
        self.inputs.push((Rc::clone(node), index));
    }

    /// Declare a graph-level output anchored at `(node, index)`.
    pub fn add_graph_output(&mut self, node: &NodeRef, index: usize) {
        self.outputs.push((Rc::clone(node), index));
    }

    pub fn graph_inputs(&self) -> &[(NodeRef, usize)] {
        &self.inputs
    }

    pub fn graph_outputs(&self) -> &[(NodeRef, usize)] {
        &self.outputs
    }

    /// Attach a subgraph to this (root) graph. Duplicate instance names are
    /// a structural error.
    pub fn add_subgraph(&mut self, graph: GraphRef) -> Result<()> {
        let name = graph.borrow().name().to_string();
        if self.subgraph_index.contains_key(&name) {
            return Err(Error::InvalidGraph(format!(
                "subgraph '{name}' registered twice"
            )));
        }
        self.subgraph_index.insert(name, self.subgraphs.len());
        self.subgraphs.push(graph);
        Ok(())
    }

    pub fn subgraph(&self, name: &str) -> Option<GraphRef> {
        let idx = *self.subgraph_index.get(name)?;
        self.subgraphs.get(idx).map(Rc::clone)
    }

    pub fn subgraphs(&self) -> &[GraphRef] {
        &self.subgraphs
    }

    /// Detach all subgraphs, for promotion into an enclosing root graph.
    pub(crate) fn take_subgraphs(&mut self) -> Vec<GraphRef> {
        self.subgraph_index.clear();
        std::mem::take(&mut self.subgraphs)
    }

    /// Check the structural invariants: unique node names within this graph
    /// and within every subgraph, and no dangling subgraph instance
    /// reference anywhere.
    pub fn validate(&self) -> Result<()> {
        self.validate_node_names()?;
        for sub in &self.subgraphs {
            sub.borrow().validate_node_names()?;
        }

        let check_refs = |graph: &ComputeGraph| -> Result<()> {
            for node in &graph.nodes {
                for instance in node.borrow().op_desc.subgraph_instance_names() {
                    if !self.subgraph_index.contains_key(&instance) {
                        return Err(Error::InvalidGraph(format!(
                            "node '{}' references unknown subgraph '{instance}'",
                            node.borrow().name()
                        )));
                    }
                }
            }
            Ok(())
        };
        check_refs(self)?;
        for sub in &self.subgraphs {
            check_refs(&sub.borrow())?;
        }
        Ok(())
    }

    fn validate_node_names(&self) -> Result<()> {
        let mut seen = HashMap::new();
        for node in &self.nodes {
            let name = node.borrow().name();
            if seen.insert(name.clone(), ()).is_some() {
                return Err(Error::InvalidGraph(format!(
                    "duplicate node name '{name}' in graph '{}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for ComputeGraph {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ComputeGraph")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("subgraphs", &self.subgraphs.len())
            .finish()
    }
}
