//! Topological assembly of linked operators into a compute graph.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::graph::ComputeGraph;
use crate::operator::Operator;

/// Builds a [`ComputeGraph`] from a root set of linked [`Operator`]s.
pub struct GraphBuilder;

impl GraphBuilder {
    /// Walk the link graph reachable from `roots`, materialize nodes and
    /// edges, and realize subgraph builders.
    ///
    /// Construction either returns a validated graph or fails whole; no
    /// partial graph escapes.
    pub fn build(name: impl Into<String>, roots: &[Operator]) -> Result<ComputeGraph> {
        let name = name.into();
        if roots.is_empty() {
            return Err(Error::InvalidParam("empty root set".into()));
        }

        // Phase 1: discover the connected component. Links are followed in
        // both directions, so a data source passed as the only root still
        // finds its consumers.
        let discovered = discover(roots);
        log::debug!("graph '{name}': discovered {} operators", discovered.len());

        let mut graph = ComputeGraph::new(name);

        // Phase 2: materialize nodes and realize subgraph builders. Every
        // subgraph is parented to the *root* graph, wherever it was found.
        let mut materialized = HashMap::new();
        for op in &discovered {
            let node = graph.add_node(op.op_desc());
            materialized.insert(op.runtime_id(), node);
            realize_subgraphs(op, &mut graph)?;
        }

        // Phase 3: connect anchors. Producers and consumers were all
        // materialized above; a miss here is a builder bug, not bad input.
        for op in &discovered {
            let dst = Rc::clone(&materialized[&op.runtime_id()]);
            for (input_name, src_op, src_out_index) in op.input_bindings() {
                let src = materialized.get(&src_op.runtime_id()).ok_or_else(|| {
                    Error::InvalidGraph(format!(
                        "producer '{}' was never materialized",
                        src_op.name()
                    ))
                })?;
                let dst_index = op.op_desc().input_index(&input_name).ok_or_else(|| {
                    Error::InvalidGraph(format!(
                        "input '{input_name}' vanished from '{}'",
                        op.name()
                    ))
                })?;
                graph.add_edge(src, src_out_index, &dst, dst_index)?;
            }
            for src_op in op.control_input_ops() {
                let src = materialized.get(&src_op.runtime_id()).ok_or_else(|| {
                    Error::InvalidGraph(format!(
                        "control producer '{}' was never materialized",
                        src_op.name()
                    ))
                })?;
                graph.add_control_edge(src, &dst)?;
            }
        }

        // Phase 4: reject structural violations.
        graph.validate()?;
        Ok(graph)
    }
}

/// Breadth-first enumeration of the full connected component, following
/// data links and control edges in both directions.
fn discover(roots: &[Operator]) -> Vec<Operator> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<Operator> = VecDeque::new();

    for root in roots {
        if visited.insert(root.runtime_id()) {
            queue.push_back(root.clone());
        }
    }
    while let Some(op) = queue.pop_front() {
        for linked in op.linked_ops() {
            if visited.insert(linked.runtime_id()) {
                queue.push_back(linked.clone());
            }
        }
        order.push(op);
    }
    order
}

/// Run every subgraph builder attached to `op`, record the instance names
/// on its descriptor, and attach the graphs (and any graphs they carried)
/// to the root graph.
fn realize_subgraphs(op: &Operator, root: &mut ComputeGraph) -> Result<()> {
    for (slot_key, builder) in op.all_subgraph_builders() {
        let mut sub = builder()?;
        let instance = sub.name().to_string();
        if instance.is_empty() {
            return Err(Error::InvalidGraph(format!(
                "builder for slot '{slot_key}' of '{}' produced an unnamed graph",
                op.name()
            )));
        }
        sub.set_parent_node_name(op.name());
        record_instance_name(op, &instance);

        // Nested builds already own their subgraphs; promote them upward
        // so the root graph owns every subgraph in the model.
        let nested = sub.take_subgraphs();
        root.add_subgraph(Rc::new(RefCell::new(sub)))?;
        for inner in nested {
            root.add_subgraph(inner)?;
        }
        log::debug!(
            "realized subgraph '{instance}' for slot '{slot_key}' of '{}'",
            op.name()
        );
    }
    Ok(())
}

/// Fill the first pre-allocated empty instance slot, or append.
fn record_instance_name(op: &Operator, instance: &str) {
    let mut desc = op.op_desc();
    let names = desc.subgraph_instance_names();
    match names.iter().position(|n| n.is_empty()) {
        Some(idx) => desc
            .set_subgraph_instance_name(idx, instance)
            .expect("index came from the same list"),
        None => desc.add_subgraph_instance_name(instance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_desc::OpDesc;
    use crate::tensor_desc::TensorDesc;

    fn source(name: &str) -> Operator {
        let mut desc = OpDesc::new(name, "Data");
        desc.add_output_desc("y", TensorDesc::new()).unwrap();
        Operator::from_op_desc(desc)
    }

    fn sink(name: &str) -> Operator {
        let mut desc = OpDesc::new(name, "TestOp");
        desc.add_input_desc("x", TensorDesc::new()).unwrap();
        desc.add_output_desc("y", TensorDesc::new()).unwrap();
        Operator::from_op_desc(desc)
    }

    #[test]
    fn build_from_either_root_is_isomorphic() {
        let a = source("a");
        let mut b = sink("b");
        b.set_input("x", &a).unwrap();

        for roots in [[a.clone()], [b.clone()]] {
            let graph = GraphBuilder::build("g", &roots).unwrap();
            assert_eq!(graph.node_count(), 2);
            let node_a = graph.find_node("a").unwrap();
            let node_b = graph.find_node("b").unwrap();
            let (producer, idx) = node_b.borrow().producer_of_input(0).unwrap();
            assert!(Rc::ptr_eq(&producer, &node_a));
            assert_eq!(idx, 0);
            assert_eq!(node_a.borrow().consumers_of_output(0).len(), 1);
        }
    }

    #[test]
    fn control_edges_materialize() {
        let a = source("a");
        let mut b = sink("b");
        b.add_control_input(&a).unwrap();

        let graph = GraphBuilder::build("g", &[b.clone()]).unwrap();
        let node_a = graph.find_node("a").unwrap();
        let node_b = graph.find_node("b").unwrap();
        assert_eq!(node_b.borrow().control_in_nodes().len(), 1);
        assert!(Rc::ptr_eq(
            &node_b.borrow().control_in_nodes()[0],
            &node_a
        ));
        assert_eq!(node_a.borrow().control_out_nodes().len(), 1);
    }

    #[test]
    fn duplicate_names_fail_whole_build() {
        let a = source("same");
        let mut b = sink("same");
        b.set_input("x", &a).unwrap();
        assert!(matches!(
            GraphBuilder::build("g", &[a]),
            Err(Error::InvalidGraph(_))
        ));
    }

    #[test]
    fn empty_roots_rejected() {
        assert!(matches!(
            GraphBuilder::build("g", &[]),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn subgraphs_are_realized_and_promoted_to_root() {
        // The inner builder itself builds an operator carrying a nested
        // subgraph, so promotion has something to move upward.
        let make_leaf_graph = || -> crate::Result<ComputeGraph> {
            let leaf = source("leaf_data");
            let mut g = GraphBuilder::build("leaf_g", &[leaf])?;
            g.set_name("leaf_g");
            Ok(g)
        };

        let build_mid_graph = move || -> crate::Result<ComputeGraph> {
            let mut holder = sink("mid_holder");
            holder.subgraph_register("inner", false).unwrap();
            holder.set_subgraph_builder("inner", make_leaf_graph).unwrap();
            let feed = source("mid_data");
            holder.set_input("x", &feed).unwrap();
            GraphBuilder::build("mid_g", &[holder])
        };

        let mut outer = sink("outer_holder");
        outer.subgraph_register("body", false).unwrap();
        outer.set_subgraph_builder("body", build_mid_graph).unwrap();
        let feed = source("outer_data");
        outer.set_input("x", &feed).unwrap();

        let graph = GraphBuilder::build("root", &[outer.clone()]).unwrap();

        // Both levels hang off the root graph's table.
        assert!(graph.subgraph("mid_g").is_some());
        assert!(graph.subgraph("leaf_g").is_some());
        assert!(graph.subgraph("mid_g").unwrap().borrow().subgraphs().is_empty());
        assert_eq!(
            graph.subgraph("mid_g").unwrap().borrow().parent_node_name(),
            Some("outer_holder")
        );
        // Instance names landed on the holders' descriptors.
        assert_eq!(outer.op_desc().subgraph_instance_names(), vec!["mid_g"]);
        graph.validate().unwrap();
    }

    #[test]
    fn dynamic_subgraph_slots_fill_preallocated_instances() {
        let mut op = sink("case");
        op.subgraph_register("branches", true).unwrap();
        op.subgraph_count_register("branches", 2).unwrap();
        op.set_dynamic_subgraph_builder("branches", 0, || Ok(ComputeGraph::new("branch0")))
            .unwrap();
        op.set_dynamic_subgraph_builder("branches", 1, || Ok(ComputeGraph::new("branch1")))
            .unwrap();
        let feed = source("d");
        op.set_input("x", &feed).unwrap();

        let graph = GraphBuilder::build("root", &[op.clone()]).unwrap();
        assert_eq!(
            op.op_desc().subgraph_instance_names(),
            vec!["branch0", "branch1"]
        );
        assert!(graph.subgraph("branch0").is_some());
        assert!(graph.subgraph("branch1").is_some());
    }
}
