//! User-facing operator handles and the graph-construction link state.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::attr::AttrValue;
use crate::error::{Error, Result};
use crate::graph::ComputeGraph;
use crate::op_desc::OpDesc;
use crate::tensor::Tensor;
use crate::tensor_desc::TensorDesc;
use crate::types::Format;

/// Operator types recognized as constant producers.
const CONST_TYPES: &[&str] = &["Const", "Constant"];
/// Passthrough types unwrapped during constant resolution.
const ENTER_TYPES: &[&str] = &["Enter", "RefEnter"];
/// Graph-input placeholder type whose value chains to a parent.
const DATA_TYPE: &str = "Data";
/// Attribute holding a constant operator's value.
const ATTR_KEY_VALUE: &str = "value";

/// Deferred construction callback for a subgraph slot.
pub type SubgraphBuilder = Rc<dyn Fn() -> Result<ComputeGraph>>;

/// Binding of one input to a producer's output.
pub(crate) struct OutHandle {
    /// Strong reference: an input keeps its producer alive. The reverse
    /// direction and control edges are weak; breaking this asymmetry
    /// reintroduces reference cycles.
    pub owner: Rc<RefCell<OperatorImpl>>,
    pub output_name: String,
    pub output_index: usize,
}

struct ConsumerRef {
    op: Weak<RefCell<OperatorImpl>>,
    input_name: String,
}

pub(crate) struct OperatorImpl {
    op_desc: OpDesc,
    /// input name → producer binding. One binding per name; re-binding
    /// overwrites.
    input_links: HashMap<String, OutHandle>,
    /// output name → consumer bindings (weak).
    output_links: HashMap<String, Vec<ConsumerRef>>,
    control_in: Vec<Weak<RefCell<OperatorImpl>>>,
    control_out: Vec<Weak<RefCell<OperatorImpl>>>,
    /// ir slot name → dynamic flag.
    subgraph_dynamic: HashMap<String, bool>,
    /// ir slot name (plus numeric suffix when dynamic) → builder.
    subgraph_builders: HashMap<String, SubgraphBuilder>,
    /// Pre-attached literal input values.
    const_inputs: HashMap<String, Tensor>,
    /// Runtime inference results keyed by (producer id, output index).
    inferred: HashMap<(u64, usize), Tensor>,
    keeper_id: u64,
}

thread_local! {
    static KEEPER: RefCell<HashMap<u64, Rc<RefCell<OperatorImpl>>>> =
        RefCell::new(HashMap::new());
    static NEXT_KEEPER_ID: Cell<u64> = const { Cell::new(1) };
}

/// Registry retaining strong ownership of every live standalone operator.
///
/// Operators reference each other bidirectionally; the keeper plus
/// [`Operator::break_connect`] is the cycle-breaking mechanism standing in
/// for true ownership. The registry is per thread, matching the
/// single-threaded construction model of the IR.
pub struct OperatorKeeper;

impl OperatorKeeper {
    /// Number of operators currently checked in.
    pub fn size() -> usize {
        KEEPER.with(|k| k.borrow().len())
    }

    /// Drop every retained operator. Intended for teardown after all
    /// producers are quiescent.
    pub fn clear() {
        KEEPER.with(|k| k.borrow_mut().clear());
    }

    fn check_in(imp: &Rc<RefCell<OperatorImpl>>) -> u64 {
        let id = NEXT_KEEPER_ID.with(|c| {
            let id = c.get();
            c.set(id + 1);
            id
        });
        KEEPER.with(|k| k.borrow_mut().insert(id, Rc::clone(imp)));
        id
    }

    fn check_out(id: u64) {
        KEEPER.with(|k| k.borrow_mut().remove(&id));
    }
}

/// Handle to a graph-construction operator.
///
/// Cloning shares the underlying state; operators are identity objects,
/// not values.
#[derive(Clone)]
pub struct Operator {
    imp: Rc<RefCell<OperatorImpl>>,
}

impl Operator {
    /// Create a standalone operator and check it into the keeper.
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self::from_op_desc(OpDesc::new(name, op_type))
    }

    /// Wrap an existing descriptor and check the operator into the keeper.
    pub fn from_op_desc(op_desc: OpDesc) -> Self {
        let imp = Rc::new(RefCell::new(OperatorImpl {
            op_desc,
            input_links: HashMap::new(),
            output_links: HashMap::new(),
            control_in: Vec::new(),
            control_out: Vec::new(),
            subgraph_dynamic: HashMap::new(),
            subgraph_builders: HashMap::new(),
            const_inputs: HashMap::new(),
            inferred: HashMap::new(),
            keeper_id: 0,
        }));
        let id = OperatorKeeper::check_in(&imp);
        imp.borrow_mut().keeper_id = id;
        Self { imp }
    }

    pub fn name(&self) -> String {
        self.imp.borrow().op_desc.name()
    }

    pub fn op_type(&self) -> String {
        self.imp.borrow().op_desc.op_type()
    }

    /// Stable identity of this operator within the process.
    pub fn runtime_id(&self) -> u64 {
        self.imp.borrow().keeper_id
    }

    /// The descriptor (shared handle).
    pub fn op_desc(&self) -> OpDesc {
        self.imp.borrow().op_desc.clone()
    }

    pub fn same(a: &Operator, b: &Operator) -> bool {
        Rc::ptr_eq(&a.imp, &b.imp)
    }

    // ------------------------------------------------------------------
    // Descriptor surface kept stable for shape-inference consumers
    // ------------------------------------------------------------------

    pub fn input_desc(&self, name: &str) -> Option<TensorDesc> {
        self.imp.borrow().op_desc.input_desc_by_name(name)
    }

    pub fn output_desc(&self, name: &str) -> Option<TensorDesc> {
        self.imp.borrow().op_desc.output_desc_by_name(name)
    }

    pub fn update_input_desc(&mut self, name: &str, desc: TensorDesc) -> Result<()> {
        self.imp.borrow_mut().op_desc.update_input_desc(name, desc)
    }

    pub fn update_output_desc(&mut self, name: &str, desc: TensorDesc) -> Result<()> {
        self.imp.borrow_mut().op_desc.update_output_desc(name, desc)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: AttrValue) {
        let mut imp = self.imp.borrow_mut();
        imp.op_desc.with_attrs_mut(|a| a.set(name, value));
    }

    pub fn get_attr(&self, name: &str) -> Option<AttrValue> {
        let imp = self.imp.borrow();
        imp.op_desc.with_attrs(|a| a.get(name).cloned())
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    /// Connect `src`'s first output to this operator's input `dst_name`.
    pub fn set_input(&mut self, dst_name: &str, src: &Operator) -> Result<()> {
        self.set_input_by_index(dst_name, src, 0)
    }

    /// Connect `src`'s output `src_output` (by name) to input `dst_name`.
    pub fn set_input_by_name(
        &mut self,
        dst_name: &str,
        src: &Operator,
        src_output: &str,
    ) -> Result<()> {
        let index = src
            .imp
            .borrow()
            .op_desc
            .output_index(src_output)
            .ok_or_else(|| Error::NotFound(format!("output '{src_output}'")))?;
        self.link(dst_name, src, src_output.to_string(), index)
    }

    /// Connect `src`'s output at `src_index` to input `dst_name`.
    pub fn set_input_by_index(
        &mut self,
        dst_name: &str,
        src: &Operator,
        src_index: usize,
    ) -> Result<()> {
        let name = src
            .imp
            .borrow()
            .op_desc
            .output_names()
            .get(src_index)
            .cloned()
            .ok_or_else(|| Error::InvalidParam(format!("output index {src_index} out of range")))?;
        self.link(dst_name, src, name, src_index)
    }

    fn link(
        &mut self,
        dst_name: &str,
        src: &Operator,
        src_output: String,
        src_index: usize,
    ) -> Result<()> {
        if Rc::ptr_eq(&self.imp, &src.imp) {
            return Err(Error::InvalidParam(format!(
                "operator '{}' cannot consume itself",
                self.name()
            )));
        }
        let dst_index = self
            .imp
            .borrow()
            .op_desc
            .input_index(dst_name)
            .ok_or_else(|| Error::NotFound(format!("input '{dst_name}'")))?;

        // Re-binding overwrites: detach from the previous producer first.
        let old_binding = self.imp.borrow_mut().input_links.remove(dst_name);
        if let Some(old) = old_binding {
            let mut old_owner = old.owner.borrow_mut();
            if let Some(consumers) = old_owner.output_links.get_mut(&old.output_name) {
                consumers.retain(|c| {
                    !(c.input_name == dst_name && c.op.ptr_eq(&Rc::downgrade(&self.imp)))
                });
            }
        }

        src.imp
            .borrow_mut()
            .output_links
            .entry(src_output.clone())
            .or_default()
            .push(ConsumerRef {
                op: Rc::downgrade(&self.imp),
                input_name: dst_name.to_string(),
            });
        self.imp.borrow_mut().input_links.insert(
            dst_name.to_string(),
            OutHandle {
                owner: Rc::clone(&src.imp),
                output_name: src_output,
                output_index: src_index,
            },
        );

        // Constant-producer flag, growing the bitmap as needed.
        let src_is_const = CONST_TYPES.contains(&src.op_type().as_str());
        self.imp
            .borrow_mut()
            .op_desc
            .set_input_const_at(dst_index, src_is_const);

        self.propagate_format(dst_index, src, src_index);
        Ok(())
    }

    /// Format propagation between the two connected descriptors. This is
    /// the only place formats cross an edge.
    fn propagate_format(&mut self, dst_index: usize, src: &Operator, src_index: usize) {
        let dst_desc = match self.imp.borrow().op_desc.input_desc_shared(dst_index) {
            Some(d) => d,
            None => return,
        };
        let src_desc = match src.imp.borrow().op_desc.output_desc_shared(src_index) {
            Some(d) => d,
            None => return,
        };
        let mut src_desc = src_desc;
        if dst_desc.format() == Format::Nd {
            // Destination never constrained its layout.
            src_desc.set_format(Format::Nd);
        } else {
            src_desc.set_format(dst_desc.format());
            src_desc.set_origin_format(dst_desc.origin_format());
        }
    }

    /// Add a control dependency on `src`. Duplicates are a no-op; both
    /// directions are weak.
    pub fn add_control_input(&mut self, src: &Operator) -> Result<()> {
        if Rc::ptr_eq(&self.imp, &src.imp) {
            return Err(Error::InvalidParam(format!(
                "operator '{}' cannot control-depend on itself",
                self.name()
            )));
        }
        let src_weak = Rc::downgrade(&src.imp);
        {
            let imp = self.imp.borrow();
            if imp.control_in.iter().any(|w| w.ptr_eq(&src_weak)) {
                return Ok(());
            }
        }
        self.imp.borrow_mut().control_in.push(src_weak);
        src.imp
            .borrow_mut()
            .control_out
            .push(Rc::downgrade(&self.imp));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Constant resolution
    // ------------------------------------------------------------------

    /// Attach a literal value for an input; the first stop of
    /// [`Operator::get_input_const_data`].
    pub fn set_const_input(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.imp.borrow_mut().const_inputs.insert(name.into(), tensor);
    }

    /// Record an inference-time constant for a producer's output.
    pub fn cache_const_result(&mut self, producer_id: u64, output_index: usize, tensor: Tensor) {
        self.imp
            .borrow_mut()
            .inferred
            .insert((producer_id, output_index), tensor);
    }

    /// Resolve a constant value for input `name`.
    ///
    /// Tried in order: a pre-attached literal, the runtime inference
    /// cache, unwrapping `Enter`/`RefEnter`, a constant-producing node's
    /// value attribute, and a `Data` passthrough chain to its parent.
    /// Only after all five does this report not-found.
    pub fn get_input_const_data(&self, name: &str) -> Result<Tensor> {
        if let Some(tensor) = self.imp.borrow().const_inputs.get(name) {
            return Ok(tensor.share());
        }

        let (mut producer, mut out_index) = {
            let imp = self.imp.borrow();
            let handle = imp
                .input_links
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("input '{name}' is not connected")))?;
            (Rc::clone(&handle.owner), handle.output_index)
        };

        let producer_id = producer.borrow().keeper_id;
        if let Some(tensor) = self.imp.borrow().inferred.get(&(producer_id, out_index)) {
            return Ok(tensor.share());
        }

        // Walk through value-preserving producers.
        loop {
            let op_type = producer.borrow().op_desc.op_type();

            if ENTER_TYPES.contains(&op_type.as_str()) || op_type == DATA_TYPE {
                let next = {
                    let imp = producer.borrow();
                    let first_input = imp.op_desc.input_names().into_iter().next();
                    first_input
                        .and_then(|input| imp.input_links.get(&input).map(|h| {
                            (Rc::clone(&h.owner), h.output_index)
                        }))
                };
                match next {
                    Some((next_producer, next_index)) => {
                        producer = next_producer;
                        out_index = next_index;
                        continue;
                    }
                    None => break,
                }
            }

            if CONST_TYPES.contains(&op_type.as_str()) {
                let value = producer
                    .borrow()
                    .op_desc
                    .with_attrs(|a| a.get_tensor(ATTR_KEY_VALUE).map(Tensor::share));
                if let Some(tensor) = value {
                    return Ok(tensor);
                }
            }
            break;
        }

        let _ = out_index;
        Err(Error::NotFound(format!("constant data for input '{name}'")))
    }

    // ------------------------------------------------------------------
    // Subgraphs
    // ------------------------------------------------------------------

    /// Register an IR-level subgraph slot. `dynamic` slots take numbered
    /// instances, static slots exactly one.
    pub fn subgraph_register(&mut self, name: impl Into<String>, dynamic: bool) -> Result<()> {
        let name = name.into();
        let mut imp = self.imp.borrow_mut();
        imp.op_desc.add_subgraph_name(name.clone())?;
        imp.subgraph_dynamic.insert(name, dynamic);
        Ok(())
    }

    /// Pre-allocate `count` indexed instances of a dynamic slot.
    pub fn subgraph_count_register(&mut self, name: &str, count: usize) -> Result<()> {
        let mut imp = self.imp.borrow_mut();
        match imp.subgraph_dynamic.get(name) {
            Some(true) => {}
            Some(false) => {
                return Err(Error::InvalidParam(format!(
                    "subgraph slot '{name}' is not dynamic"
                )));
            }
            None => return Err(Error::NotFound(format!("subgraph slot '{name}'"))),
        }
        for _ in 0..count {
            imp.op_desc.add_subgraph_instance_name("");
        }
        Ok(())
    }

    /// Attach a builder to a static subgraph slot.
    pub fn set_subgraph_builder(
        &mut self,
        name: &str,
        builder: impl Fn() -> Result<ComputeGraph> + 'static,
    ) -> Result<()> {
        let mut imp = self.imp.borrow_mut();
        match imp.subgraph_dynamic.get(name) {
            Some(false) => {}
            Some(true) => {
                return Err(Error::InvalidParam(format!(
                    "subgraph slot '{name}' is dynamic, an index is required"
                )));
            }
            None => return Err(Error::NotFound(format!("subgraph slot '{name}'"))),
        }
        imp.subgraph_builders
            .insert(name.to_string(), Rc::new(builder));
        Ok(())
    }

    /// Attach a builder to one indexed instance of a dynamic slot.
    pub fn set_dynamic_subgraph_builder(
        &mut self,
        name: &str,
        index: usize,
        builder: impl Fn() -> Result<ComputeGraph> + 'static,
    ) -> Result<()> {
        let mut imp = self.imp.borrow_mut();
        match imp.subgraph_dynamic.get(name) {
            Some(true) => {}
            Some(false) => {
                return Err(Error::InvalidParam(format!(
                    "subgraph slot '{name}' is static, no index applies"
                )));
            }
            None => return Err(Error::NotFound(format!("subgraph slot '{name}'"))),
        }
        imp.subgraph_builders
            .insert(format!("{name}{index}"), Rc::new(builder));
        Ok(())
    }

    /// The builder for a static slot.
    pub fn subgraph_builder(&self, name: &str) -> Option<SubgraphBuilder> {
        self.imp.borrow().subgraph_builders.get(name).cloned()
    }

    /// The builder for an indexed instance of a dynamic slot.
    pub fn dynamic_subgraph_builder(&self, name: &str, index: usize) -> Option<SubgraphBuilder> {
        self.imp
            .borrow()
            .subgraph_builders
            .get(&format!("{name}{index}"))
            .cloned()
    }

    /// All attached builders, keyed and sorted for deterministic
    /// realization order.
    pub(crate) fn all_subgraph_builders(&self) -> Vec<(String, SubgraphBuilder)> {
        let imp = self.imp.borrow();
        let mut builders: Vec<(String, SubgraphBuilder)> = imp
            .subgraph_builders
            .iter()
            .map(|(k, v)| (k.clone(), Rc::clone(v)))
            .collect();
        builders.sort_by(|a, b| a.0.cmp(&b.0));
        builders
    }

    // ------------------------------------------------------------------
    // Teardown and traversal
    // ------------------------------------------------------------------

    /// Clear every link and check the operator out of the keeper. After
    /// this, nothing keeps the operator alive but caller handles.
    pub fn break_connect(&mut self) {
        let id = {
            let mut imp = self.imp.borrow_mut();
            imp.input_links.clear();
            imp.output_links.clear();
            imp.control_in.clear();
            imp.control_out.clear();
            imp.keeper_id
        };
        OperatorKeeper::check_out(id);
        log::debug!("operator '{}' disconnected", self.name());
    }

    /// Producers bound to inputs, as (input name, producer, output index),
    /// sorted by this operator's input slot order.
    pub(crate) fn input_bindings(&self) -> Vec<(String, Operator, usize)> {
        let imp = self.imp.borrow();
        let mut bindings: Vec<(usize, String, Operator, usize)> = imp
            .input_links
            .iter()
            .filter_map(|(input, handle)| {
                let slot = imp.op_desc.input_index(input)?;
                Some((
                    slot,
                    input.clone(),
                    Operator {
                        imp: Rc::clone(&handle.owner),
                    },
                    handle.output_index,
                ))
            })
            .collect();
        bindings.sort_by_key(|(slot, ..)| *slot);
        bindings
            .into_iter()
            .map(|(_, input, op, idx)| (input, op, idx))
            .collect()
    }

    /// Operators this one control-depends on.
    pub(crate) fn control_input_ops(&self) -> Vec<Operator> {
        self.imp
            .borrow()
            .control_in
            .iter()
            .filter_map(|w| w.upgrade().map(|imp| Operator { imp }))
            .collect()
    }

    /// Every directly linked operator, both directions, data and control,
    /// in a deterministic order (input slot order, then output name order,
    /// then control insertion order) so graph discovery is reproducible.
    pub(crate) fn linked_ops(&self) -> Vec<Operator> {
        let mut out: Vec<Operator> = self
            .input_bindings()
            .into_iter()
            .map(|(_, op, _)| op)
            .collect();
        let imp = self.imp.borrow();
        let mut output_names: Vec<&String> = imp.output_links.keys().collect();
        output_names.sort();
        for name in output_names {
            for consumer in &imp.output_links[name] {
                if let Some(rc) = consumer.op.upgrade() {
                    out.push(Operator { imp: rc });
                }
            }
        }
        for w in imp.control_in.iter().chain(imp.control_out.iter()) {
            if let Some(rc) = w.upgrade() {
                out.push(Operator { imp: rc });
            }
        }
        out
    }
}

impl core::fmt::Debug for Operator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let imp = self.imp.borrow();
        f.debug_struct("Operator")
            .field("name", &imp.op_desc.name())
            .field("type", &imp.op_desc.op_type())
            .field("inputs_bound", &imp.input_links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn single_out_op(name: &str, op_type: &str) -> Operator {
        let mut desc = OpDesc::new(name, op_type);
        desc.add_output_desc("y", TensorDesc::new()).unwrap();
        Operator::from_op_desc(desc)
    }

    fn consumer_op(name: &str, inputs: &[&str]) -> Operator {
        let mut desc = OpDesc::new(name, "TestOp");
        for input in inputs {
            desc.add_input_desc(*input, TensorDesc::new()).unwrap();
        }
        desc.add_output_desc("y", TensorDesc::new()).unwrap();
        Operator::from_op_desc(desc)
    }

    #[test]
    fn keeper_retains_until_break_connect() {
        let before = OperatorKeeper::size();
        let mut op = Operator::new("lonely", "TestOp");
        assert_eq!(OperatorKeeper::size(), before + 1);
        op.break_connect();
        assert_eq!(OperatorKeeper::size(), before);
    }

    #[test]
    fn set_input_records_both_directions() {
        let src = single_out_op("src", "TestOp");
        let mut dst = consumer_op("dst", &["x"]);
        dst.set_input("x", &src).unwrap();

        let bindings = dst.input_bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].0, "x");
        assert!(Operator::same(&bindings[0].1, &src));
        assert_eq!(bindings[0].2, 0);

        // Unknown destination input is a probe failure.
        assert!(matches!(
            dst.set_input("ghost", &src),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn rebinding_overwrites() {
        let a = single_out_op("a", "TestOp");
        let b = single_out_op("b", "TestOp");
        let mut dst = consumer_op("dst", &["x"]);
        dst.set_input("x", &a).unwrap();
        dst.set_input("x", &b).unwrap();

        let bindings = dst.input_bindings();
        assert_eq!(bindings.len(), 1);
        assert!(Operator::same(&bindings[0].1, &b));
        // The stale consumer entry on `a` is gone.
        assert!(a.imp.borrow().output_links["y"].is_empty());
    }

    #[test]
    fn const_flag_propagates_into_bitmap() {
        let weight = single_out_op("w", "Const");
        let data = single_out_op("d", "TestOp");
        let mut dst = consumer_op("dst", &["a", "b", "c"]);
        dst.set_input("c", &weight).unwrap();
        dst.set_input("a", &data).unwrap();
        assert_eq!(dst.op_desc().is_input_const(), vec![false, false, true]);
    }

    #[test]
    fn format_propagation_rules() {
        use crate::types::Format;

        // Unset destination: source forced to ND.
        let src = {
            let mut desc = OpDesc::new("s", "TestOp");
            desc.add_output_desc(
                "y",
                TensorDesc::with_shape(vec![1, 2, 3, 4], Format::Nchw, DataType::Float),
            )
            .unwrap();
            Operator::from_op_desc(desc)
        };
        let mut dst = consumer_op("d", &["x"]);
        dst.set_input("x", &src).unwrap();
        assert_eq!(src.op_desc().output_desc(0).unwrap().format(), Format::Nd);

        // Constrained destination: its format and origin format are imposed
        // on the source output.
        let src2 = {
            let mut desc = OpDesc::new("s2", "TestOp");
            desc.add_output_desc(
                "y",
                TensorDesc::with_shape(vec![1, 2, 3, 4], Format::Nchw, DataType::Float),
            )
            .unwrap();
            Operator::from_op_desc(desc)
        };
        let mut dst2 = {
            let mut desc = OpDesc::new("d2", "TestOp");
            let mut input = TensorDesc::with_shape(vec![1, 2, 3, 4], Format::Nhwc, DataType::Float);
            input.set_origin_format(Format::Nchw);
            desc.add_input_desc("x", input).unwrap();
            Operator::from_op_desc(desc)
        };
        dst2.set_input("x", &src2).unwrap();
        let out = src2.op_desc().output_desc(0).unwrap();
        assert_eq!(out.format(), Format::Nhwc);
        assert_eq!(out.origin_format(), Format::Nchw);
    }

    #[test]
    fn control_inputs_dedup() {
        let a = single_out_op("a", "TestOp");
        let mut b = consumer_op("b", &[]);
        b.add_control_input(&a).unwrap();
        b.add_control_input(&a).unwrap();
        assert_eq!(b.control_input_ops().len(), 1);
    }

    fn const_op(name: &str, value: f32) -> Operator {
        let mut desc = OpDesc::new(name, "Const");
        desc.add_output_desc("y", TensorDesc::new()).unwrap();
        let tensor = Tensor::with_data(
            TensorDesc::with_shape(vec![1], crate::types::Format::Nd, DataType::Float),
            &value.to_le_bytes(),
        );
        desc.with_attrs_mut(|a| a.set_tensor(ATTR_KEY_VALUE, tensor));
        Operator::from_op_desc(desc)
    }

    #[test]
    fn const_data_from_literal_and_cache() {
        let producer = single_out_op("p", "TestOp");
        let mut dst = consumer_op("dst", &["x"]);
        dst.set_input("x", &producer).unwrap();

        // Nothing resolvable yet.
        assert!(matches!(
            dst.get_input_const_data("x"),
            Err(Error::NotFound(_))
        ));

        // Runtime inference cache.
        let cached = Tensor::with_data(
            TensorDesc::with_shape(vec![1], crate::types::Format::Nd, DataType::Float),
            &3.0f32.to_le_bytes(),
        );
        dst.cache_const_result(producer.runtime_id(), 0, cached);
        assert_eq!(
            dst.get_input_const_data("x").unwrap().data_as::<f32>().unwrap(),
            vec![3.0]
        );

        // A pre-attached literal wins over everything.
        let literal = Tensor::with_data(
            TensorDesc::with_shape(vec![1], crate::types::Format::Nd, DataType::Float),
            &9.0f32.to_le_bytes(),
        );
        dst.set_const_input("x", literal);
        assert_eq!(
            dst.get_input_const_data("x").unwrap().data_as::<f32>().unwrap(),
            vec![9.0]
        );
    }

    #[test]
    fn const_data_through_passthrough_chain() {
        let weight = const_op("w", 2.5);

        // Const → Enter → Data → consumer resolves through the chain.
        let mut enter = consumer_op("enter", &["x"]);
        enter.imp.borrow_mut().op_desc.set_op_type("Enter");
        enter.set_input("x", &weight).unwrap();

        let mut data = consumer_op("data", &["x"]);
        data.imp.borrow_mut().op_desc.set_op_type("Data");
        data.set_input("x", &enter).unwrap();

        let mut dst = consumer_op("dst", &["x"]);
        dst.set_input("x", &data).unwrap();

        let tensor = dst.get_input_const_data("x").unwrap();
        assert_eq!(tensor.data_as::<f32>().unwrap(), vec![2.5]);

        // Direct constant producers resolve too.
        let mut direct = consumer_op("direct", &["x"]);
        direct.set_input("x", &weight).unwrap();
        assert!(direct.get_input_const_data("x").is_ok());
    }

    #[test]
    fn subgraph_registration() {
        let mut op = consumer_op("if", &[]);
        op.subgraph_register("then_branch", false).unwrap();
        op.subgraph_register("bodies", true).unwrap();
        op.subgraph_count_register("bodies", 2).unwrap();

        // Registering the same slot twice fails.
        assert!(op.subgraph_register("then_branch", false).is_err());
        // Static slots reject indexed builders and vice versa.
        assert!(op
            .set_dynamic_subgraph_builder("then_branch", 0, || Ok(ComputeGraph::new("x")))
            .is_err());
        assert!(op
            .set_subgraph_builder("bodies", || Ok(ComputeGraph::new("x")))
            .is_err());

        op.set_subgraph_builder("then_branch", || Ok(ComputeGraph::new("then_g")))
            .unwrap();
        op.set_dynamic_subgraph_builder("bodies", 1, || Ok(ComputeGraph::new("body1")))
            .unwrap();

        assert!(op.subgraph_builder("then_branch").is_some());
        assert!(op.dynamic_subgraph_builder("bodies", 1).is_some());
        assert!(op.dynamic_subgraph_builder("bodies", 0).is_none());

        let keys: Vec<String> = op
            .all_subgraph_builders()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["bodies1", "then_branch"]);
    }

    #[test]
    fn break_connect_clears_links() {
        let src = single_out_op("src", "TestOp");
        let mut dst = consumer_op("dst", &["x"]);
        dst.set_input("x", &src).unwrap();
        let mut src = src;
        src.break_connect();
        dst.break_connect();
        assert!(dst.input_bindings().is_empty());
        assert!(dst.linked_ops().is_empty());
    }
}
