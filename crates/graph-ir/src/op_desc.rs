//! Operator descriptors: named and indexed IO slots, attributes, subgraph
//! slots and registered inference callbacks.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::attr::AttrStore;
use crate::attr_serializer::{deserialize_all_attrs, serialize_all_attrs};
use crate::error::{Error, Result};
use crate::protos;
use crate::tensor_desc::TensorDesc;
use crate::types::project_dims;

/// Attribute key holding the per-input constant bitmap.
pub(crate) const ATTR_KEY_IS_INPUT_CONST: &str = "is_input_const";

const RESERVED_OP_KEYS: &[&str] = &[ATTR_KEY_IS_INPUT_CONST, "id", "stream_id"];

/// Shape-inference callback, invoked with the descriptor presented in its
/// origin layout.
pub type InferShapeFn = fn(&mut OpDesc) -> Result<()>;
/// Format-inference callback.
pub type InferFormatFn = fn(&mut OpDesc) -> Result<()>;
/// Structural verification callback.
pub type VerifyFn = fn(&OpDesc) -> Result<()>;
/// Data-slice inference callback.
pub type InferDataSliceFn = fn(&mut OpDesc) -> Result<()>;

#[derive(Default)]
struct InferRegistry {
    shape: HashMap<String, InferShapeFn>,
    format: HashMap<String, InferFormatFn>,
    verify: HashMap<String, VerifyFn>,
    data_slice: HashMap<String, InferDataSliceFn>,
}

thread_local! {
    static INFER_REGISTRY: RefCell<InferRegistry> = RefCell::new(InferRegistry::default());
}

/// Register a shape-inference callback for an operator type.
pub fn register_infer_shape(op_type: impl Into<String>, func: InferShapeFn) {
    INFER_REGISTRY.with(|r| r.borrow_mut().shape.insert(op_type.into(), func));
}

/// Register a format-inference callback for an operator type.
pub fn register_infer_format(op_type: impl Into<String>, func: InferFormatFn) {
    INFER_REGISTRY.with(|r| r.borrow_mut().format.insert(op_type.into(), func));
}

/// Register a verification callback for an operator type.
pub fn register_verifier(op_type: impl Into<String>, func: VerifyFn) {
    INFER_REGISTRY.with(|r| r.borrow_mut().verify.insert(op_type.into(), func));
}

/// Register a data-slice inference callback for an operator type.
pub fn register_infer_data_slice(op_type: impl Into<String>, func: InferDataSliceFn) {
    INFER_REGISTRY.with(|r| r.borrow_mut().data_slice.insert(op_type.into(), func));
}

struct OpDescInner {
    name: String,
    op_type: String,
    inputs: Vec<TensorDesc>,
    input_name_idx: HashMap<String, usize>,
    optional_inputs: HashSet<String>,
    outputs: Vec<TensorDesc>,
    output_name_idx: HashMap<String, usize>,
    registered_inputs: Vec<String>,
    registered_outputs: Vec<String>,
    subgraph_ir_names: Vec<String>,
    subgraph_instance_names: Vec<String>,
    attrs: AttrStore,
    id: i64,
    stream_id: i64,
    engine_name: String,
    kernel_lib_name: String,
    infer_shape: Option<InferShapeFn>,
    infer_format: Option<InferFormatFn>,
    verify: Option<VerifyFn>,
    infer_data_slice: Option<InferDataSliceFn>,
}

impl OpDescInner {
    fn new(name: String, op_type: String) -> Self {
        Self {
            name,
            op_type,
            inputs: Vec::new(),
            input_name_idx: HashMap::new(),
            optional_inputs: HashSet::new(),
            outputs: Vec::new(),
            output_name_idx: HashMap::new(),
            registered_inputs: Vec::new(),
            registered_outputs: Vec::new(),
            subgraph_ir_names: Vec::new(),
            subgraph_instance_names: Vec::new(),
            attrs: AttrStore::new(),
            id: 0,
            stream_id: 0,
            engine_name: String::new(),
            kernel_lib_name: String::new(),
            infer_shape: None,
            infer_format: None,
            verify: None,
            infer_data_slice: None,
        }
    }
}

/// Shared handle to an operator descriptor.
///
/// `Clone` shares — the same descriptor can be held by an [`Operator`] and
/// the graph node built from it. Use [`OpDesc::deep_clone`] for an
/// independent copy.
///
/// [`Operator`]: crate::Operator
#[derive(Clone)]
pub struct OpDesc {
    inner: Rc<RefCell<OpDescInner>>,
}

impl OpDesc {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(OpDescInner::new(name.into(), op_type.into()))),
        }
    }

    /// An independent deep copy: descriptors, maps and attributes.
    pub fn deep_clone(&self) -> OpDesc {
        let inner = self.inner.borrow();
        let copy = OpDescInner {
            name: inner.name.clone(),
            op_type: inner.op_type.clone(),
            inputs: inner.inputs.iter().map(|d| d.deep_clone()).collect(),
            input_name_idx: inner.input_name_idx.clone(),
            optional_inputs: inner.optional_inputs.clone(),
            outputs: inner.outputs.iter().map(|d| d.deep_clone()).collect(),
            output_name_idx: inner.output_name_idx.clone(),
            registered_inputs: inner.registered_inputs.clone(),
            registered_outputs: inner.registered_outputs.clone(),
            subgraph_ir_names: inner.subgraph_ir_names.clone(),
            subgraph_instance_names: inner.subgraph_instance_names.clone(),
            attrs: inner.attrs.clone(),
            id: inner.id,
            stream_id: inner.stream_id,
            engine_name: inner.engine_name.clone(),
            kernel_lib_name: inner.kernel_lib_name.clone(),
            infer_shape: inner.infer_shape,
            infer_format: inner.infer_format,
            verify: inner.verify,
            infer_data_slice: inner.infer_data_slice,
        };
        OpDesc {
            inner: Rc::new(RefCell::new(copy)),
        }
    }

    pub fn same(a: &OpDesc, b: &OpDesc) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.inner.borrow_mut().name = name.into();
    }

    pub fn op_type(&self) -> String {
        self.inner.borrow().op_type.clone()
    }

    pub fn set_op_type(&mut self, op_type: impl Into<String>) {
        self.inner.borrow_mut().op_type = op_type.into();
    }

    pub fn id(&self) -> i64 {
        self.inner.borrow().id
    }

    pub fn set_id(&mut self, id: i64) {
        self.inner.borrow_mut().id = id;
    }

    pub fn stream_id(&self) -> i64 {
        self.inner.borrow().stream_id
    }

    pub fn set_stream_id(&mut self, stream_id: i64) {
        self.inner.borrow_mut().stream_id = stream_id;
    }

    pub fn engine_name(&self) -> String {
        self.inner.borrow().engine_name.clone()
    }

    pub fn set_engine_name(&mut self, name: impl Into<String>) {
        self.inner.borrow_mut().engine_name = name.into();
    }

    pub fn kernel_lib_name(&self) -> String {
        self.inner.borrow().kernel_lib_name.clone()
    }

    pub fn set_kernel_lib_name(&mut self, name: impl Into<String>) {
        self.inner.borrow_mut().kernel_lib_name = name.into();
    }

    /// Run `f` over the attribute store.
    pub fn with_attrs<R>(&self, f: impl FnOnce(&AttrStore) -> R) -> R {
        f(&self.inner.borrow().attrs)
    }

    /// Run `f` over the mutable attribute store.
    pub fn with_attrs_mut<R>(&mut self, f: impl FnOnce(&mut AttrStore) -> R) -> R {
        f(&mut self.inner.borrow_mut().attrs)
    }

    // ------------------------------------------------------------------
    // Input slots
    // ------------------------------------------------------------------

    /// Add a named input slot, or update it in place when the name already
    /// exists. Returns the slot index.
    pub fn add_input_desc(&mut self, name: impl Into<String>, desc: TensorDesc) -> Result<usize> {
        let name = name.into();
        let mut inner = self.inner.borrow_mut();
        if let Some(&idx) = inner.input_name_idx.get(&name) {
            let mut desc = desc;
            desc.set_name(name);
            inner.inputs[idx] = desc;
            return Ok(idx);
        }
        let idx = inner.inputs.len();
        let mut desc = desc;
        desc.set_name(name.clone());
        inner.inputs.push(desc);
        inner.input_name_idx.insert(name, idx);
        Ok(idx)
    }

    /// Add an anonymous input slot named `__input<N>`.
    pub fn add_input_desc_anon(&mut self, desc: TensorDesc) -> Result<usize> {
        let name = format!("__input{}", self.inner.borrow().inputs.len());
        self.add_input_desc(name, desc)
    }

    /// Insert a named input slot at `index`, shifting every mapped index at
    /// or beyond it. Inserting past the current size or reusing an existing
    /// name is rejected.
    pub fn add_input_desc_at(
        &mut self,
        index: usize,
        name: impl Into<String>,
        desc: TensorDesc,
    ) -> Result<usize> {
        let name = name.into();
        let mut inner = self.inner.borrow_mut();
        if index > inner.inputs.len() {
            return Err(Error::InvalidParam(format!(
                "insert index {index} beyond {} declared inputs",
                inner.inputs.len()
            )));
        }
        if inner.input_name_idx.contains_key(&name) {
            return Err(Error::InvalidParam(format!(
                "input '{name}' already declared"
            )));
        }
        for idx in inner.input_name_idx.values_mut() {
            if *idx >= index {
                *idx += 1;
            }
        }
        let mut desc = desc;
        desc.set_name(name.clone());
        inner.inputs.insert(index, desc);
        inner.input_name_idx.insert(name, index);
        Ok(index)
    }

    /// Add an input slot that may legitimately stay unconnected.
    pub fn add_optional_input_desc(
        &mut self,
        name: impl Into<String>,
        desc: TensorDesc,
    ) -> Result<usize> {
        let name = name.into();
        let idx = self.add_input_desc(name.clone(), desc)?;
        self.inner.borrow_mut().optional_inputs.insert(name);
        Ok(idx)
    }

    /// Replace the descriptor of an existing named input.
    pub fn update_input_desc(&mut self, name: &str, desc: TensorDesc) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let idx = *inner
            .input_name_idx
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("input '{name}'")))?;
        let mut desc = desc;
        desc.set_name(name);
        inner.inputs[idx] = desc;
        Ok(())
    }

    /// Replace the descriptor of an existing input slot by index.
    pub fn update_input_desc_at(&mut self, index: usize, desc: TensorDesc) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if index >= inner.inputs.len() {
            return Err(Error::InvalidParam(format!(
                "input index {index} out of range for {} declared inputs",
                inner.inputs.len()
            )));
        }
        let name = inner.inputs[index].name();
        let mut desc = desc;
        desc.set_name(name);
        inner.inputs[index] = desc;
        Ok(())
    }

    /// Number of *valid* inputs: slots whose shape has been assigned.
    /// Unset optional slots do not count.
    pub fn inputs_size(&self) -> usize {
        self.inner
            .borrow()
            .inputs
            .iter()
            .filter(|d| d.has_shape())
            .count()
    }

    /// Number of declared input slots, unset optional slots included.
    pub fn all_inputs_size(&self) -> usize {
        self.inner.borrow().inputs.len()
    }

    /// A deep copy of the input descriptor at `index`.
    pub fn input_desc(&self, index: usize) -> Option<TensorDesc> {
        self.inner.borrow().inputs.get(index).map(|d| d.deep_clone())
    }

    /// A live view of the input descriptor at `index`; mutations through it
    /// update this slot.
    pub fn input_desc_shared(&self, index: usize) -> Option<TensorDesc> {
        self.inner.borrow().inputs.get(index).map(|d| d.share())
    }

    pub fn input_desc_by_name(&self, name: &str) -> Option<TensorDesc> {
        let inner = self.inner.borrow();
        let idx = *inner.input_name_idx.get(name)?;
        inner.inputs.get(idx).map(|d| d.deep_clone())
    }

    pub fn input_desc_shared_by_name(&self, name: &str) -> Option<TensorDesc> {
        let inner = self.inner.borrow();
        let idx = *inner.input_name_idx.get(name)?;
        inner.inputs.get(idx).map(|d| d.share())
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inner.borrow().input_name_idx.get(name).copied()
    }

    /// Input slot names in index order.
    pub fn input_names(&self) -> Vec<String> {
        self.inner.borrow().inputs.iter().map(|d| d.name()).collect()
    }

    pub fn is_optional_input(&self, name: &str) -> bool {
        self.inner.borrow().optional_inputs.contains(name)
    }

    pub fn optional_input_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.borrow().optional_inputs.iter().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Output slots
    // ------------------------------------------------------------------

    /// Add a named output slot, or update it when the name exists.
    pub fn add_output_desc(&mut self, name: impl Into<String>, desc: TensorDesc) -> Result<usize> {
        let name = name.into();
        let mut inner = self.inner.borrow_mut();
        if let Some(&idx) = inner.output_name_idx.get(&name) {
            let mut desc = desc;
            desc.set_name(name);
            inner.outputs[idx] = desc;
            return Ok(idx);
        }
        let idx = inner.outputs.len();
        let mut desc = desc;
        desc.set_name(name.clone());
        inner.outputs.push(desc);
        inner.output_name_idx.insert(name, idx);
        Ok(idx)
    }

    /// Add an anonymous output slot named `__output<N>`.
    pub fn add_output_desc_anon(&mut self, desc: TensorDesc) -> Result<usize> {
        let name = format!("__output{}", self.inner.borrow().outputs.len());
        self.add_output_desc(name, desc)
    }

    /// Replace the descriptor of an existing named output.
    pub fn update_output_desc(&mut self, name: &str, desc: TensorDesc) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let idx = *inner
            .output_name_idx
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("output '{name}'")))?;
        let mut desc = desc;
        desc.set_name(name);
        inner.outputs[idx] = desc;
        Ok(())
    }

    /// Replace the descriptor of an existing output slot by index.
    pub fn update_output_desc_at(&mut self, index: usize, desc: TensorDesc) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if index >= inner.outputs.len() {
            return Err(Error::InvalidParam(format!(
                "output index {index} out of range for {} declared outputs",
                inner.outputs.len()
            )));
        }
        let name = inner.outputs[index].name();
        let mut desc = desc;
        desc.set_name(name);
        inner.outputs[index] = desc;
        Ok(())
    }

    pub fn outputs_size(&self) -> usize {
        self.inner.borrow().outputs.len()
    }

    pub fn output_desc(&self, index: usize) -> Option<TensorDesc> {
        self.inner.borrow().outputs.get(index).map(|d| d.deep_clone())
    }

    pub fn output_desc_shared(&self, index: usize) -> Option<TensorDesc> {
        self.inner.borrow().outputs.get(index).map(|d| d.share())
    }

    pub fn output_desc_by_name(&self, name: &str) -> Option<TensorDesc> {
        let inner = self.inner.borrow();
        let idx = *inner.output_name_idx.get(name)?;
        inner.outputs.get(idx).map(|d| d.deep_clone())
    }

    pub fn output_desc_shared_by_name(&self, name: &str) -> Option<TensorDesc> {
        let inner = self.inner.borrow();
        let idx = *inner.output_name_idx.get(name)?;
        inner.outputs.get(idx).map(|d| d.share())
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.inner.borrow().output_name_idx.get(name).copied()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.inner.borrow().outputs.iter().map(|d| d.name()).collect()
    }

    // ------------------------------------------------------------------
    // Dynamic (repeated) ports
    // ------------------------------------------------------------------

    /// Append `num` numbered input slots `name0..name<num-1>`.
    pub fn add_dynamic_input_desc(&mut self, name: &str, num: usize) -> Result<()> {
        self.inner.borrow_mut().registered_inputs.push(name.to_string());
        for i in 0..num {
            self.add_input_desc(format!("{name}{i}"), TensorDesc::new())?;
        }
        Ok(())
    }

    /// Prepend `num` numbered input slots, shifting every existing index.
    pub fn add_dynamic_input_desc_forward(&mut self, name: &str, num: usize) -> Result<()> {
        self.inner.borrow_mut().registered_inputs.push(name.to_string());
        for i in 0..num {
            self.add_input_desc_at(i, format!("{name}{i}"), TensorDesc::new())?;
        }
        Ok(())
    }

    /// Splice `num` numbered input slots at `index`, shifting indices at or
    /// beyond the insertion point.
    pub fn add_dynamic_input_desc_by_index(
        &mut self,
        name: &str,
        num: usize,
        index: usize,
    ) -> Result<()> {
        self.inner.borrow_mut().registered_inputs.push(name.to_string());
        for i in 0..num {
            self.add_input_desc_at(index + i, format!("{name}{i}"), TensorDesc::new())?;
        }
        Ok(())
    }

    /// Append `num` numbered output slots `name0..name<num-1>`.
    pub fn add_dynamic_output_desc(&mut self, name: &str, num: usize) -> Result<()> {
        self.inner.borrow_mut().registered_outputs.push(name.to_string());
        for i in 0..num {
            self.add_output_desc(format!("{name}{i}"), TensorDesc::new())?;
        }
        Ok(())
    }

    /// Registered dynamic-input template names.
    pub fn registered_inputs(&self) -> Vec<String> {
        self.inner.borrow().registered_inputs.clone()
    }

    /// Registered dynamic-output template names.
    pub fn registered_outputs(&self) -> Vec<String> {
        self.inner.borrow().registered_outputs.clone()
    }

    // ------------------------------------------------------------------
    // Constant-input bitmap
    // ------------------------------------------------------------------

    /// Per-input flags marking inputs produced by constant operators.
    pub fn is_input_const(&self) -> Vec<bool> {
        self.inner
            .borrow()
            .attrs
            .get_bool_list(ATTR_KEY_IS_INPUT_CONST)
            .unwrap_or_default()
    }

    pub fn set_is_input_const(&mut self, flags: Vec<bool>) {
        self.inner
            .borrow_mut()
            .attrs
            .set_bool_list(ATTR_KEY_IS_INPUT_CONST, flags);
    }

    /// Record whether the input at `index` is constant, growing the bitmap
    /// as needed.
    pub fn set_input_const_at(&mut self, index: usize, is_const: bool) {
        let mut flags = self.is_input_const();
        if flags.len() <= index {
            flags.resize(index + 1, false);
        }
        flags[index] = is_const;
        self.set_is_input_const(flags);
    }

    // ------------------------------------------------------------------
    // Subgraph slots
    // ------------------------------------------------------------------

    /// Register an IR-level subgraph slot name. Returns its slot index.
    pub fn add_subgraph_name(&mut self, name: impl Into<String>) -> Result<usize> {
        let name = name.into();
        let mut inner = self.inner.borrow_mut();
        if inner.subgraph_ir_names.contains(&name) {
            return Err(Error::InvalidParam(format!(
                "subgraph slot '{name}' already registered"
            )));
        }
        inner.subgraph_ir_names.push(name);
        Ok(inner.subgraph_ir_names.len() - 1)
    }

    pub fn subgraph_index(&self, name: &str) -> Option<usize> {
        self.inner
            .borrow()
            .subgraph_ir_names
            .iter()
            .position(|n| n == name)
    }

    pub fn subgraph_ir_names(&self) -> Vec<String> {
        self.inner.borrow().subgraph_ir_names.clone()
    }

    /// Append a subgraph instance name (the graph actually attached).
    pub fn add_subgraph_instance_name(&mut self, name: impl Into<String>) {
        self.inner.borrow_mut().subgraph_instance_names.push(name.into());
    }

    /// Set the instance name for an existing slot.
    pub fn set_subgraph_instance_name(&mut self, index: usize, name: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if index >= inner.subgraph_instance_names.len() {
            return Err(Error::InvalidParam(format!(
                "subgraph slot {index} out of range for {} instances",
                inner.subgraph_instance_names.len()
            )));
        }
        inner.subgraph_instance_names[index] = name.into();
        Ok(())
    }

    pub fn subgraph_instance_names(&self) -> Vec<String> {
        self.inner.borrow().subgraph_instance_names.clone()
    }

    // ------------------------------------------------------------------
    // Inference callbacks
    // ------------------------------------------------------------------

    pub fn set_infer_shape_func(&mut self, func: InferShapeFn) {
        self.inner.borrow_mut().infer_shape = Some(func);
    }

    /// Invoke the shape-inference callback for this operator type.
    ///
    /// Around the call, every IO descriptor is presented in its origin
    /// layout: shapes are projected from the runtime layout, the callback
    /// runs, its output shapes are recorded as origin shapes and projected
    /// back to the captured runtime layout.
    ///
    /// [`Error::NotRegistered`] means no callback exists for the type;
    /// any other error came from the callback itself.
    pub fn call_infer_func(&mut self) -> Result<()> {
        let func = self.lookup_infer_shape()?;

        // Capture runtime layouts, then present the origin view.
        let inputs: Vec<TensorDesc> = {
            let inner = self.inner.borrow();
            inner.inputs.iter().map(|d| d.share()).collect()
        };
        let outputs: Vec<TensorDesc> = {
            let inner = self.inner.borrow();
            inner.outputs.iter().map(|d| d.share()).collect()
        };

        let captured_in: Vec<_> = inputs.iter().map(|d| d.format()).collect();
        let captured_out: Vec<_> = outputs.iter().map(|d| d.format()).collect();

        for desc in &inputs {
            let mut desc = desc.share();
            let origin = desc.origin_format();
            let runtime = desc.format();
            if origin != runtime {
                let projected = project_dims(runtime, origin, &desc.shape().dims());
                desc.set_shape(projected);
                desc.set_format(origin);
            }
        }
        for desc in &outputs {
            let mut desc = desc.share();
            let origin = desc.origin_format();
            desc.set_format(origin);
        }

        let result = func(self);

        // Record the callback's results as origin shapes and project back
        // to the captured runtime layouts, restoring formats either way.
        for (desc, &runtime) in outputs.iter().zip(&captured_out) {
            let mut desc = desc.share();
            if result.is_ok() && desc.has_shape() {
                let origin = desc.format();
                let produced = desc.shape().dims();
                desc.set_origin_shape(produced.clone());
                desc.set_origin_format(origin);
                desc.set_shape(project_dims(origin, runtime, &produced));
            }
            desc.set_format(runtime);
        }
        for (desc, &runtime) in inputs.iter().zip(&captured_in) {
            let mut desc = desc.share();
            let origin = desc.origin_format();
            if origin != runtime {
                let dims = desc.shape().dims();
                desc.set_shape(project_dims(origin, runtime, &dims));
            }
            desc.set_format(runtime);
        }

        result
    }

    fn lookup_infer_shape(&self) -> Result<InferShapeFn> {
        if let Some(func) = self.inner.borrow().infer_shape {
            return Ok(func);
        }
        let op_type = self.op_type();
        let func = INFER_REGISTRY
            .with(|r| r.borrow().shape.get(&op_type).copied())
            .ok_or_else(|| Error::NotRegistered(format!("infer-shape for type '{op_type}'")))?;
        self.inner.borrow_mut().infer_shape = Some(func);
        Ok(func)
    }

    pub fn set_infer_format_func(&mut self, func: InferFormatFn) {
        self.inner.borrow_mut().infer_format = Some(func);
    }

    /// Invoke the format-inference callback for this operator type.
    pub fn call_infer_format_func(&mut self) -> Result<()> {
        let cached = self.inner.borrow().infer_format;
        let func = match cached {
            Some(func) => func,
            None => {
                let op_type = self.op_type();
                let func = INFER_REGISTRY
                    .with(|r| r.borrow().format.get(&op_type).copied())
                    .ok_or_else(|| {
                        Error::NotRegistered(format!("infer-format for type '{op_type}'"))
                    })?;
                self.inner.borrow_mut().infer_format = Some(func);
                func
            }
        };
        func(self)
    }

    pub fn set_verify_func(&mut self, func: VerifyFn) {
        self.inner.borrow_mut().verify = Some(func);
    }

    /// Invoke the verification callback for this operator type.
    pub fn call_verify_func(&mut self) -> Result<()> {
        let cached = self.inner.borrow().verify;
        let func = match cached {
            Some(func) => func,
            None => {
                let op_type = self.op_type();
                let func = INFER_REGISTRY
                    .with(|r| r.borrow().verify.get(&op_type).copied())
                    .ok_or_else(|| Error::NotRegistered(format!("verifier for type '{op_type}'")))?;
                self.inner.borrow_mut().verify = Some(func);
                func
            }
        };
        func(self)
    }

    pub fn set_infer_data_slice_func(&mut self, func: InferDataSliceFn) {
        self.inner.borrow_mut().infer_data_slice = Some(func);
    }

    /// Invoke the data-slice inference callback for this operator type.
    pub fn call_infer_data_slice(&mut self) -> Result<()> {
        let cached = self.inner.borrow().infer_data_slice;
        let func = match cached {
            Some(func) => func,
            None => {
                let op_type = self.op_type();
                let func = INFER_REGISTRY
                    .with(|r| r.borrow().data_slice.get(&op_type).copied())
                    .ok_or_else(|| {
                        Error::NotRegistered(format!("infer-data-slice for type '{op_type}'"))
                    })?;
                self.inner.borrow_mut().infer_data_slice = Some(func);
                func
            }
        };
        func(self)
    }

    // ------------------------------------------------------------------
    // Wire format
    // ------------------------------------------------------------------

    /// Emit the wire message. Edge reference strings are the graph
    /// serializer's business and stay empty here.
    pub fn to_proto(&self) -> Result<protos::OpDef> {
        let inner = self.inner.borrow();
        let mut wire = protos::OpDef::new();
        wire.name = inner.name.clone();
        wire.type_ = inner.op_type.clone();
        wire.has_out_attr = true;
        wire.id = inner.id;
        wire.stream_id = inner.stream_id;
        wire.is_input_const = inner
            .attrs
            .get_bool_list(ATTR_KEY_IS_INPUT_CONST)
            .unwrap_or_default();
        for desc in &inner.inputs {
            wire.input_desc.push(desc.to_proto()?);
        }
        for desc in &inner.outputs {
            wire.output_desc.push(desc.to_proto()?);
        }
        let mut optional: Vec<String> = inner.optional_inputs.iter().cloned().collect();
        optional.sort();
        wire.optional_input = optional;
        wire.subgraph_name = inner.subgraph_instance_names.clone();
        wire.subgraph_ir_name = inner.subgraph_ir_names.clone();
        wire.attr = serialize_all_attrs(&inner.attrs, RESERVED_OP_KEYS)?;
        Ok(wire)
    }

    /// Build a descriptor from its wire message, rebuilding the name→index
    /// maps from the per-slot descriptor names.
    ///
    /// Legacy messages without the `has_out_attr` marker carry id and
    /// stream id as attribute entries; the one-time migration moves them
    /// into their fields.
    pub fn from_proto(wire: &protos::OpDef) -> Result<OpDesc> {
        let mut attrs = deserialize_all_attrs(&wire.attr)?;

        let (id, stream_id) = if wire.has_out_attr {
            (wire.id, wire.stream_id)
        } else {
            let id = attrs.get_int("id").unwrap_or(0);
            let stream_id = attrs.get_int("stream_id").unwrap_or(0);
            attrs.remove("id");
            attrs.remove("stream_id");
            log::debug!("migrated legacy scalar fields of op '{}'", wire.name);
            (id, stream_id)
        };

        if !wire.is_input_const.is_empty() {
            attrs.set_bool_list(ATTR_KEY_IS_INPUT_CONST, wire.is_input_const.clone());
        }

        let mut inner = OpDescInner::new(wire.name.clone(), wire.type_.clone());
        inner.id = id;
        inner.stream_id = stream_id;
        inner.attrs = attrs;
        inner.optional_inputs = wire.optional_input.iter().cloned().collect();
        inner.subgraph_instance_names = wire.subgraph_name.clone();
        inner.subgraph_ir_names = wire.subgraph_ir_name.clone();

        for (idx, desc) in wire.input_desc.iter().enumerate() {
            let desc = TensorDesc::from_proto(desc)?;
            inner.input_name_idx.insert(desc.name(), idx);
            inner.inputs.push(desc);
        }
        for (idx, desc) in wire.output_desc.iter().enumerate() {
            let desc = TensorDesc::from_proto(desc)?;
            inner.output_name_idx.insert(desc.name(), idx);
            inner.outputs.push(desc);
        }

        Ok(OpDesc {
            inner: Rc::new(RefCell::new(inner)),
        })
    }
}

/// Deep structural equality: scalar fields, name→index maps, the optional
/// set, subgraph slots, attributes and element-wise descriptor equality.
/// Runtime-only registration state (callbacks, engine names, dynamic-port
/// templates) is not part of it.
impl PartialEq for OpDesc {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        let a = self.inner.borrow();
        let b = other.inner.borrow();
        a.name == b.name
            && a.op_type == b.op_type
            && a.id == b.id
            && a.stream_id == b.stream_id
            && a.input_name_idx == b.input_name_idx
            && a.output_name_idx == b.output_name_idx
            && a.optional_inputs == b.optional_inputs
            && a.subgraph_ir_names == b.subgraph_ir_names
            && a.subgraph_instance_names == b.subgraph_instance_names
            && a.attrs == b.attrs
            && a.inputs == b.inputs
            && a.outputs == b.outputs
    }
}

impl core::fmt::Debug for OpDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("OpDesc")
            .field("name", &inner.name)
            .field("type", &inner.op_type)
            .field("inputs", &inner.inputs.len())
            .field("outputs", &inner.outputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;
    use crate::types::{DataType, Format};

    fn desc_with_shape(dims: Vec<i64>) -> TensorDesc {
        TensorDesc::with_shape(dims, Format::Nd, DataType::Float)
    }

    fn assert_index_map_invariant(op: &OpDesc) {
        let names = op.input_names();
        let mut seen = vec![false; names.len()];
        for (idx, name) in names.iter().enumerate() {
            assert_eq!(op.input_index(name), Some(idx), "map out of step for '{name}'");
            seen[idx] = true;
        }
        assert!(seen.iter().all(|s| *s), "indices are not a permutation");
    }

    #[test]
    fn add_same_name_updates_not_appends() {
        let mut op = OpDesc::new("n", "TestOp");
        op.add_input_desc("x", desc_with_shape(vec![1])).unwrap();
        op.add_input_desc("x", desc_with_shape(vec![2, 2])).unwrap();
        assert_eq!(op.all_inputs_size(), 1);
        assert_eq!(op.input_desc_by_name("x").unwrap().shape().dims(), vec![2, 2]);
    }

    #[test]
    fn anonymous_slots_get_numbered_names() {
        let mut op = OpDesc::new("n", "TestOp");
        op.add_input_desc_anon(desc_with_shape(vec![1])).unwrap();
        op.add_input_desc_anon(desc_with_shape(vec![1])).unwrap();
        op.add_output_desc_anon(desc_with_shape(vec![1])).unwrap();
        assert_eq!(op.input_names(), vec!["__input0", "__input1"]);
        assert_eq!(op.output_names(), vec!["__output0"]);
    }

    #[test]
    fn insert_at_index_shifts_map() {
        let mut op = OpDesc::new("n", "TestOp");
        op.add_input_desc("a", desc_with_shape(vec![1])).unwrap();
        op.add_input_desc("b", desc_with_shape(vec![1])).unwrap();
        op.add_input_desc_at(1, "mid", desc_with_shape(vec![1])).unwrap();

        assert_eq!(op.input_names(), vec!["a", "mid", "b"]);
        assert_index_map_invariant(&op);

        // Beyond the current size is rejected.
        assert!(op.add_input_desc_at(9, "z", TensorDesc::new()).is_err());
        // Reusing a name is rejected.
        assert!(op.add_input_desc_at(0, "a", TensorDesc::new()).is_err());
    }

    #[test]
    fn optional_inputs_and_size_split() {
        let mut op = OpDesc::new("n", "TestOp");
        op.add_input_desc("x", desc_with_shape(vec![2])).unwrap();
        op.add_optional_input_desc("bias", TensorDesc::new()).unwrap();

        assert_eq!(op.all_inputs_size(), 2);
        assert_eq!(op.inputs_size(), 1);
        assert!(op.is_optional_input("bias"));
        assert!(op.inputs_size() <= op.all_inputs_size());

        // Connecting the optional input closes the gap.
        op.update_input_desc("bias", desc_with_shape(vec![2])).unwrap();
        assert_eq!(op.inputs_size(), 2);
        assert_eq!(op.inputs_size(), op.all_inputs_size());
    }

    #[test]
    fn update_unknown_fails() {
        let mut op = OpDesc::new("n", "TestOp");
        assert!(matches!(
            op.update_input_desc("ghost", TensorDesc::new()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            op.update_output_desc_at(0, TensorDesc::new()),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn dynamic_ports_three_policies() {
        let mut op = OpDesc::new("n", "TestOp");
        op.add_input_desc("base", desc_with_shape(vec![1])).unwrap();
        op.add_dynamic_input_desc("app", 2).unwrap();
        assert_eq!(op.input_names(), vec!["base", "app0", "app1"]);

        op.add_dynamic_input_desc_forward("front", 2).unwrap();
        assert_eq!(op.input_names(), vec!["front0", "front1", "base", "app0", "app1"]);
        assert_index_map_invariant(&op);

        op.add_dynamic_input_desc_by_index("mid", 2, 2).unwrap();
        assert_eq!(
            op.input_names(),
            vec!["front0", "front1", "mid0", "mid1", "base", "app0", "app1"]
        );
        assert_index_map_invariant(&op);
    }

    #[test]
    fn const_bitmap_grows() {
        let mut op = OpDesc::new("n", "TestOp");
        op.set_input_const_at(2, true);
        assert_eq!(op.is_input_const(), vec![false, false, true]);
        op.set_input_const_at(0, true);
        assert_eq!(op.is_input_const(), vec![true, false, true]);
    }

    #[test]
    fn shared_desc_views_alias_slots() {
        let mut op = OpDesc::new("n", "TestOp");
        op.add_output_desc("y", desc_with_shape(vec![1])).unwrap();
        let mut view = op.output_desc_shared_by_name("y").unwrap();
        view.set_shape(Shape::new(vec![3, 3]));
        assert_eq!(op.output_desc_by_name("y").unwrap().shape().dims(), vec![3, 3]);

        // Deep copies do not alias.
        let mut copy = op.output_desc_by_name("y").unwrap();
        copy.set_shape(Shape::new(vec![9]));
        assert_eq!(op.output_desc_by_name("y").unwrap().shape().dims(), vec![3, 3]);
    }

    fn double_first_dim(op: &mut OpDesc) -> Result<()> {
        let input = op
            .input_desc(0)
            .ok_or_else(|| Error::InvalidParam("no input".into()))?;
        let mut dims = input.shape().dims();
        dims[0] *= 2;
        let mut out = op
            .output_desc_shared(0)
            .ok_or_else(|| Error::InvalidParam("no output".into()))?;
        out.set_shape(dims);
        Ok(())
    }

    #[test]
    fn infer_func_registry_and_cache() {
        register_infer_shape("DoubleOp", double_first_dim);

        let mut op = OpDesc::new("n", "DoubleOp");
        op.add_input_desc("x", desc_with_shape(vec![4, 1])).unwrap();
        op.add_output_desc("y", TensorDesc::new()).unwrap();
        op.call_infer_func().unwrap();
        assert_eq!(op.output_desc(0).unwrap().shape().dims(), vec![8, 1]);

        // Unregistered types are distinguished from failing callbacks.
        let mut other = OpDesc::new("n2", "NoSuchOp");
        assert!(matches!(other.call_infer_func(), Err(Error::NotRegistered(_))));
        assert!(matches!(other.call_infer_format_func(), Err(Error::NotRegistered(_))));
        assert!(matches!(other.call_infer_data_slice(), Err(Error::NotRegistered(_))));
    }

    #[test]
    fn infer_func_projects_layouts() {
        register_infer_shape("CopyOp", |op| {
            let dims = op.input_desc(0).unwrap().shape().dims();
            let mut out = op.output_desc_shared(0).unwrap();
            out.set_shape(dims);
            Ok(())
        });

        // Input lives in NHWC at runtime but originated as NCHW.
        let mut input = TensorDesc::with_shape(vec![1, 224, 224, 3], Format::Nhwc, DataType::Float);
        input.set_origin_format(Format::Nchw);
        input.set_origin_shape(vec![1, 3, 224, 224]);

        let mut output = TensorDesc::new();
        output.set_format(Format::Nhwc);
        output.set_origin_format(Format::Nchw);

        let mut op = OpDesc::new("n", "CopyOp");
        op.add_input_desc("x", input).unwrap();
        op.add_output_desc("y", output).unwrap();
        op.call_infer_func().unwrap();

        let out = op.output_desc(0).unwrap();
        // The callback saw (and produced) the origin layout; the runtime
        // view was projected back to NHWC.
        assert_eq!(out.origin_shape().dims(), vec![1, 3, 224, 224]);
        assert_eq!(out.origin_format(), Format::Nchw);
        assert_eq!(out.shape().dims(), vec![1, 224, 224, 3]);
        assert_eq!(out.format(), Format::Nhwc);
        // The input's runtime view is restored.
        let input = op.input_desc(0).unwrap();
        assert_eq!(input.format(), Format::Nhwc);
        assert_eq!(input.shape().dims(), vec![1, 224, 224, 3]);
    }

    #[test]
    fn structural_equality() {
        let build = || {
            let mut op = OpDesc::new("n", "TestOp");
            op.add_input_desc("x", desc_with_shape(vec![2])).unwrap();
            op.add_optional_input_desc("b", TensorDesc::new()).unwrap();
            op.add_output_desc("y", desc_with_shape(vec![2])).unwrap();
            op.with_attrs_mut(|a| a.set_int("axis", 1));
            op
        };
        let a = build();
        let b = build();
        assert_eq!(a, b);

        let mut c = build();
        c.with_attrs_mut(|attrs| attrs.set_int("axis", 2));
        assert_ne!(a, c);

        let mut d = build();
        d.update_input_desc("x", desc_with_shape(vec![3])).unwrap();
        assert_ne!(a, d);
    }

    #[test]
    fn proto_round_trip() {
        let mut op = OpDesc::new("conv1", "Conv");
        op.set_id(7);
        op.set_stream_id(1);
        op.add_input_desc("x", desc_with_shape(vec![1, 3, 8, 8])).unwrap();
        op.add_optional_input_desc("bias", TensorDesc::new()).unwrap();
        op.add_output_desc("y", desc_with_shape(vec![1, 3, 8, 8])).unwrap();
        op.set_input_const_at(0, true);
        op.add_subgraph_name("body").unwrap();
        op.add_subgraph_instance_name("conv1_body");
        op.with_attrs_mut(|a| a.set_int_list("strides", vec![1, 1]));

        let wire = op.to_proto().unwrap();
        assert!(wire.has_out_attr);
        assert_eq!(wire.id, 7);
        assert_eq!(wire.is_input_const, vec![true]);
        // Promoted entries stay out of the wire attribute list.
        assert!(wire.attr.iter().all(|e| e.name != ATTR_KEY_IS_INPUT_CONST));

        let back = OpDesc::from_proto(&wire).unwrap();
        assert_eq!(back, op);
        assert_eq!(back.input_index("bias"), Some(1));
        assert_eq!(back.optional_input_names(), vec!["bias"]);
        assert_eq!(back.subgraph_instance_names(), vec!["conv1_body"]);
    }

    #[test]
    fn legacy_op_migration() {
        let mut op = OpDesc::new("old", "Legacy");
        op.set_id(11);
        op.set_stream_id(3);
        let mut wire = op.to_proto().unwrap();

        // Rewrite as a legacy message: scalars as attrs, no marker.
        wire.has_out_attr = false;
        wire.id = 0;
        wire.stream_id = 0;
        let mut store = AttrStore::new();
        store.set_int("id", 11);
        store.set_int("stream_id", 3);
        wire.attr = serialize_all_attrs(&store, &[]).unwrap();

        let back = OpDesc::from_proto(&wire).unwrap();
        assert_eq!(back.id(), 11);
        assert_eq!(back.stream_id(), 3);
        // The migration is one-time: the scalars are fields again, not attrs.
        assert!(!back.with_attrs(|a| a.has("id")));
        assert_eq!(back, op);
    }
}
