//! Tensor descriptors: shape, layout, element type and attributes.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use crate::attr::AttrStore;
use crate::attr_serializer::{deserialize_all_attrs, serialize_all_attrs};
use crate::error::Result;
use crate::protos;
use crate::shape::{Shape, ShapeSlot};
use crate::types::{ATTR_KEY_CUSTOM_DTYPE, DataType, Format};

// Reserved keys for the high-frequency scalar fields. In memory they live
// in the attribute store; on the wire they are demoted to real fields and
// never appear in the attribute list.
pub(crate) const ATTR_KEY_SIZE: &str = "size";
pub(crate) const ATTR_KEY_WEIGHT_SIZE: &str = "weight_size";
pub(crate) const ATTR_KEY_REUSE_INPUT: &str = "reuse_input";
pub(crate) const ATTR_KEY_OUTPUT_TENSOR: &str = "output_tensor";
pub(crate) const ATTR_KEY_DEVICE_TYPE: &str = "device_type";
pub(crate) const ATTR_KEY_INPUT_TENSOR: &str = "input_tensor";
pub(crate) const ATTR_KEY_REAL_DIM_CNT: &str = "real_dim_cnt";
pub(crate) const ATTR_KEY_REUSE_INPUT_INDEX: &str = "reuse_input_index";
pub(crate) const ATTR_KEY_DATA_OFFSET: &str = "data_offset";

pub(crate) const RESERVED_DESC_KEYS: &[&str] = &[
    ATTR_KEY_SIZE,
    ATTR_KEY_WEIGHT_SIZE,
    ATTR_KEY_REUSE_INPUT,
    ATTR_KEY_OUTPUT_TENSOR,
    ATTR_KEY_DEVICE_TYPE,
    ATTR_KEY_INPUT_TENSOR,
    ATTR_KEY_REAL_DIM_CNT,
    ATTR_KEY_REUSE_INPUT_INDEX,
    ATTR_KEY_DATA_OFFSET,
];

fn set_nonzero(attrs: &mut AttrStore, key: &str, value: i64) {
    if value != 0 {
        attrs.set_int(key, value);
    }
}

fn set_true(attrs: &mut AttrStore, key: &str, value: bool) {
    if value {
        attrs.set_bool(key, value);
    }
}

/// Describes one tensor: shape, origin shape, layout, element type, name
/// and a generic attribute store.
///
/// A descriptor is backed by a wire message held behind a shared handle.
/// [`TensorDesc::share`] hands out a *view* aliasing the same storage, so
/// mutation through either handle is visible to both; [`Clone`] and
/// [`TensorDesc::deep_clone`] produce an independent copy. Ancestors (an
/// op-desc IO slot, a tensor) store the shared handle, which is what makes
/// their descriptor views live.
pub struct TensorDesc {
    msg: Rc<RefCell<protos::TensorDescriptor>>,
    attrs: Rc<RefCell<AttrStore>>,
    is_view: bool,
}

impl TensorDesc {
    /// A default descriptor: layout ND, element type Float, no shape set.
    ///
    /// Such a descriptor is a placeholder; it only becomes *valid* once a
    /// shape has been assigned.
    pub fn new() -> Self {
        Self {
            msg: Rc::new(RefCell::new(protos::TensorDescriptor::new())),
            attrs: Rc::new(RefCell::new(AttrStore::new())),
            is_view: false,
        }
    }

    /// A descriptor with shape, layout and element type assigned.
    pub fn with_shape(shape: impl Into<Shape>, format: Format, dtype: DataType) -> Self {
        let mut desc = Self::new();
        desc.set_shape(shape.into());
        desc.set_format(format);
        desc.set_data_type(dtype);
        desc
    }

    /// Alias this descriptor: the returned view shares the backing message
    /// and attribute store, and mutations through it are visible here.
    pub fn share(&self) -> TensorDesc {
        TensorDesc {
            msg: Rc::clone(&self.msg),
            attrs: Rc::clone(&self.attrs),
            is_view: true,
        }
    }

    /// An independent deep copy, regardless of this handle's mode.
    pub fn deep_clone(&self) -> TensorDesc {
        TensorDesc {
            msg: Rc::new(RefCell::new(self.msg.borrow().clone())),
            attrs: Rc::new(RefCell::new(self.attrs.borrow().clone())),
            is_view: false,
        }
    }

    /// Whether this handle aliases storage owned elsewhere.
    pub fn is_view(&self) -> bool {
        self.is_view
    }

    pub fn name(&self) -> String {
        self.msg.borrow().name.clone()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.msg.borrow_mut().name = name.into();
    }

    /// The shape, as a live view: mutations through it update this
    /// descriptor (and every other view of it).
    pub fn shape(&self) -> Shape {
        Shape::view(Rc::clone(&self.msg), ShapeSlot::Shape)
    }

    /// Assign the shape. This is what marks the descriptor valid.
    pub fn set_shape(&mut self, shape: impl Into<Shape>) {
        let shape = shape.into();
        let mut msg = self.msg.borrow_mut();
        msg.shape.mut_or_insert_default().dim = shape.dims();
    }

    /// The shape as recorded before any layout transformation.
    pub fn origin_shape(&self) -> Shape {
        Shape::view(Rc::clone(&self.msg), ShapeSlot::OriginShape)
    }

    pub fn set_origin_shape(&mut self, shape: impl Into<Shape>) {
        let shape = shape.into();
        let mut msg = self.msg.borrow_mut();
        msg.origin_shape.mut_or_insert_default().dim = shape.dims();
    }

    /// Whether a shape has ever been assigned. Unset optional IO slots are
    /// distinguished from connected ones by exactly this.
    pub fn has_shape(&self) -> bool {
        self.msg.borrow().shape.is_some()
    }

    pub fn has_origin_shape(&self) -> bool {
        self.msg.borrow().origin_shape.is_some()
    }

    pub fn format(&self) -> Format {
        Format::from_wire(&self.msg.borrow().layout)
    }

    pub fn set_format(&mut self, format: Format) {
        self.msg.borrow_mut().layout = format.to_string();
    }

    pub fn origin_format(&self) -> Format {
        Format::from_wire(&self.msg.borrow().origin_layout)
    }

    pub fn set_origin_format(&mut self, format: Format) {
        self.msg.borrow_mut().origin_layout = format.to_string();
    }

    /// The element type. Descriptors carrying a custom type report
    /// [`DataType::Undefined`]; see [`TensorDesc::data_type_str`].
    pub fn data_type(&self) -> DataType {
        if self.attrs.borrow().has(ATTR_KEY_CUSTOM_DTYPE) {
            return DataType::Undefined;
        }
        DataType::from_wire(self.msg.borrow().dtype).unwrap_or(DataType::Undefined)
    }

    /// Set a standard element type, clearing any custom type record.
    pub fn set_data_type(&mut self, dtype: DataType) {
        self.msg.borrow_mut().dtype = dtype.to_wire();
        self.attrs.borrow_mut().remove(ATTR_KEY_CUSTOM_DTYPE);
    }

    /// The element type name. The custom-type attribute is authoritative;
    /// the standard enumeration is consulted otherwise.
    pub fn data_type_str(&self) -> String {
        if let Some(custom) = self.attrs.borrow().get_str(ATTR_KEY_CUSTOM_DTYPE) {
            return custom.to_string();
        }
        self.data_type().to_string()
    }

    /// Set the element type by name. Standard names resolve to the
    /// enumeration; anything else is recorded as a custom type under the
    /// reserved attribute key.
    pub fn set_data_type_str(&mut self, name: &str) {
        match name.parse::<DataType>() {
            Ok(dtype) => self.set_data_type(dtype),
            Err(_) => {
                self.msg.borrow_mut().dtype = DataType::Undefined.to_wire();
                self.attrs
                    .borrow_mut()
                    .set_str(ATTR_KEY_CUSTOM_DTYPE, name);
            }
        }
    }

    pub fn origin_data_type(&self) -> DataType {
        DataType::from_wire(self.msg.borrow().origin_dtype).unwrap_or(DataType::Undefined)
    }

    pub fn set_origin_data_type(&mut self, dtype: DataType) {
        self.msg.borrow_mut().origin_dtype = dtype.to_wire();
    }

    /// Immutable access to the attribute store.
    pub fn attrs(&self) -> Ref<'_, AttrStore> {
        self.attrs.borrow()
    }

    /// Mutable access to the attribute store.
    pub fn attrs_mut(&mut self) -> RefMut<'_, AttrStore> {
        self.attrs.borrow_mut()
    }

    // The promoted scalar accessors below keep default values *out* of the
    // attribute store, so equality and round trips are insensitive to
    // whether a field was ever touched.

    fn set_promoted_int(&mut self, key: &str, value: i64) {
        let mut attrs = self.attrs.borrow_mut();
        if value == 0 {
            attrs.remove(key);
        } else {
            attrs.set_int(key, value);
        }
    }

    fn set_promoted_bool(&mut self, key: &str, value: bool) {
        let mut attrs = self.attrs.borrow_mut();
        if value {
            attrs.set_bool(key, value);
        } else {
            attrs.remove(key);
        }
    }

    pub fn size(&self) -> i64 {
        self.attrs.borrow().get_int(ATTR_KEY_SIZE).unwrap_or(0)
    }

    pub fn set_size(&mut self, size: i64) {
        self.set_promoted_int(ATTR_KEY_SIZE, size);
    }

    pub fn weight_size(&self) -> i64 {
        self.attrs.borrow().get_int(ATTR_KEY_WEIGHT_SIZE).unwrap_or(0)
    }

    pub fn set_weight_size(&mut self, size: i64) {
        self.set_promoted_int(ATTR_KEY_WEIGHT_SIZE, size);
    }

    pub fn data_offset(&self) -> i64 {
        self.attrs.borrow().get_int(ATTR_KEY_DATA_OFFSET).unwrap_or(0)
    }

    pub fn set_data_offset(&mut self, offset: i64) {
        self.set_promoted_int(ATTR_KEY_DATA_OFFSET, offset);
    }

    pub fn reuse_input(&self) -> bool {
        self.attrs.borrow().get_bool(ATTR_KEY_REUSE_INPUT).unwrap_or(false)
    }

    pub fn set_reuse_input(&mut self, reuse: bool) {
        self.set_promoted_bool(ATTR_KEY_REUSE_INPUT, reuse);
    }

    pub fn reuse_input_index(&self) -> i64 {
        self.attrs
            .borrow()
            .get_int(ATTR_KEY_REUSE_INPUT_INDEX)
            .unwrap_or(0)
    }

    pub fn set_reuse_input_index(&mut self, index: i64) {
        self.set_promoted_int(ATTR_KEY_REUSE_INPUT_INDEX, index);
    }

    pub fn output_tensor(&self) -> bool {
        self.attrs.borrow().get_bool(ATTR_KEY_OUTPUT_TENSOR).unwrap_or(false)
    }

    pub fn set_output_tensor(&mut self, flag: bool) {
        self.set_promoted_bool(ATTR_KEY_OUTPUT_TENSOR, flag);
    }

    pub fn input_tensor(&self) -> bool {
        self.attrs.borrow().get_bool(ATTR_KEY_INPUT_TENSOR).unwrap_or(false)
    }

    pub fn set_input_tensor(&mut self, flag: bool) {
        self.set_promoted_bool(ATTR_KEY_INPUT_TENSOR, flag);
    }

    pub fn device_type(&self) -> String {
        self.attrs
            .borrow()
            .get_str(ATTR_KEY_DEVICE_TYPE)
            .unwrap_or("")
            .to_string()
    }

    pub fn set_device_type(&mut self, device: impl Into<String>) {
        let device = device.into();
        let mut attrs = self.attrs.borrow_mut();
        if device.is_empty() {
            attrs.remove(ATTR_KEY_DEVICE_TYPE);
        } else {
            attrs.set_str(ATTR_KEY_DEVICE_TYPE, device);
        }
    }

    pub fn real_dim_cnt(&self) -> i64 {
        self.attrs.borrow().get_int(ATTR_KEY_REAL_DIM_CNT).unwrap_or(0)
    }

    pub fn set_real_dim_cnt(&mut self, cnt: i64) {
        self.set_promoted_int(ATTR_KEY_REAL_DIM_CNT, cnt);
    }

    /// Build a descriptor from its wire message.
    ///
    /// The attribute list is decoded through the codec registry. Promoted
    /// scalar fields are migrated into the attribute store when the
    /// `has_out_attr` marker is present; legacy messages without the marker
    /// may instead carry those scalars as plain attribute entries, which
    /// the decode above already preserved.
    pub fn from_proto(wire: &protos::TensorDescriptor) -> Result<TensorDesc> {
        let mut attrs = deserialize_all_attrs(&wire.attr)?;

        // Default values stay out of the store, so a descriptor that never
        // touched a promoted field compares equal after a round trip.
        if wire.has_out_attr {
            set_nonzero(&mut attrs, ATTR_KEY_SIZE, wire.size);
            set_nonzero(&mut attrs, ATTR_KEY_WEIGHT_SIZE, wire.weight_size);
            set_true(&mut attrs, ATTR_KEY_REUSE_INPUT, wire.reuse_input);
            set_true(&mut attrs, ATTR_KEY_OUTPUT_TENSOR, wire.output_tensor);
            if !wire.device_type.is_empty() {
                attrs.set_str(ATTR_KEY_DEVICE_TYPE, wire.device_type.clone());
            }
            set_true(&mut attrs, ATTR_KEY_INPUT_TENSOR, wire.input_tensor);
            set_nonzero(&mut attrs, ATTR_KEY_REAL_DIM_CNT, wire.real_dim_cnt);
            set_nonzero(&mut attrs, ATTR_KEY_REUSE_INPUT_INDEX, wire.reuse_input_index);
            set_nonzero(&mut attrs, ATTR_KEY_DATA_OFFSET, wire.data_offset);
        }

        // Normalize the retained message: attributes and promoted fields
        // live in the attribute store from here on.
        let mut msg = wire.clone();
        msg.attr.clear();
        msg.has_out_attr = false;
        msg.size = 0;
        msg.weight_size = 0;
        msg.reuse_input = false;
        msg.output_tensor = false;
        msg.device_type = String::new();
        msg.input_tensor = false;
        msg.real_dim_cnt = 0;
        msg.reuse_input_index = 0;
        msg.data_offset = 0;
        if DataType::from_wire(msg.dtype).is_none() {
            log::warn!("unknown dtype {} on '{}', treating as undefined", msg.dtype, msg.name);
            msg.dtype = DataType::Undefined.to_wire();
        }

        Ok(TensorDesc {
            msg: Rc::new(RefCell::new(msg)),
            attrs: Rc::new(RefCell::new(attrs)),
            is_view: false,
        })
    }

    /// Emit the wire message: promoted attributes are demoted to scalar
    /// fields (and excluded from the attribute list), everything else is
    /// encoded through the codec registry in sorted-name order.
    pub fn to_proto(&self) -> Result<protos::TensorDescriptor> {
        let mut wire = self.msg.borrow().clone();
        let attrs = self.attrs.borrow();

        wire.has_out_attr = true;
        wire.size = attrs.get_int(ATTR_KEY_SIZE).unwrap_or(0);
        wire.weight_size = attrs.get_int(ATTR_KEY_WEIGHT_SIZE).unwrap_or(0);
        wire.reuse_input = attrs.get_bool(ATTR_KEY_REUSE_INPUT).unwrap_or(false);
        wire.output_tensor = attrs.get_bool(ATTR_KEY_OUTPUT_TENSOR).unwrap_or(false);
        wire.device_type = attrs
            .get_str(ATTR_KEY_DEVICE_TYPE)
            .unwrap_or("")
            .to_string();
        wire.input_tensor = attrs.get_bool(ATTR_KEY_INPUT_TENSOR).unwrap_or(false);
        wire.real_dim_cnt = attrs.get_int(ATTR_KEY_REAL_DIM_CNT).unwrap_or(0);
        wire.reuse_input_index = attrs.get_int(ATTR_KEY_REUSE_INPUT_INDEX).unwrap_or(0);
        wire.data_offset = attrs.get_int(ATTR_KEY_DATA_OFFSET).unwrap_or(0);

        wire.attr = serialize_all_attrs(&attrs, RESERVED_DESC_KEYS)?;
        Ok(wire)
    }
}

impl Default for TensorDesc {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloning deep-copies; use [`TensorDesc::share`] to alias instead.
impl Clone for TensorDesc {
    fn clone(&self) -> Self {
        self.deep_clone()
    }
}

/// Deep structural equality over the backing message and attributes.
impl PartialEq for TensorDesc {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.msg, &other.msg) {
            return true;
        }
        *self.msg.borrow() == *other.msg.borrow() && *self.attrs.borrow() == *other.attrs.borrow()
    }
}

impl core::fmt::Debug for TensorDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TensorDesc")
            .field("name", &self.name())
            .field("shape", &self.shape().dims())
            .field("format", &self.format())
            .field("dtype", &self.data_type_str())
            .field("attrs", &self.attrs.borrow().len())
            .finish()
    }
}
