//! Tensor shapes with unknown-dimension sentinels.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::protos::TensorDescriptor;

/// Sentinel for a dimension whose size is unknown.
pub const UNKNOWN_DIM: i64 = -1;

/// Sentinel encoding an unknown number of dimensions: a shape whose single
/// dimension equals this value has unknown rank.
pub const UNKNOWN_DIM_NUM: i64 = -2;

/// Which `ShapeDef` of a descriptor message a view aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShapeSlot {
    Shape,
    OriginShape,
}

#[derive(Clone)]
enum ShapeRepr {
    /// Freestanding shape owning its dimension vector.
    Owned(Vec<i64>),
    /// View aliasing the `ShapeDef` inside a descriptor message owned by an
    /// ancestor. Mutation through the view mutates the ancestor's storage.
    View(Rc<RefCell<TensorDescriptor>>, ShapeSlot),
}

/// An ordered sequence of `i64` dimension sizes.
///
/// Cloning preserves the representation: an owned shape clones its vector,
/// a view clones the handle and keeps aliasing the same message.
#[derive(Clone)]
pub struct Shape {
    repr: ShapeRepr,
}

impl Shape {
    /// Create a freestanding shape from the given dimensions.
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self {
            repr: ShapeRepr::Owned(dims.into()),
        }
    }

    /// Create a shape with no dimensions (a scalar).
    pub fn scalar() -> Self {
        Self::new(Vec::new())
    }

    pub(crate) fn view(msg: Rc<RefCell<TensorDescriptor>>, slot: ShapeSlot) -> Self {
        Self {
            repr: ShapeRepr::View(msg, slot),
        }
    }

    /// Run `f` over the current dimensions.
    pub(crate) fn with_dims<R>(&self, f: impl FnOnce(&[i64]) -> R) -> R {
        match &self.repr {
            ShapeRepr::Owned(dims) => f(dims),
            ShapeRepr::View(msg, slot) => {
                let msg = msg.borrow();
                let def = match slot {
                    ShapeSlot::Shape => msg.shape.as_ref(),
                    ShapeSlot::OriginShape => msg.origin_shape.as_ref(),
                };
                f(def.map(|d| d.dim.as_slice()).unwrap_or(&[]))
            }
        }
    }

    fn with_dims_mut<R>(&mut self, f: impl FnOnce(&mut Vec<i64>) -> R) -> R {
        match &mut self.repr {
            ShapeRepr::Owned(dims) => f(dims),
            ShapeRepr::View(msg, slot) => {
                let mut msg = msg.borrow_mut();
                let def = match slot {
                    ShapeSlot::Shape => msg.shape.mut_or_insert_default(),
                    ShapeSlot::OriginShape => msg.origin_shape.mut_or_insert_default(),
                };
                f(&mut def.dim)
            }
        }
    }

    /// The number of dimensions.
    pub fn dim_num(&self) -> usize {
        self.with_dims(|dims| dims.len())
    }

    /// The dimension at `index`, if present.
    pub fn dim(&self, index: usize) -> Option<i64> {
        self.with_dims(|dims| dims.get(index).copied())
    }

    /// A copy of all dimensions.
    pub fn dims(&self) -> Vec<i64> {
        self.with_dims(|dims| dims.to_vec())
    }

    /// Set the dimension at `index`. Out-of-range indices are rejected.
    pub fn set_dim(&mut self, index: usize, value: i64) -> Result<()> {
        self.with_dims_mut(|dims| match dims.get_mut(index) {
            Some(dim) => {
                *dim = value;
                Ok(())
            }
            None => Err(Error::InvalidParam(format!(
                "dim index {index} out of range for shape of rank {}",
                dims.len()
            ))),
        })
    }

    /// Resize to `n` dimensions, filling new slots with [`UNKNOWN_DIM`].
    pub fn set_dim_num(&mut self, n: usize) {
        self.with_dims_mut(|dims| dims.resize(n, UNKNOWN_DIM));
    }

    /// Append one dimension.
    pub fn append_dim(&mut self, value: i64) {
        self.with_dims_mut(|dims| dims.push(value));
    }

    /// Replace all dimensions.
    pub fn set_dims(&mut self, new_dims: impl Into<Vec<i64>>) {
        let new_dims = new_dims.into();
        self.with_dims_mut(|dims| *dims = new_dims);
    }

    /// Whether the rank itself is unknown (single [`UNKNOWN_DIM_NUM`] dim).
    pub fn is_unknown_dim_num(&self) -> bool {
        self.with_dims(|dims| dims == [UNKNOWN_DIM_NUM])
    }

    /// Mark the rank as unknown.
    pub fn set_unknown_dim_num(&mut self) {
        self.with_dims_mut(|dims| *dims = vec![UNKNOWN_DIM_NUM]);
    }

    /// True if any dimension is negative (unknown size or unknown rank).
    pub fn is_unknown_shape(&self) -> bool {
        self.with_dims(|dims| dims.iter().any(|&d| d < 0))
    }

    /// True if the shape has no dimensions.
    pub fn is_scalar(&self) -> bool {
        self.with_dims(|dims| dims.is_empty())
    }

    /// Total number of elements.
    ///
    /// Returns −1 when any dimension is negative (sentinels included) or
    /// when the product overflows, 0 when any dimension is exactly 0 or the
    /// shape is dimensionless.
    pub fn shape_size(&self) -> i64 {
        self.with_dims(|dims| {
            if dims.is_empty() {
                return 0;
            }
            let mut size: i64 = 1;
            let mut has_zero = false;
            for &d in dims {
                if d < 0 {
                    return -1;
                }
                if d == 0 {
                    has_zero = true;
                    continue;
                }
                size = match size.checked_mul(d) {
                    Some(s) => s,
                    None => return -1,
                };
            }
            if has_zero { 0 } else { size }
        })
    }

    /// Detach from any backing message into a freestanding shape.
    pub fn to_owned_shape(&self) -> Shape {
        Shape::new(self.dims())
    }
}

impl Default for Shape {
    fn default() -> Self {
        Self::scalar()
    }
}

/// Equality compares dimension sequences only, regardless of backing.
impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.with_dims(|a| other.with_dims(|b| a == b))
    }
}

impl Eq for Shape {}

impl core::fmt::Debug for Shape {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.with_dims(|dims| f.debug_tuple("Shape").field(&dims).finish())
    }
}

impl From<Vec<i64>> for Shape {
    fn from(dims: Vec<i64>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[i64]> for Shape {
    fn from(dims: &[i64]) -> Self {
        Shape::new(dims.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_size_product() {
        assert_eq!(Shape::new(vec![2, 3]).shape_size(), 6);
        assert_eq!(Shape::new(vec![2, 3, 4, 5]).shape_size(), 120);
    }

    #[test]
    fn shape_size_sentinels() {
        assert_eq!(Shape::new(vec![2, UNKNOWN_DIM]).shape_size(), -1);
        assert_eq!(Shape::new(vec![UNKNOWN_DIM_NUM]).shape_size(), -1);
        // Negative wins over zero, in either order.
        assert_eq!(Shape::new(vec![0, -1]).shape_size(), -1);
        assert_eq!(Shape::new(vec![-1, 0]).shape_size(), -1);
        assert_eq!(Shape::new(vec![2, 0, 4]).shape_size(), 0);
        assert_eq!(Shape::scalar().shape_size(), 0);
    }

    #[test]
    fn shape_size_overflow() {
        assert_eq!(Shape::new(vec![i64::MAX, 2]).shape_size(), -1);
        assert_eq!(Shape::new(vec![i64::MAX, 1]).shape_size(), i64::MAX);
    }

    #[test]
    fn set_dim_out_of_range() {
        let mut shape = Shape::new(vec![2, 3]);
        assert!(shape.set_dim(1, 7).is_ok());
        assert_eq!(shape.dims(), vec![2, 7]);
        assert!(matches!(
            shape.set_dim(2, 1),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn unknown_dim_num_encoding() {
        let mut shape = Shape::new(vec![2, 3]);
        assert!(!shape.is_unknown_dim_num());
        shape.set_unknown_dim_num();
        assert!(shape.is_unknown_dim_num());
        assert!(shape.is_unknown_shape());
        assert_eq!(shape.dim_num(), 1);
    }

    #[test]
    fn set_dim_num_fills_unknown() {
        let mut shape = Shape::scalar();
        shape.set_dim_num(3);
        assert_eq!(shape.dims(), vec![UNKNOWN_DIM, UNKNOWN_DIM, UNKNOWN_DIM]);
        assert!(shape.is_unknown_shape());
    }

    #[test]
    fn view_aliases_message_storage() {
        let msg = Rc::new(RefCell::new(TensorDescriptor::new()));
        let mut view = Shape::view(msg.clone(), ShapeSlot::Shape);
        assert!(view.is_scalar());

        view.set_dims(vec![4, 5]);
        // The mutation is visible in the backing message.
        assert_eq!(msg.borrow().shape.dim, vec![4, 5]);

        // A second view over the same message observes it too.
        let other = Shape::view(msg.clone(), ShapeSlot::Shape);
        assert_eq!(other.dims(), vec![4, 5]);
        assert_eq!(view, other);

        // An owned snapshot detaches.
        let mut owned = view.to_owned_shape();
        owned.append_dim(6);
        assert_eq!(msg.borrow().shape.dim, vec![4, 5]);
    }

    #[test]
    fn equality_ignores_backing() {
        let msg = Rc::new(RefCell::new(TensorDescriptor::new()));
        msg.borrow_mut().shape.mut_or_insert_default().dim = vec![2, 3];
        let view = Shape::view(msg, ShapeSlot::Shape);
        assert_eq!(view, Shape::new(vec![2, 3]));
        assert_ne!(view, Shape::new(vec![3, 2]));
    }
}
