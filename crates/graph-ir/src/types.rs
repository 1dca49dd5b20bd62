//! Element types and tensor layouts.

use strum::{Display, EnumString};

/// Reserved attribute key carrying a library-specific data type name.
///
/// The standard enumeration and the custom-type table are disjoint: a
/// descriptor whose wire dtype is `Undefined` but which carries this
/// attribute has a custom type, and the attribute is authoritative on read.
pub(crate) const ATTR_KEY_CUSTOM_DTYPE: &str = "_datatype";

/// Element type of tensor values.
///
/// The discriminants are the wire encoding and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[repr(i32)]
pub enum DataType {
    /// 32-bit float, the default element type.
    #[default]
    Float = 0,
    Float16 = 1,
    Int8 = 2,
    Int32 = 3,
    Uint8 = 4,
    Int16 = 6,
    Uint16 = 7,
    Uint32 = 8,
    Int64 = 9,
    Uint64 = 10,
    Double = 11,
    Bool = 12,
    String = 13,
    /// No standard type set; combined with the reserved attribute this
    /// encodes custom types.
    Undefined = 27,
}

impl DataType {
    /// Decode a wire integer. Unknown values map to `None`.
    pub fn from_wire(value: i32) -> Option<Self> {
        let dt = match value {
            0 => Self::Float,
            1 => Self::Float16,
            2 => Self::Int8,
            3 => Self::Int32,
            4 => Self::Uint8,
            6 => Self::Int16,
            7 => Self::Uint16,
            8 => Self::Uint32,
            9 => Self::Int64,
            10 => Self::Uint64,
            11 => Self::Double,
            12 => Self::Bool,
            13 => Self::String,
            27 => Self::Undefined,
            _ => return None,
        };
        Some(dt)
    }

    /// The wire integer for this type.
    pub fn to_wire(self) -> i32 {
        self as i32
    }

    /// Size in bytes of one element, when it has a fixed size.
    pub fn size(self) -> Option<usize> {
        match self {
            Self::Float => Some(core::mem::size_of::<f32>()),
            Self::Float16 => Some(core::mem::size_of::<half::f16>()),
            Self::Int8 | Self::Uint8 | Self::Bool => Some(1),
            Self::Int16 | Self::Uint16 => Some(2),
            Self::Int32 | Self::Uint32 => Some(4),
            Self::Int64 | Self::Uint64 => Some(8),
            Self::Double => Some(core::mem::size_of::<f64>()),
            Self::String | Self::Undefined => None,
        }
    }
}

/// Memory layout of a tensor.
///
/// Serialized by name into the descriptor's `layout` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
pub enum Format {
    /// Layout-agnostic n-dimensional data, the default.
    #[strum(serialize = "ND")]
    #[default]
    Nd,
    #[strum(serialize = "NCHW")]
    Nchw,
    #[strum(serialize = "NHWC")]
    Nhwc,
    #[strum(serialize = "HWCN")]
    Hwcn,
    #[strum(serialize = "CHWN")]
    Chwn,
    #[strum(serialize = "NC1HWC0")]
    Nc1hwc0,
    #[strum(serialize = "FRACTAL_Z")]
    FractalZ,
}

impl Format {
    /// Decode a wire layout string, falling back to [`Format::Nd`] for
    /// unknown names so foreign layouts do not fail the whole decode.
    pub fn from_wire(value: &str) -> Self {
        if value.is_empty() {
            return Self::Nd;
        }
        value.parse().unwrap_or_else(|_| {
            log::warn!("unknown layout '{value}', treating as ND");
            Self::Nd
        })
    }
}

/// Project dimensions between layouts.
///
/// Supports the 4-D NCHW/NHWC permutations used by layout-sensitive shape
/// inference; every other combination is an identity.
pub(crate) fn project_dims(from: Format, to: Format, dims: &[i64]) -> Vec<i64> {
    if dims.len() != 4 {
        return dims.to_vec();
    }
    match (from, to) {
        (Format::Nchw, Format::Nhwc) => vec![dims[0], dims[2], dims[3], dims[1]],
        (Format::Nhwc, Format::Nchw) => vec![dims[0], dims[3], dims[1], dims[2]],
        _ => dims.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_wire_round_trip() {
        for dt in [
            DataType::Float,
            DataType::Float16,
            DataType::Int64,
            DataType::Bool,
            DataType::Undefined,
        ] {
            assert_eq!(DataType::from_wire(dt.to_wire()), Some(dt));
        }
        assert_eq!(DataType::from_wire(9999), None);
    }

    #[test]
    fn dtype_sizes() {
        assert_eq!(DataType::Float.size(), Some(4));
        assert_eq!(DataType::Float16.size(), Some(2));
        assert_eq!(DataType::Uint64.size(), Some(8));
        assert_eq!(DataType::String.size(), None);
    }

    #[test]
    fn format_strings() {
        assert_eq!(Format::Nchw.to_string(), "NCHW");
        assert_eq!(Format::from_wire("NHWC"), Format::Nhwc);
        assert_eq!(Format::from_wire(""), Format::Nd);
        assert_eq!(Format::from_wire("BOGUS"), Format::Nd);
    }

    #[test]
    fn dim_projection() {
        assert_eq!(
            project_dims(Format::Nchw, Format::Nhwc, &[1, 3, 224, 224]),
            vec![1, 224, 224, 3]
        );
        assert_eq!(
            project_dims(Format::Nhwc, Format::Nchw, &[1, 224, 224, 3]),
            vec![1, 3, 224, 224]
        );
        // Non-4D and unrelated layouts are identities.
        assert_eq!(project_dims(Format::Nchw, Format::Nhwc, &[2, 3]), vec![2, 3]);
        assert_eq!(
            project_dims(Format::Nd, Format::Nchw, &[1, 2, 3, 4]),
            vec![1, 2, 3, 4]
        );
    }
}
