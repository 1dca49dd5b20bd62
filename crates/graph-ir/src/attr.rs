//! Generic named attributes attached to graph entities.

use std::collections::HashMap;

use bytes::Bytes;

use crate::protos::GraphDef;
use crate::tensor::Tensor;
use crate::tensor_desc::TensorDesc;

/// A named bundle of attributes, itself usable as an attribute value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedAttrs {
    pub name: String,
    pub attrs: AttrStore,
}

/// One attribute value: a closed set of scalar kinds, the list variant of
/// each, and list-of-list-int.
///
/// Graph-valued attributes hold the wire message itself; subgraphs carried
/// this way are opaque payloads until the model deserializer realizes them.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Bytes(Bytes),
    Tensor(Tensor),
    TensorDesc(TensorDesc),
    NamedAttrs(NamedAttrs),
    Graph(GraphDef),
    IntList(Vec<i64>),
    FloatList(Vec<f32>),
    BoolList(Vec<bool>),
    StrList(Vec<String>),
    BytesList(Vec<Bytes>),
    TensorList(Vec<Tensor>),
    TensorDescList(Vec<TensorDesc>),
    NamedAttrsList(Vec<NamedAttrs>),
    GraphList(Vec<GraphDef>),
    IntListList(Vec<Vec<i64>>),
}

/// Discriminator for [`AttrValue`] kinds, used as the codec registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum AttrKind {
    Int,
    Float,
    Bool,
    Str,
    Bytes,
    Tensor,
    TensorDesc,
    NamedAttrs,
    Graph,
    IntList,
    FloatList,
    BoolList,
    StrList,
    BytesList,
    TensorList,
    TensorDescList,
    NamedAttrsList,
    GraphList,
    IntListList,
}

impl AttrValue {
    /// The kind discriminator of this value.
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Int(_) => AttrKind::Int,
            AttrValue::Float(_) => AttrKind::Float,
            AttrValue::Bool(_) => AttrKind::Bool,
            AttrValue::Str(_) => AttrKind::Str,
            AttrValue::Bytes(_) => AttrKind::Bytes,
            AttrValue::Tensor(_) => AttrKind::Tensor,
            AttrValue::TensorDesc(_) => AttrKind::TensorDesc,
            AttrValue::NamedAttrs(_) => AttrKind::NamedAttrs,
            AttrValue::Graph(_) => AttrKind::Graph,
            AttrValue::IntList(_) => AttrKind::IntList,
            AttrValue::FloatList(_) => AttrKind::FloatList,
            AttrValue::BoolList(_) => AttrKind::BoolList,
            AttrValue::StrList(_) => AttrKind::StrList,
            AttrValue::BytesList(_) => AttrKind::BytesList,
            AttrValue::TensorList(_) => AttrKind::TensorList,
            AttrValue::TensorDescList(_) => AttrKind::TensorDescList,
            AttrValue::NamedAttrsList(_) => AttrKind::NamedAttrsList,
            AttrValue::GraphList(_) => AttrKind::GraphList,
            AttrValue::IntListList(_) => AttrKind::IntListList,
        }
    }

    pub fn into_int(self) -> i64 {
        if let AttrValue::Int(elem) = self {
            elem
        } else {
            panic!("Expected Int, got {self:?}");
        }
    }

    pub fn into_str(self) -> String {
        if let AttrValue::Str(elem) = self {
            elem
        } else {
            panic!("Expected Str, got {self:?}");
        }
    }

    pub fn into_tensor(self) -> Tensor {
        if let AttrValue::Tensor(elem) = self {
            elem
        } else {
            panic!("Expected Tensor, got {self:?}");
        }
    }

    pub fn into_int_list(self) -> Vec<i64> {
        if let AttrValue::IntList(elem) = self {
            elem
        } else {
            panic!("Expected IntList, got {self:?}");
        }
    }
}

/// Name→value attribute map with typed convenience accessors.
///
/// Lookup misses return `None`: callers probe optional attributes this way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrStore {
    map: HashMap<String, AttrValue>,
}

impl AttrStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an attribute.
    pub fn set(&mut self, name: impl Into<String>, value: AttrValue) {
        self.map.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.map.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.map.remove(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.map.iter()
    }

    /// Attribute names in sorted order, the order serialization emits.
    pub fn sorted_names(&self) -> Vec<&String> {
        let mut names: Vec<&String> = self.map.keys().collect();
        names.sort();
        names
    }

    pub fn set_int(&mut self, name: impl Into<String>, value: i64) {
        self.set(name, AttrValue::Int(value));
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn set_float(&mut self, name: impl Into<String>, value: f32) {
        self.set(name, AttrValue::Float(value));
    }

    pub fn get_float(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn set_bool(&mut self, name: impl Into<String>, value: bool) {
        self.set(name, AttrValue::Bool(value));
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn set_str(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set(name, AttrValue::Str(value.into()));
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            AttrValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn set_int_list(&mut self, name: impl Into<String>, value: Vec<i64>) {
        self.set(name, AttrValue::IntList(value));
    }

    pub fn get_int_list(&self, name: &str) -> Option<Vec<i64>> {
        match self.get(name)? {
            AttrValue::IntList(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn set_bool_list(&mut self, name: impl Into<String>, value: Vec<bool>) {
        self.set(name, AttrValue::BoolList(value));
    }

    pub fn get_bool_list(&self, name: &str) -> Option<Vec<bool>> {
        match self.get(name)? {
            AttrValue::BoolList(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn set_str_list(&mut self, name: impl Into<String>, value: Vec<String>) {
        self.set(name, AttrValue::StrList(value));
    }

    pub fn get_str_list(&self, name: &str) -> Option<Vec<String>> {
        match self.get(name)? {
            AttrValue::StrList(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn set_tensor(&mut self, name: impl Into<String>, value: Tensor) {
        self.set(name, AttrValue::Tensor(value));
    }

    pub fn get_tensor(&self, name: &str) -> Option<&Tensor> {
        match self.get(name)? {
            AttrValue::Tensor(v) => Some(v),
            _ => None,
        }
    }

    pub fn set_tensor_desc(&mut self, name: impl Into<String>, value: TensorDesc) {
        self.set(name, AttrValue::TensorDesc(value));
    }

    pub fn get_tensor_desc(&self, name: &str) -> Option<&TensorDesc> {
        match self.get(name)? {
            AttrValue::TensorDesc(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let mut attrs = AttrStore::new();
        attrs.set_int("id", 42);
        attrs.set_str("label", "conv");
        attrs.set_bool_list("mask", vec![true, false]);

        assert_eq!(attrs.get_int("id"), Some(42));
        assert_eq!(attrs.get_str("label"), Some("conv"));
        assert_eq!(attrs.get_bool_list("mask"), Some(vec![true, false]));
        // Kind mismatch and missing key both read as absent.
        assert_eq!(attrs.get_int("label"), None);
        assert_eq!(attrs.get_int("missing"), None);
    }

    #[test]
    fn set_overwrites() {
        let mut attrs = AttrStore::new();
        attrs.set_int("x", 1);
        attrs.set_int("x", 2);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get_int("x"), Some(2));
    }

    #[test]
    fn sorted_names_are_sorted() {
        let mut attrs = AttrStore::new();
        for name in ["zeta", "alpha", "mid"] {
            attrs.set_int(name, 0);
        }
        assert_eq!(attrs.sorted_names(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn kinds() {
        assert_eq!(AttrValue::Int(1).kind(), AttrKind::Int);
        assert_eq!(AttrValue::IntListList(vec![vec![1]]).kind(), AttrKind::IntListList);
        assert_eq!(AttrValue::Bytes(Bytes::new()).kind(), AttrKind::Bytes);
    }
}
