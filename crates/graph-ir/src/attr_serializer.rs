//! Per-kind attribute codec registry.
//!
//! Every [`AttrValue`] kind maps to one serializer and one deserializer in
//! a global table. Serialization fails the whole call when a kind has no
//! codec; deserialization silently skips entries whose wire discriminator
//! says "not set" (including the untyped-list marker), and hard-fails on a
//! discriminator no codec claims.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::attr::{AttrKind, AttrStore, AttrValue, NamedAttrs};
use crate::error::{Error, Result};
use crate::protos;
use crate::protos::attr_def::list_value::ListValueType;
use crate::protos::attr_def::{ListInt, ListListInt, ListValue, Value};
use crate::tensor::Tensor;
use crate::tensor_desc::TensorDesc;

struct AttrCodec {
    serialize: fn(&AttrValue) -> Result<protos::AttrDef>,
    deserialize: fn(&protos::AttrDef) -> Result<AttrValue>,
}

static REGISTRY: OnceLock<HashMap<AttrKind, AttrCodec>> = OnceLock::new();

fn registry() -> &'static HashMap<AttrKind, AttrCodec> {
    REGISTRY.get_or_init(build_registry)
}

/// Serialize a store into wire entries, sorted by name for deterministic
/// output. Names listed in `skip` are omitted (promoted fields travel as
/// real message fields instead).
pub fn serialize_all_attrs(store: &AttrStore, skip: &[&str]) -> Result<Vec<protos::AttrEntry>> {
    let mut entries = Vec::with_capacity(store.len());
    for name in store.sorted_names() {
        if skip.contains(&name.as_str()) {
            continue;
        }
        let value = store.get(name).expect("name came from this store");
        let codec = registry().get(&value.kind()).ok_or_else(|| {
            Error::NotRegistered(format!("serializer for attribute kind {}", value.kind()))
        })?;
        let mut entry = protos::AttrEntry::new();
        entry.name = name.clone();
        entry.value = protobuf::MessageField::some((codec.serialize)(value)?);
        entries.push(entry);
    }
    Ok(entries)
}

/// Decode wire entries into a store. See the module docs for the
/// skip-versus-fail rules.
pub fn deserialize_all_attrs(entries: &[protos::AttrEntry]) -> Result<AttrStore> {
    let mut store = AttrStore::new();
    for entry in entries {
        let Some(def) = entry.value.as_ref() else {
            log::debug!("attribute '{}' has no value, skipping", entry.name);
            continue;
        };
        let Some(kind) = wire_kind(def)? else {
            log::debug!("attribute '{}' is not set, skipping", entry.name);
            continue;
        };
        let codec = registry()
            .get(&kind)
            .ok_or_else(|| Error::NotRegistered(format!("deserializer for attribute kind {kind}")))?;
        store.set(entry.name.clone(), (codec.deserialize)(def)?);
    }
    Ok(store)
}

/// Map a wire value to its kind discriminator.
///
/// `None` means the value is legitimately absent. An out-of-range list
/// discriminator is a hard error, never a skip.
fn wire_kind(def: &protos::AttrDef) -> Result<Option<AttrKind>> {
    let kind = match &def.value {
        None => return Ok(None),
        Some(Value::S(_)) => AttrKind::Str,
        Some(Value::I(_)) => AttrKind::Int,
        Some(Value::F(_)) => AttrKind::Float,
        Some(Value::B(_)) => AttrKind::Bool,
        Some(Value::Bt(_)) => AttrKind::Bytes,
        Some(Value::Td(_)) => AttrKind::TensorDesc,
        Some(Value::T(_)) => AttrKind::Tensor,
        Some(Value::G(_)) => AttrKind::Graph,
        Some(Value::Func(_)) => AttrKind::NamedAttrs,
        Some(Value::ListListInt(_)) => AttrKind::IntListList,
        Some(Value::List(list)) => match list.val_type.enum_value() {
            Ok(ListValueType::VT_LIST_NONE) => return Ok(None),
            Ok(ListValueType::VT_LIST_STRING) => AttrKind::StrList,
            Ok(ListValueType::VT_LIST_INT) => AttrKind::IntList,
            Ok(ListValueType::VT_LIST_FLOAT) => AttrKind::FloatList,
            Ok(ListValueType::VT_LIST_BOOL) => AttrKind::BoolList,
            Ok(ListValueType::VT_LIST_BYTES) => AttrKind::BytesList,
            Ok(ListValueType::VT_LIST_TENSOR_DESC) => AttrKind::TensorDescList,
            Ok(ListValueType::VT_LIST_TENSOR) => AttrKind::TensorList,
            Ok(ListValueType::VT_LIST_GRAPH) => AttrKind::GraphList,
            Ok(ListValueType::VT_LIST_NAMED_ATTRS) => AttrKind::NamedAttrsList,
            Err(raw) => {
                return Err(Error::NotRegistered(format!("list discriminator {raw}")));
            }
        },
    };
    Ok(Some(kind))
}

fn scalar_def(value: Value) -> protos::AttrDef {
    let mut def = protos::AttrDef::new();
    def.value = Some(value);
    def
}

fn list_def(fill: impl FnOnce(&mut ListValue), val_type: ListValueType) -> protos::AttrDef {
    let mut list = ListValue::new();
    fill(&mut list);
    list.val_type = val_type.into();
    scalar_def(Value::List(list))
}

fn named_attrs_to_proto(na: &NamedAttrs) -> Result<protos::NamedAttrs> {
    let mut wire = protos::NamedAttrs::new();
    wire.name = na.name.clone();
    wire.attr = serialize_all_attrs(&na.attrs, &[])?;
    Ok(wire)
}

fn named_attrs_from_proto(wire: &protos::NamedAttrs) -> Result<NamedAttrs> {
    Ok(NamedAttrs {
        name: wire.name.clone(),
        attrs: deserialize_all_attrs(&wire.attr)?,
    })
}

fn mismatch(expected: AttrKind, got: &AttrValue) -> Error {
    Error::InvalidParam(format!("codec for {expected} fed a {} value", got.kind()))
}

macro_rules! codec {
    ($map:expr, $kind:ident, $ser:expr, $de:expr) => {
        $map.insert(
            AttrKind::$kind,
            AttrCodec {
                serialize: $ser,
                deserialize: $de,
            },
        );
    };
}

fn build_registry() -> HashMap<AttrKind, AttrCodec> {
    let mut map = HashMap::new();

    codec!(map, Int, |v| match v {
        AttrValue::Int(i) => Ok(scalar_def(Value::I(*i))),
        other => Err(mismatch(AttrKind::Int, other)),
    }, |def| match &def.value {
        Some(Value::I(i)) => Ok(AttrValue::Int(*i)),
        _ => Err(Error::InvalidParam("expected int wire value".into())),
    });

    codec!(map, Float, |v| match v {
        AttrValue::Float(f) => Ok(scalar_def(Value::F(*f))),
        other => Err(mismatch(AttrKind::Float, other)),
    }, |def| match &def.value {
        Some(Value::F(f)) => Ok(AttrValue::Float(*f)),
        _ => Err(Error::InvalidParam("expected float wire value".into())),
    });

    codec!(map, Bool, |v| match v {
        AttrValue::Bool(b) => Ok(scalar_def(Value::B(*b))),
        other => Err(mismatch(AttrKind::Bool, other)),
    }, |def| match &def.value {
        Some(Value::B(b)) => Ok(AttrValue::Bool(*b)),
        _ => Err(Error::InvalidParam("expected bool wire value".into())),
    });

    codec!(map, Str, |v| match v {
        AttrValue::Str(s) => Ok(scalar_def(Value::S(s.clone()))),
        other => Err(mismatch(AttrKind::Str, other)),
    }, |def| match &def.value {
        Some(Value::S(s)) => Ok(AttrValue::Str(s.clone())),
        _ => Err(Error::InvalidParam("expected string wire value".into())),
    });

    codec!(map, Bytes, |v| match v {
        AttrValue::Bytes(b) => Ok(scalar_def(Value::Bt(b.clone()))),
        other => Err(mismatch(AttrKind::Bytes, other)),
    }, |def| match &def.value {
        Some(Value::Bt(b)) => Ok(AttrValue::Bytes(b.clone())),
        _ => Err(Error::InvalidParam("expected bytes wire value".into())),
    });

    codec!(map, Tensor, |v| match v {
        AttrValue::Tensor(t) => Ok(scalar_def(Value::T(t.to_proto()?))),
        other => Err(mismatch(AttrKind::Tensor, other)),
    }, |def| match &def.value {
        Some(Value::T(t)) => Ok(AttrValue::Tensor(Tensor::from_proto(t.clone())?)),
        _ => Err(Error::InvalidParam("expected tensor wire value".into())),
    });

    codec!(map, TensorDesc, |v| match v {
        AttrValue::TensorDesc(d) => Ok(scalar_def(Value::Td(d.to_proto()?))),
        other => Err(mismatch(AttrKind::TensorDesc, other)),
    }, |def| match &def.value {
        Some(Value::Td(d)) => Ok(AttrValue::TensorDesc(TensorDesc::from_proto(d)?)),
        _ => Err(Error::InvalidParam("expected tensor-desc wire value".into())),
    });

    codec!(map, NamedAttrs, |v| match v {
        AttrValue::NamedAttrs(na) => Ok(scalar_def(Value::Func(named_attrs_to_proto(na)?))),
        other => Err(mismatch(AttrKind::NamedAttrs, other)),
    }, |def| match &def.value {
        Some(Value::Func(na)) => Ok(AttrValue::NamedAttrs(named_attrs_from_proto(na)?)),
        _ => Err(Error::InvalidParam("expected named-attrs wire value".into())),
    });

    codec!(map, Graph, |v| match v {
        AttrValue::Graph(g) => Ok(scalar_def(Value::G(g.clone()))),
        other => Err(mismatch(AttrKind::Graph, other)),
    }, |def| match &def.value {
        Some(Value::G(g)) => Ok(AttrValue::Graph(g.clone())),
        _ => Err(Error::InvalidParam("expected graph wire value".into())),
    });

    codec!(map, IntList, |v| match v {
        AttrValue::IntList(values) => Ok(list_def(|l| l.i = values.clone(), ListValueType::VT_LIST_INT)),
        other => Err(mismatch(AttrKind::IntList, other)),
    }, |def| match &def.value {
        Some(Value::List(l)) => Ok(AttrValue::IntList(l.i.clone())),
        _ => Err(Error::InvalidParam("expected int list wire value".into())),
    });

    codec!(map, FloatList, |v| match v {
        AttrValue::FloatList(values) => Ok(list_def(|l| l.f = values.clone(), ListValueType::VT_LIST_FLOAT)),
        other => Err(mismatch(AttrKind::FloatList, other)),
    }, |def| match &def.value {
        Some(Value::List(l)) => Ok(AttrValue::FloatList(l.f.clone())),
        _ => Err(Error::InvalidParam("expected float list wire value".into())),
    });

    codec!(map, BoolList, |v| match v {
        AttrValue::BoolList(values) => Ok(list_def(|l| l.b = values.clone(), ListValueType::VT_LIST_BOOL)),
        other => Err(mismatch(AttrKind::BoolList, other)),
    }, |def| match &def.value {
        Some(Value::List(l)) => Ok(AttrValue::BoolList(l.b.clone())),
        _ => Err(Error::InvalidParam("expected bool list wire value".into())),
    });

    codec!(map, StrList, |v| match v {
        AttrValue::StrList(values) => Ok(list_def(|l| l.s = values.clone(), ListValueType::VT_LIST_STRING)),
        other => Err(mismatch(AttrKind::StrList, other)),
    }, |def| match &def.value {
        Some(Value::List(l)) => Ok(AttrValue::StrList(l.s.clone())),
        _ => Err(Error::InvalidParam("expected string list wire value".into())),
    });

    codec!(map, BytesList, |v| match v {
        AttrValue::BytesList(values) => Ok(list_def(|l| l.bt = values.clone(), ListValueType::VT_LIST_BYTES)),
        other => Err(mismatch(AttrKind::BytesList, other)),
    }, |def| match &def.value {
        Some(Value::List(l)) => Ok(AttrValue::BytesList(l.bt.clone())),
        _ => Err(Error::InvalidParam("expected bytes list wire value".into())),
    });

    codec!(map, TensorList, |v| match v {
        AttrValue::TensorList(values) => {
            let mut wire = Vec::with_capacity(values.len());
            for t in values {
                wire.push(t.to_proto()?);
            }
            Ok(list_def(|l| l.t = wire, ListValueType::VT_LIST_TENSOR))
        }
        other => Err(mismatch(AttrKind::TensorList, other)),
    }, |def| match &def.value {
        Some(Value::List(l)) => {
            let mut values = Vec::with_capacity(l.t.len());
            for t in &l.t {
                values.push(Tensor::from_proto(t.clone())?);
            }
            Ok(AttrValue::TensorList(values))
        }
        _ => Err(Error::InvalidParam("expected tensor list wire value".into())),
    });

    codec!(map, TensorDescList, |v| match v {
        AttrValue::TensorDescList(values) => {
            let mut wire = Vec::with_capacity(values.len());
            for d in values {
                wire.push(d.to_proto()?);
            }
            Ok(list_def(|l| l.td = wire, ListValueType::VT_LIST_TENSOR_DESC))
        }
        other => Err(mismatch(AttrKind::TensorDescList, other)),
    }, |def| match &def.value {
        Some(Value::List(l)) => {
            let mut values = Vec::with_capacity(l.td.len());
            for d in &l.td {
                values.push(TensorDesc::from_proto(d)?);
            }
            Ok(AttrValue::TensorDescList(values))
        }
        _ => Err(Error::InvalidParam("expected tensor-desc list wire value".into())),
    });

    codec!(map, NamedAttrsList, |v| match v {
        AttrValue::NamedAttrsList(values) => {
            let mut wire = Vec::with_capacity(values.len());
            for na in values {
                wire.push(named_attrs_to_proto(na)?);
            }
            Ok(list_def(|l| l.na = wire, ListValueType::VT_LIST_NAMED_ATTRS))
        }
        other => Err(mismatch(AttrKind::NamedAttrsList, other)),
    }, |def| match &def.value {
        Some(Value::List(l)) => {
            let mut values = Vec::with_capacity(l.na.len());
            for na in &l.na {
                values.push(named_attrs_from_proto(na)?);
            }
            Ok(AttrValue::NamedAttrsList(values))
        }
        _ => Err(Error::InvalidParam("expected named-attrs list wire value".into())),
    });

    codec!(map, GraphList, |v| match v {
        AttrValue::GraphList(values) => {
            Ok(list_def(|l| l.g = values.clone(), ListValueType::VT_LIST_GRAPH))
        }
        other => Err(mismatch(AttrKind::GraphList, other)),
    }, |def| match &def.value {
        Some(Value::List(l)) => Ok(AttrValue::GraphList(l.g.clone())),
        _ => Err(Error::InvalidParam("expected graph list wire value".into())),
    });

    codec!(map, IntListList, |v| match v {
        AttrValue::IntListList(values) => {
            let mut wire = ListListInt::new();
            for inner in values {
                let mut li = ListInt::new();
                li.i = inner.clone();
                wire.list_i.push(li);
            }
            Ok(scalar_def(Value::ListListInt(wire)))
        }
        other => Err(mismatch(AttrKind::IntListList, other)),
    }, |def| match &def.value {
        Some(Value::ListListInt(wire)) => Ok(AttrValue::IntListList(
            wire.list_i.iter().map(|li| li.i.clone()).collect(),
        )),
        _ => Err(Error::InvalidParam("expected list-list-int wire value".into())),
    });

    map
}
