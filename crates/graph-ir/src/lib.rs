//! Mutable computation-graph intermediate representation.
//!
//! The crate models operators, tensors and their connections as program
//! objects that can also live as views over parsed wire-format messages.
//! A graph is assembled from linked [`Operator`]s by the [`GraphBuilder`]
//! and round-tripped through the protobuf schema in [`protos`] by the
//! model serializer.

mod attr;
mod attr_serializer;
mod error;
mod graph;
mod graph_builder;
mod model_serialize;
mod op_desc;
mod operator;
mod shape;
mod tensor;
mod tensor_desc;
mod types;

/// Generated wire-format messages.
pub mod protos {
    include!(concat!(env!("OUT_DIR"), "/graph-ir-protos/mod.rs"));
    pub use self::graph_ir::*;
}

pub use attr::{AttrKind, AttrStore, AttrValue, NamedAttrs};
pub use attr_serializer::{deserialize_all_attrs, serialize_all_attrs};
pub use error::{Error, Result};
pub use graph::{ComputeGraph, GraphRef, Node, NodeRef};
pub use graph_builder::GraphBuilder;
pub use model_serialize::{Model, deserialize_graph, serialize_graph};
pub use op_desc::{
    InferDataSliceFn, InferFormatFn, InferShapeFn, OpDesc, VerifyFn, register_infer_data_slice,
    register_infer_format, register_infer_shape, register_verifier,
};
pub use operator::{Operator, OperatorKeeper, SubgraphBuilder};
pub use shape::{Shape, UNKNOWN_DIM, UNKNOWN_DIM_NUM};
pub use tensor::{Tensor, TensorData};
pub use tensor_desc::TensorDesc;
pub use types::{DataType, Format};
