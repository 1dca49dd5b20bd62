//! Tensor byte storage and the tensor handle.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protos;
use crate::tensor_desc::TensorDesc;

/// Upper bound for one bulk copy; larger payloads are copied in bounded
/// chunks.
const MAX_COPY_CHUNK: usize = 0x7fff_ffff;

enum Buffer {
    /// Heap buffer owned by this tensor.
    Owned(Vec<u8>),
    /// Adopted caller-owned bytes, released through the owner's `Drop`.
    Shared(Bytes),
    /// View over a wire message's payload. Reads go through the message on
    /// every access, so a replaced payload is picked up without any
    /// pointer re-synchronization step.
    MsgView(Rc<RefCell<protos::TensorDef>>),
}

/// A byte buffer with shared ownership.
///
/// Cloning a `TensorData` aliases the same buffer; [`TensorData::deep_clone`]
/// copies it. A zero-length buffer is always a well-defined empty slice,
/// never a dangling allocation.
#[derive(Clone)]
pub struct TensorData {
    inner: Rc<RefCell<Buffer>>,
}

impl TensorData {
    /// An empty buffer.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Buffer::Owned(Vec::new()))),
        }
    }

    pub(crate) fn from_msg(msg: Rc<RefCell<protos::TensorDef>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Buffer::MsgView(msg))),
        }
    }

    /// Current payload length in bytes.
    pub fn size(&self) -> usize {
        self.with_bytes(|b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Run `f` over the current payload.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &*self.inner.borrow() {
            Buffer::Owned(v) => f(v),
            Buffer::Shared(b) => f(b),
            Buffer::MsgView(msg) => f(&msg.borrow().data),
        }
    }

    /// A cheap snapshot of the payload (zero-copy for shared and
    /// message-backed buffers).
    pub fn bytes(&self) -> Bytes {
        match &*self.inner.borrow() {
            Buffer::Owned(v) => Bytes::copy_from_slice(v),
            Buffer::Shared(b) => b.clone(),
            Buffer::MsgView(msg) => msg.borrow().data.clone(),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(|b| b.to_vec())
    }

    /// Copy `data` into an owned buffer, in bounded chunks. A zero-length
    /// input clears the buffer.
    pub fn set_data(&mut self, data: &[u8]) {
        let mut owned = Vec::new();
        if !data.is_empty() {
            owned.reserve_exact(data.len());
            for chunk in data.chunks(MAX_COPY_CHUNK) {
                owned.extend_from_slice(chunk);
            }
        }
        *self.inner.borrow_mut() = Buffer::Owned(owned);
    }

    /// Adopt caller-owned bytes without copying. The owner's `Drop` acts
    /// as the release callback once the last alias goes away.
    pub fn assign(&mut self, data: impl Into<Bytes>) {
        *self.inner.borrow_mut() = Buffer::Shared(data.into());
    }

    /// Ensure an owned buffer of exactly `size` bytes, reallocating only
    /// when the current allocation differs. Size 0 yields the empty
    /// sentinel buffer.
    pub fn malloc_aligned(&mut self, size: usize) {
        let mut inner = self.inner.borrow_mut();
        if let Buffer::Owned(v) = &*inner {
            if v.len() == size {
                return;
            }
        }
        *inner = Buffer::Owned(vec![0u8; size]);
    }

    /// Run `f` over a mutable payload.
    ///
    /// Shared buffers are promoted to owned copies first. Message-backed
    /// buffers write the mutation back into the message, so every other
    /// view of that message observes it.
    pub fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.borrow_mut();
        match &mut *inner {
            Buffer::Owned(v) => f(v),
            Buffer::Shared(b) => {
                let mut owned = b.to_vec();
                let out = f(&mut owned);
                *inner = Buffer::Owned(owned);
                out
            }
            Buffer::MsgView(msg) => {
                let mut msg = msg.borrow_mut();
                let mut owned = msg.data.to_vec();
                let out = f(&mut owned);
                msg.data = Bytes::from(owned);
                out
            }
        }
    }

    /// An independent copy of the payload.
    pub fn deep_clone(&self) -> TensorData {
        TensorData {
            inner: Rc::new(RefCell::new(Buffer::Owned(self.to_vec()))),
        }
    }

    /// Whether two handles alias the same buffer.
    pub fn same_buffer(a: &TensorData, b: &TensorData) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Default for TensorData {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for TensorData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TensorData").field("size", &self.size()).finish()
    }
}

/// A tensor: descriptor plus byte payload, both with shared ownership.
///
/// `Clone` *shares* — the clone aliases the identical descriptor and
/// buffer. [`Tensor::deep_clone`] copies both. Callers pick one
/// explicitly; an accidental deep copy here is a performance bug, an
/// accidental alias a correctness one.
pub struct Tensor {
    desc: TensorDesc,
    data: TensorData,
}

impl Tensor {
    /// An empty tensor for the given descriptor.
    pub fn new(desc: TensorDesc) -> Self {
        Self {
            desc,
            data: TensorData::new(),
        }
    }

    /// A tensor with the payload copied in.
    pub fn with_data(desc: TensorDesc, data: &[u8]) -> Self {
        let mut tensor = Self::new(desc);
        tensor.set_data(data);
        tensor
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn desc_mut(&mut self) -> &mut TensorDesc {
        &mut self.desc
    }

    pub fn set_desc(&mut self, desc: TensorDesc) {
        self.desc = desc;
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    /// Copy `data` into the tensor's buffer. See [`TensorData::set_data`].
    pub fn set_data(&mut self, data: &[u8]) {
        self.data.set_data(data);
    }

    /// Adopt caller-owned bytes without copying.
    pub fn assign_data(&mut self, data: impl Into<Bytes>) {
        self.data.assign(data);
    }

    /// Decode the payload as elements of `T`.
    ///
    /// The read is alignment-agnostic; a payload length that is not a
    /// multiple of the element size is an invalid-parameter error.
    pub fn data_as<T: bytemuck::Pod>(&self) -> Result<Vec<T>> {
        self.data.with_bytes(|bytes| {
            let elem = core::mem::size_of::<T>();
            if elem == 0 || bytes.len() % elem != 0 {
                return Err(Error::InvalidParam(format!(
                    "payload of {} bytes is not a whole number of {}-byte elements",
                    bytes.len(),
                    elem
                )));
            }
            let mut out = Vec::with_capacity(bytes.len() / elem);
            for chunk in bytes.chunks_exact(elem) {
                out.push(bytemuck::pod_read_unaligned(chunk));
            }
            Ok(out)
        })
    }

    /// Alias this tensor: descriptor and buffer are shared, not copied.
    pub fn share(&self) -> Tensor {
        Tensor {
            desc: self.desc.share(),
            data: self.data.clone(),
        }
    }

    /// An independent copy of descriptor and payload.
    pub fn deep_clone(&self) -> Tensor {
        Tensor {
            desc: self.desc.deep_clone(),
            data: self.data.deep_clone(),
        }
    }

    /// Build a tensor from its wire message. The payload stays a view over
    /// the message's bytes until first mutation.
    pub fn from_proto(wire: protos::TensorDef) -> Result<Tensor> {
        let desc = match wire.desc.as_ref() {
            Some(desc) => TensorDesc::from_proto(desc)?,
            None => TensorDesc::new(),
        };
        let msg = Rc::new(RefCell::new(wire));
        Ok(Tensor {
            desc,
            data: TensorData::from_msg(msg),
        })
    }

    /// Emit the wire message.
    pub fn to_proto(&self) -> Result<protos::TensorDef> {
        let mut wire = protos::TensorDef::new();
        wire.desc = protobuf::MessageField::some(self.desc.to_proto()?);
        wire.data = self.data.bytes();
        Ok(wire)
    }
}

/// Cloning shares; see [`Tensor::deep_clone`] for a copy.
impl Clone for Tensor {
    fn clone(&self) -> Self {
        self.share()
    }
}

/// Structural equality: descriptor and payload bytes.
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.desc == other.desc && self.data.with_bytes(|a| other.data.with_bytes(|b| a == b))
    }
}

impl core::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tensor")
            .field("desc", &self.desc)
            .field("bytes", &self.data.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Format};

    fn f32_desc(dims: Vec<i64>) -> TensorDesc {
        TensorDesc::with_shape(dims, Format::Nd, DataType::Float)
    }

    #[test]
    fn set_data_copies_and_clears() {
        let mut data = TensorData::new();
        data.set_data(&[1, 2, 3, 4]);
        assert_eq!(data.size(), 4);
        assert_eq!(data.to_vec(), vec![1, 2, 3, 4]);

        data.set_data(&[]);
        assert!(data.is_empty());
        data.with_bytes(|b| assert_eq!(b, &[] as &[u8]));
    }

    #[test]
    fn malloc_aligned_reuses_allocation() {
        let mut data = TensorData::new();
        data.malloc_aligned(8);
        assert_eq!(data.size(), 8);
        data.with_bytes_mut(|b| b[0] = 7);
        // Same size: the buffer (and its contents) stay put.
        data.malloc_aligned(8);
        assert_eq!(data.to_vec()[0], 7);
        // Different size: reallocated and zeroed.
        data.malloc_aligned(4);
        assert_eq!(data.to_vec(), vec![0; 4]);
        data.malloc_aligned(0);
        assert!(data.is_empty());
    }

    #[test]
    fn assign_adopts_without_copy() {
        let payload = Bytes::from(vec![9u8; 16]);
        let mut data = TensorData::new();
        data.assign(payload.clone());
        assert_eq!(data.size(), 16);
        // Snapshot of a shared buffer is zero-copy.
        let snap = data.bytes();
        assert_eq!(snap, payload);
    }

    #[test]
    fn share_aliases_copy_does_not() {
        let tensor = Tensor::with_data(f32_desc(vec![2]), &1.0f32.to_le_bytes());
        let mut alias = tensor.share();
        let copy = tensor.deep_clone();

        alias.set_data(&2.5f32.to_le_bytes());
        assert!(TensorData::same_buffer(tensor.data(), alias.data()));
        assert_eq!(tensor.data_as::<f32>().unwrap(), vec![2.5]);
        assert_eq!(copy.data_as::<f32>().unwrap(), vec![1.0]);

        // Descriptor is aliased too.
        alias.desc_mut().set_name("renamed");
        assert_eq!(tensor.desc().name(), "renamed");
        assert_eq!(copy.desc().name(), "");
    }

    #[test]
    fn typed_access_validates_length() {
        let tensor = Tensor::with_data(f32_desc(vec![1]), &[1, 2, 3]);
        assert!(matches!(
            tensor.data_as::<f32>(),
            Err(Error::InvalidParam(_))
        ));

        let values = [1.5f32, -2.0, 0.25];
        let mut bytes = Vec::new();
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let tensor = Tensor::with_data(f32_desc(vec![3]), &bytes);
        assert_eq!(tensor.data_as::<f32>().unwrap(), values.to_vec());
    }

    #[test]
    fn message_backed_payload_tracks_message() {
        let mut wire = protos::TensorDef::new();
        wire.data = Bytes::from(vec![1u8, 2, 3, 4]);
        let tensor = Tensor::from_proto(wire).unwrap();
        assert_eq!(tensor.data().to_vec(), vec![1, 2, 3, 4]);

        // Mutation writes through to the message, and aliases observe the
        // replaced payload on their next read.
        let mut alias = tensor.share();
        alias.data_mut().with_bytes_mut(|b| b[0] = 9);
        assert_eq!(tensor.data().to_vec()[0], 9);
    }

    #[test]
    fn tensor_proto_round_trip() {
        let mut tensor = Tensor::with_data(f32_desc(vec![2]), &[0, 0, 128, 63, 0, 0, 0, 64]);
        tensor.desc_mut().set_name("w");
        let wire = tensor.to_proto().unwrap();
        let back = Tensor::from_proto(wire).unwrap();
        assert_eq!(back, tensor);
    }
}
