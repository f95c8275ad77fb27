//! Structure codecs for `ExtensionObject` bodies.
//!
//! Structures implement [`BinaryStruct`]. A [`CodecRegistry`] maps binary
//! encoding ids to type-erased codecs so that an `ExtensionObject` received
//! off the wire can be decoded without knowing its type in advance.

use crate::config::EncodingLimits;
use crate::core::decoder::BinaryDecoder;
use crate::core::encoder::BinaryEncoder;
use crate::core::types::{ExtensionObject, ExtensionObjectBody, NodeId};
use crate::error::{ProtocolError, Result};
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// A structure with a binary encoding registered in namespace 0.
pub trait BinaryStruct: Sized + Send + Sync + 'static {
    /// Numeric id of the `DefaultBinary` encoding node.
    const ENCODING_ID: u32;

    fn encode(&self, encoder: &mut BinaryEncoder) -> Result<()>;

    fn decode(decoder: &mut BinaryDecoder) -> Result<Self>;
}

/// A decoded structure whose concrete type is known only at runtime.
pub type DynStruct = Box<dyn Any + Send + Sync>;

pub trait StructCodec: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn decode(&self, decoder: &mut BinaryDecoder) -> Result<DynStruct>;

    fn encode(&self, value: &(dyn Any + Send + Sync), encoder: &mut BinaryEncoder) -> Result<()>;
}

struct TypedCodec<T>(PhantomData<fn() -> T>);

impl<T: BinaryStruct> StructCodec for TypedCodec<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn decode(&self, decoder: &mut BinaryDecoder) -> Result<DynStruct> {
        Ok(Box::new(T::decode(decoder)?))
    }

    fn encode(&self, value: &(dyn Any + Send + Sync), encoder: &mut BinaryEncoder) -> Result<()> {
        let value = value.downcast_ref::<T>().ok_or_else(|| {
            ProtocolError::EncodingError(format!("value is not a {}", self.type_name()))
        })?;
        value.encode(encoder)
    }
}

/// Maps encoding ids to structure codecs.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<NodeId, Arc<dyn StructCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under its binary encoding id, replacing any previous codec.
    pub fn register<T: BinaryStruct>(&mut self) {
        let id = NodeId::numeric(0, T::ENCODING_ID);
        debug!(encoding_id = %id, type_name = std::any::type_name::<T>(), "Registering codec");
        self.codecs.insert(id, Arc::new(TypedCodec::<T>(PhantomData)));
    }

    /// Registers a hand-written codec under an arbitrary encoding id.
    pub fn register_codec(&mut self, encoding_id: NodeId, codec: Arc<dyn StructCodec>) {
        self.codecs.insert(encoding_id, codec);
    }

    pub fn contains(&self, encoding_id: &NodeId) -> bool {
        self.codecs.contains_key(encoding_id)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Decodes the body of `object` with the codec registered for its id.
    pub fn decode(&self, object: &ExtensionObject, limits: &EncodingLimits) -> Result<DynStruct> {
        let codec = self.codecs.get(&object.encoding_id).ok_or_else(|| {
            ProtocolError::DecodingError(format!("no codec for encoding id {}", object.encoding_id))
        })?;
        match &object.body {
            ExtensionObjectBody::ByteString(body) => {
                let mut decoder = BinaryDecoder::new(body.clone(), limits.clone());
                codec.decode(&mut decoder)
            }
            _ => Err(ProtocolError::DecodingError(
                "extension object has no binary body".into(),
            )),
        }
    }

    /// Encodes `value` with the codec registered for `encoding_id`.
    pub fn encode(
        &self,
        encoding_id: &NodeId,
        value: &(dyn Any + Send + Sync),
        limits: &EncodingLimits,
    ) -> Result<ExtensionObject> {
        let codec = self.codecs.get(encoding_id).ok_or_else(|| {
            ProtocolError::EncodingError(format!("no codec for encoding id {encoding_id}"))
        })?;
        let mut encoder = BinaryEncoder::new(limits.clone());
        codec.encode(value, &mut encoder)?;
        Ok(ExtensionObject {
            encoding_id: encoding_id.clone(),
            body: ExtensionObjectBody::ByteString(encoder.finish()),
        })
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.codecs.len())
            .finish()
    }
}
