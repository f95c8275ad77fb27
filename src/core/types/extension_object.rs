//! `ExtensionObject`: a structured value carried as an opaque body tagged with
//! its encoding id.

use super::{NodeId, XmlElement};
use crate::config::EncodingLimits;
use crate::core::decoder::BinaryDecoder;
use crate::core::encoder::BinaryEncoder;
use crate::core::registry::BinaryStruct;
use crate::error::{ProtocolError, Result};
use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExtensionObjectBody {
    #[default]
    None,
    ByteString(Bytes),
    Xml(XmlElement),
}

impl ExtensionObjectBody {
    pub const ENCODING_NONE: u8 = 0x00;
    pub const ENCODING_BYTE_STRING: u8 = 0x01;
    pub const ENCODING_XML: u8 = 0x02;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionObject {
    pub encoding_id: NodeId,
    pub body: ExtensionObjectBody,
}

impl ExtensionObject {
    pub fn null() -> Self {
        ExtensionObject::default()
    }

    pub fn is_null(&self) -> bool {
        self.encoding_id.is_null() && self.body == ExtensionObjectBody::None
    }

    /// Wrap a structure, encoding it with its binary encoding id.
    pub fn from_struct<T: BinaryStruct>(value: &T, limits: &EncodingLimits) -> Result<Self> {
        let mut encoder = BinaryEncoder::new(limits.clone());
        value.encode(&mut encoder)?;
        Ok(ExtensionObject {
            encoding_id: NodeId::numeric(0, T::ENCODING_ID),
            body: ExtensionObjectBody::ByteString(encoder.finish()),
        })
    }

    /// Decode the body as `T`, checking the encoding id first.
    pub fn decode_struct<T: BinaryStruct>(&self, limits: &EncodingLimits) -> Result<T> {
        if self.encoding_id.as_ns0_numeric() != Some(T::ENCODING_ID) {
            return Err(ProtocolError::DecodingError(format!(
                "expected encoding id i={}, found {}",
                T::ENCODING_ID,
                self.encoding_id
            )));
        }
        match &self.body {
            ExtensionObjectBody::ByteString(body) => {
                let mut decoder = BinaryDecoder::new(body.clone(), limits.clone());
                T::decode(&mut decoder)
            }
            _ => Err(ProtocolError::DecodingError(
                "extension object has no binary body".into(),
            )),
        }
    }
}
