//! # Binary Decoder
//!
//! Reads OPC UA built-in types from a byte buffer. All reads are bounds
//! checked; truncated input yields [`ProtocolError::DecodingError`] rather
//! than a panic.
//!
//! ## Limits
//! - Declared lengths are checked against the configured limits and the max
//!   message size *before* anything is allocated.
//! - `Variant`, `DataValue` and `DiagnosticInfo` nest. The decoder counts the
//!   current nesting depth and fails with
//!   [`ProtocolError::EncodingLimitExceeded`] at the configured maximum.

use crate::config::EncodingLimits;
use crate::core::encoder::{
    EXPANDED_NAMESPACE_URI, EXPANDED_SERVER_INDEX, LOCALIZED_TEXT_LOCALE, LOCALIZED_TEXT_TEXT,
    VARIANT_ARRAY, VARIANT_DIMENSIONS, VARIANT_TYPE_MASK,
};
use crate::core::types::{
    Array, BuiltinType, ByteString, DataValue, DateTime, DiagnosticInfo, ExpandedNodeId,
    ExtensionObject, ExtensionObjectBody, Guid, Identifier, LocalizedText, NodeId, QualifiedName,
    StatusCode, Variant, XmlElement,
};
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, Bytes};

#[derive(Debug)]
pub struct BinaryDecoder {
    buf: Bytes,
    limits: EncodingLimits,
    depth: usize,
}

macro_rules! read_le {
    ($name:ident, $ty:ty, $get:ident) => {
        pub fn $name(&mut self) -> Result<$ty> {
            self.ensure(std::mem::size_of::<$ty>())?;
            Ok(self.buf.$get())
        }
    };
}

impl BinaryDecoder {
    pub fn new(buf: Bytes, limits: EncodingLimits) -> Self {
        BinaryDecoder {
            buf,
            limits,
            depth: 0,
        }
    }

    pub fn limits(&self) -> &EncodingLimits {
        &self.limits
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// The unread bytes.
    pub fn into_remaining(self) -> Bytes {
        self.buf
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::DecodingError(format!(
                "{}: need {n}, have {}",
                constants::ERR_BUFFER_UNDERFLOW,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Reads a length prefix. `None` means the value is null.
    fn read_length(&mut self, max: usize, what: &str) -> Result<Option<usize>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        if len > max || len > self.limits.max_message_size {
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "{what} length {len} exceeds limit {}",
                max.min(self.limits.max_message_size)
            )));
        }
        Ok(Some(len))
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= self.limits.max_recursion_depth {
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "{}: {}",
                constants::ERR_RECURSION_DEPTH,
                self.limits.max_recursion_depth
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Runs `f` one nesting level deeper, restoring the depth on every exit.
    fn nested<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.enter()?;
        let result = f(self);
        self.leave();
        result
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    read_le!(read_i8, i8, get_i8);
    read_le!(read_u8, u8, get_u8);
    read_le!(read_i16, i16, get_i16_le);
    read_le!(read_u16, u16, get_u16_le);
    read_le!(read_i32, i32, get_i32_le);
    read_le!(read_u32, u32, get_u32_le);
    read_le!(read_i64, i64, get_i64_le);
    read_le!(read_u64, u64, get_u64_le);
    read_le!(read_f32, f32, get_f32_le);
    read_le!(read_f64, f64, get_f64_le);

    /// `n` bytes with no length prefix.
    pub fn read_raw(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n))
    }

    pub fn read_string(&mut self) -> Result<Option<String>> {
        match self.read_length(self.limits.max_string_length, "String")? {
            None => Ok(None),
            Some(len) => {
                let raw = self.read_raw(len)?;
                String::from_utf8(raw.to_vec())
                    .map(Some)
                    .map_err(|_| ProtocolError::DecodingError(constants::ERR_INVALID_UTF8.into()))
            }
        }
    }

    pub fn read_byte_string(&mut self) -> Result<ByteString> {
        match self.read_length(self.limits.max_message_size, "ByteString")? {
            None => Ok(ByteString::null()),
            Some(len) => Ok(ByteString(Some(self.read_raw(len)?))),
        }
    }

    pub fn read_xml_element(&mut self) -> Result<XmlElement> {
        match self.read_byte_string()?.0 {
            None => Ok(XmlElement(None)),
            Some(raw) => String::from_utf8(raw.to_vec())
                .map(|s| XmlElement(Some(s)))
                .map_err(|_| ProtocolError::DecodingError(constants::ERR_INVALID_UTF8.into())),
        }
    }

    pub fn read_date_time(&mut self) -> Result<DateTime> {
        Ok(DateTime(self.read_i64()?))
    }

    pub fn read_guid(&mut self) -> Result<Guid> {
        let d1 = self.read_u32()?;
        let d2 = self.read_u16()?;
        let d3 = self.read_u16()?;
        self.ensure(8)?;
        let mut d4 = [0u8; 8];
        self.buf.copy_to_slice(&mut d4);
        Ok(Guid::from_fields(d1, d2, d3, &d4))
    }

    pub fn read_status_code(&mut self) -> Result<StatusCode> {
        Ok(StatusCode(self.read_u32()?))
    }

    pub fn read_node_id(&mut self) -> Result<NodeId> {
        let format = self.read_u8()?;
        self.read_node_id_body(format)
    }

    fn read_node_id_body(&mut self, format: u8) -> Result<NodeId> {
        let node_id = match format & 0x0F {
            0x00 => NodeId::numeric(0, u32::from(self.read_u8()?)),
            0x01 => {
                let ns = u16::from(self.read_u8()?);
                NodeId::numeric(ns, u32::from(self.read_u16()?))
            }
            0x02 => {
                let ns = self.read_u16()?;
                NodeId::numeric(ns, self.read_u32()?)
            }
            0x03 => {
                let ns = self.read_u16()?;
                NodeId {
                    namespace_index: ns,
                    identifier: Identifier::String(self.read_string()?),
                }
            }
            0x04 => {
                let ns = self.read_u16()?;
                NodeId::guid(ns, self.read_guid()?)
            }
            0x05 => {
                let ns = self.read_u16()?;
                NodeId {
                    namespace_index: ns,
                    identifier: Identifier::Opaque(self.read_byte_string()?),
                }
            }
            other => {
                return Err(ProtocolError::DecodingError(format!(
                    "invalid NodeId encoding: 0x{other:02X}"
                )))
            }
        };
        Ok(node_id)
    }

    pub fn read_expanded_node_id(&mut self) -> Result<ExpandedNodeId> {
        let flags = self.read_u8()?;
        let node_id = self.read_node_id_body(flags)?;
        let namespace_uri = if flags & EXPANDED_NAMESPACE_URI != 0 {
            self.read_string()?
        } else {
            None
        };
        let server_index = if flags & EXPANDED_SERVER_INDEX != 0 {
            self.read_u32()?
        } else {
            0
        };
        Ok(ExpandedNodeId {
            node_id,
            namespace_uri,
            server_index,
        })
    }

    pub fn read_qualified_name(&mut self) -> Result<QualifiedName> {
        let namespace_index = self.read_u16()?;
        let name = self
            .read_string()?
            .filter(|n| n.chars().count() <= QualifiedName::MAX_NAME_LENGTH);
        Ok(QualifiedName {
            namespace_index,
            name,
        })
    }

    pub fn read_localized_text(&mut self) -> Result<LocalizedText> {
        let mask = self.read_u8()?;
        let locale = if mask & LOCALIZED_TEXT_LOCALE != 0 {
            self.read_string()?
        } else {
            None
        };
        let text = if mask & LOCALIZED_TEXT_TEXT != 0 {
            self.read_string()?
        } else {
            None
        };
        Ok(LocalizedText { locale, text })
    }

    pub fn read_extension_object(&mut self) -> Result<ExtensionObject> {
        let encoding_id = self.read_node_id()?;
        let body = match self.read_u8()? {
            ExtensionObjectBody::ENCODING_NONE => ExtensionObjectBody::None,
            ExtensionObjectBody::ENCODING_BYTE_STRING => match self.read_byte_string()?.0 {
                Some(body) => ExtensionObjectBody::ByteString(body),
                None => ExtensionObjectBody::None,
            },
            ExtensionObjectBody::ENCODING_XML => ExtensionObjectBody::Xml(self.read_xml_element()?),
            other => {
                return Err(ProtocolError::DecodingError(format!(
                    "invalid ExtensionObject encoding: 0x{other:02X}"
                )))
            }
        };
        Ok(ExtensionObject { encoding_id, body })
    }

    pub fn read_data_value(&mut self) -> Result<DataValue> {
        self.nested(|d| {
            let mask = d.read_u8()?;
            let mut dv = DataValue::default();
            if mask & DataValue::MASK_VALUE != 0 {
                dv.value = Some(d.read_variant()?);
            }
            if mask & DataValue::MASK_STATUS != 0 {
                dv.status = Some(d.read_status_code()?);
            }
            if mask & DataValue::MASK_SOURCE_TIMESTAMP != 0 {
                dv.source_timestamp = Some(d.read_date_time()?);
            }
            if mask & DataValue::MASK_SOURCE_PICOSECONDS != 0 {
                dv.source_picoseconds = Some(d.read_u16()?);
            }
            if mask & DataValue::MASK_SERVER_TIMESTAMP != 0 {
                dv.server_timestamp = Some(d.read_date_time()?);
            }
            if mask & DataValue::MASK_SERVER_PICOSECONDS != 0 {
                dv.server_picoseconds = Some(d.read_u16()?);
            }
            Ok(dv)
        })
    }

    pub fn read_diagnostic_info(&mut self) -> Result<DiagnosticInfo> {
        self.nested(|d| {
            let mask = d.read_u8()?;
            let mut info = DiagnosticInfo::default();
            if mask & DiagnosticInfo::MASK_SYMBOLIC_ID != 0 {
                info.symbolic_id = Some(d.read_i32()?);
            }
            if mask & DiagnosticInfo::MASK_NAMESPACE_URI != 0 {
                info.namespace_uri = Some(d.read_i32()?);
            }
            if mask & DiagnosticInfo::MASK_LOCALIZED_TEXT != 0 {
                info.localized_text = Some(d.read_i32()?);
            }
            if mask & DiagnosticInfo::MASK_LOCALE != 0 {
                info.locale = Some(d.read_i32()?);
            }
            if mask & DiagnosticInfo::MASK_ADDITIONAL_INFO != 0 {
                info.additional_info = d.read_string()?;
            }
            if mask & DiagnosticInfo::MASK_INNER_STATUS_CODE != 0 {
                info.inner_status_code = Some(d.read_status_code()?);
            }
            if mask & DiagnosticInfo::MASK_INNER_DIAGNOSTIC_INFO != 0 {
                info.inner_diagnostic_info = Some(Box::new(d.read_diagnostic_info()?));
            }
            Ok(info)
        })
    }

    pub fn read_variant(&mut self) -> Result<Variant> {
        self.nested(|d| {
            let mask = d.read_u8()?;
            if mask == 0 {
                return Ok(Variant::Empty);
            }
            let type_id = mask & VARIANT_TYPE_MASK;
            let element_type = BuiltinType::from_id(type_id).ok_or_else(|| {
                ProtocolError::DecodingError(format!("unknown built-in type id: {type_id}"))
            })?;

            if mask & VARIANT_ARRAY == 0 {
                if element_type == BuiltinType::Variant {
                    return Err(ProtocolError::DecodingError(
                        constants::ERR_NESTED_VARIANT.into(),
                    ));
                }
                return d.read_variant_value(element_type);
            }

            let len = d
                .read_length(d.limits.max_array_length, "Array")?
                .unwrap_or(0);
            let mut values = Vec::with_capacity(len.min(d.remaining()));
            for _ in 0..len {
                values.push(d.read_variant_value(element_type)?);
            }

            let dimensions = if mask & VARIANT_DIMENSIONS != 0 {
                d.read_array(|d| d.read_i32())?
            } else {
                None
            };

            let array = match dimensions {
                Some(dims) => Array::matrix(element_type, values, dims)
                    .map_err(|e| ProtocolError::DecodingError(e.to_string()))?,
                None => Array {
                    element_type,
                    values,
                    dimensions: None,
                },
            };
            Ok(Variant::Array(Box::new(array)))
        })
    }

    fn read_variant_value(&mut self, t: BuiltinType) -> Result<Variant> {
        let v = match t {
            BuiltinType::Boolean => Variant::Boolean(self.read_bool()?),
            BuiltinType::SByte => Variant::SByte(self.read_i8()?),
            BuiltinType::Byte => Variant::Byte(self.read_u8()?),
            BuiltinType::Int16 => Variant::Int16(self.read_i16()?),
            BuiltinType::UInt16 => Variant::UInt16(self.read_u16()?),
            BuiltinType::Int32 => Variant::Int32(self.read_i32()?),
            BuiltinType::UInt32 => Variant::UInt32(self.read_u32()?),
            BuiltinType::Int64 => Variant::Int64(self.read_i64()?),
            BuiltinType::UInt64 => Variant::UInt64(self.read_u64()?),
            BuiltinType::Float => Variant::Float(self.read_f32()?),
            BuiltinType::Double => Variant::Double(self.read_f64()?),
            BuiltinType::String => Variant::String(self.read_string()?),
            BuiltinType::DateTime => Variant::DateTime(self.read_date_time()?),
            BuiltinType::Guid => Variant::Guid(self.read_guid()?),
            BuiltinType::ByteString => Variant::ByteString(self.read_byte_string()?),
            BuiltinType::XmlElement => Variant::XmlElement(self.read_xml_element()?),
            BuiltinType::NodeId => Variant::NodeId(Box::new(self.read_node_id()?)),
            BuiltinType::ExpandedNodeId => {
                Variant::ExpandedNodeId(Box::new(self.read_expanded_node_id()?))
            }
            BuiltinType::StatusCode => Variant::StatusCode(self.read_status_code()?),
            BuiltinType::QualifiedName => {
                Variant::QualifiedName(Box::new(self.read_qualified_name()?))
            }
            BuiltinType::LocalizedText => {
                Variant::LocalizedText(Box::new(self.read_localized_text()?))
            }
            BuiltinType::ExtensionObject => {
                Variant::ExtensionObject(Box::new(self.read_extension_object()?))
            }
            BuiltinType::DataValue => Variant::DataValue(Box::new(self.read_data_value()?)),
            BuiltinType::Variant => Variant::Variant(Box::new(self.read_variant()?)),
            BuiltinType::DiagnosticInfo => {
                Variant::DiagnosticInfo(Box::new(self.read_diagnostic_info()?))
            }
        };
        Ok(v)
    }

    /// A length-prefixed array; length `-1` decodes as `None`.
    pub fn read_array<T, F>(&mut self, mut read: F) -> Result<Option<Vec<T>>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        match self.read_length(self.limits.max_array_length, "Array")? {
            None => Ok(None),
            Some(len) => {
                let mut values = Vec::with_capacity(len.min(self.remaining()));
                for _ in 0..len {
                    values.push(read(self)?);
                }
                Ok(Some(values))
            }
        }
    }
}
