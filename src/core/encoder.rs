//! # Binary Encoder
//!
//! Writes OPC UA built-in types into an owned buffer in the little-endian
//! binary wire format.
//!
//! The encoder owns a single `BytesMut`; callers hand it off with
//! [`BinaryEncoder::finish`] once the value is written. Every length-prefixed
//! write is checked against [`EncodingLimits`] before any element is written.

use crate::config::EncodingLimits;
use crate::core::types::{
    Array, BuiltinType, ByteString, DataValue, DateTime, DiagnosticInfo, ExpandedNodeId,
    ExtensionObject, ExtensionObjectBody, Guid, Identifier, LocalizedText, NodeId, QualifiedName,
    StatusCode, Variant, XmlElement,
};
use crate::error::{constants, ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub(crate) const VARIANT_ARRAY: u8 = 0x80;
pub(crate) const VARIANT_DIMENSIONS: u8 = 0x40;
pub(crate) const VARIANT_TYPE_MASK: u8 = 0x3F;

pub(crate) const EXPANDED_NAMESPACE_URI: u8 = 0x80;
pub(crate) const EXPANDED_SERVER_INDEX: u8 = 0x40;

pub(crate) const LOCALIZED_TEXT_LOCALE: u8 = 0x01;
pub(crate) const LOCALIZED_TEXT_TEXT: u8 = 0x02;

#[derive(Debug)]
pub struct BinaryEncoder {
    buf: BytesMut,
    limits: EncodingLimits,
}

impl BinaryEncoder {
    pub fn new(limits: EncodingLimits) -> Self {
        Self::with_capacity(limits, 256)
    }

    pub fn with_capacity(limits: EncodingLimits, capacity: usize) -> Self {
        BinaryEncoder {
            buf: BytesMut::with_capacity(capacity),
            limits,
        }
    }

    pub fn limits(&self) -> &EncodingLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Hand off the encoded bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    fn check_length(&self, len: usize, max: usize, what: &str) -> Result<i32> {
        if len > max || len > self.limits.max_message_size {
            return Err(ProtocolError::EncodingLimitExceeded(format!(
                "{what} length {len} exceeds limit {}",
                max.min(self.limits.max_message_size)
            )));
        }
        i32::try_from(len).map_err(|_| {
            ProtocolError::EncodingLimitExceeded(format!("{what} length {len} overflows Int32"))
        })
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Bytes with no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn write_string(&mut self, v: Option<&str>) -> Result<()> {
        match v {
            None => self.write_i32(-1),
            Some(s) => {
                let len = self.check_length(s.len(), self.limits.max_string_length, "String")?;
                self.write_i32(len);
                self.buf.put_slice(s.as_bytes());
            }
        }
        Ok(())
    }

    pub fn write_byte_string(&mut self, v: &ByteString) -> Result<()> {
        match &v.0 {
            None => self.write_i32(-1),
            Some(b) => {
                let len = self.check_length(b.len(), self.limits.max_message_size, "ByteString")?;
                self.write_i32(len);
                self.buf.put_slice(b);
            }
        }
        Ok(())
    }

    pub fn write_xml_element(&mut self, v: &XmlElement) -> Result<()> {
        match &v.0 {
            None => self.write_i32(-1),
            Some(xml) => {
                let len = self.check_length(xml.len(), self.limits.max_message_size, "XmlElement")?;
                self.write_i32(len);
                self.buf.put_slice(xml.as_bytes());
            }
        }
        Ok(())
    }

    pub fn write_date_time(&mut self, v: DateTime) {
        self.write_i64(v.0);
    }

    /// The last 8 bytes are written as-is, which makes them big-endian
    /// relative to the leading fields.
    pub fn write_guid(&mut self, v: &Guid) {
        let (d1, d2, d3, d4) = v.as_fields();
        self.write_u32(d1);
        self.write_u16(d2);
        self.write_u16(d3);
        self.buf.put_slice(d4);
    }

    pub fn write_status_code(&mut self, v: StatusCode) {
        self.write_u32(v.0);
    }

    pub fn write_node_id(&mut self, v: &NodeId) -> Result<()> {
        self.write_node_id_with_flags(v, 0)
    }

    fn write_node_id_with_flags(&mut self, v: &NodeId, flags: u8) -> Result<()> {
        let ns = v.namespace_index;
        match &v.identifier {
            Identifier::Numeric(id) if ns == 0 && *id <= 0xFF => {
                self.write_u8(flags);
                self.write_u8(*id as u8);
            }
            Identifier::Numeric(id) if ns <= 0xFF && *id <= 0xFFFF => {
                self.write_u8(0x01 | flags);
                self.write_u8(ns as u8);
                self.write_u16(*id as u16);
            }
            Identifier::Numeric(id) => {
                self.write_u8(0x02 | flags);
                self.write_u16(ns);
                self.write_u32(*id);
            }
            Identifier::String(s) => {
                self.write_u8(0x03 | flags);
                self.write_u16(ns);
                self.write_string(s.as_deref())?;
            }
            Identifier::Guid(g) => {
                self.write_u8(0x04 | flags);
                self.write_u16(ns);
                self.write_guid(g);
            }
            Identifier::Opaque(b) => {
                self.write_u8(0x05 | flags);
                self.write_u16(ns);
                self.write_byte_string(b)?;
            }
        }
        Ok(())
    }

    pub fn write_expanded_node_id(&mut self, v: &ExpandedNodeId) -> Result<()> {
        let mut flags = 0;
        if v.namespace_uri.is_some() {
            flags |= EXPANDED_NAMESPACE_URI;
        }
        if v.server_index != 0 {
            flags |= EXPANDED_SERVER_INDEX;
        }
        self.write_node_id_with_flags(&v.node_id, flags)?;
        if let Some(uri) = &v.namespace_uri {
            self.write_string(Some(uri))?;
        }
        if v.server_index != 0 {
            self.write_u32(v.server_index);
        }
        Ok(())
    }

    pub fn write_qualified_name(&mut self, v: &QualifiedName) -> Result<()> {
        self.write_u16(v.namespace_index);
        self.write_string(v.name.as_deref())
    }

    pub fn write_localized_text(&mut self, v: &LocalizedText) -> Result<()> {
        let mut mask = 0;
        if v.locale.is_some() {
            mask |= LOCALIZED_TEXT_LOCALE;
        }
        if v.text.is_some() {
            mask |= LOCALIZED_TEXT_TEXT;
        }
        self.write_u8(mask);
        if let Some(locale) = &v.locale {
            self.write_string(Some(locale))?;
        }
        if let Some(text) = &v.text {
            self.write_string(Some(text))?;
        }
        Ok(())
    }

    pub fn write_extension_object(&mut self, v: &ExtensionObject) -> Result<()> {
        self.write_node_id(&v.encoding_id)?;
        match &v.body {
            ExtensionObjectBody::None => self.write_u8(ExtensionObjectBody::ENCODING_NONE),
            ExtensionObjectBody::ByteString(body) => {
                self.write_u8(ExtensionObjectBody::ENCODING_BYTE_STRING);
                self.write_byte_string(&ByteString(Some(body.clone())))?;
            }
            ExtensionObjectBody::Xml(xml) => {
                self.write_u8(ExtensionObjectBody::ENCODING_XML);
                self.write_xml_element(xml)?;
            }
        }
        Ok(())
    }

    pub fn write_data_value(&mut self, v: &DataValue) -> Result<()> {
        self.write_u8(v.encoding_mask());
        if let Some(value) = &v.value {
            self.write_variant(value)?;
        }
        if let Some(status) = v.status {
            self.write_status_code(status);
        }
        if let Some(ts) = v.source_timestamp {
            self.write_date_time(ts);
        }
        if let Some(ps) = v.source_picoseconds {
            self.write_u16(ps);
        }
        if let Some(ts) = v.server_timestamp {
            self.write_date_time(ts);
        }
        if let Some(ps) = v.server_picoseconds {
            self.write_u16(ps);
        }
        Ok(())
    }

    pub fn write_diagnostic_info(&mut self, v: &DiagnosticInfo) -> Result<()> {
        if v.depth() > self.limits.max_recursion_depth {
            return Err(ProtocolError::EncodingLimitExceeded(
                constants::ERR_RECURSION_DEPTH.into(),
            ));
        }
        self.write_u8(v.encoding_mask());
        if let Some(x) = v.symbolic_id {
            self.write_i32(x);
        }
        if let Some(x) = v.namespace_uri {
            self.write_i32(x);
        }
        if let Some(x) = v.localized_text {
            self.write_i32(x);
        }
        if let Some(x) = v.locale {
            self.write_i32(x);
        }
        if let Some(info) = &v.additional_info {
            self.write_string(Some(info))?;
        }
        if let Some(status) = v.inner_status_code {
            self.write_status_code(status);
        }
        if let Some(inner) = &v.inner_diagnostic_info {
            self.write_diagnostic_info(inner)?;
        }
        Ok(())
    }

    pub fn write_variant(&mut self, v: &Variant) -> Result<()> {
        match v {
            Variant::Empty => {
                self.write_u8(0);
                Ok(())
            }
            Variant::Variant(_) => Err(ProtocolError::EncodingError(
                constants::ERR_NESTED_VARIANT.into(),
            )),
            Variant::Array(array) => self.write_variant_array(array),
            scalar => {
                let type_id = scalar.type_id().map(BuiltinType::id).unwrap_or(0);
                self.write_u8(type_id);
                self.write_variant_value(scalar)
            }
        }
    }

    fn write_variant_array(&mut self, array: &Array) -> Result<()> {
        let mut mask = array.element_type.id() | VARIANT_ARRAY;
        if array.dimensions.is_some() {
            mask |= VARIANT_DIMENSIONS;
        }
        self.write_u8(mask);

        let len = self.check_length(array.values.len(), self.limits.max_array_length, "Array")?;
        self.write_i32(len);
        for value in &array.values {
            self.write_variant_value(value)?;
        }

        if let Some(dimensions) = &array.dimensions {
            self.write_array(Some(dimensions), |e, d| {
                e.write_i32(*d);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// The value of a scalar without its mask byte.
    fn write_variant_value(&mut self, v: &Variant) -> Result<()> {
        match v {
            Variant::Boolean(x) => self.write_bool(*x),
            Variant::SByte(x) => self.write_i8(*x),
            Variant::Byte(x) => self.write_u8(*x),
            Variant::Int16(x) => self.write_i16(*x),
            Variant::UInt16(x) => self.write_u16(*x),
            Variant::Int32(x) => self.write_i32(*x),
            Variant::UInt32(x) => self.write_u32(*x),
            Variant::Int64(x) => self.write_i64(*x),
            Variant::UInt64(x) => self.write_u64(*x),
            Variant::Float(x) => self.write_f32(*x),
            Variant::Double(x) => self.write_f64(*x),
            Variant::String(x) => self.write_string(x.as_deref())?,
            Variant::DateTime(x) => self.write_date_time(*x),
            Variant::Guid(x) => self.write_guid(x),
            Variant::ByteString(x) => self.write_byte_string(x)?,
            Variant::XmlElement(x) => self.write_xml_element(x)?,
            Variant::NodeId(x) => self.write_node_id(x)?,
            Variant::ExpandedNodeId(x) => self.write_expanded_node_id(x)?,
            Variant::StatusCode(x) => self.write_status_code(*x),
            Variant::QualifiedName(x) => self.write_qualified_name(x)?,
            Variant::LocalizedText(x) => self.write_localized_text(x)?,
            Variant::ExtensionObject(x) => self.write_extension_object(x)?,
            Variant::DataValue(x) => self.write_data_value(x)?,
            Variant::DiagnosticInfo(x) => self.write_diagnostic_info(x)?,
            Variant::Variant(inner) => self.write_variant(inner)?,
            Variant::Empty | Variant::Array(_) => {
                return Err(ProtocolError::EncodingError(format!(
                    "{v:?} is not a valid array element"
                )))
            }
        }
        Ok(())
    }

    /// A length-prefixed array; `None` encodes as length `-1`.
    pub fn write_array<T, F>(&mut self, values: Option<&[T]>, mut write: F) -> Result<()>
    where
        F: FnMut(&mut Self, &T) -> Result<()>,
    {
        match values {
            None => self.write_i32(-1),
            Some(values) => {
                let len = self.check_length(values.len(), self.limits.max_array_length, "Array")?;
                self.write_i32(len);
                for v in values {
                    write(self, v)?;
                }
            }
        }
        Ok(())
    }
}
