//! The self-describing `Variant` container.

use super::{
    ByteString, DataValue, DateTime, DiagnosticInfo, ExpandedNodeId, ExtensionObject, Guid,
    LocalizedText, NodeId, QualifiedName, StatusCode, XmlElement,
};
use crate::error::{constants, ProtocolError, Result};

/// Built-in type ids as carried in the low 6 bits of a Variant mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BuiltinType {
    Boolean = 1,
    SByte = 2,
    Byte = 3,
    Int16 = 4,
    UInt16 = 5,
    Int32 = 6,
    UInt32 = 7,
    Int64 = 8,
    UInt64 = 9,
    Float = 10,
    Double = 11,
    String = 12,
    DateTime = 13,
    Guid = 14,
    ByteString = 15,
    XmlElement = 16,
    NodeId = 17,
    ExpandedNodeId = 18,
    StatusCode = 19,
    QualifiedName = 20,
    LocalizedText = 21,
    ExtensionObject = 22,
    DataValue = 23,
    Variant = 24,
    DiagnosticInfo = 25,
}

impl BuiltinType {
    pub fn from_id(id: u8) -> Option<Self> {
        use BuiltinType::*;
        let t = match id {
            1 => Boolean,
            2 => SByte,
            3 => Byte,
            4 => Int16,
            5 => UInt16,
            6 => Int32,
            7 => UInt32,
            8 => Int64,
            9 => UInt64,
            10 => Float,
            11 => Double,
            12 => String,
            13 => DateTime,
            14 => Guid,
            15 => ByteString,
            16 => XmlElement,
            17 => NodeId,
            18 => ExpandedNodeId,
            19 => StatusCode,
            20 => QualifiedName,
            21 => LocalizedText,
            22 => ExtensionObject,
            23 => DataValue,
            24 => Variant,
            25 => DiagnosticInfo,
            _ => return None,
        };
        Some(t)
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// A one or multi-dimensional array of values of a single built-in type.
///
/// When `dimensions` is set the values are the flattened matrix in row-major
/// order and the product of the dimensions equals the element count.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub element_type: BuiltinType,
    pub values: Vec<Variant>,
    pub dimensions: Option<Vec<i32>>,
}

impl Array {
    pub fn new(element_type: BuiltinType, values: Vec<Variant>) -> Result<Self> {
        Self::check_elements(element_type, &values)?;
        Ok(Array {
            element_type,
            values,
            dimensions: None,
        })
    }

    /// A matrix of `values` laid out according to `dimensions`.
    pub fn matrix(
        element_type: BuiltinType,
        values: Vec<Variant>,
        dimensions: Vec<i32>,
    ) -> Result<Self> {
        Self::check_elements(element_type, &values)?;
        let expected = dimensions
            .iter()
            .try_fold(1usize, |acc, d| {
                usize::try_from(*d).ok().and_then(|d| acc.checked_mul(d))
            })
            .ok_or_else(|| ProtocolError::EncodingError(constants::ERR_MATRIX_DIMENSIONS.into()))?;
        if expected != values.len() {
            return Err(ProtocolError::EncodingError(
                constants::ERR_MATRIX_DIMENSIONS.into(),
            ));
        }
        Ok(Array {
            element_type,
            values,
            dimensions: Some(dimensions),
        })
    }

    fn check_elements(element_type: BuiltinType, values: &[Variant]) -> Result<()> {
        for v in values {
            let matches = match v.type_id() {
                Some(t) => t == element_type,
                // Empty variants are only meaningful inside Variant arrays
                None => element_type == BuiltinType::Variant,
            };
            if !matches && element_type != BuiltinType::Variant {
                return Err(ProtocolError::EncodingError(format!(
                    "array of {element_type:?} contains {:?}",
                    v.type_id()
                )));
            }
        }
        Ok(())
    }
}

/// Any built-in value, scalar or array.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Variant {
    #[default]
    Empty,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(Option<String>),
    DateTime(DateTime),
    Guid(Guid),
    ByteString(ByteString),
    XmlElement(XmlElement),
    NodeId(Box<NodeId>),
    ExpandedNodeId(Box<ExpandedNodeId>),
    StatusCode(StatusCode),
    QualifiedName(Box<QualifiedName>),
    LocalizedText(Box<LocalizedText>),
    ExtensionObject(Box<ExtensionObject>),
    DataValue(Box<DataValue>),
    /// Only valid as an element of an [`Array`] of type `Variant`.
    Variant(Box<Variant>),
    DiagnosticInfo(Box<DiagnosticInfo>),
    Array(Box<Array>),
}

impl Variant {
    /// The built-in type of a scalar, or of the elements of an array.
    pub fn type_id(&self) -> Option<BuiltinType> {
        let t = match self {
            Variant::Empty => return None,
            Variant::Boolean(_) => BuiltinType::Boolean,
            Variant::SByte(_) => BuiltinType::SByte,
            Variant::Byte(_) => BuiltinType::Byte,
            Variant::Int16(_) => BuiltinType::Int16,
            Variant::UInt16(_) => BuiltinType::UInt16,
            Variant::Int32(_) => BuiltinType::Int32,
            Variant::UInt32(_) => BuiltinType::UInt32,
            Variant::Int64(_) => BuiltinType::Int64,
            Variant::UInt64(_) => BuiltinType::UInt64,
            Variant::Float(_) => BuiltinType::Float,
            Variant::Double(_) => BuiltinType::Double,
            Variant::String(_) => BuiltinType::String,
            Variant::DateTime(_) => BuiltinType::DateTime,
            Variant::Guid(_) => BuiltinType::Guid,
            Variant::ByteString(_) => BuiltinType::ByteString,
            Variant::XmlElement(_) => BuiltinType::XmlElement,
            Variant::NodeId(_) => BuiltinType::NodeId,
            Variant::ExpandedNodeId(_) => BuiltinType::ExpandedNodeId,
            Variant::StatusCode(_) => BuiltinType::StatusCode,
            Variant::QualifiedName(_) => BuiltinType::QualifiedName,
            Variant::LocalizedText(_) => BuiltinType::LocalizedText,
            Variant::ExtensionObject(_) => BuiltinType::ExtensionObject,
            Variant::DataValue(_) => BuiltinType::DataValue,
            Variant::Variant(_) => BuiltinType::Variant,
            Variant::DiagnosticInfo(_) => BuiltinType::DiagnosticInfo,
            Variant::Array(a) => a.element_type,
        };
        Some(t)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Variant::Empty)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Variant::Array(_))
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Boolean(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int32(v)
    }
}

impl From<u32> for Variant {
    fn from(v: u32) -> Self {
        Variant::UInt32(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Double(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(Some(v.to_string()))
    }
}

impl From<NodeId> for Variant {
    fn from(v: NodeId) -> Self {
        Variant::NodeId(Box::new(v))
    }
}

impl From<Array> for Variant {
    fn from(v: Array) -> Self {
        Variant::Array(Box::new(v))
    }
}
