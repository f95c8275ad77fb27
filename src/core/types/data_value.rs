//! `DataValue` and `DiagnosticInfo`, the two mask-prefixed containers.

use super::{DateTime, StatusCode, Variant};

/// A value with its quality and timestamps. Every field is optional and its
/// presence is recorded in the leading mask byte.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataValue {
    pub value: Option<Variant>,
    pub status: Option<StatusCode>,
    pub source_timestamp: Option<DateTime>,
    pub source_picoseconds: Option<u16>,
    pub server_timestamp: Option<DateTime>,
    pub server_picoseconds: Option<u16>,
}

impl DataValue {
    pub const MASK_VALUE: u8 = 0x01;
    pub const MASK_STATUS: u8 = 0x02;
    pub const MASK_SOURCE_TIMESTAMP: u8 = 0x04;
    pub const MASK_SERVER_TIMESTAMP: u8 = 0x08;
    pub const MASK_SOURCE_PICOSECONDS: u8 = 0x10;
    pub const MASK_SERVER_PICOSECONDS: u8 = 0x20;

    pub fn new(value: Variant) -> Self {
        DataValue {
            value: Some(value),
            ..Default::default()
        }
    }

    pub(crate) fn encoding_mask(&self) -> u8 {
        let mut mask = 0;
        if self.value.is_some() {
            mask |= Self::MASK_VALUE;
        }
        if self.status.is_some() {
            mask |= Self::MASK_STATUS;
        }
        if self.source_timestamp.is_some() {
            mask |= Self::MASK_SOURCE_TIMESTAMP;
        }
        if self.server_timestamp.is_some() {
            mask |= Self::MASK_SERVER_TIMESTAMP;
        }
        if self.source_picoseconds.is_some() {
            mask |= Self::MASK_SOURCE_PICOSECONDS;
        }
        if self.server_picoseconds.is_some() {
            mask |= Self::MASK_SERVER_PICOSECONDS;
        }
        mask
    }
}

/// Vendor-specific diagnostics, possibly nested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticInfo {
    pub symbolic_id: Option<i32>,
    pub namespace_uri: Option<i32>,
    pub localized_text: Option<i32>,
    pub locale: Option<i32>,
    pub additional_info: Option<String>,
    pub inner_status_code: Option<StatusCode>,
    pub inner_diagnostic_info: Option<Box<DiagnosticInfo>>,
}

impl DiagnosticInfo {
    pub const MASK_SYMBOLIC_ID: u8 = 0x01;
    pub const MASK_NAMESPACE_URI: u8 = 0x02;
    pub const MASK_LOCALIZED_TEXT: u8 = 0x04;
    pub const MASK_LOCALE: u8 = 0x08;
    pub const MASK_ADDITIONAL_INFO: u8 = 0x10;
    pub const MASK_INNER_STATUS_CODE: u8 = 0x20;
    pub const MASK_INNER_DIAGNOSTIC_INFO: u8 = 0x40;

    pub(crate) fn encoding_mask(&self) -> u8 {
        let mut mask = 0;
        if self.symbolic_id.is_some() {
            mask |= Self::MASK_SYMBOLIC_ID;
        }
        if self.namespace_uri.is_some() {
            mask |= Self::MASK_NAMESPACE_URI;
        }
        if self.localized_text.is_some() {
            mask |= Self::MASK_LOCALIZED_TEXT;
        }
        if self.locale.is_some() {
            mask |= Self::MASK_LOCALE;
        }
        if self.additional_info.is_some() {
            mask |= Self::MASK_ADDITIONAL_INFO;
        }
        if self.inner_status_code.is_some() {
            mask |= Self::MASK_INNER_STATUS_CODE;
        }
        if self.inner_diagnostic_info.is_some() {
            mask |= Self::MASK_INNER_DIAGNOSTIC_INFO;
        }
        mask
    }

    /// Nesting depth, counting this record as 1.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut current = self;
        while let Some(inner) = &current.inner_diagnostic_info {
            depth += 1;
            current = inner;
        }
        depth
    }
}
