//! Vendor-Specific attribute framing (RFC 2865 Section 5.26)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Type (26)   |    Length     |            Vendor-Id
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!      Vendor-Id (cont)           | Vendor type   | Vendor length |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Attribute-Specific...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Only the recommended single sub-attribute layout is produced; parsing
//! accepts the same layout.

use super::{Attribute, AttributeType};
use crate::packet::PacketError;

/// Vendor-Id + vendor type + vendor length
const VSA_HEADER_LENGTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorAttribute {
    pub vendor_id: u32,
    pub vendor_type: u8,
    pub value: Vec<u8>,
}

impl VendorAttribute {
    pub fn new(vendor_id: u32, vendor_type: u8, value: impl Into<Vec<u8>>) -> Self {
        Self {
            vendor_id,
            vendor_type,
            value: value.into(),
        }
    }

    /// Wrap into a Vendor-Specific (26) attribute
    pub fn to_attribute(&self) -> Result<Attribute, PacketError> {
        let vendor_length = self.value.len() + 2;
        if vendor_length > u8::MAX as usize {
            return Err(PacketError::AttributeError(format!(
                "Vendor attribute too long: {} bytes",
                self.value.len()
            )));
        }

        let mut value = Vec::with_capacity(VSA_HEADER_LENGTH + self.value.len());
        value.extend_from_slice(&self.vendor_id.to_be_bytes());
        value.push(self.vendor_type);
        value.push(vendor_length as u8);
        value.extend_from_slice(&self.value);

        Attribute::new(AttributeType::VendorSpecific.as_u8(), value)
    }

    /// Parse a Vendor-Specific attribute; `None` for other types or
    /// malformed vendor framing
    pub fn from_attribute(attribute: &Attribute) -> Option<Self> {
        if attribute.attr_type != AttributeType::VendorSpecific.as_u8()
            || attribute.value.len() < VSA_HEADER_LENGTH
        {
            return None;
        }

        let data = &attribute.value;
        let vendor_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let vendor_type = data[4];
        let vendor_length = data[5] as usize;
        if vendor_length < 2 || 4 + vendor_length > data.len() {
            return None;
        }

        Some(Self {
            vendor_id,
            vendor_type,
            value: data[VSA_HEADER_LENGTH..4 + vendor_length].to_vec(),
        })
    }
}
