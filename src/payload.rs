//! GATT values as they cross the public surface
//!
//! Attribute values are opaque bytes. On the public surface they travel as text: lower-case hexadecimal, two
//! digits per byte, no separators. Decoding accepts either case; encoding always produces the canonical
//! lower-case form, so a canonical string written to an attribute and read back is returned unchanged.

use crate::error::ErrorKind;
use crate::{Error, Result};

/// Decodes a hex payload.
pub fn decode_data(data: &str) -> Result<Vec<u8>> {
    hex::decode(data.trim())
        .map_err(|e| Error::new(ErrorKind::InvalidParameter, Some(Box::new(e)), "payload is not hex"))
}

/// Encodes bytes as a canonical hex payload.
pub fn encode_data(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Flat result of a full service discovery.
///
/// The three lists are correlated only by the identifiers they contain; group them with
/// [`CentralSession::services`][crate::CentralSession::services] if a tree is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct GattServices {
    /// Every discovered service UUID
    pub service_ids: Vec<String>,
    /// Every discovered characteristic UUID, in service order
    pub characteristics: Vec<String>,
    /// Every discovered descriptor UUID, in characteristic order
    pub descriptors: Vec<String>,
}

/// What kind of attribute a [`GattValue`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GattPayload {
    /// A characteristic value, with the UUIDs of the descriptors discovered under it
    Characteristic {
        /// Descriptor UUIDs of this characteristic
        descriptors: Vec<String>,
    },
    /// A descriptor value
    Descriptor,
}

/// The value of a characteristic or descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattValue {
    /// UUID of the attribute that produced the value
    pub uuid: String,
    /// Hex-encoded value
    pub data: String,
    /// Attribute kind
    pub payload: GattPayload,
}

impl GattValue {
    /// Decodes [`data`][Self::data] back into bytes.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        decode_data(&self.data)
    }

    /// `true` when this value was read from a descriptor.
    pub fn is_descriptor(&self) -> bool {
        matches!(self.payload, GattPayload::Descriptor)
    }
}
