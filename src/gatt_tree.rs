//! The discovered attribute table of one session.

use crate::btuuid::format_uuid;
use crate::error::ErrorKind;
use crate::payload::GattServices;
use crate::{Error, Result, Uuid};

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceEntry {
    /// The service UUID
    pub uuid: Uuid,
    /// Characteristics of this service
    pub characteristics: Vec<CharacteristicEntry>,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicEntry {
    /// The characteristic UUID
    pub uuid: Uuid,
    /// UUIDs of the descriptors of this characteristic
    pub descriptors: Vec<Uuid>,
}

impl ServiceEntry {
    /// A service with no characteristics.
    pub fn new(uuid: Uuid) -> Self {
        ServiceEntry {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Adds a characteristic with the given descriptors.
    pub fn with_characteristic(mut self, uuid: Uuid, descriptors: impl IntoIterator<Item = Uuid>) -> Self {
        self.characteristics.push(CharacteristicEntry {
            uuid,
            descriptors: descriptors.into_iter().collect(),
        });
        self
    }
}

/// Attribute table produced by the last discovery of a session. Lookups answer "was this entity discovered?".
#[derive(Debug, Clone, Default)]
pub(crate) struct GattTree {
    services: Vec<ServiceEntry>,
}

impl GattTree {
    pub fn new(services: Vec<ServiceEntry>) -> Self {
        GattTree { services }
    }

    pub fn services(&self) -> &[ServiceEntry] {
        &self.services
    }

    pub fn find_service(&self, service: Uuid) -> Result<&ServiceEntry> {
        self.services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| not_found("service", &service))
    }

    pub fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<&CharacteristicEntry> {
        self.find_service(service)?
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| not_found("characteristic", &characteristic))
    }

    pub fn find_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Result<Uuid> {
        self.find_characteristic(service, characteristic)?
            .descriptors
            .iter()
            .copied()
            .find(|d| *d == descriptor)
            .ok_or_else(|| not_found("descriptor", &descriptor))
    }

    /// Flattens the tree into the three correlated lists of the public discovery result.
    pub fn flatten(&self) -> GattServices {
        let mut flat = GattServices::default();
        for service in &self.services {
            flat.service_ids.push(format_uuid(&service.uuid));
            for char in &service.characteristics {
                flat.characteristics.push(format_uuid(&char.uuid));
                flat.descriptors.extend(char.descriptors.iter().map(format_uuid));
            }
        }
        flat
    }
}

fn not_found(what: &str, uuid: &Uuid) -> Error {
    Error::new(ErrorKind::NotFound, None, format!("{what} {} was not discovered", format_uuid(uuid)))
}
