//! Bluetooth UUIDs and their text form
//!
//! GATT identifiers cross the bridge as strings. Bluetooth SIG UUIDs built on the Bluetooth Base UUID are written
//! in their short form (`"180D"`, `"2A37"`, or eight digits for 32-bit values); every other UUID uses the
//! hyphenated lower-case form. [`parse_uuid`] accepts either, in any case.

use uuid::Uuid;

use crate::error::ErrorKind;
use crate::{Error, Result};

/// This is the Bluetooth Base UUID. It is used with 16-bit and 32-bit UUIDs
/// [defined](https://www.bluetooth.com/specifications/assigned-numbers/) by the Bluetooth SIG.
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

const BASE_MASK: u128 = (1 << 96) - 1;

/// Const function to create a 16-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u16(uuid: u16) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Const function to create a 32-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u32(uuid: u32) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Extension trait for [uuid::Uuid] with helpers for Bluetooth 16-bit and 32-bit UUIDs
pub trait BluetoothUuidExt: private::Sealed {
    /// Returns `true` if self is a valid 16-bit Bluetooth UUID
    fn is_u16_uuid(&self) -> bool;

    /// Returns `true` if self is built on the Bluetooth Base UUID
    fn is_u32_uuid(&self) -> bool;

    /// Tries to convert self into a 16-bit Bluetooth UUID
    fn try_to_u16(&self) -> Option<u16>;

    /// Tries to convert self into a 32-bit Bluetooth UUID
    fn try_to_u32(&self) -> Option<u32>;
}

impl BluetoothUuidExt for Uuid {
    fn is_u16_uuid(&self) -> bool {
        self.is_u32_uuid() && (self.as_u128() >> 112) == 0
    }

    fn is_u32_uuid(&self) -> bool {
        (self.as_u128() & BASE_MASK) == BLUETOOTH_BASE_UUID
    }

    fn try_to_u16(&self) -> Option<u16> {
        self.is_u16_uuid().then(|| (self.as_u128() >> 96) as u16)
    }

    fn try_to_u32(&self) -> Option<u32> {
        self.is_u32_uuid().then(|| (self.as_u128() >> 96) as u32)
    }
}

mod private {
    use uuid::Uuid;

    pub trait Sealed {}

    impl Sealed for Uuid {}
}

/// Parses a GATT identifier in short (`"180d"`, `"0000180D"`) or full form.
pub fn parse_uuid(text: &str) -> Result<Uuid> {
    let text = text.trim();
    let invalid = || Error::new(ErrorKind::InvalidParameter, None, format!("invalid UUID {text:?}"));
    let hex_only = text.bytes().all(|b| b.is_ascii_hexdigit());
    match text.len() {
        4 | 8 if !hex_only => Err(invalid()),
        4 => u16::from_str_radix(text, 16)
            .map(bluetooth_uuid_from_u16)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(text, 16)
            .map(bluetooth_uuid_from_u32)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(text).map_err(|e| Error::new(ErrorKind::InvalidParameter, Some(Box::new(e)), text)),
    }
}

/// Renders a UUID in the text form used on the bridge.
pub fn format_uuid(uuid: &Uuid) -> String {
    if let Some(short) = uuid.try_to_u16() {
        format!("{short:04X}")
    } else if let Some(short) = uuid.try_to_u32() {
        format!("{short:08X}")
    } else {
        uuid.hyphenated().to_string()
    }
}

/// Bluetooth GATT Service 16-bit UUIDs
pub mod services {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const GENERIC_ACCESS: Uuid = bluetooth_uuid_from_u16(0x1800);
    pub const GENERIC_ATTRIBUTE: Uuid = bluetooth_uuid_from_u16(0x1801);
    pub const DEVICE_INFORMATION: Uuid = bluetooth_uuid_from_u16(0x180A);
    pub const HEART_RATE: Uuid = bluetooth_uuid_from_u16(0x180D);
    pub const BATTERY: Uuid = bluetooth_uuid_from_u16(0x180F);
}

/// Bluetooth GATT Characteristic 16-bit UUIDs
pub mod characteristics {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const DEVICE_NAME: Uuid = bluetooth_uuid_from_u16(0x2A00);
    pub const BATTERY_LEVEL: Uuid = bluetooth_uuid_from_u16(0x2A19);
    pub const HEART_RATE_MEASUREMENT: Uuid = bluetooth_uuid_from_u16(0x2A37);
    pub const BODY_SENSOR_LOCATION: Uuid = bluetooth_uuid_from_u16(0x2A38);
    pub const HEART_RATE_CONTROL_POINT: Uuid = bluetooth_uuid_from_u16(0x2A39);
}

/// Bluetooth GATT Descriptor 16-bit UUIDs
pub mod descriptors {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = bluetooth_uuid_from_u16(0x2901);
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = bluetooth_uuid_from_u16(0x2902);
}
