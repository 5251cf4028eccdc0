#![warn(missing_docs)]

//! Bluecore is the platform-independent core of a [Bluetooth Low Energy] (BLE) central for [Rust].
//!
//! The radio and the OS permission model belong to the host platform, which plugs in through the [`Bridge`]
//! trait. On top of it, a [`CentralSession`] turns overlapping, failure-prone platform callbacks into a small set
//! of race-free state machines: a permission gate, a scanner, a single peripheral connection, and a serialized
//! GATT request queue bound to that connection.
//!
//! [Rust]: https://www.rust-lang.org/
//! [Bluetooth Low Energy]: https://www.bluetooth.com/specifications/specs/
//!
//! # Usage
//!
//! ```rust,no_run
//!# use std::sync::Arc;
//!# use bluecore::{CentralSession, SessionConfig, mock::MockBridge};
//!# use futures_lite::StreamExt;
//!# async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!let session = CentralSession::initialize(Arc::new(MockBridge::new()), SessionConfig::default())?;
//!session.request_scan_permissions().await?;
//!
//!let mut advertisements = session.advertisements()?;
//!session.start_scan_by_company_id(&[0x0059]).await?;
//!let device = advertisements.next().await.ok_or("scan ended")?;
//!session.stop_scan().await?;
//!
//!session.connect(device.id).await?;
//!let services = session.discover_services().await?;
//!println!("services: {:?}", services.service_ids);
//!let level = session.read_characteristic("180F", "2A19").await?;
//!println!("battery: {}", level.data);
//!session.disconnect().await?;
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! - Permissions: [check][CentralSession::check_scan_permission] without prompting,
//!   [request][CentralSession::request_scan_permissions] with a prompt
//! - Discovery: [start][CentralSession::start_scan] or [filter][CentralSession::start_scan_by_company_id] a scan,
//!   receive [advertisements][CentralSession::advertisements]
//! - Connection: [connect][CentralSession::connect] to one peripheral at a time,
//!   [disconnect][CentralSession::disconnect], watch [connection events][CentralSession::connection_events]
//! - GATT: [discover][CentralSession::discover_services] services, [read][CentralSession::read_characteristic]
//!   and [write][CentralSession::write_characteristic] characteristics and descriptors,
//!   [subscribe][CentralSession::notify_characteristic] to notifications
//!
//! # Identifiers and payloads
//!
//! Attributes are named by UUID strings. Bluetooth SIG UUIDs may be given in their short form (`"180D"`); the
//! session reports them the same way. Attribute values travel as lower-case hexadecimal text, see [`payload`].
//!
//! # Asynchronous runtimes
//!
//! Timeouts run on a timer thread, so the session works under any executor.
//!
//! # Feature flags
//!
//! The `serde` feature enables serializing/deserializing [`SessionConfig`], [`PeripheralId`] and the value types.

pub mod bridge;
pub mod btuuid;
pub mod config;
pub mod connection;
pub mod error;
pub mod gatt_tree;
pub mod mock;
pub mod payload;
pub mod scanner;

mod async_util;
mod gatt;
mod permission;
mod session;
mod util;

use std::collections::HashMap;

pub use async_util::NotifierReceiver;
pub use bridge::{Bridge, BridgeEvent, Call, CallFailure, PermissionKind, PermissionStatus, Reply, RequestId};
pub use btuuid::BluetoothUuidExt;
pub use config::SessionConfig;
pub use connection::{ConnectionEvent, ConnectionState, DisconnectCause};
pub use error::{Error, ErrorKind, FailureReason};
pub use gatt_tree::{CharacteristicEntry, ServiceEntry};
pub use payload::{GattPayload, GattServices, GattValue};
pub use scanner::ScanFilter;
pub use session::{BridgeHandle, CentralSession};
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Opaque identifier of a peripheral, as reported by the platform while scanning.
///
/// Only meaningful for the scan and connect cycle it came from; platforms are free to change it across restarts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(transparent))]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wraps a platform identifier.
    pub fn new(id: impl Into<String>) -> Self {
        PeripheralId(id.into())
    }

    /// The platform identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        PeripheralId::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        PeripheralId(id)
    }
}

/// Represents a device discovered during a scan operation
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisingDevice {
    /// The source of the advertisement
    pub id: PeripheralId,
    /// The advertisment data
    pub adv_data: AdvertisementData,
    /// The signal strength in dBm of the received advertisement packet
    pub rssi: Option<i16>,
}

/// Data included in a Bluetooth advertisement or scan reponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementData {
    /// The (possibly shortened) local name of the device (CSS §A.1.2)
    pub local_name: Option<String>,
    /// Manufacturer specific data entries (CSS §A.1.4)
    pub manufacturer_data: Vec<ManufacturerData>,
    /// Advertised GATT service UUIDs (CSS §A.1.1)
    pub services: Vec<Uuid>,
    /// Service associated data (CSS §A.1.11)
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Transmitted power level (CSS §A.1.5)
    pub tx_power_level: Option<i16>,
    /// Set to true for connectable advertising packets
    pub is_connectable: bool,
}

/// Manufacturer specific data included in Bluetooth advertisements. See the Bluetooth Core Specification Supplement
/// §A.1.4 for details.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManufacturerData {
    /// Company identifier (defined [here](https://www.bluetooth.com/specifications/assigned-numbers/company-identifiers/))
    pub company_id: u16,
    /// Manufacturer specific data
    pub data: Vec<u8>,
}
