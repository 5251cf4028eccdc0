use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info};

use crate::bridge::{Bridge, BridgeEvent, Call, Dispatcher, PermissionKind, Reply, RequestId};
use crate::btuuid::parse_uuid;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, DisconnectCause};
use crate::error::ErrorKind;
use crate::gatt::GattSession;
use crate::gatt_tree::ServiceEntry;
use crate::payload::{decode_data, GattServices, GattValue};
use crate::scanner::{ScanFilter, Scanner};
use crate::{permission, AdvertisingDevice, Error, NotifierReceiver, PeripheralId, Result, SessionConfig};

struct SessionInner {
    dispatcher: Dispatcher,
    config: SessionConfig,
    scanner: Scanner,
    connection: ConnectionManager,
    gatt: GattSession,
    closed: AtomicBool,
}

impl SessionInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down central session");

        let dispatcher = &self.dispatcher;
        if self.scanner.is_discovering() {
            dispatcher.send_and_forget(Call::StopScan);
        }
        if self.connection.state() != ConnectionState::Disconnected {
            dispatcher.send_and_forget(Call::Disconnect);
        }
        self.connection
            .drop_link(dispatcher, &self.gatt, None, DisconnectCause::Shutdown);
        self.scanner.close();
        self.connection.close();
        dispatcher.pending().close();
        dispatcher.bridge().detach();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A Bluetooth LE central session on top of a host [`Bridge`].
///
/// The session owns the scanner, the single peripheral connection, and the GATT request queue of that
/// connection. It is cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct CentralSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for CentralSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralSession")
            .field("scanning", &self.inner.scanner.is_discovering())
            .field("connection", &self.inner.connection.state())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl CentralSession {
    /// Creates a session on top of `bridge` and attaches it.
    ///
    /// Fails with [`BridgeUnavailable`][ErrorKind::BridgeUnavailable] if the native side is missing.
    pub fn initialize(bridge: Arc<dyn Bridge>, config: SessionConfig) -> Result<Self> {
        if !bridge.is_available() {
            return Err(Error::new(
                ErrorKind::BridgeUnavailable,
                None,
                "the native Bluetooth module is not linked",
            ));
        }

        let inner = Arc::new(SessionInner {
            dispatcher: Dispatcher::new(bridge.clone()),
            scanner: Scanner::new(config.advertisement_capacity),
            connection: ConnectionManager::new(),
            gatt: GattSession::new(config.notification_capacity),
            config,
            closed: AtomicBool::new(false),
        });
        bridge.attach(BridgeHandle {
            inner: Arc::downgrade(&inner),
        });
        info!("central session initialized");
        Ok(CentralSession { inner })
    }

    /// Drops the connection and detaches from the bridge.
    ///
    /// A pending connect fails with [`BridgeUnavailable`][ErrorKind::BridgeUnavailable] and GATT requests with
    /// [`SessionInvalidated`][ErrorKind::SessionInvalidated]. Every stream ends. Later operations fail with
    /// `BridgeUnavailable`.
    pub fn shutdown(&self) {
        self.inner.close();
    }

    /// The configuration this session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn live(&self) -> Result<&SessionInner> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::new(
                ErrorKind::BridgeUnavailable,
                None,
                "the session has been shut down",
            ))
        } else {
            Ok(&*self.inner)
        }
    }

    /// Checks whether scanning is authorized. Never prompts; `false` after shutdown.
    pub async fn check_scan_permission(&self) -> bool {
        match self.live() {
            Ok(inner) => permission::check(&inner.dispatcher, PermissionKind::Scan).await,
            Err(_) => false,
        }
    }

    /// Checks whether advertising is authorized. Never prompts; `false` after shutdown.
    pub async fn check_advertise_permission(&self) -> bool {
        match self.live() {
            Ok(inner) => permission::check(&inner.dispatcher, PermissionKind::Advertise).await,
            Err(_) => false,
        }
    }

    /// Prompts for scanning authorization unless it is already granted.
    pub async fn request_scan_permissions(&self) -> Result<()> {
        let inner = self.live()?;
        permission::request(&inner.dispatcher, PermissionKind::Scan, inner.config.permission_timeout).await
    }

    /// Prompts for advertising authorization unless it is already granted.
    pub async fn request_advertise_permission(&self) -> Result<()> {
        let inner = self.live()?;
        permission::request(&inner.dispatcher, PermissionKind::Advertise, inner.config.permission_timeout).await
    }

    /// Starts an unfiltered scan.
    ///
    /// Succeeds without doing anything if an unfiltered scan is already running; fails with
    /// [`ScanAlreadyActive`][ErrorKind::ScanAlreadyActive] if a filtered one is.
    pub async fn start_scan(&self) -> Result<()> {
        self.start_scan_with(ScanFilter::any()).await
    }

    /// Starts a scan restricted to advertisements with manufacturer data from one of `company_ids`.
    pub async fn start_scan_by_company_id(&self, company_ids: &[u16]) -> Result<()> {
        self.start_scan_with(ScanFilter::by_company_id(company_ids.iter().copied()))
            .await
    }

    async fn start_scan_with(&self, filter: ScanFilter) -> Result<()> {
        let inner = self.live()?;
        inner
            .scanner
            .start(&inner.dispatcher, filter, inner.config.scan_timeout)
            .await
    }

    /// Stops the running scan. Does nothing when idle.
    pub async fn stop_scan(&self) -> Result<()> {
        let inner = self.live()?;
        inner.scanner.stop(&inner.dispatcher, inner.config.scan_timeout).await
    }

    /// `true` while a scan is running.
    pub fn is_discovering(&self) -> bool {
        self.inner.scanner.is_discovering()
    }

    /// Stream of the advertisements accepted by the running scan.
    pub fn advertisements(&self) -> Result<NotifierReceiver<AdvertisingDevice>> {
        Ok(self.live()?.scanner.advertisements())
    }

    /// Connects to a peripheral seen during a scan.
    ///
    /// Fails with [`PermissionDenied`][ErrorKind::PermissionDenied] without the scan permission, and with
    /// [`ConnectionBusy`][ErrorKind::ConnectionBusy] unless disconnected. Dropping the returned future abandons the
    /// attempt.
    pub async fn connect(&self, identifier: impl Into<PeripheralId>) -> Result<()> {
        let inner = self.live()?;
        let peripheral = identifier.into();
        if !permission::check(&inner.dispatcher, PermissionKind::Scan).await {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                None,
                "connecting requires the scan permission",
            ));
        }
        if peripheral.as_str().is_empty() {
            return Err(Error::new(ErrorKind::InvalidParameter, None, "empty peripheral identifier"));
        }
        inner
            .connection
            .connect(&inner.dispatcher, &inner.gatt, peripheral, inner.config.connect_timeout)
            .await
    }

    /// Disconnects, or aborts a connect attempt. Always ends disconnected, even if the platform reports an error.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = self.live()?;
        inner
            .connection
            .disconnect(&inner.dispatcher, &inner.gatt, inner.config.disconnect_timeout)
            .await
    }

    /// Current state of the connection manager.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// The connected peripheral, if any.
    pub fn connected_peripheral(&self) -> Option<PeripheralId> {
        self.inner.connection.connected_peripheral()
    }

    /// Stream of connection lifecycle events.
    pub fn connection_events(&self) -> Result<NotifierReceiver<ConnectionEvent>> {
        Ok(self.live()?.connection.events())
    }

    /// Enumerates every service, characteristic and descriptor of the connected peripheral.
    ///
    /// Runs a fresh discovery on every call; the result replaces the tree used to validate later requests.
    pub async fn discover_services(&self) -> Result<GattServices> {
        let inner = self.live()?;
        inner
            .gatt
            .discover_services(&inner.dispatcher, inner.config.discovery_timeout)
            .await
    }

    /// The tree found by the last discovery of the current connection.
    pub fn services(&self) -> Vec<ServiceEntry> {
        self.inner.gatt.services()
    }

    /// Reads a characteristic value.
    pub async fn read_characteristic(&self, service_id: &str, uuid: &str) -> Result<GattValue> {
        let inner = self.live()?;
        inner.gatt.check_open()?;
        let (service, characteristic) = (parse_uuid(service_id)?, parse_uuid(uuid)?);
        inner
            .gatt
            .read_characteristic(&inner.dispatcher, service, characteristic, inner.config.gatt_timeout)
            .await
    }

    /// Writes a hex-encoded value to a characteristic, with response.
    pub async fn write_characteristic(&self, service_id: &str, uuid: &str, data: &str) -> Result<()> {
        let inner = self.live()?;
        inner.gatt.check_open()?;
        let (service, characteristic) = (parse_uuid(service_id)?, parse_uuid(uuid)?);
        let value = decode_data(data)?;
        inner
            .gatt
            .write_characteristic(&inner.dispatcher, service, characteristic, value, inner.config.gatt_timeout)
            .await
    }

    /// Reads a descriptor value.
    pub async fn read_descriptor(&self, service_id: &str, characteristic_id: &str, uuid: &str) -> Result<GattValue> {
        let inner = self.live()?;
        inner.gatt.check_open()?;
        let service = parse_uuid(service_id)?;
        let characteristic = parse_uuid(characteristic_id)?;
        let descriptor = parse_uuid(uuid)?;
        inner
            .gatt
            .read_descriptor(
                &inner.dispatcher,
                service,
                characteristic,
                descriptor,
                inner.config.gatt_timeout,
            )
            .await
    }

    /// Writes a hex-encoded value to a descriptor.
    pub async fn write_descriptor(
        &self,
        service_id: &str,
        characteristic_id: &str,
        uuid: &str,
        data: &str,
    ) -> Result<()> {
        let inner = self.live()?;
        inner.gatt.check_open()?;
        let service = parse_uuid(service_id)?;
        let characteristic = parse_uuid(characteristic_id)?;
        let descriptor = parse_uuid(uuid)?;
        let value = decode_data(data)?;
        inner
            .gatt
            .write_descriptor(
                &inner.dispatcher,
                service,
                characteristic,
                descriptor,
                value,
                inner.config.gatt_timeout,
            )
            .await
    }

    /// Enables notifications on a characteristic and streams its value changes.
    ///
    /// Dropping the last stream for a characteristic disables its notifications. Streams end when the connection
    /// does.
    pub async fn notify_characteristic(&self, service_id: &str, uuid: &str) -> Result<NotifierReceiver<GattValue>> {
        let inner = self.live()?;
        inner.gatt.check_open()?;
        let (service, characteristic) = (parse_uuid(service_id)?, parse_uuid(uuid)?);
        inner
            .gatt
            .notify_characteristic(&inner.dispatcher, service, characteristic, inner.config.gatt_timeout)
            .await
    }
}

/// The bridge's way back into a [`CentralSession`].
///
/// Holds the session weakly: once every `CentralSession` clone is gone, replies and events are discarded.
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Weak<SessionInner>,
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl BridgeHandle {
    /// Delivers the reply to request `id`. Returns `false` if the reply was discarded, because the request had
    /// already been resolved or the session is gone.
    pub fn complete(&self, id: RequestId, reply: Reply) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.dispatcher.pending().complete(id, reply),
            None => {
                debug!("dropping reply to {id}: session is gone");
                false
            }
        }
    }

    /// Reports something the platform observed on its own.
    pub fn emit(&self, event: BridgeEvent) {
        let Some(inner) = self.inner.upgrade() else {
            debug!("dropping {event:?}: session is gone");
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            debug!("dropping {event:?}: session is shut down");
            return;
        }

        match event {
            BridgeEvent::Advertisement(device) => inner.scanner.on_advertisement(device),
            BridgeEvent::LinkLost(peripheral) => {
                inner
                    .connection
                    .drop_link(&inner.dispatcher, &inner.gatt, Some(&peripheral), DisconnectCause::LinkLost)
            }
            BridgeEvent::CharacteristicChanged {
                service,
                characteristic,
                value,
            } => inner.gatt.on_characteristic_changed(service, characteristic, &value),
            BridgeEvent::AdapterOff => {
                inner.scanner.on_adapter_off();
                inner
                    .connection
                    .drop_link(&inner.dispatcher, &inner.gatt, None, DisconnectCause::AdapterOff);
            }
        }
    }
}
