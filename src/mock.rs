//! An in-memory [`Bridge`] for tests and demos.
//!
//! [`MockBridge`] plays both the platform and the peripherals: it keeps a GATT table per peripheral, stores
//! written values so they read back, and answers every call synchronously from inside `dispatch`. Switching to
//! held mode with [`hold_replies`][MockBridge::hold_replies] parks calls instead, so tests can interleave
//! operations and answer them in any order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_timer::Delay;
use tracing::debug;

use crate::bridge::{Bridge, BridgeEvent, Call, CallFailure, PermissionKind, PermissionStatus, Reply, RequestId};
use crate::btuuid::{characteristics, descriptors, services};
use crate::gatt_tree::ServiceEntry;
use crate::util::lock;
use crate::{AdvertisementData, AdvertisingDevice, BridgeHandle, ManufacturerData, PeripheralId, Uuid};

type AttributeKey = (Uuid, Uuid, Option<Uuid>);

#[derive(Debug)]
struct MockState {
    granted: HashSet<PermissionKind>,
    prompt: PermissionStatus,
    peripherals: HashMap<PeripheralId, Vec<ServiceEntry>>,
    values: HashMap<AttributeKey, Vec<u8>>,
    connected: Option<PeripheralId>,
    scanning: bool,
    hold: bool,
    held: Vec<(RequestId, Call)>,
    calls: Vec<Call>,
    failures: VecDeque<(&'static str, CallFailure)>,
}

/// Scripted platform with in-memory peripherals.
#[derive(Debug)]
pub struct MockBridge {
    available: bool,
    handle: Mutex<Option<BridgeHandle>>,
    state: Mutex<MockState>,
}

impl Default for MockBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBridge {
    /// An available platform with no permissions granted and no peripherals. Prompts are answered with
    /// [`PermissionStatus::Granted`].
    pub fn new() -> Self {
        MockBridge {
            available: true,
            handle: Mutex::new(None),
            state: Mutex::new(MockState {
                granted: HashSet::new(),
                prompt: PermissionStatus::Granted,
                peripherals: HashMap::new(),
                values: HashMap::new(),
                connected: None,
                scanning: false,
                hold: false,
                held: Vec::new(),
                calls: Vec::new(),
                failures: VecDeque::new(),
            }),
        }
    }

    /// A platform whose native module is missing.
    pub fn unavailable() -> Self {
        MockBridge {
            available: false,
            ..Self::new()
        }
    }

    /// Adds a heart rate monitor: Heart Rate (measurement with a CCCD, body sensor location) and Battery services.
    pub fn with_heart_rate_monitor(self, id: &str) -> Self {
        self.add_peripheral(
            id,
            vec![
                ServiceEntry::new(services::HEART_RATE)
                    .with_characteristic(
                        characteristics::HEART_RATE_MEASUREMENT,
                        [descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION],
                    )
                    .with_characteristic(characteristics::BODY_SENSOR_LOCATION, [])
                    .with_characteristic(characteristics::HEART_RATE_CONTROL_POINT, []),
                ServiceEntry::new(services::BATTERY).with_characteristic(
                    characteristics::BATTERY_LEVEL,
                    [descriptors::CHARACTERISTIC_USER_DESCRIPTION],
                ),
            ],
        );
        self.set_value(services::HEART_RATE, characteristics::BODY_SENSOR_LOCATION, None, vec![0x01]);
        self.set_value(services::BATTERY, characteristics::BATTERY_LEVEL, None, vec![0x64]);
        self.set_value(
            services::BATTERY,
            characteristics::BATTERY_LEVEL,
            Some(descriptors::CHARACTERISTIC_USER_DESCRIPTION),
            b"battery".to_vec(),
        );
        self
    }

    /// Registers a connectable peripheral with the given GATT table.
    pub fn add_peripheral(&self, id: &str, table: Vec<ServiceEntry>) {
        lock(&self.state).peripherals.insert(PeripheralId::new(id), table);
    }

    /// Stores the value a read of the attribute returns. `descriptor` selects a descriptor of the characteristic.
    pub fn set_value(&self, service: Uuid, characteristic: Uuid, descriptor: Option<Uuid>, value: Vec<u8>) {
        lock(&self.state)
            .values
            .insert((service, characteristic, descriptor), value);
    }

    /// The value currently stored for an attribute.
    pub fn value(&self, service: Uuid, characteristic: Uuid, descriptor: Option<Uuid>) -> Option<Vec<u8>> {
        lock(&self.state)
            .values
            .get(&(service, characteristic, descriptor))
            .cloned()
    }

    /// Grants `kind` without a prompt.
    pub fn grant(&self, kind: PermissionKind) {
        lock(&self.state).granted.insert(kind);
    }

    /// Withdraws `kind`.
    pub fn revoke(&self, kind: PermissionKind) {
        lock(&self.state).granted.remove(&kind);
    }

    /// How the next permission prompts are answered.
    pub fn answer_prompts_with(&self, status: PermissionStatus) {
        lock(&self.state).prompt = status;
    }

    /// Makes the next call named `call` (see [`Call::name`]) fail with `failure`.
    pub fn fail_next(&self, call: &'static str, failure: CallFailure) {
        lock(&self.state).failures.push_back((call, failure));
    }

    /// In held mode calls are parked until [`release`][Self::release]d or [`reply`][Self::reply]ed.
    pub fn hold_replies(&self, hold: bool) {
        lock(&self.state).hold = hold;
    }

    /// The parked calls, oldest first.
    pub fn held(&self) -> Vec<(RequestId, Call)> {
        lock(&self.state).held.clone()
    }

    /// Waits until a call named `call` is parked and returns its id.
    pub async fn wait_held(&self, call: &str) -> RequestId {
        loop {
            let found = lock(&self.state)
                .held
                .iter()
                .find(|(_, c)| c.name() == call)
                .map(|(id, _)| *id);
            if let Some(id) = found {
                return id;
            }
            Delay::new(Duration::from_millis(1)).await;
        }
    }

    /// Answers a parked call the way it would have been answered right away. Returns whether the session took
    /// the reply.
    pub fn release(&self, id: RequestId) -> bool {
        let reply = {
            let mut state = lock(&self.state);
            let Some(pos) = state.held.iter().position(|(held, _)| *held == id) else {
                return false;
            };
            let (_, call) = state.held.remove(pos);
            state.answer(&call)
        };
        self.reply(id, reply)
    }

    /// Answers every parked call in order.
    pub fn release_all(&self) {
        let ids: Vec<RequestId> = lock(&self.state).held.iter().map(|(id, _)| *id).collect();
        for id in ids {
            self.release(id);
        }
    }

    /// Sends `reply` for request `id`, parked or not. Returns whether the session took it.
    pub fn reply(&self, id: RequestId, reply: Reply) -> bool {
        lock(&self.state).held.retain(|(held, _)| *held != id);
        let handle = lock(&self.handle).clone();
        match handle {
            Some(handle) => handle.complete(id, reply),
            None => false,
        }
    }

    /// Every call dispatched so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.state).calls.clone()
    }

    /// Whether a session is attached.
    pub fn is_attached(&self) -> bool {
        lock(&self.handle).is_some()
    }

    /// Whether the platform scan is running.
    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    /// The peripheral the platform considers connected.
    pub fn connected(&self) -> Option<PeripheralId> {
        lock(&self.state).connected.clone()
    }

    /// Delivers an advertisement from `id` carrying manufacturer data of `company_id`.
    pub fn advertise(&self, id: &str, company_id: u16, data: Vec<u8>) {
        self.emit(BridgeEvent::Advertisement(AdvertisingDevice {
            id: PeripheralId::new(id),
            adv_data: AdvertisementData {
                local_name: Some(format!("mock {id}")),
                manufacturer_data: vec![ManufacturerData { company_id, data }],
                is_connectable: true,
                ..Default::default()
            },
            rssi: Some(-55),
        }));
    }

    /// Drops the link to the connected peripheral, as if it went out of range.
    pub fn drop_link(&self) {
        let connected = lock(&self.state).connected.take();
        if let Some(id) = connected {
            self.emit(BridgeEvent::LinkLost(id));
        }
    }

    /// Changes a characteristic value and reports the change.
    pub fn notify(&self, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        self.set_value(service, characteristic, None, value.clone());
        self.emit(BridgeEvent::CharacteristicChanged {
            service,
            characteristic,
            value,
        });
    }

    /// Switches the adapter off.
    pub fn adapter_off(&self) {
        {
            let mut state = lock(&self.state);
            state.scanning = false;
            state.connected = None;
        }
        self.emit(BridgeEvent::AdapterOff);
    }

    /// Pushes an arbitrary event.
    pub fn emit(&self, event: BridgeEvent) {
        let handle = lock(&self.handle).clone();
        match handle {
            Some(handle) => handle.emit(event),
            None => debug!("no session attached for {event:?}"),
        }
    }
}

impl MockState {
    fn answer(&mut self, call: &Call) -> Reply {
        if let Some(pos) = self.failures.iter().position(|(name, _)| *name == call.name()) {
            if let Some((_, failure)) = self.failures.remove(pos) {
                return Reply::Failed(failure);
            }
        }

        match call {
            Call::RequestPermission(kind) => {
                if self.prompt == PermissionStatus::Granted {
                    self.granted.insert(*kind);
                }
                Reply::Permission(self.prompt)
            }
            Call::StartScan { .. } => {
                self.scanning = true;
                Reply::Done
            }
            Call::StopScan => {
                self.scanning = false;
                Reply::Done
            }
            Call::Connect { peripheral } => {
                if self.peripherals.contains_key(peripheral) {
                    self.connected = Some(peripheral.clone());
                    Reply::Done
                } else {
                    Reply::Failed(CallFailure::Rejected(format!("unknown peripheral {peripheral}")))
                }
            }
            Call::Disconnect => {
                self.connected = None;
                Reply::Done
            }
            Call::DiscoverServices => match self.connected.as_ref().and_then(|id| self.peripherals.get(id)) {
                Some(table) => Reply::Services(table.clone()),
                None => Reply::Failed(CallFailure::Rejected("not connected".into())),
            },
            Call::ReadCharacteristic { service, characteristic } => {
                self.read((*service, *characteristic, None))
            }
            Call::WriteCharacteristic {
                service,
                characteristic,
                value,
            } => self.write((*service, *characteristic, None), value),
            Call::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            } => self.read((*service, *characteristic, Some(*descriptor))),
            Call::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                value,
            } => self.write((*service, *characteristic, Some(*descriptor)), value),
            Call::SetNotify {
                service,
                characteristic,
                enable,
            } => {
                let cccd = if *enable { vec![0x01, 0x00] } else { vec![0x00, 0x00] };
                self.write(
                    (
                        *service,
                        *characteristic,
                        Some(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION),
                    ),
                    &cccd,
                )
            }
        }
    }

    fn read(&self, key: AttributeKey) -> Reply {
        if self.connected.is_none() {
            return Reply::Failed(CallFailure::Rejected("not connected".into()));
        }
        Reply::Value(self.values.get(&key).cloned().unwrap_or_default())
    }

    fn write(&mut self, key: AttributeKey, value: &[u8]) -> Reply {
        if self.connected.is_none() {
            return Reply::Failed(CallFailure::Rejected("not connected".into()));
        }
        self.values.insert(key, value.to_vec());
        Reply::Done
    }
}

#[async_trait]
impl Bridge for MockBridge {
    fn is_available(&self) -> bool {
        self.available
    }

    fn attach(&self, handle: BridgeHandle) {
        *lock(&self.handle) = Some(handle);
    }

    fn detach(&self) {
        lock(&self.handle).take();
    }

    async fn check_permission(&self, kind: PermissionKind) -> bool {
        lock(&self.state).granted.contains(&kind)
    }

    fn dispatch(&self, id: RequestId, call: Call) -> Result<(), CallFailure> {
        let reply = {
            let mut state = lock(&self.state);
            state.calls.push(call.clone());
            if state.hold {
                state.held.push((id, call));
                return Ok(());
            }
            state.answer(&call)
        };
        self.reply(id, reply);
        Ok(())
    }
}
