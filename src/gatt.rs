//! Serialized GATT requests against the connected peripheral.
//!
//! A session is opened when a connection is established and invalidated when it ends. While open, at most one
//! request is outstanding at the bridge; callers queue for their turn in submission order. Invalidation fails
//! everything queued or in flight with [`SessionInvalidated`][ErrorKind::SessionInvalidated] and ends every
//! notification stream.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::async_util::{Abort, Notifier, NotifierReceiver};
use crate::bridge::{unexpected_reply, Call, Dispatcher, Reply, RequestId};
use crate::btuuid::format_uuid;
use crate::error::{ErrorKind, FailureReason};
use crate::gatt_tree::{GattTree, ServiceEntry};
use crate::payload::{encode_data, GattPayload, GattServices, GattValue};
use crate::util::lock;
use crate::{Error, Result, Uuid};

type CharacteristicKey = (Uuid, Uuid);

#[derive(Default)]
struct GattState {
    epoch: Option<u64>,
    tree: GattTree,
    busy: bool,
    in_flight: Option<RequestId>,
    queue: VecDeque<async_channel::Sender<()>>,
    notifiers: HashMap<CharacteristicKey, Arc<Notifier<GattValue>>>,
    /// Notification disables waiting to be sent ahead of the next request.
    deferred: Vec<Call>,
}

impl GattState {
    fn check_open(&self) -> Result<u64> {
        self.epoch
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, None, "no peripheral is connected"))
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == Some(epoch)
    }

    fn value(&self, service: Uuid, characteristic: Uuid, bytes: &[u8]) -> GattValue {
        let descriptors = self
            .tree
            .find_characteristic(service, characteristic)
            .map(|c| c.descriptors.iter().map(format_uuid).collect())
            .unwrap_or_default();
        GattValue {
            uuid: format_uuid(&characteristic),
            data: encode_data(bytes),
            payload: GattPayload::Characteristic { descriptors },
        }
    }
}

pub(crate) struct GattSession {
    state: Arc<Mutex<GattState>>,
    notification_capacity: usize,
}

/// The right to have one request outstanding. Passed on to the next waiter when dropped.
struct Turn<'a> {
    session: &'a GattSession,
    epoch: u64,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.session.release(self.epoch);
    }
}

/// A queued caller. Hands an unused turn back if the caller gives up after being woken.
struct Ticket<'a> {
    session: &'a GattSession,
    epoch: u64,
    receiver: async_channel::Receiver<()>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.receiver.close();
        if self.receiver.try_recv().is_ok() {
            self.session.release(self.epoch);
        }
    }
}

impl GattSession {
    pub fn new(notification_capacity: usize) -> Self {
        GattSession {
            state: Arc::new(Mutex::new(GattState::default())),
            notification_capacity,
        }
    }

    /// Starts a fresh session for the connection identified by `epoch`.
    pub fn open(&self, epoch: u64) {
        let mut state = lock(&self.state);
        debug!("opening GATT session {epoch}");
        state.epoch = Some(epoch);
        state.tree = GattTree::default();
        state.busy = false;
        state.in_flight = None;
        state.queue.clear();
        state.deferred.clear();
    }

    /// Ends the current session. Queued and in-flight requests fail with `SessionInvalidated`.
    pub fn invalidate(&self, dispatcher: &Dispatcher) {
        let (in_flight, queued, notifiers) = {
            let mut state = lock(&self.state);
            let Some(epoch) = state.epoch.take() else {
                return;
            };
            info!("invalidating GATT session {epoch}");
            state.tree = GattTree::default();
            state.busy = false;
            state.deferred.clear();
            (
                state.in_flight.take(),
                std::mem::take(&mut state.queue),
                std::mem::take(&mut state.notifiers),
            )
        };

        if let Some(id) = in_flight {
            dispatcher.pending().abort(id, Abort::Invalidated);
        }
        debug!("flushing {} queued GATT requests", queued.len());
        drop(queued);
        for notifier in notifiers.into_values() {
            notifier.close();
        }
    }

    /// Fails with `NotConnected` unless a session is open.
    pub fn check_open(&self) -> Result<()> {
        lock(&self.state).check_open().map(|_| ())
    }

    pub fn services(&self) -> Vec<ServiceEntry> {
        lock(&self.state).tree.services().to_vec()
    }

    async fn acquire(&self) -> Result<Turn<'_>> {
        let ticket = {
            let mut state = lock(&self.state);
            let epoch = state.check_open()?;
            if !state.busy && state.queue.is_empty() {
                state.busy = true;
                return Ok(Turn { session: self, epoch });
            }
            let (sender, receiver) = async_channel::bounded(1);
            state.queue.push_back(sender);
            Ticket {
                session: self,
                epoch,
                receiver,
            }
        };

        match ticket.receiver.recv().await {
            Ok(()) => Ok(Turn {
                session: self,
                epoch: ticket.epoch,
            }),
            Err(_) => Err(ErrorKind::SessionInvalidated.into()),
        }
    }

    fn release(&self, epoch: u64) {
        let mut state = lock(&self.state);
        if !state.is_current(epoch) {
            return;
        }
        state.in_flight = None;
        while let Some(next) = state.queue.pop_front() {
            if next.try_send(()).is_ok() {
                return;
            }
        }
        state.busy = false;
    }

    /// Sends one request while holding `turn` and waits for its reply.
    async fn send(
        &self,
        turn: &Turn<'_>,
        dispatcher: &Dispatcher,
        call: Call,
        timeout: Duration,
        failed: fn(FailureReason) -> ErrorKind,
    ) -> Result<Reply> {
        let reply = dispatcher.register().map_err(|err| err.into_error(failed))?;
        {
            let mut state = lock(&self.state);
            if !state.is_current(turn.epoch) {
                return Err(ErrorKind::SessionInvalidated.into());
            }
            state.in_flight = Some(reply.id());
        }
        dispatcher.dispatch(&reply, call).map_err(|err| err.into_error(failed))?;
        dispatcher
            .finish(reply, timeout)
            .await
            .map_err(|err| err.into_error(failed))
    }

    /// Waits for a turn, then sends whatever was deferred and the call built by `build` from the current tree.
    async fn request(
        &self,
        dispatcher: &Dispatcher,
        timeout: Duration,
        failed: fn(FailureReason) -> ErrorKind,
        build: impl FnOnce(&GattTree) -> Result<Call>,
    ) -> Result<Reply> {
        let turn = self.acquire().await?;

        let deferred = std::mem::take(&mut lock(&self.state).deferred);
        for call in deferred {
            let name = call.name();
            if let Err(err) = self.send(&turn, dispatcher, call, timeout, ErrorKind::WriteFailed).await {
                warn!("deferred {name} failed: {err}");
            }
        }

        let call = build(&lock(&self.state).tree)?;
        self.send(&turn, dispatcher, call, timeout, failed).await
    }

    pub async fn discover_services(&self, dispatcher: &Dispatcher, timeout: Duration) -> Result<GattServices> {
        let turn = self.acquire().await?;
        let reply = self
            .send(&turn, dispatcher, Call::DiscoverServices, timeout, ErrorKind::DiscoveryFailed)
            .await?;
        let services = match reply {
            Reply::Services(services) => services,
            reply => return Err(unexpected_reply("discover_services", &reply)),
        };

        let mut state = lock(&self.state);
        if !state.is_current(turn.epoch) {
            return Err(ErrorKind::SessionInvalidated.into());
        }
        state.tree = GattTree::new(services);
        debug!("discovered {} services", state.tree.services().len());
        Ok(state.tree.flatten())
    }

    pub async fn read_characteristic(
        &self,
        dispatcher: &Dispatcher,
        service: Uuid,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<GattValue> {
        let reply = self
            .request(dispatcher, timeout, ErrorKind::ReadFailed, |tree| {
                tree.find_characteristic(service, characteristic)?;
                Ok(Call::ReadCharacteristic { service, characteristic })
            })
            .await?;
        match reply {
            Reply::Value(bytes) => Ok(lock(&self.state).value(service, characteristic, &bytes)),
            reply => Err(unexpected_reply("read_characteristic", &reply)),
        }
    }

    pub async fn write_characteristic(
        &self,
        dispatcher: &Dispatcher,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        timeout: Duration,
    ) -> Result<()> {
        let reply = self
            .request(dispatcher, timeout, ErrorKind::WriteFailed, |tree| {
                tree.find_characteristic(service, characteristic)?;
                Ok(Call::WriteCharacteristic {
                    service,
                    characteristic,
                    value,
                })
            })
            .await?;
        match reply {
            Reply::Done => Ok(()),
            reply => Err(unexpected_reply("write_characteristic", &reply)),
        }
    }

    pub async fn read_descriptor(
        &self,
        dispatcher: &Dispatcher,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        timeout: Duration,
    ) -> Result<GattValue> {
        let reply = self
            .request(dispatcher, timeout, ErrorKind::ReadFailed, |tree| {
                tree.find_descriptor(service, characteristic, descriptor)?;
                Ok(Call::ReadDescriptor {
                    service,
                    characteristic,
                    descriptor,
                })
            })
            .await?;
        match reply {
            Reply::Value(bytes) => Ok(GattValue {
                uuid: format_uuid(&descriptor),
                data: encode_data(&bytes),
                payload: GattPayload::Descriptor,
            }),
            reply => Err(unexpected_reply("read_descriptor", &reply)),
        }
    }

    pub async fn write_descriptor(
        &self,
        dispatcher: &Dispatcher,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
        timeout: Duration,
    ) -> Result<()> {
        let reply = self
            .request(dispatcher, timeout, ErrorKind::WriteFailed, |tree| {
                tree.find_descriptor(service, characteristic, descriptor)?;
                Ok(Call::WriteDescriptor {
                    service,
                    characteristic,
                    descriptor,
                    value,
                })
            })
            .await?;
        match reply {
            Reply::Done => Ok(()),
            reply => Err(unexpected_reply("write_descriptor", &reply)),
        }
    }

    /// Subscribes to value changes of a discovered characteristic, enabling notifications on the peripheral if
    /// this is the first subscriber. The last subscriber going away disables them again.
    pub async fn notify_characteristic(
        &self,
        dispatcher: &Dispatcher,
        service: Uuid,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<NotifierReceiver<GattValue>> {
        let key = (service, characteristic);
        let notifier = {
            let mut state = lock(&self.state);
            state.check_open()?;
            state.tree.find_characteristic(service, characteristic)?;
            let capacity = self.notification_capacity;
            state
                .notifiers
                .entry(key)
                .or_insert_with(|| Arc::new(Notifier::new(capacity)))
                .clone()
        };
        if let Some(receiver) = notifier.join() {
            return Ok(receiver);
        }

        let reply = self
            .request(dispatcher, timeout, ErrorKind::WriteFailed, |tree| {
                tree.find_characteristic(service, characteristic)?;
                Ok(Call::SetNotify {
                    service,
                    characteristic,
                    enable: true,
                })
            })
            .await?;
        if reply != Reply::Done {
            return Err(unexpected_reply("set_notify", &reply));
        }

        let epoch = {
            let state = lock(&self.state);
            match (state.epoch, state.notifiers.get(&key)) {
                (Some(epoch), Some(current)) if Arc::ptr_eq(current, &notifier) => epoch,
                _ => return Err(ErrorKind::SessionInvalidated.into()),
            }
        };
        info!("notifications enabled for {}", format_uuid(&characteristic));

        let state = Arc::downgrade(&self.state);
        Ok(notifier.subscribe_with(move || disable_later(&state, epoch, key)))
    }

    /// Routes a value change to the subscribers of that characteristic.
    pub fn on_characteristic_changed(&self, service: Uuid, characteristic: Uuid, bytes: &[u8]) {
        let (notifier, value) = {
            let state = lock(&self.state);
            match state.notifiers.get(&(service, characteristic)) {
                Some(notifier) => (notifier.clone(), state.value(service, characteristic, bytes)),
                None => {
                    debug!("ignoring change of {} without subscribers", format_uuid(&characteristic));
                    return;
                }
            }
        };
        notifier.notify(value);
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        lock(&self.state).queue.len()
    }
}

fn disable_later(state: &Weak<Mutex<GattState>>, epoch: u64, (service, characteristic): CharacteristicKey) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = lock(&state);
    if state.is_current(epoch) {
        debug!("last subscriber of {} gone", format_uuid(&characteristic));
        state.deferred.push(Call::SetNotify {
            service,
            characteristic,
            enable: false,
        });
    }
}
