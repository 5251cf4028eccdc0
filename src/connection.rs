//! The single peripheral connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::async_util::{Abort, Notifier, NotifierReceiver};
use crate::bridge::{unexpected_reply, Call, CallError, Dispatcher, Reply, RequestId};
use crate::error::{ErrorKind, FailureReason};
use crate::gatt::GattSession;
use crate::util::{defer, lock};
use crate::{Error, PeripheralId, Result};

/// Where the connection manager stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No link and no attempt
    Disconnected,
    /// A connect attempt is waiting for the platform
    Connecting,
    /// A link is established and GATT requests are accepted
    Connected,
    /// A disconnect is waiting for the platform
    Disconnecting,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectCause {
    /// [`disconnect`][crate::CentralSession::disconnect] was called
    Requested,
    /// The link dropped on its own
    LinkLost,
    /// The Bluetooth adapter was switched off
    AdapterOff,
    /// The session was shut down
    Shutdown,
}

/// Connection lifecycle notifications. Every `Disconnected` follows a `Connected` for the same peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A link was established
    Connected(PeripheralId),
    /// An established link ended
    Disconnected {
        /// The peripheral that was connected
        id: PeripheralId,
        /// Why the link ended
        cause: DisconnectCause,
    },
}

#[derive(Debug)]
enum Link {
    Disconnected,
    Connecting {
        peripheral: PeripheralId,
        epoch: u64,
        request: RequestId,
    },
    Connected {
        peripheral: PeripheralId,
        epoch: u64,
    },
    Disconnecting {
        peripheral: PeripheralId,
        was_connected: bool,
    },
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting { .. } => ConnectionState::Connecting,
            Link::Connected { .. } => ConnectionState::Connected,
            Link::Disconnecting { .. } => ConnectionState::Disconnecting,
        }
    }
}

const EVENT_CAPACITY: usize = 16;

pub(crate) struct ConnectionManager {
    link: Mutex<Link>,
    next_epoch: AtomicU64,
    teardown: async_lock::Mutex<()>,
    events: Notifier<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager {
            link: Mutex::new(Link::Disconnected),
            next_epoch: AtomicU64::new(1),
            teardown: async_lock::Mutex::new(()),
            events: Notifier::new(EVENT_CAPACITY),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.link).state()
    }

    pub fn connected_peripheral(&self) -> Option<PeripheralId> {
        match &*lock(&self.link) {
            Link::Connected { peripheral, .. } => Some(peripheral.clone()),
            _ => None,
        }
    }

    pub fn events(&self) -> NotifierReceiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn connect(
        &self,
        dispatcher: &Dispatcher,
        gatt: &GattSession,
        peripheral: PeripheralId,
        timeout: Duration,
    ) -> Result<()> {
        let reply = dispatcher
            .register()
            .map_err(|err| err.into_error(ErrorKind::ConnectionFailed))?;

        let epoch = {
            let mut link = lock(&self.link);
            if !matches!(*link, Link::Disconnected) {
                return Err(Error::new(
                    ErrorKind::ConnectionBusy,
                    None,
                    format!("connection manager is {:?}", link.state()),
                ));
            }
            let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
            *link = Link::Connecting {
                peripheral: peripheral.clone(),
                epoch,
                request: reply.id(),
            };
            epoch
        };
        info!("connecting to {peripheral} (session {epoch})");

        let rollback = defer(|| {
            if self.reset_attempt(epoch) {
                warn!("connect to {peripheral} abandoned");
                dispatcher.send_and_forget(Call::Disconnect);
            }
        });

        let outcome = match dispatcher.dispatch(
            &reply,
            Call::Connect {
                peripheral: peripheral.clone(),
            },
        ) {
            Ok(()) => dispatcher.finish(reply, timeout).await,
            Err(err) => Err(err),
        };
        rollback.defuse();

        match outcome {
            Ok(Reply::Done) => {
                let mut link = lock(&self.link);
                match &*link {
                    Link::Connecting { epoch: current, .. } if *current == epoch => (),
                    // a disconnect took over after the platform answered
                    _ => return Err(ErrorKind::ConnectionFailed(FailureReason::Cancelled).into()),
                }
                *link = Link::Connected {
                    peripheral: peripheral.clone(),
                    epoch,
                };
                gatt.open(epoch);
                self.events.notify(ConnectionEvent::Connected(peripheral.clone()));
                info!("connected to {peripheral}");
                Ok(())
            }
            Ok(reply) => {
                self.reset_attempt(epoch);
                Err(unexpected_reply("connect", &reply))
            }
            Err(CallError::Timeout) => {
                if self.reset_attempt(epoch) {
                    warn!("connect to {peripheral} timed out");
                    dispatcher.send_and_forget(Call::Disconnect);
                }
                Err(ErrorKind::ConnectionFailed(FailureReason::Timeout).into())
            }
            Err(err) => {
                self.reset_attempt(epoch);
                let err = err.into_error(ErrorKind::ConnectionFailed);
                warn!("connect to {peripheral} failed: {err}");
                Err(err)
            }
        }
    }

    /// Returns the manager to `Disconnected` if attempt `epoch` is still the one connecting.
    fn reset_attempt(&self, epoch: u64) -> bool {
        let mut link = lock(&self.link);
        match &*link {
            Link::Connecting { epoch: current, .. } if *current == epoch => {
                *link = Link::Disconnected;
                true
            }
            _ => false,
        }
    }

    pub async fn disconnect(&self, dispatcher: &Dispatcher, gatt: &GattSession, timeout: Duration) -> Result<()> {
        let _teardown = self.teardown.lock().await;

        let peripheral = {
            let mut link = lock(&self.link);
            match std::mem::replace(&mut *link, Link::Disconnected) {
                Link::Disconnected => {
                    debug!("already disconnected");
                    return Ok(());
                }
                Link::Connecting { peripheral, request, .. } => {
                    dispatcher.pending().abort(request, Abort::Cancelled);
                    *link = Link::Disconnecting {
                        peripheral: peripheral.clone(),
                        was_connected: false,
                    };
                    peripheral
                }
                Link::Connected { peripheral, .. } => {
                    gatt.invalidate(dispatcher);
                    *link = Link::Disconnecting {
                        peripheral: peripheral.clone(),
                        was_connected: true,
                    };
                    peripheral
                }
                Link::Disconnecting { peripheral, was_connected } => {
                    *link = Link::Disconnecting {
                        peripheral: peripheral.clone(),
                        was_connected,
                    };
                    peripheral
                }
            }
        };
        info!("disconnecting from {peripheral}");

        // Disconnected is reached even if this future is dropped
        let _finish = defer(|| self.finish_disconnect(DisconnectCause::Requested));

        match dispatcher.call(Call::Disconnect, timeout).await {
            Ok(Reply::Done) => (),
            Ok(reply) => debug!("unexpected reply to disconnect: {reply:?}"),
            Err(err) => debug!("treating failed disconnect as done: {err:?}"),
        }
        Ok(())
    }

    fn finish_disconnect(&self, cause: DisconnectCause) {
        let mut link = lock(&self.link);
        let Link::Disconnecting { peripheral, was_connected } = &*link else {
            return;
        };
        let (peripheral, was_connected) = (peripheral.clone(), *was_connected);
        *link = Link::Disconnected;
        info!("disconnected from {peripheral}");
        if was_connected {
            self.events.notify(ConnectionEvent::Disconnected { id: peripheral, cause });
        }
    }

    /// Tears the link down without asking the platform, which already considers it gone. With `peripheral` set,
    /// only a link to that peripheral is affected.
    pub fn drop_link(
        &self,
        dispatcher: &Dispatcher,
        gatt: &GattSession,
        peripheral: Option<&PeripheralId>,
        cause: DisconnectCause,
    ) {
        let mut link = lock(&self.link);
        let affected = match &*link {
            Link::Connecting { peripheral: p, .. } | Link::Connected { peripheral: p, .. } => {
                peripheral.map_or(true, |id| id == p)
            }
            Link::Disconnected | Link::Disconnecting { .. } => false,
        };
        if !affected {
            debug!("ignoring {cause:?} for {peripheral:?} in {:?}", link.state());
            return;
        }

        match std::mem::replace(&mut *link, Link::Disconnected) {
            Link::Connecting { peripheral, request, .. } => {
                warn!("{cause:?} while connecting to {peripheral}");
                let abort = match cause {
                    DisconnectCause::Shutdown => Abort::Detached,
                    DisconnectCause::Requested => Abort::Cancelled,
                    DisconnectCause::LinkLost | DisconnectCause::AdapterOff => Abort::LinkLost,
                };
                dispatcher.pending().abort(request, abort);
            }
            Link::Connected { peripheral, .. } => {
                warn!("{cause:?}: link to {peripheral} gone");
                gatt.invalidate(dispatcher);
                self.events.notify(ConnectionEvent::Disconnected { id: peripheral, cause });
            }
            other => *link = other,
        }
    }

    /// Ends every connection event stream.
    pub fn close(&self) {
        self.events.close();
    }
}
