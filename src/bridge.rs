//! The contract between the session core and the host platform.
//!
//! The host owns the radio and the permission model. The core hands it one [`Call`] at a time together with a
//! fresh [`RequestId`]; the host answers each request exactly once through
//! [`BridgeHandle::complete`][crate::BridgeHandle::complete], in any order and from any thread. Unsolicited
//! platform happenings (advertisements, link loss, notifications) are pushed with
//! [`BridgeHandle::emit`][crate::BridgeHandle::emit].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::async_util::{Abort, PendingCalls, PendingReply};
use crate::error::{AttError, ErrorKind, FailureReason};
use crate::gatt_tree::ServiceEntry;
use crate::{AdvertisingDevice, BridgeHandle, Error, PeripheralId, Uuid};

/// Identity of one bridge request. Replies are matched on this, never on arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    /// The raw request number, for hosts that need to marshal it.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which platform authorization a permission call is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionKind {
    /// Scanning for and connecting to peripherals
    Scan,
    /// Advertising
    Advertise,
}

/// Outcome of a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionStatus {
    /// The user (or the platform) granted the permission
    Granted,
    /// The user declined
    Denied,
    /// The platform cannot show a prompt, e.g. the permission was permanently denied
    Unavailable,
}

/// A request for the host platform.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// Show the permission prompt for `kind`. Replied with [`Reply::Permission`].
    RequestPermission(PermissionKind),
    /// Start a low-power scan. An empty `company_ids` accepts every advertisement.
    StartScan {
        /// Manufacturer company identifiers to filter on
        company_ids: Vec<u16>,
    },
    /// Stop the running scan.
    StopScan,
    /// Open a GATT connection to a peripheral seen during a scan.
    Connect {
        /// Identifier from a previous advertisement
        peripheral: PeripheralId,
    },
    /// Close the current GATT connection.
    Disconnect,
    /// Enumerate services, characteristics and descriptors. Replied with [`Reply::Services`].
    DiscoverServices,
    /// Read a characteristic value. Replied with [`Reply::Value`].
    ReadCharacteristic {
        service: Uuid,
        characteristic: Uuid,
    },
    /// Write a characteristic value with response.
    WriteCharacteristic {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Read a descriptor value. Replied with [`Reply::Value`].
    ReadDescriptor {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    },
    /// Write a descriptor value.
    WriteDescriptor {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    /// Turn value-change notifications for a characteristic on or off.
    SetNotify {
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    },
}

impl Call {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Call::RequestPermission(_) => "request_permission",
            Call::StartScan { .. } => "start_scan",
            Call::StopScan => "stop_scan",
            Call::Connect { .. } => "connect",
            Call::Disconnect => "disconnect",
            Call::DiscoverServices => "discover_services",
            Call::ReadCharacteristic { .. } => "read_characteristic",
            Call::WriteCharacteristic { .. } => "write_characteristic",
            Call::ReadDescriptor { .. } => "read_descriptor",
            Call::WriteDescriptor { .. } => "write_descriptor",
            Call::SetNotify { .. } => "set_notify",
        }
    }
}

/// The single answer to a [`Call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The call succeeded and carries no value
    Done,
    /// Answer to [`Call::RequestPermission`]
    Permission(PermissionStatus),
    /// Answer to [`Call::DiscoverServices`]
    Services(Vec<ServiceEntry>),
    /// Answer to a read
    Value(Vec<u8>),
    /// The platform could not perform the call
    Failed(CallFailure),
}

/// Why the platform could not perform a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// The peripheral or attribute does not exist on the platform side
    NotFound,
    /// The Bluetooth adapter is missing or powered off
    AdapterUnavailable,
    /// The platform refused for lack of authorization
    PermissionDenied,
    /// The peripheral answered with an ATT error
    Att(AttError),
    /// Any other refusal, with a host-provided description
    Rejected(String),
}

impl CallFailure {
    /// Builds a failure from a raw GATT status, `None` meaning the status was success.
    pub fn from_gatt_status(status: i32) -> Option<CallFailure> {
        AttError::from_status(status).map(CallFailure::Att)
    }
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallFailure::NotFound => f.write_str("not found"),
            CallFailure::AdapterUnavailable => f.write_str("adapter unavailable"),
            CallFailure::PermissionDenied => f.write_str("permission denied"),
            CallFailure::Att(err) => write!(f, "{err}"),
            CallFailure::Rejected(msg) => f.write_str(msg),
        }
    }
}

/// Something the platform reports without being asked.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// An advertisement was observed during a scan
    Advertisement(AdvertisingDevice),
    /// The link to a peripheral dropped without a disconnect request
    LinkLost(PeripheralId),
    /// A characteristic with notifications enabled changed value
    CharacteristicChanged {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The adapter was switched off; scans stop and links drop
    AdapterOff,
}

/// The host side of a [`CentralSession`][crate::CentralSession].
///
/// Implementations marshal each call to the platform Bluetooth stack. They must reply to every dispatched
/// request exactly once (unless `dispatch` itself returned an error) and must not retry on their own.
#[async_trait]
pub trait Bridge: Send + Sync + 'static {
    /// Whether the native side is present and linked.
    fn is_available(&self) -> bool;

    /// Hands the bridge the handle it uses to reply and to emit events. Called once by
    /// [`CentralSession::initialize`][crate::CentralSession::initialize].
    fn attach(&self, handle: BridgeHandle);

    /// Called by [`CentralSession::shutdown`][crate::CentralSession::shutdown]; replies after this are ignored.
    fn detach(&self) {}

    /// Current authorization status for `kind`. Must not prompt the user.
    async fn check_permission(&self, kind: PermissionKind) -> bool;

    /// Starts `call`. The reply arrives later through [`BridgeHandle::complete`][crate::BridgeHandle::complete]
    /// with the same `id`; it may even arrive before this method returns. An `Err` means the call was never
    /// started and no reply will follow.
    fn dispatch(&self, id: RequestId, call: Call) -> Result<(), CallFailure>;
}

/// Why a dispatched call produced no usable reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallError {
    Timeout,
    Aborted(Abort),
    Failed(CallFailure),
}

impl CallError {
    /// Converts into the public error of an operation whose failures are reported as `failed(reason)`.
    pub fn into_error(self, failed: fn(FailureReason) -> ErrorKind) -> Error {
        match self {
            CallError::Timeout => failed(FailureReason::Timeout).into(),
            CallError::Aborted(Abort::Cancelled) => failed(FailureReason::Cancelled).into(),
            CallError::Aborted(Abort::LinkLost) => failed(FailureReason::LinkLost).into(),
            CallError::Aborted(Abort::Invalidated) => ErrorKind::SessionInvalidated.into(),
            CallError::Aborted(Abort::Detached) => ErrorKind::BridgeUnavailable.into(),
            CallError::Failed(CallFailure::NotFound) => {
                Error::new(ErrorKind::NotFound, None, "the platform does not know this entity")
            }
            CallError::Failed(CallFailure::AdapterUnavailable) => ErrorKind::AdapterUnavailable.into(),
            CallError::Failed(CallFailure::PermissionDenied) => ErrorKind::PermissionDenied.into(),
            CallError::Failed(CallFailure::Att(err)) => failed(FailureReason::Protocol(err)).into(),
            CallError::Failed(CallFailure::Rejected(msg)) => Error::new(failed(FailureReason::Rejected), None, msg),
        }
    }
}

pub(crate) fn unexpected_reply(call: &str, reply: &Reply) -> Error {
    Error::new(
        ErrorKind::Internal,
        None,
        format!("unexpected reply to {call}: {reply:?}"),
    )
}

/// Sends calls to the bridge and matches them with their replies.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    bridge: Arc<dyn Bridge>,
    pending: PendingCalls,
}

impl Dispatcher {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Dispatcher {
            bridge,
            pending: PendingCalls::new(),
        }
    }

    pub fn bridge(&self) -> &dyn Bridge {
        &*self.bridge
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Reserves a request id without sending anything yet.
    pub fn register(&self) -> Result<PendingReply, CallError> {
        self.pending.register().ok_or(CallError::Aborted(Abort::Detached))
    }

    /// Hands `call` to the bridge under the id of `reply`.
    pub fn dispatch(&self, reply: &PendingReply, call: Call) -> Result<(), CallError> {
        let name = call.name();
        debug!("dispatching {name} as {}", reply.id());
        self.bridge.dispatch(reply.id(), call).map_err(|failure| {
            warn!("bridge refused {name}: {failure}");
            CallError::Failed(failure)
        })
    }

    /// Registers a request and hands it to the bridge. The request is registered first, since the bridge may
    /// reply before `dispatch` returns.
    pub fn start(&self, call: Call) -> Result<PendingReply, CallError> {
        let reply = self.register()?;
        self.dispatch(&reply, call)?;
        Ok(reply)
    }

    /// Waits for the reply to a started request. `Reply::Failed` is turned into an error.
    pub async fn finish(&self, reply: PendingReply, timeout: Duration) -> Result<Reply, CallError> {
        let id = reply.id();
        match reply.wait_with_timeout(timeout).await {
            None => {
                debug!("request {id} timed out after {timeout:?}");
                Err(CallError::Timeout)
            }
            Some(Err(abort)) => Err(CallError::Aborted(abort)),
            Some(Ok(Reply::Failed(failure))) => Err(CallError::Failed(failure)),
            Some(Ok(reply)) => Ok(reply),
        }
    }

    pub async fn call(&self, call: Call, timeout: Duration) -> Result<Reply, CallError> {
        let reply = self.start(call)?;
        self.finish(reply, timeout).await
    }

    /// Dispatches `call` without waiting; whatever the bridge answers is discarded.
    pub fn send_and_forget(&self, call: Call) {
        let name = call.name();
        if let Err(err) = self.start(call) {
            debug!("{name} was not sent: {err:?}");
        }
    }
}
