//! Discovery of advertising peripherals.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::async_util::{Notifier, NotifierReceiver};
use crate::bridge::{unexpected_reply, Call, CallError, CallFailure, Dispatcher, PermissionKind, Reply};
use crate::error::ErrorKind;
use crate::util::{defer, lock};
use crate::{permission, AdvertisingDevice, Error, Result};

/// Advertiser company identifiers a scan is restricted to. The empty filter accepts every advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ScanFilter {
    company_ids: BTreeSet<u16>,
}

impl ScanFilter {
    /// Accepts every advertisement.
    pub fn any() -> Self {
        Self::default()
    }

    /// Accepts advertisements carrying manufacturer data from one of `company_ids`.
    pub fn by_company_id(company_ids: impl IntoIterator<Item = u16>) -> Self {
        ScanFilter {
            company_ids: company_ids.into_iter().collect(),
        }
    }

    /// The company identifiers in ascending order.
    pub fn company_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.company_ids.iter().copied()
    }

    /// `true` for the accept-all filter.
    pub fn is_empty(&self) -> bool {
        self.company_ids.is_empty()
    }

    /// Passes `device` through the filter. Manufacturer entries from other companies are removed; a device left
    /// with none is rejected.
    pub(crate) fn apply(&self, mut device: AdvertisingDevice) -> Option<AdvertisingDevice> {
        if self.is_empty() {
            return Some(device);
        }
        device
            .adv_data
            .manufacturer_data
            .retain(|entry| self.company_ids.contains(&entry.company_id));
        (!device.adv_data.manufacturer_data.is_empty()).then_some(device)
    }
}

#[derive(Debug)]
enum ScanState {
    Idle,
    Scanning(ScanFilter),
}

pub(crate) struct Scanner {
    transition: async_lock::Mutex<()>,
    state: Mutex<ScanState>,
    advertisements: Notifier<AdvertisingDevice>,
}

impl Scanner {
    pub fn new(capacity: usize) -> Self {
        Scanner {
            transition: async_lock::Mutex::new(()),
            state: Mutex::new(ScanState::Idle),
            advertisements: Notifier::new(capacity),
        }
    }

    pub fn is_discovering(&self) -> bool {
        matches!(*lock(&self.state), ScanState::Scanning(_))
    }

    pub async fn start(&self, dispatcher: &Dispatcher, filter: ScanFilter, timeout: Duration) -> Result<()> {
        let _transition = self.transition.lock().await;

        // checked on every start, even one that would be a no-op
        if !permission::check(dispatcher, PermissionKind::Scan).await {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                None,
                "scan permission has not been granted",
            ));
        }

        if let ScanState::Scanning(active) = &*lock(&self.state) {
            return if *active == filter {
                debug!("already scanning with {filter:?}");
                Ok(())
            } else {
                Err(Error::new(
                    ErrorKind::ScanAlreadyActive,
                    None,
                    format!("scanning with {active:?}"),
                ))
            };
        }

        let company_ids = filter.company_ids().collect();
        let reply = dispatcher.start(Call::StartScan { company_ids }).map_err(scan_error)?;

        // the platform may already be scanning if this future is dropped before the reply
        let guard = defer(|| dispatcher.send_and_forget(Call::StopScan));
        let reply = dispatcher.finish(reply, timeout).await;
        guard.defuse();

        match reply.map_err(scan_error)? {
            Reply::Done => {
                info!("scan started with {filter:?}");
                *lock(&self.state) = ScanState::Scanning(filter);
                Ok(())
            }
            reply => Err(unexpected_reply("start_scan", &reply)),
        }
    }

    pub async fn stop(&self, dispatcher: &Dispatcher, timeout: Duration) -> Result<()> {
        let _transition = self.transition.lock().await;

        if matches!(*lock(&self.state), ScanState::Idle) {
            return Ok(());
        }

        match dispatcher.call(Call::StopScan, timeout).await {
            Ok(Reply::Done) => (),
            Ok(reply) => warn!("unexpected reply to stop_scan: {reply:?}"),
            Err(CallError::Aborted(abort)) => {
                *lock(&self.state) = ScanState::Idle;
                return Err(CallError::Aborted(abort).into_error(|_| ErrorKind::Internal));
            }
            Err(err) => warn!("stopping the scan failed: {err:?}"),
        }

        info!("scan stopped");
        *lock(&self.state) = ScanState::Idle;
        Ok(())
    }

    pub fn advertisements(&self) -> NotifierReceiver<AdvertisingDevice> {
        self.advertisements.subscribe()
    }

    pub fn on_advertisement(&self, device: AdvertisingDevice) {
        let accepted = match &*lock(&self.state) {
            ScanState::Scanning(filter) => filter.apply(device),
            ScanState::Idle => {
                debug!("ignoring advertisement from {} while idle", device.id);
                None
            }
        };
        if let Some(device) = accepted {
            self.advertisements.notify(device);
        }
    }

    pub fn on_adapter_off(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, ScanState::Scanning(_)) {
            warn!("adapter switched off while scanning");
            *state = ScanState::Idle;
        }
    }

    /// Ends every advertisement stream.
    pub fn close(&self) {
        *lock(&self.state) = ScanState::Idle;
        self.advertisements.close();
    }
}

fn scan_error(err: CallError) -> Error {
    match err {
        CallError::Timeout => Error::new(
            ErrorKind::AdapterUnavailable,
            None,
            "the platform did not start the scan in time",
        ),
        CallError::Failed(CallFailure::Rejected(msg)) => {
            Error::new(ErrorKind::AdapterUnavailable, None, format!("scan refused: {msg}"))
        }
        err => err.into_error(|_| ErrorKind::AdapterUnavailable),
    }
}
