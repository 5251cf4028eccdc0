//! Platform authorization for scanning and advertising.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::{unexpected_reply, Call, CallError, Dispatcher, PermissionKind, PermissionStatus, Reply};
use crate::error::ErrorKind;
use crate::{Error, Result};

/// Asks the bridge whether `kind` is currently granted. Never prompts.
pub(crate) async fn check(dispatcher: &Dispatcher, kind: PermissionKind) -> bool {
    let granted = dispatcher.bridge().check_permission(kind).await;
    debug!("{kind:?} permission granted: {granted}");
    granted
}

/// Prompts for `kind` unless it is already granted.
pub(crate) async fn request(dispatcher: &Dispatcher, kind: PermissionKind, timeout: Duration) -> Result<()> {
    if check(dispatcher, kind).await {
        return Ok(());
    }

    info!("requesting {kind:?} permission");
    let reply = dispatcher
        .call(Call::RequestPermission(kind), timeout)
        .await
        .map_err(|err| match err {
            CallError::Timeout => Error::new(ErrorKind::PermissionUnavailable, None, "permission prompt timed out"),
            // a prompt has no failure reason of its own
            err => err.into_error(|_| ErrorKind::PermissionUnavailable),
        })?;

    match reply {
        Reply::Permission(PermissionStatus::Granted) => Ok(()),
        Reply::Permission(PermissionStatus::Denied) => {
            warn!("{kind:?} permission denied");
            Err(ErrorKind::PermissionDenied.into())
        }
        Reply::Permission(PermissionStatus::Unavailable) => {
            warn!("{kind:?} permission prompt unavailable");
            Err(ErrorKind::PermissionUnavailable.into())
        }
        reply => Err(unexpected_reply("request_permission", &reply)),
    }
}
