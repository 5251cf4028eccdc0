//! Session configuration

use std::time::Duration;

/// Tunables for a [`CentralSession`][crate::CentralSession].
///
/// Every suspension point of the session is bounded by one of these timeouts. Timeouts longer than a year are
/// treated as a year. The defaults are conservative
/// values for phone-class Bluetooth stacks; hosts with slower radios should raise `connect_timeout` first.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// How long a permission prompt may stay unanswered.
    pub permission_timeout: Duration,
    /// Bound on the platform round-trip of starting or stopping a scan.
    pub scan_timeout: Duration,
    /// Bound on establishing a link.
    pub connect_timeout: Duration,
    /// Bound on the platform acknowledging a disconnect. Expiry is treated as disconnected.
    pub disconnect_timeout: Duration,
    /// Bound on a full service/characteristic/descriptor enumeration.
    pub discovery_timeout: Duration,
    /// Bound on a single characteristic or descriptor read or write.
    pub gatt_timeout: Duration,
    /// Advertisements buffered per subscriber before the oldest are dropped.
    pub advertisement_capacity: usize,
    /// Notifications buffered per subscriber before the oldest are dropped.
    pub notification_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            permission_timeout: Duration::from_secs(120),
            scan_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(30),
            gatt_timeout: Duration::from_secs(10),
            advertisement_capacity: 64,
            notification_capacity: 128,
        }
    }
}

impl SessionConfig {
    /// Sets [`permission_timeout`][Self::permission_timeout].
    pub fn with_permission_timeout(mut self, timeout: Duration) -> Self {
        self.permission_timeout = timeout;
        self
    }

    /// Sets [`scan_timeout`][Self::scan_timeout].
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Sets [`connect_timeout`][Self::connect_timeout].
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets [`disconnect_timeout`][Self::disconnect_timeout].
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Sets [`discovery_timeout`][Self::discovery_timeout].
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Sets [`gatt_timeout`][Self::gatt_timeout].
    pub fn with_gatt_timeout(mut self, timeout: Duration) -> Self {
        self.gatt_timeout = timeout;
        self
    }

    /// Sets every timeout at once. Mostly useful in tests.
    pub fn with_all_timeouts(self, timeout: Duration) -> Self {
        SessionConfig {
            permission_timeout: timeout,
            scan_timeout: timeout,
            connect_timeout: timeout,
            disconnect_timeout: timeout,
            discovery_timeout: timeout,
            gatt_timeout: timeout,
            ..self
        }
    }

    /// Sets the per-subscriber buffer sizes for advertisements and notifications.
    pub fn with_capacities(mut self, advertisements: usize, notifications: usize) -> Self {
        self.advertisement_capacity = advertisements.max(1);
        self.notification_capacity = notifications.max(1);
        self
    }
}
