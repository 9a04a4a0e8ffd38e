//! Core identity and state types shared across the emulator
//!
//! Entity identities use the newtype pattern so a central identifier cannot
//! silently stand in for a characteristic UUID or vice versa.

use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Device Identifier
// ----------------------------------------------------------------------------

/// Stable unique identifier for a central, peripheral, or remote proxy.
///
/// Generated at construction and never changed for the entity's lifetime;
/// the Bus routes exclusively by this key. A remote-peripheral proxy carries
/// the identifier of the peripheral façade it represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (used when restoring saved state)
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Manager State
// ----------------------------------------------------------------------------

/// Lifecycle state of a central or peripheral manager.
///
/// Every manager starts at [`ManagerState::Unknown`] and transitions to
/// [`ManagerState::PoweredOn`] after the configured state-update delay. The
/// remaining states are reachable only through an explicit configuration
/// override, for failure testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Unknown => "unknown",
            ManagerState::Resetting => "resetting",
            ManagerState::Unsupported => "unsupported",
            ManagerState::Unauthorized => "unauthorized",
            ManagerState::PoweredOff => "poweredOff",
            ManagerState::PoweredOn => "poweredOn",
        };
        write!(f, "{name}")
    }
}

// ----------------------------------------------------------------------------
// Peer connection state (central-side view of a remote peripheral)
// ----------------------------------------------------------------------------

/// Connection state of a remote peripheral as seen from a central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

// ----------------------------------------------------------------------------
// Write type
// ----------------------------------------------------------------------------

/// The two ATT write flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    /// Acknowledged write; completion is reported through the delegate.
    WithResponse,
    /// Unacknowledged write; no completion callback, subject to back-pressure.
    WithoutResponse,
}

// ----------------------------------------------------------------------------
// Connection events / ANCS
// ----------------------------------------------------------------------------

/// Auxiliary connection event delivered to centrals registered for them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    PeerConnected,
    PeerDisconnected,
}

/// ANCS authorization status tracked per central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AncsAuthorization {
    #[default]
    NotDetermined,
    Denied,
    Authorized,
}

// ----------------------------------------------------------------------------
// Scan / connection-event options
// ----------------------------------------------------------------------------

use crate::gatt::BleUuid;

/// Options supplied to `scan_for_peripherals`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Deliver every advertisement cycle instead of de-duplicating per scan
    /// session. Only honored when the installed configuration says so.
    pub allow_duplicates: bool,
    /// Restrict matching to peripherals soliciting one of these services.
    /// Only honored when the installed configuration says so.
    pub solicited_service_uuids: Option<Vec<BleUuid>>,
}

impl ScanOptions {
    pub fn allowing_duplicates() -> Self {
        Self {
            allow_duplicates: true,
            ..Self::default()
        }
    }
}

/// Matching options stored when a central registers for connection events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEventOptions {
    pub peripheral_ids: Option<Vec<DeviceId>>,
    pub service_uuids: Option<Vec<BleUuid>>,
}

/// Options supplied when constructing a manager façade
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Restoration key; when set and restoration is enabled, saved state for
    /// this key is replayed through `will_restore_state` before power-on.
    pub restore_identifier: Option<String>,
    /// Advisory flag carried for API parity; the emulator never shows alerts.
    pub show_power_alert: bool,
}

impl ManagerOptions {
    pub fn with_restore_identifier(id: impl Into<String>) -> Self {
        Self {
            restore_identifier: Some(id.into()),
            show_power_alert: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
