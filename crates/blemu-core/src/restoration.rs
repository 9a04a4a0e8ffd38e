//! State restoration payloads
//!
//! The Bus keeps a restoration store keyed by (kind, restore-identifier);
//! blobs are JSON-encoded images of a façade's routable state. A façade
//! constructed with a restore identifier replays its blob through
//! `will_restore_state` before its powered-on transition.

use serde::{Deserialize, Serialize};

use crate::advertisement::AdvertisementData;
use crate::gatt::{BleUuid, Service, ServiceSnapshot};
use crate::remote::RemotePeripheral;
use crate::types::{DeviceId, ScanOptions};

/// Which façade family a stored blob belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestorationKind {
    Central,
    Peripheral,
}

// ----------------------------------------------------------------------------
// Stored blobs
// ----------------------------------------------------------------------------

/// Serialized image of a central's routable state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CentralStateBlob {
    pub peripherals: Vec<DeviceId>,
    pub scan_services: Option<Vec<BleUuid>>,
    pub scan_options: Option<ScanOptions>,
}

/// Serialized image of a peripheral's routable state.
///
/// Service values are reduced to byte snapshots, best-effort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct PeripheralStateBlob {
    pub advertising: bool,
    pub advertisement: Option<AdvertisementData>,
    pub services: Vec<ServiceSnapshot>,
}

pub(crate) fn encode_blob<T: Serialize>(blob: &T) -> Vec<u8> {
    serde_json::to_vec(blob).unwrap_or_default()
}

pub(crate) fn decode_blob<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Option<T> {
    serde_json::from_slice(bytes).ok()
}

// ----------------------------------------------------------------------------
// Delegate-facing restoration dictionaries
// ----------------------------------------------------------------------------

/// Payload of a central-side `will_restore_state` callback
#[derive(Debug, Clone)]
pub struct CentralRestoration {
    /// Proxies for the peripherals that were connected when state was saved
    pub peripherals: Vec<RemotePeripheral>,
    /// Service filter of the scan that was running, if any
    pub scan_services: Option<Vec<BleUuid>>,
    /// Options of the scan that was running, if any
    pub scan_options: Option<ScanOptions>,
}

/// Payload of a peripheral-side `will_restore_state` callback
#[derive(Debug, Clone)]
pub struct PeripheralRestoration {
    /// Services re-materialized from the saved image
    pub services: Vec<Service>,
    /// The advertisement map that was being broadcast, if any
    pub advertisement: Option<AdvertisementData>,
    /// Whether advertising was on; when true the façade restarts it after a
    /// short grace delay
    pub was_advertising: bool,
}
