//! Cross-process transport contract
//!
//! A Bus normally coordinates façades inside one process. When instances in
//! separate processes should cooperate, each routed event is serialized into
//! a typed [`EventEnvelope`] and handed to a byte-oriented transport.
//! Concrete implementations live outside this crate (see the
//! `blemu-transport` crate); the Bus only depends on this contract.
//!
//! Envelope payload values reuse the tagged [`AdvertisementValue`] union, so
//! the in-process and wire forms of advertisement data are identical.
//!
//! [`AdvertisementValue`]: crate::advertisement::AdvertisementValue

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::advertisement::AdvertisementData;
use crate::error::AttError;
use crate::gatt::{BleUuid, ServiceSnapshot};
use crate::types::{DeviceId, WriteType};

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures at the transport boundary
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Peer not reachable: {peer}")]
    PeerUnreachable { peer: DeviceId },
    #[error("Transport closed")]
    Closed,
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },
}

// ----------------------------------------------------------------------------
// Routed events
// ----------------------------------------------------------------------------

/// An event the Bus routes between entities, in transportable form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutedEvent {
    Discovered {
        central: DeviceId,
        peripheral: DeviceId,
        advertisement: AdvertisementData,
        rssi: i16,
    },
    Connected {
        central: DeviceId,
        peripheral: DeviceId,
        mtu: u16,
    },
    Disconnected {
        central: DeviceId,
        peripheral: DeviceId,
    },
    ServiceList {
        peripheral: DeviceId,
        services: Vec<ServiceSnapshot>,
    },
    ReadRequest {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
    },
    ReadResponse {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Option<Vec<u8>>,
        error: Option<AttError>,
    },
    WriteRequest {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        write_type: WriteType,
    },
    WriteResponse {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        error: Option<AttError>,
    },
    SubscriptionChanged {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        enabled: bool,
    },
    Notification {
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
    },
    MtuUpdated {
        central: DeviceId,
        peripheral: DeviceId,
        mtu: u16,
    },
}

/// A routed event addressed to one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub target: DeviceId,
    pub event: RoutedEvent,
}

impl EventEnvelope {
    pub fn new(target: DeviceId, event: RoutedEvent) -> Self {
        Self { target, event }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::MalformedFrame {
            reason: e.to_string(),
        })
    }

    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(frame).map_err(|e| TransportError::MalformedFrame {
            reason: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// Transport trait
// ----------------------------------------------------------------------------

/// Byte-oriented send/receive between Bus instances.
///
/// Implementations own the mapping from target identifiers to whatever
/// addressing the medium uses. `recv` yields `(source, frame)` pairs and
/// returns `None` once the transport is closed.
#[async_trait]
pub trait EmulatorTransport: Send + Sync {
    async fn send(&self, target: DeviceId, frame: Vec<u8>) -> Result<(), TransportError>;

    async fn recv(&self) -> Option<(DeviceId, Vec<u8>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_bytes() {
        let envelope = EventEnvelope::new(
            DeviceId::new(),
            RoutedEvent::Notification {
                peripheral: DeviceId::new(),
                characteristic: BleUuid::from(0x2A37_u16),
                value: vec![0x01],
            },
        );
        let frame = envelope.encode().unwrap();
        assert_eq!(EventEnvelope::decode(&frame).unwrap(), envelope);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            EventEnvelope::decode(b"{"),
            Err(TransportError::MalformedFrame { .. })
        ));
    }
}
