//! Error taxonomy at the emulator boundary
//!
//! Two families mirror the layering of a real BLE stack: [`AttError`] for
//! attribute-protocol failures and [`ConnectionError`] for link-level and
//! routing failures. Every failure reaches the application through the same
//! delegate mechanism as a success, carried as the `error` parameter of the
//! callback for the triggering operation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ----------------------------------------------------------------------------
// ATT errors
// ----------------------------------------------------------------------------

/// Attribute-protocol errors, emitted from attribute operations on
/// permission, pairing, encryption, or injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum AttError {
    #[error("Invalid attribute handle")]
    InvalidHandle,
    #[error("Read not permitted")]
    ReadNotPermitted,
    #[error("Write not permitted")]
    WriteNotPermitted,
    #[error("Invalid PDU")]
    InvalidPdu,
    #[error("Insufficient authentication")]
    InsufficientAuthentication,
    #[error("Request not supported")]
    RequestNotSupported,
    #[error("Invalid offset")]
    InvalidOffset,
    #[error("Insufficient authorization")]
    InsufficientAuthorization,
    #[error("Prepare queue full")]
    PrepareQueueFull,
    #[error("Attribute not found")]
    AttributeNotFound,
    #[error("Attribute not long")]
    AttributeNotLong,
    #[error("Insufficient encryption key size")]
    InsufficientEncryptionKeySize,
    #[error("Invalid attribute value length")]
    InvalidAttributeValueLength,
    #[error("Unlikely error")]
    UnlikelyError,
    #[error("Insufficient encryption")]
    InsufficientEncryption,
    #[error("Unsupported group type")]
    UnsupportedGroupType,
    #[error("Insufficient resources")]
    InsufficientResources,
}

// ----------------------------------------------------------------------------
// Connection errors
// ----------------------------------------------------------------------------

/// Link-level and routing errors, emitted from connect/disconnect and the
/// Bus's routing logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ConnectionError {
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection timed out")]
    ConnectionTimeout,
    #[error("Peripheral disconnected")]
    PeripheralDisconnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Connection limit reached")]
    ConnectionLimitReached,
    #[error("Unknown device")]
    UnknownDevice,
    #[error("Operation not supported")]
    OperationNotSupported,
    #[error("Peer removed pairing information")]
    PeerRemovedPairingInformation,
    #[error("Encryption timed out")]
    EncryptionTimedOut,
    #[error("Too many LE paired devices")]
    TooManyLePairedDevices,
    #[error("Already advertising")]
    AlreadyAdvertising,
    #[error("UUID not allowed")]
    UuidNotAllowed,
    #[error("Out of space")]
    OutOfSpace,
    #[error("Invalid parameters")]
    InvalidParameters,
    #[error("Operation cancelled")]
    OperationCancelled,
}

// ----------------------------------------------------------------------------
// Unified error
// ----------------------------------------------------------------------------

/// Any failure surfaced by the emulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EmulatorError {
    #[error(transparent)]
    Att(#[from] AttError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl EmulatorError {
    /// True when this error is the attribute-layer "not connected" failure,
    /// which does not imply tear-down; the application decides what to do.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, EmulatorError::Connection(ConnectionError::NotConnected))
    }
}

/// Result alias used throughout the crate
pub type EmulatorResult<T> = Result<T, EmulatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transparent_display_forwards_inner_message() {
        let e: EmulatorError = AttError::ReadNotPermitted.into();
        assert_eq!(e.to_string(), "Read not permitted");
        let e: EmulatorError = ConnectionError::NotConnected.into();
        assert_eq!(e.to_string(), "Not connected");
        assert!(e.is_not_connected());
    }
}
