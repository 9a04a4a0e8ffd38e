//! Delegate contracts
//!
//! Every event the emulator delivers reaches the application through one of
//! these traits. All methods have empty default bodies so a delegate
//! implements only what it cares about. Façades hold a weak handle to their
//! delegate and schedule each call as a separate job on the façade's
//! delivery queue; a delegate that has been dropped is silently skipped.

use crate::advertisement::AdvertisementData;
use crate::error::EmulatorError;
use crate::gatt::{Characteristic, Descriptor, Service};
use crate::l2cap::L2capChannel;
use crate::remote::{RemoteCentral, RemotePeripheral};
use crate::restoration::{CentralRestoration, PeripheralRestoration};
use crate::types::{AncsAuthorization, ConnectionEvent, DeviceId, ManagerState};

// ----------------------------------------------------------------------------
// Central-side
// ----------------------------------------------------------------------------

/// Events delivered to a central manager's application code
#[allow(unused_variables)]
pub trait CentralDelegate: Send + Sync + 'static {
    fn state_did_update(&self, state: ManagerState) {}

    fn did_discover(
        &self,
        peripheral: RemotePeripheral,
        advertisement: AdvertisementData,
        rssi: i16,
    ) {
    }

    fn did_connect(&self, peripheral: RemotePeripheral) {}

    fn did_fail_to_connect(&self, peripheral: RemotePeripheral, error: EmulatorError) {}

    fn did_disconnect_peripheral(
        &self,
        peripheral: RemotePeripheral,
        error: Option<EmulatorError>,
    ) {
    }

    fn connection_event_did_occur(&self, event: ConnectionEvent, peripheral: RemotePeripheral) {}

    fn will_restore_state(&self, state: CentralRestoration) {}

    fn did_update_ancs_authorization_for(&self, peripheral: RemotePeripheral) {}
}

// ----------------------------------------------------------------------------
// Remote-peripheral (per-proxy, central-side)
// ----------------------------------------------------------------------------

/// Events delivered for one remote-peripheral proxy
#[allow(unused_variables)]
pub trait RemotePeripheralDelegate: Send + Sync + 'static {
    fn did_discover_services(&self, peripheral: RemotePeripheral, error: Option<EmulatorError>) {}

    fn did_discover_included_services(
        &self,
        peripheral: RemotePeripheral,
        service: Service,
        error: Option<EmulatorError>,
    ) {
    }

    fn did_discover_characteristics(
        &self,
        peripheral: RemotePeripheral,
        service: Service,
        error: Option<EmulatorError>,
    ) {
    }

    fn did_update_value(
        &self,
        peripheral: RemotePeripheral,
        characteristic: Characteristic,
        error: Option<EmulatorError>,
    ) {
    }

    fn did_write_value(
        &self,
        peripheral: RemotePeripheral,
        characteristic: Characteristic,
        error: Option<EmulatorError>,
    ) {
    }

    fn did_update_notification_state(
        &self,
        peripheral: RemotePeripheral,
        characteristic: Characteristic,
        error: Option<EmulatorError>,
    ) {
    }

    fn did_discover_descriptors(
        &self,
        peripheral: RemotePeripheral,
        characteristic: Characteristic,
        error: Option<EmulatorError>,
    ) {
    }

    fn did_update_descriptor_value(
        &self,
        peripheral: RemotePeripheral,
        descriptor: Descriptor,
        error: Option<EmulatorError>,
    ) {
    }

    fn did_write_descriptor_value(
        &self,
        peripheral: RemotePeripheral,
        descriptor: Descriptor,
        error: Option<EmulatorError>,
    ) {
    }

    fn did_read_rssi(&self, peripheral: RemotePeripheral, rssi: i16, error: Option<EmulatorError>) {
    }

    fn did_modify_services(&self, peripheral: RemotePeripheral, invalidated: Vec<Service>) {}

    fn did_open_l2cap_channel(
        &self,
        peripheral: RemotePeripheral,
        channel: Option<L2capChannel>,
        error: Option<EmulatorError>,
    ) {
    }

    fn is_ready_to_send_write_without_response(&self, peripheral: RemotePeripheral) {}
}

// ----------------------------------------------------------------------------
// Peripheral-side
// ----------------------------------------------------------------------------

/// An inbound read request handed to the peripheral delegate.
///
/// Reads are resolved synchronously from attribute state; the request is
/// informational and `respond_to` acknowledges it without effect.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub central: DeviceId,
    pub characteristic: Characteristic,
    pub offset: usize,
}

/// An inbound write request handed to the peripheral delegate
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub central: DeviceId,
    pub characteristic: Characteristic,
    pub offset: usize,
    pub value: Vec<u8>,
}

/// Events delivered to a peripheral manager's application code
#[allow(unused_variables)]
pub trait PeripheralDelegate: Send + Sync + 'static {
    fn state_did_update(&self, state: ManagerState) {}

    fn did_start_advertising(&self, error: Option<EmulatorError>) {}

    fn did_add_service(&self, service: Service, error: Option<EmulatorError>) {}

    fn did_subscribe(&self, central: RemoteCentral, characteristic: Characteristic) {}

    fn did_unsubscribe(&self, central: RemoteCentral, characteristic: Characteristic) {}

    fn did_receive_read(&self, request: ReadRequest) {}

    fn did_receive_write(&self, requests: Vec<WriteRequest>) {}

    fn is_ready_to_update_subscribers(&self) {}

    fn did_publish_l2cap_channel(&self, psm: u16, error: Option<EmulatorError>) {}

    fn did_unpublish_l2cap_channel(&self, psm: u16, error: Option<EmulatorError>) {}

    fn did_open_l2cap_channel(&self, channel: Option<L2capChannel>, error: Option<EmulatorError>) {}

    fn will_restore_state(&self, state: PeripheralRestoration) {}

    fn did_update_ancs_authorization(
        &self,
        central: DeviceId,
        authorization: AncsAuthorization,
    ) {
    }
}
