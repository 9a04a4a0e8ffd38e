//! Shared fixtures for the integration suites
//!
//! A single [`Recorder`] implements all three delegate traits and journals
//! every callback, so tests assert on the ordered event log the way an
//! application would observe it.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::sync::Notify;

use blemu_core::{
    AdvertisementData, AncsAuthorization, BleUuid, CentralDelegate, CentralManager,
    CentralRestoration, Characteristic, ConnectionEvent, DeviceId, EmulatorBus, EmulatorConfig,
    EmulatorError, L2capChannel, ManagerOptions, ManagerState, PeripheralDelegate,
    PeripheralManager, PeripheralRestoration, ReadRequest, RemotePeripheral,
    RemotePeripheralDelegate, Service, WriteRequest,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Route emulator tracing to the test output; filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Everything a delegate can observe, reduced to comparable data
#[derive(Debug, Clone)]
pub enum Recorded {
    StateUpdate(ManagerState),
    Discovered {
        peripheral: DeviceId,
        advertisement: AdvertisementData,
        rssi: i16,
    },
    Connected(DeviceId),
    FailedToConnect(DeviceId, EmulatorError),
    Disconnected {
        peripheral: DeviceId,
        error: Option<EmulatorError>,
    },
    ConnectionEvent(ConnectionEvent, DeviceId),
    WillRestoreCentral {
        peripherals: Vec<DeviceId>,
        scan_services: Option<Vec<BleUuid>>,
    },
    AncsChangedFor(DeviceId),

    ServicesDiscovered(Option<EmulatorError>),
    IncludedServicesDiscovered {
        service: BleUuid,
        error: Option<EmulatorError>,
    },
    CharacteristicsDiscovered {
        service: BleUuid,
        error: Option<EmulatorError>,
    },
    DescriptorsDiscovered {
        characteristic: BleUuid,
        error: Option<EmulatorError>,
    },
    ValueUpdated {
        characteristic: BleUuid,
        value: Option<Vec<u8>>,
        error: Option<EmulatorError>,
    },
    ValueWritten {
        characteristic: BleUuid,
        error: Option<EmulatorError>,
    },
    NotificationState {
        characteristic: BleUuid,
        error: Option<EmulatorError>,
    },
    DescriptorValueUpdated {
        descriptor: BleUuid,
        value: Option<Vec<u8>>,
        error: Option<EmulatorError>,
    },
    DescriptorValueWritten {
        descriptor: BleUuid,
        error: Option<EmulatorError>,
    },
    RssiRead {
        rssi: i16,
        error: Option<EmulatorError>,
    },
    ServicesModified(Vec<BleUuid>),
    L2capOpenedOnCentral {
        ok: bool,
        error: Option<EmulatorError>,
    },
    ReadyForWriteWithoutResponse,

    AdvertisingStarted(Option<EmulatorError>),
    ServiceAdded {
        service: BleUuid,
        error: Option<EmulatorError>,
    },
    Subscribed {
        central: DeviceId,
        characteristic: BleUuid,
    },
    Unsubscribed {
        central: DeviceId,
        characteristic: BleUuid,
    },
    ReceivedRead {
        characteristic: BleUuid,
    },
    ReceivedWrite {
        characteristic: BleUuid,
        value: Vec<u8>,
    },
    ReadyToUpdateSubscribers,
    L2capPublished {
        psm: u16,
        error: Option<EmulatorError>,
    },
    L2capUnpublished {
        psm: u16,
    },
    L2capOpenedOnPeripheral {
        psm: u16,
    },
    WillRestorePeripheral {
        was_advertising: bool,
        services: Vec<BleUuid>,
    },
    AncsAuthorization {
        central: DeviceId,
        authorization: AncsAuthorization,
    },
}

/// Journaling delegate shared by every test
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Recorded>>,
    /// Channels are not clonable; opened ends are parked here.
    channels: Mutex<Vec<L2capChannel>>,
    notify: Notify,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self::default())
    }

    fn record(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_waiters();
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Recorded) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    pub fn position(&self, predicate: impl Fn(&Recorded) -> bool) -> Option<usize> {
        self.events.lock().unwrap().iter().position(|e| predicate(e))
    }

    pub fn find(&self, predicate: impl Fn(&Recorded) -> bool) -> Option<Recorded> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| predicate(e))
            .cloned()
    }

    /// Wait until an event matching the predicate has been recorded
    pub async fn wait_for(&self, predicate: impl Fn(&Recorded) -> bool) -> Recorded {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if let Some(event) = self.find(&predicate) {
                    return event;
                }
                notified.await;
            }
        })
        .await
        .expect("expected delegate event within timeout")
    }

    pub async fn wait_powered_on(&self) {
        self.wait_for(|e| matches!(e, Recorded::StateUpdate(ManagerState::PoweredOn)))
            .await;
    }

    pub fn take_channels(&self) -> Vec<L2capChannel> {
        std::mem::take(&mut *self.channels.lock().unwrap())
    }
}

impl CentralDelegate for Recorder {
    fn state_did_update(&self, state: ManagerState) {
        self.record(Recorded::StateUpdate(state));
    }

    fn did_discover(
        &self,
        peripheral: RemotePeripheral,
        advertisement: AdvertisementData,
        rssi: i16,
    ) {
        self.record(Recorded::Discovered {
            peripheral: peripheral.identifier(),
            advertisement,
            rssi,
        });
    }

    fn did_connect(&self, peripheral: RemotePeripheral) {
        self.record(Recorded::Connected(peripheral.identifier()));
    }

    fn did_fail_to_connect(&self, peripheral: RemotePeripheral, error: EmulatorError) {
        self.record(Recorded::FailedToConnect(peripheral.identifier(), error));
    }

    fn did_disconnect_peripheral(
        &self,
        peripheral: RemotePeripheral,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::Disconnected {
            peripheral: peripheral.identifier(),
            error,
        });
    }

    fn connection_event_did_occur(&self, event: ConnectionEvent, peripheral: RemotePeripheral) {
        self.record(Recorded::ConnectionEvent(event, peripheral.identifier()));
    }

    fn will_restore_state(&self, state: CentralRestoration) {
        self.record(Recorded::WillRestoreCentral {
            peripherals: state.peripherals.iter().map(|p| p.identifier()).collect(),
            scan_services: state.scan_services,
        });
    }

    fn did_update_ancs_authorization_for(&self, peripheral: RemotePeripheral) {
        self.record(Recorded::AncsChangedFor(peripheral.identifier()));
    }
}

impl RemotePeripheralDelegate for Recorder {
    fn did_discover_services(&self, _peripheral: RemotePeripheral, error: Option<EmulatorError>) {
        self.record(Recorded::ServicesDiscovered(error));
    }

    fn did_discover_included_services(
        &self,
        _peripheral: RemotePeripheral,
        service: Service,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::IncludedServicesDiscovered {
            service: service.uuid(),
            error,
        });
    }

    fn did_discover_characteristics(
        &self,
        _peripheral: RemotePeripheral,
        service: Service,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::CharacteristicsDiscovered {
            service: service.uuid(),
            error,
        });
    }

    fn did_update_value(
        &self,
        _peripheral: RemotePeripheral,
        characteristic: Characteristic,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::ValueUpdated {
            characteristic: characteristic.uuid(),
            value: characteristic.value(),
            error,
        });
    }

    fn did_write_value(
        &self,
        _peripheral: RemotePeripheral,
        characteristic: Characteristic,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::ValueWritten {
            characteristic: characteristic.uuid(),
            error,
        });
    }

    fn did_update_notification_state(
        &self,
        _peripheral: RemotePeripheral,
        characteristic: Characteristic,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::NotificationState {
            characteristic: characteristic.uuid(),
            error,
        });
    }

    fn did_discover_descriptors(
        &self,
        _peripheral: RemotePeripheral,
        characteristic: Characteristic,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::DescriptorsDiscovered {
            characteristic: characteristic.uuid(),
            error,
        });
    }

    fn did_update_descriptor_value(
        &self,
        _peripheral: RemotePeripheral,
        descriptor: blemu_core::Descriptor,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::DescriptorValueUpdated {
            descriptor: descriptor.uuid(),
            value: descriptor.value(),
            error,
        });
    }

    fn did_write_descriptor_value(
        &self,
        _peripheral: RemotePeripheral,
        descriptor: blemu_core::Descriptor,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::DescriptorValueWritten {
            descriptor: descriptor.uuid(),
            error,
        });
    }

    fn did_read_rssi(
        &self,
        _peripheral: RemotePeripheral,
        rssi: i16,
        error: Option<EmulatorError>,
    ) {
        self.record(Recorded::RssiRead { rssi, error });
    }

    fn did_modify_services(&self, _peripheral: RemotePeripheral, invalidated: Vec<Service>) {
        self.record(Recorded::ServicesModified(
            invalidated.iter().map(|s| s.uuid()).collect(),
        ));
    }

    fn did_open_l2cap_channel(
        &self,
        _peripheral: RemotePeripheral,
        channel: Option<L2capChannel>,
        error: Option<EmulatorError>,
    ) {
        let ok = channel.is_some();
        if let Some(channel) = channel {
            self.channels.lock().unwrap().push(channel);
        }
        self.record(Recorded::L2capOpenedOnCentral { ok, error });
    }

    fn is_ready_to_send_write_without_response(&self, _peripheral: RemotePeripheral) {
        self.record(Recorded::ReadyForWriteWithoutResponse);
    }
}

impl PeripheralDelegate for Recorder {
    fn state_did_update(&self, state: ManagerState) {
        self.record(Recorded::StateUpdate(state));
    }

    fn did_start_advertising(&self, error: Option<EmulatorError>) {
        self.record(Recorded::AdvertisingStarted(error));
    }

    fn did_add_service(&self, service: Service, error: Option<EmulatorError>) {
        self.record(Recorded::ServiceAdded {
            service: service.uuid(),
            error,
        });
    }

    fn did_subscribe(&self, central: blemu_core::RemoteCentral, characteristic: Characteristic) {
        self.record(Recorded::Subscribed {
            central: central.identifier(),
            characteristic: characteristic.uuid(),
        });
    }

    fn did_unsubscribe(&self, central: blemu_core::RemoteCentral, characteristic: Characteristic) {
        self.record(Recorded::Unsubscribed {
            central: central.identifier(),
            characteristic: characteristic.uuid(),
        });
    }

    fn did_receive_read(&self, request: ReadRequest) {
        self.record(Recorded::ReceivedRead {
            characteristic: request.characteristic.uuid(),
        });
    }

    fn did_receive_write(&self, requests: Vec<WriteRequest>) {
        for request in requests {
            self.record(Recorded::ReceivedWrite {
                characteristic: request.characteristic.uuid(),
                value: request.value,
            });
        }
    }

    fn is_ready_to_update_subscribers(&self) {
        self.record(Recorded::ReadyToUpdateSubscribers);
    }

    fn did_publish_l2cap_channel(&self, psm: u16, error: Option<EmulatorError>) {
        self.record(Recorded::L2capPublished { psm, error });
    }

    fn did_unpublish_l2cap_channel(&self, psm: u16, _error: Option<EmulatorError>) {
        self.record(Recorded::L2capUnpublished { psm });
    }

    fn did_open_l2cap_channel(&self, channel: Option<L2capChannel>, _error: Option<EmulatorError>) {
        if let Some(channel) = channel {
            let psm = channel.psm();
            self.channels.lock().unwrap().push(channel);
            self.record(Recorded::L2capOpenedOnPeripheral { psm });
        }
    }

    fn will_restore_state(&self, state: PeripheralRestoration) {
        self.record(Recorded::WillRestorePeripheral {
            was_advertising: state.was_advertising,
            services: state.services.iter().map(|s| s.uuid()).collect(),
        });
    }

    fn did_update_ancs_authorization(
        &self,
        central: DeviceId,
        authorization: AncsAuthorization,
    ) {
        self.record(Recorded::AncsAuthorization {
            central,
            authorization,
        });
    }
}

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

pub const HEART_RATE_SERVICE: u16 = 0x180D;
pub const HEART_RATE_MEASUREMENT: u16 = 0x2A37;

/// A bus configured for instant delivery
pub async fn instant_bus() -> EmulatorBus {
    let bus = EmulatorBus::new();
    bus.configure(EmulatorConfig::instant()).await.unwrap();
    bus
}

/// Heart-rate service with one characteristic carrying the given properties
pub fn heart_rate_service(
    properties: Vec<blemu_core::CharacteristicProperty>,
    permissions: Vec<blemu_core::AttributePermission>,
) -> (Service, Characteristic) {
    let service = Service::primary(HEART_RATE_SERVICE);
    let characteristic = Characteristic::new(
        HEART_RATE_MEASUREMENT,
        properties,
        Some(vec![0x00, 0x5A]),
        permissions,
    );
    service.add_characteristic(characteristic.clone());
    (service, characteristic)
}

pub fn heart_rate_advertisement() -> AdvertisementData {
    AdvertisementData::new()
        .with_local_name("HR")
        .with_service_uuids(vec![BleUuid::from(HEART_RATE_SERVICE)])
}

/// An advertising heart-rate peripheral, powered on
pub async fn advertising_peripheral(
    bus: &EmulatorBus,
    properties: Vec<blemu_core::CharacteristicProperty>,
    permissions: Vec<blemu_core::AttributePermission>,
) -> (PeripheralManager, Characteristic, Arc<Recorder>) {
    let recorder = Recorder::new();
    let manager = PeripheralManager::new(bus, &recorder, None, ManagerOptions::default()).await;
    recorder.wait_powered_on().await;

    let (service, characteristic) = heart_rate_service(properties, permissions);
    manager.add_service(&service);
    manager.start_advertising(heart_rate_advertisement());
    recorder
        .wait_for(|e| matches!(e, Recorded::AdvertisingStarted(None)))
        .await;
    (manager, characteristic, recorder)
}

/// A powered-on central
pub async fn powered_central(bus: &EmulatorBus) -> (CentralManager, Arc<Recorder>) {
    let recorder = Recorder::new();
    let manager = CentralManager::new(bus, &recorder, None, ManagerOptions::default()).await;
    recorder.wait_powered_on().await;
    (manager, recorder)
}

/// Scan until the given peripheral is discovered; returns its proxy with the
/// recorder installed as proxy delegate.
pub async fn discover(
    central: &CentralManager,
    recorder: &Arc<Recorder>,
    peripheral: DeviceId,
) -> RemotePeripheral {
    central
        .scan_for_peripherals(Some(vec![BleUuid::from(HEART_RATE_SERVICE)]), Default::default())
        .unwrap();
    recorder
        .wait_for(|e| matches!(e, Recorded::Discovered { peripheral: p, .. } if *p == peripheral))
        .await;
    central.stop_scan();
    let proxy = central
        .retrieve_peripherals(&[peripheral])
        .pop()
        .expect("discovered proxy present");
    proxy.set_delegate(recorder);
    proxy
}

/// Discover and connect; returns the connected proxy.
pub async fn discover_and_connect(
    central: &CentralManager,
    recorder: &Arc<Recorder>,
    peripheral: DeviceId,
) -> RemotePeripheral {
    let proxy = discover(central, recorder, peripheral).await;
    central.connect(&proxy);
    recorder
        .wait_for(|e| matches!(e, Recorded::Connected(p) if *p == peripheral))
        .await;
    proxy
}
