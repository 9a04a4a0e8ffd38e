//! In-process Bluetooth Low Energy emulator
//!
//! This crate lets BLE application code run and be tested without radio
//! hardware: emulated central and peripheral managers coexist in one
//! process, exchange advertisements, establish logical connections, and
//! perform the full GATT surface (discovery, reads, writes, notifications,
//! indications, L2CAP streams) with configurable timing, error-injection,
//! and back-pressure behavior.
//!
//! ## Architecture
//!
//! - [`bus`] - the EmulatorBus, the process-wide coordinator every other
//!   component talks to
//! - [`central`] / [`peripheral`] - the manager façades application code
//!   drives
//! - [`remote`] - each side's proxy view of the other
//! - [`gatt`] - services, characteristics, and descriptors
//! - [`config`] - the timing/fault/MTU/back-pressure snapshot installed on
//!   the Bus
//! - [`delegate`] - the callback traits events are delivered through
//! - [`transport`] - the contract for bridging Bus instances across
//!   processes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blemu_core::{
//!     AdvertisementData, CentralDelegate, CentralManager, Characteristic, EmulatorBus,
//!     EmulatorConfig, ManagerOptions, PeripheralDelegate, PeripheralManager, Service,
//! };
//!
//! struct App;
//! impl CentralDelegate for App {}
//! impl PeripheralDelegate for App {}
//!
//! # async fn example() {
//! let bus = EmulatorBus::new();
//! bus.configure(EmulatorConfig::instant()).await.unwrap();
//!
//! let app = Arc::new(App);
//! let peripheral =
//!     PeripheralManager::new(&bus, &app, None, ManagerOptions::default()).await;
//! let service = Service::primary(0x180D_u16);
//! service.add_characteristic(Characteristic::readable(0x2A37_u16, vec![0x00, 0x5A]));
//! peripheral.add_service(&service);
//! peripheral.start_advertising(
//!     AdvertisementData::new()
//!         .with_local_name("HR")
//!         .with_service_uuids(vec![0x180D_u16.into()]),
//! );
//!
//! let central = CentralManager::new(&bus, &app, None, ManagerOptions::default()).await;
//! central
//!     .scan_for_peripherals(Some(vec![0x180D_u16.into()]), Default::default())
//!     .unwrap();
//! // Discoveries, connections, and reads now arrive through the delegates.
//! # }
//! ```

pub mod advertisement;
pub mod bus;
pub mod central;
pub mod config;
pub mod delegate;
pub mod dispatch;
pub mod error;
pub mod gatt;
pub mod l2cap;
pub mod peripheral;
pub mod remote;
pub mod restoration;
pub mod transport;
pub mod types;

// Public API exports
pub use advertisement::{keys as advertisement_keys, AdvertisementData, AdvertisementValue};
pub use bus::EmulatorBus;
pub use central::CentralManager;
pub use config::{
    AdvertisementConfig, BackpressureConfig, EmulatorConfig, EventConfig, FaultConfig, MtuConfig,
    RestorationConfig, RssiConfig, ScanBehaviorConfig, SecurityConfig, TimingConfig, MIN_MTU,
};
pub use delegate::{
    CentralDelegate, PeripheralDelegate, ReadRequest, RemotePeripheralDelegate, WriteRequest,
};
pub use dispatch::DeliveryQueue;
pub use error::{AttError, ConnectionError, EmulatorError, EmulatorResult};
pub use gatt::{
    AttributePermission, BleUuid, Characteristic, CharacteristicProperty, CharacteristicSnapshot,
    Descriptor, DescriptorSnapshot, Service, ServiceSnapshot,
};
pub use l2cap::L2capChannel;
pub use peripheral::{ConnectionLatency, PeripheralManager};
pub use remote::{RemoteCentral, RemotePeripheral};
pub use restoration::{CentralRestoration, PeripheralRestoration, RestorationKind};
pub use transport::{EmulatorTransport, EventEnvelope, RoutedEvent, TransportError};
pub use types::{
    AncsAuthorization, ConnectionEvent, ConnectionEventOptions, DeviceId, ManagerOptions,
    ManagerState, PeerState, ScanOptions, WriteType,
};
