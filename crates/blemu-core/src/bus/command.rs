//! Command vocabulary of the Bus mailbox
//!
//! Every mutation of Bus state travels through exactly one of these
//! commands. Operations that need a result carry a oneshot responder; a
//! dropped responder means the caller went away and is ignored. Commands
//! with a `Finish*` twin are the second phase of a delayed operation: the
//! first phase spawns a cancellable timer that posts the twin back to the
//! mailbox when the configured delay elapses.

use std::sync::{Arc, Weak};

use tokio::sync::oneshot;

use crate::advertisement::AdvertisementData;
use crate::central::CentralShared;
use crate::config::EmulatorConfig;
use crate::error::EmulatorResult;
use crate::gatt::{BleUuid, CharacteristicSnapshot, DescriptorSnapshot, ServiceSnapshot};
use crate::l2cap::L2capChannel;
use crate::peripheral::PeripheralShared;
use crate::restoration::RestorationKind;
use crate::transport::EmulatorTransport;
use crate::types::{
    AncsAuthorization, ConnectionEventOptions, DeviceId, ScanOptions, WriteType,
};

pub(crate) type Responder<T> = oneshot::Sender<T>;

pub(crate) enum BusCommand {
    // -- lifecycle -----------------------------------------------------------
    RegisterCentral {
        id: DeviceId,
        handle: Weak<CentralShared>,
    },
    RegisterPeripheral {
        id: DeviceId,
        handle: Weak<PeripheralShared>,
    },
    UnregisterCentral {
        id: DeviceId,
    },
    UnregisterPeripheral {
        id: DeviceId,
    },
    Configure {
        config: Box<EmulatorConfig>,
        reply: Responder<Result<(), String>>,
    },
    GetConfiguration {
        reply: Responder<Arc<EmulatorConfig>>,
    },
    Reset {
        reply: Responder<()>,
    },
    GetAllCentrals {
        reply: Responder<Vec<DeviceId>>,
    },
    GetAllPeripherals {
        reply: Responder<Vec<DeviceId>>,
    },
    AttachTransport {
        transport: Arc<dyn EmulatorTransport>,
    },

    // -- scanning and advertising -------------------------------------------
    StartScanning {
        central: DeviceId,
        services: Option<Vec<BleUuid>>,
        options: ScanOptions,
    },
    StopScanning {
        central: DeviceId,
    },
    /// One cycle of a central's scan loop.
    ScanTick {
        central: DeviceId,
    },
    StartAdvertising {
        peripheral: DeviceId,
        data: AdvertisementData,
        reply: Responder<EmulatorResult<()>>,
    },
    StopAdvertising {
        peripheral: DeviceId,
    },

    // -- connections ---------------------------------------------------------
    Connect {
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<EmulatorResult<u16>>,
    },
    FinishConnect {
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<EmulatorResult<u16>>,
    },
    Disconnect {
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<EmulatorResult<()>>,
    },
    FinishDisconnect {
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<EmulatorResult<()>>,
    },
    IsConnected {
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<bool>,
    },
    RegisterForConnectionEvents {
        central: DeviceId,
        options: Option<ConnectionEventOptions>,
    },

    // -- attribute operations ------------------------------------------------
    DiscoverServices {
        central: DeviceId,
        peripheral: DeviceId,
        filter: Option<Vec<BleUuid>>,
        reply: Responder<EmulatorResult<Vec<ServiceSnapshot>>>,
    },
    DiscoverIncludedServices {
        central: DeviceId,
        peripheral: DeviceId,
        service: BleUuid,
        filter: Option<Vec<BleUuid>>,
        reply: Responder<EmulatorResult<Vec<ServiceSnapshot>>>,
    },
    DiscoverCharacteristics {
        central: DeviceId,
        peripheral: DeviceId,
        service: BleUuid,
        filter: Option<Vec<BleUuid>>,
        reply: Responder<EmulatorResult<Vec<CharacteristicSnapshot>>>,
    },
    DiscoverDescriptors {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        reply: Responder<EmulatorResult<Vec<DescriptorSnapshot>>>,
    },
    ReadCharacteristic {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        reply: Responder<EmulatorResult<Vec<u8>>>,
    },
    WriteCharacteristic {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        write_type: WriteType,
        reply: Responder<EmulatorResult<()>>,
    },
    ReadDescriptor {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        descriptor: BleUuid,
        reply: Responder<EmulatorResult<Vec<u8>>>,
    },
    WriteDescriptor {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        descriptor: BleUuid,
        value: Vec<u8>,
        reply: Responder<EmulatorResult<()>>,
    },
    SetNotifyValue {
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        enabled: bool,
        reply: Responder<EmulatorResult<()>>,
    },
    ReadRssi {
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<EmulatorResult<i16>>,
    },
    /// Posted by an operation task once its pairing step succeeded.
    RecordPairing {
        central: DeviceId,
        peripheral: DeviceId,
    },
    CanSendWriteWithoutResponse {
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<bool>,
    },
    /// Drain one slot of a pair's write-without-response queue.
    DrainWriteQueue {
        central: DeviceId,
        peripheral: DeviceId,
    },
    NegotiateMtu {
        central: DeviceId,
        peripheral: DeviceId,
        requested: u16,
        reply: Responder<EmulatorResult<u16>>,
    },
    GetMtu {
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<u16>,
    },

    // -- notifications -------------------------------------------------------
    UpdateValue {
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        targets: Option<Vec<DeviceId>>,
        reply: Responder<bool>,
    },
    /// Drain one slot of a characteristic's notification queue.
    DrainNotifyQueue {
        peripheral: DeviceId,
        characteristic: BleUuid,
    },
    /// Fan a value update out to its target centrals.
    DeliverNotifications {
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        targets: Vec<DeviceId>,
    },

    // -- auxiliary events ----------------------------------------------------
    UpdateAncsAuthorization {
        central: DeviceId,
        authorization: AncsAuthorization,
        reply: Responder<()>,
    },
    GetAncsAuthorization {
        central: DeviceId,
        reply: Responder<AncsAuthorization>,
    },
    /// A peripheral removed services; connected centrals learn of it.
    ServicesModified {
        peripheral: DeviceId,
        removed: Vec<ServiceSnapshot>,
    },

    // -- restoration ---------------------------------------------------------
    SaveCentralState {
        central: DeviceId,
        restore_id: String,
        reply: Responder<bool>,
    },
    SavePeripheralState {
        peripheral: DeviceId,
        restore_id: String,
        reply: Responder<bool>,
    },
    RestoreState {
        restore_id: String,
        kind: RestorationKind,
        reply: Responder<Option<Vec<u8>>>,
    },

    // -- L2CAP ---------------------------------------------------------------
    PublishL2cap {
        peripheral: DeviceId,
        requires_encryption: bool,
        reply: Responder<EmulatorResult<u16>>,
    },
    UnpublishL2cap {
        peripheral: DeviceId,
        psm: u16,
        reply: Responder<EmulatorResult<()>>,
    },
    OpenL2cap {
        central: DeviceId,
        peripheral: DeviceId,
        psm: u16,
        reply: Responder<EmulatorResult<L2capChannel>>,
    },

    // -- internal accounting -------------------------------------------------
    /// A tracked delay/operation task ran to completion.
    TaskFinished {
        id: u64,
    },
}
