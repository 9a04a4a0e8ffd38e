//! The EmulatorBus: process-wide coordinator
//!
//! The Bus owns the graph of managers, connections, queues, and schedules.
//! It behaves as an isolated actor: a single task drains one mailbox, so all
//! mutable state is serialized with no external lock discipline. Façades
//! post commands and await oneshot completions; configured delays run as
//! cancellable timer tasks that post a second-phase command back to the
//! mailbox, so the actor itself never sleeps.
//!
//! [`EmulatorBus`] is a cheap clonable handle. [`EmulatorBus::shared`]
//! returns the process-wide instance; tests usually build an isolated one
//! with [`EmulatorBus::new`] so state never leaks between cases.

mod actor;
mod command;

use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::{mpsc, oneshot};

use crate::advertisement::AdvertisementData;
use crate::central::CentralShared;
use crate::config::EmulatorConfig;
use crate::error::{ConnectionError, EmulatorResult};
use crate::gatt::{BleUuid, CharacteristicSnapshot, DescriptorSnapshot, ServiceSnapshot};
use crate::l2cap::L2capChannel;
use crate::peripheral::PeripheralShared;
use crate::restoration::RestorationKind;
use crate::transport::EmulatorTransport;
use crate::types::{
    AncsAuthorization, ConnectionEventOptions, DeviceId, ScanOptions, WriteType,
};

use command::BusCommand;

/// Handle to a running Bus; clones address the same actor.
#[derive(Clone)]
pub struct EmulatorBus {
    tx: mpsc::UnboundedSender<BusCommand>,
}

static SHARED_BUS: OnceLock<EmulatorBus> = OnceLock::new();

impl EmulatorBus {
    /// Spawn a fresh, isolated Bus with the default configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        actor::spawn(tx.clone(), rx);
        Self { tx }
    }

    /// The process-wide Bus, created on first use
    pub fn shared() -> &'static EmulatorBus {
        SHARED_BUS.get_or_init(EmulatorBus::new)
    }

    fn post(&self, command: BusCommand) {
        // A closed mailbox means the runtime is shutting down; commands are
        // dropped, matching the cancelled-operation contract.
        let _ = self.tx.send(command);
    }

    async fn request<T>(&self, rx: oneshot::Receiver<T>, fallback: T) -> T {
        rx.await.unwrap_or(fallback)
    }

    async fn request_result<T>(
        &self,
        rx: oneshot::Receiver<EmulatorResult<T>>,
    ) -> EmulatorResult<T> {
        rx.await
            .unwrap_or(Err(ConnectionError::OperationCancelled.into()))
    }

    // ------------------------------------------------------------------
    // Configuration and lifecycle
    // ------------------------------------------------------------------

    /// Install a configuration snapshot atomically
    pub async fn configure(&self, config: EmulatorConfig) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::Configure {
            config: Box::new(config),
            reply: tx,
        });
        rx.await.unwrap_or(Err("bus unavailable".to_string()))
    }

    pub async fn get_configuration(&self) -> Arc<EmulatorConfig> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::GetConfiguration { reply: tx });
        self.request(rx, Arc::new(EmulatorConfig::default())).await
    }

    /// Cancel every task and clear every map; intended for test teardown.
    pub async fn reset(&self) {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::Reset { reply: tx });
        self.request(rx, ()).await
    }

    pub async fn get_all_centrals(&self) -> Vec<DeviceId> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::GetAllCentrals { reply: tx });
        self.request(rx, Vec::new()).await
    }

    pub async fn get_all_peripherals(&self) -> Vec<DeviceId> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::GetAllPeripherals { reply: tx });
        self.request(rx, Vec::new()).await
    }

    /// Mirror routed events onto a cross-process transport
    pub fn attach_transport(&self, transport: Arc<dyn EmulatorTransport>) {
        self.post(BusCommand::AttachTransport { transport });
    }

    pub(crate) fn register_central(&self, id: DeviceId, handle: Weak<CentralShared>) {
        self.post(BusCommand::RegisterCentral { id, handle });
    }

    pub(crate) fn register_peripheral(&self, id: DeviceId, handle: Weak<PeripheralShared>) {
        self.post(BusCommand::RegisterPeripheral { id, handle });
    }

    pub(crate) fn unregister_central(&self, id: DeviceId) {
        self.post(BusCommand::UnregisterCentral { id });
    }

    pub(crate) fn unregister_peripheral(&self, id: DeviceId) {
        self.post(BusCommand::UnregisterPeripheral { id });
    }

    // ------------------------------------------------------------------
    // Scanning and advertising
    // ------------------------------------------------------------------

    pub(crate) fn start_scanning(
        &self,
        central: DeviceId,
        services: Option<Vec<BleUuid>>,
        options: ScanOptions,
    ) {
        self.post(BusCommand::StartScanning {
            central,
            services,
            options,
        });
    }

    pub(crate) fn stop_scanning(&self, central: DeviceId) {
        self.post(BusCommand::StopScanning { central });
    }

    pub(crate) async fn start_advertising(
        &self,
        peripheral: DeviceId,
        data: AdvertisementData,
    ) -> EmulatorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::StartAdvertising {
            peripheral,
            data,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) fn stop_advertising(&self, peripheral: DeviceId) {
        self.post(BusCommand::StopAdvertising { peripheral });
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Establish a connection; resolves to the initial MTU.
    pub(crate) async fn connect(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
    ) -> EmulatorResult<u16> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::Connect {
            central,
            peripheral,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn disconnect(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
    ) -> EmulatorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::Disconnect {
            central,
            peripheral,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub async fn is_connected(&self, central: DeviceId, peripheral: DeviceId) -> bool {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::IsConnected {
            central,
            peripheral,
            reply: tx,
        });
        self.request(rx, false).await
    }

    pub(crate) fn register_for_connection_events(
        &self,
        central: DeviceId,
        options: Option<ConnectionEventOptions>,
    ) {
        self.post(BusCommand::RegisterForConnectionEvents { central, options });
    }

    // ------------------------------------------------------------------
    // Attribute operations
    // ------------------------------------------------------------------

    pub(crate) async fn discover_services(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        filter: Option<Vec<BleUuid>>,
    ) -> EmulatorResult<Vec<ServiceSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::DiscoverServices {
            central,
            peripheral,
            filter,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn discover_included_services(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        service: BleUuid,
        filter: Option<Vec<BleUuid>>,
    ) -> EmulatorResult<Vec<ServiceSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::DiscoverIncludedServices {
            central,
            peripheral,
            service,
            filter,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn discover_characteristics(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        service: BleUuid,
        filter: Option<Vec<BleUuid>>,
    ) -> EmulatorResult<Vec<CharacteristicSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::DiscoverCharacteristics {
            central,
            peripheral,
            service,
            filter,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn discover_descriptors(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
    ) -> EmulatorResult<Vec<DescriptorSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::DiscoverDescriptors {
            central,
            peripheral,
            characteristic,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn read_characteristic(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
    ) -> EmulatorResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::ReadCharacteristic {
            central,
            peripheral,
            characteristic,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn write_characteristic(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> EmulatorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::WriteCharacteristic {
            central,
            peripheral,
            characteristic,
            value,
            write_type,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn read_descriptor(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        descriptor: BleUuid,
    ) -> EmulatorResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::ReadDescriptor {
            central,
            peripheral,
            characteristic,
            descriptor,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn write_descriptor(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        descriptor: BleUuid,
        value: Vec<u8>,
    ) -> EmulatorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::WriteDescriptor {
            central,
            peripheral,
            characteristic,
            descriptor,
            value,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn set_notify_value(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        enabled: bool,
    ) -> EmulatorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::SetNotifyValue {
            central,
            peripheral,
            characteristic,
            enabled,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn read_rssi(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
    ) -> EmulatorResult<i16> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::ReadRssi {
            central,
            peripheral,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn can_send_write_without_response(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::CanSendWriteWithoutResponse {
            central,
            peripheral,
            reply: tx,
        });
        self.request(rx, false).await
    }

    pub(crate) async fn negotiate_mtu(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        requested: u16,
    ) -> EmulatorResult<u16> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::NegotiateMtu {
            central,
            peripheral,
            requested,
            reply: tx,
        });
        self.request_result(rx).await
    }

    /// Current MTU of a connection, or the configured default when no entry
    /// exists
    pub async fn get_mtu(&self, central: DeviceId, peripheral: DeviceId) -> u16 {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::GetMtu {
            central,
            peripheral,
            reply: tx,
        });
        self.request(rx, crate::config::MIN_MTU).await
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Publish a value update toward subscribed centrals. Returns false when
    /// the characteristic is not notifying or its queue is full.
    pub(crate) async fn update_value(
        &self,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        targets: Option<Vec<DeviceId>>,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::UpdateValue {
            peripheral,
            characteristic,
            value,
            targets,
            reply: tx,
        });
        self.request(rx, false).await
    }

    // ------------------------------------------------------------------
    // Auxiliary events
    // ------------------------------------------------------------------

    pub async fn update_ancs_authorization(
        &self,
        central: DeviceId,
        authorization: AncsAuthorization,
    ) {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::UpdateAncsAuthorization {
            central,
            authorization,
            reply: tx,
        });
        self.request(rx, ()).await
    }

    pub async fn get_ancs_authorization(&self, central: DeviceId) -> AncsAuthorization {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::GetAncsAuthorization {
            central,
            reply: tx,
        });
        self.request(rx, AncsAuthorization::NotDetermined).await
    }

    pub(crate) fn services_modified(&self, peripheral: DeviceId, removed: Vec<ServiceSnapshot>) {
        self.post(BusCommand::ServicesModified { peripheral, removed });
    }

    // ------------------------------------------------------------------
    // Restoration
    // ------------------------------------------------------------------

    /// Serialize a central's connected set and scan state under the given
    /// restore identifier. Returns false when restoration is disabled.
    pub async fn save_central_state(&self, central: DeviceId, restore_id: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::SaveCentralState {
            central,
            restore_id: restore_id.to_string(),
            reply: tx,
        });
        self.request(rx, false).await
    }

    /// Serialize a peripheral's advertising state under the given restore
    /// identifier. Returns false when restoration is disabled.
    pub async fn save_peripheral_state(&self, peripheral: DeviceId, restore_id: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::SavePeripheralState {
            peripheral,
            restore_id: restore_id.to_string(),
            reply: tx,
        });
        self.request(rx, false).await
    }

    /// Fetch the blob stored under a restore identifier, if any
    pub async fn restore_state(&self, restore_id: &str, kind: RestorationKind) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::RestoreState {
            restore_id: restore_id.to_string(),
            kind,
            reply: tx,
        });
        self.request(rx, None).await
    }

    // ------------------------------------------------------------------
    // L2CAP
    // ------------------------------------------------------------------

    pub(crate) async fn publish_l2cap(
        &self,
        peripheral: DeviceId,
        requires_encryption: bool,
    ) -> EmulatorResult<u16> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::PublishL2cap {
            peripheral,
            requires_encryption,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn unpublish_l2cap(
        &self,
        peripheral: DeviceId,
        psm: u16,
    ) -> EmulatorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::UnpublishL2cap {
            peripheral,
            psm,
            reply: tx,
        });
        self.request_result(rx).await
    }

    pub(crate) async fn open_l2cap(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
        psm: u16,
    ) -> EmulatorResult<L2capChannel> {
        let (tx, rx) = oneshot::channel();
        self.post(BusCommand::OpenL2cap {
            central,
            peripheral,
            psm,
            reply: tx,
        });
        self.request_result(rx).await
    }
}

impl Default for EmulatorBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EmulatorBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorBus").finish_non_exhaustive()
    }
}
