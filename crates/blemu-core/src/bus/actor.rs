//! The Bus actor: one task, one mailbox, all the state
//!
//! Handlers never await. Anything with a configured delay is split in two:
//! the first phase spawns a tracked timer task that sleeps and posts the
//! second-phase command (or runs the operation pipeline and resolves the
//! caller's responder directly). Tracked tasks are aborted on `reset` and
//! when their owning entity unregisters, which is what makes every delay
//! deterministically cancellable.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::advertisement::{keys, AdvertisementData, AdvertisementValue};
use crate::bus::command::{BusCommand, Responder};
use crate::central::CentralShared;
use crate::config::EmulatorConfig;
use crate::error::{AttError, ConnectionError, EmulatorError, EmulatorResult};
use crate::gatt::BleUuid;
use crate::l2cap::{L2capChannel, FIRST_DYNAMIC_PSM};
use crate::peripheral::PeripheralShared;
use crate::restoration::{
    encode_blob, CentralStateBlob, PeripheralStateBlob, RestorationKind,
};
use crate::transport::{EmulatorTransport, EventEnvelope, RoutedEvent};
use crate::types::{
    AncsAuthorization, ConnectionEvent, ConnectionEventOptions, DeviceId, ScanOptions, WriteType,
};

pub(crate) fn spawn(tx: UnboundedSender<BusCommand>, mut rx: UnboundedReceiver<BusCommand>) {
    tokio::spawn(async move {
        let mut actor = BusActor::new(tx);
        while let Some(command) = rx.recv().await {
            actor.handle(command);
        }
        debug!("bus mailbox closed; actor exiting");
    });
}

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

struct ScanRegistration {
    services: Option<Vec<BleUuid>>,
    options: ScanOptions,
    /// Peripherals already delivered this scan session, for de-duplication.
    delivered: HashSet<DeviceId>,
}

struct PsmRegistration {
    peripheral: DeviceId,
    requires_encryption: bool,
}

struct TrackedTask {
    owner: Option<DeviceId>,
    handle: JoinHandle<()>,
}

/// How an operation acquires the paired state it may need
enum PairingPlan {
    NotNeeded,
    AutoSucceed,
    Simulated { delay: Duration, succeeds: bool },
}

struct BusActor {
    tx: UnboundedSender<BusCommand>,
    config: Arc<EmulatorConfig>,
    centrals: HashMap<DeviceId, Weak<CentralShared>>,
    peripherals: HashMap<DeviceId, Weak<PeripheralShared>>,
    advertising: HashMap<DeviceId, AdvertisementData>,
    scans: HashMap<DeviceId, ScanRegistration>,
    scan_tasks: HashMap<DeviceId, JoinHandle<()>>,
    connections: HashMap<DeviceId, BTreeSet<DeviceId>>,
    mtus: HashMap<(DeviceId, DeviceId), u16>,
    write_queues: HashMap<(DeviceId, DeviceId), u32>,
    notify_queues: HashMap<(DeviceId, BleUuid), u32>,
    paired: HashSet<(DeviceId, DeviceId)>,
    event_registrations: HashMap<DeviceId, ConnectionEventOptions>,
    ancs: HashMap<DeviceId, AncsAuthorization>,
    restoration: HashMap<(RestorationKind, String), Vec<u8>>,
    psms: HashMap<u16, PsmRegistration>,
    next_psm: u16,
    tracked: HashMap<u64, TrackedTask>,
    next_task: u64,
    transport: Option<Arc<dyn EmulatorTransport>>,
}

impl BusActor {
    fn new(tx: UnboundedSender<BusCommand>) -> Self {
        Self {
            tx,
            config: Arc::new(EmulatorConfig::default()),
            centrals: HashMap::new(),
            peripherals: HashMap::new(),
            advertising: HashMap::new(),
            scans: HashMap::new(),
            scan_tasks: HashMap::new(),
            connections: HashMap::new(),
            mtus: HashMap::new(),
            write_queues: HashMap::new(),
            notify_queues: HashMap::new(),
            paired: HashSet::new(),
            event_registrations: HashMap::new(),
            ancs: HashMap::new(),
            restoration: HashMap::new(),
            psms: HashMap::new(),
            next_psm: FIRST_DYNAMIC_PSM,
            tracked: HashMap::new(),
            next_task: 0,
            transport: None,
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn central(&self, id: DeviceId) -> Option<Arc<CentralShared>> {
        self.centrals.get(&id).and_then(Weak::upgrade)
    }

    fn peripheral(&self, id: DeviceId) -> Option<Arc<PeripheralShared>> {
        self.peripherals.get(&id).and_then(Weak::upgrade)
    }

    fn is_connected(&self, central: DeviceId, peripheral: DeviceId) -> bool {
        self.connections
            .get(&central)
            .is_some_and(|set| set.contains(&peripheral))
    }

    fn mtu_for(&self, central: DeviceId, peripheral: DeviceId) -> u16 {
        self.mtus
            .get(&(central, peripheral))
            .copied()
            .unwrap_or(self.config.mtu.default_mtu)
    }

    fn spawn_tracked<F>(&mut self, owner: Option<DeviceId>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_task;
        self.next_task += 1;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            future.await;
            let _ = tx.send(BusCommand::TaskFinished { id });
        });
        self.tracked.insert(id, TrackedTask { owner, handle });
    }

    /// Sleep the configured delay, then post the second-phase command.
    fn spawn_timer(&mut self, owner: Option<DeviceId>, delay: Duration, command: BusCommand) {
        let tx = self.tx.clone();
        self.spawn_tracked(owner, async move {
            sleep_nonzero(delay).await;
            let _ = tx.send(command);
        });
    }

    fn abort_tasks_owned_by(&mut self, id: DeviceId) {
        self.tracked.retain(|_, task| {
            if task.owner == Some(id) {
                task.handle.abort();
                false
            } else {
                true
            }
        });
    }

    fn pairing_plan(&self, central: DeviceId, peripheral: DeviceId, encrypted: bool) -> PairingPlan {
        let security = &self.config.security;
        if !security.require_pairing || !encrypted || self.paired.contains(&(central, peripheral)) {
            return PairingPlan::NotNeeded;
        }
        if !security.simulate_pairing {
            return PairingPlan::AutoSucceed;
        }
        PairingPlan::Simulated {
            delay: self.config.timing.pairing,
            succeeds: security.pairing_succeeds,
        }
    }

    /// Connection gate shared by every attribute operation
    fn validate_attribute_op(
        &self,
        central: DeviceId,
        peripheral: DeviceId,
    ) -> EmulatorResult<Arc<PeripheralShared>> {
        if !self.is_connected(central, peripheral) {
            return Err(ConnectionError::NotConnected.into());
        }
        self.peripheral(peripheral)
            .ok_or_else(|| ConnectionError::UnknownDevice.into())
    }

    fn mirror(&self, target: DeviceId, event: RoutedEvent) {
        let Some(transport) = &self.transport else {
            return;
        };
        match EventEnvelope::new(target, event).encode() {
            Ok(frame) => {
                let transport = Arc::clone(transport);
                tokio::spawn(async move {
                    if let Err(error) = transport.send(target, frame).await {
                        debug!(%target, %error, "transport mirror dropped");
                    }
                });
            }
            Err(error) => warn!(%target, %error, "routed event failed to serialize"),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn handle(&mut self, command: BusCommand) {
        match command {
            BusCommand::RegisterCentral { id, handle } => {
                info!(central = %id, "central registered");
                self.centrals.insert(id, handle);
            }
            BusCommand::RegisterPeripheral { id, handle } => {
                info!(peripheral = %id, "peripheral registered");
                self.peripherals.insert(id, handle);
            }
            BusCommand::UnregisterCentral { id } => self.unregister_central(id),
            BusCommand::UnregisterPeripheral { id } => self.unregister_peripheral(id),
            BusCommand::Configure { config, reply } => {
                let result = config.validate();
                if result.is_ok() {
                    info!("configuration installed");
                    self.config = Arc::new(*config);
                }
                let _ = reply.send(result);
            }
            BusCommand::GetConfiguration { reply } => {
                let _ = reply.send(Arc::clone(&self.config));
            }
            BusCommand::Reset { reply } => {
                self.reset();
                let _ = reply.send(());
            }
            BusCommand::GetAllCentrals { reply } => {
                let _ = reply.send(self.centrals.keys().copied().collect());
            }
            BusCommand::GetAllPeripherals { reply } => {
                let _ = reply.send(self.peripherals.keys().copied().collect());
            }
            BusCommand::AttachTransport { transport } => {
                info!("transport attached");
                self.transport = Some(transport);
            }

            BusCommand::StartScanning {
                central,
                services,
                options,
            } => self.start_scanning(central, services, options),
            BusCommand::StopScanning { central } => self.stop_scanning(central),
            BusCommand::ScanTick { central } => self.scan_tick(central),
            BusCommand::StartAdvertising {
                peripheral,
                data,
                reply,
            } => {
                let _ = reply.send(self.start_advertising(peripheral, data));
            }
            BusCommand::StopAdvertising { peripheral } => {
                debug!(%peripheral, "advertising stopped");
                self.advertising.remove(&peripheral);
            }

            BusCommand::Connect {
                central,
                peripheral,
                reply,
            } => {
                let delay = self.config.timing.connection;
                self.spawn_timer(
                    Some(central),
                    delay,
                    BusCommand::FinishConnect {
                        central,
                        peripheral,
                        reply,
                    },
                );
            }
            BusCommand::FinishConnect {
                central,
                peripheral,
                reply,
            } => self.finish_connect(central, peripheral, reply),
            BusCommand::Disconnect {
                central,
                peripheral,
                reply,
            } => {
                let delay = self.config.timing.disconnection;
                self.spawn_timer(
                    Some(central),
                    delay,
                    BusCommand::FinishDisconnect {
                        central,
                        peripheral,
                        reply,
                    },
                );
            }
            BusCommand::FinishDisconnect {
                central,
                peripheral,
                reply,
            } => self.finish_disconnect(central, peripheral, reply),
            BusCommand::IsConnected {
                central,
                peripheral,
                reply,
            } => {
                let _ = reply.send(self.is_connected(central, peripheral));
            }
            BusCommand::RegisterForConnectionEvents { central, options } => {
                self.event_registrations
                    .insert(central, options.unwrap_or_default());
            }

            BusCommand::DiscoverServices {
                central,
                peripheral,
                filter,
                reply,
            } => self.discover_services(central, peripheral, filter, reply),
            BusCommand::DiscoverIncludedServices {
                central,
                peripheral,
                service,
                filter,
                reply,
            } => self.discover_included_services(central, peripheral, service, filter, reply),
            BusCommand::DiscoverCharacteristics {
                central,
                peripheral,
                service,
                filter,
                reply,
            } => self.discover_characteristics(central, peripheral, service, filter, reply),
            BusCommand::DiscoverDescriptors {
                central,
                peripheral,
                characteristic,
                reply,
            } => self.discover_descriptors(central, peripheral, characteristic, reply),
            BusCommand::ReadCharacteristic {
                central,
                peripheral,
                characteristic,
                reply,
            } => self.read_characteristic(central, peripheral, characteristic, reply),
            BusCommand::WriteCharacteristic {
                central,
                peripheral,
                characteristic,
                value,
                write_type,
                reply,
            } => match write_type {
                WriteType::WithResponse => {
                    self.write_characteristic(central, peripheral, characteristic, value, reply)
                }
                WriteType::WithoutResponse => self.write_without_response(
                    central,
                    peripheral,
                    characteristic,
                    value,
                    reply,
                ),
            },
            BusCommand::ReadDescriptor {
                central,
                peripheral,
                characteristic,
                descriptor,
                reply,
            } => self.read_descriptor(central, peripheral, characteristic, descriptor, reply),
            BusCommand::WriteDescriptor {
                central,
                peripheral,
                characteristic,
                descriptor,
                value,
                reply,
            } => self.write_descriptor(central, peripheral, characteristic, descriptor, value, reply),
            BusCommand::SetNotifyValue {
                central,
                peripheral,
                characteristic,
                enabled,
                reply,
            } => self.set_notify_value(central, peripheral, characteristic, enabled, reply),
            BusCommand::ReadRssi {
                central,
                peripheral,
                reply,
            } => self.read_rssi(central, peripheral, reply),
            BusCommand::RecordPairing {
                central,
                peripheral,
            } => {
                debug!(%central, %peripheral, "pair recorded");
                self.paired.insert((central, peripheral));
            }
            BusCommand::CanSendWriteWithoutResponse {
                central,
                peripheral,
                reply,
            } => {
                let _ = reply.send(self.can_send_write_without_response(central, peripheral));
            }
            BusCommand::DrainWriteQueue {
                central,
                peripheral,
            } => self.drain_write_queue(central, peripheral),
            BusCommand::NegotiateMtu {
                central,
                peripheral,
                requested,
                reply,
            } => self.negotiate_mtu(central, peripheral, requested, reply),
            BusCommand::GetMtu {
                central,
                peripheral,
                reply,
            } => {
                let _ = reply.send(self.mtu_for(central, peripheral));
            }

            BusCommand::UpdateValue {
                peripheral,
                characteristic,
                value,
                targets,
                reply,
            } => {
                let _ = reply.send(self.update_value(peripheral, characteristic, value, targets));
            }
            BusCommand::DrainNotifyQueue {
                peripheral,
                characteristic,
            } => self.drain_notify_queue(peripheral, characteristic),
            BusCommand::DeliverNotifications {
                peripheral,
                characteristic,
                value,
                targets,
            } => self.deliver_notifications(peripheral, characteristic, value, targets),

            BusCommand::UpdateAncsAuthorization {
                central,
                authorization,
                reply,
            } => {
                self.update_ancs_authorization(central, authorization);
                let _ = reply.send(());
            }
            BusCommand::GetAncsAuthorization { central, reply } => {
                let _ = reply.send(self.ancs.get(&central).copied().unwrap_or_default());
            }
            BusCommand::ServicesModified { peripheral, removed } => {
                for (central, set) in &self.connections {
                    if set.contains(&peripheral) {
                        if let Some(shared) = self.central(*central) {
                            shared.deliver_services_modified(peripheral, removed.clone());
                        }
                    }
                }
            }

            BusCommand::SaveCentralState {
                central,
                restore_id,
                reply,
            } => {
                let _ = reply.send(self.save_central_state(central, restore_id));
            }
            BusCommand::SavePeripheralState {
                peripheral,
                restore_id,
                reply,
            } => {
                let _ = reply.send(self.save_peripheral_state(peripheral, restore_id));
            }
            BusCommand::RestoreState {
                restore_id,
                kind,
                reply,
            } => {
                let _ = reply.send(self.restoration.get(&(kind, restore_id)).cloned());
            }

            BusCommand::PublishL2cap {
                peripheral,
                requires_encryption,
                reply,
            } => {
                let _ = reply.send(self.publish_l2cap(peripheral, requires_encryption));
            }
            BusCommand::UnpublishL2cap {
                peripheral,
                psm,
                reply,
            } => {
                let _ = reply.send(self.unpublish_l2cap(peripheral, psm));
            }
            BusCommand::OpenL2cap {
                central,
                peripheral,
                psm,
                reply,
            } => self.open_l2cap(central, peripheral, psm, reply),

            BusCommand::TaskFinished { id } => {
                self.tracked.remove(&id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn unregister_central(&mut self, id: DeviceId) {
        info!(central = %id, "central unregistered");
        self.centrals.remove(&id);
        if let Some(task) = self.scan_tasks.remove(&id) {
            task.abort();
        }
        self.scans.remove(&id);
        if let Some(peripherals) = self.connections.remove(&id) {
            for peripheral in peripherals {
                self.clear_pair_state(id, peripheral);
                if let Some(shared) = self.peripheral(peripheral) {
                    shared.notify_central_disconnected(id, self.config.mtu.default_mtu);
                }
            }
        }
        self.event_registrations.remove(&id);
        self.ancs.remove(&id);
        self.abort_tasks_owned_by(id);
    }

    fn unregister_peripheral(&mut self, id: DeviceId) {
        info!(peripheral = %id, "peripheral unregistered");
        self.peripherals.remove(&id);
        self.advertising.remove(&id);
        self.psms.retain(|_, registration| registration.peripheral != id);
        self.notify_queues.retain(|(peripheral, _), _| *peripheral != id);

        let mut affected = Vec::new();
        for (central, set) in self.connections.iter_mut() {
            if set.remove(&id) {
                affected.push(*central);
            }
        }
        self.connections.retain(|_, set| !set.is_empty());
        for central in affected {
            self.clear_pair_state(central, id);
            if let Some(shared) = self.central(central) {
                shared.deliver_peripheral_disconnected(
                    id,
                    Some(ConnectionError::PeripheralDisconnected.into()),
                );
            }
        }
        self.abort_tasks_owned_by(id);
    }

    fn clear_pair_state(&mut self, central: DeviceId, peripheral: DeviceId) {
        self.mtus.remove(&(central, peripheral));
        self.write_queues.remove(&(central, peripheral));
        self.paired.remove(&(central, peripheral));
    }

    fn reset(&mut self) {
        info!("bus reset");
        for (_, task) in self.scan_tasks.drain() {
            task.abort();
        }
        for (_, task) in self.tracked.drain() {
            task.handle.abort();
        }
        self.centrals.clear();
        self.peripherals.clear();
        self.advertising.clear();
        self.scans.clear();
        self.connections.clear();
        self.mtus.clear();
        self.write_queues.clear();
        self.notify_queues.clear();
        self.paired.clear();
        self.event_registrations.clear();
        self.ancs.clear();
        self.restoration.clear();
        self.psms.clear();
        self.next_psm = FIRST_DYNAMIC_PSM;
        self.transport = None;
    }

    // ------------------------------------------------------------------
    // Scanning and advertising
    // ------------------------------------------------------------------

    fn start_scanning(
        &mut self,
        central: DeviceId,
        services: Option<Vec<BleUuid>>,
        options: ScanOptions,
    ) {
        debug!(%central, ?services, "scan started");
        self.scans.insert(
            central,
            ScanRegistration {
                services,
                options,
                delivered: HashSet::new(),
            },
        );
        if let Some(previous) = self.scan_tasks.remove(&central) {
            previous.abort();
        }
        let period = self.config.timing.scan_interval.max(Duration::from_millis(1));
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if tx.send(BusCommand::ScanTick { central }).is_err() {
                    return;
                }
            }
        });
        self.scan_tasks.insert(central, handle);
    }

    fn stop_scanning(&mut self, central: DeviceId) {
        debug!(%central, "scan stopped");
        if let Some(task) = self.scan_tasks.remove(&central) {
            task.abort();
        }
        self.scans.remove(&central);
    }

    fn start_advertising(
        &mut self,
        peripheral: DeviceId,
        data: AdvertisementData,
    ) -> EmulatorResult<()> {
        if self.advertising.contains_key(&peripheral) {
            return Err(ConnectionError::AlreadyAdvertising.into());
        }
        debug!(%peripheral, "advertising started");
        self.advertising.insert(peripheral, data);
        Ok(())
    }

    /// One cycle of a central's scan loop: run the matcher over the current
    /// advertising set and deliver what passes.
    fn scan_tick(&mut self, central: DeviceId) {
        let Some(central_shared) = self.central(central) else {
            return;
        };
        let config = Arc::clone(&self.config);
        let live_peripherals: HashSet<DeviceId> = self
            .peripherals
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect();
        let candidates: Vec<(DeviceId, AdvertisementData)> = self
            .advertising
            .iter()
            .filter(|(id, _)| live_peripherals.contains(id))
            .map(|(id, data)| (*id, data.clone()))
            .collect();

        let Some(registration) = self.scans.get_mut(&central) else {
            return;
        };
        let mut deliveries = Vec::new();
        for (peripheral, stored) in candidates {
            if let Some(filter) = &registration.services {
                if !intersects(&stored.service_uuids(), filter) {
                    continue;
                }
            }
            if config.scan.honor_solicited_service_uuids {
                if let Some(solicited) = &registration.options.solicited_service_uuids {
                    if !intersects(&stored.solicited_service_uuids(), solicited) {
                        continue;
                    }
                }
            }
            let allow_duplicates =
                config.scan.honor_allow_duplicates && registration.options.allow_duplicates;
            if !allow_duplicates && !registration.delivered.insert(peripheral) {
                continue;
            }
            let advertisement = synthesize_advertisement(&stored, &config);
            let rssi = config.rssi.sample();
            deliveries.push((peripheral, advertisement, rssi));
        }

        for (peripheral, advertisement, rssi) in deliveries {
            central_shared.deliver_discovered(peripheral, advertisement.clone(), rssi);
            self.mirror(
                central,
                RoutedEvent::Discovered {
                    central,
                    peripheral,
                    advertisement,
                    rssi,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    fn finish_connect(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<EmulatorResult<u16>>,
    ) {
        if self.config.faults.should_fail_connection() {
            debug!(%central, %peripheral, "injected connection failure");
            let _ = reply.send(Err(ConnectionError::ConnectionFailed.into()));
            return;
        }
        if self.central(central).is_none() || self.peripheral(peripheral).is_none() {
            let _ = reply.send(Err(ConnectionError::UnknownDevice.into()));
            return;
        }
        if self.is_connected(central, peripheral) {
            let _ = reply.send(Ok(self.mtu_for(central, peripheral)));
            return;
        }

        self.connections.entry(central).or_default().insert(peripheral);
        let mtu = self.config.mtu.default_mtu;
        self.mtus.insert((central, peripheral), mtu);
        info!(%central, %peripheral, mtu, "connected");

        if self.config.events.fire_connection_events
            && self.event_registrations.contains_key(&central)
        {
            if let Some(shared) = self.central(central) {
                shared.deliver_connection_event(ConnectionEvent::PeerConnected, peripheral);
            }
        }
        self.mirror(
            central,
            RoutedEvent::Connected {
                central,
                peripheral,
                mtu,
            },
        );
        let _ = reply.send(Ok(mtu));
    }

    fn finish_disconnect(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<EmulatorResult<()>>,
    ) {
        let was_connected = self
            .connections
            .get_mut(&central)
            .is_some_and(|set| set.remove(&peripheral));
        if self.connections.get(&central).is_some_and(BTreeSet::is_empty) {
            self.connections.remove(&central);
        }
        self.clear_pair_state(central, peripheral);

        // Bidirectional, idempotent cleanup: the peripheral side drops this
        // central from every subscriber list it appears in.
        if let Some(shared) = self.peripheral(peripheral) {
            shared.notify_central_disconnected(central, self.config.mtu.default_mtu);
        }

        if was_connected {
            info!(%central, %peripheral, "disconnected");
            if self.config.events.fire_connection_events
                && self.event_registrations.contains_key(&central)
            {
                if let Some(shared) = self.central(central) {
                    shared.deliver_connection_event(ConnectionEvent::PeerDisconnected, peripheral);
                }
            }
            self.mirror(
                central,
                RoutedEvent::Disconnected {
                    central,
                    peripheral,
                },
            );
        }
        let _ = reply.send(Ok(()));
    }

    fn negotiate_mtu(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        requested: u16,
        reply: Responder<EmulatorResult<u16>>,
    ) {
        if !self.is_connected(central, peripheral) {
            let _ = reply.send(Err(ConnectionError::NotConnected.into()));
            return;
        }
        let mtu = requested.min(self.config.mtu.maximum_mtu);
        self.mtus.insert((central, peripheral), mtu);
        debug!(%central, %peripheral, mtu, "MTU negotiated");
        self.mirror(
            central,
            RoutedEvent::MtuUpdated {
                central,
                peripheral,
                mtu,
            },
        );
        let _ = reply.send(Ok(mtu));
    }

    // ------------------------------------------------------------------
    // Attribute operations
    // ------------------------------------------------------------------

    fn discover_services(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        filter: Option<Vec<BleUuid>>,
        reply: Responder<EmulatorResult<Vec<crate::gatt::ServiceSnapshot>>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let delay = self.config.timing.service_discovery;
        self.spawn_tracked(Some(central), async move {
            sleep_nonzero(delay).await;
            let _ = reply.send(Ok(shared.service_snapshots(filter.as_deref())));
        });
    }

    fn discover_included_services(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        service: BleUuid,
        filter: Option<Vec<BleUuid>>,
        reply: Responder<EmulatorResult<Vec<crate::gatt::ServiceSnapshot>>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let delay = self.config.timing.service_discovery;
        self.spawn_tracked(Some(central), async move {
            sleep_nonzero(delay).await;
            let result = shared
                .included_service_snapshots(service, filter.as_deref())
                .map_err(Into::into);
            let _ = reply.send(result);
        });
    }

    fn discover_characteristics(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        service: BleUuid,
        filter: Option<Vec<BleUuid>>,
        reply: Responder<EmulatorResult<Vec<crate::gatt::CharacteristicSnapshot>>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let delay = self.config.timing.characteristic_discovery;
        self.spawn_tracked(Some(central), async move {
            sleep_nonzero(delay).await;
            let result = shared
                .characteristic_snapshots(service, filter.as_deref())
                .map_err(Into::into);
            let _ = reply.send(result);
        });
    }

    fn discover_descriptors(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        reply: Responder<EmulatorResult<Vec<crate::gatt::DescriptorSnapshot>>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let delay = self.config.timing.descriptor_discovery;
        self.spawn_tracked(Some(central), async move {
            sleep_nonzero(delay).await;
            let result = shared
                .descriptor_snapshots(characteristic)
                .map_err(Into::into);
            let _ = reply.send(result);
        });
    }

    fn read_characteristic(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        reply: Responder<EmulatorResult<Vec<u8>>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let Some(security) = shared.characteristic_security(characteristic) else {
            let _ = reply.send(Err(AttError::AttributeNotFound.into()));
            return;
        };
        let plan = self.pairing_plan(central, peripheral, security.read_encrypted);
        let config = Arc::clone(&self.config);
        let tx = self.tx.clone();
        self.spawn_tracked(Some(central), async move {
            let result = async {
                run_pairing(plan, &tx, central, peripheral).await?;
                sleep_nonzero(config.timing.read).await;
                if config.faults.should_fail_read_write() {
                    return Err(AttError::ReadNotPermitted.into());
                }
                shared
                    .handle_read(central, characteristic)
                    .map_err(EmulatorError::from)
            }
            .await;
            let _ = reply.send(result);
        });
    }

    fn write_characteristic(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        reply: Responder<EmulatorResult<()>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let Some(security) = shared.characteristic_security(characteristic) else {
            let _ = reply.send(Err(AttError::AttributeNotFound.into()));
            return;
        };
        let plan = self.pairing_plan(central, peripheral, security.write_encrypted);
        let config = Arc::clone(&self.config);
        let tx = self.tx.clone();
        self.spawn_tracked(Some(central), async move {
            let result = async {
                run_pairing(plan, &tx, central, peripheral).await?;
                sleep_nonzero(config.timing.write).await;
                if config.faults.should_fail_read_write() {
                    return Err(AttError::WriteNotPermitted.into());
                }
                shared
                    .handle_write(central, characteristic, value, WriteType::WithResponse)
                    .map_err(EmulatorError::from)
            }
            .await;
            let _ = reply.send(result);
        });
    }

    /// Write-without-response: enqueue, schedule the drain, reply, and let
    /// the processing pipeline run with no completion callback.
    fn write_without_response(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        reply: Responder<EmulatorResult<()>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let Some(security) = shared.characteristic_security(characteristic) else {
            let _ = reply.send(Err(AttError::AttributeNotFound.into()));
            return;
        };

        let cap = self.config.backpressure.max_write_without_response_queue;
        let simulate = self.config.backpressure.simulate_backpressure;
        let counter = self.write_queues.entry((central, peripheral)).or_insert(0);
        if simulate && *counter >= cap {
            let _ = reply.send(Err(AttError::PrepareQueueFull.into()));
            return;
        }
        *counter += 1;

        let drain_delay = self.config.timing.backpressure_processing;
        self.spawn_timer(
            Some(central),
            drain_delay,
            BusCommand::DrainWriteQueue {
                central,
                peripheral,
            },
        );

        let plan = self.pairing_plan(central, peripheral, security.write_encrypted);
        let config = Arc::clone(&self.config);
        let tx = self.tx.clone();
        self.spawn_tracked(Some(central), async move {
            let outcome = async {
                run_pairing(plan, &tx, central, peripheral).await?;
                sleep_nonzero(config.timing.backpressure_processing).await;
                if config.faults.should_fail_read_write() {
                    return Err(AttError::WriteNotPermitted.into());
                }
                shared
                    .handle_write(central, characteristic, value, WriteType::WithoutResponse)
                    .map_err(EmulatorError::from)
            }
            .await;
            if let Err(error) = outcome {
                debug!(%central, %peripheral, %error, "write-without-response dropped");
            }
        });
        let _ = reply.send(Ok(()));
    }

    fn can_send_write_without_response(&self, central: DeviceId, peripheral: DeviceId) -> bool {
        if !self.config.backpressure.simulate_backpressure {
            return true;
        }
        let count = self
            .write_queues
            .get(&(central, peripheral))
            .copied()
            .unwrap_or(0);
        count < self.config.backpressure.max_write_without_response_queue
    }

    fn drain_write_queue(&mut self, central: DeviceId, peripheral: DeviceId) {
        let Some(counter) = self.write_queues.get_mut(&(central, peripheral)) else {
            return;
        };
        let cap = self.config.backpressure.max_write_without_response_queue;
        let was_at_cap = *counter >= cap;
        *counter = counter.saturating_sub(1);
        let now_below = *counter == cap.saturating_sub(1);
        if self.config.backpressure.simulate_backpressure && was_at_cap && now_below {
            if let Some(shared) = self.central(central) {
                shared.deliver_ready_for_write_without_response(peripheral);
            }
        }
    }

    fn read_descriptor(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        descriptor: BleUuid,
        reply: Responder<EmulatorResult<Vec<u8>>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let Some(security) = shared.descriptor_security(characteristic, descriptor) else {
            let _ = reply.send(Err(AttError::AttributeNotFound.into()));
            return;
        };
        let plan = self.pairing_plan(central, peripheral, security.read_encrypted);
        let config = Arc::clone(&self.config);
        let tx = self.tx.clone();
        self.spawn_tracked(Some(central), async move {
            let result = async {
                run_pairing(plan, &tx, central, peripheral).await?;
                sleep_nonzero(config.timing.read).await;
                if config.faults.should_fail_read_write() {
                    return Err(AttError::ReadNotPermitted.into());
                }
                shared
                    .handle_read_descriptor(central, characteristic, descriptor)
                    .map_err(EmulatorError::from)
            }
            .await;
            let _ = reply.send(result);
        });
    }

    fn write_descriptor(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        descriptor: BleUuid,
        value: Vec<u8>,
        reply: Responder<EmulatorResult<()>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let Some(security) = shared.descriptor_security(characteristic, descriptor) else {
            let _ = reply.send(Err(AttError::AttributeNotFound.into()));
            return;
        };
        let plan = self.pairing_plan(central, peripheral, security.write_encrypted);
        let config = Arc::clone(&self.config);
        let tx = self.tx.clone();
        self.spawn_tracked(Some(central), async move {
            let result = async {
                run_pairing(plan, &tx, central, peripheral).await?;
                sleep_nonzero(config.timing.write).await;
                if config.faults.should_fail_read_write() {
                    return Err(AttError::WriteNotPermitted.into());
                }
                shared
                    .handle_write_descriptor(central, characteristic, descriptor, value)
                    .map_err(EmulatorError::from)
            }
            .await;
            let _ = reply.send(result);
        });
    }

    fn set_notify_value(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        characteristic: BleUuid,
        enabled: bool,
        reply: Responder<EmulatorResult<()>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let Some(security) = shared.characteristic_security(characteristic) else {
            let _ = reply.send(Err(AttError::AttributeNotFound.into()));
            return;
        };
        if !security.supports_subscriptions {
            let _ = reply.send(Err(AttError::RequestNotSupported.into()));
            return;
        }
        let plan = self.pairing_plan(central, peripheral, security.subscribe_encrypted);
        let mtu = self.mtu_for(central, peripheral);
        let config = Arc::clone(&self.config);
        let tx = self.tx.clone();
        self.spawn_tracked(Some(central), async move {
            let result = async {
                run_pairing(plan, &tx, central, peripheral).await?;
                sleep_nonzero(config.timing.notification).await;
                shared
                    .handle_set_notify(central, characteristic, enabled, mtu)
                    .map_err(EmulatorError::from)
            }
            .await;
            let _ = reply.send(result);
        });
    }

    fn read_rssi(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        reply: Responder<EmulatorResult<i16>>,
    ) {
        if !self.is_connected(central, peripheral) {
            let _ = reply.send(Err(ConnectionError::NotConnected.into()));
            return;
        }
        let config = Arc::clone(&self.config);
        self.spawn_tracked(Some(central), async move {
            sleep_nonzero(config.timing.read).await;
            let _ = reply.send(Ok(config.rssi.sample()));
        });
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn update_value(
        &mut self,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        targets: Option<Vec<DeviceId>>,
    ) -> bool {
        let Some(shared) = self.peripheral(peripheral) else {
            debug!(%peripheral, "update from unknown peripheral");
            return false;
        };
        let subscribers = shared.subscribers_of(characteristic);
        if subscribers.is_empty() {
            return false;
        }
        let targets: Vec<DeviceId> = match targets {
            Some(subset) => subset
                .into_iter()
                .filter(|id| subscribers.contains(id))
                .collect(),
            None => subscribers,
        };

        let cap = self.config.backpressure.max_notification_queue;
        let counter = self
            .notify_queues
            .entry((peripheral, characteristic))
            .or_insert(0);
        if self.config.backpressure.simulate_backpressure && *counter >= cap {
            debug!(%peripheral, %characteristic, "notification queue full");
            return false;
        }
        *counter += 1;

        let drain_delay = self.config.timing.backpressure_processing;
        self.spawn_timer(
            Some(peripheral),
            drain_delay,
            BusCommand::DrainNotifyQueue {
                peripheral,
                characteristic,
            },
        );
        let notify_delay = self.config.timing.notification;
        self.spawn_timer(
            Some(peripheral),
            notify_delay,
            BusCommand::DeliverNotifications {
                peripheral,
                characteristic,
                value,
                targets,
            },
        );
        true
    }

    fn drain_notify_queue(&mut self, peripheral: DeviceId, characteristic: BleUuid) {
        let Some(counter) = self.notify_queues.get_mut(&(peripheral, characteristic)) else {
            return;
        };
        let cap = self.config.backpressure.max_notification_queue;
        let was_at_cap = *counter >= cap;
        *counter = counter.saturating_sub(1);
        let now_below = *counter == cap.saturating_sub(1);
        if self.config.backpressure.simulate_backpressure && was_at_cap && now_below {
            if let Some(shared) = self.peripheral(peripheral) {
                shared.deliver_ready_to_update();
            }
        }
    }

    fn deliver_notifications(
        &mut self,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        targets: Vec<DeviceId>,
    ) {
        for central in targets {
            if let Some(shared) = self.central(central) {
                shared.deliver_value_update(peripheral, characteristic, value.clone());
            }
            self.mirror(
                central,
                RoutedEvent::Notification {
                    peripheral,
                    characteristic,
                    value: value.clone(),
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Auxiliary events
    // ------------------------------------------------------------------

    fn update_ancs_authorization(&mut self, central: DeviceId, authorization: AncsAuthorization) {
        self.ancs.insert(central, authorization);
        if !self.config.events.fire_ancs_authorization_updates {
            return;
        }
        for weak in self.peripherals.values() {
            if let Some(shared) = weak.upgrade() {
                shared.deliver_ancs_update(central, authorization);
            }
        }
        if let Some(shared) = self.central(central) {
            for peripheral in self.connections.get(&central).cloned().unwrap_or_default() {
                shared.deliver_ancs_authorization_changed(peripheral);
            }
        }
    }

    // ------------------------------------------------------------------
    // Restoration
    // ------------------------------------------------------------------

    fn save_central_state(&mut self, central: DeviceId, restore_id: String) -> bool {
        if !self.config.restoration.state_restoration_enabled {
            return false;
        }
        let blob = CentralStateBlob {
            peripherals: self
                .connections
                .get(&central)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
            scan_services: self.scans.get(&central).and_then(|r| r.services.clone()),
            scan_options: self.scans.get(&central).map(|r| r.options.clone()),
        };
        debug!(%central, restore_id, "central state saved");
        self.restoration
            .insert((RestorationKind::Central, restore_id), encode_blob(&blob));
        true
    }

    fn save_peripheral_state(&mut self, peripheral: DeviceId, restore_id: String) -> bool {
        if !self.config.restoration.state_restoration_enabled {
            return false;
        }
        let blob = PeripheralStateBlob {
            advertising: self.advertising.contains_key(&peripheral),
            advertisement: self.advertising.get(&peripheral).cloned(),
            services: self
                .peripheral(peripheral)
                .map(|shared| shared.service_snapshots(None))
                .unwrap_or_default(),
        };
        debug!(%peripheral, restore_id, "peripheral state saved");
        self.restoration
            .insert((RestorationKind::Peripheral, restore_id), encode_blob(&blob));
        true
    }

    // ------------------------------------------------------------------
    // L2CAP
    // ------------------------------------------------------------------

    fn publish_l2cap(
        &mut self,
        peripheral: DeviceId,
        requires_encryption: bool,
    ) -> EmulatorResult<u16> {
        if self.peripheral(peripheral).is_none() {
            return Err(ConnectionError::UnknownDevice.into());
        }
        let psm = self.next_psm;
        self.next_psm += 1;
        self.psms.insert(
            psm,
            PsmRegistration {
                peripheral,
                requires_encryption,
            },
        );
        debug!(%peripheral, psm, "PSM published");
        Ok(psm)
    }

    fn unpublish_l2cap(&mut self, peripheral: DeviceId, psm: u16) -> EmulatorResult<()> {
        match self.psms.get(&psm) {
            Some(registration) if registration.peripheral == peripheral => {
                self.psms.remove(&psm);
                debug!(%peripheral, psm, "PSM unpublished");
                Ok(())
            }
            _ => Err(ConnectionError::InvalidParameters.into()),
        }
    }

    fn open_l2cap(
        &mut self,
        central: DeviceId,
        peripheral: DeviceId,
        psm: u16,
        reply: Responder<EmulatorResult<L2capChannel>>,
    ) {
        let shared = match self.validate_attribute_op(central, peripheral) {
            Ok(shared) => shared,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let requires_encryption = match self.psms.get(&psm) {
            Some(registration) if registration.peripheral == peripheral => {
                registration.requires_encryption
            }
            _ => {
                let _ = reply.send(Err(ConnectionError::InvalidParameters.into()));
                return;
            }
        };
        let plan = self.pairing_plan(central, peripheral, requires_encryption);
        let config = Arc::clone(&self.config);
        let tx = self.tx.clone();
        self.spawn_tracked(Some(central), async move {
            let result = async {
                run_pairing(plan, &tx, central, peripheral).await?;
                sleep_nonzero(config.timing.connection).await;
                let (central_end, peripheral_end) = L2capChannel::pair(psm, central, peripheral);
                shared.deliver_l2cap_open(peripheral_end);
                Ok(central_end)
            }
            .await;
            let _ = reply.send(result);
        });
    }
}

// ----------------------------------------------------------------------------
// Free helpers
// ----------------------------------------------------------------------------

async fn sleep_nonzero(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Execute a pairing plan; successful pairing is recorded via the mailbox.
async fn run_pairing(
    plan: PairingPlan,
    tx: &UnboundedSender<BusCommand>,
    central: DeviceId,
    peripheral: DeviceId,
) -> EmulatorResult<()> {
    match plan {
        PairingPlan::NotNeeded => Ok(()),
        PairingPlan::AutoSucceed => {
            let _ = tx.send(BusCommand::RecordPairing {
                central,
                peripheral,
            });
            Ok(())
        }
        PairingPlan::Simulated { delay, succeeds } => {
            sleep_nonzero(delay).await;
            if succeeds {
                let _ = tx.send(BusCommand::RecordPairing {
                    central,
                    peripheral,
                });
                Ok(())
            } else {
                Err(AttError::InsufficientAuthentication.into())
            }
        }
    }
}

fn intersects(advertised: &[BleUuid], filter: &[BleUuid]) -> bool {
    advertised.iter().any(|uuid| filter.contains(uuid))
}

/// Delivery copy of an advertisement, with synthesized defaults for missing
/// fields when the configuration asks for them. The stored record is never
/// mutated.
fn synthesize_advertisement(
    stored: &AdvertisementData,
    config: &EmulatorConfig,
) -> AdvertisementData {
    let mut delivered = stored.clone();
    if config.advertisement.auto_generate_advertisement_fields {
        if !delivered.contains_key(keys::TX_POWER_LEVEL) {
            delivered.insert(
                keys::TX_POWER_LEVEL,
                AdvertisementValue::Number(fastrand::i64(-12..=-4)),
            );
        }
        if !delivered.contains_key(keys::IS_CONNECTABLE) {
            delivered.insert(keys::IS_CONNECTABLE, AdvertisementValue::Bool(true));
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersects_compares_by_value() {
        let advertised = [BleUuid::from(0x180D_u16)];
        let filter = ["0000180d-0000-1000-8000-00805f9b34fb".parse::<BleUuid>().unwrap()];
        assert!(intersects(&advertised, &filter));
        assert!(!intersects(&advertised, &[BleUuid::from(0x1810_u16)]));
    }

    #[test]
    fn synthesis_fills_only_missing_fields() {
        let config = EmulatorConfig::default();
        let stored = AdvertisementData::new()
            .with_local_name("HR")
            .with_tx_power_level(-2);

        let delivered = synthesize_advertisement(&stored, &config);
        assert_eq!(delivered.tx_power_level(), Some(-2));
        assert_eq!(delivered.is_connectable(), Some(true));
        // Stored record untouched.
        assert_eq!(stored.is_connectable(), None);

        let generated = synthesize_advertisement(&AdvertisementData::new(), &config);
        let tx_power = generated.tx_power_level().unwrap();
        assert!((-12..=-4).contains(&tx_power));
    }

    #[test]
    fn synthesis_is_disabled_by_configuration() {
        let mut config = EmulatorConfig::default();
        config.advertisement.auto_generate_advertisement_fields = false;
        let delivered = synthesize_advertisement(&AdvertisementData::new(), &config);
        assert!(delivered.is_empty());
    }
}
