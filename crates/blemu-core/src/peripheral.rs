//! Peripheral manager façade
//!
//! Owns the services it has added (and an index of their characteristics by
//! UUID), the advertising flag, and a local notification-queue counter per
//! characteristic that provides immediate back-pressure before the Bus's
//! queue accounting applies. Attribute state is mutated only through this
//! façade's methods; the Bus calls the crate-internal `handle_*` surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::debug;

use crate::advertisement::AdvertisementData;
use crate::bus::EmulatorBus;
use crate::delegate::{PeripheralDelegate, ReadRequest, WriteRequest};
use crate::dispatch::DeliveryQueue;
use crate::error::{AttError, ConnectionError, EmulatorError};
use crate::gatt::{
    BleUuid, Characteristic, CharacteristicSnapshot, DescriptorSnapshot, Service, ServiceSnapshot,
};
use crate::l2cap::L2capChannel;
use crate::remote::RemoteCentral;
use crate::restoration::{
    decode_blob, PeripheralRestoration, PeripheralStateBlob, RestorationKind,
};
use crate::types::{AncsAuthorization, DeviceId, ManagerOptions, ManagerState, WriteType};

/// Default cap of the façade-local notification queue.
const LOCAL_NOTIFY_QUEUE_CAP: u32 = 10;

/// Desired connection latency hint; accepted and ignored, as on a stack
/// where the platform owns the connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLatency {
    Low,
    Medium,
    High,
}

/// A peripheral manager; clones share state.
#[derive(Clone)]
pub struct PeripheralManager {
    shared: Arc<PeripheralShared>,
}

pub(crate) struct PeripheralShared {
    id: DeviceId,
    bus: EmulatorBus,
    queue: DeliveryQueue,
    delegate: RwLock<Weak<dyn PeripheralDelegate>>,
    state: RwLock<ManagerState>,
    is_advertising: AtomicBool,
    services: RwLock<Vec<Service>>,
    characteristics: RwLock<HashMap<BleUuid, Characteristic>>,
    local_notify_counts: Mutex<HashMap<BleUuid, u32>>,
}

/// Encryption and capability flags the Bus needs before running an
/// attribute operation
pub(crate) struct CharacteristicSecurity {
    pub read_encrypted: bool,
    pub write_encrypted: bool,
    pub subscribe_encrypted: bool,
    pub supports_subscriptions: bool,
}

pub(crate) struct DescriptorSecurity {
    pub read_encrypted: bool,
    pub write_encrypted: bool,
}

impl PeripheralManager {
    /// Construct and register a peripheral manager.
    ///
    /// Mirrors [`crate::central::CentralManager::new`]: restoration replays
    /// first, then the powered-on transition after the configured delay; a
    /// restored advertising state is re-armed after a short grace delay.
    pub async fn new<D: PeripheralDelegate>(
        bus: &EmulatorBus,
        delegate: &Arc<D>,
        queue: Option<DeliveryQueue>,
        options: ManagerOptions,
    ) -> Self {
        let id = DeviceId::new();
        let queue = queue.unwrap_or_else(|| DeliveryQueue::new(format!("peripheral-{id}")));
        let config = bus.get_configuration().await;
        let dynamic: Arc<dyn PeripheralDelegate> = delegate.clone();

        let shared = Arc::new(PeripheralShared {
            id,
            bus: bus.clone(),
            queue,
            delegate: RwLock::new(Arc::downgrade(&dynamic)),
            state: RwLock::new(ManagerState::Unknown),
            is_advertising: AtomicBool::new(false),
            services: RwLock::new(Vec::new()),
            characteristics: RwLock::new(HashMap::new()),
            local_notify_counts: Mutex::new(HashMap::new()),
        });
        bus.register_peripheral(id, Arc::downgrade(&shared));
        let manager = Self {
            shared: Arc::clone(&shared),
        };

        let restoration = match &options.restore_identifier {
            Some(restore_id) if config.restoration.state_restoration_enabled => bus
                .restore_state(restore_id, RestorationKind::Peripheral)
                .await
                .and_then(|bytes| decode_blob::<PeripheralStateBlob>(&bytes)),
            _ => None,
        };
        let restored_advertisement = restoration
            .as_ref()
            .filter(|blob| blob.advertising)
            .and_then(|blob| blob.advertisement.clone());
        if let Some(blob) = restoration {
            let services: Vec<Service> =
                blob.services.iter().map(ServiceSnapshot::materialize).collect();
            // Restored services come back under management automatically.
            for service in &services {
                manager.install_service(service.clone());
            }
            let payload = PeripheralRestoration {
                services,
                advertisement: blob.advertisement,
                was_advertising: blob.advertising,
            };
            shared.with_delegate(move |delegate| delegate.will_restore_state(payload));
        }

        let target_state = config.forced_manager_state.unwrap_or(ManagerState::PoweredOn);
        let state_delay = config.timing.state_update;
        let init = Arc::clone(&shared);
        let init_manager = manager.clone();
        tokio::spawn(async move {
            if !state_delay.is_zero() {
                tokio::time::sleep(state_delay).await;
            }
            *init.state.write().expect("peripheral lock") = target_state;
            init.with_delegate(move |delegate| delegate.state_did_update(target_state));

            if let Some(advertisement) = restored_advertisement {
                // Grace delay before restored advertising resumes.
                if !state_delay.is_zero() {
                    tokio::time::sleep(state_delay).await;
                }
                init_manager.start_advertising(advertisement);
            }
        });

        manager
    }

    pub fn identifier(&self) -> DeviceId {
        self.shared.id
    }

    pub fn state(&self) -> ManagerState {
        *self.shared.state.read().expect("peripheral lock")
    }

    pub fn is_advertising(&self) -> bool {
        self.shared.is_advertising.load(Ordering::Relaxed)
    }

    pub fn services(&self) -> Vec<Service> {
        self.shared.services.read().expect("peripheral lock").clone()
    }

    /// Replace the delegate; the façade keeps a weak handle.
    pub fn set_delegate<D: PeripheralDelegate>(&self, delegate: &Arc<D>) {
        let dynamic: Arc<dyn PeripheralDelegate> = delegate.clone();
        *self.shared.delegate.write().expect("peripheral lock") = Arc::downgrade(&dynamic);
    }

    // ------------------------------------------------------------------
    // GATT database management
    // ------------------------------------------------------------------

    /// Add a service; `did_add_service` reports the outcome.
    pub fn add_service(&self, service: &Service) {
        let duplicate = self
            .shared
            .services
            .read()
            .expect("peripheral lock")
            .iter()
            .any(|existing| existing.uuid() == service.uuid());
        if duplicate {
            let delivered = service.clone();
            self.shared.with_delegate(move |delegate| {
                delegate.did_add_service(
                    delivered,
                    Some(EmulatorError::from(ConnectionError::InvalidParameters)),
                )
            });
            return;
        }
        self.install_service(service.clone());
        let delivered = service.clone();
        self.shared
            .with_delegate(move |delegate| delegate.did_add_service(delivered, None));
    }

    fn install_service(&self, service: Service) {
        service.set_peripheral(Some(self.shared.id));
        {
            let mut index = self.shared.characteristics.write().expect("peripheral lock");
            for characteristic in service.characteristics() {
                index.insert(characteristic.uuid(), characteristic);
            }
        }
        self.shared.services.write().expect("peripheral lock").push(service);
    }

    /// Remove a service; connected centrals observe `did_modify_services`.
    pub fn remove_service(&self, service: &Service) {
        let removed = {
            let mut services = self.shared.services.write().expect("peripheral lock");
            let before = services.len();
            services.retain(|existing| existing != service);
            before != services.len()
        };
        if !removed {
            return;
        }
        service.set_peripheral(None);
        {
            let mut index = self.shared.characteristics.write().expect("peripheral lock");
            for characteristic in service.characteristics() {
                index.remove(&characteristic.uuid());
            }
        }
        self.shared
            .bus
            .services_modified(self.shared.id, vec![service.snapshot()]);
    }

    pub fn remove_all_services(&self) {
        let removed: Vec<Service> = {
            let mut services = self.shared.services.write().expect("peripheral lock");
            services.drain(..).collect()
        };
        if removed.is_empty() {
            return;
        }
        self.shared.characteristics.write().expect("peripheral lock").clear();
        let snapshots = removed.iter().map(Service::snapshot).collect();
        for service in &removed {
            service.set_peripheral(None);
        }
        self.shared.bus.services_modified(self.shared.id, snapshots);
    }

    // ------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------

    /// Begin advertising; `did_start_advertising` reports the outcome. The
    /// supplied map is stored verbatim by the Bus.
    pub fn start_advertising(&self, data: AdvertisementData) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            match shared.bus.start_advertising(shared.id, data).await {
                Ok(()) => {
                    shared.is_advertising.store(true, Ordering::Relaxed);
                    shared.with_delegate(|delegate| delegate.did_start_advertising(None));
                }
                Err(error) => {
                    shared.with_delegate(move |delegate| {
                        delegate.did_start_advertising(Some(error))
                    });
                }
            }
        });
    }

    pub fn stop_advertising(&self) {
        self.shared.is_advertising.store(false, Ordering::Relaxed);
        self.shared.bus.stop_advertising(self.shared.id);
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Publish a new value to subscribed centrals (or the given subset).
    ///
    /// Returns false when the characteristic is not notifying or when either
    /// the façade-local queue or the Bus queue is full; retry after
    /// `is_ready_to_update_subscribers`.
    pub async fn update_value(
        &self,
        characteristic: &Characteristic,
        value: Vec<u8>,
        centrals: Option<Vec<DeviceId>>,
    ) -> bool {
        let uuid = characteristic.uuid();
        {
            let mut counts = self.shared.local_notify_counts.lock().expect("peripheral lock");
            let count = counts.entry(uuid).or_insert(0);
            if *count >= LOCAL_NOTIFY_QUEUE_CAP {
                debug!(peripheral = %self.shared.id, %uuid, "local notification queue full");
                return false;
            }
            *count += 1;
        }
        let drain_delay = self
            .shared
            .bus
            .get_configuration()
            .await
            .timing
            .backpressure_processing;
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if !drain_delay.is_zero() {
                tokio::time::sleep(drain_delay).await;
            }
            let mut counts = shared.local_notify_counts.lock().expect("peripheral lock");
            if let Some(count) = counts.get_mut(&uuid) {
                *count = count.saturating_sub(1);
            }
        });

        characteristic.set_value(Some(value.clone()));
        self.shared
            .bus
            .update_value(self.shared.id, uuid, value, centrals)
            .await
    }

    /// Acknowledge an inbound request. Reads are resolved synchronously from
    /// attribute state, so this is a recorded no-op.
    pub fn respond(&self, request: &ReadRequest, result: Option<AttError>) {
        debug!(
            peripheral = %self.shared.id,
            characteristic = %request.characteristic.uuid(),
            ?result,
            "request acknowledged"
        );
    }

    /// Connection-parameter hint; the emulator has no connection interval to
    /// tune, so this records the request and nothing more.
    pub fn set_desired_connection_latency(
        &self,
        latency: ConnectionLatency,
        central: &RemoteCentral,
    ) {
        debug!(
            peripheral = %self.shared.id,
            central = %central.identifier(),
            ?latency,
            "connection latency hint recorded"
        );
    }

    // ------------------------------------------------------------------
    // L2CAP
    // ------------------------------------------------------------------

    /// Publish a PSM; `did_publish_l2cap_channel` reports the assigned value.
    pub fn publish_l2cap_channel(&self, requires_encryption: bool) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            match shared.bus.publish_l2cap(shared.id, requires_encryption).await {
                Ok(psm) => {
                    shared.with_delegate(move |delegate| {
                        delegate.did_publish_l2cap_channel(psm, None)
                    });
                }
                Err(error) => {
                    shared.with_delegate(move |delegate| {
                        delegate.did_publish_l2cap_channel(0, Some(error))
                    });
                }
            }
        });
    }

    /// Withdraw a PSM; `did_unpublish_l2cap_channel` reports the outcome.
    pub fn unpublish_l2cap_channel(&self, psm: u16) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = shared.bus.unpublish_l2cap(shared.id, psm).await;
            shared.with_delegate(move |delegate| {
                delegate.did_unpublish_l2cap_channel(psm, result.err())
            });
        });
    }

    /// Persist this peripheral's advertising state under the given restore
    /// identifier
    pub async fn save_state(&self, restore_id: &str) -> bool {
        self.shared
            .bus
            .save_peripheral_state(self.shared.id, restore_id)
            .await
    }
}

impl Drop for PeripheralShared {
    fn drop(&mut self) {
        self.bus.unregister_peripheral(self.id);
    }
}

// ----------------------------------------------------------------------------
// Bus-facing surface
// ----------------------------------------------------------------------------

impl PeripheralShared {
    fn with_delegate<F>(&self, call: F)
    where
        F: FnOnce(&dyn PeripheralDelegate) + Send + 'static,
    {
        let weak = self.delegate.read().expect("peripheral lock").clone();
        self.queue.submit(move || {
            if let Some(delegate) = weak.upgrade() {
                call(&*delegate);
            }
        });
    }

    fn characteristic(&self, uuid: BleUuid) -> Option<Characteristic> {
        self.characteristics
            .read()
            .expect("peripheral lock")
            .get(&uuid)
            .cloned()
    }

    pub(crate) fn characteristic_security(&self, uuid: BleUuid) -> Option<CharacteristicSecurity> {
        let characteristic = self.characteristic(uuid)?;
        Some(CharacteristicSecurity {
            read_encrypted: characteristic.requires_read_encryption(),
            write_encrypted: characteristic.requires_write_encryption(),
            subscribe_encrypted: characteristic.requires_subscription_encryption(),
            supports_subscriptions: characteristic.supports_subscriptions(),
        })
    }

    pub(crate) fn descriptor_security(
        &self,
        characteristic: BleUuid,
        descriptor: BleUuid,
    ) -> Option<DescriptorSecurity> {
        let descriptor = self.characteristic(characteristic)?.descriptor(descriptor)?;
        let permissions = descriptor.permissions();
        Some(DescriptorSecurity {
            read_encrypted: permissions
                .contains(&crate::gatt::AttributePermission::ReadEncryptionRequired),
            write_encrypted: permissions
                .contains(&crate::gatt::AttributePermission::WriteEncryptionRequired),
        })
    }

    /// Permission check and value fetch for an inbound read. The delegate
    /// observes the request; the value answers it.
    pub(crate) fn handle_read(
        &self,
        central: DeviceId,
        uuid: BleUuid,
    ) -> Result<Vec<u8>, AttError> {
        let characteristic = self.characteristic(uuid).ok_or(AttError::AttributeNotFound)?;
        if !characteristic.is_readable() {
            return Err(AttError::ReadNotPermitted);
        }
        let request = ReadRequest {
            central,
            characteristic: characteristic.clone(),
            offset: 0,
        };
        self.with_delegate(move |delegate| delegate.did_receive_read(request));
        Ok(characteristic.value().unwrap_or_default())
    }

    pub(crate) fn handle_write(
        &self,
        central: DeviceId,
        uuid: BleUuid,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<(), AttError> {
        let characteristic = self.characteristic(uuid).ok_or(AttError::AttributeNotFound)?;
        if !characteristic.is_writeable() {
            return Err(AttError::WriteNotPermitted);
        }
        characteristic.set_value(Some(value.clone()));
        let request = WriteRequest {
            central,
            characteristic,
            offset: 0,
            value,
        };
        debug!(peripheral = %self.id, %uuid, ?write_type, "write handled");
        self.with_delegate(move |delegate| delegate.did_receive_write(vec![request]));
        Ok(())
    }

    pub(crate) fn handle_read_descriptor(
        &self,
        _central: DeviceId,
        characteristic: BleUuid,
        descriptor: BleUuid,
    ) -> Result<Vec<u8>, AttError> {
        let descriptor = self
            .characteristic(characteristic)
            .and_then(|c| c.descriptor(descriptor))
            .ok_or(AttError::AttributeNotFound)?;
        if !descriptor.is_readable() {
            return Err(AttError::ReadNotPermitted);
        }
        Ok(descriptor.value().unwrap_or_default())
    }

    pub(crate) fn handle_write_descriptor(
        &self,
        _central: DeviceId,
        characteristic: BleUuid,
        descriptor: BleUuid,
        value: Vec<u8>,
    ) -> Result<(), AttError> {
        let descriptor = self
            .characteristic(characteristic)
            .and_then(|c| c.descriptor(descriptor))
            .ok_or(AttError::AttributeNotFound)?;
        if !descriptor.is_writeable() {
            return Err(AttError::WriteNotPermitted);
        }
        descriptor.set_value(Some(value));
        Ok(())
    }

    /// Subscription change from the Bus; fires the subscribe/unsubscribe
    /// delegate only when the subscriber set actually changed.
    pub(crate) fn handle_set_notify(
        &self,
        central: DeviceId,
        uuid: BleUuid,
        enabled: bool,
        central_mtu: u16,
    ) -> Result<(), AttError> {
        let characteristic = self.characteristic(uuid).ok_or(AttError::AttributeNotFound)?;
        if !characteristic.supports_subscriptions() {
            return Err(AttError::RequestNotSupported);
        }
        let changed = if enabled {
            characteristic.subscribe(central)
        } else {
            characteristic.unsubscribe(central)
        };
        if changed {
            let remote = RemoteCentral::new(central, central_mtu);
            let delivered = characteristic.clone();
            if enabled {
                self.with_delegate(move |delegate| delegate.did_subscribe(remote, delivered));
            } else {
                self.with_delegate(move |delegate| delegate.did_unsubscribe(remote, delivered));
            }
        }
        Ok(())
    }

    /// A central went away: drop it from every subscriber list it appears
    /// in, firing `did_unsubscribe` per affected characteristic. Idempotent.
    pub(crate) fn notify_central_disconnected(&self, central: DeviceId, default_mtu: u16) {
        let characteristics: Vec<Characteristic> = self
            .characteristics
            .read()
            .expect("peripheral lock")
            .values()
            .cloned()
            .collect();
        for characteristic in characteristics {
            if characteristic.unsubscribe(central) {
                let remote = RemoteCentral::new(central, default_mtu);
                let delivered = characteristic.clone();
                self.with_delegate(move |delegate| delegate.did_unsubscribe(remote, delivered));
            }
        }
    }

    pub(crate) fn subscribers_of(&self, uuid: BleUuid) -> Vec<DeviceId> {
        self.characteristic(uuid)
            .map(|characteristic| characteristic.subscribers())
            .unwrap_or_default()
    }

    pub(crate) fn service_snapshots(&self, filter: Option<&[BleUuid]>) -> Vec<ServiceSnapshot> {
        self.services
            .read()
            .expect("peripheral lock")
            .iter()
            .filter(|service| {
                filter
                    .map(|uuids| uuids.contains(&service.uuid()))
                    .unwrap_or(true)
            })
            .map(Service::snapshot)
            .collect()
    }

    pub(crate) fn included_service_snapshots(
        &self,
        service: BleUuid,
        filter: Option<&[BleUuid]>,
    ) -> Result<Vec<ServiceSnapshot>, AttError> {
        let services = self.services.read().expect("peripheral lock");
        let parent = services
            .iter()
            .find(|s| s.uuid() == service)
            .ok_or(AttError::AttributeNotFound)?;
        Ok(parent
            .included_services()
            .iter()
            .filter(|included| {
                filter
                    .map(|uuids| uuids.contains(&included.uuid()))
                    .unwrap_or(true)
            })
            .map(Service::snapshot)
            .collect())
    }

    pub(crate) fn characteristic_snapshots(
        &self,
        service: BleUuid,
        filter: Option<&[BleUuid]>,
    ) -> Result<Vec<CharacteristicSnapshot>, AttError> {
        let services = self.services.read().expect("peripheral lock");
        let parent = services
            .iter()
            .find(|s| s.uuid() == service)
            .ok_or(AttError::AttributeNotFound)?;
        Ok(parent
            .characteristics()
            .iter()
            .filter(|characteristic| {
                filter
                    .map(|uuids| uuids.contains(&characteristic.uuid()))
                    .unwrap_or(true)
            })
            .map(Characteristic::snapshot)
            .collect())
    }

    pub(crate) fn descriptor_snapshots(
        &self,
        characteristic: BleUuid,
    ) -> Result<Vec<DescriptorSnapshot>, AttError> {
        let characteristic = self
            .characteristic(characteristic)
            .ok_or(AttError::AttributeNotFound)?;
        Ok(characteristic
            .descriptors()
            .iter()
            .map(|descriptor| descriptor.snapshot())
            .collect())
    }

    pub(crate) fn deliver_ready_to_update(&self) {
        self.with_delegate(|delegate| delegate.is_ready_to_update_subscribers());
    }

    pub(crate) fn deliver_l2cap_open(&self, channel: L2capChannel) {
        self.with_delegate(move |delegate| delegate.did_open_l2cap_channel(Some(channel), None));
    }

    pub(crate) fn deliver_ancs_update(
        &self,
        central: DeviceId,
        authorization: AncsAuthorization,
    ) {
        self.with_delegate(move |delegate| {
            delegate.did_update_ancs_authorization(central, authorization)
        });
    }
}

impl std::fmt::Debug for PeripheralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralManager")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("is_advertising", &self.is_advertising())
            .finish()
    }
}
