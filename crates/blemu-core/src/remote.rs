//! Remote proxies: each side's local representation of the other
//!
//! A [`RemotePeripheral`] is the central-side view of a peripheral façade:
//! identity, cached services, connection state, MTU, and the full
//! discover/read/write/notify surface. Its identifier equals the peripheral
//! façade's identifier, so the Bus routes by one key. A [`RemoteCentral`] is
//! the much thinner peripheral-side view of a central.
//!
//! Proxy operations are fire-and-forget the way a radio stack's are:
//! each call validates locally, forwards to the Bus on a spawned task, and
//! delivers the outcome through the proxy's delegate on the central's queue.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::debug;

use crate::bus::EmulatorBus;
use crate::delegate::RemotePeripheralDelegate;
use crate::dispatch::DeliveryQueue;
use crate::error::{AttError, EmulatorResult};
use crate::gatt::{BleUuid, Characteristic, Descriptor, Service, ServiceSnapshot};
use crate::types::{DeviceId, PeerState, WriteType};

/// ATT header overhead subtracted from the MTU for payload math.
const ATT_HEADER_LEN: u16 = 3;

// ----------------------------------------------------------------------------
// RemotePeripheral
// ----------------------------------------------------------------------------

/// Central-side proxy for a peripheral; clones share state.
#[derive(Clone)]
pub struct RemotePeripheral {
    shared: Arc<RemotePeripheralShared>,
}

pub(crate) struct RemotePeripheralShared {
    id: DeviceId,
    central: DeviceId,
    bus: EmulatorBus,
    queue: DeliveryQueue,
    name: RwLock<Option<String>>,
    state: RwLock<PeerState>,
    services: RwLock<Vec<Service>>,
    mtu: AtomicU16,
    delegate: RwLock<Weak<dyn RemotePeripheralDelegate>>,
}

impl RemotePeripheral {
    pub(crate) fn new(
        bus: EmulatorBus,
        central: DeviceId,
        id: DeviceId,
        queue: DeliveryQueue,
        default_mtu: u16,
    ) -> Self {
        Self {
            shared: Arc::new(RemotePeripheralShared {
                id,
                central,
                bus,
                queue,
                name: RwLock::new(None),
                state: RwLock::new(PeerState::Disconnected),
                services: RwLock::new(Vec::new()),
                mtu: AtomicU16::new(default_mtu),
                delegate: RwLock::new(Weak::<NullDelegate>::new()),
            }),
        }
    }

    /// Stable identifier; equals the represented peripheral façade's.
    pub fn identifier(&self) -> DeviceId {
        self.shared.id
    }

    /// Identifier of the central this proxy belongs to
    pub fn central_identifier(&self) -> DeviceId {
        self.shared.central
    }

    pub fn name(&self) -> Option<String> {
        self.shared.name.read().expect("proxy lock").clone()
    }

    pub fn state(&self) -> PeerState {
        *self.shared.state.read().expect("proxy lock")
    }

    /// Services discovered so far, in discovery order
    pub fn services(&self) -> Vec<Service> {
        self.shared.services.read().expect("proxy lock").clone()
    }

    /// Install the delegate receiving this proxy's events. The proxy keeps a
    /// weak handle; the application must retain the delegate.
    pub fn set_delegate<D: RemotePeripheralDelegate>(&self, delegate: &Arc<D>) {
        let dynamic: Arc<dyn RemotePeripheralDelegate> = delegate.clone();
        *self.shared.delegate.write().expect("proxy lock") = Arc::downgrade(&dynamic);
    }

    /// Largest write payload the current MTU allows
    pub fn maximum_write_value_length(&self, _write_type: WriteType) -> usize {
        usize::from(self.shared.mtu.load(Ordering::Relaxed).saturating_sub(ATT_HEADER_LEN))
    }

    /// Negotiate the connection MTU; the Bus caps the request at the
    /// configured maximum and returns the installed value.
    pub async fn negotiate_mtu(&self, requested: u16) -> EmulatorResult<u16> {
        let mtu = self
            .shared
            .bus
            .negotiate_mtu(self.shared.central, self.shared.id, requested)
            .await?;
        self.shared.mtu.store(mtu, Ordering::Relaxed);
        Ok(mtu)
    }

    /// Whether another write-without-response would currently be accepted
    pub async fn can_send_write_without_response(&self) -> bool {
        self.shared
            .bus
            .can_send_write_without_response(self.shared.central, self.shared.id)
            .await
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Discover services, optionally restricted to the given UUIDs.
    /// Completion arrives via `did_discover_services`.
    pub fn discover_services(&self, filter: Option<Vec<BleUuid>>) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this
                .shared
                .bus
                .discover_services(this.shared.central, this.shared.id, filter)
                .await;
            match result {
                Ok(snapshots) => {
                    this.merge_services(&snapshots);
                    this.with_delegate(|delegate, proxy| {
                        delegate.did_discover_services(proxy, None)
                    });
                }
                Err(error) => this.with_delegate(move |delegate, proxy| {
                    delegate.did_discover_services(proxy, Some(error))
                }),
            }
        });
    }

    /// Discover a service's included services.
    /// Completion arrives via `did_discover_included_services`.
    pub fn discover_included_services(&self, service: &Service, filter: Option<Vec<BleUuid>>) {
        let this = self.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let result = this
                .shared
                .bus
                .discover_included_services(
                    this.shared.central,
                    this.shared.id,
                    service.uuid(),
                    filter,
                )
                .await;
            match result {
                Ok(snapshots) => {
                    let known: Vec<BleUuid> = service
                        .included_services()
                        .iter()
                        .map(|s| s.uuid())
                        .collect();
                    for snapshot in &snapshots {
                        if !known.contains(&snapshot.uuid) {
                            service.add_included_service(snapshot.materialize());
                        }
                    }
                    this.with_delegate(move |delegate, proxy| {
                        delegate.did_discover_included_services(proxy, service, None)
                    });
                }
                Err(error) => this.with_delegate(move |delegate, proxy| {
                    delegate.did_discover_included_services(proxy, service, Some(error))
                }),
            }
        });
    }

    /// Discover a service's characteristics.
    /// Completion arrives via `did_discover_characteristics`.
    pub fn discover_characteristics(&self, service: &Service, filter: Option<Vec<BleUuid>>) {
        let this = self.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let result = this
                .shared
                .bus
                .discover_characteristics(
                    this.shared.central,
                    this.shared.id,
                    service.uuid(),
                    filter,
                )
                .await;
            match result {
                Ok(snapshots) => {
                    let known: Vec<BleUuid> = service
                        .characteristics()
                        .iter()
                        .map(|c| c.uuid())
                        .collect();
                    for snapshot in &snapshots {
                        if !known.contains(&snapshot.uuid) {
                            service.add_characteristic(snapshot.materialize());
                        }
                    }
                    this.with_delegate(move |delegate, proxy| {
                        delegate.did_discover_characteristics(proxy, service, None)
                    });
                }
                Err(error) => this.with_delegate(move |delegate, proxy| {
                    delegate.did_discover_characteristics(proxy, service, Some(error))
                }),
            }
        });
    }

    /// Discover a characteristic's descriptors.
    /// Completion arrives via `did_discover_descriptors`.
    pub fn discover_descriptors(&self, characteristic: &Characteristic) {
        let this = self.clone();
        let characteristic = characteristic.clone();
        tokio::spawn(async move {
            let result = this
                .shared
                .bus
                .discover_descriptors(this.shared.central, this.shared.id, characteristic.uuid())
                .await;
            match result {
                Ok(snapshots) => {
                    let known: Vec<BleUuid> = characteristic
                        .descriptors()
                        .iter()
                        .map(|d| d.uuid())
                        .collect();
                    for snapshot in &snapshots {
                        if !known.contains(&snapshot.uuid) {
                            characteristic.add_descriptor(snapshot.materialize());
                        }
                    }
                    this.with_delegate(move |delegate, proxy| {
                        delegate.did_discover_descriptors(proxy, characteristic, None)
                    });
                }
                Err(error) => this.with_delegate(move |delegate, proxy| {
                    delegate.did_discover_descriptors(proxy, characteristic, Some(error))
                }),
            }
        });
    }

    // ------------------------------------------------------------------
    // Value operations
    // ------------------------------------------------------------------

    /// Read a characteristic's value.
    /// Completion arrives via `did_update_value`.
    pub fn read_value(&self, characteristic: &Characteristic) {
        let this = self.clone();
        let characteristic = characteristic.clone();
        tokio::spawn(async move {
            let result = this
                .shared
                .bus
                .read_characteristic(this.shared.central, this.shared.id, characteristic.uuid())
                .await;
            match result {
                Ok(value) => {
                    characteristic.set_value(Some(value));
                    this.with_delegate(move |delegate, proxy| {
                        delegate.did_update_value(proxy, characteristic, None)
                    });
                }
                Err(error) => this.with_delegate(move |delegate, proxy| {
                    delegate.did_update_value(proxy, characteristic, Some(error))
                }),
            }
        });
    }

    /// Write a characteristic's value. With-response writes complete via
    /// `did_write_value`; without-response writes produce no callback and
    /// are subject to back-pressure.
    pub fn write_value(&self, characteristic: &Characteristic, value: Vec<u8>, kind: WriteType) {
        let this = self.clone();
        let characteristic = characteristic.clone();
        tokio::spawn(async move {
            let result = this
                .shared
                .bus
                .write_characteristic(
                    this.shared.central,
                    this.shared.id,
                    characteristic.uuid(),
                    value,
                    kind,
                )
                .await;
            match kind {
                WriteType::WithResponse => {
                    this.with_delegate(move |delegate, proxy| {
                        delegate.did_write_value(proxy, characteristic, result.err())
                    });
                }
                WriteType::WithoutResponse => {
                    if let Err(error) = result {
                        debug!(peripheral = %this.shared.id, %error, "write-without-response rejected");
                    }
                }
            }
        });
    }

    /// Subscribe or unsubscribe to value updates.
    /// Completion arrives via `did_update_notification_state`.
    pub fn set_notify_value(&self, characteristic: &Characteristic, enabled: bool) {
        let this = self.clone();
        let characteristic = characteristic.clone();
        tokio::spawn(async move {
            let result = this
                .shared
                .bus
                .set_notify_value(
                    this.shared.central,
                    this.shared.id,
                    characteristic.uuid(),
                    enabled,
                )
                .await;
            match result {
                Ok(()) => {
                    // The cached copy tracks this central as its sole
                    // subscriber so `is_notifying` mirrors the remote state.
                    if enabled {
                        characteristic.subscribe(this.shared.central);
                    } else {
                        characteristic.unsubscribe(this.shared.central);
                    }
                    this.with_delegate(move |delegate, proxy| {
                        delegate.did_update_notification_state(proxy, characteristic, None)
                    });
                }
                Err(error) => this.with_delegate(move |delegate, proxy| {
                    delegate.did_update_notification_state(proxy, characteristic, Some(error))
                }),
            }
        });
    }

    /// Read a descriptor's value.
    /// Completion arrives via `did_update_descriptor_value`.
    pub fn read_descriptor_value(&self, descriptor: &Descriptor) {
        let this = self.clone();
        let descriptor = descriptor.clone();
        tokio::spawn(async move {
            let Some(owner) = descriptor.characteristic() else {
                this.with_delegate(move |delegate, proxy| {
                    delegate.did_update_descriptor_value(
                        proxy,
                        descriptor,
                        Some(AttError::InvalidHandle.into()),
                    )
                });
                return;
            };
            let result = this
                .shared
                .bus
                .read_descriptor(
                    this.shared.central,
                    this.shared.id,
                    owner.uuid(),
                    descriptor.uuid(),
                )
                .await;
            match result {
                Ok(value) => {
                    descriptor.set_value(Some(value));
                    this.with_delegate(move |delegate, proxy| {
                        delegate.did_update_descriptor_value(proxy, descriptor, None)
                    });
                }
                Err(error) => this.with_delegate(move |delegate, proxy| {
                    delegate.did_update_descriptor_value(proxy, descriptor, Some(error))
                }),
            }
        });
    }

    /// Write a descriptor's value.
    /// Completion arrives via `did_write_descriptor_value`.
    pub fn write_descriptor_value(&self, descriptor: &Descriptor, value: Vec<u8>) {
        let this = self.clone();
        let descriptor = descriptor.clone();
        tokio::spawn(async move {
            let Some(owner) = descriptor.characteristic() else {
                this.with_delegate(move |delegate, proxy| {
                    delegate.did_write_descriptor_value(
                        proxy,
                        descriptor,
                        Some(AttError::InvalidHandle.into()),
                    )
                });
                return;
            };
            let result = this
                .shared
                .bus
                .write_descriptor(
                    this.shared.central,
                    this.shared.id,
                    owner.uuid(),
                    descriptor.uuid(),
                    value,
                )
                .await;
            this.with_delegate(move |delegate, proxy| {
                delegate.did_write_descriptor_value(proxy, descriptor, result.err())
            });
        });
    }

    /// Sample the simulated signal strength.
    /// Completion arrives via `did_read_rssi`.
    pub fn read_rssi(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.shared.bus.read_rssi(this.shared.central, this.shared.id).await;
            this.with_delegate(move |delegate, proxy| match result {
                Ok(rssi) => delegate.did_read_rssi(proxy, rssi, None),
                Err(error) => delegate.did_read_rssi(proxy, 0, Some(error)),
            });
        });
    }

    /// Open an L2CAP channel against a published PSM.
    /// Completion arrives via `did_open_l2cap_channel`.
    pub fn open_l2cap_channel(&self, psm: u16) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this
                .shared
                .bus
                .open_l2cap(this.shared.central, this.shared.id, psm)
                .await;
            this.with_delegate(move |delegate, proxy| match result {
                Ok(channel) => delegate.did_open_l2cap_channel(proxy, Some(channel), None),
                Err(error) => delegate.did_open_l2cap_channel(proxy, None, Some(error)),
            });
        });
    }

    // ------------------------------------------------------------------
    // Crate-internal plumbing
    // ------------------------------------------------------------------

    /// Schedule a delegate callback on the central's queue. Skipped
    /// silently when the delegate has been dropped.
    fn with_delegate<F>(&self, call: F)
    where
        F: FnOnce(&dyn RemotePeripheralDelegate, RemotePeripheral) + Send + 'static,
    {
        let weak = self.shared.delegate.read().expect("proxy lock").clone();
        let proxy = self.clone();
        self.shared.queue.submit(move || {
            if let Some(delegate) = weak.upgrade() {
                call(&*delegate, proxy);
            }
        });
    }

    /// Merge discovered snapshots into the cached service list, keyed by
    /// UUID; discovery order of new entries is preserved.
    fn merge_services(&self, snapshots: &[ServiceSnapshot]) {
        let mut services = self.shared.services.write().expect("proxy lock");
        for snapshot in snapshots {
            let materialized = snapshot.materialize();
            materialized.set_peripheral(Some(self.shared.id));
            match services.iter().position(|s| s.uuid() == snapshot.uuid) {
                Some(index) => services[index] = materialized,
                None => services.push(materialized),
            }
        }
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        *self.shared.state.write().expect("proxy lock") = state;
    }

    pub(crate) fn set_name(&self, name: Option<String>) {
        if name.is_some() {
            *self.shared.name.write().expect("proxy lock") = name;
        }
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        self.shared.mtu.store(mtu, Ordering::Relaxed);
    }

    /// A value update arrived from the Bus for one of the cached
    /// characteristics.
    pub(crate) fn deliver_value_update(&self, characteristic: BleUuid, value: Vec<u8>) {
        let Some(cached) = self.find_characteristic(characteristic) else {
            debug!(
                peripheral = %self.shared.id,
                %characteristic,
                "update for unknown characteristic"
            );
            return;
        };
        cached.set_value(Some(value));
        self.with_delegate(move |delegate, proxy| delegate.did_update_value(proxy, cached, None));
    }

    pub(crate) fn deliver_ready_for_write_without_response(&self) {
        self.with_delegate(|delegate, proxy| {
            delegate.is_ready_to_send_write_without_response(proxy)
        });
    }

    /// The peripheral removed services; drop them from the cache and tell
    /// the delegate which ones went away.
    pub(crate) fn deliver_services_modified(&self, removed: &[ServiceSnapshot]) {
        let removed_uuids: Vec<BleUuid> = removed.iter().map(|s| s.uuid).collect();
        let invalidated: Vec<Service> = {
            let mut services = self.shared.services.write().expect("proxy lock");
            let (gone, kept): (Vec<Service>, Vec<Service>) = services
                .drain(..)
                .partition(|s| removed_uuids.contains(&s.uuid()));
            *services = kept;
            gone
        };
        if invalidated.is_empty() {
            return;
        }
        self.with_delegate(move |delegate, proxy| {
            delegate.did_modify_services(proxy, invalidated)
        });
    }

    fn find_characteristic(&self, uuid: BleUuid) -> Option<Characteristic> {
        self.shared
            .services
            .read()
            .expect("proxy lock")
            .iter()
            .find_map(|service| service.characteristic(uuid))
    }
}

impl PartialEq for RemotePeripheral {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for RemotePeripheral {}

impl std::fmt::Debug for RemotePeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeripheral")
            .field("id", &self.shared.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Placeholder delegate type used for the initial empty weak handle
struct NullDelegate;
impl RemotePeripheralDelegate for NullDelegate {}

// ----------------------------------------------------------------------------
// RemoteCentral
// ----------------------------------------------------------------------------

/// Peripheral-side view of a central: identity plus the notification payload
/// length its connection MTU allows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCentral {
    id: DeviceId,
    mtu: u16,
}

impl RemoteCentral {
    pub(crate) fn new(id: DeviceId, mtu: u16) -> Self {
        Self { id, mtu }
    }

    pub fn identifier(&self) -> DeviceId {
        self.id
    }

    /// Largest notification payload this central's connection accepts
    pub fn maximum_update_value_length(&self) -> usize {
        usize::from(self.mtu.saturating_sub(ATT_HEADER_LEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_length_tracks_mtu() {
        let bus = EmulatorBus::new();
        let queue = DeliveryQueue::new("test");
        let proxy = RemotePeripheral::new(bus, DeviceId::new(), DeviceId::new(), queue, 185);
        assert_eq!(proxy.maximum_write_value_length(WriteType::WithResponse), 182);
        proxy.set_mtu(512);
        assert_eq!(proxy.maximum_write_value_length(WriteType::WithResponse), 509);
    }

    #[test]
    fn remote_central_payload_length() {
        let central = RemoteCentral::new(DeviceId::new(), 23);
        assert_eq!(central.maximum_update_value_length(), 20);
    }
}
