//! Central manager façade
//!
//! Per-central state (scanning flag, discovered proxies, connection-event
//! registration) plus the translation of application calls into Bus
//! operations. Bus events come back through crate-internal `deliver_*`
//! methods, which schedule the application delegate on this central's queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::debug;

use crate::bus::EmulatorBus;
use crate::delegate::CentralDelegate;
use crate::dispatch::DeliveryQueue;
use crate::error::{ConnectionError, EmulatorError, EmulatorResult};
use crate::gatt::{BleUuid, ServiceSnapshot};
use crate::remote::RemotePeripheral;
use crate::restoration::{decode_blob, CentralRestoration, CentralStateBlob, RestorationKind};
use crate::advertisement::AdvertisementData;
use crate::types::{
    ConnectionEvent, ConnectionEventOptions, DeviceId, ManagerOptions, ManagerState, PeerState,
    ScanOptions,
};

/// A central manager; clones share state.
#[derive(Clone)]
pub struct CentralManager {
    shared: Arc<CentralShared>,
}

pub(crate) struct CentralShared {
    id: DeviceId,
    bus: EmulatorBus,
    queue: DeliveryQueue,
    delegate: RwLock<Weak<dyn CentralDelegate>>,
    state: RwLock<ManagerState>,
    is_scanning: AtomicBool,
    discovered: RwLock<HashMap<DeviceId, RemotePeripheral>>,
    registered_for_events: AtomicBool,
    default_mtu: u16,
}

impl CentralManager {
    /// Construct and register a central manager.
    ///
    /// The façade starts at `ManagerState::Unknown`; `state_did_update`
    /// fires after the configured state-update delay, preceded by
    /// `will_restore_state` when `options.restore_identifier` matches saved
    /// state and restoration is enabled.
    pub async fn new<D: CentralDelegate>(
        bus: &EmulatorBus,
        delegate: &Arc<D>,
        queue: Option<DeliveryQueue>,
        options: ManagerOptions,
    ) -> Self {
        let id = DeviceId::new();
        let queue = queue.unwrap_or_else(|| DeliveryQueue::new(format!("central-{id}")));
        let config = bus.get_configuration().await;
        let dynamic: Arc<dyn CentralDelegate> = delegate.clone();

        let shared = Arc::new(CentralShared {
            id,
            bus: bus.clone(),
            queue,
            delegate: RwLock::new(Arc::downgrade(&dynamic)),
            state: RwLock::new(ManagerState::Unknown),
            is_scanning: AtomicBool::new(false),
            discovered: RwLock::new(HashMap::new()),
            registered_for_events: AtomicBool::new(false),
            default_mtu: config.mtu.default_mtu,
        });
        bus.register_central(id, Arc::downgrade(&shared));

        // Restoration replays before the powered-on transition.
        let restoration = match &options.restore_identifier {
            Some(restore_id) if config.restoration.state_restoration_enabled => bus
                .restore_state(restore_id, RestorationKind::Central)
                .await
                .and_then(|bytes| decode_blob::<CentralStateBlob>(&bytes)),
            _ => None,
        };
        if let Some(blob) = restoration {
            let peripherals: Vec<RemotePeripheral> = blob
                .peripherals
                .iter()
                .map(|peripheral| shared.proxy_for(*peripheral, None))
                .collect();
            let payload = CentralRestoration {
                peripherals,
                scan_services: blob.scan_services,
                scan_options: blob.scan_options,
            };
            shared.with_delegate(move |delegate| delegate.will_restore_state(payload));
        }

        let target_state = config.forced_manager_state.unwrap_or(ManagerState::PoweredOn);
        let delay = config.timing.state_update;
        let init = Arc::clone(&shared);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            *init.state.write().expect("central lock") = target_state;
            init.with_delegate(move |delegate| delegate.state_did_update(target_state));
        });

        Self { shared }
    }

    pub fn identifier(&self) -> DeviceId {
        self.shared.id
    }

    pub fn state(&self) -> ManagerState {
        *self.shared.state.read().expect("central lock")
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.is_scanning.load(Ordering::Relaxed)
    }

    /// Replace the delegate; the façade keeps a weak handle.
    pub fn set_delegate<D: CentralDelegate>(&self, delegate: &Arc<D>) {
        let dynamic: Arc<dyn CentralDelegate> = delegate.clone();
        *self.shared.delegate.write().expect("central lock") = Arc::downgrade(&dynamic);
    }

    /// Begin scanning. Requires the powered-on state; discoveries arrive via
    /// `did_discover` once per scan interval as the matcher passes them.
    pub fn scan_for_peripherals(
        &self,
        services: Option<Vec<BleUuid>>,
        options: ScanOptions,
    ) -> EmulatorResult<()> {
        if self.state() != ManagerState::PoweredOn {
            return Err(ConnectionError::InvalidParameters.into());
        }
        self.shared.is_scanning.store(true, Ordering::Relaxed);
        self.shared.bus.start_scanning(self.shared.id, services, options);
        Ok(())
    }

    pub fn stop_scan(&self) {
        self.shared.is_scanning.store(false, Ordering::Relaxed);
        self.shared.bus.stop_scanning(self.shared.id);
    }

    /// Initiate a connection; `did_connect` or `did_fail_to_connect` follows.
    pub fn connect(&self, peripheral: &RemotePeripheral) {
        // Pin the proxy in the discovered set so retrieval finds it even if
        // it was constructed out-of-band (e.g. through restoration).
        self.shared
            .discovered
            .write()
            .expect("central lock")
            .entry(peripheral.identifier())
            .or_insert_with(|| peripheral.clone());
        peripheral.set_state(PeerState::Connecting);

        let shared = Arc::clone(&self.shared);
        let proxy = peripheral.clone();
        tokio::spawn(async move {
            match shared.bus.connect(shared.id, proxy.identifier()).await {
                Ok(mtu) => {
                    proxy.set_mtu(mtu);
                    proxy.set_state(PeerState::Connected);
                    let delivered = proxy.clone();
                    shared.with_delegate(move |delegate| delegate.did_connect(delivered));
                }
                Err(error) => {
                    proxy.set_state(PeerState::Disconnected);
                    let delivered = proxy.clone();
                    shared.with_delegate(move |delegate| {
                        delegate.did_fail_to_connect(delivered, error)
                    });
                }
            }
        });
    }

    /// Tear a connection down; `did_disconnect_peripheral` follows.
    pub fn cancel_peripheral_connection(&self, peripheral: &RemotePeripheral) {
        peripheral.set_state(PeerState::Disconnecting);
        let shared = Arc::clone(&self.shared);
        let proxy = peripheral.clone();
        tokio::spawn(async move {
            let result = shared.bus.disconnect(shared.id, proxy.identifier()).await;
            proxy.set_state(PeerState::Disconnected);
            let delivered = proxy.clone();
            shared.with_delegate(move |delegate| {
                delegate.did_disconnect_peripheral(delivered, result.err())
            });
        });
    }

    /// The subset of the given identifiers already known to this central
    pub fn retrieve_peripherals(&self, identifiers: &[DeviceId]) -> Vec<RemotePeripheral> {
        let discovered = self.shared.discovered.read().expect("central lock");
        identifiers
            .iter()
            .filter_map(|id| discovered.get(id).cloned())
            .collect()
    }

    /// Known peripherals that are connected and whose cached services
    /// intersect the given list
    pub fn retrieve_connected_peripherals(&self, services: &[BleUuid]) -> Vec<RemotePeripheral> {
        let discovered = self.shared.discovered.read().expect("central lock");
        discovered
            .values()
            .filter(|proxy| proxy.state() == PeerState::Connected)
            .filter(|proxy| {
                proxy
                    .services()
                    .iter()
                    .any(|service| services.contains(&service.uuid()))
            })
            .cloned()
            .collect()
    }

    /// Opt in to `connection_event_did_occur` callbacks
    pub fn register_for_connection_events(&self, options: Option<ConnectionEventOptions>) {
        self.shared.registered_for_events.store(true, Ordering::Relaxed);
        self.shared.bus.register_for_connection_events(self.shared.id, options);
    }

    pub fn is_registered_for_connection_events(&self) -> bool {
        self.shared.registered_for_events.load(Ordering::Relaxed)
    }

    /// Persist this central's connected set and scan state under the given
    /// restore identifier
    pub async fn save_state(&self, restore_id: &str) -> bool {
        self.shared.bus.save_central_state(self.shared.id, restore_id).await
    }
}

impl Drop for CentralShared {
    fn drop(&mut self) {
        self.bus.unregister_central(self.id);
    }
}

// ----------------------------------------------------------------------------
// Bus-facing delivery surface
// ----------------------------------------------------------------------------

impl CentralShared {
    fn with_delegate<F>(&self, call: F)
    where
        F: FnOnce(&dyn CentralDelegate) + Send + 'static,
    {
        let weak = self.delegate.read().expect("central lock").clone();
        self.queue.submit(move || {
            if let Some(delegate) = weak.upgrade() {
                call(&*delegate);
            }
        });
    }

    /// Existing proxy for a peripheral, or a freshly built one
    fn proxy_for(&self, peripheral: DeviceId, name: Option<String>) -> RemotePeripheral {
        let mut discovered = self.discovered.write().expect("central lock");
        let proxy = discovered.entry(peripheral).or_insert_with(|| {
            RemotePeripheral::new(
                self.bus.clone(),
                self.id,
                peripheral,
                self.queue.clone(),
                self.default_mtu,
            )
        });
        proxy.set_name(name);
        proxy.clone()
    }

    pub(crate) fn deliver_discovered(
        &self,
        peripheral: DeviceId,
        advertisement: AdvertisementData,
        rssi: i16,
    ) {
        let name = advertisement.local_name().map(str::to_string);
        let proxy = self.proxy_for(peripheral, name);
        debug!(central = %self.id, %peripheral, rssi, "peripheral discovered");
        self.with_delegate(move |delegate| delegate.did_discover(proxy, advertisement, rssi));
    }

    pub(crate) fn deliver_connection_event(&self, event: ConnectionEvent, peripheral: DeviceId) {
        let proxy = self.proxy_for(peripheral, None);
        self.with_delegate(move |delegate| delegate.connection_event_did_occur(event, proxy));
    }

    pub(crate) fn deliver_peripheral_disconnected(
        &self,
        peripheral: DeviceId,
        error: Option<EmulatorError>,
    ) {
        let Some(proxy) = self.discovered.read().expect("central lock").get(&peripheral).cloned()
        else {
            return;
        };
        proxy.set_state(PeerState::Disconnected);
        self.with_delegate(move |delegate| delegate.did_disconnect_peripheral(proxy, error));
    }

    pub(crate) fn deliver_value_update(
        &self,
        peripheral: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
    ) {
        let proxy = self.discovered.read().expect("central lock").get(&peripheral).cloned();
        if let Some(proxy) = proxy {
            proxy.deliver_value_update(characteristic, value);
        }
    }

    pub(crate) fn deliver_ready_for_write_without_response(&self, peripheral: DeviceId) {
        let proxy = self.discovered.read().expect("central lock").get(&peripheral).cloned();
        if let Some(proxy) = proxy {
            proxy.deliver_ready_for_write_without_response();
        }
    }

    pub(crate) fn deliver_ancs_authorization_changed(&self, peripheral: DeviceId) {
        let proxy = self.proxy_for(peripheral, None);
        self.with_delegate(move |delegate| delegate.did_update_ancs_authorization_for(proxy));
    }

    pub(crate) fn deliver_services_modified(
        &self,
        peripheral: DeviceId,
        removed: Vec<ServiceSnapshot>,
    ) {
        let proxy = self.discovered.read().expect("central lock").get(&peripheral).cloned();
        if let Some(proxy) = proxy {
            proxy.deliver_services_modified(&removed);
        }
    }
}

impl std::fmt::Debug for CentralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralManager")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("is_scanning", &self.is_scanning())
            .finish()
    }
}
