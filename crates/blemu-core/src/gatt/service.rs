//! Services: ordered groups of characteristics, optionally including other
//! services

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::gatt::characteristic::{Characteristic, CharacteristicSnapshot};
use crate::gatt::BleUuid;
use crate::types::DeviceId;

/// A GATT service handle; clones share state.
///
/// Child order is insertion order and is preserved through discovery.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

pub(crate) struct ServiceInner {
    uuid: BleUuid,
    is_primary: bool,
    state: RwLock<ServiceState>,
}

struct ServiceState {
    characteristics: Vec<Characteristic>,
    included: Vec<Service>,
    /// Owning peripheral façade, set when added to one. Non-owning: an
    /// identifier rather than a handle, resolved through the Bus registry.
    peripheral: Option<DeviceId>,
}

impl Service {
    pub fn new(uuid: impl Into<BleUuid>, is_primary: bool) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                uuid: uuid.into(),
                is_primary,
                state: RwLock::new(ServiceState {
                    characteristics: Vec::new(),
                    included: Vec::new(),
                    peripheral: None,
                }),
            }),
        }
    }

    /// A primary service
    pub fn primary(uuid: impl Into<BleUuid>) -> Self {
        Self::new(uuid, true)
    }

    pub fn uuid(&self) -> BleUuid {
        self.inner.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.inner.is_primary
    }

    /// Append a characteristic; its back-reference is set to this service.
    pub fn add_characteristic(&self, characteristic: Characteristic) {
        characteristic.set_service(Arc::downgrade(&self.inner));
        self.inner
            .state
            .write()
            .expect("service lock")
            .characteristics
            .push(characteristic);
    }

    pub fn characteristics(&self) -> Vec<Characteristic> {
        self.inner.state.read().expect("service lock").characteristics.clone()
    }

    pub fn characteristic(&self, uuid: BleUuid) -> Option<Characteristic> {
        self.inner
            .state
            .read()
            .expect("service lock")
            .characteristics
            .iter()
            .find(|c| c.uuid() == uuid)
            .cloned()
    }

    /// Append an included (secondary) service
    pub fn add_included_service(&self, service: Service) {
        self.inner.state.write().expect("service lock").included.push(service);
    }

    pub fn included_services(&self) -> Vec<Service> {
        self.inner.state.read().expect("service lock").included.clone()
    }

    /// Identifier of the owning peripheral façade, when owned
    pub fn peripheral_id(&self) -> Option<DeviceId> {
        self.inner.state.read().expect("service lock").peripheral
    }

    pub(crate) fn set_peripheral(&self, peripheral: Option<DeviceId>) {
        self.inner.state.write().expect("service lock").peripheral = peripheral;
    }

    pub(crate) fn from_inner(inner: Arc<ServiceInner>) -> Self {
        Self { inner }
    }

    /// Detached copy of the whole subtree
    pub fn snapshot(&self) -> ServiceSnapshot {
        let state = self.inner.state.read().expect("service lock");
        ServiceSnapshot {
            uuid: self.inner.uuid,
            is_primary: self.inner.is_primary,
            characteristics: state.characteristics.iter().map(|c| c.snapshot()).collect(),
            included_services: state.included.iter().map(|s| s.snapshot()).collect(),
        }
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Service {}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.inner.uuid)
            .field("is_primary", &self.inner.is_primary)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Plain-data image of a service subtree, used in discovery replies,
/// restoration blobs, and transport envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub uuid: BleUuid,
    pub is_primary: bool,
    pub characteristics: Vec<CharacteristicSnapshot>,
    pub included_services: Vec<ServiceSnapshot>,
}

impl ServiceSnapshot {
    /// Materialize a detached service tree from this image
    pub fn materialize(&self) -> Service {
        let service = Service::new(self.uuid, self.is_primary);
        for characteristic in &self.characteristics {
            service.add_characteristic(characteristic.materialize());
        }
        for included in &self.included_services {
            service.add_included_service(included.materialize());
        }
        service
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
