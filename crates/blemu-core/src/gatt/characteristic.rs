//! Characteristics: valued attributes with properties, permissions, and a
//! subscriber list

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};

use crate::gatt::descriptor::{Descriptor, DescriptorSnapshot};
use crate::gatt::service::{Service, ServiceInner};
use crate::gatt::BleUuid;
use crate::types::DeviceId;

// ----------------------------------------------------------------------------
// Properties and permissions
// ----------------------------------------------------------------------------

/// What operations a characteristic declares support for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharacteristicProperty {
    Broadcast,
    Read,
    WriteWithoutResponse,
    Write,
    Notify,
    Indicate,
    AuthenticatedSignedWrites,
    ExtendedProperties,
    NotifyEncryptionRequired,
    IndicateEncryptionRequired,
}

/// What access the attribute grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributePermission {
    Readable,
    Writeable,
    ReadEncryptionRequired,
    WriteEncryptionRequired,
}

// ----------------------------------------------------------------------------
// Characteristic
// ----------------------------------------------------------------------------

/// A GATT characteristic handle; clones share state.
///
/// `is_notifying` is true exactly while the subscriber list is non-empty.
#[derive(Clone)]
pub struct Characteristic {
    inner: Arc<CharacteristicInner>,
}

pub(crate) struct CharacteristicInner {
    uuid: BleUuid,
    properties: Vec<CharacteristicProperty>,
    permissions: Vec<AttributePermission>,
    state: RwLock<CharacteristicState>,
}

struct CharacteristicState {
    value: Option<Vec<u8>>,
    descriptors: Vec<Descriptor>,
    subscribers: BTreeSet<DeviceId>,
    service: Weak<ServiceInner>,
}

impl Characteristic {
    /// Create a characteristic with the given UUID, declared properties,
    /// initial value, and permissions
    pub fn new(
        uuid: impl Into<BleUuid>,
        properties: Vec<CharacteristicProperty>,
        value: Option<Vec<u8>>,
        permissions: Vec<AttributePermission>,
    ) -> Self {
        Self {
            inner: Arc::new(CharacteristicInner {
                uuid: uuid.into(),
                properties,
                permissions,
                state: RwLock::new(CharacteristicState {
                    value,
                    descriptors: Vec::new(),
                    subscribers: BTreeSet::new(),
                    service: Weak::new(),
                }),
            }),
        }
    }

    /// A readable characteristic with default permissions
    pub fn readable(uuid: impl Into<BleUuid>, value: Vec<u8>) -> Self {
        Self::new(
            uuid,
            vec![CharacteristicProperty::Read],
            Some(value),
            vec![AttributePermission::Readable],
        )
    }

    pub fn uuid(&self) -> BleUuid {
        self.inner.uuid
    }

    pub fn properties(&self) -> &[CharacteristicProperty] {
        &self.inner.properties
    }

    pub fn permissions(&self) -> &[AttributePermission] {
        &self.inner.permissions
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        self.inner.state.read().expect("characteristic lock").value.clone()
    }

    pub fn set_value(&self, value: Option<Vec<u8>>) {
        self.inner.state.write().expect("characteristic lock").value = value;
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.inner.state.read().expect("characteristic lock").descriptors.clone()
    }

    /// Attach a descriptor; its back-reference is set to this characteristic.
    pub fn add_descriptor(&self, descriptor: Descriptor) {
        descriptor.set_characteristic(Arc::downgrade(&self.inner));
        self.inner
            .state
            .write()
            .expect("characteristic lock")
            .descriptors
            .push(descriptor);
    }

    pub fn descriptor(&self, uuid: BleUuid) -> Option<Descriptor> {
        self.inner
            .state
            .read()
            .expect("characteristic lock")
            .descriptors
            .iter()
            .find(|d| d.uuid() == uuid)
            .cloned()
    }

    /// The owning service, when this characteristic is part of a service tree
    pub fn service(&self) -> Option<Service> {
        self.inner
            .state
            .read()
            .expect("characteristic lock")
            .service
            .upgrade()
            .map(Service::from_inner)
    }

    pub fn is_notifying(&self) -> bool {
        !self.inner.state.read().expect("characteristic lock").subscribers.is_empty()
    }

    pub fn subscribers(&self) -> Vec<DeviceId> {
        self.inner
            .state
            .read()
            .expect("characteristic lock")
            .subscribers
            .iter()
            .copied()
            .collect()
    }

    pub fn has_property(&self, property: CharacteristicProperty) -> bool {
        self.inner.properties.contains(&property)
    }

    pub fn is_readable(&self) -> bool {
        self.inner.permissions.contains(&AttributePermission::Readable)
            || self.inner.permissions.contains(&AttributePermission::ReadEncryptionRequired)
    }

    pub fn is_writeable(&self) -> bool {
        self.inner.permissions.contains(&AttributePermission::Writeable)
            || self.inner.permissions.contains(&AttributePermission::WriteEncryptionRequired)
    }

    /// Declares notify or indicate support
    pub fn supports_subscriptions(&self) -> bool {
        self.has_property(CharacteristicProperty::Notify)
            || self.has_property(CharacteristicProperty::Indicate)
    }

    pub fn requires_read_encryption(&self) -> bool {
        self.inner.permissions.contains(&AttributePermission::ReadEncryptionRequired)
    }

    pub fn requires_write_encryption(&self) -> bool {
        self.inner.permissions.contains(&AttributePermission::WriteEncryptionRequired)
    }

    pub fn requires_subscription_encryption(&self) -> bool {
        self.has_property(CharacteristicProperty::NotifyEncryptionRequired)
            || self.has_property(CharacteristicProperty::IndicateEncryptionRequired)
    }

    /// Add a subscriber; returns true when the set changed.
    pub(crate) fn subscribe(&self, central: DeviceId) -> bool {
        self.inner
            .state
            .write()
            .expect("characteristic lock")
            .subscribers
            .insert(central)
    }

    /// Remove a subscriber; returns true when the set changed.
    pub(crate) fn unsubscribe(&self, central: DeviceId) -> bool {
        self.inner
            .state
            .write()
            .expect("characteristic lock")
            .subscribers
            .remove(&central)
    }

    pub(crate) fn set_service(&self, service: Weak<ServiceInner>) {
        self.inner.state.write().expect("characteristic lock").service = service;
    }

    pub(crate) fn from_inner(inner: Arc<CharacteristicInner>) -> Self {
        Self { inner }
    }

    /// Detached copy of the attribute data, for crossing to the central side
    pub fn snapshot(&self) -> CharacteristicSnapshot {
        let state = self.inner.state.read().expect("characteristic lock");
        CharacteristicSnapshot {
            uuid: self.inner.uuid,
            properties: self.inner.properties.clone(),
            permissions: self.inner.permissions.clone(),
            value: state.value.clone(),
            descriptors: state.descriptors.iter().map(|d| d.snapshot()).collect(),
        }
    }
}

impl PartialEq for Characteristic {
    /// Handle identity: two handles are equal when they share state.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Characteristic {}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.inner.uuid)
            .field("properties", &self.inner.properties)
            .field("is_notifying", &self.is_notifying())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Plain-data image of a characteristic, used in discovery replies,
/// restoration blobs, and transport envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicSnapshot {
    pub uuid: BleUuid,
    pub properties: Vec<CharacteristicProperty>,
    pub permissions: Vec<AttributePermission>,
    pub value: Option<Vec<u8>>,
    pub descriptors: Vec<DescriptorSnapshot>,
}

impl CharacteristicSnapshot {
    /// Materialize a detached characteristic from this image
    pub fn materialize(&self) -> Characteristic {
        let characteristic = Characteristic::new(
            self.uuid,
            self.properties.clone(),
            self.value.clone(),
            self.permissions.clone(),
        );
        for descriptor in &self.descriptors {
            characteristic.add_descriptor(descriptor.materialize());
        }
        characteristic
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
