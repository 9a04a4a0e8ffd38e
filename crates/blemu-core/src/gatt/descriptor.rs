//! Descriptors: metadata attributes attached to a characteristic

use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};

use crate::gatt::characteristic::{AttributePermission, Characteristic, CharacteristicInner};
use crate::gatt::BleUuid;

/// A GATT descriptor handle; clones share state.
#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<DescriptorInner>,
}

struct DescriptorInner {
    uuid: BleUuid,
    permissions: Vec<AttributePermission>,
    state: RwLock<DescriptorState>,
}

struct DescriptorState {
    value: Option<Vec<u8>>,
    characteristic: Weak<CharacteristicInner>,
}

impl Descriptor {
    /// Create a descriptor with the default readable+writeable permissions
    pub fn new(uuid: impl Into<BleUuid>, value: Option<Vec<u8>>) -> Self {
        Self::with_permissions(
            uuid,
            value,
            vec![AttributePermission::Readable, AttributePermission::Writeable],
        )
    }

    pub fn with_permissions(
        uuid: impl Into<BleUuid>,
        value: Option<Vec<u8>>,
        permissions: Vec<AttributePermission>,
    ) -> Self {
        Self {
            inner: Arc::new(DescriptorInner {
                uuid: uuid.into(),
                permissions,
                state: RwLock::new(DescriptorState {
                    value,
                    characteristic: Weak::new(),
                }),
            }),
        }
    }

    pub fn uuid(&self) -> BleUuid {
        self.inner.uuid
    }

    pub fn permissions(&self) -> &[AttributePermission] {
        &self.inner.permissions
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        self.inner.state.read().expect("descriptor lock").value.clone()
    }

    pub fn set_value(&self, value: Option<Vec<u8>>) {
        self.inner.state.write().expect("descriptor lock").value = value;
    }

    pub fn is_readable(&self) -> bool {
        self.inner.permissions.contains(&AttributePermission::Readable)
            || self.inner.permissions.contains(&AttributePermission::ReadEncryptionRequired)
    }

    pub fn is_writeable(&self) -> bool {
        self.inner.permissions.contains(&AttributePermission::Writeable)
            || self.inner.permissions.contains(&AttributePermission::WriteEncryptionRequired)
    }

    /// The owning characteristic, when attached
    pub fn characteristic(&self) -> Option<Characteristic> {
        self.inner
            .state
            .read()
            .expect("descriptor lock")
            .characteristic
            .upgrade()
            .map(Characteristic::from_inner)
    }

    pub(crate) fn set_characteristic(&self, characteristic: Weak<CharacteristicInner>) {
        self.inner.state.write().expect("descriptor lock").characteristic = characteristic;
    }

    pub fn snapshot(&self) -> DescriptorSnapshot {
        DescriptorSnapshot {
            uuid: self.inner.uuid,
            value: self.value(),
            permissions: self.inner.permissions.clone(),
        }
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Descriptor {}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("uuid", &self.inner.uuid)
            .finish()
    }
}

/// Plain-data image of a descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSnapshot {
    pub uuid: BleUuid,
    pub value: Option<Vec<u8>>,
    pub permissions: Vec<AttributePermission>,
}

impl DescriptorSnapshot {
    pub fn materialize(&self) -> Descriptor {
        Descriptor::with_permissions(self.uuid, self.value.clone(), self.permissions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_permissions_are_readable_and_writeable() {
        let descriptor = Descriptor::new(0x2901_u16, None);
        assert!(descriptor.is_readable());
        assert!(descriptor.is_writeable());
    }

    #[test]
    fn value_updates_are_visible_through_clones() {
        let descriptor = Descriptor::new(0x2901_u16, Some(vec![1]));
        let clone = descriptor.clone();
        clone.set_value(Some(vec![2]));
        assert_eq!(descriptor.value(), Some(vec![2]));
    }
}
