//! GATT attribute objects
//!
//! Passive containers for the service / characteristic / descriptor
//! hierarchy. Handles are cheap clones sharing interior state; the graph's
//! child-to-parent back-references are non-owning weak handles, so dropping
//! a peripheral's service tree never leaks through a reference cycle.
//!
//! Mutation happens only under the owning peripheral façade's (or the Bus's)
//! serialization; the application observes through the same handles.

mod characteristic;
mod descriptor;
mod service;
pub mod uuid;

pub use characteristic::{
    AttributePermission, Characteristic, CharacteristicProperty, CharacteristicSnapshot,
};
pub use descriptor::{Descriptor, DescriptorSnapshot};
pub use service::{Service, ServiceSnapshot};
pub use uuid::{BleUuid, ParseBleUuidError};
