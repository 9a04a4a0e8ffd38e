//! Advertisement records
//!
//! A peripheral broadcasts a map from well-known string keys to tagged
//! values. The Bus stores the application-supplied map verbatim; the only
//! mutation ever applied is the optional synthesis of missing
//! tx-power-level / is-connectable fields on a delivery copy.
//!
//! The tagged [`AdvertisementValue`] union is shared with the transport
//! envelope so in-process and cross-process forms serialize identically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::gatt::BleUuid;

/// Well-known advertisement keys
pub mod keys {
    pub const LOCAL_NAME: &str = "local_name";
    pub const SERVICE_UUIDS: &str = "service_uuids";
    pub const SOLICITED_SERVICE_UUIDS: &str = "solicited_service_uuids";
    pub const OVERFLOW_SERVICE_UUIDS: &str = "overflow_service_uuids";
    pub const MANUFACTURER_DATA: &str = "manufacturer_data";
    pub const SERVICE_DATA: &str = "service_data";
    pub const TX_POWER_LEVEL: &str = "tx_power_level";
    pub const IS_CONNECTABLE: &str = "is_connectable";
}

// ----------------------------------------------------------------------------
// Tagged value union
// ----------------------------------------------------------------------------

/// A value stored under an advertisement key or carried in a transport
/// envelope payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AdvertisementValue {
    String(String),
    Bytes(Vec<u8>),
    Number(i64),
    Bool(bool),
    List(Vec<AdvertisementValue>),
    Dict(BTreeMap<String, AdvertisementValue>),
    Uuid(BleUuid),
}

impl AdvertisementValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AdvertisementValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AdvertisementValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            AdvertisementValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AdvertisementValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uuid_list(&self) -> Option<Vec<BleUuid>> {
        match self {
            AdvertisementValue::List(items) => items
                .iter()
                .map(|v| match v {
                    AdvertisementValue::Uuid(u) => Some(*u),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

impl From<&str> for AdvertisementValue {
    fn from(s: &str) -> Self {
        AdvertisementValue::String(s.to_string())
    }
}

impl From<Vec<u8>> for AdvertisementValue {
    fn from(b: Vec<u8>) -> Self {
        AdvertisementValue::Bytes(b)
    }
}

impl From<i64> for AdvertisementValue {
    fn from(n: i64) -> Self {
        AdvertisementValue::Number(n)
    }
}

impl From<bool> for AdvertisementValue {
    fn from(b: bool) -> Self {
        AdvertisementValue::Bool(b)
    }
}

impl From<Vec<BleUuid>> for AdvertisementValue {
    fn from(uuids: Vec<BleUuid>) -> Self {
        AdvertisementValue::List(uuids.into_iter().map(AdvertisementValue::Uuid).collect())
    }
}

// ----------------------------------------------------------------------------
// Advertisement record
// ----------------------------------------------------------------------------

/// The keyed map a peripheral broadcasts while advertising
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementData {
    entries: BTreeMap<String, AdvertisementValue>,
}

impl AdvertisementData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised local name
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.entries
            .insert(keys::LOCAL_NAME.into(), AdvertisementValue::String(name.into()));
        self
    }

    /// Set the advertised service UUID list
    pub fn with_service_uuids(mut self, uuids: Vec<BleUuid>) -> Self {
        self.entries.insert(keys::SERVICE_UUIDS.into(), uuids.into());
        self
    }

    /// Set the solicited service UUID list
    pub fn with_solicited_service_uuids(mut self, uuids: Vec<BleUuid>) -> Self {
        self.entries
            .insert(keys::SOLICITED_SERVICE_UUIDS.into(), uuids.into());
        self
    }

    /// Set manufacturer-specific data
    pub fn with_manufacturer_data(mut self, data: Vec<u8>) -> Self {
        self.entries
            .insert(keys::MANUFACTURER_DATA.into(), AdvertisementValue::Bytes(data));
        self
    }

    /// Set per-service data, keyed by service UUID
    pub fn with_service_data(mut self, data: BTreeMap<BleUuid, Vec<u8>>) -> Self {
        let dict = data
            .into_iter()
            .map(|(u, b)| (u.to_string(), AdvertisementValue::Bytes(b)))
            .collect();
        self.entries
            .insert(keys::SERVICE_DATA.into(), AdvertisementValue::Dict(dict));
        self
    }

    /// Set the advertised transmit power level in dBm
    pub fn with_tx_power_level(mut self, dbm: i64) -> Self {
        self.entries
            .insert(keys::TX_POWER_LEVEL.into(), AdvertisementValue::Number(dbm));
        self
    }

    /// Set the is-connectable flag
    pub fn with_is_connectable(mut self, connectable: bool) -> Self {
        self.entries
            .insert(keys::IS_CONNECTABLE.into(), AdvertisementValue::Bool(connectable));
        self
    }

    /// Insert an arbitrary key; stored verbatim.
    pub fn insert(&mut self, key: impl Into<String>, value: AdvertisementValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&AdvertisementValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AdvertisementValue)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn local_name(&self) -> Option<&str> {
        self.entries.get(keys::LOCAL_NAME).and_then(|v| v.as_str())
    }

    pub fn service_uuids(&self) -> Vec<BleUuid> {
        self.entries
            .get(keys::SERVICE_UUIDS)
            .and_then(|v| v.as_uuid_list())
            .unwrap_or_default()
    }

    pub fn solicited_service_uuids(&self) -> Vec<BleUuid> {
        self.entries
            .get(keys::SOLICITED_SERVICE_UUIDS)
            .and_then(|v| v.as_uuid_list())
            .unwrap_or_default()
    }

    pub fn manufacturer_data(&self) -> Option<&[u8]> {
        self.entries.get(keys::MANUFACTURER_DATA).and_then(|v| v.as_bytes())
    }

    pub fn tx_power_level(&self) -> Option<i64> {
        self.entries.get(keys::TX_POWER_LEVEL).and_then(|v| v.as_number())
    }

    pub fn is_connectable(&self) -> Option<bool> {
        self.entries.get(keys::IS_CONNECTABLE).and_then(|v| v.as_bool())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_round_trips_typed_accessors() {
        let adv = AdvertisementData::new()
            .with_local_name("HR")
            .with_service_uuids(vec![BleUuid::from(0x180D_u16)])
            .with_tx_power_level(-8)
            .with_is_connectable(true);

        assert_eq!(adv.local_name(), Some("HR"));
        assert_eq!(adv.service_uuids(), vec![BleUuid::from(0x180D_u16)]);
        assert_eq!(adv.tx_power_level(), Some(-8));
        assert_eq!(adv.is_connectable(), Some(true));
        assert_eq!(adv.manufacturer_data(), None);
    }

    #[test]
    fn arbitrary_keys_are_stored_verbatim() {
        let mut adv = AdvertisementData::new();
        adv.insert("vendor_field", AdvertisementValue::Bytes(vec![1, 2, 3]));
        assert_eq!(
            adv.get("vendor_field").and_then(|v| v.as_bytes()),
            Some(&[1u8, 2, 3][..])
        );
    }

    #[test]
    fn tagged_union_serializes_with_type_tag() {
        let v = AdvertisementValue::Uuid(BleUuid::from(0x180D_u16));
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"type":"uuid","value":"180D"}"#);
    }

    #[test]
    fn mixed_uuid_list_is_rejected_by_accessor() {
        let v = AdvertisementValue::List(vec![
            AdvertisementValue::Uuid(BleUuid::from(0x180D_u16)),
            AdvertisementValue::Number(7),
        ]);
        assert_eq!(v.as_uuid_list(), None);
    }
}
