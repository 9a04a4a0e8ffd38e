//! Attribute UUIDs in their 16-, 32-, and 128-bit forms
//!
//! Short forms are aliases into the Bluetooth base UUID
//! (`0000xxxx-0000-1000-8000-00805f9b34fb`); equality, ordering, and hashing
//! all go through the expanded 128-bit value so `BleUuid::from(0x180d_u16)`
//! and its full expansion compare equal.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Most significant 64 bits of the Bluetooth base UUID with the alias field zeroed.
const BASE_UUID_HI: u64 = 0x0000_0000_0000_1000;
/// Least significant 64 bits of the Bluetooth base UUID.
const BASE_UUID_LO: u64 = 0x8000_0080_5F9B_34FB;

// ----------------------------------------------------------------------------
// BleUuid
// ----------------------------------------------------------------------------

/// A GATT attribute identifier
#[derive(Debug, Clone, Copy)]
pub enum BleUuid {
    /// 16-bit alias (e.g. `0x180D`, Heart Rate)
    Short16(u16),
    /// 32-bit alias
    Short32(u32),
    /// Full 128-bit UUID
    Full(Uuid),
}

impl BleUuid {
    /// Expand to the canonical 128-bit value
    pub fn to_uuid(self) -> Uuid {
        match self {
            BleUuid::Short16(v) => alias_to_uuid(v as u32),
            BleUuid::Short32(v) => alias_to_uuid(v),
            BleUuid::Full(u) => u,
        }
    }

    /// Shortest representation of this UUID: a 16- or 32-bit alias when the
    /// value lies inside the Bluetooth base range, the full form otherwise.
    pub fn shortened(self) -> BleUuid {
        let u = self.to_uuid();
        match uuid_to_alias(u) {
            Some(v) if v <= u16::MAX as u32 => BleUuid::Short16(v as u16),
            Some(v) => BleUuid::Short32(v),
            None => BleUuid::Full(u),
        }
    }

    /// Generate a random 128-bit UUID
    pub fn random() -> Self {
        BleUuid::Full(Uuid::new_v4())
    }
}

fn alias_to_uuid(alias: u32) -> Uuid {
    Uuid::from_u64_pair(((alias as u64) << 32) | BASE_UUID_HI, BASE_UUID_LO)
}

fn uuid_to_alias(u: Uuid) -> Option<u32> {
    let (hi, lo) = u.as_u64_pair();
    if lo == BASE_UUID_LO && (hi & 0xFFFF_FFFF) == BASE_UUID_HI {
        Some((hi >> 32) as u32)
    } else {
        None
    }
}

impl PartialEq for BleUuid {
    fn eq(&self, other: &Self) -> bool {
        self.to_uuid() == other.to_uuid()
    }
}

impl Eq for BleUuid {}

impl PartialOrd for BleUuid {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BleUuid {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.to_uuid().cmp(&other.to_uuid())
    }
}

impl core::hash::Hash for BleUuid {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.to_uuid().hash(state);
    }
}

impl From<u16> for BleUuid {
    fn from(v: u16) -> Self {
        BleUuid::Short16(v)
    }
}

impl From<u32> for BleUuid {
    fn from(v: u32) -> Self {
        BleUuid::Short32(v)
    }
}

impl From<Uuid> for BleUuid {
    fn from(u: Uuid) -> Self {
        BleUuid::Full(u)
    }
}

impl fmt::Display for BleUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shortened() {
            BleUuid::Short16(v) => write!(f, "{:04X}", v),
            BleUuid::Short32(v) => write!(f, "{:08X}", v),
            BleUuid::Full(u) => write!(f, "{}", u),
        }
    }
}

/// Error parsing a [`BleUuid`] from a string
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid BLE UUID string: {input}")]
pub struct ParseBleUuidError {
    input: String,
}

impl FromStr for BleUuid {
    type Err = ParseBleUuidError;

    /// Accepts 4 hex digits (16-bit), 8 hex digits (32-bit), or the full
    /// hyphenated 128-bit form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseBleUuidError { input: s.to_string() };
        match s.len() {
            4 => u16::from_str_radix(s, 16)
                .map(BleUuid::Short16)
                .map_err(|_| invalid()),
            8 => u32::from_str_radix(s, 16)
                .map(BleUuid::Short32)
                .map_err(|_| invalid()),
            _ => Uuid::parse_str(s).map(BleUuid::Full).map_err(|_| invalid()),
        }
    }
}

// Serialized as the display string so short aliases survive a round trip
// through the transport envelope in readable form.
impl Serialize for BleUuid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BleUuid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_full_forms_compare_equal() {
        let short = BleUuid::from(0x180D_u16);
        let full: BleUuid = Uuid::parse_str("0000180d-0000-1000-8000-00805f9b34fb")
            .unwrap()
            .into();
        assert_eq!(short, full);

        let mut hasher_state = std::collections::HashSet::new();
        hasher_state.insert(short);
        assert!(hasher_state.contains(&full));
    }

    #[test]
    fn non_base_uuid_is_not_shortened() {
        let u = BleUuid::random();
        assert!(matches!(u.shortened(), BleUuid::Full(_)));
    }

    #[test]
    fn display_uses_shortest_form() {
        assert_eq!(BleUuid::from(0x2A37_u16).to_string(), "2A37");
        let full: BleUuid = Uuid::parse_str("00002a37-0000-1000-8000-00805f9b34fb")
            .unwrap()
            .into();
        assert_eq!(full.to_string(), "2A37");
    }

    #[test]
    fn parses_short_and_full_strings() {
        assert_eq!("180D".parse::<BleUuid>().unwrap(), BleUuid::from(0x180D_u16));
        assert_eq!(
            "0000180d-0000-1000-8000-00805f9b34fb".parse::<BleUuid>().unwrap(),
            BleUuid::from(0x180D_u16)
        );
        assert!("not-a-uuid".parse::<BleUuid>().is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn shortening_preserves_equality(hi in any::<u64>(), lo in any::<u64>()) {
                let uuid = BleUuid::Full(Uuid::from_u64_pair(hi, lo));
                prop_assert_eq!(uuid.shortened(), uuid);
                prop_assert_eq!(uuid.shortened().shortened(), uuid.shortened());
            }

            #[test]
            fn every_16_bit_alias_expands_into_the_base_range(alias in any::<u16>()) {
                let short = BleUuid::from(alias);
                let full = BleUuid::Full(short.to_uuid());
                prop_assert_eq!(short, full);
                prop_assert!(matches!(full.shortened(), BleUuid::Short16(v) if v == alias));
            }
        }
    }

    #[test]
    fn serde_round_trip_keeps_value() {
        let u = BleUuid::from(0x180D_u16);
        let json = serde_json::to_string(&u).unwrap();
        assert_eq!(json, "\"180D\"");
        let back: BleUuid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, u);
    }
}
