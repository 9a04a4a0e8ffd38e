//! Emulator configuration
//!
//! An immutable snapshot installed atomically on the Bus via
//! [`crate::bus::EmulatorBus::configure`]. Grouped sub-configs cover timing,
//! RSSI simulation, fault injection, MTU, back-pressure, security, scan
//! behavior, restoration, auxiliary events, and advertisement synthesis.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ManagerState;

/// Smallest MTU the attribute protocol permits.
pub const MIN_MTU: u16 = 23;

// ----------------------------------------------------------------------------
// Timing
// ----------------------------------------------------------------------------

/// Delay inserted before each corresponding event is delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay before a fresh manager reports powered-on
    pub state_update: Duration,
    /// Period of the per-central scan loop
    pub scan_interval: Duration,
    pub connection: Duration,
    pub disconnection: Duration,
    pub service_discovery: Duration,
    pub characteristic_discovery: Duration,
    pub descriptor_discovery: Duration,
    pub read: Duration,
    pub write: Duration,
    pub notification: Duration,
    pub pairing: Duration,
    /// Drain period for the write-without-response and notification queues;
    /// also the processing delay of a write-without-response itself
    pub backpressure_processing: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            state_update: Duration::from_millis(40),
            scan_interval: Duration::from_millis(100),
            connection: Duration::from_millis(150),
            disconnection: Duration::from_millis(100),
            service_discovery: Duration::from_millis(100),
            characteristic_discovery: Duration::from_millis(100),
            descriptor_discovery: Duration::from_millis(80),
            read: Duration::from_millis(50),
            write: Duration::from_millis(50),
            notification: Duration::from_millis(40),
            pairing: Duration::from_millis(200),
            backpressure_processing: Duration::from_millis(100),
        }
    }
}

impl TimingConfig {
    /// Everything delivered as fast as the scheduler allows
    pub fn instant() -> Self {
        Self {
            state_update: Duration::ZERO,
            // A zero-period scan loop would spin; one millisecond keeps the
            // loop cooperative while still being effectively immediate.
            scan_interval: Duration::from_millis(1),
            connection: Duration::ZERO,
            disconnection: Duration::ZERO,
            service_discovery: Duration::ZERO,
            characteristic_discovery: Duration::ZERO,
            descriptor_discovery: Duration::ZERO,
            read: Duration::ZERO,
            write: Duration::ZERO,
            notification: Duration::ZERO,
            pairing: Duration::ZERO,
            backpressure_processing: Duration::ZERO,
        }
    }

    /// Elongated delays approximating a congested radio environment
    pub fn slow() -> Self {
        Self {
            state_update: Duration::from_millis(500),
            scan_interval: Duration::from_millis(750),
            connection: Duration::from_secs(2),
            disconnection: Duration::from_millis(800),
            service_discovery: Duration::from_millis(900),
            characteristic_discovery: Duration::from_millis(900),
            descriptor_discovery: Duration::from_millis(700),
            read: Duration::from_millis(400),
            write: Duration::from_millis(400),
            notification: Duration::from_millis(300),
            pairing: Duration::from_secs(1),
            backpressure_processing: Duration::from_millis(500),
        }
    }
}

// ----------------------------------------------------------------------------
// RSSI
// ----------------------------------------------------------------------------

/// Simulated signal-strength policy.
///
/// Each reading is `clamp(range, uniform(range) + uniform(-variation, +variation))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssiConfig {
    /// Inclusive dBm range readings are drawn from and clamped to
    pub range: (i16, i16),
    /// Symmetric jitter added to each draw
    pub variation: i16,
}

impl Default for RssiConfig {
    fn default() -> Self {
        Self {
            range: (-90, -40),
            variation: 5,
        }
    }
}

impl RssiConfig {
    /// Draw one reading under this policy
    pub fn sample(&self) -> i16 {
        let (low, high) = self.range;
        let base = fastrand::i16(low..=high);
        let jitter = fastrand::i16(-self.variation..=self.variation);
        base.saturating_add(jitter).clamp(low, high)
    }
}

// ----------------------------------------------------------------------------
// Fault injection
// ----------------------------------------------------------------------------

/// Probabilistic failure injection for connection and attribute operations
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FaultConfig {
    pub simulate_connection_failure: bool,
    /// Probability in `[0, 1]` a connect attempt fails
    pub connection_failure_rate: f64,
    pub simulate_read_write_errors: bool,
    /// Probability in `[0, 1]` a read or write fails with the corresponding
    /// ATT permission error
    pub read_write_error_rate: f64,
}

impl FaultConfig {
    /// Non-zero error rates for resilience testing
    pub fn unreliable() -> Self {
        Self {
            simulate_connection_failure: true,
            connection_failure_rate: 0.2,
            simulate_read_write_errors: true,
            read_write_error_rate: 0.1,
        }
    }

    pub fn should_fail_connection(&self) -> bool {
        self.simulate_connection_failure && fastrand::f64() < self.connection_failure_rate
    }

    pub fn should_fail_read_write(&self) -> bool {
        self.simulate_read_write_errors && fastrand::f64() < self.read_write_error_rate
    }
}

// ----------------------------------------------------------------------------
// MTU
// ----------------------------------------------------------------------------

/// Per-connection MTU parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtuConfig {
    /// What a fresh connection starts with
    pub default_mtu: u16,
    /// Negotiation cap
    pub maximum_mtu: u16,
}

impl Default for MtuConfig {
    fn default() -> Self {
        Self {
            default_mtu: 185,
            maximum_mtu: 512,
        }
    }
}

impl MtuConfig {
    /// Minimal link parameters
    pub fn constrained() -> Self {
        Self {
            default_mtu: MIN_MTU,
            maximum_mtu: 185,
        }
    }
}

// ----------------------------------------------------------------------------
// Back-pressure
// ----------------------------------------------------------------------------

/// Queue caps for write-without-response and notification traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureConfig {
    pub max_write_without_response_queue: u32,
    pub max_notification_queue: u32,
    /// When false the queues are accounted but never reject
    pub simulate_backpressure: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_write_without_response_queue: 20,
            max_notification_queue: 10,
            simulate_backpressure: false,
        }
    }
}

impl BackpressureConfig {
    /// Small queues with rejection enabled
    pub fn tight() -> Self {
        Self {
            max_write_without_response_queue: 5,
            max_notification_queue: 5,
            simulate_backpressure: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Security
// ----------------------------------------------------------------------------

/// Whether encrypted attributes trigger a pairing step and how it resolves.
/// The pairing delay itself lives in [`TimingConfig::pairing`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Gate encrypted attributes behind a paired link
    pub require_pairing: bool,
    /// When false, pairing auto-succeeds with no delay
    pub simulate_pairing: bool,
    /// Outcome of a simulated pairing attempt
    pub pairing_succeeds: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_pairing: false,
            simulate_pairing: false,
            pairing_succeeds: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Scan behavior
// ----------------------------------------------------------------------------

/// Which scan-call options the matcher honors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanBehaviorConfig {
    pub honor_allow_duplicates: bool,
    pub honor_solicited_service_uuids: bool,
}

impl Default for ScanBehaviorConfig {
    fn default() -> Self {
        Self {
            honor_allow_duplicates: true,
            honor_solicited_service_uuids: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Restoration / events / advertisement synthesis
// ----------------------------------------------------------------------------

/// Gates the state-save/restore surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorationConfig {
    pub state_restoration_enabled: bool,
}

impl Default for RestorationConfig {
    fn default() -> Self {
        Self {
            state_restoration_enabled: true,
        }
    }
}

/// Gates auxiliary connection and authorization events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    pub fire_connection_events: bool,
    pub fire_ancs_authorization_updates: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            fire_connection_events: true,
            fire_ancs_authorization_updates: true,
        }
    }
}

/// Synthesis of plausible advertisement fields on delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementConfig {
    /// When true and the stored record lacks tx-power-level or
    /// is-connectable, delivery copies gain synthesized defaults. The stored
    /// record is never touched.
    pub auto_generate_advertisement_fields: bool,
}

impl Default for AdvertisementConfig {
    fn default() -> Self {
        Self {
            auto_generate_advertisement_fields: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Master configuration
// ----------------------------------------------------------------------------

/// The immutable configuration snapshot the Bus runs under
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmulatorConfig {
    pub timing: TimingConfig,
    pub rssi: RssiConfig,
    pub faults: FaultConfig,
    pub mtu: MtuConfig,
    pub backpressure: BackpressureConfig,
    pub security: SecurityConfig,
    pub scan: ScanBehaviorConfig,
    pub restoration: RestorationConfig,
    pub events: EventConfig,
    pub advertisement: AdvertisementConfig,
    /// Pin every manager to a state other than powered-on, for failure
    /// testing. `None` means the normal unknown → powered-on transition.
    pub forced_manager_state: Option<ManagerState>,
}

impl EmulatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// All delays zero; the fastest configuration for unit tests
    pub fn instant() -> Self {
        Self {
            timing: TimingConfig::instant(),
            ..Self::default()
        }
    }

    /// Long delays, a small MTU, and enforced back-pressure
    pub fn slow() -> Self {
        Self {
            timing: TimingConfig::slow(),
            mtu: MtuConfig::constrained(),
            backpressure: BackpressureConfig::tight(),
            ..Self::default()
        }
    }

    /// Instant timing with non-zero injected error rates
    pub fn unreliable() -> Self {
        Self {
            timing: TimingConfig::instant(),
            faults: FaultConfig::unreliable(),
            ..Self::default()
        }
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_rssi(mut self, rssi: RssiConfig) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_mtu(mut self, mtu: MtuConfig) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureConfig) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    pub fn with_scan_behavior(mut self, scan: ScanBehaviorConfig) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_restoration(mut self, restoration: RestorationConfig) -> Self {
        self.restoration = restoration;
        self
    }

    pub fn with_events(mut self, events: EventConfig) -> Self {
        self.events = events;
        self
    }

    pub fn with_advertisement(mut self, advertisement: AdvertisementConfig) -> Self {
        self.advertisement = advertisement;
        self
    }

    pub fn with_forced_manager_state(mut self, state: ManagerState) -> Self {
        self.forced_manager_state = Some(state);
        self
    }

    /// Check the snapshot for consistency before installing it
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.faults.connection_failure_rate) {
            return Err("Connection failure rate must be within [0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.faults.read_write_error_rate) {
            return Err("Read/write error rate must be within [0, 1]".into());
        }
        if self.mtu.default_mtu < MIN_MTU {
            return Err(format!("Default MTU cannot be below {MIN_MTU}"));
        }
        if self.mtu.default_mtu > self.mtu.maximum_mtu {
            return Err("Default MTU cannot exceed maximum MTU".into());
        }
        if self.backpressure.max_write_without_response_queue == 0 {
            return Err("Write-without-response queue cap cannot be zero".into());
        }
        if self.backpressure.max_notification_queue == 0 {
            return Err("Notification queue cap cannot be zero".into());
        }
        if self.rssi.range.0 > self.rssi.range.1 {
            return Err("RSSI range low bound exceeds high bound".into());
        }
        if self.rssi.variation < 0 {
            return Err("RSSI variation cannot be negative".into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        assert!(EmulatorConfig::default().validate().is_ok());
        assert!(EmulatorConfig::instant().validate().is_ok());
        assert!(EmulatorConfig::slow().validate().is_ok());
        assert!(EmulatorConfig::unreliable().validate().is_ok());
    }

    #[test]
    fn instant_preset_zeroes_delays() {
        let config = EmulatorConfig::instant();
        assert_eq!(config.timing.connection, Duration::ZERO);
        assert_eq!(config.timing.read, Duration::ZERO);
        assert!(config.timing.scan_interval > Duration::ZERO);
    }

    #[test]
    fn slow_preset_enables_backpressure_and_small_mtu() {
        let config = EmulatorConfig::slow();
        assert!(config.backpressure.simulate_backpressure);
        assert_eq!(config.mtu.default_mtu, MIN_MTU);
    }

    #[test]
    fn unreliable_preset_has_positive_rates() {
        let config = EmulatorConfig::unreliable();
        assert!(config.faults.connection_failure_rate > 0.0);
        assert!(config.faults.read_write_error_rate > 0.0);
    }

    #[test]
    fn out_of_range_rates_are_rejected() {
        let config = EmulatorConfig::default().with_faults(FaultConfig {
            simulate_connection_failure: true,
            connection_failure_rate: 1.5,
            ..FaultConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn mtu_below_att_minimum_is_rejected() {
        let config = EmulatorConfig::default().with_mtu(MtuConfig {
            default_mtu: 20,
            maximum_mtu: 512,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn rssi_samples_stay_in_range() {
        let rssi = RssiConfig {
            range: (-80, -50),
            variation: 10,
        };
        for _ in 0..200 {
            let value = rssi.sample();
            assert!((-80..=-50).contains(&value), "sample {value} escaped range");
        }
    }
}
