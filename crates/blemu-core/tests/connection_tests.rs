//! Connection establishment, teardown, pairing, and auxiliary events

mod test_utils;

use std::time::Duration;

use blemu_core::{
    AncsAuthorization, AttributePermission, CharacteristicProperty, ConnectionError,
    ConnectionEvent, EmulatorBus, EmulatorConfig, EmulatorError, FaultConfig, ManagerOptions,
    PeerState, SecurityConfig, WriteType,
};
use test_utils::{
    advertising_peripheral, discover, discover_and_connect, instant_bus, powered_central,
    Recorded, Recorder, HEART_RATE_MEASUREMENT,
};

fn notify_props() -> (Vec<CharacteristicProperty>, Vec<AttributePermission>) {
    (
        vec![CharacteristicProperty::Read, CharacteristicProperty::Notify],
        vec![AttributePermission::Readable],
    )
}

#[tokio::test]
async fn connect_installs_mtu_and_reports_connected() {
    let bus = instant_bus().await;
    let (props, perms) = notify_props();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;

    let proxy = discover_and_connect(&central, &recorder, peripheral.identifier()).await;
    assert_eq!(proxy.state(), PeerState::Connected);
    assert!(bus.is_connected(central.identifier(), peripheral.identifier()).await);
    // Default MTU of 185 leaves 182 bytes of write payload.
    assert_eq!(proxy.maximum_write_value_length(WriteType::WithResponse), 182);
}

#[tokio::test]
async fn disconnect_unsubscribes_bidirectionally() {
    let bus = instant_bus().await;
    let (props, perms) = notify_props();
    let (peripheral, characteristic, peripheral_recorder) =
        advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;
    let proxy = discover_and_connect(&central, &recorder, peripheral.identifier()).await;

    proxy.discover_services(None);
    recorder
        .wait_for(|e| matches!(e, Recorded::ServicesDiscovered(None)))
        .await;
    let service = proxy.services().pop().unwrap();
    proxy.discover_characteristics(&service, None);
    recorder
        .wait_for(|e| matches!(e, Recorded::CharacteristicsDiscovered { error: None, .. }))
        .await;
    let cached = service.characteristic(HEART_RATE_MEASUREMENT.into()).unwrap();

    proxy.set_notify_value(&cached, true);
    peripheral_recorder
        .wait_for(|e| matches!(e, Recorded::Subscribed { .. }))
        .await;
    assert!(characteristic.is_notifying());

    central.cancel_peripheral_connection(&proxy);
    peripheral_recorder
        .wait_for(|e| matches!(e, Recorded::Unsubscribed { .. }))
        .await;
    recorder
        .wait_for(|e| matches!(e, Recorded::Disconnected { error: None, .. }))
        .await;

    assert!(!characteristic.is_notifying());
    assert!(characteristic.subscribers().is_empty());
    assert!(!bus.is_connected(central.identifier(), peripheral.identifier()).await);
}

#[tokio::test]
async fn connection_events_fire_for_registered_centrals() {
    let bus = instant_bus().await;
    let (props, perms) = notify_props();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;
    central.register_for_connection_events(None);

    let proxy = discover_and_connect(&central, &recorder, peripheral.identifier()).await;
    recorder
        .wait_for(|e| {
            matches!(e, Recorded::ConnectionEvent(ConnectionEvent::PeerConnected, _))
        })
        .await;

    central.cancel_peripheral_connection(&proxy);
    recorder
        .wait_for(|e| {
            matches!(e, Recorded::ConnectionEvent(ConnectionEvent::PeerDisconnected, _))
        })
        .await;
}

#[tokio::test]
async fn unregistered_centrals_get_no_connection_events() {
    let bus = instant_bus().await;
    let (props, perms) = notify_props();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;

    let _proxy = discover_and_connect(&central, &recorder, peripheral.identifier()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(|e| matches!(e, Recorded::ConnectionEvent(..))), 0);
}

#[tokio::test]
async fn injected_connection_failure_surfaces_as_did_fail_to_connect() {
    let bus = instant_bus().await;
    let mut config = EmulatorConfig::instant();
    config.faults = FaultConfig {
        simulate_connection_failure: true,
        connection_failure_rate: 1.0,
        ..FaultConfig::default()
    };
    bus.configure(config).await.unwrap();

    let (props, perms) = notify_props();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;
    let proxy = discover(&central, &recorder, peripheral.identifier()).await;

    central.connect(&proxy);
    let event = recorder
        .wait_for(|e| matches!(e, Recorded::FailedToConnect(..)))
        .await;
    let Recorded::FailedToConnect(_, error) = event else {
        unreachable!()
    };
    assert_eq!(
        error,
        EmulatorError::Connection(ConnectionError::ConnectionFailed)
    );
    assert_eq!(proxy.state(), PeerState::Disconnected);
}

#[tokio::test]
async fn operations_without_a_connection_fail_with_not_connected() {
    let bus = instant_bus().await;
    let (props, perms) = notify_props();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;
    let proxy = discover(&central, &recorder, peripheral.identifier()).await;

    // Never connected: a read must surface NotConnected on the delegate
    // without tearing anything down.
    let detached = blemu_core::Characteristic::readable(HEART_RATE_MEASUREMENT, vec![]);
    proxy.read_value(&detached);
    let event = recorder
        .wait_for(|e| matches!(e, Recorded::ValueUpdated { error: Some(_), .. }))
        .await;
    let Recorded::ValueUpdated { error: Some(error), .. } = event else {
        unreachable!()
    };
    assert!(error.is_not_connected());
}

#[tokio::test]
async fn dropping_the_peripheral_forces_a_disconnect() {
    let bus = instant_bus().await;
    let (props, perms) = notify_props();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;
    let peripheral_id = peripheral.identifier();
    let _proxy = discover_and_connect(&central, &recorder, peripheral_id).await;

    drop(peripheral);
    let event = recorder
        .wait_for(|e| matches!(e, Recorded::Disconnected { error: Some(_), .. }))
        .await;
    let Recorded::Disconnected { peripheral: id, error } = event else {
        unreachable!()
    };
    assert_eq!(id, peripheral_id);
    assert_eq!(
        error,
        Some(EmulatorError::Connection(ConnectionError::PeripheralDisconnected))
    );
}

#[tokio::test]
async fn failed_pairing_blocks_encrypted_reads() {
    let bus = instant_bus().await;
    let mut config = EmulatorConfig::instant();
    config.security = SecurityConfig {
        require_pairing: true,
        simulate_pairing: true,
        pairing_succeeds: false,
    };
    bus.configure(config).await.unwrap();

    let (peripheral, _char, _p_rec) = advertising_peripheral(
        &bus,
        vec![CharacteristicProperty::Read],
        vec![AttributePermission::ReadEncryptionRequired],
    )
    .await;
    let (central, recorder) = powered_central(&bus).await;
    let proxy = discover_and_connect(&central, &recorder, peripheral.identifier()).await;

    proxy.discover_services(None);
    recorder
        .wait_for(|e| matches!(e, Recorded::ServicesDiscovered(None)))
        .await;
    let service = proxy.services().pop().unwrap();
    proxy.discover_characteristics(&service, None);
    recorder
        .wait_for(|e| matches!(e, Recorded::CharacteristicsDiscovered { error: None, .. }))
        .await;
    let cached = service.characteristic(HEART_RATE_MEASUREMENT.into()).unwrap();

    proxy.read_value(&cached);
    let event = recorder
        .wait_for(|e| matches!(e, Recorded::ValueUpdated { error: Some(_), .. }))
        .await;
    let Recorded::ValueUpdated { error: Some(error), .. } = event else {
        unreachable!()
    };
    assert_eq!(
        error,
        EmulatorError::Att(blemu_core::AttError::InsufficientAuthentication)
    );
}

#[tokio::test]
async fn successful_pairing_unlocks_encrypted_reads() {
    let bus = instant_bus().await;
    let mut config = EmulatorConfig::instant();
    config.security = SecurityConfig {
        require_pairing: true,
        simulate_pairing: true,
        pairing_succeeds: true,
    };
    bus.configure(config).await.unwrap();

    let (peripheral, _char, _p_rec) = advertising_peripheral(
        &bus,
        vec![CharacteristicProperty::Read],
        vec![AttributePermission::ReadEncryptionRequired],
    )
    .await;
    let (central, recorder) = powered_central(&bus).await;
    let proxy = discover_and_connect(&central, &recorder, peripheral.identifier()).await;

    proxy.discover_services(None);
    recorder
        .wait_for(|e| matches!(e, Recorded::ServicesDiscovered(None)))
        .await;
    let service = proxy.services().pop().unwrap();
    proxy.discover_characteristics(&service, None);
    recorder
        .wait_for(|e| matches!(e, Recorded::CharacteristicsDiscovered { error: None, .. }))
        .await;
    let cached = service.characteristic(HEART_RATE_MEASUREMENT.into()).unwrap();

    proxy.read_value(&cached);
    let event = recorder
        .wait_for(|e| matches!(e, Recorded::ValueUpdated { .. }))
        .await;
    assert!(matches!(
        event,
        Recorded::ValueUpdated { error: None, value: Some(_), .. }
    ));
}

#[tokio::test]
async fn ancs_updates_reach_both_sides() {
    let bus = instant_bus().await;
    let (props, perms) = notify_props();
    let (peripheral, _char, peripheral_recorder) =
        advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;
    let _proxy = discover_and_connect(&central, &recorder, peripheral.identifier()).await;

    bus.update_ancs_authorization(central.identifier(), AncsAuthorization::Authorized)
        .await;

    peripheral_recorder
        .wait_for(|e| {
            matches!(
                e,
                Recorded::AncsAuthorization {
                    authorization: AncsAuthorization::Authorized,
                    ..
                }
            )
        })
        .await;
    recorder
        .wait_for(|e| matches!(e, Recorded::AncsChangedFor(_)))
        .await;
    assert_eq!(
        bus.get_ancs_authorization(central.identifier()).await,
        AncsAuthorization::Authorized
    );
}

#[tokio::test]
async fn reset_clears_registries_and_state() {
    let bus = instant_bus().await;
    let (props, perms) = notify_props();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;
    let _proxy = discover_and_connect(&central, &recorder, peripheral.identifier()).await;

    assert!(!bus.get_all_centrals().await.is_empty());
    bus.reset().await;
    assert!(bus.get_all_centrals().await.is_empty());
    assert!(bus.get_all_peripherals().await.is_empty());
    assert!(!bus.is_connected(central.identifier(), peripheral.identifier()).await);
}

#[tokio::test]
async fn forced_manager_state_override_applies() {
    let bus = EmulatorBus::new();
    let mut config = EmulatorConfig::instant();
    config.forced_manager_state = Some(blemu_core::ManagerState::Unauthorized);
    bus.configure(config).await.unwrap();

    let recorder = Recorder::new();
    let central =
        blemu_core::CentralManager::new(&bus, &recorder, None, ManagerOptions::default()).await;
    recorder
        .wait_for(|e| {
            matches!(
                e,
                Recorded::StateUpdate(blemu_core::ManagerState::Unauthorized)
            )
        })
        .await;
    assert_eq!(central.state(), blemu_core::ManagerState::Unauthorized);
    assert!(central.scan_for_peripherals(None, Default::default()).is_err());
}
