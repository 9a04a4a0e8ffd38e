//! Scanning and discovery-matcher behavior

mod test_utils;

use std::time::Duration;

use blemu_core::{
    AdvertisementData, AttributePermission, BleUuid, CharacteristicProperty, EmulatorConfig,
    EmulatorBus, ManagerOptions, PeripheralManager, ScanOptions,
};
use test_utils::{
    advertising_peripheral, heart_rate_advertisement, instant_bus, powered_central, Recorded,
    Recorder, HEART_RATE_SERVICE,
};

fn read_only() -> (Vec<CharacteristicProperty>, Vec<AttributePermission>) {
    (
        vec![CharacteristicProperty::Read],
        vec![AttributePermission::Readable],
    )
}

#[tokio::test]
async fn discovery_delivers_advertisement_verbatim() {
    let bus = instant_bus().await;
    let (props, perms) = read_only();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;

    central
        .scan_for_peripherals(Some(vec![BleUuid::from(HEART_RATE_SERVICE)]), Default::default())
        .unwrap();
    let event = recorder
        .wait_for(|e| matches!(e, Recorded::Discovered { .. }))
        .await;

    let Recorded::Discovered {
        peripheral: id,
        advertisement,
        rssi,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(id, peripheral.identifier());
    assert_eq!(advertisement.local_name(), Some("HR"));
    assert!(advertisement
        .service_uuids()
        .contains(&BleUuid::from(HEART_RATE_SERVICE)));
    assert!((-90..=-40).contains(&rssi));

    // The proxy picked the advertised name up.
    let proxy = central
        .retrieve_peripherals(&[peripheral.identifier()])
        .pop()
        .unwrap();
    assert_eq!(proxy.name().as_deref(), Some("HR"));
    assert_eq!(proxy.identifier(), peripheral.identifier());
}

#[tokio::test]
async fn service_filter_never_delivers_disjoint_peripherals() {
    let bus = instant_bus().await;
    let recorder = Recorder::new();
    let peripheral =
        PeripheralManager::new(&bus, &recorder, None, ManagerOptions::default()).await;
    recorder.wait_powered_on().await;
    peripheral.start_advertising(
        AdvertisementData::new()
            .with_local_name("Thermometer")
            .with_service_uuids(vec![BleUuid::from(0x1809_u16)]),
    );
    recorder
        .wait_for(|e| matches!(e, Recorded::AdvertisingStarted(None)))
        .await;

    let (central, central_recorder) = powered_central(&bus).await;
    central
        .scan_for_peripherals(Some(vec![BleUuid::from(HEART_RATE_SERVICE)]), Default::default())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        central_recorder.count(|e| matches!(e, Recorded::Discovered { .. })),
        0,
        "disjoint service filter must suppress discovery"
    );
}

#[tokio::test]
async fn solicited_filter_applies_when_option_present() {
    let bus = instant_bus().await;
    let recorder = Recorder::new();
    let peripheral =
        PeripheralManager::new(&bus, &recorder, None, ManagerOptions::default()).await;
    recorder.wait_powered_on().await;
    peripheral.start_advertising(
        heart_rate_advertisement()
            .with_solicited_service_uuids(vec![BleUuid::from(0xFFF0_u16)]),
    );
    recorder
        .wait_for(|e| matches!(e, Recorded::AdvertisingStarted(None)))
        .await;

    // Mismatching solicitation: nothing comes through.
    let (central, central_recorder) = powered_central(&bus).await;
    central
        .scan_for_peripherals(
            None,
            ScanOptions {
                allow_duplicates: false,
                solicited_service_uuids: Some(vec![BleUuid::from(0xEEE0_u16)]),
            },
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        central_recorder.count(|e| matches!(e, Recorded::Discovered { .. })),
        0
    );
    central.stop_scan();

    // Matching solicitation passes.
    central
        .scan_for_peripherals(
            None,
            ScanOptions {
                allow_duplicates: false,
                solicited_service_uuids: Some(vec![BleUuid::from(0xFFF0_u16)]),
            },
        )
        .unwrap();
    central_recorder
        .wait_for(|e| matches!(e, Recorded::Discovered { .. }))
        .await;
}

#[tokio::test]
async fn duplicates_are_suppressed_per_scan_session() {
    let bus = instant_bus().await;
    let (props, perms) = read_only();
    let (_peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;

    central.scan_for_peripherals(None, Default::default()).unwrap();
    recorder
        .wait_for(|e| matches!(e, Recorded::Discovered { .. }))
        .await;
    // Dozens of scan cycles pass; still exactly one delivery.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.count(|e| matches!(e, Recorded::Discovered { .. })), 1);

    // Stopping the scan clears the delivered set; a new session re-delivers.
    central.stop_scan();
    central.scan_for_peripherals(None, Default::default()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.count(|e| matches!(e, Recorded::Discovered { .. })) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("new scan session re-delivers the peripheral");
}

#[tokio::test]
async fn allow_duplicates_redelivers_every_cycle() {
    let bus = EmulatorBus::new();
    let mut config = EmulatorConfig::instant();
    config.timing.scan_interval = Duration::from_millis(10);
    bus.configure(config).await.unwrap();

    let (props, perms) = read_only();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;

    central
        .scan_for_peripherals(None, ScanOptions::allowing_duplicates())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    central.stop_scan();

    let id = peripheral.identifier();
    let discoveries =
        recorder.count(|e| matches!(e, Recorded::Discovered { peripheral: p, .. } if *p == id));
    assert!(
        discoveries >= 3,
        "expected at least 3 discoveries in 100ms at a 10ms interval, got {discoveries}"
    );
}

#[tokio::test]
async fn missing_fields_are_synthesized_on_delivery_only() {
    let bus = instant_bus().await;
    let (props, perms) = read_only();
    let (_peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    let (central, recorder) = powered_central(&bus).await;

    central.scan_for_peripherals(None, Default::default()).unwrap();
    let event = recorder
        .wait_for(|e| matches!(e, Recorded::Discovered { .. }))
        .await;
    let Recorded::Discovered { advertisement, .. } = event else {
        unreachable!()
    };
    // Original keys verbatim, synthesized keys only where absent.
    assert_eq!(advertisement.local_name(), Some("HR"));
    let tx_power = advertisement.tx_power_level().expect("synthesized tx power");
    assert!((-12..=-4).contains(&tx_power));
    assert_eq!(advertisement.is_connectable(), Some(true));
}

#[tokio::test]
async fn synthesis_respects_supplied_fields_and_configuration() {
    let bus = EmulatorBus::new();
    let mut config = EmulatorConfig::instant();
    config.advertisement.auto_generate_advertisement_fields = false;
    bus.configure(config).await.unwrap();

    let recorder = Recorder::new();
    let peripheral =
        PeripheralManager::new(&bus, &recorder, None, ManagerOptions::default()).await;
    recorder.wait_powered_on().await;
    peripheral.start_advertising(heart_rate_advertisement().with_tx_power_level(-7));
    recorder
        .wait_for(|e| matches!(e, Recorded::AdvertisingStarted(None)))
        .await;

    let (central, central_recorder) = powered_central(&bus).await;
    central.scan_for_peripherals(None, Default::default()).unwrap();
    let event = central_recorder
        .wait_for(|e| matches!(e, Recorded::Discovered { .. }))
        .await;
    let Recorded::Discovered { advertisement, .. } = event else {
        unreachable!()
    };
    assert_eq!(advertisement.tx_power_level(), Some(-7));
    assert_eq!(advertisement.is_connectable(), None);
}

#[tokio::test]
async fn scanning_requires_powered_on() {
    let bus = EmulatorBus::new();
    let mut config = EmulatorConfig::instant();
    config.timing.state_update = Duration::from_millis(200);
    bus.configure(config).await.unwrap();

    let recorder = Recorder::new();
    let central = blemu_core::CentralManager::new(
        &bus,
        &recorder,
        None,
        ManagerOptions::default(),
    )
    .await;
    assert!(central.scan_for_peripherals(None, Default::default()).is_err());
    assert!(!central.is_scanning());

    recorder.wait_powered_on().await;
    assert!(central.scan_for_peripherals(None, Default::default()).is_ok());
    assert!(central.is_scanning());
}

#[tokio::test]
async fn stopped_advertising_is_invisible_to_new_scans() {
    let bus = instant_bus().await;
    let (props, perms) = read_only();
    let (peripheral, _char, _p_rec) = advertising_peripheral(&bus, props, perms).await;
    peripheral.stop_advertising();
    // Give the bus a moment to drop the advertisement entry.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (central, recorder) = powered_central(&bus).await;
    central.scan_for_peripherals(None, Default::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(recorder.count(|e| matches!(e, Recorded::Discovered { .. })), 0);
}
