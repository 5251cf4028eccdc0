use std::sync::Arc;
use std::time::Duration;

use bluecore::btuuid::{characteristics, descriptors, services};
use bluecore::error::{AttError, AttErrorCode};
use bluecore::mock::MockBridge;
use bluecore::*;
use futures_lite::StreamExt;

const HRM: &str = "AA:BB";

fn init_tracing() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

fn setup_without_permissions(config: SessionConfig) -> (Arc<MockBridge>, CentralSession) {
    init_tracing();
    let bridge = Arc::new(MockBridge::new().with_heart_rate_monitor(HRM));
    let session = CentralSession::initialize(bridge.clone(), config).unwrap();
    (bridge, session)
}

fn setup(config: SessionConfig) -> (Arc<MockBridge>, CentralSession) {
    let (bridge, session) = setup_without_permissions(config);
    bridge.grant(PermissionKind::Scan);
    (bridge, session)
}

async fn connected(config: SessionConfig) -> (Arc<MockBridge>, CentralSession) {
    let (bridge, session) = setup(config);
    session.connect(HRM).await.unwrap();
    session.discover_services().await.unwrap();
    (bridge, session)
}

async fn next<S: futures_core::Stream + Unpin>(stream: &mut S) -> Option<S::Item> {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("stream stalled")
}

fn short_timeouts() -> SessionConfig {
    SessionConfig::default().with_all_timeouts(Duration::from_millis(50))
}

#[test]
fn initialize_requires_the_native_module() {
    init_tracing();
    let err = CentralSession::initialize(Arc::new(MockBridge::unavailable()), SessionConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BridgeUnavailable);
}

#[tokio::test]
async fn scan_permission_scenario() {
    let (bridge, session) = setup_without_permissions(SessionConfig::default());

    assert!(!session.check_scan_permission().await);
    let err = session.start_scan().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(!session.is_discovering());

    session.request_scan_permissions().await.unwrap();
    assert!(session.check_scan_permission().await);
    session.start_scan().await.unwrap();
    assert!(session.is_discovering());
    assert!(bridge.is_scanning());
}

#[tokio::test]
async fn revoked_permission_blocks_a_running_scan() {
    let (bridge, session) = setup(SessionConfig::default());
    session.start_scan().await.unwrap();

    bridge.revoke(PermissionKind::Scan);
    assert!(!session.check_scan_permission().await);
    let err = session.start_scan().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = session.start_scan_by_company_id(&[0x0001]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn granted_permission_needs_no_prompt() {
    let (bridge, session) = setup(SessionConfig::default());
    bridge.grant(PermissionKind::Advertise);

    assert!(session.check_advertise_permission().await);
    session.request_advertise_permission().await.unwrap();
    assert!(bridge.calls().is_empty());
}

#[tokio::test]
async fn declined_prompts() {
    let (bridge, session) = setup_without_permissions(SessionConfig::default());

    bridge.answer_prompts_with(PermissionStatus::Denied);
    let err = session.request_scan_permissions().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    bridge.answer_prompts_with(PermissionStatus::Unavailable);
    let err = session.request_advertise_permission().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionUnavailable);
    assert!(!session.check_scan_permission().await);
}

#[tokio::test]
async fn unanswered_prompt_times_out() {
    let (bridge, session) = setup_without_permissions(short_timeouts());
    bridge.hold_replies(true);

    let err = session.request_scan_permissions().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionUnavailable);

    // the prompt finally closes, but nobody is waiting for it
    let id = bridge.wait_held("request_permission").await;
    assert!(!bridge.release(id));
}

#[tokio::test]
async fn scan_filters_are_compared() {
    let (bridge, session) = setup(SessionConfig::default());

    session.start_scan_by_company_id(&[0x0059, 0x004c]).await.unwrap();
    session.start_scan_by_company_id(&[0x004c, 0x0059]).await.unwrap();
    let err = session.start_scan().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScanAlreadyActive);
    assert!(session.is_discovering());

    session.stop_scan().await.unwrap();
    session.stop_scan().await.unwrap();
    assert!(!session.is_discovering());
    assert!(!bridge.is_scanning());

    let starts = bridge
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::StartScan { .. }))
        .count();
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn failed_stop_still_goes_idle() {
    let (bridge, session) = setup(SessionConfig::default());
    session.start_scan().await.unwrap();

    bridge.fail_next("stop_scan", CallFailure::Rejected("scanner busy".into()));
    session.stop_scan().await.unwrap();
    assert!(!session.is_discovering());
}

#[tokio::test]
async fn scan_without_adapter() {
    let (bridge, session) = setup(SessionConfig::default());
    bridge.fail_next("start_scan", CallFailure::AdapterUnavailable);

    let err = session.start_scan().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterUnavailable);
    assert!(!session.is_discovering());

    session.start_scan().await.unwrap();
}

#[tokio::test]
async fn advertisements_are_filtered_by_company() {
    let (bridge, session) = setup(SessionConfig::default());
    let mut advertisements = session.advertisements().unwrap();

    bridge.advertise("00:00", 0x0059, vec![0]);
    session.start_scan_by_company_id(&[0x0059]).await.unwrap();
    bridge.advertise("11:11", 0x004c, vec![1]);
    bridge.advertise("22:22", 0x0059, vec![2]);

    let device = next(&mut advertisements).await.unwrap();
    assert_eq!(device.id, PeripheralId::new("22:22"));
    assert_eq!(device.adv_data.manufacturer_data[0].data, vec![2]);
}

#[tokio::test]
async fn heart_rate_scenario() {
    init_tracing();
    let bridge = Arc::new(MockBridge::new());
    bridge.add_peripheral(
        HRM,
        vec![ServiceEntry::new(services::HEART_RATE).with_characteristic(characteristics::HEART_RATE_MEASUREMENT, [])],
    );
    bridge.set_value(services::HEART_RATE, characteristics::HEART_RATE_MEASUREMENT, None, vec![0x00, 0x48]);
    bridge.grant(PermissionKind::Scan);
    let session = CentralSession::initialize(bridge.clone(), SessionConfig::default()).unwrap();

    session.connect(HRM).await.unwrap();
    let services = session.discover_services().await.unwrap();
    assert_eq!(
        services,
        GattServices {
            service_ids: vec!["180D".into()],
            characteristics: vec!["2A37".into()],
            descriptors: vec![],
        }
    );

    let value = session.read_characteristic("180D", "2A37").await.unwrap();
    assert_eq!(value.uuid, "2A37");
    assert_eq!(value.data, "0048");
    assert_eq!(value.payload, GattPayload::Characteristic { descriptors: vec![] });
}

#[tokio::test]
async fn discovery_is_repeatable() {
    let (_bridge, session) = connected(SessionConfig::default()).await;

    let first = session.discover_services().await.unwrap();
    let second = session.discover_services().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.service_ids, ["180D", "180F"]);
    assert_eq!(first.characteristics, ["2A37", "2A38", "2A39", "2A19"]);
    assert_eq!(first.descriptors, ["2902", "2901"]);
    assert_eq!(session.services().len(), 2);
}

#[tokio::test]
async fn discovery_failure() {
    let (bridge, session) = setup(SessionConfig::default());
    session.connect(HRM).await.unwrap();

    bridge.fail_next("discover_services", CallFailure::Rejected("gatt error 133".into()));
    let err = session.discover_services().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DiscoveryFailed(FailureReason::Rejected));
    assert!(session.services().is_empty());
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let (bridge, session) = connected(SessionConfig::default()).await;

    session.write_characteristic("180D", "2A39", "0aff").await.unwrap();
    let value = session.read_characteristic("180D", "2A39").await.unwrap();
    assert_eq!(value.data, "0aff");
    assert_eq!(value.bytes().unwrap(), vec![0x0a, 0xff]);

    // upper-case input reads back canonical
    session.write_characteristic("180d", "2a39", "BEEF").await.unwrap();
    assert_eq!(session.read_characteristic("180D", "2A39").await.unwrap().data, "beef");

    session.write_descriptor("180D", "2A37", "2902", "0100").await.unwrap();
    assert_eq!(
        bridge.value(
            services::HEART_RATE,
            characteristics::HEART_RATE_MEASUREMENT,
            Some(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)
        ),
        Some(vec![0x01, 0x00])
    );
}

#[tokio::test]
async fn descriptor_values() {
    let (_bridge, session) = connected(SessionConfig::default()).await;

    let value = session.read_descriptor("180F", "2A19", "2901").await.unwrap();
    assert_eq!(value.uuid, "2901");
    assert_eq!(value.bytes().unwrap(), b"battery");
    assert!(value.is_descriptor());

    let value = session.read_characteristic("180F", "2A19").await.unwrap();
    assert_eq!(value.data, "64");
    assert_eq!(
        value.payload,
        GattPayload::Characteristic {
            descriptors: vec!["2901".into()]
        }
    );
}

#[tokio::test]
async fn gatt_requires_connection_and_discovery() {
    let (bridge, session) = setup(SessionConfig::default());

    let err = session.read_characteristic("180F", "2A19").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = session.discover_services().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    // the connection is checked before the arguments
    let err = session.write_characteristic("180D", "2A39", "zz").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = session.read_characteristic("bogus", "2A39").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = session.write_descriptor("180D", "2A37", "+902", "0100").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = session.notify_characteristic("180D", "").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    session.connect(HRM).await.unwrap();
    let err = session.read_characteristic("180F", "2A19").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    session.discover_services().await.unwrap();
    let err = session.read_descriptor("180F", "2A19", "2902").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = session.write_characteristic("180F", "2A19", "zz").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    let err = session.read_characteristic("not-a-uuid", "2A19").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    assert!(!bridge
        .calls()
        .iter()
        .any(|call| matches!(call, Call::ReadCharacteristic { .. } | Call::WriteCharacteristic { .. })));
}

#[tokio::test]
async fn protocol_errors_are_reported() {
    let (bridge, session) = connected(SessionConfig::default()).await;

    bridge.fail_next("read_characteristic", CallFailure::Att(AttError::from(0x02)));
    let err = session.read_characteristic("180F", "2A19").await.unwrap_err();
    assert_eq!(
        err.kind(),
        ErrorKind::ReadFailed(FailureReason::Protocol(AttError::Known(AttErrorCode::ReadNotPermitted)))
    );

    bridge.fail_next("write_characteristic", CallFailure::from_gatt_status(3).unwrap());
    let err = session.write_characteristic("180D", "2A39", "01").await.unwrap_err();
    assert_eq!(
        err.reason(),
        Some(FailureReason::Protocol(AttError::Known(AttErrorCode::WriteNotPermitted)))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_connect_is_busy() {
    let (bridge, session) = setup(SessionConfig::default());
    bridge.add_peripheral("CC:DD", vec![]);
    bridge.hold_replies(true);

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.connect(HRM).await }
    });
    let id = bridge.wait_held("connect").await;
    assert_eq!(session.connection_state(), ConnectionState::Connecting);

    let err = session.connect("CC:DD").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionBusy);
    assert_eq!(session.connection_state(), ConnectionState::Connecting);

    assert!(bridge.release(id));
    first.await.unwrap().unwrap();
    assert_eq!(session.connection_state(), ConnectionState::Connected);
    assert_eq!(session.connected_peripheral(), Some(PeripheralId::new(HRM)));

    let err = session.connect("CC:DD").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionBusy);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_while_disconnecting_is_busy() {
    let (bridge, session) = setup(SessionConfig::default());
    session.connect(HRM).await.unwrap();
    bridge.hold_replies(true);

    let teardown = tokio::spawn({
        let session = session.clone();
        async move { session.disconnect().await }
    });
    let id = bridge.wait_held("disconnect").await;
    assert_eq!(session.connection_state(), ConnectionState::Disconnecting);

    let err = session.connect(HRM).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionBusy);
    assert_eq!(session.connection_state(), ConnectionState::Disconnecting);
    assert!(!bridge.calls().iter().skip(1).any(|call| matches!(call, Call::Connect { .. })));

    assert!(bridge.release(id));
    teardown.await.unwrap().unwrap();
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_cancels_a_pending_connect() {
    let (bridge, session) = setup(SessionConfig::default());
    bridge.hold_replies(true);

    let attempt = tokio::spawn({
        let session = session.clone();
        async move { session.connect(HRM).await }
    });
    let id = bridge.wait_held("connect").await;

    bridge.hold_replies(false);
    session.disconnect().await.unwrap();
    let err = attempt.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed(FailureReason::Cancelled));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    // the platform answers the cancelled attempt too late
    assert!(!bridge.release(id));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_timeout_rolls_back() {
    let (bridge, session) = setup(short_timeouts());
    bridge.hold_replies(true);

    let err = session.connect(HRM).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed(FailureReason::Timeout));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(bridge.calls().last(), Some(&Call::Disconnect));
}

#[tokio::test]
async fn dropped_connect_rolls_back() {
    let (bridge, session) = setup(SessionConfig::default());
    bridge.hold_replies(true);

    let attempt = tokio::time::timeout(Duration::from_millis(20), session.connect(HRM)).await;
    assert!(attempt.is_err());
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(bridge.calls().last(), Some(&Call::Disconnect));
}

#[tokio::test]
async fn connect_requires_scan_permission() {
    let (bridge, session) = setup_without_permissions(SessionConfig::default());

    assert!(!session.check_scan_permission().await);
    let err = session.connect(HRM).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(bridge.calls().is_empty());

    session.request_scan_permissions().await.unwrap();
    session.connect(HRM).await.unwrap();
}

#[tokio::test]
async fn rejected_connect() {
    let (_bridge, session) = setup(SessionConfig::default());

    let err = session.connect("EE:FF").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed(FailureReason::Rejected));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    let err = session.connect("").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    session.connect(HRM).await.unwrap();
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (bridge, session) = setup(SessionConfig::default());
    session.disconnect().await.unwrap();
    assert!(bridge.calls().is_empty());

    session.connect(HRM).await.unwrap();
    bridge.fail_next("disconnect", CallFailure::Rejected("already gone".into()));
    session.disconnect().await.unwrap();
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn connected_and_disconnected_alternate() {
    let (bridge, session) = setup(SessionConfig::default());
    let mut events = session.connection_events().unwrap();

    session.connect(HRM).await.unwrap();
    session.disconnect().await.unwrap();
    let _ = session.connect("EE:FF").await;
    session.connect(HRM).await.unwrap();
    let _ = session.connect(HRM).await;
    bridge.drop_link();
    session.disconnect().await.unwrap();

    let id = PeripheralId::new(HRM);
    assert_eq!(next(&mut events).await, Some(ConnectionEvent::Connected(id.clone())));
    assert_eq!(
        next(&mut events).await,
        Some(ConnectionEvent::Disconnected {
            id: id.clone(),
            cause: DisconnectCause::Requested
        })
    );
    assert_eq!(next(&mut events).await, Some(ConnectionEvent::Connected(id.clone())));
    assert_eq!(
        next(&mut events).await,
        Some(ConnectionEvent::Disconnected {
            id,
            cause: DisconnectCause::LinkLost
        })
    );
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn link_loss_flushes_queued_requests() {
    let (bridge, session) = connected(SessionConfig::default()).await;
    bridge.hold_replies(true);

    let reads: Vec<_> = (0..3)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.read_characteristic("180F", "2A19").await })
        })
        .collect();
    let in_flight = bridge.wait_held("read_characteristic").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bridge.held().len(), 1);

    bridge.drop_link();
    for read in reads {
        let err = read.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionInvalidated);
    }
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(!bridge.release(in_flight));

    let err = session.read_characteristic("180F", "2A19").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_flushes_queued_requests() {
    let (bridge, session) = connected(SessionConfig::default()).await;
    bridge.hold_replies(true);

    let writes: Vec<_> = (0..2)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.write_characteristic("180D", "2A39", &format!("0{i}")).await })
        })
        .collect();
    bridge.wait_held("write_characteristic").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    bridge.hold_replies(false);
    session.disconnect().await.unwrap();
    for write in writes {
        let err = write.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionInvalidated);
    }

    // a fresh connection starts with an empty queue and no discovered tree
    session.connect(HRM).await.unwrap();
    assert!(session.services().is_empty());
    session.discover_services().await.unwrap();
    session.write_characteristic("180D", "2A39", "02").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_writes_go_out_one_at_a_time_in_order() {
    let (bridge, session) = connected(SessionConfig::default()).await;
    bridge.hold_replies(true);

    // polling each write once puts it in the queue before the next one is submitted
    let mut writes = Vec::new();
    for i in 0..4u8 {
        let session = session.clone();
        let mut write = Box::pin(async move {
            session
                .write_characteristic("180D", "2A39", &format!("{i:02x}"))
                .await
        });
        assert!(futures_lite::future::poll_once(&mut write).await.is_none());
        writes.push(tokio::spawn(write));
    }

    let mut sent = Vec::new();
    for _ in 0..4 {
        let id = bridge.wait_held("write_characteristic").await;
        let held = bridge.held();
        assert_eq!(held.len(), 1);
        match &held[0].1 {
            Call::WriteCharacteristic { value, .. } => sent.push(value[0]),
            call => panic!("unexpected call {call:?}"),
        }
        assert!(bridge.release(id));
    }
    assert_eq!(sent, [0, 1, 2, 3]);

    for write in writes {
        write.await.unwrap().unwrap();
    }
    assert_eq!(
        bridge.value(services::HEART_RATE, characteristics::HEART_RATE_CONTROL_POINT, None),
        Some(vec![3])
    );
}

#[tokio::test]
async fn late_reply_after_timeout_is_dropped() {
    let config = SessionConfig::default().with_gatt_timeout(Duration::from_millis(50));
    let (bridge, session) = connected(config).await;
    bridge.hold_replies(true);

    let err = session.read_characteristic("180F", "2A19").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadFailed(FailureReason::Timeout));
    let id = bridge.wait_held("read_characteristic").await;
    assert!(!bridge.release(id));

    bridge.hold_replies(false);
    assert_eq!(session.read_characteristic("180F", "2A19").await.unwrap().data, "64");
}

#[tokio::test]
async fn notifications() {
    let (bridge, session) = connected(SessionConfig::default()).await;

    let mut stream = session.notify_characteristic("180D", "2A37").await.unwrap();
    assert_eq!(
        bridge.value(
            services::HEART_RATE,
            characteristics::HEART_RATE_MEASUREMENT,
            Some(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)
        ),
        Some(vec![0x01, 0x00])
    );

    bridge.notify(services::HEART_RATE, characteristics::HEART_RATE_MEASUREMENT, vec![0x06, 0x48]);
    let value = next(&mut stream).await.unwrap();
    assert_eq!(value.uuid, "2A37");
    assert_eq!(value.data, "0648");
    assert_eq!(
        value.payload,
        GattPayload::Characteristic {
            descriptors: vec!["2902".into()]
        }
    );

    // a second subscriber shares the enabled notifications
    let second = session.notify_characteristic("180D", "2A37").await.unwrap();
    let enables = |bridge: &MockBridge| {
        bridge
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::SetNotify { enable: true, .. }))
            .count()
    };
    assert_eq!(enables(&bridge), 1);

    drop(stream);
    drop(second);
    session.read_characteristic("180F", "2A19").await.unwrap();
    let calls = bridge.calls();
    assert_eq!(
        calls[calls.len() - 2],
        Call::SetNotify {
            service: services::HEART_RATE,
            characteristic: characteristics::HEART_RATE_MEASUREMENT,
            enable: false,
        }
    );

    let mut stream = session.notify_characteristic("180D", "2A37").await.unwrap();
    assert_eq!(enables(&bridge), 2);
    bridge.drop_link();
    assert_eq!(next(&mut stream).await, None);
}

#[tokio::test]
async fn adapter_off_stops_everything() {
    let (bridge, session) = connected(SessionConfig::default()).await;
    session.start_scan().await.unwrap();

    bridge.adapter_off();
    assert!(!session.is_discovering());
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    let err = session.read_characteristic("180F", "2A19").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_detaches() {
    let (bridge, session) = setup(SessionConfig::default());
    let mut events = session.connection_events().unwrap();
    bridge.hold_replies(true);

    let attempt = tokio::spawn({
        let session = session.clone();
        async move { session.connect(HRM).await }
    });
    bridge.wait_held("connect").await;

    session.shutdown();
    let err = attempt.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BridgeUnavailable);
    assert!(!bridge.is_attached());
    assert_eq!(next(&mut events).await, None);

    assert!(!session.check_scan_permission().await);
    let err = session.start_scan().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BridgeUnavailable);
    let err = session.connect(HRM).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BridgeUnavailable);
    let err = session.read_characteristic("180F", "2A19").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BridgeUnavailable);
}
