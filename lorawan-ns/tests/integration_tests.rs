use std::time::Duration;

use lorawan_ns::{
    config::{DevAddr, DeviceRegistry, NetworkConfig},
    device::{JoinStatus, MemorySessionStore, SessionStore},
    join::{self, JoinError},
    lorawan::{
        commands::{decode_downlink, DownlinkCommand, UplinkCommand},
        mac::{FCtrl, Frame, MType},
        DataRate,
    },
    scheduler::RxWindow,
    server::{DeviceId, NetworkServer, Outcome, ServerError, UplinkEvent, UplinkMeta},
};

use mock::{init_tracing, meta, push_data, MockDevice};

const APP_KEY: [u8; 16] = [
    0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F, 0x3C,
];

fn create_test_device() -> MockDevice {
    MockDevice::new(
        [0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
        [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
        APP_KEY,
    )
}

fn create_server(devices: &[&MockDevice]) -> NetworkServer<MemorySessionStore> {
    init_tracing();
    let registry: DeviceRegistry = devices.iter().map(|d| d.config()).collect();
    NetworkServer::new(NetworkConfig::default(), registry, MemorySessionStore::new()).unwrap()
}

fn uplink(server: &NetworkServer<MemorySessionStore>, phy: &[u8]) -> Result<Outcome, ServerError> {
    server.handle_uplink(phy, &meta(1_000_000, Duration::ZERO))
}

fn join(server: &NetworkServer<MemorySessionStore>, device: &mut MockDevice) -> Outcome {
    let outcome = uplink(server, &device.join_request()).unwrap();
    let session = server.store().get_session(&device.dev_eui).unwrap();
    device.adopt(&session);
    outcome
}

#[test]
fn test_join_uplink_downlink() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);

    // Join-Request through a PUSH_DATA envelope
    let body = push_data(&device.join_request(), &[(5_000_000, 7.0)]);
    let mut outcomes = server.handle_push_data(&body).unwrap();
    assert_eq!(outcomes.len(), 1);
    let outcome = outcomes.remove(0).unwrap();

    let UplinkEvent::Joined { dev_eui, dev_addr } = outcome.event else {
        panic!("expected a join, got {:?}", outcome.event);
    };
    assert_eq!(dev_eui, device.dev_eui);
    assert_eq!(dev_addr.nwk_id(), 0x12);

    let accept = outcome.downlink.unwrap();
    assert_eq!(accept.phy_payload.len(), 1 + 28 + 4);
    assert_eq!(accept.window.chosen, RxWindow::Rx1);
    assert_eq!(accept.txpk.tmst, 10_000_000);
    assert_eq!(accept.txpk.datr, "SF7BW125");
    assert_eq!(accept.txpk.freq, 868.1);
    assert!(accept.txpk.ipol);
    let frame = Frame::decode(&accept.phy_payload).unwrap();
    assert_eq!(frame.mhdr.mtype, MType::JoinAccept);
    join::verify_join_accept(&device.app_key, &frame).unwrap();

    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert_eq!(session.join_status, JoinStatus::Accepted);
    assert_eq!(session.dev_addr, Some(dev_addr));
    device.adopt(&session);

    // Confirmed uplink asking for a link check
    let phy = device.uplink(true, FCtrl::default(), &[0x02], Some(1), b"hello");
    let outcome = uplink(&server, &phy).unwrap();
    let UplinkEvent::Data(data) = &outcome.event else {
        panic!("expected data, got {:?}", outcome.event);
    };
    assert_eq!(data.payload, b"hello");
    assert_eq!(data.f_port, Some(1));
    assert_eq!(data.f_cnt, 1);
    assert!(data.confirmed);

    let downlink = outcome.downlink.unwrap();
    assert_eq!(downlink.window.chosen, RxWindow::Rx1);
    assert_eq!(downlink.txpk.tmst, 2_000_000);
    let (frame, plaintext) = device.open_downlink(&downlink.phy_payload);
    let data = frame.data().unwrap();
    assert!(data.fhdr.f_ctrl.ack);
    assert_eq!(data.fhdr.f_cnt, 0);
    assert!(plaintext.is_empty());
    let commands: Vec<_> = decode_downlink(&data.fhdr.f_opts)
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(
        commands,
        vec![DownlinkCommand::LinkCheckAns {
            margin: 13,
            gateway_count: 1
        }]
    );

    let json = downlink.pull_resp().to_json().unwrap();
    assert!(json.starts_with(r#"{"txpk":{"#));

    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert_eq!(session.fcnt_up, 1);
    assert_eq!(session.fcnt_down, 1);
}

#[test]
fn test_unconfirmed_uplink_needs_no_downlink() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);

    let outcome = uplink(&server, &device.send(2, b"\x01\x02")).unwrap();
    assert!(outcome.downlink.is_none());

    let adr_ack_req = FCtrl {
        adr: true,
        adr_ack_req: true,
        ..FCtrl::default()
    };
    let outcome = uplink(&server, &device.uplink(false, adr_ack_req, &[], None, &[])).unwrap();
    assert!(outcome.downlink.is_some());
}

#[test]
fn test_replayed_fcnt_is_rejected() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);

    let _ = uplink(&server, &device.send(1, b"a")).unwrap();
    let second = device.send(1, b"b");
    let _ = uplink(&server, &second).unwrap();

    let err = uplink(&server, &second).unwrap_err();
    assert!(matches!(
        err,
        ServerError::ReplayedFCnt {
            received: 2,
            last: 2,
            ..
        }
    ));
    assert!(err.is_security_event());

    device.f_cnt_up = 1;
    assert!(matches!(
        uplink(&server, &device.send(1, b"c")),
        Err(ServerError::ReplayedFCnt { .. })
    ));
    assert_eq!(server.store().get_session(&device.dev_eui).unwrap().fcnt_up, 2);
}

#[test]
fn test_fcnt_zero_after_join_is_rejected() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);
    assert_eq!(server.store().get_session(&device.dev_eui).unwrap().fcnt_up, 0);

    device.f_cnt_up = 0;
    let err = uplink(&server, &device.send(1, b"zero")).unwrap_err();
    assert!(matches!(
        err,
        ServerError::ReplayedFCnt {
            received: 0,
            last: 0,
            ..
        }
    ));

    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert_eq!(session.fcnt_up, 0);
    assert!(uplink(&server, &device.send(1, b"one")).is_ok());
}

#[test]
fn test_bad_mic_does_not_touch_session() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);

    let mut phy = device.send(1, b"payload");
    let last = phy.len() - 1;
    phy[last] ^= 0x01;
    let err = uplink(&server, &phy).unwrap_err();
    assert!(err.is_security_event());

    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert_eq!(session.fcnt_up, 0);
}

#[test]
fn test_replayed_dev_nonce_is_rejected() {
    let device = create_test_device();
    let server = create_server(&[&device]);

    let request = device.join_request_with_nonce([0x10, 0x20]);
    uplink(&server, &request).unwrap();
    let before = server.store().get_session(&device.dev_eui).unwrap();

    let err = uplink(&server, &request).unwrap_err();
    assert!(matches!(err, ServerError::Join(JoinError::ReplayedDevNonce(_))));
    assert!(err.is_security_event());
    assert_eq!(server.store().get_session(&device.dev_eui).unwrap(), before);
}

#[test]
fn test_rejoin_resets_session() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);
    let old_keys = device.keys;

    for i in 0..3u8 {
        uplink(&server, &device.send(1, &[i])).unwrap();
    }
    join(&server, &mut device);

    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert_eq!(session.fcnt_up, 0);
    assert_eq!(session.fcnt_down, 0);
    assert_ne!(session.keys, old_keys);
    assert_eq!(session.used_dev_nonces.len(), 2);

    // counting restarts at 1 after the rejoin
    assert!(uplink(&server, &device.send(1, b"again")).is_ok());
}

#[test]
fn test_unknown_devices() {
    let device = create_test_device();
    let stranger = MockDevice::new([9; 8], [9; 8], [9; 16]);
    let server = create_server(&[&device]);

    let err = uplink(&server, &stranger.join_request_with_nonce([1, 1])).unwrap_err();
    assert!(matches!(err, ServerError::UnknownDevice(DeviceId::Eui(_))));
    assert!(server.store().is_empty());

    let mut ghost = create_test_device();
    ghost.dev_addr = Some(DevAddr(0x2400_0999));
    ghost.keys = Some(lorawan_ns::crypto::SessionKeys {
        nwk_skey: ghost.app_key,
        app_skey: ghost.app_key,
    });
    let err = uplink(&server, &ghost.send(1, b"?")).unwrap_err();
    assert!(matches!(
        err,
        ServerError::UnknownDevice(DeviceId::Addr(DevAddr(0x2400_0999)))
    ));
}

#[test]
fn test_truncated_and_unsupported_frames() {
    let device = create_test_device();
    let server = create_server(&[&device]);

    assert!(matches!(
        uplink(&server, &[0x40, 1, 2]),
        Err(ServerError::Frame(_))
    ));
    assert!(matches!(
        uplink(&server, &[0xE0, 1, 2, 3, 4, 5]),
        Err(ServerError::UnsupportedMType(MType::Proprietary))
    ));
    assert!(matches!(
        server.handle_push_data(b"{\"rxpk\": 12"),
        Err(ServerError::Envelope(_))
    ));
}

#[test]
fn test_queued_data_and_mac_commands() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);

    server
        .queue_application_data(&device.dev_eui, 10, b"first".to_vec(), true)
        .unwrap();
    server
        .queue_application_data(&device.dev_eui, 11, b"second".to_vec(), false)
        .unwrap();
    server
        .enqueue_mac_command(&device.dev_eui, DownlinkCommand::DevStatusReq)
        .unwrap();
    assert!(matches!(
        server.queue_application_data(&device.dev_eui, 0, vec![1], false),
        Err(ServerError::InvalidFPort(0))
    ));

    let outcome = uplink(&server, &device.send(1, b"up")).unwrap();
    let (frame, plaintext) = device.open_downlink(&outcome.downlink.unwrap().phy_payload);
    assert_eq!(frame.mhdr.mtype, MType::ConfirmedDataDown);
    let data = frame.data().unwrap();
    assert_eq!(data.f_port, Some(10));
    assert_eq!(plaintext, b"first");
    assert!(data.fhdr.f_ctrl.f_pending);
    assert_eq!(&data.fhdr.f_opts[..], &[0x06]);

    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert_eq!(session.pending_mac, vec![DownlinkCommand::DevStatusReq]);
    assert_eq!(session.data_queue.len(), 1);

    // DevStatusAns: battery 254, margin -2 (6-bit two's complement)
    let dev_status_ans = device.uplink(false, FCtrl::default(), &[0x06, 254, 0x3E], None, &[]);
    let outcome = uplink(&server, &dev_status_ans).unwrap();
    let (frame, plaintext) = device.open_downlink(&outcome.downlink.unwrap().phy_payload);
    assert_eq!(plaintext, b"second");
    assert!(!frame.data().unwrap().fhdr.f_ctrl.f_pending);

    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert!(session.pending_mac.is_empty());
    assert_eq!(session.status.battery, Some(254));
    assert_eq!(session.status.margin, Some(-2));
    assert_eq!(session.fcnt_down, 2);
}

#[test]
fn test_mac_commands_on_port_zero() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);

    // Four LinkCheckReq and a DeviceTimeReq in an FPort 0 payload
    let commands = [0x02, 0x02, 0x02, 0x02, 0x0D];
    let phy = device.uplink(false, FCtrl::default(), &[], Some(0), &commands);
    let outcome = uplink(&server, &phy).unwrap();
    let UplinkEvent::Data(data) = &outcome.event else {
        panic!("expected data");
    };
    assert!(data.payload.is_empty());
    assert_eq!(data.mac_commands.len(), 5);

    // 4 x 3 + 6 bytes of answers no longer fit in FOpts
    let (frame, plaintext) = device.open_downlink(&outcome.downlink.unwrap().phy_payload);
    assert_eq!(frame.data().unwrap().f_port, Some(0));
    let answers = decode_downlink(&plaintext);
    assert_eq!(answers.len(), 5);
    assert!(matches!(answers[4], Ok(DownlinkCommand::DeviceTimeAns { .. })));
}

#[test]
fn test_fopts_ignored_on_port_zero() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);

    // LinkCheckReq in FOpts, DeviceTimeReq in the FPort 0 payload
    let phy = device.uplink(false, FCtrl::default(), &[0x02], Some(0), &[0x0D]);
    let outcome = uplink(&server, &phy).unwrap();
    let UplinkEvent::Data(data) = &outcome.event else {
        panic!("expected data");
    };
    assert_eq!(data.mac_commands, vec![Ok(UplinkCommand::DeviceTimeReq)]);

    let (frame, _) = device.open_downlink(&outcome.downlink.unwrap().phy_payload);
    let answers = decode_downlink(&frame.data().unwrap().fhdr.f_opts);
    assert_eq!(answers.len(), 1);
    assert!(matches!(answers[0], Ok(DownlinkCommand::DeviceTimeAns { .. })));
}

#[test]
fn test_stale_uplink_falls_back_to_rx2() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);

    let phy = device.uplink(true, FCtrl::default(), &[], Some(1), b"late");
    let outcome = server
        .handle_uplink(&phy, &meta(4_000_000_000, Duration::from_millis(2_500)))
        .unwrap();
    let downlink = outcome.downlink.unwrap();
    assert_eq!(downlink.window.chosen, RxWindow::Rx2);
    assert_eq!(downlink.txpk.tmst, 4_002_000_000);
    assert_eq!(downlink.txpk.freq, 869.525);
    assert_eq!(downlink.txpk.datr, "SF12BW125");
}

#[test]
fn test_configured_rx2_delay() {
    let mut device = create_test_device();
    let mut config = NetworkConfig::default();
    config.timing.rx2_delay = Some(5);
    let registry: DeviceRegistry = [device.config()].into_iter().collect();
    let server = NetworkServer::new(config, registry, MemorySessionStore::new()).unwrap();
    join(&server, &mut device);

    let phy = device.uplink(true, FCtrl::default(), &[], None, &[]);
    let downlink = uplink(&server, &phy).unwrap().downlink.unwrap();
    assert_eq!(downlink.window.rx1_tmst, 2_000_000);
    assert_eq!(downlink.window.rx2_tmst, 6_000_000);

    let phy = device.uplink(true, FCtrl::default(), &[], None, &[]);
    let late = meta(1_000_000, Duration::from_secs(5));
    let downlink = server.handle_uplink(&phy, &late).unwrap().downlink.unwrap();
    assert_eq!(downlink.window.chosen, RxWindow::Rx2);
    assert_eq!(downlink.txpk.tmst, 6_000_000);
}

#[test]
fn test_unusable_rx2_data_rate() {
    let mut config = NetworkConfig::default();
    config.rx2_data_rate = 9;
    assert!(config.validate().is_ok());
    assert!(matches!(
        NetworkServer::new(config, DeviceRegistry::new(), MemorySessionStore::new()),
        Err(ServerError::InvalidDataRateIndex(9))
    ));

    // a session that ended up with an undefined RX2 data rate commits nothing
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);
    server
        .store()
        .update_session::<_, ServerError, _>(&device.dev_eui, |s| {
            s.settings.rx2_data_rate = 9;
            Ok(())
        })
        .unwrap();
    server
        .queue_application_data(&device.dev_eui, 3, b"keep".to_vec(), false)
        .unwrap();

    let phy = device.uplink(true, FCtrl::default(), &[], Some(1), b"up");
    assert!(matches!(
        uplink(&server, &phy),
        Err(ServerError::InvalidDataRateIndex(9))
    ));
    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert_eq!(session.fcnt_up, 0);
    assert_eq!(session.fcnt_down, 0);
    assert_eq!(session.data_queue.len(), 1);
}

#[test]
fn test_downlink_respects_payload_limit() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);
    let sf12 = UplinkMeta {
        data_rate: DataRate::new(12, 125),
        ..meta(1_000_000, Duration::ZERO)
    };

    // 7 + 1 + 60 bytes exceed the 59 byte DR0 limit, so the data waits
    server
        .queue_application_data(&device.dev_eui, 2, vec![0xAB; 60], false)
        .unwrap();
    let phy = device.uplink(true, FCtrl::default(), &[], Some(1), b"up");
    let downlink = server.handle_uplink(&phy, &sf12).unwrap().downlink.unwrap();
    assert_eq!(downlink.txpk.datr, "SF12BW125");
    let (frame, _) = device.open_downlink(&downlink.phy_payload);
    let data = frame.data().unwrap();
    assert_eq!(data.f_port, None);
    assert!(data.fhdr.f_ctrl.ack);
    assert!(data.fhdr.f_ctrl.f_pending);
    assert_eq!(server.store().get_session(&device.dev_eui).unwrap().data_queue.len(), 1);

    // at SF7 it fits
    let phy = device.uplink(true, FCtrl::default(), &[], Some(1), b"up");
    let downlink = uplink(&server, &phy).unwrap().downlink.unwrap();
    let (_, plaintext) = device.open_downlink(&downlink.phy_payload);
    assert_eq!(plaintext, vec![0xAB; 60]);
    assert!(server.store().get_session(&device.dev_eui).unwrap().data_queue.is_empty());

    // ten 6-byte NewChannelReq on FPort 0: only eight fit in 59 bytes
    for ch_index in 3..13 {
        let command = DownlinkCommand::NewChannelReq {
            ch_index,
            frequency: 867_100_000,
            max_dr: 5,
            min_dr: 0,
        };
        server.enqueue_mac_command(&device.dev_eui, command).unwrap();
    }
    let phy = device.uplink(false, FCtrl::default(), &[], None, &[]);
    let downlink = server.handle_uplink(&phy, &sf12).unwrap().downlink.unwrap();
    let (frame, plaintext) = device.open_downlink(&downlink.phy_payload);
    assert_eq!(frame.data().unwrap().f_port, Some(0));
    assert_eq!(decode_downlink(&plaintext).len(), 8);

    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert_eq!(session.pending_mac.len(), 8);
    assert_eq!(session.mac_queue.len(), 2);
    assert!(matches!(
        session.mac_queue[0],
        DownlinkCommand::NewChannelReq { ch_index: 11, .. }
    ));
}

#[test]
fn test_dev_addr_allocation_skips_taken_addresses() {
    let mut fixed = create_test_device();
    let mut dynamic = MockDevice::new([0x21; 8], [0x11; 8], APP_KEY);
    let registry: DeviceRegistry = [fixed.config().with_nwk_addr(1), dynamic.config()]
        .into_iter()
        .collect();
    init_tracing();
    let server =
        NetworkServer::new(NetworkConfig::default(), registry, MemorySessionStore::new()).unwrap();

    // the counter starts at 1, which is provisioned for the other device
    join(&server, &mut dynamic);
    join(&server, &mut fixed);
    assert_eq!(fixed.dev_addr, DevAddr::from_parts(0x12, 1));
    assert_eq!(dynamic.dev_addr, DevAddr::from_parts(0x12, 2));

    for device in [&mut fixed, &mut dynamic] {
        let UplinkEvent::Data(data) = uplink(&server, &device.send(1, b"mine")).unwrap().event
        else {
            panic!("expected data");
        };
        assert_eq!(data.dev_eui, device.dev_eui);
    }
}

#[test]
fn test_push_data_merges_gateway_receptions() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);

    let phy = device.uplink(false, FCtrl::default(), &[0x02], None, &[]);
    let body = push_data(&phy, &[(1_000, -3.0), (2_000, 9.0)]);
    let outcomes = server.handle_push_data(&body).unwrap();
    assert_eq!(outcomes.len(), 1);

    let outcome = outcomes.into_iter().next().unwrap().unwrap();
    let downlink = outcome.downlink.unwrap();
    assert_eq!(downlink.txpk.tmst, 1_002_000);
    let (frame, _) = device.open_downlink(&downlink.phy_payload);
    let commands = decode_downlink(&frame.data().unwrap().fhdr.f_opts);
    assert_eq!(
        commands,
        vec![Ok(DownlinkCommand::LinkCheckAns {
            margin: 16,
            gateway_count: 2
        })]
    );
}

#[test]
fn test_disconnect_purges_session() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);

    let request = device.join_request_with_nonce([7, 7]);
    uplink(&server, &request).unwrap();
    let session = server.store().get_session(&device.dev_eui).unwrap();
    device.adopt(&session);

    assert!(server.disconnect(&device.dev_eui).unwrap().is_some());
    assert!(matches!(
        uplink(&server, &device.send(1, b"x")),
        Err(ServerError::UnknownDevice(_))
    ));
    assert!(server.disconnect(&device.dev_eui).unwrap().is_none());

    // Fresh session, fresh nonce history
    uplink(&server, &request).unwrap();
    let session = server.store().get_session(&device.dev_eui).unwrap();
    assert_eq!(session.used_dev_nonces.len(), 1);
}

#[test]
fn test_concurrent_duplicates_accept_once() {
    let mut device = create_test_device();
    let server = create_server(&[&device]);
    join(&server, &mut device);
    let phy = device.send(1, b"dup");

    let accepted = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| uplink(&server, &phy).is_ok()))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count()
    });
    assert_eq!(accepted, 1);
}
