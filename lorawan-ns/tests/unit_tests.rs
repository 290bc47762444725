use lorawan_ns::{
    config::{AesKey, DevAddr, DeviceConfig, Eui64},
    crypto::{self, Direction},
    gateway::{PushData, TxPk},
    lorawan::{
        commands::{extract, UplinkCommand},
        mac::{DevNonce, Frame, MacPayload},
        phy::PhyFrame,
        region::{DataRate, Eu868, Region},
    },
    scheduler::{compute_rx_tmsts, decide_receive_window, RxWindow},
    NetworkServer,
};

fn key(hex_str: &str) -> AesKey {
    hex_str.parse().unwrap()
}

#[test]
fn test_device_config() {
    let config = DeviceConfig::new_otaa(
        Eui64::new([0x01; 8]),
        Eui64::new([0x02; 8]),
        AesKey::new([0x03; 16]),
    );
    assert_eq!(config.dev_eui.to_string(), "0101010101010101");
    assert_eq!(config.app_key.as_bytes(), &[0x03; 16]);
    assert!(config.nwk_addr.is_none());
}

#[test]
fn test_join_request_parsing() {
    let bytes = hex::decode("0011223344556677888877665544332211AABBCCDD1122").unwrap();
    let frame = Frame::decode(&bytes).unwrap();
    assert_eq!(frame.mhdr.to_byte(), 0x00);
    let MacPayload::JoinRequest(request) = frame.payload else {
        panic!("not a join request");
    };
    assert_eq!(request.app_eui.to_string(), "1122334455667788");
    assert_eq!(request.dev_eui.to_string(), "8877665544332211");
    assert_eq!(request.dev_nonce, DevNonce([0xAA, 0xBB]));
    assert_eq!(frame.mic, [0xCC, 0xDD, 0x11, 0x22]);
}

#[test]
fn test_join_request_mic_vector() {
    let app_key = key("2B7E151628AED2A6ABF7158809CF4F3C");
    let msg = hex::decode("0011223344556677888877665544332211AABB").unwrap();
    assert_eq!(
        crypto::compute_join_request_mic(&app_key, &msg),
        [0xCB, 0x92, 0xC1, 0xE0]
    );
}

#[test]
fn test_mac_command_extraction() {
    let commands = extract(&hex::decode("02AABBCCDD0419").unwrap(), Direction::Up);
    let names: Vec<_> = commands.iter().map(|c| c.name().into_owned()).collect();
    assert_eq!(
        names,
        [
            "LinkCheckReq",
            "UnknownCID_AA",
            "UnknownCID_BB",
            "UnknownCID_CC",
            "UnknownCID_DD",
            "DutyCycleAns",
            "UnknownCID_19",
        ]
    );
    assert!(commands.iter().all(|c| c.payload.is_empty()));
    assert_eq!(
        UplinkCommand::decode(commands[0].cid, &commands[0].payload),
        Ok(UplinkCommand::LinkCheckReq)
    );
}

#[test]
fn test_data_mic_golden_vector() {
    let nwk_skey = AesKey::new([0; 16]);
    let mac_payload = hex::decode("0102030400010001AABB").unwrap();
    let mic = crypto::compute_mic(
        &nwk_skey,
        DevAddr(0x0403_0201),
        1,
        Direction::Up,
        0x40,
        &mac_payload,
    );
    assert_eq!(mic, [0x2E, 0x6D, 0xC3, 0x2B]);
}

#[test]
fn test_known_uplink_decrypts() {
    let nwk_skey = key("44024241ED4CE9A68C6A8BC055233FD3");
    let app_skey = key("EC925802AE430CA77FD3DD73CB2CC588");
    let bytes = hex::decode("40F17DBE4900020001954378762B11FF0D").unwrap();

    let frame = Frame::decode(&bytes).unwrap();
    assert_eq!(frame.encode(), bytes);
    let data = frame.data().unwrap();
    assert_eq!(data.fhdr.dev_addr, DevAddr(0x49BE_7DF1));
    assert_eq!(data.fhdr.f_cnt, 2);
    assert_eq!(data.f_port, Some(1));

    assert!(crypto::verify_mic(
        &nwk_skey,
        data.fhdr.dev_addr,
        2,
        Direction::Up,
        bytes[0],
        &frame.mac_payload_bytes(),
        &frame.mic,
    ));
    assert!(!crypto::verify_mic(
        &app_skey,
        data.fhdr.dev_addr,
        2,
        Direction::Up,
        bytes[0],
        &frame.mac_payload_bytes(),
        &frame.mic,
    ));

    let plaintext = crypto::decrypt_frm_payload(
        crypto::payload_key(1, &nwk_skey, &app_skey),
        data.fhdr.dev_addr,
        2,
        Direction::Up,
        &data.frm_payload,
    );
    assert_eq!(plaintext, b"test");
}

#[test]
fn test_session_key_derivation_vector() {
    let keys = crypto::derive_session_keys(
        &key("2B7E151628AED2A6ABF7158809CF4F3C"),
        &[1, 2, 3],
        &[0x12, 0, 0],
        &[0xAA, 0xBB],
    );
    assert_eq!(keys.nwk_skey, key("84BAFA704E490C04EAF0E5A88503262E"));
    assert_eq!(keys.app_skey, key("BF28AFB3A4B23821B6032346DB77520B"));
}

#[test]
fn test_rx_window_boundary() {
    let (rx1, rx2) = compute_rx_tmsts(1_000_000, 1, None);
    assert_eq!((rx1, rx2), (2_000_000, 3_000_000));

    // current = 1_000_000 + elapsed; RX1 needs current + tx < 3_000_000
    assert_eq!(decide_receive_window(rx1, rx2, 1, 1_000_000, 999_999), RxWindow::Rx1);
    assert_eq!(decide_receive_window(rx1, rx2, 1, 1_000_000, 1_000_000), RxWindow::Rx2);
}

#[test]
fn test_phy_wrapper() {
    let payload = hex::decode("40F17DBE4900020001954378762B11FF0D").unwrap();
    let wrapped = PhyFrame::wrap(0x34, &payload).encode();
    let phy = PhyFrame::decode(&wrapped).unwrap();
    phy.verify_crc().unwrap();
    assert_eq!(Frame::decode(&phy.payload).unwrap().encode(), payload);
}

#[test]
fn test_region_parameters() {
    let region = Eu868;
    assert_eq!(region.data_rate(0), Some(DataRate::new(12, 125)));
    assert_eq!(region.data_rate_index(DataRate::new(7, 125)), Some(5));
    assert_eq!(region.rx1_data_rate(5, 2), 3);
    assert_eq!(region.rx1_data_rate(1, 3), 0);
    assert_eq!(region.rx2_window(), (869_525_000, 0));
    assert_eq!(DataRate::new(7, 125).link_margin(-10.0), 0);
}

#[test]
fn test_gateway_envelope() {
    let push = PushData::from_json(
        br#"{"rxpk":[{"tmst":1,"freq":868.3,"datr":"SF9BW125","codr":"4/5",
            "lsnr":-2.0,"rssi":-100,"data":"AA=="}]}"#,
    )
    .unwrap();
    let rx = &push.rxpk[0];
    assert_eq!(rx.frequency(), 868_300_000);
    assert_eq!(rx.data_rate().unwrap(), DataRate::new(9, 125));
    assert_eq!(rx.phy_payload().unwrap(), [0]);

    let txpk = TxPk::default();
    assert_eq!((txpk.rfch, txpk.powe, txpk.ipol), (0, 14, true));
    assert_eq!(txpk.codr, "4/5");
    assert_eq!(txpk.modu, "LORA");
}

#[test]
fn test_server_is_shareable_across_threads() {
    fn assert_sync<T: Send + Sync>() {}
    assert_sync::<NetworkServer<lorawan_ns::MemorySessionStore>>();
}
