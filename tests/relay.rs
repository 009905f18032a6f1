//! End-to-end relay scenarios over loopback TCP/UDP.

mod common;

use std::time::Duration;

use common::{publish, rtp_packet, start_server, subscribe, RawClient, CAMERA_SDP};
use rtsp_relay::pusher::Pusher;
use rtsp_relay::Config;

#[tokio::test]
async fn tcp_publisher_to_tcp_player_relays_in_order() {
    let (_server, addr) = start_server(Config::default()).await;

    let mut camera = RawClient::connect(addr).await;
    publish(&mut camera, "/live/cam1", CAMERA_SDP).await;

    let mut player = RawClient::connect(addr).await;
    let describe = subscribe(&mut player, "/live/cam1", true).await;
    assert_eq!(
        String::from_utf8_lossy(&describe.body),
        CAMERA_SDP,
        "player sees the publisher's SDP verbatim"
    );

    // Give the attach (which happens after the PLAY response) a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sent = Vec::new();
    for seq in 0..5u16 {
        let video = rtp_packet(96, seq, u32::from(seq) * 3600, 64);
        camera.send_interleaved(0, &video).await;
        sent.push((0u8, video));

        let audio = rtp_packet(8, seq, u32::from(seq) * 320, 32);
        camera.send_interleaved(2, &audio).await;
        sent.push((2u8, audio));
    }

    for (expected_channel, expected_payload) in &sent {
        let (channel, payload) = tokio::time::timeout(
            Duration::from_secs(2),
            player.read_interleaved(),
        )
        .await
        .expect("relayed frame");
        assert_eq!(channel, *expected_channel);
        assert_eq!(&payload, expected_payload);
    }
}

#[tokio::test]
async fn tcp_publisher_to_udp_player() {
    let (_server, addr) = start_server(Config::default()).await;

    let mut camera = RawClient::connect(addr).await;
    publish(&mut camera, "/live/cam1", CAMERA_SDP).await;

    // The player advertises local UDP ports in client_port.
    let rtp_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let control_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let rtp_port = rtp_socket.local_addr().unwrap().port();
    let control_port = control_socket.local_addr().unwrap().port();

    let mut player = RawClient::connect(addr).await;
    let url = player.url("/live/cam1");
    let describe = player
        .request("DESCRIBE", &url, &[("Accept", "application/sdp")], "")
        .await;
    assert_eq!(describe.status, 200);

    let video_url = format!("{url}/streamid=0");
    let transport = format!("RTP/AVP/UDP;unicast;client_port={rtp_port}-{control_port}");
    let resp = player
        .request("SETUP", &video_url, &[("Transport", transport.as_str())], "")
        .await;
    assert_eq!(resp.status, 200);

    let resp = player.request("PLAY", &url, &[], "").await;
    assert_eq!(resp.status, 200);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let video = rtp_packet(96, 7, 90_000, 64);
    camera.send_interleaved(0, &video).await;

    let mut buf = [0u8; 2048];
    let n = tokio::time::timeout(Duration::from_secs(2), rtp_socket.recv(&mut buf))
        .await
        .expect("udp frame")
        .expect("recv");
    assert_eq!(&buf[..n], &video);
}

#[tokio::test]
async fn describe_unknown_path_is_404() {
    let (_server, addr) = start_server(Config::default()).await;
    let mut player = RawClient::connect(addr).await;
    let url = player.url("/live/nothing");
    let resp = player
        .request("DESCRIBE", &url, &[("Accept", "application/sdp")], "")
        .await;
    assert_eq!(resp.status, 404);
}

#[tokio::test]
async fn announce_without_body_is_400() {
    let (_server, addr) = start_server(Config::default()).await;
    let mut camera = RawClient::connect(addr).await;
    let url = camera.url("/live/cam1");
    let resp = camera
        .request("ANNOUNCE", &url, &[("Content-Type", "application/sdp")], "")
        .await;
    assert_eq!(resp.status, 400);
}

#[tokio::test]
async fn setup_without_transport_is_400() {
    let (_server, addr) = start_server(Config::default()).await;
    let mut client = RawClient::connect(addr).await;
    let url = client.url("/live/cam1");
    let resp = client.request("SETUP", &url, &[], "").await;
    assert_eq!(resp.status, 400);
}

#[tokio::test]
async fn second_publisher_rejected_without_close_old() {
    let (server, addr) = start_server(Config::default()).await;

    let mut first = RawClient::connect(addr).await;
    publish(&mut first, "/live/cam1", CAMERA_SDP).await;
    assert_eq!(server.pusher_count(), 1);

    let mut second = RawClient::connect(addr).await;
    let url = second.url("/live/cam1");
    let resp = second
        .request(
            "ANNOUNCE",
            &url,
            &[("Content-Type", "application/sdp")],
            CAMERA_SDP,
        )
        .await;
    assert_eq!(resp.status, 406);
    assert_eq!(server.pusher_count(), 1);
}

#[tokio::test]
async fn close_old_hands_the_path_to_the_new_publisher() {
    let mut config = Config::default();
    config.rtsp.close_old = true;
    let (server, addr) = start_server(config).await;

    let mut first = RawClient::connect(addr).await;
    publish(&mut first, "/live/cam1", CAMERA_SDP).await;
    let first_id = server
        .get_pusher("/live/cam1", None)
        .await
        .expect("first pusher")
        .id();

    let mut second = RawClient::connect(addr).await;
    publish(&mut second, "/live/cam1", CAMERA_SDP).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(current) = server.get_pusher("/live/cam1", None).await {
                if current.id() != first_id {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("replacement pusher installed");
    assert_eq!(server.pusher_count(), 1);
}

#[tokio::test]
async fn teardown_ends_the_session_and_unregisters() {
    let (server, addr) = start_server(Config::default()).await;

    let mut camera = RawClient::connect(addr).await;
    publish(&mut camera, "/live/cam1", CAMERA_SDP).await;
    assert_eq!(server.pusher_count(), 1);

    let url = camera.url("/live/cam1");
    let resp = camera.request("TEARDOWN", &url, &[], "").await;
    assert_eq!(resp.status, 200);

    tokio::time::timeout(Duration::from_secs(2), async {
        while server.pusher_count() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pusher removed after teardown");
}

#[tokio::test]
async fn options_lists_public_methods() {
    let (_server, addr) = start_server(Config::default()).await;
    let mut client = RawClient::connect(addr).await;
    let url = client.url("/live/cam1");
    let resp = client.request("OPTIONS", &url, &[], "").await;
    assert_eq!(resp.status, 200);
    let public = resp.header("Public").expect("Public header");
    for method in ["DESCRIBE", "ANNOUNCE", "SETUP", "PLAY", "RECORD", "TEARDOWN"] {
        assert!(public.contains(method), "missing {method}");
    }
}
