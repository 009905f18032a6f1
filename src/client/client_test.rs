use std::sync::Arc;

use super::*;
use crate::config::Config;

async fn test_client(url: &str, custom_path: &str) -> Arc<RtspClient> {
    let server = crate::server::Server::new(Arc::new(Config::default()))
        .await
        .expect("server");
    RtspClient::new(
        server,
        "c1".to_owned(),
        url,
        TransType::Tcp,
        0,
        custom_path,
        "rtsp-relay-test",
    )
    .expect("client")
}

#[tokio::test]
async fn rejects_non_rtsp_urls() {
    let server = crate::server::Server::new(Arc::new(Config::default()))
        .await
        .expect("server");
    assert!(RtspClient::new(
        Arc::clone(&server),
        "c1".to_owned(),
        "http://host/stream",
        TransType::Tcp,
        0,
        "",
        "agent",
    )
    .is_err());
    assert!(
        RtspClient::new(server, "c1".to_owned(), "not a url", TransType::Tcp, 0, "", "agent")
            .is_err()
    );
}

#[tokio::test]
async fn custom_path_overrides_source_path() {
    let client = test_client("rtsp://cam.example/live/cam1", "").await;
    assert_eq!(client.path(), "/live/cam1");

    let client = test_client("rtsp://cam.example/live/cam1", "/relay/cam1").await;
    assert_eq!(client.path(), "/relay/cam1");
}

#[tokio::test]
async fn control_urls_join_relative_fragments() {
    let client = test_client("rtsp://cam.example:8554/live/cam1", "").await;
    assert_eq!(
        client.control_url("streamid=0"),
        "rtsp://cam.example:8554/live/cam1/streamid=0"
    );
    assert_eq!(
        client.control_url("rtsp://cam.example:8554/live/cam1/trackID=1"),
        "rtsp://cam.example:8554/live/cam1/trackID=1"
    );
}

#[test]
fn interleaved_channel_mapping_is_fixed() {
    assert_eq!(
        RtspClient::kind_for_channel(0),
        Some((crate::rtp::RtpKind::Video, 0))
    );
    assert_eq!(
        RtspClient::kind_for_channel(1),
        Some((crate::rtp::RtpKind::VideoControl, 0))
    );
    assert_eq!(
        RtspClient::kind_for_channel(2),
        Some((crate::rtp::RtpKind::Audio, 0))
    );
    assert_eq!(
        RtspClient::kind_for_channel(5),
        Some((crate::rtp::RtpKind::AudioControl, 1))
    );
    assert_eq!(RtspClient::kind_for_channel(9), None);
}

#[tokio::test]
async fn connect_to_unreachable_source_fails_within_timeout() {
    // A port nothing listens on: connection refused well inside the bound.
    let client = test_client("rtsp://127.0.0.1:1/live/cam1", "").await;
    let started = std::time::Instant::now();
    let result = client.start(std::time::Duration::from_secs(2)).await;
    assert!(result.is_err());
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
    assert_eq!(client.server().pusher_count(), 0);
}
