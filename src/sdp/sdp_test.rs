use super::*;

const CAMERA_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Media Presentation\r\n\
c=IN IP4 0.0.0.0\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1\r\n\
a=control:streamid=0\r\n\
m=audio 0 RTP/AVP 8\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=control:streamid=1\r\n";

#[test]
fn parse_video_and_audio() {
    let sdp = SdpSession::parse(CAMERA_SDP).expect("valid sdp");
    assert_eq!(sdp.medias.len(), 2);

    let video = &sdp.medias[0];
    assert_eq!(video.kind, MediaKind::Video);
    assert_eq!(video.codec, "H264");
    assert_eq!(video.control, "streamid=0");
    assert_eq!(video.payload_type, 96);
    assert_eq!(video.clock_rate, 90_000);

    let audio = &sdp.medias[1];
    assert_eq!(audio.kind, MediaKind::Audio);
    assert_eq!(audio.codec, "PCMA");
    assert_eq!(audio.control, "streamid=1");
    assert_eq!(audio.payload_type, 8);
    assert_eq!(audio.clock_rate, 8_000);
}

#[test]
fn parse_absolute_control_url() {
    let raw = "v=0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:rtsp://192.168.1.64/trackID=1\r\n\
a=rtpmap:96 H265/90000\r\n";
    let sdp = SdpSession::parse(raw).expect("valid sdp");
    assert_eq!(sdp.medias[0].control, "rtsp://192.168.1.64/trackID=1");
    assert_eq!(sdp.medias[0].codec, "H265");
}

#[test]
fn parse_skips_application_media() {
    let raw = "v=0\r\n\
m=application 0 RTP/AVP 107\r\n\
a=control:streamid=9\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:streamid=0\r\n";
    let sdp = SdpSession::parse(raw).expect("valid sdp");
    assert_eq!(sdp.medias.len(), 1);
    assert_eq!(sdp.medias[0].kind, MediaKind::Video);
}

#[test]
fn parse_rejects_empty_body() {
    assert!(SdpSession::parse("").is_err());
    assert!(SdpSession::parse("v=0\r\ns=No media\r\n").is_err());
}

#[test]
fn raw_preserved_verbatim() {
    let sdp = SdpSession::parse(CAMERA_SDP).expect("valid sdp");
    assert_eq!(sdp.raw, CAMERA_SDP);
}
