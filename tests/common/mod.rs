//! A hand-rolled RTSP client for exercising the server over loopback.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use rtsp_relay::{Config, Server};

pub const CAMERA_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Media Presentation\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:streamid=0\r\n\
m=audio 0 RTP/AVP 8\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=control:streamid=1\r\n";

pub const VIDEO_ONLY_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Media Presentation\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:streamid=0\r\n";

pub async fn start_server(config: Config) -> (Arc<Server>, SocketAddr) {
    let server = Server::new(Arc::new(config)).await.expect("server");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, addr)
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub struct RawClient {
    pub addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    cseq: u32,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> RawClient {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        RawClient {
            addr,
            reader: BufReader::new(read_half),
            writer: write_half,
            cseq: 0,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("rtsp://{}{}", self.addr, path)
    }

    pub async fn request(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) -> RawResponse {
        self.cseq += 1;
        let mut wire = format!("{method} {url} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (name, value) in headers {
            wire.push_str(&format!("{name}: {value}\r\n"));
        }
        if !body.is_empty() {
            wire.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        wire.push_str("\r\n");
        wire.push_str(body);

        self.writer.write_all(wire.as_bytes()).await.expect("send");
        self.read_response().await
    }

    async fn read_response(&mut self) -> RawResponse {
        let mut status = 0u16;
        let mut headers = Vec::new();
        let mut content_length = 0usize;
        let mut first = true;
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.expect("read line");
            assert!(n > 0, "connection closed mid-response");
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            if first {
                first = false;
                let mut parts = trimmed.splitn(3, ' ');
                let _version = parts.next().expect("version");
                status = parts.next().expect("status").parse().expect("status code");
                continue;
            }
            if let Some(colon) = trimmed.find(':') {
                let name = trimmed[..colon].trim().to_owned();
                let value = trimmed[colon + 1..].trim().to_owned();
                if name.eq_ignore_ascii_case("Content-Length") {
                    content_length = value.parse().unwrap_or(0);
                }
                headers.push((name, value));
            }
        }
        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            self.reader.read_exact(&mut body).await.expect("read body");
        }
        RawResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn send_interleaved(&mut self, channel: u8, payload: &[u8]) {
        let mut frame = vec![0x24, channel];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        self.writer.write_all(&frame).await.expect("send frame");
    }

    /// Read the next interleaved frame, failing on anything textual.
    pub async fn read_interleaved(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header).await.expect("frame header");
        assert_eq!(header[0], 0x24, "expected interleaved frame");
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; length];
        self.reader.read_exact(&mut payload).await.expect("frame payload");
        (header[1], payload)
    }
}

/// A minimal valid RTP packet with the given payload type, sequence
/// number, timestamp and payload filler.
pub fn rtp_packet(payload_type: u8, seq: u16, timestamp: u32, payload_len: usize) -> Vec<u8> {
    let mut raw = vec![0x80, payload_type];
    raw.extend_from_slice(&seq.to_be_bytes());
    raw.extend_from_slice(&timestamp.to_be_bytes());
    raw.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
    raw.resize(12 + payload_len, seq as u8);
    raw
}

/// Publish a stream over TCP: OPTIONS, ANNOUNCE, SETUP per media, RECORD.
pub async fn publish(client: &mut RawClient, path: &str, sdp: &str) {
    let url = client.url(path);
    let resp = client.request("OPTIONS", &url, &[], "").await;
    assert_eq!(resp.status, 200);

    let resp = client
        .request(
            "ANNOUNCE",
            &url,
            &[("Content-Type", "application/sdp")],
            sdp,
        )
        .await;
    assert_eq!(resp.status, 200, "announce rejected");

    let video_url = format!("{url}/streamid=0");
    let resp = client
        .request(
            "SETUP",
            &video_url,
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
            "",
        )
        .await;
    assert_eq!(resp.status, 200);

    if sdp.contains("m=audio") {
        let audio_url = format!("{url}/streamid=1");
        let resp = client
            .request(
                "SETUP",
                &audio_url,
                &[("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3")],
                "",
            )
            .await;
        assert_eq!(resp.status, 200);
    }

    let resp = client.request("RECORD", &url, &[], "").await;
    assert_eq!(resp.status, 200);
}

/// Subscribe over TCP: DESCRIBE, SETUP per media, PLAY.
pub async fn subscribe(client: &mut RawClient, path: &str, audio: bool) -> RawResponse {
    let url = client.url(path);
    let describe = client
        .request("DESCRIBE", &url, &[("Accept", "application/sdp")], "")
        .await;
    assert_eq!(describe.status, 200, "describe failed");

    let video_url = format!("{url}/streamid=0");
    let resp = client
        .request(
            "SETUP",
            &video_url,
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
            "",
        )
        .await;
    assert_eq!(resp.status, 200);

    if audio {
        let audio_url = format!("{url}/streamid=1");
        let resp = client
            .request(
                "SETUP",
                &audio_url,
                &[("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3")],
                "",
            )
            .await;
        assert_eq!(resp.status, 200);
    }

    let resp = client.request("PLAY", &url, &[], "").await;
    assert_eq!(resp.status, 200);
    describe
}
