#[cfg(test)]
mod client_test;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use socket2::SockRef;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::rtp::record::INTERLEAVED_MAGIC;
use crate::rtp::{RtpKind, RtpPack};
use crate::sdp::{MediaKind, SdpSession};
use crate::session::auth;
use crate::session::response::Response;
use crate::shutdown::{ShutdownChain, StopHandler};
use crate::transport::udp_server::UdpServer;
use crate::transport::{RtpSink, TransType};

/// Fixed interleaved mapping used on the pull leg: video RTP/control on
/// 0/1, audio channels on 2/3 and 4/5.
const V_RTP_CHANNEL: i32 = 0;
const V_RTP_CONTROL_CHANNEL: i32 = 1;
const A_RTP_CHANNELS: [i32; 2] = [2, 4];
const A_RTP_CONTROL_CHANNELS: [i32; 2] = [3, 5];

#[derive(Default)]
struct MediaInfo {
    sdp_raw: String,
    v_control: String,
    v_codec: String,
    a_control: Vec<String>,
    a_codec: Vec<String>,
}

/// Outbound RTSP puller: dials a remote source, negotiates playback and
/// demuxes the incoming stream into the same packet type the server
/// sessions produce.
pub struct RtspClient {
    pub id: String,
    server: Arc<crate::server::Server>,
    config: Arc<Config>,
    url: String,
    path: String,
    custom_path: String,
    agent: String,
    trans_type: TransType,
    option_interval_millis: u64,
    start_at: DateTime<Utc>,

    in_bytes: Arc<AtomicUsize>,
    out_bytes: AtomicUsize,
    seq: AtomicUsize,

    media: StdMutex<MediaInfo>,
    session_id: StdMutex<String>,
    auth_line: StdMutex<String>,

    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    udp_server: StdMutex<Option<Arc<UdpServer>>>,

    rtp_handlers: StdMutex<Vec<RtpSink>>,
    shutdown: ShutdownChain,
    stop_notify: Notify,
}

impl fmt::Display for RtspClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client[{}]", self.url)
    }
}

impl RtspClient {
    pub fn new(
        server: Arc<crate::server::Server>,
        id: String,
        raw_url: &str,
        trans_type: TransType,
        option_interval_millis: u64,
        custom_path: &str,
        agent: &str,
    ) -> Result<Arc<RtspClient>> {
        let url = Url::parse(raw_url).map_err(|_| Error::ErrInvalidUrl(raw_url.to_owned()))?;
        if url.scheme().to_ascii_lowercase() != "rtsp" || url.host_str().is_none() {
            return Err(Error::ErrInvalidUrl(raw_url.to_owned()));
        }
        let config = Arc::clone(server.config());

        Ok(Arc::new(RtspClient {
            id,
            server,
            config,
            url: raw_url.to_owned(),
            path: url.path().to_owned(),
            custom_path: custom_path.to_owned(),
            agent: agent.to_owned(),
            trans_type,
            option_interval_millis,
            start_at: Utc::now(),
            in_bytes: Arc::new(AtomicUsize::new(0)),
            out_bytes: AtomicUsize::new(0),
            seq: AtomicUsize::new(0),
            media: StdMutex::new(MediaInfo::default()),
            session_id: StdMutex::new(String::new()),
            auth_line: StdMutex::new(String::new()),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            udp_server: StdMutex::new(None),
            rtp_handlers: StdMutex::new(Vec::new()),
            shutdown: ShutdownChain::new(),
            stop_notify: Notify::new(),
        }))
    }

    pub fn server(&self) -> Arc<crate::server::Server> {
        Arc::clone(&self.server)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Registration path: the custom path when configured, otherwise the
    /// source URL's path.
    pub fn path(&self) -> String {
        if self.custom_path.is_empty() {
            self.path.clone()
        } else {
            self.custom_path.clone()
        }
    }

    pub fn trans_type(&self) -> TransType {
        self.trans_type
    }

    pub fn in_bytes(&self) -> usize {
        self.in_bytes.load(Ordering::Relaxed)
    }

    pub fn out_bytes(&self) -> usize {
        self.out_bytes.load(Ordering::Relaxed)
    }

    pub fn add_out_bytes(&self, n: usize) {
        self.out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_stopped()
    }

    pub fn sdp_raw(&self) -> String {
        self.media.lock().unwrap().sdp_raw.clone()
    }

    pub fn v_codec(&self) -> String {
        self.media.lock().unwrap().v_codec.clone()
    }

    pub fn v_control(&self) -> String {
        self.media.lock().unwrap().v_control.clone()
    }

    pub fn a_codec(&self) -> Vec<String> {
        self.media.lock().unwrap().a_codec.clone()
    }

    pub fn a_control(&self) -> Vec<String> {
        self.media.lock().unwrap().a_control.clone()
    }

    pub fn add_rtp_handler(&self, handler: RtpSink) {
        self.rtp_handlers.lock().unwrap().push(handler);
    }

    pub async fn add_stop_handler(&self, handler: StopHandler) {
        self.shutdown.add(handler).await;
    }

    fn handle_rtp(&self, pack: Arc<RtpPack>) {
        let handlers = self.rtp_handlers.lock().unwrap();
        for handler in handlers.iter() {
            handler(Arc::clone(&pack));
        }
    }

    fn rtp_sink(self: &Arc<Self>) -> RtpSink {
        let client = Arc::clone(self);
        Arc::new(move |pack| client.handle_rtp(pack))
    }

    pub async fn stop(&self) {
        if !self.shutdown.stop().await {
            return;
        }
        self.stop_notify.notify_one();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.flush().await;
            let _ = writer.get_mut().shutdown().await;
        }
        let udp_server = self.udp_server.lock().unwrap().take();
        if let Some(server) = udp_server {
            server.stop();
        }
        log::info!("{self} stopped");
    }

    /// Dial, negotiate playback, then hand the connection to the framing
    /// loop. `timeout` bounds every handshake read; zero falls back to the
    /// configured RTSP timeout.
    pub async fn start(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let timeout = if timeout.is_zero() {
            Duration::from_millis(self.config.rtsp.timeout_millis)
        } else {
            timeout
        };
        self.request_stream(timeout).await?;
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.stream_loop().await;
        });
        Ok(())
    }

    async fn request_stream(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let url = Url::parse(&self.url).map_err(|_| Error::ErrInvalidUrl(self.url.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::ErrInvalidUrl(self.url.clone()))?
            .to_owned();
        let port = url.port().unwrap_or(554);

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| {
                Error::ErrIoError(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timeout",
                ))
            })??;

        let network_buffer = self.config.rtsp.network_buffer;
        {
            let sock = SockRef::from(&stream);
            let _ = sock.set_recv_buffer_size(network_buffer);
            let _ = sock.set_send_buffer_size(network_buffer);
        }
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(BufReader::with_capacity(network_buffer, read_half));
        *self.writer.lock().await = Some(BufWriter::with_capacity(network_buffer, write_half));

        // OPTIONS, retrying once with credentials after a 401.
        let mut headers = vec![("Require".to_owned(), "implicit-play".to_owned())];
        let resp = self.request("OPTIONS", headers.clone(), Some(timeout)).await?;
        if resp.status == 401 {
            let authorization = self.answer_challenge("OPTIONS", &resp)?;
            headers.push(("Authorization".to_owned(), authorization));
            let resp = self.request("OPTIONS", headers, Some(timeout)).await?;
            expect_ok(&resp)?;
        } else {
            expect_ok(&resp)?;
        }

        // DESCRIBE, same retry dance.
        let mut headers = vec![("Accept".to_owned(), "application/sdp".to_owned())];
        let mut resp = self.request("DESCRIBE", headers.clone(), Some(timeout)).await?;
        if resp.status == 401 {
            let authorization = self.answer_challenge("DESCRIBE", &resp)?;
            headers.push(("Authorization".to_owned(), authorization));
            resp = self.request("DESCRIBE", headers, Some(timeout)).await?;
        }
        expect_ok(&resp)?;

        let sdp = SdpSession::parse(&resp.body)?;
        self.setup_media(&sdp, timeout).await?;

        let resp = self.request("PLAY", Vec::new(), Some(timeout)).await?;
        expect_ok(&resp)?;
        Ok(())
    }

    async fn setup_media(self: &Arc<Self>, sdp: &SdpSession, timeout: Duration) -> Result<()> {
        {
            let mut media = self.media.lock().unwrap();
            media.sdp_raw = sdp.raw.clone();
        }

        let mut a_channel_num = 0usize;
        for section in &sdp.medias {
            match section.kind {
                MediaKind::Video => {
                    {
                        let mut media = self.media.lock().unwrap();
                        media.v_control = section.control.clone();
                        media.v_codec = section.codec.clone();
                    }
                    let track_url = self.control_url(&section.control);
                    let transport = match self.trans_type {
                        TransType::Udp => {
                            let udp = self.udp_server_leg();
                            let (rtp, control) = udp.setup_video().await?;
                            format!("RTP/AVP/UDP;unicast;client_port={rtp}-{control}")
                        }
                        _ => format!(
                            "RTP/AVP/TCP;unicast;interleaved={V_RTP_CHANNEL}-{V_RTP_CONTROL_CHANNEL}"
                        ),
                    };
                    let headers = vec![("Transport".to_owned(), transport)];
                    let resp = self
                        .request_with_path("SETUP", &track_url, headers, Some(timeout))
                        .await?;
                    expect_ok(&resp)?;
                }
                MediaKind::Audio => {
                    if a_channel_num >= 2 {
                        log::error!("{self} more than 2 audio channels, please look into it");
                        continue;
                    }
                    {
                        let mut media = self.media.lock().unwrap();
                        media.a_control.push(section.control.clone());
                        media.a_codec.push(section.codec.clone());
                    }
                    let track_url = self.control_url(&section.control);
                    let transport = match self.trans_type {
                        TransType::Udp => {
                            let udp = self.udp_server_leg();
                            let (rtp, control) = udp.setup_audio(a_channel_num as u8).await?;
                            format!("RTP/AVP/UDP;unicast;client_port={rtp}-{control}")
                        }
                        _ => format!(
                            "RTP/AVP/TCP;unicast;interleaved={}-{}",
                            A_RTP_CHANNELS[a_channel_num], A_RTP_CONTROL_CHANNELS[a_channel_num]
                        ),
                    };
                    let headers = vec![("Transport".to_owned(), transport)];
                    let resp = self
                        .request_with_path("SETUP", &track_url, headers, Some(timeout))
                        .await?;
                    expect_ok(&resp)?;
                    a_channel_num += 1;
                }
            }
        }
        Ok(())
    }

    fn udp_server_leg(self: &Arc<Self>) -> Arc<UdpServer> {
        let mut guard = self.udp_server.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Arc::new(UdpServer::new(
                self.rtp_sink(),
                Arc::clone(&self.in_bytes),
                self.config.rtsp.network_buffer,
            )));
        }
        Arc::clone(guard.as_ref().expect("just inserted"))
    }

    fn control_url(&self, control: &str) -> String {
        if control.to_ascii_lowercase().starts_with("rtsp://") {
            control.to_owned()
        } else {
            format!(
                "{}/{}",
                self.url.trim_end_matches('/'),
                control.trim_start_matches('/')
            )
        }
    }

    fn answer_challenge(&self, method: &str, resp: &Response) -> Result<String> {
        let challenge_line = resp
            .header("WWW-Authenticate")
            .ok_or(Error::ErrAuthHeaderMalformed("WWW-Authenticate"))?;
        *self.auth_line.lock().unwrap() = challenge_line.to_owned();
        auth::authorization_for_challenge(challenge_line, method, &self.url)
    }

    fn bare_url(&self) -> String {
        match Url::parse(&self.url) {
            Ok(mut url) => {
                let _ = url.set_username("");
                let _ = url.set_password(None);
                url.to_string()
            }
            Err(_) => self.url.clone(),
        }
    }

    async fn request(
        &self,
        method: &str,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let url = self.bare_url();
        self.request_with_path(method, &url, headers, timeout).await
    }

    async fn send_request(
        &self,
        method: &str,
        path: &str,
        mut headers: Vec<(String, String)>,
    ) -> Result<usize> {
        headers.push(("User-Agent".to_owned(), self.agent.clone()));
        if !headers.iter().any(|(name, _)| name == "Authorization") {
            let auth_line = self.auth_line.lock().unwrap().clone();
            if !auth_line.is_empty() {
                if let Ok(authorization) =
                    auth::authorization_for_challenge(&auth_line, method, &self.url)
                {
                    headers.push(("Authorization".to_owned(), authorization));
                }
            }
        }
        {
            let session_id = self.session_id.lock().unwrap().clone();
            if !session_id.is_empty() {
                headers.push(("Session".to_owned(), session_id));
            }
        }
        let cseq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        headers.push(("CSeq".to_owned(), cseq.to_string()));

        let mut wire = format!("{method} {path} RTSP/1.0\r\n");
        for (name, value) in &headers {
            wire.push_str(&format!("{name}: {value}\r\n"));
        }
        wire.push_str("\r\n");
        log::debug!("{self} [OUT]>>>\n{wire}");

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::ErrSessionStopped)?;
        writer.write_all(wire.as_bytes()).await?;
        writer.flush().await?;
        self.out_bytes.fetch_add(wire.len(), Ordering::Relaxed);
        Ok(cseq)
    }

    async fn request_with_path(
        &self,
        method: &str,
        path: &str,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.send_request(method, path, headers).await?;

        let mut reader_guard = self.reader.lock().await;
        let reader = reader_guard.as_mut().ok_or(Error::ErrSessionStopped)?;
        let resp = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, read_response(reader))
                .await
                .map_err(|_| {
                    Error::ErrIoError(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "response deadline exceeded",
                    ))
                })??,
            None => read_response(reader).await?,
        };
        self.in_bytes.fetch_add(resp.to_string().len(), Ordering::Relaxed);
        log::debug!("{self} <<<[IN]\n{resp}");

        if let Some(session_header) = resp.header("Session") {
            let sid = session_header
                .split(';')
                .next()
                .unwrap_or(session_header)
                .trim()
                .to_owned();
            *self.session_id.lock().unwrap() = sid;
        }
        Ok(resp)
    }

    /// Fire an OPTIONS keepalive without waiting for the reply; the
    /// framing loop swallows it.
    async fn send_keepalive(&self) {
        let headers = vec![("Require".to_owned(), "implicit-play".to_owned())];
        let url = self.bare_url();
        if let Err(err) = self.send_request("OPTIONS", &url, headers).await {
            log::debug!("{self} keepalive failed: {err}");
        }
    }

    fn kind_for_channel(channel: i32) -> Option<(RtpKind, u8)> {
        match channel {
            c if c == V_RTP_CHANNEL => Some((RtpKind::Video, 0)),
            c if c == V_RTP_CONTROL_CHANNEL => Some((RtpKind::VideoControl, 0)),
            c if c == A_RTP_CHANNELS[0] => Some((RtpKind::Audio, 0)),
            c if c == A_RTP_CHANNELS[1] => Some((RtpKind::Audio, 1)),
            c if c == A_RTP_CONTROL_CHANNELS[0] => Some((RtpKind::AudioControl, 0)),
            c if c == A_RTP_CONTROL_CHANNELS[1] => Some((RtpKind::AudioControl, 1)),
            _ => None,
        }
    }

    /// Framing loop after PLAY: interleaved RTP frames and the occasional
    /// textual response share the connection.
    async fn stream_loop(self: Arc<Self>) {
        let mut reader = match self.reader.lock().await.take() {
            Some(reader) => reader,
            None => return,
        };

        let keepalive = self.option_interval_millis;
        let mut keepalive_timer = tokio::time::interval(if keepalive > 0 {
            Duration::from_millis(keepalive)
        } else {
            // Effectively dormant.
            Duration::from_secs(3600)
        });
        keepalive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive_timer.reset();

        while !self.is_stopped() {
            let mut first = [0u8; 1];
            let read = tokio::select! {
                _ = self.stop_notify.notified() => break,
                _ = keepalive_timer.tick() => {
                    if keepalive > 0 {
                        self.send_keepalive().await;
                    }
                    continue;
                }
                read = reader.read_exact(&mut first) => read,
            };
            if let Err(err) = read {
                if !self.is_stopped() {
                    log::info!("{self} read err: {err}");
                }
                break;
            }

            let result = if first[0] == INTERLEAVED_MAGIC {
                self.read_frame(&mut reader).await
            } else {
                self.skip_text(&mut reader).await
            };
            if let Err(err) = result {
                if !self.is_stopped() {
                    log::info!("{self} read err: {err}");
                }
                break;
            }
        }
        self.stop().await;
    }

    async fn read_frame(&self, reader: &mut BufReader<OwnedReadHalf>) -> Result<()> {
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).await?;
        let channel = i32::from(header[0]);
        let length = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;

        self.in_bytes.fetch_add(length + 4, Ordering::Relaxed);
        match Self::kind_for_channel(channel) {
            Some((kind, ch)) => {
                self.handle_rtp(Arc::new(RtpPack::new(kind, ch, Bytes::from(payload))));
            }
            None => log::error!("{self} unknown rtp pack channel: {channel}"),
        }
        Ok(())
    }

    /// Consume a textual message (keepalive reply or server notice)
    /// including any body it declares.
    async fn skip_text(&self, reader: &mut BufReader<OwnedReadHalf>) -> Result<()> {
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(Error::ErrSessionStopped);
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            if let Some(value) = trimmed
                .strip_prefix("Content-Length:")
                .or_else(|| trimmed.strip_prefix("content-length:"))
            {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
        if content_length > 0 {
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).await?;
        }
        Ok(())
    }
}

fn expect_ok(resp: &Response) -> Result<()> {
    if (200..300).contains(&resp.status) {
        Ok(())
    } else {
        Err(Error::ErrResponseStatus(resp.status))
    }
}

async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Result<Response> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::ErrResponseMalformed);
        }
        head.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    let mut resp = Response::parse(&head)?;
    let content_length = resp.content_length();
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        resp.body = String::from_utf8_lossy(&body).into_owned();
    }
    Ok(resp)
}
