pub mod auth;
pub mod request;
pub mod response;

#[cfg(test)]
mod session_test;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::player::{Player, SessionPlayer};
use crate::pusher::{LivePusher, Pusher};
use crate::rtp::record::INTERLEAVED_MAGIC;
use crate::rtp::{RtpKind, RtpPack};
use crate::sdp::{MediaKind, SdpSession};
use crate::session::auth::SignatureOutcome;
use crate::session::request::Request;
use crate::session::response::Response;
use crate::shutdown::ShutdownChain;
use crate::transport::udp_client::UdpClient;
use crate::transport::udp_server::UdpServer;
use crate::transport::{RtpSink, TransType};
use crate::util::short_id;

lazy_static! {
    static ref INTERLEAVED_RE: Regex = Regex::new(r"interleaved=(\d+)(-(\d+))?").unwrap();
    static ref CLIENT_PORT_RE: Regex = Regex::new(r"client_port=(\d+)(-(\d+))?").unwrap();
}

pub const PUBLIC_METHODS: &str =
    "DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE, OPTIONS, ANNOUNCE, RECORD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Unknown,
    Pusher,
    Player,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionRole::Unknown => "unknown",
            SessionRole::Pusher => "pusher",
            SessionRole::Player => "player",
        };
        write!(f, "{s}")
    }
}

/// Mutable protocol state, touched only from the session's own read loop.
#[derive(Default)]
pub struct SessionState {
    pub role: Option<SessionRole>,
    pub url: String,
    pub path: String,
    pub sdp: Option<SdpSession>,
    pub v_control: String,
    pub v_codec: String,
    pub a_control: Vec<String>,
    pub a_codec: Vec<String>,
    /// Audio media seen in the SDP (capped at 2).
    pub audio_media_count: usize,
    /// Audio tracks set up so far; assigns the slot for the next SETUP.
    pub audio_setup_count: usize,
    pub nonce: String,
    pub pusher: Option<Arc<dyn Pusher>>,
    pub player: Option<Arc<SessionPlayer>>,
    pub udp_client: Option<Arc<UdpClient>>,
    pub udp_server: Option<Arc<UdpServer>>,
}

/// One connected RTSP peer: publisher or player, TCP-interleaved or UDP.
///
/// The session owns its socket halves; everything else holds the session
/// behind an `Arc`. RTP received on this connection (interleaved frames or
/// the session's UDP legs) flows through the handler chain, which the
/// pusher taps with its queue.
pub struct Session {
    pub id: String,
    server: Arc<crate::server::Server>,
    config: Arc<Config>,
    remote_addr: SocketAddr,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    in_bytes: Arc<AtomicUsize>,
    out_bytes: AtomicUsize,
    start_at: DateTime<Utc>,
    /// Read deadline in milliseconds; zero disables it.
    timeout_millis: AtomicU64,
    trans_type: AtomicU8,
    /// Interleaved channel per `kind << 1 | channel` slot; -1 unassigned.
    channels: ArcSwap<[i32; 8]>,
    state: Mutex<SessionState>,
    rtp_handlers: StdMutex<Vec<RtpSink>>,
    shutdown: ShutdownChain,
    stop_notify: Notify,
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session[{}][{}]", self.id, self.remote_addr)
    }
}

impl Session {
    pub fn new(
        server: Arc<crate::server::Server>,
        stream: TcpStream,
        config: Arc<Config>,
    ) -> Result<Arc<Session>> {
        let remote_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let network_buffer = config.rtsp.network_buffer;
        let timeout_millis = config.rtsp.timeout_millis;

        Ok(Arc::new(Session {
            id: short_id(),
            server,
            config,
            remote_addr,
            reader: Mutex::new(Some(BufReader::with_capacity(network_buffer, read_half))),
            writer: Mutex::new(BufWriter::with_capacity(network_buffer, write_half)),
            in_bytes: Arc::new(AtomicUsize::new(0)),
            out_bytes: AtomicUsize::new(0),
            start_at: Utc::now(),
            timeout_millis: AtomicU64::new(timeout_millis),
            trans_type: AtomicU8::new(TransType::Tcp as u8),
            channels: ArcSwap::from_pointee([-1i32; 8]),
            state: Mutex::new(SessionState::default()),
            rtp_handlers: StdMutex::new(Vec::new()),
            shutdown: ShutdownChain::new(),
            stop_notify: Notify::new(),
        }))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server(&self) -> Arc<crate::server::Server> {
        Arc::clone(&self.server)
    }

    pub fn add_out_bytes(&self, n: usize) {
        self.out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn in_bytes(&self) -> usize {
        self.in_bytes.load(Ordering::Relaxed)
    }

    pub fn out_bytes(&self) -> usize {
        self.out_bytes.load(Ordering::Relaxed)
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    pub fn trans_type(&self) -> TransType {
        match self.trans_type.load(Ordering::Relaxed) {
            x if x == TransType::Udp as u8 => TransType::Udp,
            _ => TransType::Tcp,
        }
    }

    fn set_trans_type(&self, trans: TransType) {
        self.trans_type.store(trans as u8, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_stopped()
    }

    pub async fn state(&self) -> tokio::sync::MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub fn add_rtp_handler(&self, handler: RtpSink) {
        self.rtp_handlers.lock().unwrap().push(handler);
    }

    pub async fn add_stop_handler(&self, handler: crate::shutdown::StopHandler) {
        self.shutdown.add(handler).await;
    }

    fn handle_rtp(&self, pack: Arc<RtpPack>) {
        let handlers = self.rtp_handlers.lock().unwrap();
        for handler in handlers.iter() {
            handler(Arc::clone(&pack));
        }
    }

    /// A sink suitable for this session's UDP ingest legs.
    pub fn rtp_sink(self: &Arc<Self>) -> RtpSink {
        let session = Arc::clone(self);
        Arc::new(move |pack| session.handle_rtp(pack))
    }

    fn assign_channel(&self, kind: RtpKind, channel: u8, rtp: i32, control: i32) {
        let mut map = **self.channels.load();
        map[(kind as usize) << 1 | channel as usize] = rtp;
        let control_kind = match kind {
            RtpKind::Audio => RtpKind::AudioControl,
            RtpKind::Video => RtpKind::VideoControl,
            other => other,
        };
        map[(control_kind as usize) << 1 | channel as usize] = control;
        self.channels.store(Arc::new(map));
    }

    fn kind_for_channel(&self, channel: i32) -> Option<(RtpKind, u8)> {
        let map = self.channels.load();
        for (slot, assigned) in map.iter().enumerate() {
            if *assigned == channel {
                let kind = RtpKind::from_u8((slot >> 1) as u8)?;
                return Some((kind, (slot & 1) as u8));
            }
        }
        None
    }

    /// Interleaved channel map for record replay, indexed like
    /// [`crate::rtp::record::deserialize_from_record_tcp`].
    pub fn channel_map(&self) -> [i32; 8] {
        **self.channels.load()
    }

    /// Stop the session: run stop handlers (pusher/player detach), then
    /// close the connection and any UDP legs. Idempotent.
    pub async fn stop(&self) {
        if !self.shutdown.stop().await {
            return;
        }
        self.stop_notify.notify_one();

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.flush().await;
            let _ = writer.get_mut().shutdown().await;
        }
        let (udp_client, udp_server) = {
            let mut state = self.state.lock().await;
            (state.udp_client.take(), state.udp_server.take())
        };
        if let Some(client) = udp_client {
            client.stop();
        }
        if let Some(server) = udp_server {
            server.stop();
        }
        log::info!("{self} stopped");
    }

    async fn read_deadline<F, T>(&self, fut: F) -> std::io::Result<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        let millis = self.timeout_millis.load(Ordering::Relaxed);
        if millis == 0 {
            return fut.await;
        }
        match tokio::time::timeout(Duration::from_millis(millis), fut).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "read deadline exceeded",
            )),
        }
    }

    /// Connection read loop: demultiplexes interleaved RTP frames and
    /// textual RTSP requests until the peer goes away or the session stops.
    pub async fn start(self: Arc<Self>) {
        let mut reader = match self.reader.lock().await.take() {
            Some(reader) => reader,
            None => return,
        };

        while !self.is_stopped() {
            let mut first = [0u8; 1];
            let read = tokio::select! {
                _ = self.stop_notify.notified() => break,
                read = self.read_deadline(reader.read_exact(&mut first)) => read,
            };
            if let Err(err) = read {
                if !self.is_stopped() {
                    log::error!("{self}: {err}");
                }
                break;
            }

            if first[0] == INTERLEAVED_MAGIC {
                if let Err(err) = self.read_interleaved(&mut reader).await {
                    if !self.is_stopped() {
                        log::error!("{self}: {err}");
                    }
                    break;
                }
            } else if let Err(err) = self.read_request(&mut reader, first[0]).await {
                if !self.is_stopped() {
                    log::error!("{self}: {err}");
                }
                break;
            }
        }
        self.stop().await;
    }

    async fn read_interleaved(
        self: &Arc<Self>,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<()> {
        let mut header = [0u8; 3];
        self.read_deadline(reader.read_exact(&mut header)).await?;
        let channel = i32::from(header[0]);
        let length = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut payload = vec![0u8; length];
        self.read_deadline(reader.read_exact(&mut payload)).await?;

        self.in_bytes.fetch_add(length + 4, Ordering::Relaxed);

        match self.kind_for_channel(channel) {
            Some((kind, ch)) => {
                let pack = Arc::new(RtpPack::new(kind, ch, Bytes::from(payload)));
                self.handle_rtp(pack);
            }
            None => {
                log::error!("{self} unknown interleaved channel: {channel}");
            }
        }
        Ok(())
    }

    async fn read_request(
        self: &Arc<Self>,
        reader: &mut BufReader<OwnedReadHalf>,
        first: u8,
    ) -> Result<()> {
        let mut head = String::new();
        head.push(first as char);
        loop {
            let mut line = String::new();
            let n = self.read_deadline(reader.read_line(&mut line)).await?;
            if n == 0 {
                return Err(Error::ErrSessionStopped);
            }
            head.push_str(&line);
            if line == "\r\n" || line == "\n" {
                break;
            }
        }

        let mut req = Request::parse(&head)?;
        self.in_bytes.fetch_add(head.len(), Ordering::Relaxed);

        let content_length = req.content_length();
        if content_length > 0 {
            let mut body = vec![0u8; content_length];
            self.read_deadline(reader.read_exact(&mut body)).await?;
            self.in_bytes.fetch_add(content_length, Ordering::Relaxed);
            req.body = String::from_utf8_lossy(&body).into_owned();
        }

        self.handle_request(req).await;
        Ok(())
    }

    fn issue_challenge(&self, state: &mut SessionState, res: &mut Response) {
        let nonce = auth::generate_nonce();
        res.set_header(
            "WWW-Authenticate",
            auth::challenge(&self.config.rtsp.realm, &nonce),
        );
        state.nonce = nonce;
    }

    /// Gate every request except OPTIONS behind Digest auth when enabled.
    async fn authorize(&self, req: &Request, res: &mut Response) -> bool {
        if req.method == "OPTIONS" || !self.config.rtsp.authorization_enable {
            return true;
        }
        let mut state = self.state.lock().await;
        let checked = match req.header("Authorization") {
            Some(line) => auth::check_digest(
                line,
                &req.method,
                &state.nonce,
                &self.config.rtsp.users,
            ),
            None => Err(Error::ErrAuthFailed),
        };
        match checked {
            Ok(()) => true,
            Err(err) => {
                log::error!("{self} {err}");
                res.set_status(401, "Unauthorized");
                self.issue_challenge(&mut state, res);
                false
            }
        }
    }

    /// Signed-URL check for publish/describe requests. Disabled when no
    /// stream secret is configured.
    async fn authorize_signature(&self, req: &Request, res: &mut Response) -> bool {
        if self.config.rtsp.stream_secret.is_empty() {
            return true;
        }
        match auth::check_url_signature(&req.url, &req.method, &self.config.rtsp.stream_secret) {
            SignatureOutcome::Authorized => true,
            SignatureOutcome::Expired => {
                res.set_status(403, "Forbidden");
                let mut state = self.state.lock().await;
                self.issue_challenge(&mut state, res);
                false
            }
            SignatureOutcome::Invalid => {
                res.set_status(401, "Unauthorized");
                let mut state = self.state.lock().await;
                self.issue_challenge(&mut state, res);
                false
            }
        }
    }

    async fn handle_request(self: &Arc<Self>, req: Request) {
        log::debug!("{self} <<<\n{req}");
        let mut res = Response::new(200, "OK", req.cseq(), &self.id);

        if self.authorize(&req, &mut res).await {
            match req.method.as_str() {
                "OPTIONS" => {
                    res.set_header("Public", PUBLIC_METHODS);
                }
                "ANNOUNCE" => self.handle_announce(&req, &mut res).await,
                "DESCRIBE" => self.handle_describe(&req, &mut res).await,
                "SETUP" => self.handle_setup(&req, &mut res).await,
                "PLAY" => {
                    if self.state.lock().await.pusher.is_none() {
                        res.set_status(500, "Error Status");
                    } else if let Some(range) = req.header("Range") {
                        res.set_header("Range", range);
                    }
                }
                "RECORD" => {
                    if self.state.lock().await.pusher.is_none() {
                        res.set_status(500, "Error Status");
                    }
                }
                "PAUSE" => {
                    let state = self.state.lock().await;
                    match &state.player {
                        Some(player) => player.pause(true),
                        None => res.set_status(500, "Error Status"),
                    }
                }
                "TEARDOWN" => {}
                _ => {
                    res.set_status(405, "Method Not Allowed");
                }
            }
        }

        log::debug!("{self} >>>\n{res}");
        let wire = res.to_string();
        {
            let mut writer = self.writer.lock().await;
            if writer.write_all(wire.as_bytes()).await.is_err() || writer.flush().await.is_err() {
                self.stop().await;
                return;
            }
        }
        self.out_bytes.fetch_add(wire.len(), Ordering::Relaxed);

        if res.status == 200 {
            match req.method.as_str() {
                "PLAY" | "RECORD" => {
                    let (pusher, player) = {
                        let state = self.state.lock().await;
                        (state.pusher.clone(), state.player.clone())
                    };
                    if let (Some(pusher), Some(player)) = (pusher, player) {
                        if pusher.has_player(player.id()).await {
                            player.pause(false);
                        } else if let Err(err) =
                            pusher.add_player(player as Arc<dyn Player>).await
                        {
                            log::error!("{self} attach player: {err}");
                        }
                    }
                }
                "TEARDOWN" => {
                    self.stop().await;
                    return;
                }
                _ => {}
            }
        }

        if res.status >= 500 {
            log::error!("{self} responded {}; stopping", res.status);
            self.stop().await;
        }
    }

    async fn handle_announce(self: &Arc<Self>, req: &Request, res: &mut Response) {
        if !self.authorize_signature(req, res).await {
            return;
        }
        let url = match Url::parse(&req.url) {
            Ok(url) => url,
            Err(_) => {
                res.set_status(500, "Invalid URL");
                return;
            }
        };
        if req.body.is_empty() {
            res.set_status(400, "Bad Request");
            return;
        }
        let sdp = match SdpSession::parse(&req.body) {
            Ok(sdp) => sdp,
            Err(_) => {
                res.set_status(400, "Bad Request");
                return;
            }
        };

        {
            let mut state = self.state.lock().await;
            state.role = Some(SessionRole::Pusher);
            state.url = req.url.clone();
            state.path = url.path().to_owned();

            for media in &sdp.medias {
                match media.kind {
                    MediaKind::Video => {
                        state.v_control = media.control.clone();
                        state.v_codec = media.codec.clone();
                        log::info!("{self} video codec[{}]", state.v_codec);
                    }
                    MediaKind::Audio => {
                        if state.audio_media_count >= 2 {
                            log::warn!("{self} more than 2 audio channels, ignoring extra");
                            continue;
                        }
                        state.a_control.push(media.control.clone());
                        state.a_codec.push(media.codec.clone());
                        log::info!("{self} audio codec[{}]", media.codec);
                        state.audio_media_count += 1;
                    }
                }
            }
            state.sdp = Some(sdp);
        }

        let pusher = LivePusher::from_session(Arc::clone(self), Arc::clone(&self.config)).await;
        let added = self
            .server
            .add_pusher(Arc::clone(&pusher) as Arc<dyn Pusher>, self.config.rtsp.close_old)
            .await;
        if !added {
            log::info!("reject pusher[{}]", pusher.id());
            res.set_status(406, "Not Acceptable");
            return;
        }
        self.state.lock().await.pusher = Some(pusher);
    }

    async fn handle_describe(self: &Arc<Self>, req: &Request, res: &mut Response) {
        if !self.authorize_signature(req, res).await {
            return;
        }
        let url = match Url::parse(&req.url) {
            Ok(url) => url,
            Err(_) => {
                res.set_status(500, "Invalid URL");
                return;
            }
        };
        let path = url.path().to_owned();
        {
            let mut state = self.state.lock().await;
            state.role = Some(SessionRole::Player);
            state.url = req.url.clone();
            state.path = path.clone();
        }

        let pusher = match self
            .server
            .get_pusher(&path, Some(Arc::clone(self)))
            .await
        {
            Some(pusher) => pusher,
            None => {
                res.set_status(404, "NOT FOUND");
                return;
            }
        };

        let player = SessionPlayer::new(Arc::clone(self), Arc::clone(&pusher)).await;
        {
            let mut state = self.state.lock().await;
            state.a_control = pusher.a_control();
            state.v_control = pusher.v_control();
            state.a_codec = pusher.a_codec();
            state.v_codec = pusher.v_codec();
            state.player = Some(player);
            state.pusher = Some(Arc::clone(&pusher));
        }
        // Players may stall between requests while buffering; rely on
        // socket errors instead of the control deadline from here on.
        self.timeout_millis.store(0, Ordering::Relaxed);

        res.set_header("Content-Type", "application/sdp");
        res.set_body(pusher.sdp_raw());
    }

    async fn handle_setup(self: &Arc<Self>, req: &Request, res: &mut Response) {
        let transport = match req.header("Transport") {
            Some(transport) if !transport.is_empty() => transport.to_owned(),
            _ => {
                res.set_status(400, "Bad Request");
                return;
            }
        };

        let setup_path = match normalize_control_url(&req.url) {
            Some(path) => path,
            None => {
                res.set_status(500, "Invalid URL");
                return;
            }
        };

        let (role, v_path, a_paths) = {
            let state = self.state.lock().await;
            if state.pusher.is_none() {
                // SETUP without a preceding ANNOUNCE or DESCRIBE.
                res.set_status(500, "Error Status");
                return;
            }
            let v_path = match resolve_control(&state.v_control) {
                Some(path) => path,
                None => {
                    res.set_status(500, "Invalid VControl");
                    return;
                }
            };
            let mut a_paths = Vec::new();
            for control in &state.a_control {
                match resolve_control(control) {
                    Some(path) => a_paths.push(path),
                    None => {
                        res.set_status(500, "Invalid AControl");
                        return;
                    }
                }
            }
            (state.role.unwrap_or(SessionRole::Unknown), v_path, a_paths)
        };

        let matched_audio = a_paths
            .iter()
            .position(|a_path| control_matches(&setup_path, a_path));
        let matched_video = control_matches(&setup_path, &v_path);

        if let Some(captures) = INTERLEAVED_RE.captures(&transport) {
            self.set_trans_type(TransType::Tcp);
            let rtp = capture_int(&captures, 1);
            let control = capture_int(&captures, 3);

            if let Some(_slot) = matched_audio {
                let channel = {
                    let mut state = self.state.lock().await;
                    let channel = state.audio_setup_count;
                    state.audio_setup_count += 1;
                    channel
                };
                self.assign_channel(RtpKind::Audio, channel as u8, rtp, control);
            } else if matched_video {
                self.assign_channel(RtpKind::Video, 0, rtp, control);
            } else {
                res.set_status(500, format!("SETUP [TCP] got unknown control:{setup_path}"));
                log::error!("{self} SETUP [TCP] got unknown control:{setup_path}");
                return;
            }
            res.set_header("Transport", transport);
        } else if let Some(captures) = CLIENT_PORT_RE.captures(&transport) {
            self.set_trans_type(TransType::Udp);
            // Pure-UDP data flow; the control connection idles legally.
            self.timeout_millis.store(0, Ordering::Relaxed);
            let rtp_port = capture_int(&captures, 1) as u16;
            let control_port = capture_int(&captures, 3) as u16;

            let result = self
                .setup_udp(
                    role,
                    matched_audio,
                    matched_video,
                    rtp_port,
                    control_port,
                    &transport,
                    &setup_path,
                )
                .await;
            match result {
                Ok(transport_out) => res.set_header("Transport", transport_out),
                Err(err) => {
                    res.set_status(500, format!("udp setup error, {err}"));
                }
            }
        } else {
            res.set_status(400, "Bad Request");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn setup_udp(
        self: &Arc<Self>,
        role: SessionRole,
        matched_audio: Option<usize>,
        matched_video: bool,
        rtp_port: u16,
        control_port: u16,
        transport: &str,
        setup_path: &str,
    ) -> Result<String> {
        let mut transport_out = transport.to_owned();
        match role {
            SessionRole::Player => {
                let client = {
                    let mut state = self.state.lock().await;
                    if state.udp_client.is_none() {
                        state.udp_client = Some(Arc::new(UdpClient::new(
                            self.remote_addr.ip(),
                            self.config.rtsp.network_buffer,
                        )));
                    }
                    state.udp_client.clone().ok_or(Error::ErrSessionStopped)?
                };
                if matched_audio.is_some() {
                    let channel = {
                        let mut state = self.state.lock().await;
                        let channel = state.audio_setup_count;
                        state.audio_setup_count += 1;
                        channel
                    };
                    client
                        .setup_audio(channel as u8, rtp_port, control_port)
                        .await?;
                } else if matched_video {
                    client.setup_video(rtp_port, control_port).await?;
                } else {
                    log::error!("{self} SETUP [UDP] got unknown control:{setup_path}");
                    return Err(Error::ErrOthers(format!(
                        "unknown control:{setup_path}"
                    )));
                }
            }
            SessionRole::Pusher => {
                let server = {
                    let mut state = self.state.lock().await;
                    if state.udp_server.is_none() {
                        state.udp_server = Some(Arc::new(UdpServer::new(
                            self.rtp_sink(),
                            Arc::clone(&self.in_bytes),
                            self.config.rtsp.network_buffer,
                        )));
                    }
                    state.udp_server.clone().ok_or(Error::ErrSessionStopped)?
                };
                let ports = if matched_audio.is_some() {
                    let channel = {
                        let mut state = self.state.lock().await;
                        let channel = state.audio_setup_count;
                        state.audio_setup_count += 1;
                        channel
                    };
                    Some(server.setup_audio(channel as u8).await?)
                } else if matched_video {
                    Some(server.setup_video().await?)
                } else {
                    log::error!("{self} SETUP [UDP] got unknown control:{setup_path}");
                    return Err(Error::ErrOthers(format!(
                        "unknown control:{setup_path}"
                    )));
                };
                if let Some((rtp, control)) = ports {
                    transport_out = format!("{transport_out};server_port={rtp}-{control}");
                }
            }
            SessionRole::Unknown => {
                return Err(Error::ErrOthers("unknown session role".to_owned()));
            }
        }
        Ok(transport_out)
    }

    /// Egress for a playing session: UDP leg or interleaved frame under
    /// the per-session write lock.
    pub async fn send_rtp(&self, pack: &RtpPack) -> Result<()> {
        if self.trans_type() == TransType::Udp {
            let client = {
                let state = self.state.lock().await;
                state.udp_client.clone()
            };
            let client = client.ok_or(Error::ErrSessionStopped)?;
            let sent = client.send_rtp(pack).await?;
            self.out_bytes.fetch_add(sent, Ordering::Relaxed);
            return Ok(());
        }

        let channel =
            self.channels.load()[(pack.kind as usize) << 1 | pack.channel as usize];
        if channel < 0 {
            // Media the player chose not to set up.
            return Ok(());
        }

        let length = pack.buffer.len();
        let header = [
            INTERLEAVED_MAGIC,
            channel as u8,
            (length >> 8) as u8,
            length as u8,
        ];
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&header).await?;
            writer.write_all(&pack.buffer).await?;
            writer.flush().await?;
        }
        self.out_bytes.fetch_add(length + 4, Ordering::Relaxed);
        Ok(())
    }
}

fn capture_int(captures: &regex::Captures<'_>, index: usize) -> i32 {
    captures
        .get(index)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(-1)
}

/// Absolute URLs get a default port; everything else is used verbatim.
fn resolve_control(control: &str) -> Option<String> {
    if control.to_ascii_lowercase().starts_with("rtsp://") {
        let url = normalize_control_url(control)?;
        Some(url)
    } else {
        Some(control.to_owned())
    }
}

fn normalize_control_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw).ok()?;
    if url.port().is_none() {
        url.set_port(Some(554)).ok()?;
    }
    Some(url.to_string())
}

/// A SETUP URL selects a media slot when it equals the control attribute
/// or ends with it.
fn control_matches(setup_path: &str, control: &str) -> bool {
    if control.is_empty() {
        return false;
    }
    setup_path == control || setup_path.ends_with(control)
}
