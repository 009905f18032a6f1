use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

use crate::client::RtspClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::player::Player;
use crate::rtp::sequence::SequenceStart;
use crate::rtp::{RtpKind, RtpPack};
use crate::session::Session;
use crate::shutdown::StopHandler;
use crate::transport::TransType;

/// Where a pusher's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PusherMode {
    /// A camera or encoder announced and records to us.
    Push,
    /// We dialed a remote source and pull from it.
    Pull,
    /// Synthetic replay of recorded blocks.
    Vod,
}

impl fmt::Display for PusherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PusherMode::Push => "push",
            PusherMode::Pull => "pull",
            PusherMode::Vod => "vod",
        };
        write!(f, "{s}")
    }
}

pub type PlayerMap = HashMap<String, Arc<dyn Player>>;

/// Upper bound on cached GOP packets. A stream that never produces a key
/// frame would otherwise grow the cache without limit; past the bound the
/// stale cache is discarded wholesale.
const GOP_CACHE_MAX: usize = 2048;

/// A media publisher: one per path, broadcasting every received packet to
/// its attached players.
#[async_trait]
pub trait Pusher: Send + Sync {
    fn id(&self) -> String;
    fn path(&self) -> String;
    fn source(&self) -> String;
    fn trans_type(&self) -> TransType;
    fn mode(&self) -> PusherMode;
    fn in_bytes(&self) -> usize;
    fn out_bytes(&self) -> usize;
    fn start_at(&self) -> DateTime<Utc>;
    fn sdp_raw(&self) -> String;
    fn v_codec(&self) -> String;
    fn a_codec(&self) -> Vec<String>;
    fn v_control(&self) -> String;
    fn a_control(&self) -> Vec<String>;
    fn is_stopped(&self) -> bool;

    /// Non-blocking enqueue into the broadcast loop.
    fn queue_rtp(&self, pack: Arc<RtpPack>);

    /// The broadcast loop. Spawned by the registry when the pusher is
    /// installed.
    async fn start(self: Arc<Self>);

    async fn stop(&self);
    async fn add_on_stop(&self, handler: StopHandler);

    async fn add_player(&self, player: Arc<dyn Player>) -> Result<()>;
    async fn remove_player(&self, id: &str);
    async fn has_player(&self, id: &str) -> bool;

    /// Wait-free snapshot of the attached players.
    fn players(&self) -> Arc<PlayerMap>;
}

enum PusherSource {
    Session(Arc<Session>),
    Client(Arc<RtspClient>),
}

/// A live publisher backed by an announcing session or a pulling client.
pub struct LivePusher {
    id: String,
    path: String,
    source_url: String,
    sdp_raw: String,
    v_codec: String,
    a_codec: Vec<String>,
    v_control: String,
    a_control: Vec<String>,
    source: PusherSource,

    players: ArcSwap<PlayerMap>,
    /// Serializes map writers; readers go through the snapshot.
    players_lock: Mutex<()>,

    gop_cache_enable: bool,
    gop_cache: RwLock<Vec<Arc<RtpPack>>>,
    sequence: StdMutex<SequenceStart>,

    queue_tx: mpsc::Sender<Arc<RtpPack>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Arc<RtpPack>>>>,
    stop_notify: Arc<Notify>,
}

impl LivePusher {
    /// Build a pusher over an announcing session, wire its RTP handler to
    /// the broadcast queue, and arrange teardown on session stop.
    pub async fn from_session(session: Arc<Session>, config: Arc<Config>) -> Arc<LivePusher> {
        let (path, source_url, sdp_raw, v_codec, a_codec, v_control, a_control) = {
            let state = session.state().await;
            (
                state.path.clone(),
                state.url.clone(),
                state
                    .sdp
                    .as_ref()
                    .map(|sdp| sdp.raw.clone())
                    .unwrap_or_default(),
                state.v_codec.clone(),
                state.a_codec.clone(),
                state.v_control.clone(),
                state.a_control.clone(),
            )
        };

        let pusher = Arc::new(LivePusher::build(
            session.id.clone(),
            path,
            source_url,
            sdp_raw,
            v_codec,
            a_codec,
            v_control,
            a_control,
            PusherSource::Session(Arc::clone(&session)),
            &config,
        ));

        let queue = Arc::clone(&pusher);
        session.add_rtp_handler(Arc::new(move |pack| queue.queue_rtp(pack)));

        let cleanup = Arc::clone(&pusher);
        let server = session.server();
        session
            .add_stop_handler(Box::new(move || {
                Box::pin(async move {
                    cleanup.stop_notify.notify_one();
                    cleanup.clear_players().await;
                    server.remove_pusher(&cleanup.id()).await;
                })
            }))
            .await;

        pusher
    }

    /// Build a pusher over a pulling client. The custom path, when set,
    /// overrides the path taken from the source URL. Media details stay
    /// with the client: they only exist once its handshake completes.
    pub async fn from_client(client: Arc<RtspClient>, config: Arc<Config>) -> Arc<LivePusher> {
        let pusher = Arc::new(LivePusher::build(
            client.id.clone(),
            client.path(),
            client.url().to_owned(),
            String::new(),
            String::new(),
            Vec::new(),
            String::new(),
            Vec::new(),
            PusherSource::Client(Arc::clone(&client)),
            &config,
        ));

        let queue = Arc::clone(&pusher);
        client.add_rtp_handler(Arc::new(move |pack| queue.queue_rtp(pack)));

        let cleanup = Arc::clone(&pusher);
        let server = client.server();
        client
            .add_stop_handler(Box::new(move || {
                Box::pin(async move {
                    cleanup.stop_notify.notify_one();
                    cleanup.clear_players().await;
                    server.remove_pusher(&cleanup.id()).await;
                })
            }))
            .await;

        pusher
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: String,
        path: String,
        source_url: String,
        sdp_raw: String,
        v_codec: String,
        a_codec: Vec<String>,
        v_control: String,
        a_control: Vec<String>,
        source: PusherSource,
        config: &Config,
    ) -> LivePusher {
        let (queue_tx, queue_rx) = mpsc::channel(config.player.send_queue_length);
        LivePusher {
            id,
            path,
            source_url,
            sdp_raw,
            v_codec,
            a_codec,
            v_control,
            a_control,
            source,
            players: ArcSwap::from_pointee(PlayerMap::new()),
            players_lock: Mutex::new(()),
            gop_cache_enable: config.rtsp.gop_cache_enable,
            gop_cache: RwLock::new(Vec::new()),
            sequence: StdMutex::new(SequenceStart::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            stop_notify: Arc::new(Notify::new()),
        }
    }

    fn add_out_bytes(&self, n: usize) {
        match &self.source {
            PusherSource::Session(session) => session.add_out_bytes(n),
            PusherSource::Client(client) => client.add_out_bytes(n),
        }
    }

    fn broadcast(&self, pack: &Arc<RtpPack>) {
        let players = self.players.load();
        for player in players.values() {
            player.queue_rtp(Arc::clone(pack));
            self.add_out_bytes(pack.len());
        }
    }

    /// Detach every player and stop them off the broadcast path.
    pub async fn clear_players(&self) {
        let old = {
            let _guard = self.players_lock.lock().await;
            self.players.swap(Arc::new(PlayerMap::new()))
        };
        tokio::spawn(async move {
            for player in old.values() {
                player.stop().await;
            }
        });
    }
}

#[async_trait]
impl Pusher for LivePusher {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn source(&self) -> String {
        self.source_url.clone()
    }

    fn trans_type(&self) -> TransType {
        match &self.source {
            PusherSource::Session(session) => session.trans_type(),
            PusherSource::Client(client) => client.trans_type(),
        }
    }

    fn mode(&self) -> PusherMode {
        match &self.source {
            PusherSource::Session(_) => PusherMode::Push,
            PusherSource::Client(_) => PusherMode::Pull,
        }
    }

    fn in_bytes(&self) -> usize {
        match &self.source {
            PusherSource::Session(session) => session.in_bytes(),
            PusherSource::Client(client) => client.in_bytes(),
        }
    }

    fn out_bytes(&self) -> usize {
        match &self.source {
            PusherSource::Session(session) => session.out_bytes(),
            PusherSource::Client(client) => client.out_bytes(),
        }
    }

    fn start_at(&self) -> DateTime<Utc> {
        match &self.source {
            PusherSource::Session(session) => session.start_at(),
            PusherSource::Client(client) => client.start_at(),
        }
    }

    fn sdp_raw(&self) -> String {
        match &self.source {
            PusherSource::Session(_) => self.sdp_raw.clone(),
            PusherSource::Client(client) => client.sdp_raw(),
        }
    }

    fn v_codec(&self) -> String {
        match &self.source {
            PusherSource::Session(_) => self.v_codec.clone(),
            PusherSource::Client(client) => client.v_codec(),
        }
    }

    fn a_codec(&self) -> Vec<String> {
        match &self.source {
            PusherSource::Session(_) => self.a_codec.clone(),
            PusherSource::Client(client) => client.a_codec(),
        }
    }

    fn v_control(&self) -> String {
        match &self.source {
            PusherSource::Session(_) => self.v_control.clone(),
            PusherSource::Client(client) => client.v_control(),
        }
    }

    fn a_control(&self) -> Vec<String> {
        match &self.source {
            PusherSource::Session(_) => self.a_control.clone(),
            PusherSource::Client(client) => client.a_control(),
        }
    }

    fn is_stopped(&self) -> bool {
        match &self.source {
            PusherSource::Session(session) => session.is_stopped(),
            PusherSource::Client(client) => client.is_stopped(),
        }
    }

    fn queue_rtp(&self, pack: Arc<RtpPack>) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.queue_tx.try_send(pack) {
            log::warn!("pusher[{}] drop packet", self.id);
        }
    }

    async fn start(self: Arc<Self>) {
        let mut queue_rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            let pack = tokio::select! {
                _ = self.stop_notify.notified() => break,
                pack = queue_rx.recv() => match pack {
                    Some(pack) => pack,
                    None => break,
                },
            };

            if self.gop_cache_enable && pack.kind == RtpKind::Video {
                let v_codec = self.v_codec();
                let starts_sequence = {
                    let mut sequence = self.sequence.lock().unwrap();
                    sequence.check(&v_codec, &pack.buffer)
                };
                let mut cache = self.gop_cache.write().await;
                if starts_sequence || cache.len() >= GOP_CACHE_MAX {
                    cache.clear();
                }
                cache.push(Arc::clone(&pack));
            }

            self.broadcast(&pack);
        }
        log::debug!("pusher[{}] broadcast loop exit", self.id);
    }

    async fn stop(&self) {
        match &self.source {
            PusherSource::Session(session) => session.stop().await,
            PusherSource::Client(client) => client.stop().await,
        }
    }

    async fn add_on_stop(&self, handler: StopHandler) {
        match &self.source {
            PusherSource::Session(session) => session.add_stop_handler(handler).await,
            PusherSource::Client(client) => client.add_stop_handler(handler).await,
        }
    }

    /// Attach a player: replay the GOP cache into its queue so it starts
    /// on a key frame, then publish the new player map and spawn its send
    /// loop.
    async fn add_player(&self, player: Arc<dyn Player>) -> Result<()> {
        if self.gop_cache_enable {
            let cache = self.gop_cache.read().await;
            for pack in cache.iter() {
                player.queue_rtp(Arc::clone(pack));
                self.add_out_bytes(pack.len());
            }
        }

        {
            let _guard = self.players_lock.lock().await;
            let players = self.players.load_full();
            if players.contains_key(player.id()) {
                return Err(Error::ErrPlayerExists(player.id().to_owned()));
            }
            let mut next = PlayerMap::clone(&players);
            next.insert(player.id().to_owned(), Arc::clone(&player));
            self.players.store(Arc::new(next));
        }

        tokio::spawn(player.start());
        Ok(())
    }

    async fn remove_player(&self, id: &str) {
        let remaining = {
            let _guard = self.players_lock.lock().await;
            let players = self.players.load_full();
            if !players.contains_key(id) {
                return;
            }
            let mut next = PlayerMap::clone(&players);
            next.remove(id);
            let remaining = next.len();
            self.players.store(Arc::new(next));
            remaining
        };
        log::info!("player {id} end, now player size[{remaining}]");
    }

    async fn has_player(&self, id: &str) -> bool {
        self.players.load().contains_key(id)
    }

    fn players(&self) -> Arc<PlayerMap> {
        self.players.load_full()
    }
}
