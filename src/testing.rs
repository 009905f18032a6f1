//! In-process fakes shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::player::Player;
use crate::pusher::{PlayerMap, Pusher, PusherMode};
use crate::rtp::RtpPack;
use crate::shutdown::StopHandler;
use crate::transport::TransType;

/// A pusher with no media source behind it.
pub(crate) struct TestPusher {
    id: String,
    path: String,
    sdp_raw: String,
    players: ArcSwap<PlayerMap>,
    players_lock: Mutex<()>,
    stopped: AtomicBool,
    start_at: DateTime<Utc>,
}

impl TestPusher {
    pub(crate) fn new(id: &str, path: &str) -> Arc<TestPusher> {
        Arc::new(TestPusher {
            id: id.to_owned(),
            path: path.to_owned(),
            sdp_raw: "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:streamid=0\r\n".to_owned(),
            players: ArcSwap::from_pointee(PlayerMap::new()),
            players_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
            start_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Pusher for TestPusher {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn source(&self) -> String {
        format!("test://{}", self.path)
    }

    fn trans_type(&self) -> TransType {
        TransType::Internal
    }

    fn mode(&self) -> PusherMode {
        PusherMode::Push
    }

    fn in_bytes(&self) -> usize {
        0
    }

    fn out_bytes(&self) -> usize {
        0
    }

    fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    fn sdp_raw(&self) -> String {
        self.sdp_raw.clone()
    }

    fn v_codec(&self) -> String {
        "H264".to_owned()
    }

    fn a_codec(&self) -> Vec<String> {
        Vec::new()
    }

    fn v_control(&self) -> String {
        "streamid=0".to_owned()
    }

    fn a_control(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn queue_rtp(&self, pack: Arc<RtpPack>) {
        let players = self.players.load();
        for player in players.values() {
            player.queue_rtp(Arc::clone(&pack));
        }
    }

    async fn start(self: Arc<Self>) {}

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn add_on_stop(&self, _handler: StopHandler) {}

    async fn add_player(&self, player: Arc<dyn Player>) -> Result<()> {
        let _guard = self.players_lock.lock().await;
        let players = self.players.load_full();
        if players.contains_key(player.id()) {
            return Err(Error::ErrPlayerExists(player.id().to_owned()));
        }
        let mut next = PlayerMap::clone(&players);
        next.insert(player.id().to_owned(), Arc::clone(&player));
        self.players.store(Arc::new(next));
        tokio::spawn(player.start());
        Ok(())
    }

    async fn remove_player(&self, id: &str) {
        let _guard = self.players_lock.lock().await;
        let players = self.players.load_full();
        let mut next = PlayerMap::clone(&players);
        next.remove(id);
        self.players.store(Arc::new(next));
    }

    async fn has_player(&self, id: &str) -> bool {
        self.players.load().contains_key(id)
    }

    fn players(&self) -> Arc<PlayerMap> {
        self.players.load_full()
    }
}

/// A player that appends everything it receives to a shared vector.
pub(crate) struct TestPlayer {
    id: String,
    pub(crate) received: Arc<StdMutex<Vec<Arc<RtpPack>>>>,
    queue_tx: mpsc::Sender<Arc<RtpPack>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Arc<RtpPack>>>>,
    dropped: AtomicUsize,
    start_at: DateTime<Utc>,
}

impl TestPlayer {
    pub(crate) fn new(id: &str) -> Arc<TestPlayer> {
        let (queue_tx, queue_rx) = mpsc::channel(64);
        Arc::new(TestPlayer {
            id: id.to_owned(),
            received: Arc::new(StdMutex::new(Vec::new())),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            dropped: AtomicUsize::new(0),
            start_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Player for TestPlayer {
    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> String {
        "/test".to_owned()
    }

    fn trans_type(&self) -> TransType {
        TransType::Internal
    }

    fn in_bytes(&self) -> usize {
        0
    }

    fn out_bytes(&self) -> usize {
        0
    }

    fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    fn queue_rtp(&self, pack: Arc<RtpPack>) {
        if self.queue_tx.try_send(pack).is_err() {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn start(self: Arc<Self>) {
        let mut queue_rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        while let Some(pack) = queue_rx.recv().await {
            self.received.lock().unwrap().push(pack);
        }
    }

    async fn stop(&self) {}
}
