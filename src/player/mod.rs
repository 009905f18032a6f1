use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::Config;
use crate::pusher::Pusher;
use crate::rtp::RtpPack;
use crate::session::Session;
use crate::transport::TransType;

/// A media subscriber attached to a pusher.
///
/// The ordinary implementation delivers to an RTSP session; the recorder
/// and the VOD egress implement the same contract.
#[async_trait]
pub trait Player: Send + Sync {
    fn id(&self) -> &str;
    fn path(&self) -> String;
    fn trans_type(&self) -> TransType;
    fn in_bytes(&self) -> usize;
    fn out_bytes(&self) -> usize;
    fn start_at(&self) -> DateTime<Utc>;

    /// Non-blocking enqueue. A full queue drops the packet: producer
    /// timing wins over tail completeness.
    fn queue_rtp(&self, pack: Arc<RtpPack>);

    /// The send loop. Spawned by the pusher when the player is attached.
    async fn start(self: Arc<Self>);

    async fn stop(&self);

    fn pause(&self, _paused: bool) {}
}

/// Player feeding a connected RTSP session, TCP-interleaved or UDP.
pub struct SessionPlayer {
    session: Arc<Session>,
    pusher: Arc<dyn Pusher>,
    queue_tx: mpsc::Sender<Arc<RtpPack>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Arc<RtpPack>>>>,
    paused_tx: watch::Sender<bool>,
    drop_when_paused: bool,
    out_bytes: AtomicUsize,
}

impl SessionPlayer {
    pub async fn new(session: Arc<Session>, pusher: Arc<dyn Pusher>) -> Arc<SessionPlayer> {
        let config: &Config = session.config();
        let (queue_tx, queue_rx) = mpsc::channel(config.player.send_queue_length);
        let (paused_tx, _paused_rx) = watch::channel(false);
        let player = Arc::new(SessionPlayer {
            session: Arc::clone(&session),
            pusher: Arc::clone(&pusher),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            paused_tx,
            drop_when_paused: config.rtsp.drop_packet_when_paused,
            out_bytes: AtomicUsize::new(0),
        });

        // Detach from the pusher when the session goes away; dropping the
        // receiver closes the queue and ends the send loop.
        let detach = Arc::clone(&player);
        session
            .add_stop_handler(Box::new(move || {
                Box::pin(async move {
                    detach.pusher.remove_player(detach.id()).await;
                    detach.queue_rx.lock().await.take();
                })
            }))
            .await;

        player
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

#[async_trait]
impl Player for SessionPlayer {
    fn id(&self) -> &str {
        &self.session.id
    }

    fn path(&self) -> String {
        self.pusher.path()
    }

    fn trans_type(&self) -> TransType {
        self.session.trans_type()
    }

    fn in_bytes(&self) -> usize {
        self.session.in_bytes()
    }

    fn out_bytes(&self) -> usize {
        self.out_bytes.load(Ordering::Relaxed)
    }

    fn start_at(&self) -> DateTime<Utc> {
        self.session.start_at()
    }

    fn queue_rtp(&self, pack: Arc<RtpPack>) {
        if let Err(err) = self.queue_tx.try_send(pack) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    log::warn!("player[{}] queue full, drop packet", self.id());
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    async fn start(self: Arc<Self>) {
        let mut queue_rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut paused_rx = self.paused_tx.subscribe();

        while let Some(pack) = queue_rx.recv().await {
            if *paused_rx.borrow() {
                if self.drop_when_paused {
                    continue;
                }
                // Keep the backlog: wait out the pause before delivering.
                while *paused_rx.borrow() {
                    if paused_rx.changed().await.is_err() {
                        return;
                    }
                }
            }
            if let Err(err) = self.session.send_rtp(&pack).await {
                log::error!("player[{}] send rtp: {err}", self.id());
                self.session.stop().await;
                return;
            }
            self.out_bytes.fetch_add(pack.len() + 4, Ordering::Relaxed);
        }
        log::info!("player[{}] send queue closed, quit send loop", self.id());
    }

    async fn stop(&self) {
        self.session.stop().await;
    }

    fn pause(&self, paused: bool) {
        let _ = self.paused_tx.send(paused);
        if paused && self.drop_when_paused {
            log::info!("player[{}] paused, backlog will be dropped", self.id());
        }
    }
}

/// Convenience used by the control plane: a compact description of an
/// attached player.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlayerInfo {
    pub id: String,
    pub path: String,
    pub trans_type: String,
    pub in_bytes: usize,
    pub out_bytes: usize,
    pub start_at: DateTime<Utc>,
}

pub fn player_info(player: &Arc<dyn Player>) -> PlayerInfo {
    PlayerInfo {
        id: player.id().to_owned(),
        path: player.path(),
        trans_type: player.trans_type().to_string(),
        in_bytes: player.in_bytes(),
        out_bytes: player.out_bytes(),
        start_at: player.start_at(),
    }
}
