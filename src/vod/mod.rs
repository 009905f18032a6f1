//! VOD replay: the inverse of the recorder.
//!
//! A `/vod/<taskID>/<execID>/<startSec>/<vodID>` path materializes a
//! synthetic pusher that reads recorded blocks, re-emits their RTP records
//! paced by the original timestamps, and fans out to players exactly like
//! a live pusher.

#[cfg(test)]
mod vod_test;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use waitgroup::WaitGroup;

use crate::error::{Error, Result};
use crate::player::Player;
use crate::pusher::{PlayerMap, Pusher, PusherMode};
use crate::record::block::{AlignedBuf, BLOCK_HEADER_LEN};
use crate::record::RecordService;
use crate::rtp::clock::RtpClock;
use crate::rtp::header::RtpHeader;
use crate::rtp::record::deserialize_from_record;
use crate::rtp::{RtpKind, RtpPack};
use crate::sdp::{MediaKind, SdpSession};
use crate::server::{GetPusherHook, Server};
use crate::session::Session;
use crate::shutdown::{ShutdownChain, StopHandler};
use crate::transport::TransType;

/// Video pacing clock rate.
const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Pre-roll granted before pacing starts gating.
const PACING_PREROLL: Duration = Duration::from_millis(500);

/// Pacing wakeup period while a packet waits for its send boundary.
const PACING_TICK: Duration = Duration::from_millis(40);

/// How long the reader waits at the tail for the recorder to produce the
/// next block.
const TAIL_RETRY: Duration = Duration::from_millis(500);

pub struct VodPusher {
    id: String,
    path: String,
    task_id: String,
    execute_id: u64,
    start_block_id: u64,
    service: Arc<RecordService>,

    sdp_raw: String,
    v_codec: String,
    a_codec: Vec<String>,
    v_control: String,
    a_control: Vec<String>,

    /// Trick-play knob: positive shifts the permitted-send boundary left
    /// (faster), negative right (slower).
    scale: AtomicI32,
    start_at: DateTime<Utc>,
    out_bytes: AtomicUsize,

    players: ArcSwap<PlayerMap>,
    players_lock: Mutex<()>,

    queue_tx: mpsc::Sender<Arc<RtpPack>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Arc<RtpPack>>>>,
    block_tx: mpsc::Sender<AlignedBuf>,
    block_rx: Mutex<Option<mpsc::Receiver<AlignedBuf>>>,

    closed_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    wg: Mutex<Option<WaitGroup>>,
    shutdown: ShutdownChain,
}

impl VodPusher {
    pub async fn new(
        server: &Arc<Server>,
        service: Arc<RecordService>,
        id: String,
        path: String,
        task_id: String,
        execute_id: u64,
        start_block_id: u64,
    ) -> Result<Arc<VodPusher>> {
        let execute = service.db().get_execute(&task_id, execute_id)?;
        let sdp = SdpSession::parse(&execute.sdp_raw).map_err(|err| {
            log::error!("vod[{id}] sdp: {err}");
            Error::ErrSdpMalformed
        })?;

        let mut v_codec = String::new();
        let mut v_control = String::new();
        let mut a_codec = Vec::new();
        let mut a_control = Vec::new();
        for media in &sdp.medias {
            match media.kind {
                MediaKind::Video => {
                    v_control = media.control.clone();
                    v_codec = media.codec.clone();
                }
                MediaKind::Audio => {
                    if a_codec.len() >= 2 {
                        log::warn!("vod[{id}] more than 2 audio channels, ignoring extra");
                        continue;
                    }
                    a_control.push(media.control.clone());
                    a_codec.push(media.codec.clone());
                }
            }
        }

        let queue_len = server.config().player.send_queue_length;
        let (queue_tx, queue_rx) = mpsc::channel(queue_len);
        let (block_tx, block_rx) = mpsc::channel(1);

        let vod = Arc::new(VodPusher {
            id,
            path,
            task_id,
            execute_id,
            start_block_id,
            service,
            sdp_raw: execute.sdp_raw,
            v_codec,
            a_codec,
            v_control,
            a_control,
            scale: AtomicI32::new(0),
            start_at: Utc::now(),
            out_bytes: AtomicUsize::new(0),
            players: ArcSwap::from_pointee(PlayerMap::new()),
            players_lock: Mutex::new(()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            block_tx,
            block_rx: Mutex::new(Some(block_rx)),
            closed_tx: watch::channel(false).0,
            stopped: AtomicBool::new(false),
            wg: Mutex::new(Some(WaitGroup::new())),
            shutdown: ShutdownChain::new(),
        });

        let deregister = Arc::clone(&vod);
        let server = Arc::clone(server);
        vod.shutdown
            .add(Box::new(move || {
                Box::pin(async move {
                    server.remove_pusher(&deregister.id).await;
                })
            }))
            .await;

        Ok(vod)
    }

    pub fn set_scale(&self, scale: i32) {
        self.scale.store(scale, Ordering::Relaxed);
    }

    /// Stop once the audience is gone.
    pub async fn stop_if_no_players(&self) {
        if self.players.load().is_empty() {
            self.stop().await;
        }
    }

    async fn read_block_loop(self: Arc<Self>, worker: Option<waitgroup::Worker>) {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut block_id = self.start_block_id;
        loop {
            let meta = match self
                .service
                .db()
                .get_block(&self.task_id, self.execute_id, block_id)
            {
                Ok(meta) => meta,
                Err(_) => {
                    // The recorder may still be ahead of us; wait at the
                    // tail instead of ending the replay.
                    tokio::select! {
                        _ = closed_rx.changed() => break,
                        _ = tokio::time::sleep(TAIL_RETRY) => continue,
                    }
                }
            };

            let data = match self.service.storage().read_block(&meta).await {
                Ok(data) => data,
                Err(err) => {
                    log::error!("vod[{}] read block {block_id}: {err}", self.id);
                    break;
                }
            };
            log::info!(
                "vod[{}] read block task[{}] execute[{}] block[{block_id}]",
                self.id,
                self.task_id,
                self.execute_id
            );

            tokio::select! {
                _ = closed_rx.changed() => break,
                sent = self.block_tx.send(data) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            block_id += 1;
        }
        drop(worker);
        log::debug!("vod[{}] read loop exit", self.id);
    }

    fn scaled(&self, elapsed: Duration) -> Duration {
        let scale = self.scale.load(Ordering::Relaxed);
        if scale >= 0 {
            Duration::from_nanos((elapsed.as_nanos() << scale.min(16) as u32) as u64)
        } else {
            Duration::from_nanos((elapsed.as_nanos() >> (-scale).min(16) as u32) as u64)
        }
    }

    async fn send_control_loop(self: Arc<Self>, worker: Option<waitgroup::Worker>) {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut block_rx = match self.block_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        let base_start = Instant::now();
        let mut base_duration = PACING_PREROLL;
        let mut clock: Option<RtpClock> = None;
        let mut ticker = tokio::time::interval(PACING_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'blocks: loop {
            let data = tokio::select! {
                _ = closed_rx.changed() => break,
                data = block_rx.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            let used = (data.len() as u32).min(u32::from_le_bytes([
                data[0], data[1], data[2], data[3],
            ])) as usize;
            let mut payload = &data[BLOCK_HEADER_LEN.min(used)..used];

            while !payload.is_empty() {
                let (pack, consumed) = match deserialize_from_record(payload) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        log::error!("vod[{}] decode record: {err}", self.id);
                        break;
                    }
                };
                payload = &payload[consumed..];

                let header = match RtpHeader::parse(&pack.buffer) {
                    Some(header) => header,
                    None => {
                        log::warn!("vod[{}] unparsable rtp in block", self.id);
                        continue;
                    }
                };

                // Audio and control ride the video clock ungated.
                if pack.kind != RtpKind::Video {
                    self.queue_rtp(Arc::new(pack));
                    continue;
                }

                let clock = clock
                    .get_or_insert_with(|| RtpClock::new(VIDEO_CLOCK_RATE, header.timestamp));
                let send_duration = clock.elapsed(header.timestamp);
                while send_duration > base_duration {
                    tokio::select! {
                        _ = closed_rx.changed() => break 'blocks,
                        _ = ticker.tick() => {
                            base_duration = self.scaled(base_start.elapsed());
                        }
                    }
                }
                self.queue_rtp(Arc::new(pack));
            }
            self.service.storage().pool().recycle(data);
        }
        drop(worker);
        log::debug!("vod[{}] send control loop exit", self.id);
    }

    async fn broadcast_loop(self: Arc<Self>, worker: Option<waitgroup::Worker>) {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut queue_rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        loop {
            let pack = tokio::select! {
                _ = closed_rx.changed() => break,
                pack = queue_rx.recv() => match pack {
                    Some(pack) => pack,
                    None => break,
                },
            };
            let players = self.players.load();
            for player in players.values() {
                player.queue_rtp(Arc::clone(&pack));
                self.out_bytes.fetch_add(pack.len(), Ordering::Relaxed);
            }
        }
        drop(worker);
        log::debug!("vod[{}] broadcast loop exit", self.id);
    }
}

#[async_trait]
impl Pusher for VodPusher {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn source(&self) -> String {
        format!("record://{}/{}", self.task_id, self.execute_id)
    }

    fn trans_type(&self) -> TransType {
        TransType::Internal
    }

    fn mode(&self) -> PusherMode {
        PusherMode::Vod
    }

    fn in_bytes(&self) -> usize {
        0
    }

    fn out_bytes(&self) -> usize {
        self.out_bytes.load(Ordering::Relaxed)
    }

    fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    fn sdp_raw(&self) -> String {
        self.sdp_raw.clone()
    }

    fn v_codec(&self) -> String {
        self.v_codec.clone()
    }

    fn a_codec(&self) -> Vec<String> {
        self.a_codec.clone()
    }

    fn v_control(&self) -> String {
        self.v_control.clone()
    }

    fn a_control(&self) -> Vec<String> {
        self.a_control.clone()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn queue_rtp(&self, pack: Arc<RtpPack>) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.queue_tx.try_send(pack) {
            log::warn!("vod[{}] drop packet", self.id);
        }
    }

    /// Run the three replay loops; the registry spawns this on install.
    async fn start(self: Arc<Self>) {
        let workers = {
            let wg = self.wg.lock().await;
            wg.as_ref().map(|wg| (wg.worker(), wg.worker(), wg.worker()))
        };
        let (read_worker, send_worker, broadcast_worker) = match workers {
            Some(workers) => workers,
            None => return,
        };

        tokio::spawn(Arc::clone(&self).read_block_loop(Some(read_worker)));
        tokio::spawn(Arc::clone(&self).send_control_loop(Some(send_worker)));
        self.broadcast_loop(Some(broadcast_worker)).await;
    }

    /// Stop sequence: signal the loops, join them, then deregister.
    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.closed_tx.send(true);
        let wg = self.wg.lock().await.take();
        if let Some(wg) = wg {
            wg.wait().await;
        }
        log::debug!("vod[{}] all loops closed", self.id);
        self.shutdown.stop().await;
    }

    async fn add_on_stop(&self, handler: StopHandler) {
        self.shutdown.add(handler).await;
    }

    async fn add_player(&self, player: Arc<dyn Player>) -> Result<()> {
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

    /// Removing the last player stops the replay.
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
        log::info!("vod[{}] player {id} end, left[{remaining}]", self.id);
        if remaining == 0 {
            self.stop().await;
        }
    }

    async fn has_player(&self, id: &str) -> bool {
        self.players.load().contains_key(id)
    }

    fn players(&self) -> Arc<PlayerMap> {
        self.players.load_full()
    }
}

/// Parse `/vod/<taskID>/<execID>/<startSec>/<vodID>`.
fn parse_vod_path(path: &str) -> Option<(String, u64, i64, String)> {
    let mut parts = path.split('/');
    let _empty = parts.next()?;
    if parts.next()? != "vod" {
        return None;
    }
    let task_id = parts.next()?.to_owned();
    let execute_id = parts.next()?.parse().ok()?;
    let start_time = parts.next()?.parse().ok()?;
    let vod_id = parts.next()?.to_owned();
    if task_id.is_empty() || vod_id.is_empty() {
        return None;
    }
    Some((task_id, execute_id, start_time, vod_id))
}

async fn get_vod(
    server: Arc<Server>,
    session: Option<Arc<Session>>,
    path: String,
    pusher: Option<Arc<dyn Pusher>>,
) -> Option<Arc<dyn Pusher>> {
    if pusher.is_some() {
        return pusher;
    }
    // A VOD must bind its first session for lifecycle.
    let session = session?;
    let (task_id, execute_id, start_time, vod_id) = parse_vod_path(&path)?;
    let service = Arc::clone(server.record()?);

    let start_block = match service
        .db()
        .get_block_by_time(&task_id, execute_id, start_time)
    {
        Ok(meta) => meta,
        Err(err) => {
            log::error!("vod get start block: {err}");
            return None;
        }
    };

    let vod = match VodPusher::new(
        &server,
        service,
        vod_id,
        path.clone(),
        task_id,
        execute_id,
        start_block.id,
    )
    .await
    {
        Ok(vod) => vod,
        Err(err) => {
            log::error!("vod new: {err}");
            return None;
        }
    };

    if server
        .add_pusher(Arc::clone(&vod) as Arc<dyn Pusher>, false)
        .await
    {
        let guard = Arc::clone(&vod);
        session
            .add_stop_handler(Box::new(move || {
                Box::pin(async move {
                    guard.stop_if_no_players().await;
                })
            }))
            .await;
        Some(vod)
    } else {
        // A same-path VOD may have won the race; serve that one.
        server.pushers().get(&path).cloned()
    }
}

/// Install the VOD hook on the server's GetPusher chain.
pub fn register_hook(server: &Arc<Server>) {
    let hook: GetPusherHook = Arc::new(|server, session, path, pusher| {
        Box::pin(get_vod(server, session, path, pusher))
    });
    server.register_get_pusher_hook(hook);
}
