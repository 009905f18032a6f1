//! The recorder: a player that packs its stream into storage blocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::player::Player;
use crate::pusher::Pusher;
use crate::record::block::{Block, BLOCK_HEADER_LEN};
use crate::record::index::TaskExecute;
use crate::record::RecordService;
use crate::rtp::record::{record_length, serialize_to_record};
use crate::rtp::RtpPack;
use crate::shutdown::ShutdownChain;
use crate::transport::TransType;
use crate::util::unix_now;

/// The block being filled: buffer plus write cursor.
struct OpenBlock {
    block: Block,
    cursor: usize,
}

pub struct Recorder {
    execute: TaskExecute,
    pusher: Arc<dyn Pusher>,
    service: Arc<RecordService>,
    queue_tx: mpsc::Sender<Arc<RtpPack>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Arc<RtpPack>>>>,
    in_bytes: AtomicUsize,
    out_bytes: AtomicUsize,
    start_at: DateTime<Utc>,
    shutdown: ShutdownChain,
    stop_notify: Notify,
}

impl Recorder {
    pub(crate) async fn new(
        service: Arc<RecordService>,
        execute: TaskExecute,
        pusher: Arc<dyn Pusher>,
    ) -> Arc<Recorder> {
        let (queue_tx, queue_rx) =
            mpsc::channel(service.config().record.receive_queue_length);
        let recorder = Arc::new(Recorder {
            execute,
            pusher: Arc::clone(&pusher),
            service,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            in_bytes: AtomicUsize::new(0),
            out_bytes: AtomicUsize::new(0),
            start_at: Utc::now(),
            shutdown: ShutdownChain::new(),
            stop_notify: Notify::new(),
        });

        let detach = Arc::clone(&recorder);
        recorder
            .shutdown
            .add(Box::new(move || {
                Box::pin(async move {
                    detach.pusher.remove_player(detach.id()).await;
                })
            }))
            .await;

        recorder
    }

    fn alloc_block(&self) -> OpenBlock {
        let data = self.service.storage().pool().acquire();
        OpenBlock {
            block: Block {
                id: 0,
                task_id: self.execute.task_id.clone(),
                execute_id: self.execute.id,
                start_time: unix_now(),
                end_time: 0,
                data,
            },
            cursor: BLOCK_HEADER_LEN,
        }
    }

    /// Seal the block (length prefix, end time, id) and queue it for the
    /// writer. Empty blocks are recycled instead.
    fn close_block(&self, mut open: OpenBlock) {
        if open.cursor <= BLOCK_HEADER_LEN {
            self.service.storage().pool().recycle(open.block.data);
            return;
        }
        open.block.end_time = unix_now();
        open.block.set_payload_len(open.cursor as u32);

        let block_id = match self
            .service
            .db()
            .next_block_id(&self.execute.task_id, self.execute.id)
        {
            Ok(id) => id,
            Err(err) => {
                log::error!("recorder[{}] block id: {err}", self.id());
                self.service.storage().pool().recycle(open.block.data);
                return;
            }
        };
        open.block.id = block_id;
        log::debug!(
            "recorder[{}] block full len[{}]",
            self.id(),
            open.cursor
        );
        self.service.storage().insert_block(open.block);
    }

    fn handle_pack(&self, open: &mut Option<OpenBlock>, pack: &RtpPack) {
        let block_size = self.service.storage().pool().block_size();
        loop {
            let current = open.get_or_insert_with(|| self.alloc_block());
            if record_length(pack) + current.cursor <= block_size {
                let mut buf = Vec::with_capacity(record_length(pack));
                serialize_to_record(pack, &mut buf);
                current.block.data[current.cursor..current.cursor + buf.len()]
                    .copy_from_slice(&buf);
                current.cursor += buf.len();
                return;
            }
            // Block full: seal it and retry into a fresh one.
            if let Some(full) = open.take() {
                self.close_block(full);
            }
        }
    }
}

#[async_trait]
impl Player for Recorder {
    fn id(&self) -> &str {
        &self.execute.task_id
    }

    fn path(&self) -> String {
        self.pusher.path()
    }

    fn trans_type(&self) -> TransType {
        TransType::Internal
    }

    fn in_bytes(&self) -> usize {
        self.in_bytes.load(Ordering::Relaxed)
    }

    fn out_bytes(&self) -> usize {
        self.out_bytes.load(Ordering::Relaxed)
    }

    fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    fn queue_rtp(&self, pack: Arc<RtpPack>) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.queue_tx.try_send(pack) {
            if !self.shutdown.is_stopped() {
                log::warn!("recorder[{}] queue full, drop packet", self.id());
            }
        }
    }

    async fn start(self: Arc<Self>) {
        let mut queue_rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut open: Option<OpenBlock> = None;

        loop {
            let pack = tokio::select! {
                _ = self.stop_notify.notified() => break,
                pack = queue_rx.recv() => match pack {
                    Some(pack) => pack,
                    None => break,
                },
            };
            self.out_bytes.fetch_add(pack.len(), Ordering::Relaxed);
            self.handle_pack(&mut open, &pack);
        }

        // Drain whatever is still queued, then flush the partial block.
        while let Ok(pack) = queue_rx.try_recv() {
            self.handle_pack(&mut open, &pack);
        }
        if let Some(last) = open.take() {
            self.close_block(last);
        }
        log::info!("recorder[{}] quit receive loop", self.id());
    }

    async fn stop(&self) {
        if !self.shutdown.stop().await {
            return;
        }
        log::info!("recorder[{}] stop", self.id());
        self.stop_notify.notify_one();
    }
}
