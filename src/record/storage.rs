//! The block storage engine: free-space scanning, the single writer task
//! behind a bounded queue, and direct-I/O block reads for replay.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::record::block::{AlignedBuf, Block, BlockPool};
use crate::record::disk::disk_usage;
use crate::record::index::{BlockMeta, RecordDb, INDEX_FILE};

pub struct Storage {
    config: Arc<Config>,
    db: Arc<RecordDb>,
    pool: Arc<BlockPool>,
    write_tx: mpsc::Sender<Block>,
    write_rx: Mutex<Option<mpsc::Receiver<Block>>>,
    path_rx: watch::Receiver<PathBuf>,
}

impl Storage {
    /// Bring the engine up: a first free-space scan (fatal when nothing is
    /// writable), the periodic scanner, and the writer task.
    pub async fn start(config: Arc<Config>, db: Arc<RecordDb>) -> Result<Arc<Storage>> {
        let initial = scan_space(&config.record.storage_paths)?;
        let (path_tx, path_rx) = watch::channel(initial);
        let (write_tx, write_rx) = mpsc::channel(config.record.write_queue_length);

        let storage = Arc::new(Storage {
            pool: Arc::new(BlockPool::new(config.record.block_size)),
            config: Arc::clone(&config),
            db,
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            path_rx,
        });

        storage.spawn_scanner(path_tx);
        storage.spawn_writer().await;
        Ok(storage)
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    /// Hand a sealed block to the writer. Non-blocking; a full queue drops
    /// the block.
    pub fn insert_block(&self, block: Block) {
        if self.write_tx.try_send(block).is_err() {
            log::error!("storage write queue full");
        }
    }

    fn spawn_scanner(&self, path_tx: watch::Sender<PathBuf>) {
        let paths = self.config.record.storage_paths.clone();
        let interval = Duration::from_secs(self.config.record.storage_scan_interval.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick; the initial scan already ran
            loop {
                ticker.tick().await;
                match scan_space(&paths) {
                    Ok(best) => {
                        if path_tx.send(best).is_err() {
                            return;
                        }
                    }
                    Err(err) => log::error!("storage scan: {err}"),
                }
            }
        });
    }

    async fn spawn_writer(self: &Arc<Self>) {
        let mut write_rx = match self.write_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(block) = write_rx.recv().await {
                if let Err(err) = storage.store_block(block).await {
                    log::error!("store block: {err}");
                }
            }
        });
    }

    /// Write one block, update the time index, persist the execution
    /// sidecar, recycle the buffer. Failures skip the block and keep the
    /// service running.
    async fn store_block(&self, block: Block) -> Result<()> {
        let root = self.path_rx.borrow().clone();
        let block_path = block_file_path(&root, &block.task_id, block.execute_id, block.id);
        log::debug!("writing block[{}]", block_path.display());

        let dir = block_path
            .parent()
            .ok_or_else(|| Error::ErrOthers("block path without parent".to_owned()))?
            .to_path_buf();
        let direct_io = self.config.record.direct_io;
        let expected = block.data.len();

        let meta = BlockMeta {
            id: block.id,
            start_time: block.start_time,
            end_time: block.end_time,
            path: block_path.clone(),
        };
        let task_id = block.task_id.clone();
        let execute_id = block.execute_id;
        let data = block.data;

        let written = tokio::task::spawn_blocking(move || -> Result<AlignedBuf> {
            std::fs::create_dir_all(&dir)?;
            let mut file = open_block_file(&block_path, direct_io, true)?;
            let n = file.write(&data)?;
            if n != expected {
                return Err(Error::ErrShortBlockWrite {
                    actual: n,
                    expected,
                });
            }
            Ok(data)
        })
        .await
        .map_err(|err| Error::ErrOthers(err.to_string()))?;

        let data = match written {
            Ok(data) => data,
            Err(err) => {
                // Skip the index update; the service carries on.
                log::error!("write of block: {err}");
                return Ok(());
            }
        };

        self.db.add_block_index(&task_id, execute_id, meta)?;
        self.persist_execute(&root, &task_id, execute_id).await;
        self.pool.recycle(data);
        Ok(())
    }

    async fn persist_execute(&self, root: &Path, task_id: &str, execute_id: u64) {
        let json = match self.db.persisted_execute(task_id, execute_id) {
            Ok(json) => json,
            Err(err) => {
                log::error!("persist execute: {err}");
                return;
            }
        };
        let path = root
            .join(task_id)
            .join(execute_id.to_string())
            .join(INDEX_FILE);
        if let Err(err) = tokio::fs::write(&path, json).await {
            log::error!("persist execute {}: {err}", path.display());
        }
    }

    /// Read a whole block back for replay. A partial read is an error.
    pub async fn read_block(&self, meta: &BlockMeta) -> Result<AlignedBuf> {
        let data = self.pool.acquire();
        let path = meta.path.clone();
        let direct_io = self.config.record.direct_io;
        let expected = data.len();

        let data = tokio::task::spawn_blocking(move || -> Result<AlignedBuf> {
            let mut data = data;
            let mut file = open_block_file(&path, direct_io, false)?;
            let mut filled = 0usize;
            while filled < expected {
                let n = file.read(&mut data[filled..])?;
                if n == 0 {
                    return Err(Error::ErrShortBlockRead);
                }
                filled += n;
            }
            Ok(data)
        })
        .await
        .map_err(|err| Error::ErrOthers(err.to_string()))??;
        Ok(data)
    }
}

/// Pick the configured root with the most free bytes. All-zero free space
/// means the subsystem cannot operate.
pub fn scan_space(paths: &[String]) -> Result<PathBuf> {
    let mut max_free = 0u64;
    let mut best: Option<PathBuf> = None;

    for path in paths {
        let path = Path::new(path);
        let stat = match disk_usage(path) {
            Ok(stat) => stat,
            Err(err) => {
                log::error!("scan storage {}: {err}", path.display());
                continue;
            }
        };
        log::info!(
            "disk state all[{}] free[{}] path[{}]",
            stat.all,
            stat.free,
            path.display()
        );
        if stat.free > max_free {
            max_free = stat.free;
            best = Some(path.to_path_buf());
        }
    }

    let best = best.ok_or(Error::ErrNoStorageAvailable)?;
    log::info!("using storage path[{}]", best.display());
    Ok(best)
}

/// Block file layout: `root/task/exec/b0/…/b7` from the decimal-formatted
/// bytes of the big-endian block id, bounding per-directory fan-out to 256.
pub fn block_file_path(root: &Path, task_id: &str, execute_id: u64, block_id: u64) -> PathBuf {
    let mut path = root.join(task_id).join(execute_id.to_string());
    for byte in block_id.to_be_bytes() {
        path = path.join(byte.to_string());
    }
    path
}

fn open_block_file(path: &Path, direct_io: bool, write: bool) -> Result<std::fs::File> {
    let mut options = OpenOptions::new();
    if write {
        options.write(true).create(true);
    } else {
        options.read(true);
    }
    #[cfg(unix)]
    if direct_io {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DIRECT);
    }
    #[cfg(not(unix))]
    let _ = direct_io;
    Ok(options.open(path)?)
}
