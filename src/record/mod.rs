pub mod block;
pub mod disk;
pub mod index;
pub mod recorder;
pub mod storage;

#[cfg(test)]
mod record_test;

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::pusher::Pusher;
use crate::record::index::{RecordDb, Task, TaskExecute};
use crate::record::recorder::Recorder;
use crate::record::storage::Storage;

/// The recording subsystem: metadata store plus block storage engine.
pub struct RecordService {
    config: Arc<Config>,
    db: Arc<RecordDb>,
    storage: Arc<Storage>,
}

impl RecordService {
    /// Start the subsystem: hydrate persisted execution indexes, then
    /// bring the storage engine up. No writable storage root is fatal.
    pub async fn start(config: Arc<Config>) -> Result<Arc<RecordService>> {
        let db = Arc::new(RecordDb::new());
        db.hydrate_from(&config.record.storage_paths);
        let storage = Storage::start(Arc::clone(&config), Arc::clone(&db)).await?;
        Ok(Arc::new(RecordService {
            config,
            db,
            storage,
        }))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn db(&self) -> &Arc<RecordDb> {
        &self.db
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Open a new execution of `task` recording `pusher`, and build the
    /// recorder that will feed it.
    pub async fn new_recorder(
        self: &Arc<Self>,
        task: &Task,
        pusher: Arc<dyn Pusher>,
    ) -> Result<(TaskExecute, Arc<Recorder>)> {
        let execute = self.db.execute_task(task, &pusher.sdp_raw());
        let recorder = Recorder::new(Arc::clone(self), execute.clone(), pusher).await;
        Ok((execute, recorder))
    }
}
