//! Recording metadata: tasks, executions, and the per-execution time
//! index mapping block start-times to block ids.
//!
//! The in-memory store is the authority while the process runs; every
//! execution is mirrored to an `index.json` next to its blocks so replay
//! works across restarts.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::unix_now;

pub const INDEX_FILE: &str = "index.json";

/// A recording task: a named intent to record one play path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub play_path: String,
}

/// One run of a recording task: a single publisher connection recorded
/// into a monotonically numbered sequence of blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecute {
    pub id: u64,
    pub task_id: String,
    pub sdp_raw: String,
    pub start_time: i64,
    pub end_time: i64,
}

/// Where a written block landed and the time span it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedExecute {
    execute: Option<TaskExecute>,
    /// Sorted set of (start-time, block-id).
    time_index: BTreeSet<(i64, u64)>,
    blocks: HashMap<u64, BlockMeta>,
    block_seq: u64,
}

#[derive(Default)]
struct ExecuteRecord {
    execute: TaskExecute,
    block_seq: u64,
    time_index: BTreeSet<(i64, u64)>,
    blocks: HashMap<u64, BlockMeta>,
}

impl Default for TaskExecute {
    fn default() -> Self {
        TaskExecute {
            id: 0,
            task_id: String::new(),
            sdp_raw: String::new(),
            start_time: 0,
            end_time: 0,
        }
    }
}

#[derive(Default)]
struct DbInner {
    tasks: HashMap<String, Task>,
    execute_seq: HashMap<String, u64>,
    executes: HashMap<(String, u64), ExecuteRecord>,
}

/// In-process record database.
#[derive(Default)]
pub struct RecordDb {
    inner: Mutex<DbInner>,
}

impl RecordDb {
    pub fn new() -> RecordDb {
        RecordDb::default()
    }

    pub fn add_task(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.insert(task.id.clone(), task);
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.lock().unwrap().tasks.get(id).cloned()
    }

    pub fn remove_task(&self, id: &str) {
        self.inner.lock().unwrap().tasks.remove(id);
    }

    pub fn all_tasks(&self) -> Vec<Task> {
        self.inner.lock().unwrap().tasks.values().cloned().collect()
    }

    /// Open a new execution under `task`: allocate the next execution id
    /// and remember the publisher's SDP and start time.
    pub fn execute_task(&self, task: &Task, sdp_raw: &str) -> TaskExecute {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.execute_seq.entry(task.id.clone()).or_insert(0);
        *seq += 1;
        let execute = TaskExecute {
            id: *seq,
            task_id: task.id.clone(),
            sdp_raw: sdp_raw.to_owned(),
            start_time: unix_now(),
            end_time: 0,
        };
        inner.executes.insert(
            (task.id.clone(), execute.id),
            ExecuteRecord {
                execute: execute.clone(),
                ..Default::default()
            },
        );
        execute
    }

    pub fn get_execute(&self, task_id: &str, execute_id: u64) -> Result<TaskExecute> {
        let inner = self.inner.lock().unwrap();
        inner
            .executes
            .get(&(task_id.to_owned(), execute_id))
            .map(|record| record.execute.clone())
            .ok_or(Error::ErrExecuteNotFound)
    }

    /// Monotonic block id within an execution.
    pub fn next_block_id(&self, task_id: &str, execute_id: u64) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .executes
            .get_mut(&(task_id.to_owned(), execute_id))
            .ok_or(Error::ErrExecuteNotFound)?;
        record.block_seq += 1;
        Ok(record.block_seq)
    }

    /// Index a written block and advance the execution's end time.
    pub fn add_block_index(
        &self,
        task_id: &str,
        execute_id: u64,
        meta: BlockMeta,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .executes
            .get_mut(&(task_id.to_owned(), execute_id))
            .ok_or(Error::ErrExecuteNotFound)?;
        record.time_index.insert((meta.start_time, meta.id));
        record.execute.end_time = meta.end_time;
        record.blocks.insert(meta.id, meta);
        Ok(())
    }

    pub fn get_block(&self, task_id: &str, execute_id: u64, block_id: u64) -> Result<BlockMeta> {
        let inner = self.inner.lock().unwrap();
        inner
            .executes
            .get(&(task_id.to_owned(), execute_id))
            .and_then(|record| record.blocks.get(&block_id).cloned())
            .ok_or(Error::ErrBlockNotFound)
    }

    /// First block whose start-time is at or after `time`.
    pub fn get_block_by_time(
        &self,
        task_id: &str,
        execute_id: u64,
        time: i64,
    ) -> Result<BlockMeta> {
        let inner = self.inner.lock().unwrap();
        let record = inner
            .executes
            .get(&(task_id.to_owned(), execute_id))
            .ok_or(Error::ErrExecuteNotFound)?;
        let (_, block_id) = record
            .time_index
            .range((time, 0)..)
            .next()
            .ok_or(Error::ErrBlockNotFound)?;
        record
            .blocks
            .get(block_id)
            .cloned()
            .ok_or(Error::ErrBlockNotFound)
    }

    /// Serialize one execution's metadata for the sidecar file.
    pub fn persisted_execute(&self, task_id: &str, execute_id: u64) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        let record = inner
            .executes
            .get(&(task_id.to_owned(), execute_id))
            .ok_or(Error::ErrExecuteNotFound)?;
        let persisted = PersistedExecute {
            execute: Some(record.execute.clone()),
            time_index: record.time_index.clone(),
            blocks: record.blocks.clone(),
            block_seq: record.block_seq,
        };
        Ok(serde_json::to_string(&persisted)?)
    }

    /// Re-load executions persisted under the storage roots, so replay
    /// survives a restart. Layout: `<root>/<task>/<execute>/index.json`.
    pub fn hydrate_from(&self, roots: &[impl AsRef<Path>]) {
        for root in roots {
            let task_dirs = match std::fs::read_dir(root.as_ref()) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for task_dir in task_dirs.flatten() {
                let execute_dirs = match std::fs::read_dir(task_dir.path()) {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                for execute_dir in execute_dirs.flatten() {
                    let index_path = execute_dir.path().join(INDEX_FILE);
                    if let Err(err) = self.load_index_file(&index_path) {
                        if index_path.exists() {
                            log::error!("load {}: {err}", index_path.display());
                        }
                    }
                }
            }
        }
    }

    fn load_index_file(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let persisted: PersistedExecute = serde_json::from_str(&raw)?;
        let execute = persisted.execute.ok_or(Error::ErrExecuteNotFound)?;

        let mut inner = self.inner.lock().unwrap();
        let seq = inner
            .execute_seq
            .entry(execute.task_id.clone())
            .or_insert(0);
        *seq = (*seq).max(execute.id);
        inner.executes.insert(
            (execute.task_id.clone(), execute.id),
            ExecuteRecord {
                execute,
                block_seq: persisted.block_seq,
                time_index: persisted.time_index,
                blocks: persisted.blocks,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod index_test {
    use super::*;

    fn task() -> Task {
        Task {
            id: "T1".to_owned(),
            play_path: "/live/cam1".to_owned(),
        }
    }

    #[test]
    fn execute_ids_are_monotonic() {
        let db = RecordDb::new();
        let task = task();
        db.add_task(task.clone());
        assert_eq!(db.execute_task(&task, "sdp").id, 1);
        assert_eq!(db.execute_task(&task, "sdp").id, 2);
    }

    #[test]
    fn block_lookup_by_time() {
        let db = RecordDb::new();
        let task = task();
        db.add_task(task.clone());
        let execute = db.execute_task(&task, "sdp");

        for (id, start) in [(1u64, 100i64), (2, 160), (3, 220)] {
            db.add_block_index(
                &task.id,
                execute.id,
                BlockMeta {
                    id,
                    start_time: start,
                    end_time: start + 60,
                    path: PathBuf::from(format!("/tmp/{id}")),
                },
            )
            .expect("index");
        }

        assert_eq!(db.get_block_by_time(&task.id, execute.id, 100).unwrap().id, 1);
        assert_eq!(db.get_block_by_time(&task.id, execute.id, 101).unwrap().id, 2);
        assert_eq!(db.get_block_by_time(&task.id, execute.id, 220).unwrap().id, 3);
        assert!(db.get_block_by_time(&task.id, execute.id, 221).is_err());
    }

    #[test]
    fn end_time_tracks_latest_block() {
        let db = RecordDb::new();
        let task = task();
        db.add_task(task.clone());
        let execute = db.execute_task(&task, "sdp");
        db.add_block_index(
            &task.id,
            execute.id,
            BlockMeta {
                id: 1,
                start_time: 5,
                end_time: 65,
                path: PathBuf::from("/tmp/1"),
            },
        )
        .expect("index");
        assert_eq!(db.get_execute(&task.id, execute.id).unwrap().end_time, 65);
    }

    #[test]
    fn persist_and_hydrate_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = RecordDb::new();
        let task = task();
        db.add_task(task.clone());
        let execute = db.execute_task(&task, "v=0\r\n");
        db.add_block_index(
            &task.id,
            execute.id,
            BlockMeta {
                id: 1,
                start_time: 50,
                end_time: 110,
                path: dir.path().join("b"),
            },
        )
        .expect("index");

        let execute_dir = dir.path().join(&task.id).join(execute.id.to_string());
        std::fs::create_dir_all(&execute_dir).expect("mkdir");
        let json = db.persisted_execute(&task.id, execute.id).expect("persist");
        std::fs::write(execute_dir.join(INDEX_FILE), json).expect("write");

        let restored = RecordDb::new();
        restored.hydrate_from(&[dir.path()]);
        let loaded = restored.get_execute(&task.id, execute.id).expect("loaded");
        assert_eq!(loaded.sdp_raw, "v=0\r\n");
        assert_eq!(
            restored
                .get_block_by_time(&task.id, execute.id, 0)
                .unwrap()
                .id,
            1
        );
        // New executions continue after the hydrated sequence.
        assert_eq!(restored.execute_task(&task, "sdp").id, execute.id + 1);
    }
}
