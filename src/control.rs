//! Control-plane operations consumed by an HTTP admin layer: pusher and
//! player enumeration, pull-stream lifecycle, recording tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::RtspClient;
use crate::error::{Error, Result};
use crate::player::{player_info, PlayerInfo};
use crate::pusher::{LivePusher, Pusher, PusherMode};
use crate::record::index::Task;
use crate::server::Server;
use crate::transport::TransType;
use crate::util::short_id;

const PULL_AGENT: &str = concat!("rtsp-relay/", env!("CARGO_PKG_VERSION"));

/// Persisted pull configuration, restored at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub url: String,
    pub custom_path: String,
    pub trans_type: String,
    /// Handshake/idle timeout, seconds. Zero falls back to the RTSP
    /// timeout.
    pub idle_timeout: u64,
    /// OPTIONS keepalive interval, milliseconds. Zero disables it.
    pub heartbeat_interval: u64,
}

/// JSON-file-backed store of pull configurations.
#[derive(Default)]
pub struct StreamStore {
    path: Mutex<Option<PathBuf>>,
    streams: Mutex<HashMap<String, StreamConfig>>,
}

impl StreamStore {
    /// Attach a backing file and load whatever it holds.
    pub fn open(&self, path: PathBuf) -> Result<()> {
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let streams: HashMap<String, StreamConfig> = serde_json::from_str(&raw)?;
            *self.streams.lock().unwrap() = streams;
        }
        *self.path.lock().unwrap() = Some(path);
        Ok(())
    }

    pub fn add(&self, stream: StreamConfig) {
        self.streams
            .lock()
            .unwrap()
            .insert(stream.id.clone(), stream);
        self.persist();
    }

    pub fn remove(&self, id: &str) {
        self.streams.lock().unwrap().remove(id);
        self.persist();
    }

    pub fn all(&self) -> Vec<StreamConfig> {
        self.streams.lock().unwrap().values().cloned().collect()
    }

    fn persist(&self) {
        let path = self.path.lock().unwrap().clone();
        let path = match path {
            Some(path) => path,
            None => return,
        };
        let streams = self.streams.lock().unwrap().clone();
        match serde_json::to_string_pretty(&streams) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&path, json) {
                    log::error!("persist streams {}: {err}", path.display());
                }
            }
            Err(err) => log::error!("serialize streams: {err}"),
        }
    }
}

/// Compact pusher description for the admin enumeration.
#[derive(Debug, Clone, Serialize)]
pub struct PusherInfo {
    pub id: String,
    pub path: String,
    pub source: String,
    pub trans_type: String,
    pub mode: String,
    pub in_bytes: usize,
    pub out_bytes: usize,
    pub start_at: DateTime<Utc>,
    pub player_count: usize,
}

pub fn pusher_info(pusher: &Arc<dyn Pusher>) -> PusherInfo {
    PusherInfo {
        id: pusher.id(),
        path: pusher.path(),
        source: pusher.source(),
        trans_type: pusher.trans_type().to_string(),
        mode: pusher.mode().to_string(),
        in_bytes: pusher.in_bytes(),
        out_bytes: pusher.out_bytes(),
        start_at: pusher.start_at(),
        player_count: pusher.players().len(),
    }
}

/// Enumerate active pushers.
pub fn get_pushers(server: &Arc<Server>) -> Vec<PusherInfo> {
    server.pushers().values().map(pusher_info).collect()
}

/// Enumerate the players attached to the pusher at `path`.
pub fn get_players(server: &Arc<Server>, path: &str) -> Vec<PlayerInfo> {
    match server.pushers().get(path) {
        Some(pusher) => pusher.players().values().map(player_info).collect(),
        None => Vec::new(),
    }
}

/// Dial a remote source, register it as a pull-pusher, and persist the
/// configuration. Returns the pusher id used by [`stream_stop`].
pub async fn stream_start(server: &Arc<Server>, request: StreamConfig) -> Result<String> {
    let trans_type = match request.trans_type.to_ascii_lowercase().as_str() {
        "udp" => TransType::Udp,
        _ => TransType::Tcp,
    };
    let id = if request.id.is_empty() {
        short_id()
    } else {
        request.id.clone()
    };
    let custom_path = if !request.custom_path.is_empty() && !request.custom_path.starts_with('/') {
        format!("/{}", request.custom_path)
    } else {
        request.custom_path.clone()
    };

    let client = RtspClient::new(
        Arc::clone(server),
        id,
        &request.url,
        trans_type,
        request.heartbeat_interval,
        &custom_path,
        PULL_AGENT,
    )?;
    let pusher = LivePusher::from_client(Arc::clone(&client), Arc::clone(server.config())).await;

    if server.get_pusher(&pusher.path(), None).await.is_some() {
        return Err(Error::ErrPusherRejected(pusher.path()));
    }

    if let Err(err) = client
        .start(Duration::from_secs(request.idle_timeout))
        .await
    {
        client.stop().await;
        return Err(err);
    }

    if !server
        .add_pusher(Arc::clone(&pusher) as Arc<dyn Pusher>, false)
        .await
    {
        client.stop().await;
        return Err(Error::ErrPusherRejected(pusher.path()));
    }

    let stored = StreamConfig {
        id: client.id.clone(),
        url: request.url,
        custom_path,
        trans_type: trans_type.to_string(),
        idle_timeout: request.idle_timeout,
        heartbeat_interval: request.heartbeat_interval,
    };
    server.streams().add(stored);

    Ok(client.id.clone())
}

/// Remove the pusher with `id` and stop it; pull configurations are also
/// deleted from the store.
pub async fn stream_stop(server: &Arc<Server>, id: &str) -> Result<()> {
    let pusher = server
        .pushers()
        .values()
        .find(|pusher| pusher.id() == id)
        .cloned()
        .ok_or_else(|| Error::ErrPusherNotFound(id.to_owned()))?;

    let was_pull = pusher.mode() == PusherMode::Pull;
    server.remove_pusher(id).await;
    if was_pull {
        server.streams().remove(id);
    }
    Ok(())
}

/// Create a recording task for the live pusher at `play_path` and attach
/// a recorder to it.
pub async fn start_record(server: &Arc<Server>, task_id: &str, play_path: &str) -> Result<()> {
    let service = server
        .record()
        .ok_or_else(|| Error::ErrOthers("recording not configured".to_owned()))?;
    let pusher = server
        .get_pusher(play_path, None)
        .await
        .ok_or_else(|| Error::ErrPusherNotFound(play_path.to_owned()))?;

    let task = Task {
        id: task_id.to_owned(),
        play_path: play_path.to_owned(),
    };
    service.db().add_task(task.clone());

    let service = Arc::clone(service);
    let (_execute, recorder) = service.new_recorder(&task, Arc::clone(&pusher)).await?;
    pusher
        .add_player(recorder as Arc<dyn crate::player::Player>)
        .await?;
    Ok(())
}

/// Redial every persisted pull stream. Failures are logged; the
/// configuration stays in the store for the next restart.
pub async fn restore_streams(server: &Arc<Server>) {
    for stream in server.streams().all() {
        let id = stream.id.clone();
        match stream_start(server, stream).await {
            Ok(_) => log::info!("restored pull stream [{id}]"),
            Err(err) => log::error!("restore pull stream [{id}]: {err}"),
        }
    }
}

/// Enumerate recording tasks.
pub fn query_record(server: &Arc<Server>) -> Vec<Task> {
    match server.record() {
        Some(service) => service.db().all_tasks(),
        None => Vec::new(),
    }
}
