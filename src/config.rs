use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings for the RTSP listener and per-connection behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    /// TCP port the RTSP listener binds.
    pub port: u16,
    /// Socket/stream buffer size in bytes.
    pub network_buffer: usize,
    /// Read deadline for TCP control connections, milliseconds. Cleared
    /// once a session negotiates UDP transport.
    pub timeout_millis: u64,
    /// Require Digest authorization on every request except OPTIONS.
    pub authorization_enable: bool,
    /// Replace an existing pusher when a new one announces the same path.
    pub close_old: bool,
    /// Keep a GOP cache per pusher so late joiners start on a key frame.
    pub gop_cache_enable: bool,
    /// Drop a player's queued backlog when it pauses.
    pub drop_packet_when_paused: bool,
    /// Realm announced in WWW-Authenticate challenges.
    pub realm: String,
    /// Hex-encoded secret for the optional URL-signature check. Empty
    /// disables the check.
    pub stream_secret: String,
    /// Username -> password pairs accepted by Digest authorization.
    pub users: HashMap<String, String>,
}

impl Default for RtspConfig {
    fn default() -> Self {
        RtspConfig {
            port: 554,
            network_buffer: 204_800,
            timeout_millis: 5_000,
            authorization_enable: false,
            close_old: false,
            gop_cache_enable: false,
            drop_packet_when_paused: false,
            realm: "rtsp-relay".to_owned(),
            stream_secret: String::new(),
            users: HashMap::new(),
        }
    }
}

/// Settings for player-side delivery queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Bounded length of each player's receive queue.
    pub send_queue_length: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        PlayerConfig {
            send_queue_length: 128,
        }
    }
}

/// Settings for the recording path and block storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Candidate storage roots. The scanner picks the one with the most
    /// free bytes.
    pub storage_paths: Vec<String>,
    /// Seconds between free-space scans.
    pub storage_scan_interval: u64,
    /// Bounded length of the block write queue.
    pub write_queue_length: usize,
    /// Bounded length of each recorder's receive queue.
    pub receive_queue_length: usize,
    /// Block size in bytes. Must be a multiple of the direct-I/O alignment.
    pub block_size: usize,
    /// Open block files with O_DIRECT. Disabled only by tests running on
    /// filesystems without direct-I/O support.
    pub direct_io: bool,
}

impl Default for RecordConfig {
    fn default() -> Self {
        RecordConfig {
            storage_paths: vec![],
            storage_scan_interval: 120,
            write_queue_length: 256,
            receive_queue_length: 128,
            block_size: 2 * 1024 * 1024,
            direct_io: true,
        }
    }
}

/// Top-level configuration. Loaded from a JSON file when present,
/// otherwise every section takes its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rtsp: RtspConfig,
    pub player: PlayerConfig,
    pub record: RecordConfig,
    /// JSON file persisting pull-stream configurations. None disables
    /// persistence.
    pub streams_file: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Configuration errors are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.record.block_size == 0
            || self.record.block_size % crate::record::block::DIRECT_IO_ALIGN != 0
        {
            return Err(Error::ErrConfigInvalid(format!(
                "block_size must be a non-zero multiple of {}",
                crate::record::block::DIRECT_IO_ALIGN
            )));
        }
        if self.player.send_queue_length == 0 {
            return Err(Error::ErrConfigInvalid(
                "send_queue_length must be non-zero".to_owned(),
            ));
        }
        if self.record.write_queue_length == 0 || self.record.receive_queue_length == 0 {
            return Err(Error::ErrConfigInvalid(
                "record queue lengths must be non-zero".to_owned(),
            ));
        }
        if !self.rtsp.stream_secret.is_empty() && hex::decode(&self.rtsp.stream_secret).is_err() {
            return Err(Error::ErrConfigInvalid(
                "stream_secret must be hex encoded".to_owned(),
            ));
        }
        Ok(())
    }
}
