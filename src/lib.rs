#![warn(rust_2018_idioms)]

//! An RTSP media relay and recording server.
//!
//! Cameras and encoders publish with ANNOUNCE/RECORD, players subscribe
//! with DESCRIBE/PLAY, and a pull client can dial remote sources. Every
//! received RTP packet fans out through a per-path pusher to its attached
//! players; a GOP cache lets late joiners start on a key frame. Streams
//! can be recorded into fixed-size direct-I/O blocks with a per-execution
//! time index, and replayed through the same RTSP surface as `/vod/...`
//! paths paced by the original RTP timestamps.

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod player;
pub mod pusher;
pub mod record;
pub mod rtp;
pub mod sdp;
pub mod server;
pub mod session;
pub mod shutdown;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod util;
pub mod vod;

pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
