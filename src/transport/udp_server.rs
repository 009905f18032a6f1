//! UDP ingest legs.
//!
//! A pusher session (or a pull client in UDP mode) receives each media on
//! a pair of ephemeral sockets: RTP and RTP-control. Every socket gets its
//! own receive loop that stamps kind and channel onto the packet and hands
//! it to the owner's RTP sink.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::error::Result;
use crate::rtp::{RtpKind, RtpPack};
use crate::transport::{bind_udp, RtpSink, UDP_BUF_SIZE};

#[derive(Debug, Default, Clone, Copy)]
struct Ports {
    video: i32,
    video_control: i32,
    audio: [i32; 2],
    audio_control: [i32; 2],
}

pub struct UdpServer {
    sink: RtpSink,
    in_bytes: Arc<AtomicUsize>,
    network_buffer: usize,
    stopped: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    ports: Mutex<Ports>,
}

impl UdpServer {
    pub fn new(sink: RtpSink, in_bytes: Arc<AtomicUsize>, network_buffer: usize) -> Self {
        UdpServer {
            sink,
            in_bytes,
            network_buffer,
            stopped: Arc::new(AtomicBool::new(false)),
            stop_tx: watch::channel(false).0,
            ports: Mutex::new(Ports {
                video: -1,
                video_control: -1,
                audio: [-1, -1],
                audio_control: [-1, -1],
            }),
        }
    }

    /// Allocate the RTP + control sockets for video and start their
    /// receive loops. Returns the local port pair for `server_port=`.
    pub async fn setup_video(&self) -> Result<(u16, u16)> {
        let (rtp, rtp_port) = self.bind_ephemeral()?;
        let (control, control_port) = self.bind_ephemeral()?;
        {
            let mut ports = self.ports.lock().unwrap();
            ports.video = i32::from(rtp_port);
            ports.video_control = i32::from(control_port);
        }
        self.spawn_receive_loop(rtp, RtpKind::Video, 0);
        self.spawn_receive_loop(control, RtpKind::VideoControl, 0);
        Ok((rtp_port, control_port))
    }

    /// Same as [`setup_video`](Self::setup_video) for one audio channel.
    pub async fn setup_audio(&self, channel: u8) -> Result<(u16, u16)> {
        let (rtp, rtp_port) = self.bind_ephemeral()?;
        let (control, control_port) = self.bind_ephemeral()?;
        {
            let mut ports = self.ports.lock().unwrap();
            ports.audio[channel as usize] = i32::from(rtp_port);
            ports.audio_control[channel as usize] = i32::from(control_port);
        }
        self.spawn_receive_loop(rtp, RtpKind::Audio, channel);
        self.spawn_receive_loop(control, RtpKind::AudioControl, channel);
        Ok((rtp_port, control_port))
    }

    pub fn video_ports(&self) -> (i32, i32) {
        let ports = self.ports.lock().unwrap();
        (ports.video, ports.video_control)
    }

    pub fn audio_ports(&self, channel: u8) -> (i32, i32) {
        let ports = self.ports.lock().unwrap();
        (
            ports.audio[channel as usize],
            ports.audio_control[channel as usize],
        )
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
    }

    fn bind_ephemeral(&self) -> Result<(UdpSocket, u16)> {
        let addr: SocketAddr = ([0, 0, 0, 0], 0).into();
        let socket = bind_udp(addr, self.network_buffer)?;
        let port = socket.local_addr()?.port();
        Ok((socket, port))
    }

    fn spawn_receive_loop(&self, socket: UdpSocket, kind: RtpKind, channel: u8) {
        let sink = Arc::clone(&self.sink);
        let in_bytes = Arc::clone(&self.in_bytes);
        let stopped = Arc::clone(&self.stopped);
        let mut stop_rx = self.stop_tx.subscribe();
        let port = socket.local_addr().map(|a| a.port()).unwrap_or(0);

        tokio::spawn(async move {
            log::info!("udp server listen {kind} port[{port}]");
            let mut buf = vec![0u8; UDP_BUF_SIZE];
            while !stopped.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    received = socket.recv_from(&mut buf) => {
                        let n = match received {
                            Ok((n, _)) => n,
                            Err(err) => {
                                if !stopped.load(Ordering::SeqCst) {
                                    log::error!("udp server[{port}] read {kind} pack error: {err}");
                                }
                                break;
                            }
                        };
                        in_bytes.fetch_add(n, Ordering::Relaxed);
                        let pack = Arc::new(RtpPack::new(
                            kind,
                            channel,
                            Bytes::copy_from_slice(&buf[..n]),
                        ));
                        sink(pack);
                    }
                }
            }
            log::info!("udp server stop listen {kind} port[{port}]");
        });
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
