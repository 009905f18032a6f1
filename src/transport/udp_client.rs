//! UDP egress legs for a playing client.
//!
//! The peer address comes from the RTSP connection's remote host plus the
//! `client_port` pair the client advertised in SETUP. Each socket is
//! dialed once; sends are raw RTP bytes.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;

use crate::error::Result;
use crate::rtp::{RtpKind, RtpPack};
use crate::transport::bind_udp;

#[derive(Default)]
struct Legs {
    video: Option<Arc<UdpSocket>>,
    video_control: Option<Arc<UdpSocket>>,
    audio: [Option<Arc<UdpSocket>>; 2],
    audio_control: [Option<Arc<UdpSocket>>; 2],
}

pub struct UdpClient {
    peer_host: IpAddr,
    network_buffer: usize,
    legs: Mutex<Legs>,
}

impl UdpClient {
    pub fn new(peer_host: IpAddr, network_buffer: usize) -> Self {
        UdpClient {
            peer_host,
            network_buffer,
            legs: Mutex::new(Legs::default()),
        }
    }

    async fn dial(&self, port: u16) -> Result<Arc<UdpSocket>> {
        let local: SocketAddr = ([0, 0, 0, 0], 0).into();
        let socket = bind_udp(local, self.network_buffer)?;
        socket.connect(SocketAddr::new(self.peer_host, port)).await?;
        Ok(Arc::new(socket))
    }

    pub async fn setup_video(&self, rtp_port: u16, control_port: u16) -> Result<()> {
        let video = self.dial(rtp_port).await?;
        let control = self.dial(control_port).await?;
        let mut legs = self.legs.lock().unwrap();
        legs.video = Some(video);
        legs.video_control = Some(control);
        Ok(())
    }

    pub async fn setup_audio(&self, channel: u8, rtp_port: u16, control_port: u16) -> Result<()> {
        let audio = self.dial(rtp_port).await?;
        let control = self.dial(control_port).await?;
        let mut legs = self.legs.lock().unwrap();
        legs.audio[channel as usize] = Some(audio);
        legs.audio_control[channel as usize] = Some(control);
        Ok(())
    }

    /// Send one packet to the leg matching its kind and channel.
    ///
    /// A kind whose media was never set up is skipped silently; players
    /// are free to negotiate a subset of the tracks. Returns bytes written.
    pub async fn send_rtp(&self, pack: &RtpPack) -> Result<usize> {
        let conn = {
            let legs = self.legs.lock().unwrap();
            match pack.kind {
                RtpKind::Video => legs.video.clone(),
                RtpKind::VideoControl => legs.video_control.clone(),
                RtpKind::Audio => legs.audio[pack.channel as usize].clone(),
                RtpKind::AudioControl => legs.audio_control[pack.channel as usize].clone(),
            }
        };
        let conn = match conn {
            Some(conn) => conn,
            None => return Ok(0),
        };
        let n = conn.send(&pack.buffer).await?;
        Ok(n)
    }

    pub fn stop(&self) {
        let mut legs = self.legs.lock().unwrap();
        *legs = Legs::default();
    }
}
