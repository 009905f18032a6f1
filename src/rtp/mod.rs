pub mod clock;
pub mod header;
pub mod record;
pub mod sequence;


use std::fmt;

use bytes::Bytes;

/// Kind of a relayed RTP packet. The discriminant doubles as the leading
/// byte of a storage record frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RtpKind {
    Audio = 0,
    Video = 1,
    AudioControl = 2,
    VideoControl = 3,
}

impl RtpKind {
    pub fn from_u8(value: u8) -> Option<RtpKind> {
        match value {
            0 => Some(RtpKind::Audio),
            1 => Some(RtpKind::Video),
            2 => Some(RtpKind::AudioControl),
            3 => Some(RtpKind::VideoControl),
            _ => None,
        }
    }

    /// Control packets (RTCP) are forwarded untouched but never enter the
    /// GOP cache or the pacing gate.
    pub fn is_control(&self) -> bool {
        matches!(self, RtpKind::AudioControl | RtpKind::VideoControl)
    }
}

impl fmt::Display for RtpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RtpKind::Audio => "audio",
            RtpKind::Video => "video",
            RtpKind::AudioControl => "audio control",
            RtpKind::VideoControl => "video control",
        };
        write!(f, "{s}")
    }
}

/// One framed RTP (or RTCP) packet moving through the relay.
///
/// The buffer holds network-order wire bytes; header fields are derived on
/// demand with [`header::RtpHeader::parse`]. Packs are shared across the
/// broadcast fan-out behind an `Arc`, so the buffer is never copied per
/// player.
#[derive(Debug, Clone)]
pub struct RtpPack {
    pub kind: RtpKind,
    /// Logical channel index. Meaningful for dual-audio (0 or 1); always 0
    /// for video.
    pub channel: u8,
    pub buffer: Bytes,
}

impl RtpPack {
    pub fn new(kind: RtpKind, channel: u8, buffer: Bytes) -> Self {
        RtpPack {
            kind,
            channel,
            buffer,
        }
    }

    pub fn video(buffer: Bytes) -> Self {
        RtpPack::new(RtpKind::Video, 0, buffer)
    }

    pub fn audio(channel: u8, buffer: Bytes) -> Self {
        RtpPack::new(RtpKind::Audio, channel, buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
