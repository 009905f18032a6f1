//! Minimal SDP parsing (RFC 4566).
//!
//! The relay forwards the publisher's session description verbatim; only
//! the media-level facts needed for routing are extracted: media kind,
//! codec name, control attribute, payload type and clock rate.

#[cfg(test)]
mod sdp_test;

use crate::error::{Error, Result};

/// Media kind of an `m=` section. Anything other than audio/video (e.g.
/// `application`) is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// One parsed `m=` section.
#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub kind: MediaKind,
    /// Encoding name from `a=rtpmap`, e.g. `H264`, `PCMA`.
    pub codec: String,
    /// `a=control` attribute: an absolute `rtsp://` URL or a relative
    /// fragment such as `streamid=0`.
    pub control: String,
    /// First payload type listed on the `m=` line.
    pub payload_type: u8,
    /// Clock rate from `a=rtpmap`, zero when absent.
    pub clock_rate: u32,
}

/// Parsed session description plus the raw text it came from.
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub raw: String,
    pub medias: Vec<SdpMedia>,
}

impl SdpSession {
    /// Parse the media sections out of an SDP body.
    ///
    /// Fails when no `m=` line is present or a media line is malformed;
    /// unknown lines are ignored, as are media kinds the relay does not
    /// carry.
    pub fn parse(raw: &str) -> Result<SdpSession> {
        let mut medias: Vec<SdpMedia> = Vec::new();
        let mut current: Option<SdpMedia> = None;
        let mut skipping_media = false;

        for line in raw.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("m=") {
                if let Some(media) = current.take() {
                    medias.push(media);
                }
                skipping_media = false;

                let mut fields = rest.split_whitespace();
                let kind = match fields.next() {
                    Some("video") => MediaKind::Video,
                    Some("audio") => MediaKind::Audio,
                    Some(_) => {
                        skipping_media = true;
                        continue;
                    }
                    None => return Err(Error::ErrSdpMalformed),
                };
                // m=<media> <port> <proto> <fmt> ...
                let payload_type = fields
                    .nth(2)
                    .and_then(|fmt| fmt.parse::<u8>().ok())
                    .ok_or(Error::ErrSdpMalformed)?;

                current = Some(SdpMedia {
                    kind,
                    codec: String::new(),
                    control: String::new(),
                    payload_type,
                    clock_rate: 0,
                });
            } else if let Some(rest) = line.strip_prefix("a=") {
                if skipping_media {
                    continue;
                }
                let media = match current.as_mut() {
                    Some(media) => media,
                    None => continue, // session-level attribute
                };
                if let Some(control) = rest.strip_prefix("control:") {
                    media.control = control.trim().to_owned();
                } else if let Some(rtpmap) = rest.strip_prefix("rtpmap:") {
                    parse_rtpmap(rtpmap, media);
                }
            }
        }

        if let Some(media) = current.take() {
            medias.push(media);
        }
        if medias.is_empty() {
            return Err(Error::ErrSdpMalformed);
        }

        Ok(SdpSession {
            raw: raw.to_owned(),
            medias,
        })
    }
}

/// `a=rtpmap:<payload type> <encoding name>/<clock rate>[/<channels>]`
fn parse_rtpmap(rtpmap: &str, media: &mut SdpMedia) {
    let mut fields = rtpmap.split_whitespace();
    let payload_type = fields
        .next()
        .and_then(|pt| pt.parse::<u8>().ok());
    if payload_type != Some(media.payload_type) {
        return;
    }
    if let Some(encoding) = fields.next() {
        let mut parts = encoding.split('/');
        if let Some(name) = parts.next() {
            media.codec = name.to_owned();
        }
        if let Some(rate) = parts.next() {
            media.clock_rate = rate.parse().unwrap_or(0);
        }
    }
}
