//! Storage record framing.
//!
//! A block payload is a run of frames shaped like RTP-over-TCP without the
//! leading `$`: `kind(1) | channel(1) | length_be16 | rtp bytes`. The first
//! two bytes carry the relay's own dispatch info so replay can rebuild the
//! interleaved header in place.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::rtp::{RtpKind, RtpPack};

pub const RECORD_HEADER_LENGTH: usize = 4;

/// Interleaved-channel escape byte, RFC 2326 §10.12.
pub const INTERLEAVED_MAGIC: u8 = 0x24;

/// Serialized size of a pack inside a block payload.
pub fn record_length(pack: &RtpPack) -> usize {
    RECORD_HEADER_LENGTH + pack.buffer.len()
}

/// Append the record frame for `pack` to `buf`.
pub fn serialize_to_record(pack: &RtpPack, buf: &mut Vec<u8>) {
    let len = pack.buffer.len() as u16;
    buf.push(pack.kind as u8);
    buf.push(pack.channel);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&pack.buffer);
}

/// Decode one record frame from the front of `buf`.
///
/// Returns the pack and the number of bytes consumed. Fails with
/// [`Error::ErrNeedMore`] when fewer than four bytes, or fewer than the
/// framed length, are available.
pub fn deserialize_from_record(buf: &[u8]) -> Result<(RtpPack, usize)> {
    if buf.len() < RECORD_HEADER_LENGTH {
        return Err(Error::ErrNeedMore);
    }
    let kind = RtpKind::from_u8(buf[0]).ok_or(Error::ErrNeedMore)?;
    let channel = buf[1];
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < RECORD_HEADER_LENGTH + length {
        return Err(Error::ErrNeedMore);
    }

    let pack = RtpPack::new(
        kind,
        channel,
        Bytes::copy_from_slice(&buf[RECORD_HEADER_LENGTH..RECORD_HEADER_LENGTH + length]),
    );
    Ok((pack, RECORD_HEADER_LENGTH + length))
}

/// Decode one record frame and rewrite its header in place into an
/// interleaved `$ channel` header ready to go out over TCP.
///
/// `channel_map` is indexed by `kind << 1 | channel` and holds the
/// negotiated interleaved channel, or a negative value when the media was
/// not set up.
pub fn deserialize_from_record_tcp<'a>(
    buf: &'a mut [u8],
    channel_map: &[i32; 8],
) -> Result<(RtpPack, &'a [u8], usize)> {
    let (pack, consumed) = deserialize_from_record(buf)?;
    let send_channel = channel_map[((pack.kind as usize) << 1) + pack.channel as usize];
    if send_channel < 0 {
        return Err(Error::ErrChannelNotMapped);
    }

    buf[0] = INTERLEAVED_MAGIC;
    buf[1] = send_channel as u8;
    Ok((pack, &buf[..consumed], consumed))
}
