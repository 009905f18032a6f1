//! Coded-sequence start detection.
//!
//! The GOP cache resets when a video packet begins a new coded sequence,
//! and VOD start-frame alignment uses the same rules. H.264 per RFC 6184,
//! H.265 per RFC 7798.

use crate::rtp::header::RtpHeader;

const H264_NALU_TYPE_MASK: u8 = 0x1F;
const H264_NALU_IDR: u8 = 5;
const H264_NALU_SPS: u8 = 7;
const H264_NALU_STAP_A: u8 = 24;
const H264_NALU_FU_A: u8 = 28;
const H264_NALU_FU_B: u8 = 29;

const FU_START_BIT: u8 = 0x80;

/// A parameter-set NALU longer than this is assumed to also carry a key
/// frame behind the header.
const PARAMETER_SET_ONLY_LIMIT: usize = 200;

/// Per-pusher detector. Stateful: an SPS+PPS aggregate observed in a
/// STAP-A sets a sticky flag that suppresses IDR-triggered restarts, since
/// those streams restart on the aggregate instead.
#[derive(Debug, Default)]
pub struct SequenceStart {
    sps_pps_in_stap_a: bool,
}

impl SequenceStart {
    pub fn new() -> Self {
        SequenceStart::default()
    }

    /// Does this video packet begin a new coded sequence?
    pub fn check(&mut self, codec: &str, raw: &[u8]) -> bool {
        let header = match RtpHeader::parse(raw) {
            Some(header) => header,
            None => return false,
        };
        let payload = header.payload(raw);
        if codec.eq_ignore_ascii_case("h264") {
            self.check_h264(payload)
        } else if codec.eq_ignore_ascii_case("h265") {
            check_h265(payload)
        } else {
            false
        }
    }

    fn check_h264(&mut self, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        let nalu_type = payload[0] & H264_NALU_TYPE_MASK;
        let real_nalu;
        match nalu_type {
            0..=23 => real_nalu = payload[0],
            H264_NALU_FU_A | H264_NALU_FU_B => {
                if payload.len() < 2 {
                    return false;
                }
                real_nalu = payload[1];
                if real_nalu & FU_START_BIT == 0 {
                    return false;
                }
            }
            H264_NALU_STAP_A => {
                // Scan aggregated NALUs; an SPS+PPS pair sums to 0x0F.
                let mut off = 1usize;
                let mut single_sps_pps = 0usize;
                loop {
                    if off + 2 > payload.len() {
                        return false;
                    }
                    let nal_size =
                        u16::from_be_bytes([payload[off], payload[off + 1]]) as usize;
                    if nal_size < 1 {
                        return false;
                    }
                    off += 2;
                    if off + nal_size > payload.len() {
                        return false;
                    }
                    single_sps_pps += (payload[off] & H264_NALU_TYPE_MASK) as usize;
                    off += nal_size;
                    if off >= payload.len() {
                        break;
                    }
                }
                if single_sps_pps == 0x0F {
                    self.sps_pps_in_stap_a = true;
                    return true;
                }
                return false;
            }
            _ => return false,
        }

        match real_nalu & H264_NALU_TYPE_MASK {
            H264_NALU_IDR => !self.sps_pps_in_stap_a,
            H264_NALU_SPS => payload.len() > PARAMETER_SET_ONLY_LIMIT,
            _ => false,
        }
    }
}

const H265_NALU_FU: u8 = 49;
const H265_NALU_IRAP_FIRST: u8 = 16;
const H265_NALU_IRAP_LAST: u8 = 21;
const H265_NALU_VPS: u8 = 32;

fn check_h265(payload: &[u8]) -> bool {
    if payload.len() < 3 {
        return false;
    }
    let header_type = (payload[0] >> 1) & 0x3F;
    let frame_type = if header_type == H265_NALU_FU {
        let fu_header = payload[2];
        if fu_header & FU_START_BIT == 0 {
            return false;
        }
        fu_header & 0x3F
    } else {
        header_type
    };

    if (H265_NALU_IRAP_FIRST..=H265_NALU_IRAP_LAST).contains(&frame_type) {
        return true;
    }
    if frame_type == H265_NALU_VPS {
        // A short VPS is parameter sets only; a long one carries frame data.
        return payload.len() > PARAMETER_SET_ONLY_LIMIT;
    }
    false
}
