pub const FIXED_HEADER_LENGTH: usize = 12;

pub const VERSION_SHIFT: u8 = 6;
pub const VERSION_MASK: u8 = 0x3;
pub const PADDING_SHIFT: u8 = 5;
pub const PADDING_MASK: u8 = 0x1;
pub const EXTENSION_SHIFT: u8 = 4;
pub const EXTENSION_MASK: u8 = 0x1;
pub const CC_MASK: u8 = 0xF;
pub const MARKER_SHIFT: u8 = 7;
pub const MARKER_MASK: u8 = 0x1;
pub const PT_MASK: u8 = 0x7F;

/// Payload types below this value are static audio assignments; dynamic
/// (video) payload types start here. The relay uses this only as a
/// dispatch heuristic.
pub const DYNAMIC_PAYLOAD_TYPE_START: u8 = 96;

/// Parsed view over an RTP wire buffer.
///
/// `payload_offset..payload_end` bounds the payload after CSRC entries,
/// the optional extension header and trailing padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_offset: usize,
    pub payload_end: usize,
}

impl RtpHeader {
    /// Parse the fixed header and locate the payload.
    ///
    /// Returns `None` when the buffer is shorter than the fixed header or
    /// when no payload byte remains after CSRC/extension/padding
    /// accounting. Oversized CSRC or extension declarations that do not fit
    /// the buffer are ignored rather than rejected, matching the tolerant
    /// treatment cameras in the field require.
    pub fn parse(raw: &[u8]) -> Option<RtpHeader> {
        if raw.len() < FIXED_HEADER_LENGTH {
            return None;
        }

        let b0 = raw[0];
        let b1 = raw[1];
        let version = b0 >> VERSION_SHIFT & VERSION_MASK;
        let padding = (b0 >> PADDING_SHIFT & PADDING_MASK) > 0;
        let extension = (b0 >> EXTENSION_SHIFT & EXTENSION_MASK) > 0;
        let csrc_count = b0 & CC_MASK;
        let marker = (b1 >> MARKER_SHIFT & MARKER_MASK) > 0;
        let payload_type = b1 & PT_MASK;

        let sequence_number = u16::from_be_bytes([raw[2], raw[3]]);
        let timestamp = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let ssrc = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);

        let mut offset = FIXED_HEADER_LENGTH;
        let mut end = raw.len();

        if end - offset >= 4 * csrc_count as usize {
            offset += 4 * csrc_count as usize;
        }
        if extension && end - offset >= 4 {
            let ext_len = 4 * u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
            offset += 4;
            if end - offset >= ext_len {
                offset += ext_len;
            }
        }
        if padding && end > offset {
            let padding_len = raw[end - 1] as usize;
            if end - offset >= padding_len {
                end -= padding_len;
            }
        }

        if end <= offset {
            return None;
        }

        Some(RtpHeader {
            version,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload_offset: offset,
            payload_end: end,
        })
    }

    pub fn payload<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        &raw[self.payload_offset..self.payload_end]
    }

    /// Heuristic used by the VOD pacing gate: dynamic payload types carry
    /// the video clock.
    pub fn is_dynamic_payload(&self) -> bool {
        self.payload_type >= DYNAMIC_PAYLOAD_TYPE_START
    }
}
