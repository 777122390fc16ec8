// src/core/avc.rs - H.264 bitstream helpers
//
// Core features:
// - Annex-B start code scanning (3 and 4 byte codes)
// - AVCDecoderConfigurationRecord construction from SPS/PPS
// - Annex-B to length-prefixed conversion with keyframe/priority detection

use crate::core::packet::NAL_PRIORITY_DISPOSABLE;
use crate::error::EncodeError;
use bytes::{BufMut, Bytes, BytesMut};

pub const NAL_SLICE: u8 = 1;
pub const NAL_SLICE_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

const MIN_SPS_SIZE: usize = 4;

/// Finds the next start code at or after `from`.
///
/// # Returns
/// * `Some((pos, len))` - Offset of the first zero byte and start code length
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                // A preceding zero turns it into a 4 byte code
                if i > from && data[i - 1] == 0 {
                    return Some((i - 1, 4));
                }
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 3 < data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

pub fn has_start_code(data: &[u8]) -> bool {
    matches!(find_start_code(data, 0), Some((0, _)))
}

/// Splits an Annex-B byte stream into NAL units (start codes stripped).
pub fn annexb_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let Some((pos, len)) = find_start_code(data, 0) else {
        return nals;
    };

    let mut nal_start = pos + len;
    loop {
        match find_start_code(data, nal_start) {
            Some((next, next_len)) => {
                let nal = trim_trailing_zeros(&data[nal_start..next]);
                if !nal.is_empty() {
                    nals.push(nal);
                }
                nal_start = next + next_len;
            }
            None => {
                if nal_start < data.len() {
                    nals.push(&data[nal_start..]);
                }
                break;
            }
        }
    }
    nals
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let mut end = nal.len();
    while end > 0 && nal[end - 1] == 0 {
        end -= 1;
    }
    &nal[..end]
}

/// Splits a 4-byte length-prefixed stream into NAL units. Truncated trailing data is ignored.
pub fn length_prefixed_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if len == 0 || pos + len > data.len() {
            break;
        }
        nals.push(&data[pos..pos + len]);
        pos += len;
    }
    nals
}

pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

/// Video payload in wire (length-prefixed) form.
#[derive(Debug, Clone, PartialEq)]
pub struct AvcPacket {
    pub data: Bytes,
    pub keyframe: bool,
    pub priority: i32,
}

/// Converts an encoded video access unit into 4-byte length-prefixed NAL units.
///
/// Annex-B input is rewritten. Input without start codes is taken to be length-prefixed
/// already and is passed through. The keyframe flag and priority come from the slice NALs.
pub fn parse_avc_packet(data: &[u8]) -> AvcPacket {
    let annexb = has_start_code(data);
    let nals = if annexb {
        annexb_nal_units(data)
    } else {
        length_prefixed_nal_units(data)
    };

    let mut keyframe = false;
    let mut priority = NAL_PRIORITY_DISPOSABLE;
    for nal in &nals {
        let kind = nal_type(nal);
        if kind == NAL_SLICE || kind == NAL_SLICE_IDR {
            keyframe = kind == NAL_SLICE_IDR;
            priority = (nal[0] >> 5) as i32;
        }
    }

    let data = if annexb {
        let total: usize = nals.iter().map(|nal| nal.len() + 4).sum();
        let mut out = BytesMut::with_capacity(total);
        for nal in &nals {
            out.put_u32(nal.len() as u32);
            out.put_slice(nal);
        }
        out.freeze()
    } else {
        Bytes::copy_from_slice(data)
    };

    AvcPacket {
        data,
        keyframe,
        priority,
    }
}

/// Whether the access unit contains an IDR slice.
pub fn is_keyframe(data: &[u8]) -> bool {
    let nals = if has_start_code(data) {
        annexb_nal_units(data)
    } else {
        length_prefixed_nal_units(data)
    };
    nals.iter().any(|nal| nal_type(nal) == NAL_SLICE_IDR)
}

/// Builds an AVCDecoderConfigurationRecord from raw SPS and PPS NAL units.
pub fn decoder_config(sps: &[u8], pps: &[u8]) -> Result<Bytes, EncodeError> {
    if sps.len() < MIN_SPS_SIZE {
        return Err(EncodeError::InvalidHeader(format!("SPS too short: {} bytes", sps.len())));
    }
    if pps.is_empty() {
        return Err(EncodeError::InvalidHeader("missing PPS".to_string()));
    }

    let mut out = BytesMut::with_capacity(11 + sps.len() + pps.len());
    out.put_u8(0x01);
    out.put_slice(&sps[1..4]); // profile, compatibility, level
    out.put_u8(0xFF); // 4 byte NAL lengths
    out.put_u8(0xE1); // one SPS
    out.put_u16(sps.len() as u16);
    out.put_slice(sps);
    out.put_u8(0x01); // one PPS
    out.put_u16(pps.len() as u16);
    out.put_slice(pps);
    Ok(out.freeze())
}

/// Strips a leading start code, if any.
pub fn strip_start_code(nal: &[u8]) -> &[u8] {
    match find_start_code(nal, 0) {
        Some((0, len)) => &nal[len..],
        _ => nal,
    }
}

/// Builds the video sequence header from codec extradata.
///
/// Extradata without start codes is assumed to be a decoder configuration record already.
pub fn parse_header(extradata: &[u8]) -> Result<Bytes, EncodeError> {
    if !has_start_code(extradata) {
        return Ok(Bytes::copy_from_slice(extradata));
    }

    let nals = annexb_nal_units(extradata);
    let sps = nals.iter().find(|nal| nal_type(nal) == NAL_SPS);
    let pps = nals.iter().find(|nal| nal_type(nal) == NAL_PPS);
    match (sps, pps) {
        (Some(sps), Some(pps)) => decoder_config(sps, pps),
        _ => Err(EncodeError::InvalidHeader("extradata lacks SPS or PPS".to_string())),
    }
}

/// Builds the video sequence header from separately supplied SPS (`csd0`) and PPS (`csd1`).
pub fn header_from_csd(csd0: &[u8], csd1: &[u8]) -> Result<Bytes, EncodeError> {
    if csd1.is_empty() {
        return parse_header(csd0);
    }
    decoder_config(strip_start_code(csd0), strip_start_code(csd1))
}
