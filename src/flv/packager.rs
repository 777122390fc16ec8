// src/flv/packager.rs - FLV tag serialization
//
// Core features:
// - onMetaData script tag with optional FLV file header
// - AVC video tags (sequence header / NALU) with composition offset
// - AAC audio tags (sequence header / raw)
// - 11 byte tag header and 4 byte previous tag size trailer

use crate::core::packet::{EncoderPacket, MediaKind};
use crate::flv::amf;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

pub const FLV_TAG_AUDIO: u8 = 8;
pub const FLV_TAG_VIDEO: u8 = 9;
pub const FLV_TAG_SCRIPT: u8 = 18;

pub const FLV_HEADER_SIZE: usize = 9;
pub const FLV_TAG_HEADER_SIZE: usize = 11;
const VIDEO_BODY_HEADER_SIZE: usize = 5;
const AUDIO_BODY_HEADER_SIZE: usize = 2;

const VIDEO_KEYFRAME_AVC: u8 = 0x17; // keyframe << 4 | AVC
const VIDEO_INTERFRAME_AVC: u8 = 0x27; // inter frame << 4 | AVC
const AUDIO_AAC_44K_16BIT_STEREO: u8 = 0xAF;

const METADATA_ARRAY_COUNT: u32 = 20; // placeholder, readers use the object end marker

pub const VIDEO_CODEC_ID_AVC: f64 = 7.0;
pub const AUDIO_CODEC_ID_AAC: f64 = 10.0;

/// Builds FLV tags for the metadata and every media packet.
#[derive(Debug, Clone)]
pub struct FlvPackager {
    properties: BTreeMap<String, f64>,
    encoder_name: String,
}

impl Default for FlvPackager {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvPackager {
    pub fn new() -> Self {
        Self {
            properties: BTreeMap::new(),
            encoder_name: format!("{} ( version {} )", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }

    /// Registers a numeric `onMetaData` property. Properties are written in name order.
    pub fn set_property(&mut self, name: impl Into<String>, value: f64) {
        self.properties.insert(name.into(), value);
    }

    pub fn set_encoder_name(&mut self, name: impl Into<String>) {
        self.encoder_name = name.into();
    }

    fn build_metadata_body(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(256);
        amf::put_string(&mut body, "onMetaData");
        amf::put_ecma_array_start(&mut body, METADATA_ARRAY_COUNT);
        for (name, value) in &self.properties {
            amf::put_number_property(&mut body, name, *value);
        }
        amf::put_string_property(&mut body, "encoder", &self.encoder_name);
        amf::put_object_end(&mut body);
        body
    }

    /// Serializes the `onMetaData` script tag.
    ///
    /// # Arguments
    /// * `write_header` - Prefix the 9 byte FLV file header and PreviousTagSize0
    pub fn flv_meta_data(&self, write_header: bool) -> Bytes {
        let body = self.build_metadata_body();
        let mut out = BytesMut::with_capacity(FLV_HEADER_SIZE + 4 + FLV_TAG_HEADER_SIZE + body.len() + 4);

        if write_header {
            out.put_slice(b"FLV");
            out.put_u8(1); // version
            out.put_u8(5); // audio + video
            out.put_u32(FLV_HEADER_SIZE as u32);
            out.put_u32(0);
        }

        put_tag_header(&mut out, FLV_TAG_SCRIPT, body.len(), 0);
        out.put_slice(&body);
        out.put_u32((FLV_TAG_HEADER_SIZE + body.len()) as u32);
        out.freeze()
    }

    /// Serializes a media packet into one FLV tag.
    ///
    /// # Arguments
    /// * `packet` - Video payload must already be length-prefixed (or an AVC config record)
    /// * `dts_offset` - Milliseconds subtracted from the packet timestamp
    /// * `is_header` - Mark the tag as a codec sequence header
    ///
    /// # Returns
    /// An empty buffer when the payload is empty.
    pub fn flv_packet_mux(&self, packet: &EncoderPacket, dts_offset: i32, is_header: bool) -> Bytes {
        if packet.data.is_empty() {
            return Bytes::new();
        }
        match packet.kind {
            MediaKind::Video => flv_video(packet, dts_offset, is_header),
            MediaKind::Audio => flv_audio(packet, dts_offset, is_header),
        }
    }
}

fn put_tag_header(out: &mut BytesMut, tag_type: u8, data_size: usize, time_ms: i32) {
    out.put_u8(tag_type);
    out.put_uint(data_size as u64 & 0xFF_FFFF, 3);
    out.put_uint(time_ms as u32 as u64 & 0xFF_FFFF, 3);
    out.put_u8(((time_ms >> 24) & 0x7F) as u8);
    out.put_uint(0, 3); // stream id
}

fn flv_video(packet: &EncoderPacket, dts_offset: i32, is_header: bool) -> Bytes {
    let time_ms = packet.get_ms_time(packet.dts) - dts_offset;
    let data_size = packet.data.len() + VIDEO_BODY_HEADER_SIZE;
    let mut out = BytesMut::with_capacity(FLV_TAG_HEADER_SIZE + data_size + 4);

    put_tag_header(&mut out, FLV_TAG_VIDEO, data_size, time_ms);
    out.put_u8(if packet.keyframe {
        VIDEO_KEYFRAME_AVC
    } else {
        VIDEO_INTERFRAME_AVC
    });
    out.put_u8(if is_header { 0 } else { 1 });
    let composition = packet.get_ms_time(packet.pts - packet.dts);
    out.put_uint(composition as u32 as u64 & 0xFF_FFFF, 3);
    out.put_slice(&packet.data);

    out.put_u32((FLV_TAG_HEADER_SIZE + data_size) as u32);
    out.freeze()
}

fn flv_audio(packet: &EncoderPacket, dts_offset: i32, is_header: bool) -> Bytes {
    let time_ms = packet.get_ms_time(packet.dts) - dts_offset;
    let data_size = packet.data.len() + AUDIO_BODY_HEADER_SIZE;
    let mut out = BytesMut::with_capacity(FLV_TAG_HEADER_SIZE + data_size + 4);

    put_tag_header(&mut out, FLV_TAG_AUDIO, data_size, time_ms);
    out.put_u8(AUDIO_AAC_44K_16BIT_STEREO);
    out.put_u8(if is_header { 0 } else { 1 });
    out.put_slice(&packet.data);

    out.put_u32((FLV_TAG_HEADER_SIZE + data_size) as u32);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flv::flv_buffer::FlvBuffer;

    fn video_packet(pts: i64, dts: i64, keyframe: bool, payload: &[u8]) -> EncoderPacket {
        let mut packet = EncoderPacket::new(MediaKind::Video, payload.to_vec(), pts, dts, (1, 1000));
        packet.keyframe = keyframe;
        packet
    }

    #[test]
    fn test_video_tag_bytes() {
        let packager = FlvPackager::new();
        let packet = video_packet(1040, 1000, true, &[0xAA, 0xBB]);
        let tag = packager.flv_packet_mux(&packet, 0, false);
        assert_eq!(
            tag.as_ref(),
            &[
                9, 0, 0, 7, // type, size
                0x00, 0x03, 0xE8, 0x00, // 1000ms
                0, 0, 0, // stream id
                0x17, 1, 0, 0, 40, // keyframe, NALU, composition 40ms
                0xAA, 0xBB, // payload
                0, 0, 0, 18, // previous tag size
            ]
        );
    }

    #[test]
    fn test_audio_header_tag_bytes() {
        let packager = FlvPackager::new();
        let packet = EncoderPacket::new(MediaKind::Audio, vec![0x12, 0x10], 0, 0, (1, 1));
        let tag = packager.flv_packet_mux(&packet, 0, true);
        assert_eq!(
            tag.as_ref(),
            &[8, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0xAF, 0, 0x12, 0x10, 0, 0, 0, 15]
        );
    }

    #[test]
    fn test_empty_payload_is_skipped() {
        let packager = FlvPackager::new();
        let packet = video_packet(0, 0, true, &[]);
        assert!(packager.flv_packet_mux(&packet, 0, false).is_empty());
    }

    #[test]
    fn test_extended_timestamp_and_offset() {
        let packager = FlvPackager::new();
        let packet = video_packet(0x0100_0010, 0x0100_0010, false, &[1]);
        let tag = packager.flv_packet_mux(&packet, 0x10, false);
        // 0x01000000ms: lower 24 bits zero, extension byte 1
        assert_eq!(&tag[4..8], &[0, 0, 0, 1]);
        assert_eq!(tag[11], 0x27);
    }

    #[test]
    fn test_negative_composition_offset() {
        let packager = FlvPackager::new();
        let packet = video_packet(960, 1000, false, &[1]);
        let tag = packager.flv_packet_mux(&packet, 0, false);
        assert_eq!(&tag[13..16], &[0xFF, 0xFF, 0xD8]); // -40
    }

    #[test]
    fn test_metadata_layout() {
        let mut packager = FlvPackager::new();
        packager.set_encoder_name("enc");
        packager.set_property("width", 640.0);

        let tag = packager.flv_meta_data(true);
        assert_eq!(&tag[..13], &[b'F', b'L', b'V', 1, 5, 0, 0, 0, 9, 0, 0, 0, 0]);
        assert_eq!(tag[13], FLV_TAG_SCRIPT);

        let body_len = u32::from_be_bytes([0, tag[14], tag[15], tag[16]]) as usize;
        let body = &tag[24..24 + body_len];
        let mut expected = vec![0x02, 0x00, 0x0A];
        expected.extend_from_slice(b"onMetaData");
        expected.extend_from_slice(&[0x08, 0, 0, 0, 20]);
        expected.extend_from_slice(&[0x00, 0x05]);
        expected.extend_from_slice(b"width");
        expected.push(0x00);
        expected.extend_from_slice(&640f64.to_be_bytes());
        expected.extend_from_slice(&[0x00, 0x07]);
        expected.extend_from_slice(b"encoder");
        expected.extend_from_slice(&[0x02, 0x00, 0x03]);
        expected.extend_from_slice(b"enc");
        expected.extend_from_slice(&[0, 0, 9]);
        assert_eq!(body, expected.as_slice());

        let trailer = &tag[24 + body_len..];
        assert_eq!(trailer, &((11 + body_len) as u32).to_be_bytes());
        assert_eq!(packager.flv_meta_data(false).len(), tag.len() - 13);
    }

    #[test]
    fn test_round_trip_through_reference_parser() {
        let packager = FlvPackager::new();
        let video = video_packet(3_100, 3_000, true, &[0, 0, 0, 1, 0x65]);
        let mut audio = EncoderPacket::new(MediaKind::Audio, vec![0x21, 0x00], 44_100, 44_100, (1, 44_100));
        audio.keyframe = true;

        let mut buffer = FlvBuffer::new();
        buffer.write_data(&packager.flv_meta_data(true));
        buffer.write_data(&packager.flv_packet_mux(&video, 0, false));
        buffer.write_data(&packager.flv_packet_mux(&audio, 0, false));

        let script = buffer.get_flv_tag().unwrap();
        assert_eq!(script.header.tag_type, FLV_TAG_SCRIPT);

        let tag = buffer.get_flv_tag().unwrap();
        assert_eq!(tag.header.tag_type, FLV_TAG_VIDEO);
        assert_eq!(tag.timestamp_ms(), 3_000);
        let info = tag.video_info().unwrap();
        assert!(info.keyframe);
        assert!(!info.is_sequence_header);
        assert_eq!(info.composition_time_ms, 100);
        assert_eq!(info.payload.as_ref(), video.data.as_ref());

        let tag = buffer.get_flv_tag().unwrap();
        assert_eq!(tag.header.tag_type, FLV_TAG_AUDIO);
        assert_eq!(tag.timestamp_ms(), 1_000);
        let info = tag.audio_info().unwrap();
        assert_eq!(info.sound_flags, 0xAF);
        assert_eq!(info.payload.as_ref(), audio.data.as_ref());

        assert!(buffer.get_flv_tag().is_none());
    }
}
