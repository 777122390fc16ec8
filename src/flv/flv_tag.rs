use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlvTagHeader {
    pub tag_type: u8,
    pub data_size: u32,
    pub timestamp: u32,
    pub timestamp_ext: u8,
    pub stream_id: u32,
}

impl FlvTagHeader {
    /// Parses the 11 byte tag header.
    pub fn parse(buf: &[u8]) -> Option<FlvTagHeader> {
        let mut cursor = Cursor::new(buf);
        Some(FlvTagHeader {
            tag_type: cursor.read_u8().ok()?,
            data_size: cursor.read_u24::<BigEndian>().ok()?,
            timestamp: cursor.read_u24::<BigEndian>().ok()?,
            timestamp_ext: cursor.read_u8().ok()?,
            stream_id: cursor.read_u24::<BigEndian>().ok()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlvTag {
    pub header: FlvTagHeader,
    pub data: Bytes,
    pub previous_tag_size: u32,
}

/// Body fields of an AVC video tag.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTagInfo {
    pub frame_type: u8,
    pub codec_id: u8,
    pub keyframe: bool,
    pub is_sequence_header: bool,
    pub composition_time_ms: i32,
    pub payload: Bytes,
}

/// Body fields of an AAC audio tag.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTagInfo {
    pub sound_flags: u8,
    pub is_sequence_header: bool,
    pub payload: Bytes,
}

impl FlvTag {
    /// Full 32 bit timestamp in milliseconds.
    pub fn timestamp_ms(&self) -> u32 {
        self.header.timestamp | ((self.header.timestamp_ext as u32) << 24)
    }

    pub fn video_info(&self) -> Option<VideoTagInfo> {
        if self.header.tag_type != super::packager::FLV_TAG_VIDEO || self.data.len() < 5 {
            return None;
        }
        let mut cursor = Cursor::new(self.data.as_ref());
        let flags = cursor.read_u8().ok()?;
        let avc_packet_type = cursor.read_u8().ok()?;
        let composition_time_ms = cursor.read_i24::<BigEndian>().ok()?;
        Some(VideoTagInfo {
            frame_type: flags >> 4,
            codec_id: flags & 0x0F,
            keyframe: flags >> 4 == 1,
            is_sequence_header: avc_packet_type == 0,
            composition_time_ms,
            payload: self.data.slice(5..),
        })
    }

    pub fn audio_info(&self) -> Option<AudioTagInfo> {
        if self.header.tag_type != super::packager::FLV_TAG_AUDIO || self.data.len() < 2 {
            return None;
        }
        Some(AudioTagInfo {
            sound_flags: self.data[0],
            is_sequence_header: self.data[1] == 0,
            payload: self.data.slice(2..),
        })
    }
}
