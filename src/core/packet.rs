use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

// NAL reference priorities (nal_ref_idc)
pub const NAL_PRIORITY_DISPOSABLE: i32 = 0;
pub const NAL_PRIORITY_LOW: i32 = 1;
pub const NAL_PRIORITY_HIGH: i32 = 2;
pub const NAL_PRIORITY_HIGHEST: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    fn to_u8(self) -> u8 {
        match self {
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
        }
    }

    fn from_u8(v: u8) -> MediaKind {
        if v == 0 {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }
}

/// One encoded unit of audio or video.
///
/// `pts`/`dts` are expressed in `timebase_num/timebase_den` seconds. `dts_usec` and
/// `sys_dts_usec` are derived by the encoder and rebased by the interleaver.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderPacket {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub timebase_num: i32,
    pub timebase_den: i32,
    pub kind: MediaKind,
    pub keyframe: bool,
    pub priority: i32,
    pub drop_priority: i32,
    pub track_idx: usize,
    pub dts_usec: i64,
    pub sys_dts_usec: i64,
}

impl EncoderPacket {
    pub fn new(kind: MediaKind, data: impl Into<Bytes>, pts: i64, dts: i64, timebase: (i32, i32)) -> Self {
        Self {
            data: data.into(),
            pts,
            dts,
            timebase_num: timebase.0,
            timebase_den: timebase.1,
            kind,
            keyframe: false,
            priority: 0,
            drop_priority: 0,
            track_idx: 0,
            dts_usec: 0,
            sys_dts_usec: 0,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }

    /// Converts a value in this packet's timebase to milliseconds.
    pub fn get_ms_time(&self, value: i64) -> i32 {
        if self.timebase_den == 0 {
            return 0;
        }
        (value * 1000 / self.timebase_den as i64) as i32
    }

    /// The packet dts in microseconds, derived from the timebase only.
    pub fn get_dts_usec(&self) -> i64 {
        if self.timebase_den == 0 {
            return 0;
        }
        self.dts * 1_000_000 / self.timebase_den as i64
    }

    /// Duration of one timebase tick in microseconds.
    pub fn frame_duration_usec(&self) -> i64 {
        if self.timebase_den == 0 {
            return 0;
        }
        self.timebase_num as i64 * 1_000_000 / self.timebase_den as i64
    }

    pub(crate) fn header(&self) -> PacketHeader {
        PacketHeader {
            kind: self.kind,
            keyframe: self.keyframe,
            priority: self.priority,
            drop_priority: self.drop_priority,
            timebase_num: self.timebase_num,
            timebase_den: self.timebase_den,
            track_idx: self.track_idx as u32,
            pts: self.pts,
            dts: self.dts,
            dts_usec: self.dts_usec,
            sys_dts_usec: self.sys_dts_usec,
            payload_len: self.data.len() as u32,
        }
    }

    pub(crate) fn from_header(header: &PacketHeader, data: Bytes) -> Self {
        Self {
            data,
            pts: header.pts,
            dts: header.dts,
            timebase_num: header.timebase_num,
            timebase_den: header.timebase_den,
            kind: header.kind,
            keyframe: header.keyframe,
            priority: header.priority,
            drop_priority: header.drop_priority,
            track_idx: header.track_idx as usize,
            dts_usec: header.dts_usec,
            sys_dts_usec: header.sys_dts_usec,
        }
    }
}

pub(crate) const PACKET_HEADER_SIZE: usize = 60;

/// Fixed-size packet record stored ahead of each payload in the send queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PacketHeader {
    pub kind: MediaKind,
    pub keyframe: bool,
    pub priority: i32,
    pub drop_priority: i32,
    pub timebase_num: i32,
    pub timebase_den: i32,
    pub track_idx: u32,
    pub pts: i64,
    pub dts: i64,
    pub dts_usec: i64,
    pub sys_dts_usec: i64,
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0] = self.kind.to_u8();
        buf[1] = self.keyframe as u8;
        // 2..4 reserved
        LittleEndian::write_i32(&mut buf[4..8], self.priority);
        LittleEndian::write_i32(&mut buf[8..12], self.drop_priority);
        LittleEndian::write_i32(&mut buf[12..16], self.timebase_num);
        LittleEndian::write_i32(&mut buf[16..20], self.timebase_den);
        LittleEndian::write_u32(&mut buf[20..24], self.track_idx);
        LittleEndian::write_i64(&mut buf[24..32], self.pts);
        LittleEndian::write_i64(&mut buf[32..40], self.dts);
        LittleEndian::write_i64(&mut buf[40..48], self.dts_usec);
        LittleEndian::write_i64(&mut buf[48..56], self.sys_dts_usec);
        LittleEndian::write_u32(&mut buf[56..60], self.payload_len);
        buf
    }

    pub fn decode(buf: &[u8; PACKET_HEADER_SIZE]) -> Self {
        Self {
            kind: MediaKind::from_u8(buf[0]),
            keyframe: buf[1] != 0,
            priority: LittleEndian::read_i32(&buf[4..8]),
            drop_priority: LittleEndian::read_i32(&buf[8..12]),
            timebase_num: LittleEndian::read_i32(&buf[12..16]),
            timebase_den: LittleEndian::read_i32(&buf[16..20]),
            track_idx: LittleEndian::read_u32(&buf[20..24]),
            pts: LittleEndian::read_i64(&buf[24..32]),
            dts: LittleEndian::read_i64(&buf[32..40]),
            dts_usec: LittleEndian::read_i64(&buf[40..48]),
            sys_dts_usec: LittleEndian::read_i64(&buf[48..56]),
            payload_len: LittleEndian::read_u32(&buf[56..60]),
        }
    }

    /// Size of the whole record: header plus payload.
    pub fn record_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload_len as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_conversions() {
        let packet = EncoderPacket::new(MediaKind::Video, Vec::new(), 90, 60, (1, 30));
        assert_eq!(packet.get_ms_time(packet.dts), 2000);
        assert_eq!(packet.get_ms_time(packet.pts - packet.dts), 1000);
        assert_eq!(packet.get_dts_usec(), 2_000_000);
        assert_eq!(packet.frame_duration_usec(), 33_333);

        let audio = EncoderPacket::new(MediaKind::Audio, Vec::new(), 1024, 1024, (1, 44100));
        assert_eq!(audio.get_ms_time(audio.dts), 23);
    }

    #[test]
    fn test_header_record() {
        let mut packet = EncoderPacket::new(MediaKind::Video, vec![1u8, 2, 3], 5, -2, (1, 1000));
        packet.keyframe = true;
        packet.priority = NAL_PRIORITY_HIGHEST;
        packet.drop_priority = NAL_PRIORITY_HIGH;
        packet.track_idx = 1;
        packet.dts_usec = -2000;
        packet.sys_dts_usec = 123_456_789_000;

        let header = packet.header();
        let decoded = PacketHeader::decode(&header.encode());
        assert_eq!(decoded, header);
        assert_eq!(decoded.record_len(), PACKET_HEADER_SIZE + 3);

        let rebuilt = EncoderPacket::from_header(&decoded, packet.data.clone());
        assert_eq!(rebuilt, packet);
    }
}
