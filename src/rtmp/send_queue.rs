// src/rtmp/send_queue.rs - Outbound packet queue
//
// Core features:
// - FIFO of fixed-size packet records plus payload bytes in a RingBuffer
// - Two-tier congestion check (low priority frames, then every P-frame)
// - Audio and keyframes are never dropped
// - Minimum priority gate that rejects frames until the next keyframe

use crate::config::StreamConfig;
use crate::core::packet::{
    EncoderPacket, MediaKind, PacketHeader, NAL_PRIORITY_HIGH, NAL_PRIORITY_HIGHEST, PACKET_HEADER_SIZE,
};
use crate::util::ring_buffer::RingBuffer;
use bytes::Bytes;
use log::{debug, warn};

// Fewer buffered packets than this never count as congestion
const MIN_PACKETS_FOR_DROP: usize = 5;

/// Send queue
///
/// Not synchronized; the stream keeps it behind a mutex and only its send thread pops.
#[derive(Debug)]
pub struct SendQueue {
    packets: RingBuffer,
    count: usize,
    min_priority: i32,
    congestion: f32,
    dropped_frames: u64,
    last_dts_usec: i64,
    drop_threshold_usec: i64,
    pframe_drop_threshold_usec: i64,
}

impl SendQueue {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            packets: RingBuffer::with_capacity(PACKET_HEADER_SIZE * 64),
            count: 0,
            min_priority: 0,
            congestion: 0.0,
            dropped_frames: 0,
            last_dts_usec: 0,
            drop_threshold_usec: config.drop_threshold_usec(),
            pframe_drop_threshold_usec: config.pframe_drop_threshold_usec(),
        }
    }

    /// Clears queued packets and counters for a fresh connection.
    pub fn reset(&mut self) {
        self.packets.clear();
        self.count = 0;
        self.min_priority = 0;
        self.congestion = 0.0;
        self.dropped_frames = 0;
        self.last_dts_usec = 0;
    }

    /// Releases the buffer memory.
    pub fn free(&mut self) {
        self.reset();
        self.packets.free();
    }

    /// Queues a packet. Video goes through the congestion check first.
    ///
    /// # Returns
    /// * `true` - The packet was queued
    /// * `false` - The packet was dropped by the congestion policy
    pub fn push(&mut self, packet: &EncoderPacket) -> bool {
        if packet.is_video() {
            self.add_video_packet(packet)
        } else {
            self.add_packet(packet);
            true
        }
    }

    fn add_video_packet(&mut self, packet: &EncoderPacket) -> bool {
        self.check_to_drop_frames(false);
        self.check_to_drop_frames(true);

        // While dropping, reject frames until one reaches the desired priority
        if !packet.keyframe && packet.drop_priority < self.min_priority {
            self.dropped_frames += 1;
            return false;
        }
        self.min_priority = 0;

        self.last_dts_usec = packet.dts_usec;
        self.add_packet(packet);
        true
    }

    fn add_packet(&mut self, packet: &EncoderPacket) {
        let header = packet.header();
        self.packets.push_back(&header.encode());
        self.packets.push_back(&packet.data);
        self.count += 1;
    }

    /// Removes the oldest packet.
    pub fn pop(&mut self) -> Option<EncoderPacket> {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        if !self.packets.pop_front(&mut raw) {
            return None;
        }
        let header = PacketHeader::decode(&raw);
        let data = self.packets.pop_front_vec(header.payload_len as usize);
        self.count = self.count.saturating_sub(1);
        Some(EncoderPacket::from_header(&header, Bytes::from(data)))
    }

    fn header_at(&self, offset: usize) -> Option<PacketHeader> {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        if self.packets.peek_at(offset, &mut raw) {
            Some(PacketHeader::decode(&raw))
        } else {
            None
        }
    }

    /// Timestamp of the oldest buffered non-keyframe video packet.
    fn find_first_video_packet(&self) -> Option<i64> {
        let mut offset = 0;
        for _ in 0..self.count {
            let header = self.header_at(offset)?;
            if header.kind == MediaKind::Video && !header.keyframe {
                return Some(header.dts_usec);
            }
            offset += header.record_len();
        }
        None
    }

    fn check_to_drop_frames(&mut self, pframes: bool) {
        let (priority, threshold) = if pframes {
            (NAL_PRIORITY_HIGHEST, self.pframe_drop_threshold_usec)
        } else {
            (NAL_PRIORITY_HIGH, self.drop_threshold_usec)
        };

        if self.count < MIN_PACKETS_FOR_DROP {
            if !pframes {
                self.congestion = 0.0;
            }
            return;
        }

        let Some(first_dts_usec) = self.find_first_video_packet() else {
            return;
        };

        let buffer_duration_usec = self.last_dts_usec - first_dts_usec;
        if !pframes {
            self.congestion = buffer_duration_usec as f32 / threshold as f32;
        }

        if buffer_duration_usec > threshold {
            debug!(
                "Buffer duration {}ms over {}ms, dropping {} frames",
                buffer_duration_usec / 1000,
                threshold / 1000,
                if pframes { "P" } else { "B" }
            );
            self.drop_frames(priority);
        }
    }

    /// Drops every buffered non-keyframe video packet below `highest_priority`.
    fn drop_frames(&mut self, highest_priority: i32) {
        let mut kept = RingBuffer::with_capacity(self.packets.capacity());
        let mut kept_count = 0;
        let mut num_frames_dropped = 0;

        while let Some(packet) = self.pop() {
            if packet.is_audio() || packet.keyframe || packet.drop_priority >= highest_priority {
                kept.push_back(&packet.header().encode());
                kept.push_back(&packet.data);
                kept_count += 1;
            } else {
                num_frames_dropped += 1;
            }
        }

        self.packets = kept;
        self.count = kept_count;
        if self.min_priority < highest_priority {
            self.min_priority = highest_priority;
        }
        self.dropped_frames += num_frames_dropped;
        if num_frames_dropped > 0 {
            warn!("Dropped {num_frames_dropped} frames due to congestion");
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Buffered duration over the drop threshold, pinned to 1.0 while frames are rejected.
    pub fn congestion(&self) -> f32 {
        if self.min_priority > 0 {
            1.0
        } else {
            self.congestion
        }
    }

    #[cfg(test)]
    fn min_priority(&self) -> i32 {
        self.min_priority
    }
}
