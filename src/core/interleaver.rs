// src/core/interleaver.rs - Audio/video packet interleaving
//
// Core features:
// - Single ordered queue sorted by dts_usec, video first on ties
// - Keyframe-gated start, stale audio discarded with rejected video
// - Startup pruning and shared offset rebasing once both tracks arrive
// - Emission gated on the opposing track's high-water mark (configurable)
//
// The interleaver is plain data: the owning output serializes access to it with a
// single mutex held across insert-and-emit.

use crate::config::{EmitPolicy, PrunePolicy, StreamConfig};
use crate::core::packet::{EncoderPacket, MediaKind};
use log::{debug, trace};

#[derive(Debug)]
pub struct Interleaver {
    packets: Vec<EncoderPacket>,
    received_video: bool,
    received_audio: bool,
    highest_video_ts: i64,
    highest_audio_ts: i64,
    video_offset: i64,
    audio_offset: i64,
    has_video: bool,
    has_audio: bool,
    need_sync_packet: bool,
    prune_policy: PrunePolicy,
    emit_policy: EmitPolicy,
    total_frames: u64,
}

impl Interleaver {
    /// Creates an interleaver for the configured tracks.
    ///
    /// # Arguments
    /// * `has_video` / `has_audio` - Which tracks the output carries
    /// * `config` - Supplies the sync, prune and emit policies
    pub fn new(has_video: bool, has_audio: bool, config: &StreamConfig) -> Self {
        Self {
            packets: Vec::with_capacity(64),
            received_video: false,
            received_audio: false,
            highest_video_ts: i64::MIN,
            highest_audio_ts: i64::MIN,
            video_offset: 0,
            audio_offset: 0,
            has_video,
            has_audio,
            need_sync_packet: config.need_sync_packet,
            prune_policy: config.prune_policy,
            emit_policy: config.emit_policy,
            total_frames: 0,
        }
    }

    /// Clears all buffered packets and sync state.
    pub fn reset(&mut self) {
        self.packets.clear();
        self.received_video = false;
        self.received_audio = false;
        self.highest_video_ts = i64::MIN;
        self.highest_audio_ts = i64::MIN;
        self.video_offset = 0;
        self.audio_offset = 0;
        self.total_frames = 0;
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn buffered(&self) -> usize {
        self.packets.len()
    }

    /// Both tracks have been received and rebased.
    pub fn is_synced(&self) -> bool {
        self.received_video && self.received_audio
    }

    fn sync_required(&self) -> bool {
        self.need_sync_packet && self.has_video && self.has_audio
    }

    /// Accepts one packet and returns the packets that are now ready to send, in order.
    pub fn push(&mut self, mut packet: EncoderPacket) -> Vec<EncoderPacket> {
        if packet.is_audio() {
            packet.track_idx = 0;
        }

        if !self.received_video && packet.is_video() && !packet.keyframe {
            self.discard_unused_audio_packets(packet.dts_usec);
            trace!("Discarding non-keyframe video before first keyframe, dts_usec:{}", packet.dts_usec);
            return Vec::new();
        }

        if !self.sync_required() {
            self.check_received(&packet);
            if packet.is_video() {
                self.total_frames += 1;
            }
            return vec![packet];
        }

        let was_started = self.received_audio && self.received_video;
        if was_started {
            self.apply_interleaved_packet_offset(&mut packet);
        } else {
            self.check_received(&packet);
        }

        let kind = packet.kind;
        let dts_usec = packet.dts_usec;
        self.insert_interleaved_packet(packet);
        self.set_higher_ts(kind, dts_usec);

        let mut emitted = Vec::new();
        if self.received_audio && self.received_video {
            if !was_started {
                if self.prune_interleaved_packets() && self.initialize_interleaved_packets() {
                    self.resort_interleaved_packets();
                    self.send_interleaved(&mut emitted);
                }
            } else {
                self.send_interleaved(&mut emitted);
            }
        }
        emitted
    }

    /// Drains every buffered packet in queue order. Returns nothing if the tracks never synced.
    pub fn flush(&mut self) -> Vec<EncoderPacket> {
        if !self.is_synced() {
            self.packets.clear();
            return Vec::new();
        }
        let drained: Vec<EncoderPacket> = self.packets.drain(..).collect();
        self.total_frames += drained.iter().filter(|p| p.is_video()).count() as u64;
        drained
    }

    fn check_received(&mut self, packet: &EncoderPacket) {
        match packet.kind {
            MediaKind::Video => self.received_video = true,
            MediaKind::Audio => self.received_audio = true,
        }
    }

    fn apply_interleaved_packet_offset(&self, packet: &mut EncoderPacket) {
        let offset = match packet.kind {
            MediaKind::Video => self.video_offset,
            MediaKind::Audio => self.audio_offset,
        };
        packet.dts -= offset;
        packet.pts -= offset;
        packet.dts_usec = packet.get_dts_usec();
    }

    fn insert_interleaved_packet(&mut self, packet: EncoderPacket) {
        let idx = self
            .packets
            .iter()
            .position(|cur| {
                (packet.dts_usec == cur.dts_usec && packet.is_video()) || packet.dts_usec < cur.dts_usec
            })
            .unwrap_or(self.packets.len());
        self.packets.insert(idx, packet);
    }

    fn resort_interleaved_packets(&mut self) {
        let old = std::mem::take(&mut self.packets);
        for packet in old {
            self.insert_interleaved_packet(packet);
        }
    }

    fn set_higher_ts(&mut self, kind: MediaKind, dts_usec: i64) {
        match kind {
            MediaKind::Video => self.highest_video_ts = self.highest_video_ts.max(dts_usec),
            MediaKind::Audio => self.highest_audio_ts = self.highest_audio_ts.max(dts_usec),
        }
    }

    fn has_higher_opposing_ts(&self, packet: &EncoderPacket) -> bool {
        match packet.kind {
            MediaKind::Video => self.highest_audio_ts > packet.dts_usec,
            MediaKind::Audio => self.highest_video_ts > packet.dts_usec,
        }
    }

    fn send_interleaved(&mut self, emitted: &mut Vec<EncoderPacket>) {
        match self.emit_policy {
            EmitPolicy::OnePerPacket => {
                if !self.packets.is_empty() {
                    let packet = self.packets.remove(0);
                    self.emit(packet, emitted);
                }
            }
            EmitPolicy::WaitForOpposing => {
                while let Some(front) = self.packets.first() {
                    if !self.has_higher_opposing_ts(front) {
                        break;
                    }
                    let packet = self.packets.remove(0);
                    self.emit(packet, emitted);
                }
            }
        }
    }

    fn emit(&mut self, packet: EncoderPacket, emitted: &mut Vec<EncoderPacket>) {
        if packet.is_video() {
            self.total_frames += 1;
        }
        emitted.push(packet);
    }

    fn discard_to_idx(&mut self, idx: usize) {
        let idx = idx.min(self.packets.len());
        self.packets.drain(..idx);
    }

    fn discard_unused_audio_packets(&mut self, dts_usec: i64) {
        let idx = self
            .packets
            .iter()
            .position(|p| p.dts_usec >= dts_usec)
            .unwrap_or(self.packets.len());
        if idx > 0 {
            self.discard_to_idx(idx);
        }
    }

    fn find_first_packet_type_idx(&self, kind: MediaKind) -> Option<usize> {
        self.packets.iter().position(|p| p.kind == kind)
    }

    fn find_last_packet_type_idx(&self, kind: MediaKind) -> Option<usize> {
        self.packets.iter().rposition(|p| p.kind == kind)
    }

    /// Locates where the queue should start so both tracks begin together.
    ///
    /// # Returns
    /// * `None` - A track has no buffered packet, its received flag is cleared
    /// * `Some(idx)` - Number of leading packets to discard (0 means use the start index)
    fn prune_premature_packets(&mut self) -> Option<usize> {
        let Some(video_idx) = self.find_first_packet_type_idx(MediaKind::Video) else {
            self.received_video = false;
            return None;
        };
        let Some(audio_idx) = self.find_first_packet_type_idx(MediaKind::Audio) else {
            self.received_audio = false;
            return None;
        };

        if self.prune_policy == PrunePolicy::Disabled {
            return Some(0);
        }

        let video = &self.packets[video_idx];
        let audio = &self.packets[audio_idx];
        let duration_usec = video.frame_duration_usec();
        let diff = audio.dts_usec - video.dts_usec;

        if diff > duration_usec {
            // Video started early, restart it on a keyframe close to the audio
            let baseline = audio.dts_usec - duration_usec;
            match self
                .packets
                .iter()
                .position(|p| p.is_video() && p.keyframe && p.dts_usec >= baseline)
            {
                Some(idx) => {
                    debug!("Pruning {idx} packets of premature video");
                    return Some(idx);
                }
                None => {
                    self.received_video = false;
                    return None;
                }
            }
        }

        if -diff > duration_usec {
            // Audio started early, drop what precedes the video by more than a frame
            let baseline = video.dts_usec - duration_usec;
            let idx = self
                .packets
                .iter()
                .position(|p| !(p.is_audio() && p.dts_usec < baseline))
                .unwrap_or(self.packets.len());
            if idx > 0 {
                debug!("Pruning {idx} packets of premature audio");
            }
            return Some(idx);
        }

        Some(0)
    }

    fn prune_interleaved_packets(&mut self) -> bool {
        let Some(start_idx) = self.prune_premature_packets() else {
            return false;
        };

        let start_idx = if start_idx > 0 {
            start_idx
        } else {
            self.get_interleaved_start_idx()
        };
        if start_idx > 0 {
            self.discard_to_idx(start_idx);
        }
        true
    }

    /// The smaller of the first video index and the index of the audio packet closest to it.
    /// Equally close audio resolves to the later packet.
    fn get_interleaved_start_idx(&self) -> usize {
        let Some(video_idx) = self.find_first_packet_type_idx(MediaKind::Video) else {
            return 0;
        };
        let first_video_dts = self.packets[video_idx].dts_usec;

        let mut closest_diff = i64::MAX;
        let mut idx = 0;
        for (i, packet) in self.packets.iter().enumerate() {
            if !packet.is_audio() {
                continue;
            }
            let diff = (packet.dts_usec - first_video_dts).abs();
            if diff <= closest_diff {
                closest_diff = diff;
                idx = i;
            }
        }
        video_idx.min(idx)
    }

    fn initialize_interleaved_packets(&mut self) -> bool {
        let Some(video_idx) = self.find_first_packet_type_idx(MediaKind::Video) else {
            self.received_video = false;
            return false;
        };
        let Some(last_audio_idx) = self.find_last_packet_type_idx(MediaKind::Audio) else {
            self.received_audio = false;
            return false;
        };

        if self.packets[last_audio_idx].dts_usec < self.packets[video_idx].dts_usec {
            self.received_audio = false;
            return false;
        }

        let start_idx = self.get_interleaved_start_idx();
        if start_idx > 0 {
            self.discard_to_idx(start_idx);
        }

        let (Some(video_idx), Some(audio_idx)) = (
            self.find_first_packet_type_idx(MediaKind::Video),
            self.find_first_packet_type_idx(MediaKind::Audio),
        ) else {
            return false;
        };

        let video = &self.packets[video_idx];
        let audio = &self.packets[audio_idx];
        self.video_offset = video.pts;
        self.audio_offset = audio.dts;
        self.highest_video_ts = self.highest_video_ts.saturating_sub(video.dts_usec);
        self.highest_audio_ts = self.highest_audio_ts.saturating_sub(audio.dts_usec);
        debug!(
            "Interleaver synced, video_offset:{} audio_offset:{}",
            self.video_offset, self.audio_offset
        );

        let mut packets = std::mem::take(&mut self.packets);
        for packet in packets.iter_mut() {
            self.apply_interleaved_packet_offset(packet);
        }
        self.packets = packets;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // dts and dts_usec coincide with this timebase, one frame lasts 100us
    const VIDEO_TB: (i32, i32) = (100, 1_000_000);
    const AUDIO_TB: (i32, i32) = (1, 1_000_000);

    fn video(dts_usec: i64, keyframe: bool) -> EncoderPacket {
        let mut packet = EncoderPacket::new(MediaKind::Video, vec![0u8; 4], dts_usec, dts_usec, VIDEO_TB);
        packet.keyframe = keyframe;
        packet.dts_usec = dts_usec;
        packet.sys_dts_usec = dts_usec;
        packet
    }

    fn audio(dts_usec: i64) -> EncoderPacket {
        let mut packet = EncoderPacket::new(MediaKind::Audio, vec![0u8; 2], dts_usec, dts_usec, AUDIO_TB);
        packet.dts_usec = dts_usec;
        packet.sys_dts_usec = dts_usec;
        packet
    }

    fn interleaver(config: StreamConfig) -> Interleaver {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .is_test(true)
            .try_init();
        Interleaver::new(true, true, &config)
    }

    fn run(interleaver: &mut Interleaver, packets: Vec<EncoderPacket>) -> Vec<EncoderPacket> {
        let mut out = Vec::new();
        for packet in packets {
            out.extend(interleaver.push(packet));
        }
        out.extend(interleaver.flush());
        out
    }

    fn labels(packets: &[EncoderPacket]) -> Vec<(MediaKind, i64)> {
        packets.iter().map(|p| (p.kind, p.sys_dts_usec)).collect()
    }

    #[test]
    fn test_scenario_emission_order() {
        let arrivals = vec![
            audio(50),
            video(100, true),
            audio(150),
            video(200, false),
            audio(250),
            video(300, false),
        ];
        let mut interleaver = interleaver(StreamConfig::default());
        let out = run(&mut interleaver, arrivals);
        assert_eq!(
            labels(&out),
            vec![
                (MediaKind::Video, 100),
                (MediaKind::Audio, 150),
                (MediaKind::Video, 200),
                (MediaKind::Audio, 250),
                (MediaKind::Video, 300),
            ]
        );
        assert!(out[0].keyframe);
        assert_eq!(interleaver.total_frames(), 3);

        // Rebased on the first video pts and first audio dts
        assert_eq!(out[0].dts_usec, 0);
        assert_eq!(out[1].dts_usec, 0);
        assert_eq!(out[4].dts_usec, 200);
    }

    #[test]
    fn test_scenario_video_first_arrival() {
        let arrivals = vec![
            video(100, true),
            audio(50),
            audio(150),
            video(200, false),
            audio(250),
            video(300, false),
        ];
        let mut interleaver = interleaver(StreamConfig::default());
        let out = run(&mut interleaver, arrivals);
        assert_eq!(
            labels(&out).iter().map(|(_, ts)| *ts).collect::<Vec<_>>(),
            vec![100, 150, 200, 250, 300]
        );
    }

    #[test]
    fn test_leading_non_keyframes_discarded_with_stale_audio() {
        let mut interleaver = interleaver(StreamConfig::default());
        assert!(interleaver.push(audio(10)).is_empty());
        assert!(interleaver.push(audio(40)).is_empty());
        assert!(interleaver.push(video(30, false)).is_empty());
        // audio@10 is older than the rejected frame
        assert_eq!(interleaver.buffered(), 1);

        let out = run(
            &mut interleaver,
            vec![video(100, true), audio(100), video(200, false), audio(210)],
        );
        let first_video = out.iter().find(|p| p.is_video()).unwrap();
        assert!(first_video.keyframe);
        assert!(out.iter().all(|p| p.sys_dts_usec != 30));
    }

    #[test]
    fn test_tie_break_video_before_audio() {
        let mut interleaver = interleaver(StreamConfig::default());
        let out = run(
            &mut interleaver,
            vec![
                audio(0),
                video(0, true),
                audio(100),
                video(100, false),
                audio(200),
                video(200, false),
            ],
        );
        assert_eq!(
            labels(&out),
            vec![
                (MediaKind::Video, 0),
                (MediaKind::Audio, 0),
                (MediaKind::Video, 100),
                (MediaKind::Audio, 100),
                (MediaKind::Video, 200),
                (MediaKind::Audio, 200),
            ]
        );
    }

    #[test]
    fn test_missing_audio_blocks_output() {
        let mut interleaver = interleaver(StreamConfig::default());
        assert!(interleaver.push(audio(10)).is_empty());
        assert!(interleaver.push(video(500, true)).is_empty());
        // Audio ends before the video starts, wait for more audio
        assert!(!interleaver.is_synced());
        assert!(interleaver.push(video(600, false)).is_empty());
        assert!(interleaver.push(audio(520)).is_empty());
        assert!(interleaver.is_synced());
    }

    #[test]
    fn test_premature_video_restarts_on_keyframe() {
        let mut interleaver = interleaver(StreamConfig::default());
        assert!(interleaver.push(video(0, true)).is_empty());
        assert!(interleaver.push(video(100, false)).is_empty());
        assert!(interleaver.push(video(200, true)).is_empty());
        assert!(interleaver.push(audio(250)).is_empty());
        assert!(interleaver.is_synced());

        let out = run(&mut interleaver, vec![video(300, false), audio(350), video(400, false), audio(450)]);
        assert_eq!(out[0].sys_dts_usec, 200);
        assert!(out[0].keyframe);
    }

    #[test]
    fn test_prune_disabled_keeps_early_video() {
        let config = StreamConfig::default().set_prune_policy(PrunePolicy::Disabled);
        let mut interleaver = interleaver(config);
        interleaver.push(video(0, true));
        interleaver.push(video(100, false));
        interleaver.push(audio(250));
        let out = run(&mut interleaver, vec![video(200, false), audio(350)]);
        assert_eq!(out[0].sys_dts_usec, 0);
    }

    #[test]
    fn test_one_per_packet_policy() {
        let config = StreamConfig::default().set_emit_policy(EmitPolicy::OnePerPacket);
        let mut interleaver = interleaver(config);
        assert!(interleaver.push(video(0, true)).is_empty());
        // Sync happens here and one packet is released immediately
        let out = interleaver.push(audio(0));
        assert_eq!(out.len(), 1);
        assert!(out[0].is_video());
        assert_eq!(interleaver.push(video(100, false)).len(), 1);
    }

    #[test]
    fn test_single_track_passthrough() {
        let config = StreamConfig::default();
        let mut interleaver = Interleaver::new(true, false, &config);
        assert!(interleaver.push(video(0, false)).is_empty());
        assert_eq!(interleaver.push(video(100, true)).len(), 1);
        assert_eq!(interleaver.push(video(200, false)).len(), 1);
        assert_eq!(interleaver.total_frames(), 2);

        let config = StreamConfig::default().set_need_sync_packet(false);
        let mut interleaver = Interleaver::new(true, true, &config);
        let out = interleaver.push(audio(10));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_idx, 0);
    }

    /// xorshift, enough to shuffle arrivals deterministically
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn test_ordering_invariant_arbitrary_arrival() {
        for seed in 1..50u64 {
            let mut rng = Rng(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let mut videos: Vec<EncoderPacket> = (0..40)
                .map(|i| video(1_000 + i * 100, i % 10 == 0))
                .collect();
            let mut audios: Vec<EncoderPacket> = (0..60).map(|i| audio(900 + i * 70)).collect();
            videos.reverse();
            audios.reverse();

            let mut arrivals = Vec::new();
            while !videos.is_empty() || !audios.is_empty() {
                let take_video = match (videos.is_empty(), audios.is_empty()) {
                    (false, true) => true,
                    (true, false) => false,
                    _ => rng.next() % 2 == 0,
                };
                let next = if take_video { videos.pop() } else { audios.pop() };
                arrivals.extend(next);
            }

            let mut interleaver = interleaver(StreamConfig::default());
            let out = run(&mut interleaver, arrivals);
            assert!(!out.is_empty());
            assert!(out.iter().find(|p| p.is_video()).map(|p| p.keyframe).unwrap_or(false));
            for pair in out.windows(2) {
                assert!(
                    pair[0].dts_usec <= pair[1].dts_usec,
                    "seed {seed}: {:?}@{} before {:?}@{}",
                    pair[0].kind,
                    pair[0].dts_usec,
                    pair[1].kind,
                    pair[1].dts_usec
                );
                if pair[0].dts_usec == pair[1].dts_usec {
                    assert!(!(pair[0].is_audio() && pair[1].is_video()));
                }
            }
        }
    }
}
