// src/core/encoder.rs - Encoder lifecycle and packet fan-out
//
// Core features:
// - Reference-counted subscribers, first start attaches to the media source
// - Epoch rebasing so paired encoders share a zero point
// - Per-subscriber keyframe gate for video
// - Audio/video start alignment for paired encoders
// - Fatal encode errors stop every subscriber
//
// Lock order: `lifecycle` -> `callbacks`. The delivery thread takes `timing`,
// `codec` and `callbacks` but never `lifecycle`, so `stop` may wait for delivery
// to finish while detaching from the source.

use crate::core::codec::{Codec, EncoderFrame};
use crate::core::media_output::{Delivery, FrameListener, MediaFrame, MediaOutput, same_listener};
use crate::core::packet::{EncoderPacket, MediaKind};
use crate::error::EncodeError;
use crate::util::lock;
use crate::util::ring_buffer::RingBuffer;
use bytes::Bytes;
use log::{debug, error, info, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Receives every packet an encoder produces.
pub trait PacketListener: Send + Sync {
    fn on_packet(&self, packet: &EncoderPacket);

    /// The encoder failed and dropped this listener.
    fn on_error(&self, _error: &EncodeError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Initialized,
    Active,
    Inactive,
    Destroyed,
}

struct Subscriber {
    listener: Arc<dyn PacketListener>,
    sent_first_packet: bool,
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    destroy_on_stop: bool,
    destroyed: bool,
    ever_started: bool,
}

#[derive(Default)]
struct Timing {
    cur_pts: i64,
    offset_usec: i64,
    offset_captured: bool,
    audio_buffer: RingBuffer,
}

/// Adapter registered with the [`MediaOutput`].
struct EncoderInput {
    encoder: Weak<Encoder>,
}

impl FrameListener for EncoderInput {
    fn on_frame(&self, frame: &MediaFrame) -> Delivery {
        match self.encoder.upgrade() {
            Some(encoder) => encoder.receive_frame(frame),
            None => Delivery::Detach,
        }
    }
}

pub struct Encoder {
    kind: MediaKind,
    name: String,
    lifecycle: Mutex<Lifecycle>,
    active: AtomicBool,
    first_received: AtomicBool,
    first_raw_ts: AtomicU64,
    start_ts: AtomicU64,
    paired: Mutex<Weak<Encoder>>,
    timing: Mutex<Timing>,
    callbacks: Mutex<Vec<Subscriber>>,
    codec: Mutex<Box<dyn Codec>>,
    source: Arc<MediaOutput>,
    input: Arc<dyn FrameListener>,
}

impl Encoder {
    /// Creates an encoder fed by `source`.
    pub fn new(name: impl Into<String>, codec: Box<dyn Codec>, source: Arc<MediaOutput>) -> Arc<Encoder> {
        let kind = codec.kind();
        Arc::new_cyclic(|weak| Encoder {
            kind,
            name: name.into(),
            lifecycle: Mutex::new(Lifecycle::default()),
            active: AtomicBool::new(false),
            first_received: AtomicBool::new(false),
            first_raw_ts: AtomicU64::new(0),
            start_ts: AtomicU64::new(0),
            paired: Mutex::new(Weak::new()),
            timing: Mutex::new(Timing::default()),
            callbacks: Mutex::new(Vec::new()),
            codec: Mutex::new(codec),
            source,
            input: Arc::new(EncoderInput { encoder: weak.clone() }),
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EncoderState {
        let lifecycle = lock(&self.lifecycle);
        if lifecycle.destroyed {
            EncoderState::Destroyed
        } else if self.is_active() {
            EncoderState::Active
        } else if lifecycle.initialized {
            EncoderState::Initialized
        } else if lifecycle.ever_started {
            EncoderState::Inactive
        } else {
            EncoderState::Uninitialized
        }
    }

    pub fn header(&self) -> Option<Bytes> {
        lock(&self.codec).header()
    }

    pub fn timebase(&self) -> (i32, i32) {
        lock(&self.codec).timebase()
    }

    pub fn sample_rate(&self) -> u32 {
        lock(&self.codec).sample_rate()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Session start time (ns) of this encoder, zero until the first frame is accepted.
    pub fn start_ts(&self) -> u64 {
        self.start_ts.load(Ordering::Acquire)
    }

    pub fn paired_encoder(&self) -> Option<Arc<Encoder>> {
        lock(&self.paired).upgrade()
    }

    /// Prepares the codec. Does nothing while active or already initialized.
    pub fn initialize(&self) -> Result<(), EncodeError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.destroyed {
            return Err(EncodeError::Destroyed);
        }
        if self.is_active() || lifecycle.initialized {
            return Ok(());
        }

        lock(&self.codec).initialize()?;
        lifecycle.initialized = true;
        debug!("Encoder {} initialized", self.name);
        Ok(())
    }

    /// Subscribes `listener` to encoded packets. The first subscriber attaches the encoder
    /// to its source. Subscribing twice is a no-op.
    pub fn start(&self, listener: Arc<dyn PacketListener>) -> Result<(), EncodeError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.destroyed {
            return Err(EncodeError::Destroyed);
        }
        if !lifecycle.initialized {
            error!("Encoder {} started before initialize", self.name);
            return Err(EncodeError::NotInitialized);
        }

        let first = {
            let mut callbacks = lock(&self.callbacks);
            if callbacks.iter().any(|sub| same_listener(&sub.listener, &listener)) {
                return Ok(());
            }
            callbacks.push(Subscriber {
                listener,
                sent_first_packet: false,
            });
            callbacks.len() == 1
        };

        if first {
            lock(&self.timing).cur_pts = 0;
            lifecycle.ever_started = true;
            self.add_connection();
        }
        Ok(())
    }

    /// Unsubscribes `listener`. The last unsubscribe detaches from the source and completes a
    /// deferred [`destroy`](Encoder::destroy).
    pub fn stop(&self, listener: &Arc<dyn PacketListener>) {
        let mut lifecycle = lock(&self.lifecycle);

        let last = {
            let mut callbacks = lock(&self.callbacks);
            let Some(idx) = callbacks.iter().position(|sub| same_listener(&sub.listener, listener)) else {
                return;
            };
            callbacks.remove(idx);
            callbacks.is_empty()
        };

        if last {
            self.remove_connection();
            lifecycle.initialized = false;
            if lifecycle.destroy_on_stop {
                self.actually_destroy(&mut lifecycle);
            }
        }
    }

    /// Releases the codec, or defers that until the last subscriber stops.
    pub fn destroy(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.destroyed {
            return;
        }
        if lock(&self.callbacks).is_empty() {
            self.actually_destroy(&mut lifecycle);
        } else {
            debug!("Encoder {} destroy deferred until stop", self.name);
            lifecycle.destroy_on_stop = true;
        }
    }

    fn actually_destroy(&self, lifecycle: &mut Lifecycle) {
        self.source.disconnect(&self.input);
        lock(&self.codec).on_destroy();
        lifecycle.destroyed = true;
        lifecycle.initialized = false;
        debug!("Encoder {} destroyed", self.name);
    }

    fn add_connection(&self) {
        lock(&self.codec).on_attach();
        self.active.store(true, Ordering::Release);
        self.source.connect(self.input.clone());
        info!("Encoder {} attached to {}", self.name, self.source.name());
    }

    fn remove_connection(&self) {
        self.source.disconnect(&self.input);
        lock(&self.codec).on_detach();
        self.shutdown();
        info!("Encoder {} detached from {}", self.name, self.source.name());
    }

    fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        let pair = std::mem::take(&mut *lock(&self.paired));
        if let Some(pair) = pair.upgrade() {
            *lock(&pair.paired) = Weak::new();
        }
        self.first_received.store(false, Ordering::Release);
        self.first_raw_ts.store(0, Ordering::Release);
        self.start_ts.store(0, Ordering::Release);

        let mut timing = lock(&self.timing);
        timing.offset_usec = 0;
        timing.offset_captured = false;
        timing.audio_buffer.clear();
    }

    /// Drops every subscriber after a fatal encode error.
    fn full_stop(&self, e: &EncodeError) {
        error!("Encoder {} failed, stopping all subscribers", self.name);
        let subscribers = std::mem::take(&mut *lock(&self.callbacks));
        lock(&self.codec).on_detach();
        self.shutdown();
        for sub in subscribers.iter().rev() {
            sub.listener.on_error(e);
        }
    }

    /// Pairs an audio and a video encoder so their start points align.
    ///
    /// Locks audio before video. Fails when either is active or already paired.
    pub fn pair(audio: &Arc<Encoder>, video: &Arc<Encoder>) -> bool {
        if audio.kind != MediaKind::Audio || video.kind != MediaKind::Video {
            return false;
        }

        let _audio_lifecycle = lock(&audio.lifecycle);
        let _video_lifecycle = lock(&video.lifecycle);
        if audio.is_active() || video.is_active() {
            return false;
        }

        let mut audio_pair = lock(&audio.paired);
        let mut video_pair = lock(&video.paired);
        if audio_pair.upgrade().is_some() || video_pair.upgrade().is_some() {
            return false;
        }
        *audio_pair = Arc::downgrade(video);
        *video_pair = Arc::downgrade(audio);
        debug!("Paired encoders {} and {}", audio.name, video.name);
        true
    }

    fn receive_frame(&self, frame: &MediaFrame) -> Delivery {
        if !self.is_active() {
            return Delivery::Detach;
        }

        let result = match self.kind {
            MediaKind::Video => self.receive_video(frame),
            MediaKind::Audio => self.receive_audio(frame),
        };
        match result {
            Ok(()) => Delivery::Continue,
            Err(_) => Delivery::Detach,
        }
    }

    fn receive_video(&self, frame: &MediaFrame) -> Result<(), EncodeError> {
        if !self.first_received.load(Ordering::Acquire) {
            if let Some(pair) = self.paired_encoder() {
                if !pair.first_received.load(Ordering::Acquire)
                    || pair.first_raw_ts.load(Ordering::Acquire) > frame.timestamp
                {
                    trace!("Video frame {} waits for audio", frame.timestamp);
                    return Ok(());
                }
            }
        }

        let _ = self
            .start_ts
            .compare_exchange(0, frame.timestamp, Ordering::AcqRel, Ordering::Acquire);

        let (num, _) = self.timebase();
        let pts = {
            let mut timing = lock(&self.timing);
            let pts = timing.cur_pts;
            timing.cur_pts += num as i64;
            pts
        };
        self.do_encode(EncoderFrame::new(frame.data.clone(), 1, pts))
    }

    fn receive_audio(&self, frame: &MediaFrame) -> Result<(), EncodeError> {
        if !self.first_received.load(Ordering::Acquire) {
            self.first_raw_ts.store(frame.timestamp, Ordering::Release);
            self.first_received.store(true, Ordering::Release);
            lock(&self.timing).audio_buffer.clear();
        }

        let (block_size, frame_size, sample_rate) = {
            let codec = lock(&self.codec);
            (codec.input_block_size(), codec.frame_size().max(1), codec.sample_rate().max(1))
        };

        match block_size {
            Some(block_size) => self.receive_pcm(frame, block_size, frame_size, sample_rate),
            None => {
                let end_ts = frame.timestamp + frame_size as u64 * 1_000_000_000 / sample_rate as u64;
                if !self.sync_audio_start(frame.timestamp, end_ts) {
                    return Ok(());
                }
                let pts = {
                    let mut timing = lock(&self.timing);
                    let pts = timing.cur_pts;
                    timing.cur_pts += frame_size as i64;
                    pts
                };
                self.do_encode(EncoderFrame::new(frame.data.clone(), frame_size, pts))
            }
        }
    }

    /// Decides whether audio spanning `[ts, end_ts)` may start. Sets the audio start time.
    fn sync_audio_start(&self, ts: u64, end_ts: u64) -> bool {
        if self.start_ts.load(Ordering::Acquire) != 0 {
            return true;
        }

        match self.paired_encoder() {
            Some(pair) => {
                let v_start_ts = pair.start_ts.load(Ordering::Acquire);
                // no video yet, or audio still ends before video starts
                if v_start_ts == 0 || end_ts <= v_start_ts {
                    return false;
                }
                self.start_ts.store(v_start_ts, Ordering::Release);
            }
            None => self.start_ts.store(ts, Ordering::Release),
        }
        true
    }

    fn receive_pcm(&self, frame: &MediaFrame, block_size: usize, frame_size: u32, sample_rate: u32) -> Result<(), EncodeError> {
        let block_size = block_size.max(1);
        let frames = frame.data.len() / block_size;
        let end_ts = frame.timestamp + frames as u64 * 1_000_000_000 / sample_rate as u64;
        let was_started = self.start_ts.load(Ordering::Acquire) != 0;
        let ready = self.sync_audio_start(frame.timestamp, end_ts);

        {
            let mut timing = lock(&self.timing);
            timing.audio_buffer.push_back(&frame.data);
            if ready && !was_started {
                // Drop buffered audio captured before the shared start point
                let start_ts = self.start_ts.load(Ordering::Acquire);
                let first_raw_ts = self.first_raw_ts.load(Ordering::Acquire);
                if first_raw_ts < start_ts {
                    let offset = calc_offset_size(start_ts - first_raw_ts, sample_rate, block_size);
                    timing.audio_buffer.advance(offset);
                }
            }
        }
        if !ready {
            return Ok(());
        }

        let packet_bytes = block_size * frame_size as usize;
        loop {
            let (data, pts) = {
                let mut timing = lock(&self.timing);
                if timing.audio_buffer.size() < packet_bytes {
                    break;
                }
                let data = timing.audio_buffer.pop_front_vec(packet_bytes);
                let pts = timing.cur_pts;
                timing.cur_pts += frame_size as i64;
                (data, pts)
            };
            self.do_encode(EncoderFrame::new(data, frame_size, pts))?;
        }
        Ok(())
    }

    /// Encodes one frame and fans the resulting packet out to subscribers.
    ///
    /// An encode failure is fatal: every subscriber is dropped.
    pub fn do_encode(&self, frame: EncoderFrame) -> Result<(), EncodeError> {
        let result = lock(&self.codec).encode(&frame);
        match result {
            Ok(Some(packet)) => {
                self.send_off_encoder_packet(packet);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                error!("Error encoding with encoder {}: {e}", self.name);
                self.full_stop(&e);
                Err(e)
            }
        }
    }

    fn send_off_encoder_packet(&self, mut packet: EncoderPacket) {
        let offset_usec = {
            let mut timing = lock(&self.timing);
            if !timing.offset_captured {
                timing.offset_usec = packet.get_dts_usec();
                timing.offset_captured = true;
                self.first_received.store(true, Ordering::Release);
            }
            timing.offset_usec
        };

        let start_ts = self.start_ts.load(Ordering::Acquire) as i64;
        packet.dts_usec = start_ts / 1000 + packet.get_dts_usec() - offset_usec;
        packet.sys_dts_usec = packet.dts_usec;

        let mut callbacks = lock(&self.callbacks);
        for sub in callbacks.iter_mut().rev() {
            if packet.is_video() && !sub.sent_first_packet {
                if !packet.keyframe {
                    continue;
                }
                sub.sent_first_packet = true;
            }
            sub.listener.on_packet(&packet);
        }
    }
}

/// Bytes covering `duration_ns` of audio.
fn calc_offset_size(duration_ns: u64, sample_rate: u32, block_size: usize) -> usize {
    let frames = duration_ns as u128 * sample_rate as u128 / 1_000_000_000u128;
    frames as usize * block_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioInfo, VideoInfo};
    use crate::core::codec::{AacPassthrough, AvcPassthrough};
    use std::time::Duration;

    struct Recorder {
        packets: Mutex<Vec<EncoderPacket>>,
        errors: AtomicU64,
    }

    impl Recorder {
        fn new() -> Arc<Recorder> {
            Arc::new(Recorder {
                packets: Mutex::new(Vec::new()),
                errors: AtomicU64::new(0),
            })
        }

        fn packets(&self) -> Vec<EncoderPacket> {
            lock(&self.packets).clone()
        }
    }

    impl PacketListener for Recorder {
        fn on_packet(&self, packet: &EncoderPacket) {
            lock(&self.packets).push(packet.clone());
        }

        fn on_error(&self, _error: &EncodeError) {
            self.errors.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Raw PCM "codec": 16-bit mono, 4 samples per packet, fails on an empty frame.
    struct PcmTestCodec {
        attached: Arc<AtomicBool>,
    }

    impl Codec for PcmTestCodec {
        fn kind(&self) -> MediaKind {
            MediaKind::Audio
        }

        fn name(&self) -> &str {
            "pcm-test"
        }

        fn timebase(&self) -> (i32, i32) {
            (1, 1000)
        }

        fn encode(&mut self, frame: &EncoderFrame) -> Result<Option<EncoderPacket>, EncodeError> {
            if frame.data.is_empty() {
                return Err(EncodeError::InvalidFrame("empty".into()));
            }
            let mut packet = EncoderPacket::new(MediaKind::Audio, frame.data.clone(), frame.pts, frame.pts, self.timebase());
            packet.keyframe = true;
            Ok(Some(packet))
        }

        fn header(&self) -> Option<Bytes> {
            None
        }

        fn frame_size(&self) -> u32 {
            4
        }

        fn input_block_size(&self) -> Option<usize> {
            Some(2)
        }

        fn sample_rate(&self) -> u32 {
            1000
        }

        fn on_attach(&mut self) {
            self.attached.store(true, Ordering::Release);
        }

        fn on_detach(&mut self) {
            self.attached.store(false, Ordering::Release);
        }
    }

    fn init_log() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .is_test(true)
            .try_init();
    }

    fn video_encoder() -> (Arc<Encoder>, Arc<MediaOutput>) {
        let source = Arc::new(MediaOutput::new(MediaKind::Video, "video"));
        let codec = AvcPassthrough::new(VideoInfo::new(320, 240, 10));
        (Encoder::new("h264", Box::new(codec), source.clone()), source)
    }

    const IDR: [u8; 6] = [0, 0, 0, 1, 0x65, 0x88];
    const SLICE: [u8; 6] = [0, 0, 0, 1, 0x41, 0x9A];

    #[test]
    fn test_lifecycle_and_idempotent_subscribe() {
        init_log();
        let (encoder, source) = video_encoder();
        assert_eq!(encoder.state(), EncoderState::Uninitialized);

        let recorder = Recorder::new();
        let listener: Arc<dyn PacketListener> = recorder.clone();
        assert!(matches!(encoder.start(listener.clone()), Err(EncodeError::NotInitialized)));

        encoder.initialize().unwrap();
        encoder.initialize().unwrap();
        assert_eq!(encoder.state(), EncoderState::Initialized);

        encoder.start(listener.clone()).unwrap();
        encoder.start(listener.clone()).unwrap();
        assert_eq!(encoder.subscriber_count(), 1);
        assert_eq!(source.listener_count(), 1);
        assert_eq!(encoder.state(), EncoderState::Active);

        let other: Arc<dyn PacketListener> = Recorder::new();
        encoder.stop(&other);
        assert_eq!(encoder.subscriber_count(), 1);

        encoder.stop(&listener);
        assert_eq!(source.listener_count(), 0);
        assert_eq!(encoder.state(), EncoderState::Inactive);
    }

    #[test]
    fn test_video_keyframe_gate_and_reverse_fanout() {
        init_log();
        let (encoder, _source) = video_encoder();
        encoder.initialize().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        struct Tagged(&'static str, Arc<Mutex<Vec<(&'static str, i64)>>>);
        impl PacketListener for Tagged {
            fn on_packet(&self, packet: &EncoderPacket) {
                lock(&self.1).push((self.0, packet.pts));
            }
        }

        let first: Arc<dyn PacketListener> = Arc::new(Tagged("first", order.clone()));
        let second: Arc<dyn PacketListener> = Arc::new(Tagged("second", order.clone()));
        encoder.start(first.clone()).unwrap();
        encoder.start(second.clone()).unwrap();

        encoder.do_encode(EncoderFrame::new(SLICE.to_vec(), 1, 0)).unwrap();
        encoder.do_encode(EncoderFrame::new(IDR.to_vec(), 1, 1)).unwrap();
        encoder.do_encode(EncoderFrame::new(SLICE.to_vec(), 1, 2)).unwrap();

        assert_eq!(
            *lock(&order),
            vec![("second", 1), ("first", 1), ("second", 2), ("first", 2)]
        );
        encoder.stop(&first);
        encoder.stop(&second);
    }

    #[test]
    fn test_dts_usec_rebased_on_first_packet() {
        init_log();
        let (encoder, _source) = video_encoder();
        encoder.initialize().unwrap();
        let recorder = Recorder::new();
        encoder.start(recorder.clone()).unwrap();
        encoder.start_ts.store(5_000_000_000, Ordering::Release);

        encoder.do_encode(EncoderFrame::new(IDR.to_vec(), 1, 7)).unwrap();
        encoder.do_encode(EncoderFrame::new(SLICE.to_vec(), 1, 8)).unwrap();

        let packets = recorder.packets();
        // 10fps timebase, first packet defines the zero point
        assert_eq!(packets[0].dts_usec, 5_000_000);
        assert_eq!(packets[1].dts_usec, 5_100_000);
        assert_eq!(packets[1].sys_dts_usec, packets[1].dts_usec);
    }

    #[test]
    fn test_deferred_destroy() {
        init_log();
        let (encoder, _source) = video_encoder();
        encoder.initialize().unwrap();
        let listener: Arc<dyn PacketListener> = Recorder::new();
        encoder.start(listener.clone()).unwrap();

        encoder.destroy();
        assert_eq!(encoder.state(), EncoderState::Active);
        encoder.stop(&listener);
        assert_eq!(encoder.state(), EncoderState::Destroyed);
        assert!(matches!(encoder.initialize(), Err(EncodeError::Destroyed)));
    }

    #[test]
    fn test_pairing_rules() {
        init_log();
        let (video, _vsource) = video_encoder();
        let asource = Arc::new(MediaOutput::new(MediaKind::Audio, "audio"));
        let audio = Encoder::new("aac", Box::new(AacPassthrough::new(AudioInfo::default(), &[])), asource);

        assert!(!Encoder::pair(&video, &audio));
        assert!(Encoder::pair(&audio, &video));
        assert!(!Encoder::pair(&audio, &video));
        assert!(Arc::ptr_eq(&audio.paired_encoder().unwrap(), &video));

        // Stopping clears the pairing on both sides
        video.initialize().unwrap();
        let listener: Arc<dyn PacketListener> = Recorder::new();
        video.start(listener.clone()).unwrap();
        video.stop(&listener);
        assert!(audio.paired_encoder().is_none());
    }

    #[test]
    fn test_encode_failure_is_full_stop() {
        init_log();
        let source = Arc::new(MediaOutput::new(MediaKind::Audio, "pcm"));
        let attached = Arc::new(AtomicBool::new(false));
        let encoder = Encoder::new(
            "pcm",
            Box::new(PcmTestCodec {
                attached: attached.clone(),
            }),
            source,
        );
        encoder.initialize().unwrap();
        let recorder = Recorder::new();
        encoder.start(recorder.clone()).unwrap();
        assert!(attached.load(Ordering::Acquire));

        assert!(encoder.do_encode(EncoderFrame::new(Vec::new(), 0, 0)).is_err());
        assert_eq!(recorder.errors.load(Ordering::Acquire), 1);
        assert_eq!(encoder.subscriber_count(), 0);
        assert!(!encoder.is_active());
        assert!(!attached.load(Ordering::Acquire));
    }

    #[test]
    fn test_pcm_framing_trims_to_video_start() {
        init_log();
        let vsource = Arc::new(MediaOutput::new(MediaKind::Video, "video"));
        let video = Encoder::new("h264", Box::new(AvcPassthrough::new(VideoInfo::new(0, 0, 10))), vsource.clone());
        let asource = Arc::new(MediaOutput::new(MediaKind::Audio, "pcm"));
        let audio = Encoder::new(
            "pcm",
            Box::new(PcmTestCodec {
                attached: Arc::new(AtomicBool::new(false)),
            }),
            asource.clone(),
        );
        assert!(Encoder::pair(&audio, &video));

        audio.initialize().unwrap();
        video.initialize().unwrap();
        let arec = Recorder::new();
        let vrec = Recorder::new();
        audio.start(arec.clone()).unwrap();
        video.start(vrec.clone()).unwrap();

        let ms = 1_000_000u64;
        // 1kHz, 2 bytes per sample: 8 samples = 8ms starting at 100ms
        let pcm: Vec<u8> = (0u8..16).collect();
        assert!(audio.receive_frame(&MediaFrame::new(pcm, 100 * ms)) == Delivery::Continue);
        // No video yet, audio is only buffered
        assert!(arec.packets().is_empty());

        // Video frame at 104ms becomes the shared start
        assert!(video.receive_frame(&MediaFrame::new(IDR.to_vec(), 104 * ms)) == Delivery::Continue);
        assert_eq!(video.start_ts(), 104 * ms);
        assert_eq!(vrec.packets().len(), 1);

        // Next audio chunk triggers the start: 4 samples (8 bytes) trimmed
        let pcm: Vec<u8> = (16u8..24).collect();
        audio.receive_frame(&MediaFrame::new(pcm, 108 * ms));
        let packets = arec.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data.as_ref(), &[8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(packets[0].pts, 0);
        assert_eq!(packets[1].pts, 4);
        assert_eq!(packets[0].dts_usec, 104_000);
        assert_eq!(packets[1].dts_usec, 108_000);

        let alistener: Arc<dyn PacketListener> = arec;
        let vlistener: Arc<dyn PacketListener> = vrec;
        audio.stop(&alistener);
        video.stop(&vlistener);
        std::thread::sleep(Duration::from_millis(1));
    }

    #[test]
    fn test_video_waits_for_paired_audio() {
        init_log();
        let (video, _vsource) = video_encoder();
        let asource = Arc::new(MediaOutput::new(MediaKind::Audio, "audio"));
        let audio = Encoder::new("aac", Box::new(AacPassthrough::new(AudioInfo::default(), &[])), asource);
        assert!(Encoder::pair(&audio, &video));
        video.initialize().unwrap();
        audio.initialize().unwrap();
        let vrec = Recorder::new();
        let arec = Recorder::new();
        video.start(vrec.clone()).unwrap();
        audio.start(arec.clone()).unwrap();

        video.receive_frame(&MediaFrame::new(IDR.to_vec(), 1_000));
        assert!(vrec.packets().is_empty());

        // Audio's first raw frame is later than the next video frame: still waiting
        audio.receive_frame(&MediaFrame::new(vec![0x21, 0x00], 3_000));
        video.receive_frame(&MediaFrame::new(IDR.to_vec(), 2_000));
        assert!(vrec.packets().is_empty());

        video.receive_frame(&MediaFrame::new(IDR.to_vec(), 3_000));
        assert_eq!(vrec.packets().len(), 1);
        assert_eq!(video.start_ts(), 3_000);

        // Audio now starts aligned to video
        audio.receive_frame(&MediaFrame::new(vec![0x21, 0x00], 3_500));
        let packets = arec.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pts, 0);
        assert_eq!(audio.start_ts(), 3_000);
    }
}
