// src/core/session.rs - Push session
//
// Core features:
// - Codec setup from stream parameters (SPS/PPS, AudioSpecificConfig)
// - Frame intake through paced media outputs
// - Status callbacks delivered on a dedicated notifier thread
// - Restartable: every start builds fresh encoders

use crate::config::{AudioInfo, StreamConfig, VideoInfo};
use crate::core::codec::{AacPassthrough, AvcPassthrough};
use crate::core::encoder::Encoder;
use crate::core::media_output::{FramePacer, MediaFrame, MediaOutput};
use crate::core::output::{OutputEvent, RtmpOutput};
use crate::core::packet::MediaKind;
use crate::error::SessionError;
use crate::rtmp::connection::Connection;
use crate::util::lock;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

type StatusCallback = Arc<dyn Fn(&OutputEvent) + Send + Sync>;

#[derive(Default)]
struct MediaSettings {
    video_info: Option<VideoInfo>,
    video_header: Option<(Bytes, Bytes)>,
    audio_info: Option<AudioInfo>,
    audio_header: Option<Bytes>,
}

struct Notifier {
    quit: Sender<()>,
    handle: JoinHandle<()>,
}

/// Live RTMP publisher for H.264 video and AAC audio.
///
/// ```rust,ignore
/// let pusher = RtmpPusher::new(StreamConfig::default())?;
/// pusher.set_video_info(1280, 720, 30);
/// pusher.set_video_header(&sps, &pps);
/// pusher.set_audio_info(44100, 2);
/// pusher.on_status(|event| println!("{event:?}"));
/// pusher.start_streaming("rtmp://localhost/live", "stream")?;
/// pusher.push_video_frame(frame, now_ns());
/// ```
pub struct RtmpPusher {
    config: StreamConfig,
    output: RtmpOutput,
    settings: Mutex<MediaSettings>,
    video_source: Arc<MediaOutput>,
    audio_source: Arc<MediaOutput>,
    pacer: Mutex<Option<FramePacer>>,
    callback: Arc<Mutex<Option<StatusCallback>>>,
    notifier: Mutex<Option<Notifier>>,
}

impl RtmpPusher {
    /// Creates a session publishing over the built-in RTMP client.
    #[cfg(feature = "rtmp")]
    pub fn new(config: StreamConfig) -> crate::error::Result<RtmpPusher> {
        Self::with_connection(config, Box::new(crate::rtmp::client::RtmpClient::new()))
    }

    /// Creates a session publishing over a custom transport.
    pub fn with_connection(config: StreamConfig, connection: Box<dyn Connection>) -> crate::error::Result<RtmpPusher> {
        let output = RtmpOutput::new(config.clone(), connection);
        let callback: Arc<Mutex<Option<StatusCallback>>> = Arc::new(Mutex::new(None));
        let notifier = spawn_notifier(output.events(), callback.clone())?;

        Ok(RtmpPusher {
            config,
            output,
            settings: Mutex::new(MediaSettings::default()),
            video_source: Arc::new(MediaOutput::new(MediaKind::Video, "video")),
            audio_source: Arc::new(MediaOutput::new(MediaKind::Audio, "audio")),
            pacer: Mutex::new(None),
            callback,
            notifier: Mutex::new(Some(notifier)),
        })
    }

    pub fn set_video_info(&self, width: u32, height: u32, fps: u32) {
        lock(&self.settings).video_info = Some(VideoInfo::new(width, height, fps));
    }

    /// Sets SPS (`csd0`) and PPS (`csd1`), with or without start codes.
    pub fn set_video_header(&self, csd0: &[u8], csd1: &[u8]) {
        lock(&self.settings).video_header = Some((Bytes::copy_from_slice(csd0), Bytes::copy_from_slice(csd1)));
    }

    pub fn set_audio_info(&self, sample_rate: u32, channels: u8) {
        lock(&self.settings).audio_info = Some(AudioInfo {
            sample_rate,
            channels,
        });
    }

    /// Sets the AudioSpecificConfig. Without it one is derived from the audio info.
    pub fn set_audio_header(&self, csd0: &[u8]) {
        lock(&self.settings).audio_header = Some(Bytes::copy_from_slice(csd0));
    }

    /// Registers the status callback. It runs on the notifier thread and must not call
    /// `on_status` itself.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(&OutputEvent) + Send + Sync + 'static,
    {
        *lock(&self.callback) = Some(Arc::new(callback));
    }

    /// Builds the encoders and starts connecting.
    ///
    /// # Arguments
    /// * `url` - `rtmp://host[:port]/app`
    /// * `stream_key` - Publishing key appended as the play path
    ///
    /// # Returns
    /// * `Err(SessionError::AlreadyStreaming)` - Stop the current stream first
    /// * `Err(SessionError::MissingVideoInfo)` - `set_video_info` was never called
    pub fn start_streaming(&self, url: &str, stream_key: &str) -> crate::error::Result<()> {
        if self.output.is_streaming() {
            return Err(SessionError::AlreadyStreaming.into());
        }

        let (video_info, has_audio) = {
            let settings = lock(&self.settings);
            let Some(video_info) = settings.video_info else {
                return Err(SessionError::MissingVideoInfo.into());
            };

            let mut video_codec = AvcPassthrough::new(video_info);
            if let Some((csd0, csd1)) = &settings.video_header {
                video_codec = video_codec.with_header(csd0, csd1)?;
            }
            let video = Encoder::new("video", Box::new(video_codec), self.video_source.clone());
            self.output.set_video_encoder(Some((video, video_info)))?;

            let audio = settings.audio_info.map(|info| {
                let header = settings.audio_header.as_deref().unwrap_or(&[]);
                let codec = AacPassthrough::new(info, header);
                (Encoder::new("audio", Box::new(codec), self.audio_source.clone()), info)
            });
            let has_audio = audio.is_some();
            self.output.set_audio_encoder(audio)?;
            (video_info, has_audio)
        };

        self.video_source.open()?;
        if has_audio {
            self.audio_source.open()?;
        }
        *lock(&self.pacer) = self
            .config
            .pace_video
            .then(|| FramePacer::new(Duration::from_nanos(video_info.frame_interval_ns())));

        info!("Start streaming to {url}");
        self.output.start(url, stream_key)
    }

    /// Stops after sending what was captured up to now.
    pub fn stop_streaming(&self) -> crate::error::Result<()> {
        if !self.output.is_streaming() {
            return Err(SessionError::NotStreaming.into());
        }
        self.output.stop();
        Ok(())
    }

    /// Stops immediately, dropping queued packets.
    pub fn force_stop(&self) {
        self.output.force_stop();
    }

    /// Pushes one H.264 access unit (Annex-B or length-prefixed).
    ///
    /// # Arguments
    /// * `timestamp_ns` - Capture time on the [`now_ns`](crate::util::time::now_ns) clock
    pub fn push_video_frame(&self, data: impl Into<Bytes>, timestamp_ns: u64) {
        if let Some(pacer) = lock(&self.pacer).as_mut() {
            pacer.wait();
        }
        self.video_source.update_input_frame(MediaFrame::new(data, timestamp_ns));
    }

    /// Pushes one raw AAC frame.
    pub fn push_audio_frame(&self, data: impl Into<Bytes>, timestamp_ns: u64) {
        self.audio_source.update_input_frame(MediaFrame::new(data, timestamp_ns));
    }

    pub fn is_streaming(&self) -> bool {
        self.output.is_streaming()
    }

    /// Connected and sending.
    pub fn is_active(&self) -> bool {
        self.output.is_active()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.output.is_reconnecting()
    }

    pub fn total_bytes(&self) -> u64 {
        self.output.total_bytes()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.output.dropped_frames()
    }

    /// 0.0 (idle) to 1.0 (dropping).
    pub fn congestion(&self) -> f32 {
        self.output.congestion()
    }

    pub fn total_frames(&self) -> u64 {
        self.output.total_frames()
    }

    pub fn connect_time_ms(&self) -> u64 {
        self.output.connect_time_ms()
    }

    pub fn last_error(&self) -> Option<String> {
        self.output.last_error()
    }
}

impl Drop for RtmpPusher {
    fn drop(&mut self) {
        self.output.force_stop();
        self.output.join();

        if let Some(notifier) = lock(&self.notifier).take() {
            let _ = notifier.quit.send(());
            if notifier.handle.join().is_err() {
                error!("Status notifier thread panicked");
            }
        }

        self.video_source.close();
        self.audio_source.close();
    }
}

fn spawn_notifier(
    events: Receiver<OutputEvent>,
    callback: Arc<Mutex<Option<StatusCallback>>>,
) -> crate::error::Result<Notifier> {
    let (quit, quit_rx) = crossbeam_channel::bounded::<()>(1);
    let result = std::thread::Builder::new()
        .name("rtmp-status".to_string())
        .spawn(move || {
            let deliver = |event: &OutputEvent| {
                let callback = lock(&callback).clone();
                if let Some(callback) = callback {
                    callback(event);
                }
            };
            loop {
                crossbeam_channel::select! {
                    recv(events) -> event => match event {
                        Ok(event) => deliver(&event),
                        Err(_) => break,
                    },
                    recv(quit_rx) -> _ => {
                        for event in events.try_iter() {
                            deliver(&event);
                        }
                        break;
                    }
                }
            }
            debug!("Status notifier finished");
        });

    match result {
        Ok(handle) => Ok(Notifier { quit, handle }),
        Err(e) => {
            error!("Status notifier thread exited with error: {e}");
            Err(crate::error::OutputError::ThreadExited.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectionError, StopCode};
    use crate::flv::flv_buffer::FlvBuffer;
    use crate::flv::flv_tag::FlvTag;
    use crate::flv::packager::FLV_TAG_VIDEO;
    use crate::rtmp::connection::mock::MockConnection;
    use crate::util::time::now_ns;
    use std::time::Instant;

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, 0xAB];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];

    fn init_log() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .is_test(true)
            .try_init();
    }

    fn build_pusher(config: StreamConfig) -> (RtmpPusher, MockConnection, Receiver<OutputEvent>) {
        init_log();
        let mock = MockConnection::new();
        let pusher = RtmpPusher::with_connection(config, Box::new(mock.clone())).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        pusher.on_status(move |event| {
            let _ = tx.send(event.clone());
        });
        (pusher, mock, rx)
    }

    fn wait_event(rx: &Receiver<OutputEvent>, want: impl Fn(&OutputEvent) -> bool) -> Vec<OutputEvent> {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let done = want(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn wait_for_writes(mock: &MockConnection, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while mock.written().len() < count {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    fn video_tags(mock: &MockConnection) -> Vec<FlvTag> {
        let mut buffer = FlvBuffer::new();
        buffer.write_data(&mock.written_bytes());
        std::iter::from_fn(|| buffer.get_flv_tag())
            .filter(|tag| tag.header.tag_type == FLV_TAG_VIDEO)
            .collect()
    }

    fn frame(keyframe: bool) -> Vec<u8> {
        if keyframe {
            vec![0, 0, 0, 1, 0x65, 0x88, 0x84]
        } else {
            vec![0, 0, 0, 1, 0x41, 0x9A]
        }
    }

    #[test]
    fn test_start_requires_video_info() {
        let (pusher, _mock, _rx) = build_pusher(StreamConfig::default());
        assert!(matches!(
            pusher.start_streaming("rtmp://127.0.0.1/live", "key"),
            Err(crate::error::Error::Session(SessionError::MissingVideoInfo))
        ));
        assert!(matches!(
            pusher.stop_streaming(),
            Err(crate::error::Error::Session(SessionError::NotStreaming))
        ));
        assert!(!pusher.is_streaming());
    }

    #[test]
    fn test_invalid_video_header_rejected() {
        let (pusher, _mock, _rx) = build_pusher(StreamConfig::default());
        pusher.set_video_info(640, 360, 30);
        pusher.set_video_header(&[0, 0, 0, 1, 0x67], &[]);
        assert!(matches!(
            pusher.start_streaming("rtmp://127.0.0.1/live", "key"),
            Err(crate::error::Error::Encode(_))
        ));
        assert!(!pusher.is_streaming());
    }

    #[test]
    fn test_push_video_end_to_end() {
        let (pusher, mock, rx) = build_pusher(StreamConfig::default().set_pace_video(false));
        pusher.set_video_info(640, 360, 30);
        pusher.set_video_header(SPS, PPS);
        pusher.start_streaming("rtmp://127.0.0.1/live", "key").unwrap();
        assert!(matches!(
            pusher.start_streaming("rtmp://127.0.0.1/live", "key"),
            Err(crate::error::Error::Session(SessionError::AlreadyStreaming))
        ));
        wait_event(&rx, |e| *e == OutputEvent::Start);
        assert!(pusher.is_active());

        // metadata, then the video header together with the first frame
        pusher.push_video_frame(frame(true), now_ns());
        assert!(wait_for_writes(&mock, 3));
        for _ in 0..3 {
            let before = mock.written().len();
            pusher.push_video_frame(frame(false), now_ns());
            assert!(wait_for_writes(&mock, before + 1));
        }

        pusher.stop_streaming().unwrap();
        let end = wait_event(&rx, |e| matches!(e, OutputEvent::Stop { .. }));
        assert_eq!(
            end.last(),
            Some(&OutputEvent::Stop {
                code: StopCode::Success,
                message: None
            })
        );

        let tags = video_tags(&mock);
        assert_eq!(tags.len(), 5);
        assert!(tags[0].video_info().unwrap().is_sequence_header);
        assert!(tags[1].video_info().unwrap().keyframe);
        assert_eq!(tags[1].timestamp_ms(), 0);
        // 30 fps timebase
        let timestamps: Vec<u32> = tags[1..].iter().map(|t| t.timestamp_ms()).collect();
        assert_eq!(timestamps, vec![0, 33, 66, 100]);
        assert_eq!(pusher.total_frames(), 4);
        assert!(pusher.total_bytes() > 0);
    }

    #[test]
    fn test_restart_after_stop() {
        let (pusher, mock, rx) = build_pusher(StreamConfig::default().set_pace_video(false));
        pusher.set_video_info(640, 360, 30);
        pusher.set_video_header(SPS, PPS);
        pusher.set_audio_info(44100, 2);

        for round in 1..=2 {
            pusher.start_streaming("rtmp://127.0.0.1/live", "key").unwrap();
            wait_event(&rx, |e| *e == OutputEvent::Start);
            pusher.force_stop();
            wait_event(&rx, |e| matches!(e, OutputEvent::Stop { .. }));
            assert_eq!(mock.connect_count(), round);
        }
        assert!(!pusher.is_streaming());
    }

    #[test]
    fn test_connect_failure_reported_through_callback() {
        let (pusher, mock, rx) = build_pusher(StreamConfig::default());
        mock.push_connect_result(Err(ConnectionError::BadPath("nope".into())));
        pusher.set_video_info(640, 360, 30);
        pusher.start_streaming("nope", "key").unwrap();

        let events = wait_event(&rx, |e| matches!(e, OutputEvent::Stop { .. }));
        assert_eq!(events[0], OutputEvent::Starting);
        match events.last() {
            Some(OutputEvent::Stop { code, message }) => {
                assert_eq!(*code, StopCode::BadPath);
                assert_eq!(message.as_deref(), Some("Invalid RTMP url: nope"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!pusher.is_streaming());
    }

    #[test]
    fn test_drop_stops_streaming() {
        let (pusher, mock, rx) = build_pusher(StreamConfig::default());
        pusher.set_video_info(640, 360, 30);
        pusher.start_streaming("rtmp://127.0.0.1/live", "key").unwrap();
        wait_event(&rx, |e| *e == OutputEvent::Start);

        drop(pusher);
        let events: Vec<OutputEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, OutputEvent::Stop { .. })), "{events:?}");
        assert_eq!(mock.close_count(), 1);
    }
}
