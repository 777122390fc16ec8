// src/core/output.rs - Streaming output pipeline
//
// Core features:
// - Owns the encoders, the interleaver and the RTMP stream
// - Data capture hooks driven by the stream's connect and send threads
// - Reconnect state machine with exponential backoff
// - Status events published on a crossbeam channel
//
// No output lock is held while calling into the stream's start/stop: both can
// wait on stream threads that call back into this module.

use crate::config::{AudioInfo, StreamConfig, VideoInfo};
use crate::core::encoder::{Encoder, PacketListener};
use crate::core::interleaver::Interleaver;
use crate::core::packet::EncoderPacket;
use crate::error::{EncodeError, OutputError, SessionError, StopCode};
use crate::flv::packager::{FlvPackager, AUDIO_CODEC_ID_AAC, VIDEO_CODEC_ID_AVC};
use crate::rtmp::connection::{ConnectParams, Connection};
use crate::rtmp::reconnect::{Backoff, ReconnectTimer};
use crate::rtmp::stream::{RtmpStream, StreamHandler};
use crate::util::lock;
use crate::util::time::now_ns;
use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Output status notifications, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Starting,
    Activate,
    Start,
    Stopping,
    Reconnect { delay: Duration, attempt: u32 },
    ReconnectSuccess,
    Deactivate,
    Stop { code: StopCode, message: Option<String> },
}

#[derive(Default)]
struct OutputMedia {
    video: Option<(Arc<Encoder>, VideoInfo)>,
    audio: Option<(Arc<Encoder>, AudioInfo)>,
}

struct ReconnectState {
    backoff: Backoff,
    timer: Option<ReconnectTimer>,
}

/// Subscribed to both encoders; feeds the interleaver.
struct InterleaveSink {
    output: Weak<OutputInner>,
}

impl PacketListener for InterleaveSink {
    fn on_packet(&self, packet: &EncoderPacket) {
        if let Some(output) = self.output.upgrade() {
            output.interleave_packet(packet);
        }
    }

    fn on_error(&self, error: &EncodeError) {
        if let Some(output) = self.output.upgrade() {
            error!("Encoder failed while streaming: {error}");
            *lock(&output.last_error) = Some(error.to_string());
            output.stream.encode_error();
        }
    }
}

struct OutputInner {
    config: StreamConfig,
    weak_self: Weak<OutputInner>,
    media: Mutex<OutputMedia>,
    interleaver: Mutex<Interleaver>,
    stream: RtmpStream,
    sink: Arc<dyn PacketListener>,
    params: Mutex<Option<ConnectParams>>,
    reconnect: Mutex<ReconnectState>,
    started: AtomicBool,
    active: AtomicBool,
    capturing: AtomicBool,
    reconnecting: AtomicBool,
    stopping: AtomicBool,
    stop_code: AtomicCell<StopCode>,
    last_error: Mutex<Option<String>>,
    event_tx: Sender<OutputEvent>,
    event_rx: Receiver<OutputEvent>,
}

/// An RTMP output: encoders in, ordered FLV over the connection out.
pub struct RtmpOutput {
    inner: Arc<OutputInner>,
}

impl RtmpOutput {
    pub fn new(config: StreamConfig, connection: Box<dyn Connection>) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let backoff = Backoff::new(
            config.reconnect_retry_delay,
            config.max_reconnect_delay,
            config.reconnect_retry_max(),
        );

        let inner = Arc::new_cyclic(|weak: &Weak<OutputInner>| {
            let handler: Weak<dyn StreamHandler> = weak.clone();
            OutputInner {
                interleaver: Mutex::new(Interleaver::new(false, false, &config)),
                stream: RtmpStream::new(config.clone(), connection, handler),
                sink: Arc::new(InterleaveSink { output: weak.clone() }),
                config,
                weak_self: weak.clone(),
                media: Mutex::new(OutputMedia::default()),
                params: Mutex::new(None),
                reconnect: Mutex::new(ReconnectState { backoff, timer: None }),
                started: AtomicBool::new(false),
                active: AtomicBool::new(false),
                capturing: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stop_code: AtomicCell::new(StopCode::Success),
                last_error: Mutex::new(None),
                event_tx,
                event_rx,
            }
        });
        Self { inner }
    }

    /// Sets (or clears) the video encoder. Only allowed while stopped.
    pub fn set_video_encoder(&self, encoder: Option<(Arc<Encoder>, VideoInfo)>) -> crate::error::Result<()> {
        if self.is_streaming() {
            return Err(OutputError::AlreadyActive.into());
        }
        let previous = {
            let mut media = lock(&self.inner.media);
            std::mem::replace(&mut media.video, encoder.clone())
        };
        release_replaced(previous.map(|(old, _)| old), encoder.as_ref().map(|(new, _)| new));
        Ok(())
    }

    /// Sets (or clears) the audio encoder. Only allowed while stopped.
    pub fn set_audio_encoder(&self, encoder: Option<(Arc<Encoder>, AudioInfo)>) -> crate::error::Result<()> {
        if self.is_streaming() {
            return Err(OutputError::AlreadyActive.into());
        }
        let previous = {
            let mut media = lock(&self.inner.media);
            std::mem::replace(&mut media.audio, encoder.clone())
        };
        release_replaced(previous.map(|(old, _)| old), encoder.as_ref().map(|(new, _)| new));
        Ok(())
    }

    /// Starts connecting. Progress is reported through [`events`](RtmpOutput::events).
    ///
    /// # Arguments
    /// * `url` - `rtmp://host[:port]/app`
    /// * `key` - Stream key (play path)
    ///
    /// # Returns
    /// * `Err(OutputError::AlreadyActive)` - The output is already streaming or reconnecting
    /// * `Err(OutputError::NoEncoders)` - Neither encoder is set
    pub fn start(&self, url: &str, key: &str) -> crate::error::Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(OutputError::AlreadyActive.into());
        }

        inner.stopping.store(false, Ordering::Release);
        inner.reconnecting.store(false, Ordering::Release);
        *lock(&inner.last_error) = None;
        lock(&inner.reconnect).backoff.reset();
        *lock(&inner.params) = Some(ConnectParams::new(url, key, &inner.config));

        inner.emit(OutputEvent::Starting);
        if let Err(e) = inner.actual_start() {
            error!("Failed to start output: {e}");
            inner.started.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Stops gracefully: buffered packets captured before now are still sent. Stopping
    /// while reconnecting is a forced stop.
    pub fn stop(&self) {
        self.stop_at(now_ns());
    }

    /// Stops once every packet captured before `ts` (see [`now_ns`]) has been sent, or
    /// after `max_shutdown_time_sec`.
    pub fn stop_at(&self, ts: u64) {
        if !self.is_streaming() {
            return;
        }
        if self.inner.reconnecting.load(Ordering::Acquire) {
            self.force_stop();
            return;
        }
        self.inner.actual_stop(false, ts);
    }

    /// Stops without draining the send queue.
    pub fn force_stop(&self) {
        if !self.is_streaming() {
            return;
        }
        self.inner.actual_stop(true, 0);
    }

    /// Receiver for status events. All clones share one queue.
    pub fn events(&self) -> Receiver<OutputEvent> {
        self.inner.event_rx.clone()
    }

    /// Started and not yet stopped (connecting, streaming or reconnecting).
    pub fn is_streaming(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Data capture is running on a live connection.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.stream.total_bytes()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.inner.stream.dropped_frames()
    }

    pub fn congestion(&self) -> f32 {
        self.inner.stream.congestion()
    }

    pub fn connect_time_ms(&self) -> u64 {
        self.inner.stream.connect_time_ms()
    }

    /// Video frames emitted by the interleaver since the last connect.
    pub fn total_frames(&self) -> u64 {
        lock(&self.inner.interleaver).total_frames()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.reconnect).backoff.attempts()
    }

    /// Joins the stream and reconnect threads.
    pub fn join(&self) {
        let timer = lock(&self.inner.reconnect).timer.take();
        if let Some(timer) = timer {
            timer.stop();
        }
        self.inner.stream.join();
    }
}

/// Destroys an encoder that is no longer used by the output.
fn release_replaced(previous: Option<Arc<Encoder>>, current: Option<&Arc<Encoder>>) {
    if let Some(previous) = previous {
        if current.map_or(true, |current| !Arc::ptr_eq(&previous, current)) {
            previous.destroy();
        }
    }
}

impl Drop for RtmpOutput {
    fn drop(&mut self) {
        self.force_stop();
        self.join();
    }
}

impl OutputInner {
    fn emit(&self, event: OutputEvent) {
        debug!("Output event: {event:?}");
        let _ = self.event_tx.send(event);
    }

    fn encoders(&self) -> (Option<Arc<Encoder>>, Option<Arc<Encoder>>) {
        let media = lock(&self.media);
        (
            media.video.as_ref().map(|(encoder, _)| encoder.clone()),
            media.audio.as_ref().map(|(encoder, _)| encoder.clone()),
        )
    }

    /// Initializes the encoders and spawns the connect thread.
    fn actual_start(&self) -> crate::error::Result<()> {
        let (video, audio) = self.encoders();
        if video.is_none() && audio.is_none() {
            return Err(OutputError::NoEncoders.into());
        }
        for encoder in video.iter().chain(audio.iter()) {
            encoder.initialize().map_err(OutputError::EncoderInit)?;
        }
        if let (Some(video), Some(audio)) = (&video, &audio) {
            if !Encoder::pair(audio, video) {
                debug!("Encoders {} and {} not paired", audio.name(), video.name());
            }
        }

        let Some(params) = lock(&self.params).clone() else {
            return Err(SessionError::NotStreaming.into());
        };
        self.stop_code.store(StopCode::Success);
        self.stream.start(params)
    }

    fn actual_stop(&self, force: bool, ts: u64) {
        if self.stopping.swap(true, Ordering::AcqRel) && !force {
            return;
        }
        self.emit(OutputEvent::Stopping);

        let was_reconnecting = self.reconnecting.swap(false, Ordering::AcqRel);
        let timer = lock(&self.reconnect).timer.take();
        if let Some(timer) = timer {
            timer.stop();
        }
        if was_reconnecting {
            info!("Reconnect cancelled");
        }

        if !force {
            // Nothing newer than `ts` is wanted; queue what the interleaver still holds.
            self.unhook_encoders();
            let mut interleaver = lock(&self.interleaver);
            for packet in interleaver.flush() {
                self.stream.encoded_packet(&packet);
            }
        }
        self.stream.stop(if force { 0 } else { ts });
    }

    fn hook_encoders(&self, video: &Option<Arc<Encoder>>, audio: &Option<Arc<Encoder>>) -> bool {
        if self.capturing.swap(true, Ordering::AcqRel) {
            return true;
        }

        let mut started: Vec<&Arc<Encoder>> = Vec::new();
        for encoder in video.iter().chain(audio.iter()) {
            if let Err(e) = encoder.start(self.sink.clone()) {
                error!("Failed to start encoder {}: {e}", encoder.name());
                for encoder in started {
                    encoder.stop(&self.sink);
                }
                self.capturing.store(false, Ordering::Release);
                return false;
            }
            started.push(encoder);
        }
        true
    }

    fn unhook_encoders(&self) {
        if !self.capturing.swap(false, Ordering::AcqRel) {
            return;
        }
        let (video, audio) = self.encoders();
        for encoder in video.iter().chain(audio.iter()) {
            encoder.stop(&self.sink);
        }
    }

    fn interleave_packet(&self, packet: &EncoderPacket) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let mut interleaver = lock(&self.interleaver);
        for packet in interleaver.push(packet.clone()) {
            self.stream.encoded_packet(&packet);
        }
    }

    fn can_reconnect(&self, code: StopCode) -> bool {
        let reconnect_active = self.config.reconnect_enabled() && self.config.reconnect_retry_max() != 0;
        (self.reconnecting.load(Ordering::Acquire) && code != StopCode::Success)
            || (reconnect_active && code == StopCode::Disconnected)
    }

    fn end_data_capture_internal(&self, signal: bool) {
        self.unhook_encoders();
        if self.active.swap(false, Ordering::AcqRel) {
            self.emit(OutputEvent::Deactivate);
        }
        if signal {
            self.finish();
        }
    }

    /// Emits the terminal `Stop` event once per start.
    fn finish(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stopping.store(false, Ordering::Release);
        self.reconnecting.store(false, Ordering::Release);

        let code = self.stop_code.swap(StopCode::Success);
        let message = if code.is_success() {
            None
        } else {
            lock(&self.last_error).clone()
        };
        if code.is_success() {
            info!("Output stopped");
        } else {
            warn!("Output stopped with code {code}: {}", message.as_deref().unwrap_or("unknown error"));
        }
        self.emit(OutputEvent::Stop { code, message });
    }

    fn output_reconnect(&self) {
        let mut state = lock(&self.reconnect);
        if !self.reconnecting.load(Ordering::Acquire) {
            state.backoff.reset();
        }

        let Some(delay) = state.backoff.next_delay() else {
            drop(state);
            warn!("Reconnect retries exhausted");
            self.stop_code.store(StopCode::Disconnected);
            self.reconnecting.store(false, Ordering::Release);
            self.end_data_capture_internal(true);
            return;
        };
        let attempt = state.backoff.attempts();
        self.reconnecting.store(true, Ordering::Release);
        self.stop_code.store(StopCode::Disconnected);

        let weak = self.weak_self.clone();
        let previous = state.timer.take();
        let result = ReconnectTimer::start(delay, move || {
            if let Some(output) = weak.upgrade() {
                output.reconnect_expired();
            }
        });
        let scheduled = match result {
            Ok(timer) => {
                state.timer = Some(timer);
                true
            }
            Err(e) => {
                warn!("Failed to create reconnect thread: {e}");
                false
            }
        };
        drop(state);
        drop(previous);

        if scheduled {
            info!("Reconnecting in {:.2} seconds..", delay.as_secs_f64());
            self.emit(OutputEvent::Reconnect { delay, attempt });
        } else {
            self.reconnecting.store(false, Ordering::Release);
            self.end_data_capture_internal(true);
        }
    }

    fn reconnect_expired(&self) {
        if !self.reconnecting.load(Ordering::Acquire) || self.stopping.load(Ordering::Acquire) {
            return;
        }
        debug!("Reconnect timer expired");
        if let Err(e) = self.actual_start() {
            error!("Reconnect attempt failed to start: {e}");
            *lock(&self.last_error) = Some(e.to_string());
            self.signal_stop(StopCode::Error);
        }
    }

    fn metadata_packager(&self) -> FlvPackager {
        let mut packager = FlvPackager::new();
        let media = lock(&self.media);
        if let Some((_, info)) = &media.video {
            packager.set_property("width", info.width as f64);
            packager.set_property("height", info.height as f64);
            packager.set_property("videocodecid", VIDEO_CODEC_ID_AVC);
            packager.set_property("framerate", info.frame_rate());
        }
        if let Some((_, info)) = &media.audio {
            packager.set_property("audiocodecid", AUDIO_CODEC_ID_AAC);
            packager.set_property("audiodatarate", 0.0);
            packager.set_property("audiosamplerate", info.sample_rate as f64);
        }
        packager
    }
}

impl StreamHandler for OutputInner {
    fn begin_data_capture(&self) -> bool {
        if self.active.load(Ordering::Acquire) {
            return false;
        }

        let (video, audio) = self.encoders();
        *lock(&self.interleaver) = Interleaver::new(video.is_some(), audio.is_some(), &self.config);

        self.active.store(true, Ordering::Release);
        if !self.hook_encoders(&video, &audio) {
            self.active.store(false, Ordering::Release);
            return false;
        }
        self.emit(OutputEvent::Activate);

        if self.reconnecting.swap(false, Ordering::AcqRel) {
            info!("Reconnected successfully");
            let timer = {
                let mut state = lock(&self.reconnect);
                state.backoff.reset();
                state.timer.take()
            };
            drop(timer);
            self.emit(OutputEvent::ReconnectSuccess);
        } else {
            self.emit(OutputEvent::Start);
        }
        true
    }

    fn end_data_capture(&self) {
        self.end_data_capture_internal(true);
    }

    fn signal_stop(&self, code: StopCode) {
        debug!("Stream signalled stop: {code}");
        self.stop_code.store(code);
        if !code.is_success() {
            if let Some(message) = self.stream.last_error() {
                *lock(&self.last_error) = Some(message);
            }
        }

        if !self.stopping.load(Ordering::Acquire) && self.can_reconnect(code) {
            self.end_data_capture_internal(false);
            self.output_reconnect();
        } else {
            self.reconnecting.store(false, Ordering::Release);
            self.end_data_capture_internal(true);
        }
    }

    fn metadata(&self) -> Bytes {
        self.metadata_packager().flv_meta_data(false)
    }

    fn video_header(&self) -> Option<Bytes> {
        let (video, _) = self.encoders();
        video.and_then(|encoder| encoder.header())
    }

    fn audio_header(&self) -> Option<Bytes> {
        let (_, audio) = self.encoders();
        audio.and_then(|encoder| encoder.header())
    }
}
