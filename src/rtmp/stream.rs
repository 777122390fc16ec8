// src/rtmp/stream.rs - RTMP stream transport
//
// Core features:
// - Connect thread: connect, send metadata, start the send thread, begin capture
// - Packet admission with AVC conversion and congestion dropping
// - Send thread: sequence headers once per connection, FLV mux, write
// - Graceful stop (drain until a timestamp or deadline) and forced stop
//
// Handler callbacks are always made without any stream lock held.

use crate::config::StreamConfig;
use crate::core::avc;
use crate::core::packet::{EncoderPacket, MediaKind};
use crate::error::{ConnectionError, OutputError, StopCode};
use crate::flv::packager::FlvPackager;
use crate::rtmp::connection::{ConnectParams, Connection};
use crate::rtmp::send_queue::SendQueue;
use crate::util::lock;
use crate::util::sync::{Event, Semaphore, WaitResult};
use crate::util::time::now_ns;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SEND_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Output side callbacks driven by the stream.
pub trait StreamHandler: Send + Sync {
    /// The connection is publishing; start the encoders. Returns `false` when capture
    /// cannot begin.
    fn begin_data_capture(&self) -> bool;

    /// A requested stop has finished draining.
    fn end_data_capture(&self);

    /// The stream ended on its own (or a stop was requested while idle).
    fn signal_stop(&self, code: StopCode);

    /// FLV `onMetaData` tag, without the file header.
    fn metadata(&self) -> Bytes;

    /// AVC decoder configuration record.
    fn video_header(&self) -> Option<Bytes>;

    /// AudioSpecificConfig.
    fn audio_header(&self) -> Option<Bytes>;
}

struct StreamInner {
    config: StreamConfig,
    handler: Weak<dyn StreamHandler>,
    connection: Mutex<Box<dyn Connection>>,
    packager: FlvPackager,
    queue: Mutex<SendQueue>,
    send_sem: Semaphore,
    stop_event: Event,
    active: AtomicBool,
    connecting: AtomicBool,
    disconnected: AtomicBool,
    encode_error: AtomicBool,
    got_first_video: AtomicBool,
    start_dts_offset: AtomicI64,
    stop_ts: AtomicI64,
    shutdown_timeout_ts: AtomicU64,
    total_bytes: AtomicU64,
    connect_time_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
    connect_thread: Mutex<Option<JoinHandle<()>>>,
    send_thread: Mutex<Option<JoinHandle<()>>>,
}

/// RTMP transport: owns the connection, the send queue and the two worker threads.
pub struct RtmpStream {
    inner: Arc<StreamInner>,
}

impl RtmpStream {
    pub fn new(config: StreamConfig, connection: Box<dyn Connection>, handler: Weak<dyn StreamHandler>) -> Self {
        let queue = SendQueue::new(&config);
        Self {
            inner: Arc::new(StreamInner {
                config,
                handler,
                connection: Mutex::new(connection),
                packager: FlvPackager::new(),
                queue: Mutex::new(queue),
                send_sem: Semaphore::new(),
                stop_event: Event::new(false),
                active: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
                encode_error: AtomicBool::new(false),
                got_first_video: AtomicBool::new(false),
                start_dts_offset: AtomicI64::new(0),
                stop_ts: AtomicI64::new(0),
                shutdown_timeout_ts: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
                connect_time_ms: AtomicU64::new(0),
                last_error: Mutex::new(None),
                connect_thread: Mutex::new(None),
                send_thread: Mutex::new(None),
            }),
        }
    }

    /// Spawns the connect thread.
    ///
    /// # Returns
    /// * `Err(OutputError::AlreadyActive)` - A connection is already in progress or active
    /// * `Err(OutputError::ThreadExited)` - The connect thread could not be spawned
    pub fn start(&self, params: ConnectParams) -> crate::error::Result<()> {
        let inner = &self.inner;
        if inner.active.load(Ordering::Acquire) || inner.connecting.swap(true, Ordering::AcqRel) {
            return Err(OutputError::AlreadyActive.into());
        }

        // threads of a previous connection have already finished their work
        join_thread(&inner.connect_thread, "Connect");
        join_thread(&inner.send_thread, "Send");
        inner.stop_event.reset();

        let thread_inner = inner.clone();
        let result = std::thread::Builder::new()
            .name("rtmp-connect".to_string())
            .spawn(move || connect_thread(thread_inner, params));

        match result {
            Ok(handle) => {
                *lock(&inner.connect_thread) = Some(handle);
                Ok(())
            }
            Err(e) => {
                inner.connecting.store(false, Ordering::Release);
                error!("Connect thread exited with error: {e}");
                Err(OutputError::ThreadExited.into())
            }
        }
    }

    /// Stops the stream.
    ///
    /// # Arguments
    /// * `ts` - Stop timestamp in ns (see [`now_ns`]). Packets captured before it are still
    ///   sent, for at most `max_shutdown_time_sec`. `0` stops immediately.
    pub fn stop(&self, ts: u64) {
        let inner = &self.inner;
        if inner.stop_event.is_set() && ts != 0 {
            return;
        }

        if inner.connecting.load(Ordering::Acquire) {
            join_thread(&inner.connect_thread, "Connect");
        }

        let stop_ts = if ts == 0 { 0 } else { (ts / 1000).max(1) };
        inner.stop_ts.store(stop_ts as i64, Ordering::Release);
        if ts != 0 {
            inner
                .shutdown_timeout_ts
                .store(ts + inner.config.max_shutdown_time_ns(), Ordering::Release);
        }

        if inner.active.load(Ordering::Acquire) {
            inner.stop_event.set();
            if ts == 0 {
                inner.send_sem.post();
            }
        } else if let Some(handler) = inner.handler.upgrade() {
            handler.signal_stop(StopCode::Success);
        }
    }

    /// Queues an interleaved packet for sending.
    pub fn encoded_packet(&self, packet: &EncoderPacket) {
        let inner = &self.inner;
        if inner.disconnected.load(Ordering::Acquire) || !inner.active.load(Ordering::Acquire) {
            return;
        }

        let packet = match packet.kind {
            MediaKind::Video => {
                if !inner.got_first_video.swap(true, Ordering::AcqRel) {
                    let offset = packet.get_ms_time(packet.dts) as i64;
                    inner.start_dts_offset.store(offset, Ordering::Release);
                }
                let parsed = avc::parse_avc_packet(&packet.data);
                let mut out = packet.clone();
                out.data = parsed.data;
                out.keyframe = packet.keyframe || parsed.keyframe;
                out.priority = parsed.priority;
                out.drop_priority = parsed.priority;
                out
            }
            MediaKind::Audio => packet.clone(),
        };

        let added = {
            let mut queue = lock(&inner.queue);
            !inner.disconnected.load(Ordering::Acquire) && queue.push(&packet)
        };
        if added {
            inner.send_sem.post();
        }
    }

    /// Reports a fatal encoder failure; the send thread exits with [`StopCode::Error`].
    pub fn encode_error(&self) {
        self.inner.encode_error.store(true, Ordering::Release);
        self.inner.send_sem.post();
    }

    /// Joins the connect and send threads.
    pub fn join(&self) {
        join_thread(&self.inner.connect_thread, "Connect");
        join_thread(&self.inner.send_thread, "Send");
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stop_event.is_set()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.total_bytes.load(Ordering::Acquire)
    }

    pub fn dropped_frames(&self) -> u64 {
        lock(&self.inner.queue).dropped_frames()
    }

    pub fn congestion(&self) -> f32 {
        lock(&self.inner.queue).congestion()
    }

    pub fn connect_time_ms(&self) -> u64 {
        self.inner.connect_time_ms.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }
}

impl Drop for RtmpStream {
    fn drop(&mut self) {
        if self.is_active() {
            self.stop(0);
        }
        self.join();
    }
}

fn join_thread(slot: &Mutex<Option<JoinHandle<()>>>, name: &str) {
    let handle = lock(slot).take();
    if let Some(handle) = handle {
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("{name} thread panicked");
        }
    }
}

fn init_connect(inner: &StreamInner) {
    inner.disconnected.store(false, Ordering::Release);
    inner.encode_error.store(false, Ordering::Release);
    inner.got_first_video.store(false, Ordering::Release);
    inner.start_dts_offset.store(0, Ordering::Release);
    inner.total_bytes.store(0, Ordering::Release);
    inner.send_sem.reset();
    lock(&inner.queue).reset();
    *lock(&inner.last_error) = None;
}

fn connect_thread(inner: Arc<StreamInner>, params: ConnectParams) {
    init_connect(&inner);

    let code = match try_connect(&inner, &params) {
        Ok(()) => StopCode::Success,
        Err(e) => {
            warn!("Connection to {} failed: {e}", params.url);
            let message = lock(&inner.connection).last_error().unwrap_or_else(|| e.to_string());
            *lock(&inner.last_error) = Some(message);
            e.stop_code()
        }
    };
    inner.connecting.store(false, Ordering::Release);

    if code.is_success() {
        begin_capture(&inner);
    } else if let Some(handler) = inner.handler.upgrade() {
        handler.signal_stop(code);
    }
}

fn try_connect(inner: &Arc<StreamInner>, params: &ConnectParams) -> Result<(), ConnectionError> {
    if params.url.is_empty() {
        return Err(ConnectionError::BadPath("empty url".into()));
    }

    info!("Connecting to RTMP URL {}", params.url);
    let started = Instant::now();
    {
        let mut connection = lock(&inner.connection);
        connection.connect(params)?;

        let metadata = match inner.handler.upgrade() {
            Some(handler) => handler.metadata(),
            None => return Err(ConnectionError::NotConnected),
        };
        if let Err(e) = connection.write(&metadata) {
            warn!("Disconnected while attempting to send metadata");
            connection.close();
            return Err(ConnectionError::Disconnected(e.to_string()));
        }
        inner.total_bytes.fetch_add(metadata.len() as u64, Ordering::AcqRel);
    }
    inner
        .connect_time_ms
        .store(started.elapsed().as_millis() as u64, Ordering::Release);
    info!("Connection to {} successful", params.url);

    inner.active.store(true, Ordering::Release);
    let thread_inner = inner.clone();
    let result = std::thread::Builder::new()
        .name("rtmp-send".to_string())
        .spawn(move || send_thread(thread_inner));
    match result {
        Ok(handle) => {
            *lock(&inner.send_thread) = Some(handle);
            Ok(())
        }
        Err(e) => {
            error!("Send thread exited with error: {e}");
            inner.active.store(false, Ordering::Release);
            lock(&inner.connection).close();
            Err(ConnectionError::Disconnected(format!("failed to spawn send thread: {e}")))
        }
    }
}

fn begin_capture(inner: &StreamInner) {
    let started = match inner.handler.upgrade() {
        Some(handler) => handler.begin_data_capture(),
        None => false,
    };
    if !started {
        error!("Failed to begin data capture");
        inner.encode_error.store(true, Ordering::Release);
        inner.send_sem.post();
    }
}

/// Whether a draining stop may end before sending `packet`.
fn can_shutdown_stream(inner: &StreamInner, packet: &EncoderPacket) -> bool {
    let timed_out = now_ns() >= inner.shutdown_timeout_ts.load(Ordering::Acquire);
    if timed_out {
        info!("Stream shutdown timeout reached ({} second(s))", inner.config.max_shutdown_time_sec);
    }
    timed_out || packet.sys_dts_usec >= inner.stop_ts.load(Ordering::Acquire)
}

fn send_packet(inner: &StreamInner, packet: &EncoderPacket, is_header: bool) -> Result<(), ConnectionError> {
    let dts_offset = if is_header {
        0
    } else {
        inner.start_dts_offset.load(Ordering::Acquire) as i32
    };
    let data = inner.packager.flv_packet_mux(packet, dts_offset, is_header);
    if data.is_empty() {
        return Ok(());
    }
    lock(&inner.connection).write(&data)?;
    inner.total_bytes.fetch_add(data.len() as u64, Ordering::AcqRel);
    Ok(())
}

fn send_headers(inner: &StreamInner) -> Result<(), ConnectionError> {
    let Some(handler) = inner.handler.upgrade() else {
        return Ok(());
    };

    if let Some(header) = handler.video_header() {
        let mut packet = EncoderPacket::new(MediaKind::Video, header, 0, 0, (1, 1));
        packet.keyframe = true;
        send_packet(inner, &packet, true)?;
    }
    if let Some(header) = handler.audio_header() {
        let packet = EncoderPacket::new(MediaKind::Audio, header, 0, 0, (1, 1));
        send_packet(inner, &packet, true)?;
    }
    Ok(())
}

fn send_thread(inner: Arc<StreamInner>) {
    debug!("Send thread started");
    let mut sent_headers = false;

    loop {
        let wait = inner.send_sem.wait_timeout(SEND_POLL_INTERVAL);
        let stopping = inner.stop_event.is_set();

        if stopping && inner.stop_ts.load(Ordering::Acquire) == 0 {
            break;
        }
        if inner.encode_error.load(Ordering::Acquire) {
            break;
        }

        let packet = lock(&inner.queue).pop();
        let Some(packet) = packet else {
            if stopping && wait == WaitResult::TimedOut {
                debug!("Send queue drained");
                break;
            }
            continue;
        };

        if stopping && can_shutdown_stream(&inner, &packet) {
            break;
        }

        if !sent_headers {
            if let Err(e) = send_headers(&inner) {
                error!("Failed to send stream headers: {e}");
                inner.disconnected.store(true, Ordering::Release);
                break;
            }
            sent_headers = true;
        }

        if let Err(e) = send_packet(&inner, &packet, false) {
            error!("Failed to send packet: {e}");
            inner.disconnected.store(true, Ordering::Release);
            break;
        }
    }

    let disconnected = inner.disconnected.load(Ordering::Acquire);
    let encode_error = inner.encode_error.load(Ordering::Acquire);
    if disconnected {
        info!("Disconnected from RTMP server");
    } else if encode_error {
        info!("Encoder error, disconnecting");
    } else {
        info!("User stopped the stream");
    }

    {
        let mut connection = lock(&inner.connection);
        if disconnected {
            if let Some(message) = connection.last_error() {
                *lock(&inner.last_error) = Some(message);
            }
        }
        connection.close();
    }

    let was_stopping = inner.stop_event.is_set();
    lock(&inner.queue).reset();
    inner.send_sem.reset();
    inner.stop_event.reset();
    inner.active.store(false, Ordering::Release);

    let Some(handler) = inner.handler.upgrade() else {
        return;
    };
    if encode_error {
        handler.signal_stop(StopCode::Error);
    } else if !was_stopping {
        handler.signal_stop(StopCode::Disconnected);
    } else {
        handler.end_data_capture();
    }
    debug!("Send thread exited");
}
