// src/core/media_output.rs - Single-slot frame hand-off
//
// Core features:
// - Latest-frame cache, older frames are overwritten, never queued
// - Worker thread woken by a counting semaphore
// - Delivery under a separate input lock, producers never wait on consumers
// - Listener registration idempotent by identity
// - Video frames delivered only with increasing timestamps

use crate::core::packet::MediaKind;
use crate::error::OutputError;
use crate::util::lock;
use crate::util::sync::Semaphore;
use bytes::Bytes;
use log::{debug, error, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A raw frame handed over by the capture side.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    pub data: Bytes,
    /// Capture time in nanoseconds.
    pub timestamp: u64,
}

impl MediaFrame {
    pub fn new(data: impl Into<Bytes>, timestamp: u64) -> Self {
        Self {
            data: data.into(),
            timestamp,
        }
    }
}

/// What a listener wants after handling a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Continue,
    /// Remove this listener; it will receive no further frames.
    Detach,
}

/// Consumer of frames delivered by a [`MediaOutput`] worker.
pub trait FrameListener: Send + Sync {
    fn on_frame(&self, frame: &MediaFrame) -> Delivery;
}

pub(crate) fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

struct Shared {
    kind: MediaKind,
    cache: Mutex<Option<MediaFrame>>,
    inputs: Mutex<Vec<Arc<dyn FrameListener>>>,
    input_count: AtomicUsize,
    update: Semaphore,
    stop: AtomicBool,
    last_output_timestamp: AtomicU64,
}

/// Decouples a producer pushing frames from the single thread that consumes them.
pub struct MediaOutput {
    name: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MediaOutput {
    pub fn new(kind: MediaKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                kind,
                cache: Mutex::new(None),
                inputs: Mutex::new(Vec::new()),
                input_count: AtomicUsize::new(0),
                update: Semaphore::new(),
                stop: AtomicBool::new(true),
                last_output_timestamp: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.shared.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Spawns the delivery worker. Opening an open output is a no-op.
    pub fn open(&self) -> crate::error::Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        self.shared.update.reset();
        self.shared.stop.store(false, Ordering::Release);
        self.shared.last_output_timestamp.store(0, Ordering::Release);

        let shared = self.shared.clone();
        let result = std::thread::Builder::new()
            .name(format!("{}-output", self.name))
            .spawn(move || {
                output_thread(&shared);
            });
        match result {
            Ok(handle) => {
                *worker = Some(handle);
                debug!("Media output {} opened", self.name);
                Ok(())
            }
            Err(e) => {
                self.shared.stop.store(true, Ordering::Release);
                error!("Media output thread exited with error: {e}");
                Err(OutputError::ThreadExited.into())
            }
        }
    }

    /// Stops and joins the worker. Frames pushed afterwards are dropped.
    pub fn close(&self) {
        let handle = lock(&self.worker).take();
        let Some(handle) = handle else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        self.shared.update.post();
        if handle.join().is_err() {
            error!("Media output {} worker panicked", self.name);
        }
        *lock(&self.shared.cache) = None;
        debug!("Media output {} closed", self.name);
    }

    /// Replaces the cached frame and wakes the worker.
    ///
    /// Dropped when the output is stopped or nobody is listening.
    pub fn update_input_frame(&self, frame: MediaFrame) {
        if self.shared.stop.load(Ordering::Acquire) {
            return;
        }
        if self.shared.input_count.load(Ordering::Acquire) == 0 {
            trace!("Media output {} has no listener, frame dropped", self.name);
            return;
        }
        *lock(&self.shared.cache) = Some(frame);
        self.shared.update.post();
    }

    /// Registers a listener.
    ///
    /// # Returns
    /// * `false` - The listener was already registered
    pub fn connect(&self, listener: Arc<dyn FrameListener>) -> bool {
        let mut inputs = lock(&self.shared.inputs);
        if inputs.iter().any(|input| same_listener(input, &listener)) {
            return false;
        }
        inputs.push(listener);
        self.shared.input_count.store(inputs.len(), Ordering::Release);
        true
    }

    /// Removes a listener. Removing an unknown listener is a no-op.
    pub fn disconnect(&self, listener: &Arc<dyn FrameListener>) -> bool {
        let mut inputs = lock(&self.shared.inputs);
        let Some(idx) = inputs.iter().position(|input| same_listener(input, listener)) else {
            return false;
        };
        inputs.remove(idx);
        self.shared.input_count.store(inputs.len(), Ordering::Release);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.shared.input_count.load(Ordering::Acquire)
    }
}

impl Drop for MediaOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn output_thread(shared: &Shared) {
    loop {
        shared.update.wait();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let Some(frame) = lock(&shared.cache).take() else {
            continue;
        };

        if shared.kind == MediaKind::Video {
            let last = shared.last_output_timestamp.load(Ordering::Acquire);
            if frame.timestamp <= last {
                trace!("Skipping stale video frame ts:{} last:{last}", frame.timestamp);
                continue;
            }
            shared.last_output_timestamp.store(frame.timestamp, Ordering::Release);
        }

        let mut inputs = lock(&shared.inputs);
        let mut detached = Vec::new();
        for (idx, input) in inputs.iter().enumerate().rev() {
            if input.on_frame(&frame) == Delivery::Detach {
                detached.push(idx);
            }
        }
        // Indices were collected in descending order
        for idx in detached {
            inputs.remove(idx);
        }
        shared.input_count.store(inputs.len(), Ordering::Release);
    }
    debug!("Media output worker finished.");
}

/// Sleeps a pushing thread so frames leave at the configured frame interval.
#[derive(Debug)]
pub struct FramePacer {
    interval: Duration,
    next_tick: Option<Instant>,
}

impl FramePacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_tick: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Blocks until the next frame slot. Falling behind by more than a frame resets the schedule.
    pub fn wait(&mut self) {
        let now = Instant::now();
        let tick = match self.next_tick {
            Some(tick) if tick > now => {
                std::thread::sleep(tick - now);
                tick
            }
            Some(tick) if now - tick < self.interval => tick,
            _ => now,
        };
        self.next_tick = Some(tick + self.interval);
    }

    pub fn reset(&mut self) {
        self.next_tick = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Sender};

    struct Collector {
        tag: &'static str,
        sender: Sender<(&'static str, u64)>,
        detach_after: Option<u64>,
    }

    impl FrameListener for Collector {
        fn on_frame(&self, frame: &MediaFrame) -> Delivery {
            let _ = self.sender.send((self.tag, frame.timestamp));
            match self.detach_after {
                Some(ts) if frame.timestamp >= ts => Delivery::Detach,
                _ => Delivery::Continue,
            }
        }
    }

    fn init_log() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .is_test(true)
            .try_init();
    }

    #[test]
    fn test_connect_is_idempotent() {
        init_log();
        let output = MediaOutput::new(MediaKind::Audio, "audio");
        let (sender, _receiver) = unbounded();
        let listener: Arc<dyn FrameListener> = Arc::new(Collector {
            tag: "a",
            sender,
            detach_after: None,
        });

        assert!(output.connect(listener.clone()));
        assert!(!output.connect(listener.clone()));
        assert_eq!(output.listener_count(), 1);
        assert!(output.disconnect(&listener));
        assert!(!output.disconnect(&listener));
        assert_eq!(output.listener_count(), 0);
    }

    #[test]
    fn test_audio_delivered_in_reverse_registration_order() {
        init_log();
        let output = MediaOutput::new(MediaKind::Audio, "audio");
        let (sender, receiver) = unbounded();
        for tag in ["first", "second"] {
            output.connect(Arc::new(Collector {
                tag,
                sender: sender.clone(),
                detach_after: None,
            }));
        }
        output.open().unwrap();
        output.update_input_frame(MediaFrame::new(vec![1u8], 10));

        let timeout = Duration::from_secs(2);
        assert_eq!(receiver.recv_timeout(timeout).unwrap(), ("second", 10));
        assert_eq!(receiver.recv_timeout(timeout).unwrap(), ("first", 10));
        output.close();
    }

    #[test]
    fn test_stale_video_frames_skipped() {
        init_log();
        let output = MediaOutput::new(MediaKind::Video, "video");
        let (sender, receiver) = unbounded();
        output.connect(Arc::new(Collector {
            tag: "v",
            sender,
            detach_after: None,
        }));
        output.open().unwrap();

        let timeout = Duration::from_secs(2);
        output.update_input_frame(MediaFrame::new(vec![1u8], 100));
        assert_eq!(receiver.recv_timeout(timeout).unwrap().1, 100);
        output.update_input_frame(MediaFrame::new(vec![1u8], 50));
        output.update_input_frame(MediaFrame::new(vec![1u8], 200));
        assert_eq!(receiver.recv_timeout(timeout).unwrap().1, 200);
        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
        output.close();
    }

    #[test]
    fn test_detach_from_delivery() {
        init_log();
        let output = MediaOutput::new(MediaKind::Audio, "audio");
        let (sender, receiver) = unbounded();
        output.connect(Arc::new(Collector {
            tag: "a",
            sender,
            detach_after: Some(1),
        }));
        output.open().unwrap();
        output.update_input_frame(MediaFrame::new(vec![1u8], 1));
        assert!(receiver.recv_timeout(Duration::from_secs(2)).is_ok());
        output.close();
        assert_eq!(output.listener_count(), 0);
    }

    #[test]
    fn test_frames_dropped_without_listener_or_after_close() {
        init_log();
        let output = MediaOutput::new(MediaKind::Audio, "audio");
        output.open().unwrap();
        output.update_input_frame(MediaFrame::new(vec![1u8], 1));
        assert!(lock(&output.shared.cache).is_none());

        let (sender, receiver) = unbounded();
        output.connect(Arc::new(Collector {
            tag: "a",
            sender,
            detach_after: None,
        }));
        output.close();
        output.update_input_frame(MediaFrame::new(vec![1u8], 2));
        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());

        // Reopen after close
        output.open().unwrap();
        output.update_input_frame(MediaFrame::new(vec![1u8], 3));
        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)).unwrap().1, 3);
    }

    #[test]
    fn test_frame_pacer_spacing() {
        let mut pacer = FramePacer::new(Duration::from_millis(10));
        let start = Instant::now();
        for _ in 0..4 {
            pacer.wait();
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
