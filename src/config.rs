//! Stream configuration.
//!
//! [`StreamConfig`] carries every tunable of the push pipeline. All setters follow the
//! builder style and consume `self`:
//!
//! ```rust,ignore
//! let config = StreamConfig::default()
//!     .set_reconnect_retry_sec(5)
//!     .set_drop_threshold_ms(500);
//! ```

use std::time::Duration;

pub const DEFAULT_DROP_THRESHOLD_MS: i64 = 700; // B-frame / low priority check
pub const DEFAULT_PFRAME_DROP_THRESHOLD_MS: i64 = 900; // P-frame check
const MIN_PFRAME_THRESHOLD_GAP_MS: i64 = 200;
pub const DEFAULT_MAX_SHUTDOWN_TIME_SEC: u64 = 30;
pub const DEFAULT_RECONNECT_RETRY_SEC: u64 = 2;
pub const DEFAULT_RECONNECT_RETRY_MAX: u32 = 20;
pub const MAX_RECONNECT_DELAY_SEC: u64 = 15 * 60; // 15 minutes
pub const DEFAULT_CHUNK_SIZE: u32 = 4096;
pub const DEFAULT_FLASH_VER: &str = "FMLE/3.0 (compatible; FMSc/1.0)";

/// How premature packets are trimmed when both tracks first become available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrunePolicy {
    /// Drop leading packets of whichever track starts more than one video frame
    /// duration before the other.
    FrameDuration,
    /// Only align the start to the first video packet.
    Disabled,
}

/// When the interleaver releases the front of its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitPolicy {
    /// Release packets only once the opposing track has produced a later timestamp.
    WaitForOpposing,
    /// Release exactly one packet per arriving packet.
    OnePerPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
}

impl VideoInfo {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps_num: fps.max(1),
            fps_den: 1,
        }
    }

    pub fn frame_rate(&self) -> f64 {
        self.fps_num as f64 / self.fps_den.max(1) as f64
    }

    /// Interval between two frames in nanoseconds.
    pub fn frame_interval_ns(&self) -> u64 {
        1_000_000_000u64 * self.fps_den.max(1) as u64 / self.fps_num.max(1) as u64
    }
}

impl Default for VideoInfo {
    fn default() -> Self {
        Self::new(0, 0, 30)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u8,
}

impl Default for AudioInfo {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub(crate) drop_threshold_ms: i64,
    pub(crate) pframe_drop_threshold_ms: i64,
    pub(crate) max_shutdown_time_sec: u64,
    pub(crate) reconnect_enabled: bool,
    pub(crate) reconnect_retry_delay: Duration,
    pub(crate) reconnect_retry_max: u32,
    pub(crate) max_reconnect_delay: Duration,
    pub(crate) chunk_size: u32,
    pub(crate) use_nagle: bool,
    pub(crate) flash_ver: String,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) need_sync_packet: bool,
    pub(crate) prune_policy: PrunePolicy,
    pub(crate) emit_policy: EmitPolicy,
    pub(crate) pace_video: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            drop_threshold_ms: DEFAULT_DROP_THRESHOLD_MS,
            pframe_drop_threshold_ms: DEFAULT_PFRAME_DROP_THRESHOLD_MS,
            max_shutdown_time_sec: DEFAULT_MAX_SHUTDOWN_TIME_SEC,
            reconnect_enabled: true,
            reconnect_retry_delay: Duration::from_secs(DEFAULT_RECONNECT_RETRY_SEC),
            reconnect_retry_max: DEFAULT_RECONNECT_RETRY_MAX,
            max_reconnect_delay: Duration::from_secs(MAX_RECONNECT_DELAY_SEC),
            chunk_size: DEFAULT_CHUNK_SIZE,
            use_nagle: true,
            flash_ver: DEFAULT_FLASH_VER.to_string(),
            username: None,
            password: None,
            need_sync_packet: true,
            prune_policy: PrunePolicy::FrameDuration,
            emit_policy: EmitPolicy::WaitForOpposing,
            pace_video: true,
        }
    }
}

impl StreamConfig {
    /// Sets the buffered duration (ms) above which low priority video frames are dropped.
    pub fn set_drop_threshold_ms(mut self, ms: i64) -> Self {
        self.drop_threshold_ms = ms.max(1);
        self
    }

    /// Sets the buffered duration (ms) above which every non-keyframe video frame is dropped.
    ///
    /// The effective value is never less than the low priority threshold plus 200ms.
    pub fn set_pframe_drop_threshold_ms(mut self, ms: i64) -> Self {
        self.pframe_drop_threshold_ms = ms.max(1);
        self
    }

    pub fn set_max_shutdown_time_sec(mut self, secs: u64) -> Self {
        self.max_shutdown_time_sec = secs;
        self
    }

    pub fn set_reconnect_enabled(mut self, enabled: bool) -> Self {
        self.reconnect_enabled = enabled;
        self
    }

    pub fn set_reconnect_retry_sec(mut self, secs: u64) -> Self {
        self.reconnect_retry_delay = Duration::from_secs(secs);
        self
    }

    /// Sets the delay before the first reconnect attempt with sub-second precision.
    pub fn set_reconnect_retry_delay(mut self, delay: Duration) -> Self {
        self.reconnect_retry_delay = delay;
        self
    }

    pub fn set_reconnect_retry_max(mut self, max: u32) -> Self {
        self.reconnect_retry_max = max;
        self
    }

    pub fn set_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    pub fn set_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn set_use_nagle(mut self, use_nagle: bool) -> Self {
        self.use_nagle = use_nagle;
        self
    }

    pub fn set_flash_ver(mut self, flash_ver: impl Into<String>) -> Self {
        self.flash_ver = flash_ver.into();
        self
    }

    pub fn set_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// When `false`, packets of a single-track stream are emitted without waiting
    /// for the other track to sync.
    pub fn set_need_sync_packet(mut self, need_sync_packet: bool) -> Self {
        self.need_sync_packet = need_sync_packet;
        self
    }

    pub fn set_prune_policy(mut self, policy: PrunePolicy) -> Self {
        self.prune_policy = policy;
        self
    }

    pub fn set_emit_policy(mut self, policy: EmitPolicy) -> Self {
        self.emit_policy = policy;
        self
    }

    pub fn set_pace_video(mut self, pace_video: bool) -> Self {
        self.pace_video = pace_video;
        self
    }

    pub fn drop_threshold_usec(&self) -> i64 {
        self.drop_threshold_ms * 1000
    }

    pub fn pframe_drop_threshold_usec(&self) -> i64 {
        self.pframe_drop_threshold_ms
            .max(self.drop_threshold_ms + MIN_PFRAME_THRESHOLD_GAP_MS)
            * 1000
    }

    pub fn max_shutdown_time_ns(&self) -> u64 {
        self.max_shutdown_time_sec * 1_000_000_000
    }

    pub fn reconnect_retry_max(&self) -> u32 {
        self.reconnect_retry_max
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.drop_threshold_usec(), 700_000);
        assert_eq!(config.pframe_drop_threshold_usec(), 900_000);
        assert_eq!(config.max_shutdown_time_ns(), 30_000_000_000);
        assert_eq!(config.reconnect_retry_delay, Duration::from_secs(2));
        assert_eq!(config.reconnect_retry_max(), 20);
        assert_eq!(config.chunk_size, 4096);
        assert!(config.use_nagle);
        assert_eq!(config.flash_ver, "FMLE/3.0 (compatible; FMSc/1.0)");
    }

    #[test]
    fn test_pframe_threshold_keeps_gap() {
        let config = StreamConfig::default()
            .set_drop_threshold_ms(1000)
            .set_pframe_drop_threshold_ms(900);
        assert_eq!(config.pframe_drop_threshold_usec(), 1_200_000);
    }

    #[test]
    fn test_video_info_interval() {
        let info = VideoInfo::new(1280, 720, 25);
        assert_eq!(info.frame_interval_ns(), 40_000_000);
        assert_eq!(info.frame_rate(), 25.0);
        assert_eq!(AudioInfo::default().sample_rate, 44100);
    }
}
