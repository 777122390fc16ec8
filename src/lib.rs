//! **rtmp-pusher** publishes live H.264/AAC streams to RTMP servers.
//!
//! Frames pushed by the embedder are encoded (passthrough for already-encoded input),
//! interleaved in dts order, muxed as FLV and sent over RTMP. Under congestion low priority
//! video frames are dropped first; a lost connection is retried with exponential backoff.
//!
//! # Example
//!
//! ```rust,ignore
//! use rtmp_pusher::{now_ns, RtmpPusher, StreamConfig};
//!
//! let pusher = RtmpPusher::new(StreamConfig::default().set_reconnect_retry_sec(2))?;
//! pusher.set_video_info(1280, 720, 30);
//! pusher.set_video_header(&sps, &pps);
//! pusher.set_audio_info(44100, 2);
//! pusher.on_status(|event| log::info!("status: {event:?}"));
//! pusher.start_streaming("rtmp://localhost/live", "stream-key")?;
//!
//! for frame in camera.frames() {
//!     pusher.push_video_frame(frame, now_ns());
//! }
//! pusher.stop_streaming()?;
//! ```
//!
//! # Threads
//!
//! | Thread | Owner | Job |
//! |--------|-------|-----|
//! | `video-output` / `audio-output` | `MediaOutput` | hands the latest frame to the encoder |
//! | `rtmp-connect` | `RtmpStream` | connect, metadata, begin capture |
//! | `rtmp-send` | `RtmpStream` | headers, mux, write |
//! | `rtmp-reconnect` | `RtmpOutput` | backoff wait |
//! | `rtmp-status` | `RtmpPusher` | status callbacks |

pub mod config;
pub mod core;
pub mod error;
pub mod flv;
pub mod rtmp;
pub mod util;

pub use crate::config::{AudioInfo, EmitPolicy, PrunePolicy, StreamConfig, VideoInfo};
pub use crate::core::output::{OutputEvent, RtmpOutput};
pub use crate::core::session::RtmpPusher;
pub use crate::error::{Error, Result, StopCode};
pub use crate::rtmp::connection::{ConnectParams, Connection};
pub use crate::util::time::now_ns;
