//! The **RTMP** module is the transport half of the pusher: it takes interleaved encoder
//! packets, queues them with congestion control, muxes them into FLV tags and writes them
//! to an RTMP server.
//!
//! # Architecture
//!
//! Each connection attempt runs on its own threads:
//! - **connect thread** (`rtmp-connect`): opens the connection, sends `onMetaData`, starts
//!   the send thread and asks the output to begin data capture
//! - **send thread** (`rtmp-send`): pops packets, sends the codec sequence headers once per
//!   connection, muxes and writes every packet
//! - **reconnect thread** (`rtmp-reconnect`): waits out the backoff delay, can be
//!   interrupted by a stop
//!
//! ## Key Components
//!
//! - `RtmpStream`: connect/send threads, graceful and forced stop
//! - `SendQueue`: FIFO of packets with priority-based frame dropping
//! - `Connection`: the transport seam; `RtmpClient` implements it over TCP
//! - `Backoff` / `ReconnectTimer`: retry scheduling
//!
//! ## Congestion Management
//!
//! Measured as the dts span between the oldest queued video packet and the newest packet.
//!
//! | Check | Threshold (default) | Drops |
//! |-------|---------------------|-------|
//! | Low priority | 700ms | Non-keyframe video below `HIGH` priority |
//! | P-frame | 900ms (at least low + 200ms) | Every non-keyframe video packet |
//!
//! After a drop, incoming non-keyframe video below the dropped level is refused until the
//! next keyframe. Audio is never dropped.
//!
//! # Stop codes
//!
//! | Failure | Code | Retried |
//! |---------|------|---------|
//! | Malformed url | `BadPath` | no |
//! | TCP / handshake failure | `ConnectFailed` | only while already reconnecting |
//! | Server rejects `publish` | `InvalidStream` | only while already reconnecting |
//! | Write failure mid-stream | `Disconnected` | yes |
//!
//! **Feature Flag**: `RtmpClient` is only available when the `rtmp` feature is enabled.

#[cfg(feature = "rtmp")]
pub mod client;
pub mod connection;
pub mod reconnect;
pub mod send_queue;
pub mod stream;
pub mod url;
