//! The **core** module holds the media pipeline: frame intake, encoders, interleaving,
//! the output state machine and the embedder-facing session.
//!
//! Data flows in one direction:
//!
//! ```text
//! push_*_frame -> MediaOutput -> Encoder -> Interleaver -> RtmpStream
//! ```

pub mod avc;
pub mod codec;
pub mod encoder;
pub mod interleaver;
pub mod media_output;
pub mod output;
pub mod packet;
pub mod session;
