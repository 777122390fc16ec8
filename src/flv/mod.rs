//! The **FLV** module turns encoder packets and stream metadata into FLV tags and
//! provides the matching tag splitter used by the RTMP transport.
//!
//! - [`packager::FlvPackager`] builds `onMetaData`, video (AVC) and audio (AAC) tags.
//! - [`flv_buffer::FlvBuffer`] accumulates an FLV byte stream and yields [`flv_tag::FlvTag`]s.

pub mod amf;
pub mod flv_buffer;
pub mod flv_tag;
pub mod packager;
