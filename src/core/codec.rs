// src/core/codec.rs - Codec capabilities
//
// Core features:
// - `Codec` trait: encode, header, attach/detach hooks
// - H.264 passthrough for frames already encoded upstream
// - AAC passthrough with AudioSpecificConfig synthesis

use crate::config::{AudioInfo, VideoInfo};
use crate::core::avc;
use crate::core::packet::{EncoderPacket, MediaKind};
use crate::error::EncodeError;
use bytes::Bytes;
use log::{debug, warn};

pub const AAC_FRAME_SIZE: u32 = 1024; // samples per AAC frame

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];
const AAC_OBJECT_TYPE_LC: u16 = 2;

/// One unit of input for [`Codec::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderFrame {
    pub data: Bytes,
    /// Number of frames (video) or samples (audio) carried by `data`.
    pub frames: u32,
    pub pts: i64,
}

impl EncoderFrame {
    pub fn new(data: impl Into<Bytes>, frames: u32, pts: i64) -> Self {
        Self {
            data: data.into(),
            frames,
            pts,
        }
    }
}

/// A codec variant driven by an [`Encoder`](crate::core::encoder::Encoder).
pub trait Codec: Send {
    fn kind(&self) -> MediaKind;

    fn name(&self) -> &str;

    /// Timebase as (numerator, denominator).
    fn timebase(&self) -> (i32, i32);

    fn initialize(&mut self) -> Result<(), EncodeError> {
        Ok(())
    }

    /// Encodes one frame. `Ok(None)` means the codec produced no packet for it.
    fn encode(&mut self, frame: &EncoderFrame) -> Result<Option<EncoderPacket>, EncodeError>;

    /// Codec sequence header (AVC decoder configuration or AudioSpecificConfig).
    fn header(&self) -> Option<Bytes>;

    /// Samples per encoded audio packet, one for video.
    fn frame_size(&self) -> u32 {
        1
    }

    /// Bytes per sample frame for codecs fed with raw PCM; `None` for encoded input.
    fn input_block_size(&self) -> Option<usize> {
        None
    }

    fn sample_rate(&self) -> u32 {
        0
    }

    fn on_attach(&mut self) {}

    fn on_detach(&mut self) {}

    fn on_destroy(&mut self) {}
}

/// Forwards H.264 access units produced by an external encoder.
#[derive(Debug)]
pub struct AvcPassthrough {
    info: VideoInfo,
    header: Option<Bytes>,
}

impl AvcPassthrough {
    pub fn new(info: VideoInfo) -> Self {
        Self { info, header: None }
    }

    /// Sets the sequence header from SPS (`csd0`) and PPS (`csd1`), with or without start codes.
    ///
    /// An empty `csd1` means `csd0` carries both parameter sets.
    pub fn with_header(mut self, csd0: &[u8], csd1: &[u8]) -> Result<Self, EncodeError> {
        self.header = Some(avc::header_from_csd(csd0, csd1)?);
        Ok(self)
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }
}

impl Codec for AvcPassthrough {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn name(&self) -> &str {
        "h264-passthrough"
    }

    fn timebase(&self) -> (i32, i32) {
        (self.info.fps_den.max(1) as i32, self.info.fps_num.max(1) as i32)
    }

    fn initialize(&mut self) -> Result<(), EncodeError> {
        if self.header.is_none() {
            warn!("H.264 passthrough started without SPS/PPS, players may not decode the stream");
        }
        Ok(())
    }

    fn encode(&mut self, frame: &EncoderFrame) -> Result<Option<EncoderPacket>, EncodeError> {
        if frame.frames == 0 || frame.data.is_empty() {
            return Ok(None);
        }

        let mut packet = EncoderPacket::new(MediaKind::Video, frame.data.clone(), frame.pts, frame.pts, self.timebase());
        packet.keyframe = avc::is_keyframe(&frame.data);
        Ok(Some(packet))
    }

    fn header(&self) -> Option<Bytes> {
        self.header.clone()
    }
}

/// Forwards AAC frames produced by an external encoder.
#[derive(Debug)]
pub struct AacPassthrough {
    info: AudioInfo,
    header: Bytes,
}

impl AacPassthrough {
    /// Creates the codec. An empty `csd0` synthesizes an AAC-LC AudioSpecificConfig.
    pub fn new(info: AudioInfo, csd0: &[u8]) -> Self {
        let header = if csd0.is_empty() {
            audio_specific_config(info.sample_rate, info.channels)
        } else {
            Bytes::copy_from_slice(csd0)
        };
        Self { info, header }
    }
}

impl Codec for AacPassthrough {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn name(&self) -> &str {
        "aac-passthrough"
    }

    fn timebase(&self) -> (i32, i32) {
        (1, self.info.sample_rate.max(1) as i32)
    }

    fn encode(&mut self, frame: &EncoderFrame) -> Result<Option<EncoderPacket>, EncodeError> {
        if frame.data.is_empty() {
            return Ok(None);
        }
        let mut packet = EncoderPacket::new(MediaKind::Audio, frame.data.clone(), frame.pts, frame.pts, self.timebase());
        packet.keyframe = true;
        Ok(Some(packet))
    }

    fn header(&self) -> Option<Bytes> {
        Some(self.header.clone())
    }

    fn frame_size(&self) -> u32 {
        AAC_FRAME_SIZE
    }

    fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }
}

/// Two byte AAC-LC AudioSpecificConfig.
pub fn audio_specific_config(sample_rate: u32, channels: u8) -> Bytes {
    let freq_idx = match AAC_SAMPLE_RATES.iter().position(|&rate| rate == sample_rate) {
        Some(idx) => idx as u16,
        None => {
            warn!("Unsupported AAC sample rate {sample_rate}, signalling 44100");
            4
        }
    };
    let config = (AAC_OBJECT_TYPE_LC << 11) | (freq_idx << 7) | ((channels as u16 & 0x0F) << 3);
    debug!("Synthesized AudioSpecificConfig {config:#06x}");
    Bytes::copy_from_slice(&config.to_be_bytes())
}
