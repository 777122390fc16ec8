use crate::flv::flv_tag::{FlvTag, FlvTagHeader};
use crate::flv::packager::FLV_TAG_HEADER_SIZE;
use bytes::{Buf, BytesMut};

const FLV_SIGNATURE: &[u8; 3] = b"FLV";
const PREVIOUS_TAG_SIZE_LEN: usize = 4;

/// Accumulates an FLV byte stream and splits it into tags.
///
/// A leading FLV file header (and PreviousTagSize0) is skipped. Partial tags stay
/// buffered until the rest of their bytes arrive.
#[derive(Debug, Default)]
pub struct FlvBuffer {
    buffer: BytesMut,
    header_checked: bool,
}

impl FlvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_data(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.header_checked = false;
    }

    fn skip_file_header(&mut self) -> bool {
        if self.header_checked {
            return true;
        }
        if self.buffer.len() < FLV_SIGNATURE.len() {
            return false;
        }
        if &self.buffer[..3] != FLV_SIGNATURE {
            self.header_checked = true;
            return true;
        }
        if self.buffer.len() < 9 {
            return false;
        }
        let header_size = u32::from_be_bytes([self.buffer[5], self.buffer[6], self.buffer[7], self.buffer[8]]) as usize;
        let skip = header_size + PREVIOUS_TAG_SIZE_LEN;
        if self.buffer.len() < skip {
            return false;
        }
        self.buffer.advance(skip);
        self.header_checked = true;
        true
    }

    /// Pops the next complete tag.
    pub fn get_flv_tag(&mut self) -> Option<FlvTag> {
        if !self.skip_file_header() {
            return None;
        }

        let header = FlvTagHeader::parse(self.buffer.get(..FLV_TAG_HEADER_SIZE)?)?;
        let data_size = header.data_size as usize;
        let total = FLV_TAG_HEADER_SIZE + data_size + PREVIOUS_TAG_SIZE_LEN;
        if self.buffer.len() < total {
            return None;
        }

        self.buffer.advance(FLV_TAG_HEADER_SIZE);
        let data = self.buffer.split_to(data_size).freeze();
        let previous_tag_size = self.buffer.get_u32();

        Some(FlvTag {
            header,
            data,
            previous_tag_size,
        })
    }
}
