//! Minimal AMF0 writer covering what the `onMetaData` script tag needs.

use bytes::{BufMut, BytesMut};

pub const AMF_NUMBER: u8 = 0x00;
pub const AMF_STRING: u8 = 0x02;
pub const AMF_ECMA_ARRAY: u8 = 0x08;
pub const AMF_OBJECT_END: u8 = 0x09;

/// Writes a typed AMF string value.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u8(AMF_STRING);
    put_key(buf, s);
}

/// Writes an untyped property name.
pub fn put_key(buf: &mut BytesMut, name: &str) {
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
}

pub fn put_number_property(buf: &mut BytesMut, name: &str, value: f64) {
    put_key(buf, name);
    buf.put_u8(AMF_NUMBER);
    buf.put_f64(value);
}

pub fn put_string_property(buf: &mut BytesMut, name: &str, value: &str) {
    put_key(buf, name);
    put_string(buf, value);
}

pub fn put_ecma_array_start(buf: &mut BytesMut, count: u32) {
    buf.put_u8(AMF_ECMA_ARRAY);
    buf.put_u32(count);
}

pub fn put_object_end(buf: &mut BytesMut) {
    buf.put_u16(0);
    buf.put_u8(AMF_OBJECT_END);
}
