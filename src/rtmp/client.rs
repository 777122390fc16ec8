// src/rtmp/client.rs - RTMP publishing client
//
// Core features:
// - TCP connect with timeout, Nagle toggle
// - Client side handshake via rml_rtmp
// - connect / releaseStream / FCPublish / createStream / publish command flow
// - FLV tag byte stream converted to RTMP messages (metadata wrapped in @setDataFrame)

use crate::error::ConnectionError;
use crate::flv::flv_buffer::FlvBuffer;
use crate::flv::flv_tag::FlvTag;
use crate::flv::packager::FLV_TAG_SCRIPT;
use crate::rtmp::connection::{ConnectParams, Connection};
use crate::rtmp::url::RtmpUrl;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, info, warn};
use rml_rtmp::chunk_io::{ChunkDeserializer, ChunkSerializer};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::messages::{MessagePayload, RtmpMessage};
use rml_rtmp::rml_amf0::Amf0Value;
use rml_rtmp::time::RtmpTimestamp;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER_SIZE: usize = 4096;

const TXN_CONNECT: f64 = 1.0;
const TXN_RELEASE_STREAM: f64 = 2.0;
const TXN_FC_PUBLISH: f64 = 3.0;
const TXN_CREATE_STREAM: f64 = 4.0;
const TXN_PUBLISH: f64 = 5.0;
const TXN_DELETE_STREAM: f64 = 6.0;

/// Publishing session over a plain TCP socket.
pub struct RtmpClient {
    stream: Option<TcpStream>,
    serializer: ChunkSerializer,
    deserializer: ChunkDeserializer,
    flv_buffer: FlvBuffer,
    // bytes received along with the end of the handshake
    pending: Vec<u8>,
    stream_id: u32,
    last_error: Option<String>,
}

impl RtmpClient {
    pub fn new() -> Self {
        Self {
            stream: None,
            serializer: ChunkSerializer::new(),
            deserializer: ChunkDeserializer::new(),
            flv_buffer: FlvBuffer::new(),
            pending: Vec::new(),
            stream_id: 0,
            last_error: None,
        }
    }

    fn reset(&mut self) {
        self.stream = None;
        self.serializer = ChunkSerializer::new();
        self.deserializer = ChunkDeserializer::new();
        self.flv_buffer.clear();
        self.pending.clear();
        self.stream_id = 0;
    }

    fn open_socket(url: &RtmpUrl, use_nagle: bool) -> Result<TcpStream, ConnectionError> {
        let address = url.address();
        let connect_failed = |reason: String| ConnectionError::ConnectFailed {
            addr: address.clone(),
            reason,
        };

        let addrs = address
            .to_socket_addrs()
            .map_err(|e| connect_failed(format!("resolve failed: {e}")))?;

        let mut last_err = String::from("no address resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nodelay(!use_nagle)?;
                    stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Connect to {addr} failed: {e}");
                    last_err = e.to_string();
                }
            }
        }
        Err(connect_failed(last_err))
    }

    fn handshake(stream: &mut TcpStream) -> Result<Vec<u8>, ConnectionError> {
        let mut handshake = Handshake::new(PeerType::Client);
        let p0_and_p1 = handshake
            .generate_outbound_p0_and_p1()
            .map_err(|e| ConnectionError::InvalidStream(format!("handshake: {e:?}")))?;
        stream.write_all(&p0_and_p1)?;

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(ConnectionError::Disconnected("closed during handshake".into()));
            }
            match handshake.process_bytes(&buf[..n]) {
                Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes)?;
                    }
                }
                Ok(HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                }) => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes)?;
                    }
                    return Ok(remaining_bytes);
                }
                Err(e) => {
                    return Err(ConnectionError::InvalidStream(format!("handshake: {e:?}")));
                }
            }
        }
    }

    fn send_command(
        &mut self,
        name: &str,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_arguments: Vec<Amf0Value>,
        stream_id: u32,
    ) -> Result<(), ConnectionError> {
        let payload = RtmpMessage::Amf0Command {
            command_name: name.to_string(),
            transaction_id,
            command_object,
            additional_arguments,
        }
        .into_message_payload(RtmpTimestamp { value: 0 }, stream_id)
        .map_err(|e| ConnectionError::InvalidStream(format!("failed to create {name} command: {e:?}")))?;

        self.send_payload(&payload, false)
    }

    fn send_payload(&mut self, payload: &MessagePayload, force_uncompressed: bool) -> Result<(), ConnectionError> {
        let packet = self
            .serializer
            .serialize(payload, force_uncompressed, false)
            .map_err(|e| ConnectionError::Disconnected(format!("failed to serialize RTMP message: {e:?}")))?;
        let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
        stream.write_all(&packet.bytes)?;
        Ok(())
    }

    /// Reads messages until a command response for `transaction_id` (or an `onStatus`
    /// when `wait_status` is set) arrives.
    fn wait_for_response(&mut self, transaction_id: f64, wait_status: bool) -> Result<Vec<Amf0Value>, ConnectionError> {
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut input = std::mem::take(&mut self.pending);

        loop {
            // Drain everything already buffered in the deserializer
            loop {
                let message = self
                    .deserializer
                    .get_next_message(&input)
                    .map_err(|e| ConnectionError::InvalidStream(format!("bad chunk: {e:?}")))?;
                input.clear();
                let Some(payload) = message else {
                    break;
                };
                if let Some(args) = self.handle_message(&payload, transaction_id, wait_status)? {
                    return Ok(args);
                }
            }

            if Instant::now() >= deadline {
                return Err(ConnectionError::InvalidStream("timed out waiting for server response".into()));
            }
            let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
            let n = match stream.read(&mut buf) {
                Ok(0) => return Err(ConnectionError::Disconnected("server closed the connection".into())),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            };
            input.extend_from_slice(&buf[..n]);
        }
    }

    fn handle_message(
        &mut self,
        payload: &MessagePayload,
        transaction_id: f64,
        wait_status: bool,
    ) -> Result<Option<Vec<Amf0Value>>, ConnectionError> {
        let message = match payload.to_rtmp_message() {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring undecodable message type {}: {e:?}", payload.type_id);
                return Ok(None);
            }
        };

        match message {
            RtmpMessage::SetChunkSize { size } => {
                debug!("Server chunk size {size}");
                self.deserializer
                    .set_max_chunk_size(size as usize)
                    .map_err(|e| ConnectionError::InvalidStream(format!("bad chunk size: {e:?}")))?;
            }
            RtmpMessage::Amf0Command {
                command_name,
                transaction_id: txn,
                additional_arguments,
                ..
            } => match command_name.as_str() {
                "_result" if txn == transaction_id => return Ok(Some(additional_arguments)),
                "_error" if txn == transaction_id => {
                    let reason = status_description(&additional_arguments)
                        .unwrap_or_else(|| format!("command {transaction_id} rejected"));
                    self.last_error = Some(reason.clone());
                    return Err(ConnectionError::InvalidStream(reason));
                }
                "onStatus" if wait_status => {
                    let code = status_field(&additional_arguments, "code").unwrap_or_default();
                    if code == "NetStream.Publish.Start" {
                        return Ok(Some(additional_arguments));
                    }
                    if status_field(&additional_arguments, "level").as_deref() == Some("error") {
                        let reason = status_description(&additional_arguments).unwrap_or(code);
                        self.last_error = Some(reason.clone());
                        return Err(ConnectionError::InvalidStream(reason));
                    }
                    debug!("onStatus {code}");
                }
                other => debug!("Ignoring command {other}"),
            },
            _ => {}
        }
        Ok(None)
    }

    fn negotiate(&mut self, url: &RtmpUrl, params: &ConnectParams) -> Result<(), ConnectionError> {
        let packet = self
            .serializer
            .set_max_chunk_size(params.chunk_size, RtmpTimestamp { value: 0 })
            .map_err(|e| ConnectionError::InvalidStream(format!("failed to set chunk size: {e:?}")))?;
        self.stream
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?
            .write_all(&packet.bytes)?;

        // send connect
        let mut properties: HashMap<String, Amf0Value> = HashMap::new();
        properties.insert("app".to_string(), Amf0Value::Utf8String(url.app.clone()));
        properties.insert("type".to_string(), Amf0Value::Utf8String("nonprivate".into()));
        properties.insert("flashVer".to_string(), Amf0Value::Utf8String(params.flash_ver.clone()));
        properties.insert("tcUrl".to_string(), Amf0Value::Utf8String(url.tc_url.clone()));
        let mut arguments = Vec::new();
        if let (Some(username), Some(password)) = (&params.username, &params.password) {
            arguments.push(Amf0Value::Utf8String(username.clone()));
            arguments.push(Amf0Value::Utf8String(password.clone()));
        }
        self.send_command("connect", TXN_CONNECT, Amf0Value::Object(properties), arguments, 0)?;
        self.wait_for_response(TXN_CONNECT, false)?;

        let key = Amf0Value::Utf8String(params.key.clone());
        self.send_command("releaseStream", TXN_RELEASE_STREAM, Amf0Value::Null, vec![key.clone()], 0)?;
        self.send_command("FCPublish", TXN_FC_PUBLISH, Amf0Value::Null, vec![key.clone()], 0)?;

        // send createStream
        self.send_command("createStream", TXN_CREATE_STREAM, Amf0Value::Null, Vec::new(), 0)?;
        let result = self.wait_for_response(TXN_CREATE_STREAM, false)?;
        self.stream_id = match result.first() {
            Some(Amf0Value::Number(id)) => *id as u32,
            _ => return Err(ConnectionError::InvalidStream("createStream returned no stream id".into())),
        };

        // send publish
        let arguments = vec![key, Amf0Value::Utf8String("live".into())];
        self.send_command("publish", TXN_PUBLISH, Amf0Value::Null, arguments, self.stream_id)?;
        self.wait_for_response(TXN_PUBLISH, true)?;
        Ok(())
    }

    fn send_flv_tag(&mut self, mut flv_tag: FlvTag) -> Result<(), ConnectionError> {
        flv_tag.header.stream_id = self.stream_id;
        let force_uncompressed = flv_tag.header.tag_type == FLV_TAG_SCRIPT;
        self.send_payload(&flv_tag_to_message_payload(flv_tag), force_uncompressed)
    }
}

impl Default for RtmpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for RtmpClient {
    fn connect(&mut self, params: &ConnectParams) -> Result<(), ConnectionError> {
        let url = RtmpUrl::parse(&params.url)?;
        if params.key.is_empty() {
            return Err(ConnectionError::BadPath("empty stream key".into()));
        }

        self.reset();
        self.last_error = None;
        info!("Connecting to RTMP server {}", url.address());

        let mut stream = Self::open_socket(&url, params.use_nagle)?;
        self.pending = Self::handshake(&mut stream).map_err(|e| connect_phase_error(&url, e))?;
        self.stream = Some(stream);

        if let Err(e) = self.negotiate(&url, params) {
            error!("RTMP negotiation with {} failed: {e}", url.address());
            if self.last_error.is_none() {
                self.last_error = Some(e.to_string());
            }
            self.close();
            return Err(connect_phase_error(&url, e));
        }

        info!("Publishing {} on stream {}", url.tc_url, self.stream_id);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        if self.stream.is_none() {
            return Err(ConnectionError::NotConnected);
        }

        self.flv_buffer.write_data(data);
        while let Some(flv_tag) = self.flv_buffer.get_flv_tag() {
            if let Err(e) = self.send_flv_tag(flv_tag) {
                self.last_error = Some(e.to_string());
                return Err(match e {
                    ConnectionError::Io(io) => ConnectionError::Disconnected(io.to_string()),
                    other => other,
                });
            }
        }
        Ok(data.len())
    }

    fn close(&mut self) {
        if self.stream.is_some() && self.stream_id != 0 {
            let arguments = vec![Amf0Value::Number(self.stream_id as f64)];
            if let Err(e) = self.send_command("deleteStream", TXN_DELETE_STREAM, Amf0Value::Null, arguments, 0) {
                warn!("Failed to send deleteStream: {e}");
            }
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("RTMP connection closed");
        }
        self.reset();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}

/// Socket failures before publishing starts count as a failed connect.
fn connect_phase_error(url: &RtmpUrl, e: ConnectionError) -> ConnectionError {
    match e {
        ConnectionError::Io(io) => ConnectionError::ConnectFailed {
            addr: url.address(),
            reason: io.to_string(),
        },
        ConnectionError::Disconnected(reason) => ConnectionError::ConnectFailed {
            addr: url.address(),
            reason,
        },
        other => other,
    }
}

fn status_field(arguments: &[Amf0Value], field: &str) -> Option<String> {
    arguments.iter().find_map(|value| match value {
        Amf0Value::Object(properties) => match properties.get(field) {
            Some(Amf0Value::Utf8String(s)) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    })
}

fn status_description(arguments: &[Amf0Value]) -> Option<String> {
    status_field(arguments, "description").or_else(|| status_field(arguments, "code"))
}

/// Converts one FLV tag into an RTMP message payload.
pub fn flv_tag_to_message_payload(flv_tag: FlvTag) -> MessagePayload {
    let timestamp = flv_tag.header.timestamp | ((flv_tag.header.timestamp_ext as u32) << 24);

    let type_id = flv_tag.header.tag_type;
    let message_stream_id = flv_tag.header.stream_id;

    let data = if type_id == FLV_TAG_SCRIPT {
        wrap_metadata(flv_tag.data)
    } else {
        flv_tag.data
    };

    MessagePayload {
        timestamp: RtmpTimestamp { value: timestamp },
        type_id,
        message_stream_id,
        data,
    }
}

/// Prefixes a script tag body with the `@setDataFrame` AMF0 string.
fn wrap_metadata(data: Bytes) -> Bytes {
    let s = "@setDataFrame";

    let mut bytes = BytesMut::with_capacity(3 + s.len() + data.len());
    bytes.put_u8(0x02);
    bytes.put_u16(s.len() as u16);
    bytes.put(s.as_bytes());
    bytes.put(data);

    bytes.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::core::packet::{EncoderPacket, MediaKind};
    use crate::flv::packager::FlvPackager;

    #[test]
    fn test_metadata_tag_payload() {
        let mut flv_buffer = FlvBuffer::new();
        flv_buffer.write_data(&FlvPackager::new().flv_meta_data(false));
        let mut tag = flv_buffer.get_flv_tag().unwrap();
        tag.header.stream_id = 1;
        let body_len = tag.data.len();

        let payload = flv_tag_to_message_payload(tag);
        assert_eq!(payload.type_id, FLV_TAG_SCRIPT);
        assert_eq!(payload.message_stream_id, 1);
        assert_eq!(&payload.data[..16], b"\x02\x00\x0d@setDataFrame");
        assert_eq!(payload.data.len(), body_len + 16);
    }

    #[test]
    fn test_media_tag_payload_extended_timestamp() {
        let mut packet = EncoderPacket::new(MediaKind::Audio, vec![0x21, 0x10], 0x0123_4567, 0x0123_4567, (1, 1000));
        packet.keyframe = true;
        let mut flv_buffer = FlvBuffer::new();
        flv_buffer.write_data(&FlvPackager::new().flv_packet_mux(&packet, 0, false));
        let tag = flv_buffer.get_flv_tag().unwrap();

        let payload = flv_tag_to_message_payload(tag);
        assert_eq!(payload.type_id, 8);
        assert_eq!(payload.timestamp.value, 0x0123_4567);
        assert_eq!(payload.data.as_ref(), &[0xAF, 0x01, 0x21, 0x10]);
    }

    #[test]
    fn test_connect_rejects_bad_path_without_network() {
        let mut client = RtmpClient::new();
        let params = ConnectParams::new("not-a-url", "key", &StreamConfig::default());
        assert!(matches!(client.connect(&params), Err(ConnectionError::BadPath(_))));

        let params = ConnectParams::new("rtmp://127.0.0.1/live", "", &StreamConfig::default());
        assert!(matches!(client.connect(&params), Err(ConnectionError::BadPath(_))));
        assert!(!client.is_connected());
        assert!(matches!(client.write(&[0u8; 4]), Err(ConnectionError::NotConnected)));
    }

    #[test]
    fn test_connect_refused_is_connect_failed() {
        // Bind then drop a listener to get a port that refuses connections
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut client = RtmpClient::new();
        let url = format!("rtmp://127.0.0.1:{port}/live");
        let params = ConnectParams::new(url, "key", &StreamConfig::default());
        let err = client.connect(&params).unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectFailed { .. }), "{err:?}");
    }
}
