// src/rtmp/connection.rs - Transport seam
//
// Core features:
// - `Connection` trait: connect / write FLV bytes / close
// - `ConnectParams` gathered from the output configuration
// - Scriptable in-memory connection for tests

use crate::config::StreamConfig;
use crate::error::ConnectionError;

/// Everything a transport needs to open a publishing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub url: String,
    pub key: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub flash_ver: String,
    pub chunk_size: u32,
    pub use_nagle: bool,
}

impl ConnectParams {
    pub fn new(url: impl Into<String>, key: impl Into<String>, config: &StreamConfig) -> Self {
        Self {
            url: url.into(),
            key: key.into(),
            username: config.username.clone(),
            password: config.password.clone(),
            flash_ver: config.flash_ver.clone(),
            chunk_size: config.chunk_size,
            use_nagle: config.use_nagle,
        }
    }
}

/// A publishing transport.
///
/// `write` receives a byte stream of FLV tags (no file header). Implementations split it
/// into messages however their protocol requires.
pub trait Connection: Send {
    fn connect(&mut self, params: &ConnectParams) -> Result<(), ConnectionError>;

    /// Writes FLV tag bytes. Returns the number of bytes consumed.
    fn write(&mut self, data: &[u8]) -> Result<usize, ConnectionError>;

    fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Last human readable error reported by the peer, if any.
    fn last_error(&self) -> Option<String> {
        None
    }
}
