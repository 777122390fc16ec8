// src/rtmp/url.rs - RTMP url parsing
//
// Accepts `rtmp://host[:port]/app[/instance...]`. Anything else is a bad path and is
// never retried.

use crate::error::ConnectionError;

pub const DEFAULT_RTMP_PORT: u16 = 1935;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    /// Application name including any instance path and query string.
    pub app: String,
    /// The url used as `tcUrl` in the connect command.
    pub tc_url: String,
}

impl RtmpUrl {
    pub fn parse(url: &str) -> Result<RtmpUrl, ConnectionError> {
        let url = url.trim();
        let bad_path = || ConnectionError::BadPath(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(bad_path)?;
        if !scheme.eq_ignore_ascii_case("rtmp") {
            return Err(bad_path());
        }

        let (authority, path) = rest.split_once('/').ok_or_else(bad_path)?;
        let app = path.trim_end_matches('/');
        if authority.is_empty() || app.is_empty() {
            return Err(bad_path());
        }

        let (host, port) = match authority.rsplit_once(':') {
            // bracketed IPv6 without a port
            Some((_, tail)) if tail.ends_with(']') => (authority, DEFAULT_RTMP_PORT),
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| bad_path())?),
            None => (authority, DEFAULT_RTMP_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || port == 0 {
            return Err(bad_path());
        }

        Ok(RtmpUrl {
            host: host.to_string(),
            port,
            app: app.to_string(),
            tc_url: format!("{}://{}/{}", scheme.to_ascii_lowercase(), authority, app),
        })
    }

    /// `host:port` for socket address resolution.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
