use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::num::NonZeroU16;
use std::str::FromStr;

use thiserror::Error;

use crate::{ConnectParseMode, HttpVersion};

const DEFAULT_TUNNEL_PORT: u16 = 443;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Host and port named by a CONNECT request line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a CONNECT authority (`host:port`, `[v6]:port`).
    ///
    /// IP literals are stored in canonical form and DNS names lower-cased, so equal targets
    /// compare equal and key the leaf cache the same way. Port 0 is never a valid target.
    /// Lenient mode also takes absolute-form URIs, bare IPv6 literals and a missing port.
    pub fn parse_authority(
        authority: &str,
        mode: ConnectParseMode,
    ) -> Result<Self, ConnectParseError> {
        let authority = match mode {
            ConnectParseMode::Strict => authority,
            ConnectParseMode::Lenient => strip_absolute_form(authority),
        };
        if authority.is_empty() {
            return Err(ConnectParseError::InvalidAuthority);
        }

        if let Ok(ip) = authority.parse::<Ipv6Addr>() {
            // Without brackets the last group cannot be told apart from a port.
            return match mode {
                ConnectParseMode::Lenient => Ok(Self::new(ip.to_string(), DEFAULT_TUNNEL_PORT)),
                ConnectParseMode::Strict => Err(ConnectParseError::InvalidAuthority),
            };
        }

        let (host, port) = split_host_port(authority)?;
        let port = match (port, mode) {
            (Some(text), _) if !text.is_empty() => parse_port(text)?,
            (_, ConnectParseMode::Lenient) => DEFAULT_TUNNEL_PORT,
            (_, ConnectParseMode::Strict) => return Err(ConnectParseError::MissingPort),
        };
        Ok(Self::new(canonical_host(host), port))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// `host:port`, bracketing IPv6 literals; parses back to the same target.
    pub fn authority(&self) -> String {
        match self.ip() {
            Some(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for ConnectTarget {
    type Err = ConnectParseError;

    fn from_str(authority: &str) -> Result<Self, Self::Err> {
        Self::parse_authority(authority, ConnectParseMode::Strict)
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectParseError {
    #[error("request head is not terminated")]
    IncompleteHeaders,
    #[error("request head is not valid UTF-8")]
    InvalidUtf8,
    #[error("request line is empty")]
    EmptyRequestLine,
    #[error("request line must have exactly three parts")]
    InvalidRequestLine,
    #[error("method is not CONNECT")]
    MethodNotConnect,
    #[error("request line does not carry an HTTP version")]
    InvalidHttpVersion,
    #[error("authority is malformed")]
    InvalidAuthority,
    #[error("authority has no port")]
    MissingPort,
    #[error("authority port is not a valid u16")]
    InvalidPort,
}

impl ConnectParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::IncompleteHeaders => "incomplete_headers",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::EmptyRequestLine => "empty_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::MethodNotConnect => "method_not_connect",
            Self::InvalidHttpVersion => "invalid_http_version",
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
        }
    }
}

/// Parses `CONNECT <authority> HTTP/1.x`.
pub fn parse_connect_line(
    request_line: &str,
    mode: ConnectParseMode,
) -> Result<ConnectTarget, ConnectParseError> {
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    let (method, authority, version) = match parts.as_slice() {
        [] => return Err(ConnectParseError::EmptyRequestLine),
        [method, authority, version] => (*method, *authority, *version),
        _ => return Err(ConnectParseError::InvalidRequestLine),
    };
    if !is_connect_method(method, mode) {
        return Err(ConnectParseError::MethodNotConnect);
    }
    if HttpVersion::parse(version).is_none() {
        return Err(ConnectParseError::InvalidHttpVersion);
    }
    ConnectTarget::parse_authority(authority, mode)
}

/// Parses a full CONNECT head and returns the target plus the length of the head.
///
/// Bytes after the blank line belong to the tunnel and are left untouched.
pub fn parse_connect_head(
    input: &[u8],
    mode: ConnectParseMode,
) -> Result<(ConnectTarget, usize), ConnectParseError> {
    let head_len = input
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|index| index + HEAD_TERMINATOR.len())
        .ok_or(ConnectParseError::IncompleteHeaders)?;
    let head =
        std::str::from_utf8(&input[..head_len]).map_err(|_| ConnectParseError::InvalidUtf8)?;
    let request_line = head.lines().next().unwrap_or_default();
    let target = parse_connect_line(request_line, mode)?;
    Ok((target, head_len))
}

pub fn is_connect_method(method: &str, mode: ConnectParseMode) -> bool {
    match mode {
        ConnectParseMode::Strict => method == "CONNECT",
        ConnectParseMode::Lenient => method.eq_ignore_ascii_case("CONNECT"),
    }
}

/// Splits `host[:port]` or `[v6][:port]`; the port text may be empty.
fn split_host_port(authority: &str) -> Result<(&str, Option<&str>), ConnectParseError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or(ConnectParseError::InvalidAuthority)?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(ConnectParseError::InvalidAuthority);
        }
        if after.is_empty() {
            return Ok((host, None));
        }
        let port = after
            .strip_prefix(':')
            .ok_or(ConnectParseError::MissingPort)?;
        return Ok((host, Some(port)));
    }

    match authority.rsplit_once(':') {
        Some((host, _)) if !is_reg_name(host) => Err(ConnectParseError::InvalidAuthority),
        Some((host, port)) => Ok((host, Some(port))),
        None if !is_reg_name(authority) => Err(ConnectParseError::InvalidAuthority),
        None => Ok((authority, None)),
    }
}

fn is_reg_name(host: &str) -> bool {
    let delimiter = |c: char| {
        c.is_whitespace() || c.is_control() || matches!(c, ':' | '/' | '?' | '#' | '@' | '[' | ']')
    };
    !host.is_empty() && !host.contains(delimiter)
}

fn parse_port(text: &str) -> Result<u16, ConnectParseError> {
    text.parse::<NonZeroU16>()
        .map(NonZeroU16::get)
        .map_err(|_| ConnectParseError::InvalidPort)
}

fn canonical_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

/// `https://host:port/path` becomes `host:port`.
fn strip_absolute_form(authority: &str) -> &str {
    let authority = authority.trim();
    let without_scheme = authority
        .split_once("://")
        .map_or(authority, |(_, rest)| rest);
    without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
}
