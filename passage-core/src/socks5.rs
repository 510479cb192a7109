//! SOCKS5 client
//!
//! Client side of RFC 1928 with optional RFC 1929 username/password
//! sub-negotiation. Only CONNECT is issued; the engine never asks for BIND
//! or UDP ASSOCIATE.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::PassageError;

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;
/// Maximum domain length in an ATYP=3 address
const MAX_DOMAIN_LEN: usize = 255;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

impl From<u8> for AuthMethod {
    fn from(value: u8) -> Self {
        match value {
            0x00 => AuthMethod::NoAuth,
            0x02 => AuthMethod::UsernamePassword,
            _ => AuthMethod::NoAcceptable,
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<u8> for ReplyCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ReplyCode::Succeeded,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

impl ReplyCode {
    pub fn message(&self) -> &'static str {
        match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "general SOCKS server failure",
            ReplyCode::ConnectionNotAllowed => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddressTypeNotSupported => "address type not supported",
        }
    }
}

/// CONNECT target
#[derive(Debug, Clone)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }

    pub fn from_domain(domain: impl Into<String>, port: u16) -> Self {
        TargetAddr::Domain(domain.into(), port)
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Encode as a SOCKS5 ATYP + address + port sequence.
    pub fn encode(&self) -> Result<BytesMut, PassageError> {
        let mut buf = BytesMut::new();

        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(AddressType::IPv4 as u8);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(AddressType::IPv6 as u8);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Domain(domain, port) => {
                let bytes = domain.as_bytes();
                if bytes.is_empty() || bytes.len() > MAX_DOMAIN_LEN {
                    return Err(PassageError::ConnectionFailed(format!(
                        "domain length {} outside 1..=255",
                        bytes.len()
                    )));
                }
                buf.put_u8(AddressType::DomainName as u8);
                buf.put_u8(bytes.len() as u8);
                buf.put_slice(bytes);
                buf.put_u16(*port);
            }
        }

        Ok(buf)
    }
}

/// SOCKS5 client bound to one proxy server
pub struct Socks5Client {
    proxy_addr: SocketAddr,
    username: Option<String>,
    password: Option<String>,
    handshake_timeout: Duration,
}

impl Socks5Client {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self {
            proxy_addr,
            username: None,
            password: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_auth(
        proxy_addr: SocketAddr,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            proxy_addr,
            username: Some(username.into()),
            password: Some(password.into()),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Open a proxied byte stream to `target`. The whole exchange up to the
    /// CONNECT reply runs under the handshake timeout.
    pub async fn connect(&self, target: TargetAddr) -> Result<TcpStream, PassageError> {
        tokio::time::timeout(self.handshake_timeout, self.connect_inner(target))
            .await
            .map_err(|_| PassageError::ConnectionFailed("SOCKS5 handshake timed out".into()))?
    }

    async fn connect_inner(&self, target: TargetAddr) -> Result<TcpStream, PassageError> {
        let mut stream = TcpStream::connect(self.proxy_addr)
            .await
            .map_err(|e| PassageError::ConnectionFailed(format!("proxy unreachable: {}", e)))?;

        self.negotiate_method(&mut stream).await?;
        self.send_connect(&mut stream, &target).await?;

        Ok(stream)
    }

    async fn negotiate_method(&self, stream: &mut TcpStream) -> Result<(), PassageError> {
        let mut greeting = BytesMut::new();
        greeting.put_u8(SOCKS5_VERSION);

        if self.username.is_some() && self.password.is_some() {
            greeting.put_u8(2);
            greeting.put_u8(AuthMethod::NoAuth as u8);
            greeting.put_u8(AuthMethod::UsernamePassword as u8);
        } else {
            greeting.put_u8(1);
            greeting.put_u8(AuthMethod::NoAuth as u8);
        }

        stream.write_all(&greeting).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;

        if response[0] != SOCKS5_VERSION {
            return Err(PassageError::ConnectionFailed(
                "invalid SOCKS version in method reply".into(),
            ));
        }

        match AuthMethod::from(response[1]) {
            AuthMethod::NoAuth => Ok(()),
            AuthMethod::UsernamePassword => self.authenticate(stream).await,
            AuthMethod::NoAcceptable => Err(PassageError::ConnectionFailed(
                "no acceptable authentication method".into(),
            )),
        }
    }

    /// RFC 1929 username/password sub-negotiation
    async fn authenticate(&self, stream: &mut TcpStream) -> Result<(), PassageError> {
        let (username, password) = match (&self.username, &self.password) {
            (Some(u), Some(p)) => (u, p),
            _ => {
                return Err(PassageError::ConnectionFailed(
                    "server requires credentials but none configured".into(),
                ))
            }
        };

        let mut request = BytesMut::new();
        request.put_u8(0x01); // sub-negotiation version
        request.put_u8(username.len() as u8);
        request.put_slice(username.as_bytes());
        request.put_u8(password.len() as u8);
        request.put_slice(password.as_bytes());

        stream.write_all(&request).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;

        if response[1] != 0x00 {
            return Err(PassageError::ConnectionFailed(
                "authentication rejected".into(),
            ));
        }

        Ok(())
    }

    async fn send_connect(
        &self,
        stream: &mut TcpStream,
        target: &TargetAddr,
    ) -> Result<(), PassageError> {
        let mut request = BytesMut::new();
        request.put_u8(SOCKS5_VERSION);
        request.put_u8(0x01); // CONNECT
        request.put_u8(0x00); // reserved
        request.put(target.encode()?);

        stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(PassageError::ConnectionFailed(
                "invalid SOCKS version in reply".into(),
            ));
        }

        let reply = ReplyCode::from(header[1]);
        if reply != ReplyCode::Succeeded {
            return Err(PassageError::ConnectionFailed(reply.message().into()));
        }

        // discard the bound address
        match header[3] {
            0x01 => {
                let mut addr = [0u8; 6];
                stream.read_exact(&mut addr).await?;
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await?;
            }
            0x04 => {
                let mut addr = [0u8; 18];
                stream.read_exact(&mut addr).await?;
            }
            other => {
                return Err(PassageError::ConnectionFailed(format!(
                    "unknown address type {} in reply",
                    other
                )));
            }
        }

        Ok(())
    }
}

/// Build a client from the engine configuration's host/port/credentials.
pub fn client_from_parts(
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
    timeout: Duration,
) -> Result<Socks5Client, PassageError> {
    let addr: SocketAddr = match host.parse::<std::net::IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        // hostname servers are resolved by the platform before init
        Err(_) => {
            return Err(PassageError::InvalidConfig(format!(
                "proxy host must be an IP literal, got {}",
                host
            )))
        }
    };

    let client = match (username, password) {
        (Some(u), Some(p)) => Socks5Client::with_auth(addr, u, p),
        _ => Socks5Client::new(addr),
    };

    Ok(client.with_timeout(timeout))
}
