//! Pluggable TCP dialers: direct, HTTP CONNECT proxy and SOCKS4/5 proxy.
//!
//! Contract: `dial(network, address) -> TcpStream | Error`. Every proxy
//! dialer hands back the tunnelled socket, so TLS runs end to end through it.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const KEEPALIVE: Duration = Duration::from_secs(30);
const MAX_CONNECT_RESPONSE: usize = 16 * 1024;

/// Opens raw TCP connections.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, network: &'a str, address: &'a str) -> BoxFuture<'a, Result<TcpStream>>;
}

/// Connects straight to the destination.
#[derive(Debug, Clone, Default)]
pub struct DirectDialer;

fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

async fn connect_tcp(address: &str) -> Result<TcpStream> {
    let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address);
    let addrs: Vec<SocketAddr> = lookup_host(address)
        .await
        .map_err(|e| Error::Dns {
            host: host.to_string(),
            message: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Dns {
            host: host.to_string(),
            message: "no such host".to_string(),
        });
    }

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = configure_socket(&stream) {
                    trace!("socket options not applied for {}: {}", addr, e);
                }
                debug!("connected to {} ({})", address, addr);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::Dial {
        address: address.to_string(),
        source: last_err.unwrap_or_else(|| std::io::Error::other("no address to dial")),
    })
}

impl Dialer for DirectDialer {
    fn dial<'a>(&'a self, network: &'a str, address: &'a str) -> BoxFuture<'a, Result<TcpStream>> {
        Box::pin(async move {
            if !network.starts_with("tcp") {
                return Err(Error::connection(format!("unsupported network {network}")));
            }
            connect_tcp(address).await
        })
    }
}

/// Tunnels through an HTTP proxy with CONNECT.
#[derive(Debug, Clone)]
pub struct HttpProxyDialer {
    proxy_address: String,
    authorization: Option<String>,
}

impl HttpProxyDialer {
    pub fn new(proxy: &Url) -> Result<Self> {
        let host = proxy
            .host_str()
            .ok_or_else(|| Error::proxy(format!("proxy URL {proxy} has no host")))?;
        let port = proxy.port_or_known_default().unwrap_or(8080);
        let authorization = if proxy.username().is_empty() {
            None
        } else {
            let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
            Some(format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials)
            ))
        };
        Ok(Self {
            proxy_address: format!("{host}:{port}"),
            authorization,
        })
    }

    async fn tunnel(&self, address: &str) -> Result<TcpStream> {
        let mut stream = connect_tcp(&self.proxy_address).await?;

        let mut request = format!("CONNECT {address} HTTP/1.1\r\nHost: {address}\r\n");
        if let Some(auth) = &self.authorization {
            request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::proxy("proxy closed connection during CONNECT"));
            }
            buf.extend_from_slice(&chunk[..n]);

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&buf) {
                Ok(httparse::Status::Complete(_)) => {
                    let code = response.code.unwrap_or(0);
                    if code == 200 {
                        debug!("proxy tunnel to {} established", address);
                        return Ok(stream);
                    }
                    return Err(Error::proxy(format!(
                        "CONNECT {address} failed: StatusCode:{code} {}",
                        response.reason.unwrap_or("")
                    )));
                }
                Ok(httparse::Status::Partial) if buf.len() < MAX_CONNECT_RESPONSE => continue,
                Ok(httparse::Status::Partial) => {
                    return Err(Error::proxy("CONNECT response headers too large"));
                }
                Err(e) => return Err(Error::proxy(format!("malformed CONNECT response: {e}"))),
            }
        }
    }
}

impl Dialer for HttpProxyDialer {
    fn dial<'a>(&'a self, _network: &'a str, address: &'a str) -> BoxFuture<'a, Result<TcpStream>> {
        Box::pin(self.tunnel(address))
    }
}

/// SOCKS protocol flavour, from the proxy URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    /// IPv4 only, resolved locally.
    V4,
    /// Resolved locally, connects by address.
    V5,
    /// Host name is sent to the proxy for remote resolution.
    V5Hostname,
}

/// Tunnels through a SOCKS proxy.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    proxy_address: String,
    version: SocksVersion,
    credentials: Option<(String, String)>,
}

impl SocksDialer {
    pub fn new(proxy: &Url) -> Result<Self> {
        let version = match proxy.scheme() {
            "socks4" | "socks4a" => SocksVersion::V4,
            "socks5" => SocksVersion::V5,
            "socks5h" => SocksVersion::V5Hostname,
            other => return Err(Error::proxy(format!("unknown SOCKS scheme {other}"))),
        };
        let host = proxy
            .host_str()
            .ok_or_else(|| Error::proxy(format!("proxy URL {proxy} has no host")))?;
        let port = proxy.port().unwrap_or(1080);
        let credentials = (!proxy.username().is_empty())
            .then(|| (proxy.username().to_string(), proxy.password().unwrap_or("").to_string()));
        Ok(Self {
            proxy_address: format!("{host}:{port}"),
            version,
            credentials,
        })
    }

    pub fn version(&self) -> SocksVersion {
        self.version
    }

    async fn resolve(address: &str, ipv4_only: bool) -> Result<SocketAddr> {
        let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address);
        let dns_error = |message: String| Error::Dns {
            host: host.to_string(),
            message,
        };
        lookup_host(address)
            .await
            .map_err(|e| dns_error(e.to_string()))?
            .find(|a| !ipv4_only || a.is_ipv4())
            .ok_or_else(|| dns_error("no such host".to_string()))
    }

    async fn tunnel(&self, address: &str) -> Result<TcpStream> {
        let socket = connect_tcp(&self.proxy_address).await?;
        let failed = |e: tokio_socks::Error| Error::proxy(format!("SOCKS connect to {address} failed: {e}"));

        let stream = match (self.version, &self.credentials) {
            (SocksVersion::V4, credentials) => {
                let target = Self::resolve(address, true).await?;
                let connected = match credentials {
                    Some((user, _)) => Socks4Stream::connect_with_userid_and_socket(socket, target, user).await,
                    None => Socks4Stream::connect_with_socket(socket, target).await,
                };
                connected.map_err(failed)?.into_inner()
            }
            (SocksVersion::V5, credentials) => {
                let target = Self::resolve(address, false).await?;
                let connected = match credentials {
                    Some((user, pass)) => {
                        Socks5Stream::connect_with_password_and_socket(socket, target, user, pass).await
                    }
                    None => Socks5Stream::connect_with_socket(socket, target).await,
                };
                connected.map_err(failed)?.into_inner()
            }
            (SocksVersion::V5Hostname, credentials) => {
                let connected = match credentials {
                    Some((user, pass)) => {
                        Socks5Stream::connect_with_password_and_socket(socket, address, user, pass).await
                    }
                    None => Socks5Stream::connect_with_socket(socket, address).await,
                };
                connected.map_err(failed)?.into_inner()
            }
        };
        debug!("SOCKS tunnel to {} established ({:?})", address, self.version);
        Ok(stream)
    }
}

impl Dialer for SocksDialer {
    fn dial<'a>(&'a self, _network: &'a str, address: &'a str) -> BoxFuture<'a, Result<TcpStream>> {
        Box::pin(self.tunnel(address))
    }
}

/// Pick a dialer for an optional proxy URL.
pub fn dialer_for_proxy(proxy: Option<&str>) -> Result<Box<dyn Dialer>> {
    let Some(proxy) = proxy.filter(|p| !p.trim().is_empty()) else {
        return Ok(Box::new(DirectDialer));
    };
    let url = Url::parse(proxy).map_err(|e| Error::proxy(format!("invalid proxy URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(Box::new(HttpProxyDialer::new(&url)?)),
        "socks4" | "socks4a" | "socks5" | "socks5h" => Ok(Box::new(SocksDialer::new(&url)?)),
        other => Err(Error::proxy(format!("unknown proxy scheme {other}"))),
    }
}
