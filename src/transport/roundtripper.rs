//! Adaptive round-tripper.
//!
//! Owns one cache slot per destination `host:port`. The first request to a
//! cold address dials, runs the TLS handshake with the compiled ClientHello,
//! reads the negotiated ALPN and installs an HTTP/2 or HTTP/1.1 transport.
//! Every later request reuses that transport.
//!
//! The per-address decision to dial is serialised by the slot's `in_flight`
//! lock, so N concurrent first requests produce one handshake. The slot map
//! itself is guarded by a short synchronous lock; no I/O happens under it.
//!
//! [`RoundTripper::dial_tls`] reports one of three outcomes. A request that
//! finds a transport already installed gets [`DialOutcome::Negotiated`] and
//! never sees a raw connection it would have to wire up itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};
use url::Url;

use super::connector::{AlpnProtocol, BoringConnector, MaybeHttpsStream};
use super::dialer::{dialer_for_proxy, BoxFuture, Dialer};
use super::h1::{ConnectionSource, H1Transport};
use super::h2::H2Transport;
use super::h3::H3Transport;
use super::{RawRequest, RawResponse};
use crate::error::{Error, Result};
use crate::fingerprint::{BrowserFamily, ClientHelloSpec, Http2Fingerprint, QuicSpec};
use crate::timeouts::{within, Timeouts};

/// Destination of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn from_url(url: &Url) -> Result<Self> {
        let scheme = url.scheme().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(Error::InvalidUrl(format!("unsupported scheme {scheme}")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{url} has no host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidUrl(format!("{url} has no port")))?;
        Ok(Self { scheme, host, port })
    }

    /// Cache key: `host:port`.
    pub fn key(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }
}

/// Protocol transport installed for one address.
#[derive(Debug, Clone)]
pub enum CachedTransport {
    Http1(Arc<H1Transport>),
    Http2(Arc<H2Transport>),
}

impl CachedTransport {
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Http1(_) => "http/1.1",
            Self::Http2(_) => "h2",
        }
    }

    fn same_as(&self, other: &CachedTransport) -> bool {
        match (self, other) {
            (Self::Http1(a), Self::Http1(b)) => Arc::ptr_eq(a, b),
            (Self::Http2(a), Self::Http2(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    async fn send(&self, req: &RawRequest, timeouts: &Timeouts) -> Result<RawResponse> {
        match self {
            Self::Http1(t) => t.send(req, timeouts).await,
            Self::Http2(t) => t.send(req, timeouts).await,
        }
    }
}

/// Result of the low-level dial routine.
#[derive(Debug)]
pub enum DialOutcome {
    Failed(Error),
    /// A transport is installed for the address; use it.
    Negotiated(CachedTransport),
    /// A handshaken connection that is not part of the cache.
    Fresh(MaybeHttpsStream),
}

/// Why a connection is being dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPurpose {
    /// First use of an address: negotiate and install a transport.
    Install,
    /// Extra connection for an already installed HTTP/1.1 transport.
    Replenish,
}

#[derive(Default)]
struct Slot {
    in_flight: tokio::sync::Mutex<()>,
    installed: Mutex<Option<CachedTransport>>,
}

impl Slot {
    fn get(&self) -> Option<CachedTransport> {
        self.installed.lock().ok().and_then(|t| t.clone())
    }
}

/// Settings that define one round-tripper; equal configs share a fingerprint.
#[derive(Debug, Clone)]
pub struct RoundTripperConfig {
    pub spec: Arc<ClientHelloSpec>,
    pub http2: Http2Fingerprint,
    pub quic: Option<QuicSpec>,
    pub force_http3: bool,
    pub insecure: bool,
    pub proxy: Option<String>,
}

impl RoundTripperConfig {
    pub fn new(spec: ClientHelloSpec) -> Self {
        let http2 = Http2Fingerprint::for_family(spec.family);
        Self {
            spec: Arc::new(spec),
            http2,
            quic: None,
            force_http3: false,
            insecure: false,
            proxy: None,
        }
    }
}

struct Shared {
    spec: Arc<ClientHelloSpec>,
    http2: Http2Fingerprint,
    dialer: Arc<dyn Dialer>,
    connector: BoringConnector,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    handshakes: AtomicUsize,
}

/// HTTP round-tripper that picks the protocol from the TLS handshake.
#[derive(Clone)]
pub struct RoundTripper {
    shared: Arc<Shared>,
    h3: Option<Arc<H3Transport>>,
}

impl std::fmt::Debug for RoundTripper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundTripper")
            .field("family", &self.shared.spec.family)
            .field("http3", &self.h3.is_some())
            .field("handshakes", &self.handshake_count())
            .finish()
    }
}

/// Feeds an HTTP/1.1 transport with additional connections.
struct Replenisher {
    shared: Weak<Shared>,
    target: Target,
}

impl ConnectionSource for Replenisher {
    fn open<'a>(&'a self, timeouts: &'a Timeouts) -> BoxFuture<'a, Result<MaybeHttpsStream>> {
        Box::pin(async move {
            let shared = self
                .shared
                .upgrade()
                .ok_or_else(|| Error::ConnectionClosed("round-tripper dropped".into()))?;
            match shared.dial_tls(&self.target, DialPurpose::Replenish, timeouts).await {
                DialOutcome::Fresh(stream) => Ok(stream),
                DialOutcome::Failed(e) => Err(e),
                DialOutcome::Negotiated(_) => Err(Error::ProtocolInvariant(
                    "replenish dial returned a cached transport".into(),
                )),
            }
        })
    }
}

impl Shared {
    /// Same configuration with an empty cache.
    fn detached(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            http2: self.http2.clone(),
            dialer: self.dialer.clone(),
            connector: self.connector.clone(),
            slots: Mutex::new(HashMap::new()),
            handshakes: AtomicUsize::new(0),
        }
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(key.to_string()).or_default().clone()
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<Slot>> {
        self.slots.lock().ok().and_then(|s| s.get(key).cloned())
    }

    /// TCP dial plus, for https, the TLS handshake.
    async fn connect(&self, target: &Target, timeouts: &Timeouts) -> Result<MaybeHttpsStream> {
        let address = target.key();
        let tcp = within(timeouts.connect, self.dialer.dial("tcp", &address), Error::ConnectTimeout).await?;
        if !target.is_tls() {
            return Ok(MaybeHttpsStream::Http(tcp));
        }

        debug!("TLS handshake start {}", address);
        let tls = within(
            timeouts.handshake,
            self.connector.handshake(&self.spec, &target.host, tcp),
            Error::HandshakeTimeout,
        )
        .await?;
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let stream = MaybeHttpsStream::Https(tls);
        debug!("TLS handshake done {} alpn={:?}", address, stream.alpn_protocol());
        Ok(stream)
    }

    async fn install(self: &Arc<Self>, target: &Target, stream: MaybeHttpsStream) -> Result<CachedTransport> {
        let transport = match stream.alpn_protocol() {
            AlpnProtocol::H2 => CachedTransport::Http2(Arc::new(H2Transport::connect(stream, self.http2.clone()).await?)),
            AlpnProtocol::Http1 | AlpnProtocol::Unknown => {
                let source = Replenisher {
                    shared: Arc::downgrade(self),
                    target: target.clone(),
                };
                CachedTransport::Http1(Arc::new(H1Transport::new(stream, Box::new(source)).await?))
            }
        };
        debug!("installed {} transport for {}", transport.protocol(), target.key());
        Ok(transport)
    }

    /// Low-level dial. With [`DialPurpose::Install`] the address's single-flight
    /// lock is held across dial, handshake and installation.
    async fn dial_tls(self: &Arc<Self>, target: &Target, purpose: DialPurpose, timeouts: &Timeouts) -> DialOutcome {
        if purpose == DialPurpose::Replenish {
            return match self.connect(target, timeouts).await {
                Ok(stream) => DialOutcome::Fresh(stream),
                Err(e) => DialOutcome::Failed(e),
            };
        }

        let key = target.key();
        let slot = self.slot(&key);
        let _guard = slot.in_flight.lock().await;
        if let Some(existing) = slot.get() {
            trace!("{} negotiated while waiting", key);
            return DialOutcome::Negotiated(existing);
        }

        let stream = match self.connect(target, timeouts).await {
            Ok(stream) => stream,
            Err(e) => return DialOutcome::Failed(e),
        };
        let transport = match self.install(target, stream).await {
            Ok(t) => t,
            Err(e) => return DialOutcome::Failed(e),
        };
        match slot.installed.lock() {
            Ok(mut installed) => *installed = Some(transport.clone()),
            Err(_) => return DialOutcome::Failed(Error::ProtocolInvariant(format!("cache slot for {key} poisoned"))),
        }
        DialOutcome::Negotiated(transport)
    }

    /// Drop the slot's transport if it is still the one that failed.
    fn evict_if_same(&self, key: &str, failed: &CachedTransport) {
        let Some(slot) = self.existing_slot(key) else { return };
        if let Ok(mut installed) = slot.installed.lock() {
            if installed.as_ref().is_some_and(|t| t.same_as(failed)) {
                debug!("evicting dead {} transport for {}", failed.protocol(), key);
                *installed = None;
            }
        }
    }
}

impl RoundTripper {
    pub fn new(config: RoundTripperConfig) -> Result<Self> {
        let dialer = dialer_for_proxy(config.proxy.as_deref())?;
        let connector = BoringConnector::new().insecure(config.insecure);
        let family = config.spec.family;
        let h3 = config.force_http3.then(|| {
            Arc::new(H3Transport::new(config.quic.clone(), family).insecure(config.insecure))
        });
        Ok(Self {
            shared: Arc::new(Shared {
                spec: config.spec,
                http2: config.http2,
                dialer: Arc::from(dialer),
                connector,
                slots: Mutex::new(HashMap::new()),
                handshakes: AtomicUsize::new(0),
            }),
            h3,
        })
    }

    /// Apply a setting. When clones share this round-tripper the change
    /// goes to a private copy with its own empty connection cache.
    fn reconfigure(mut self, apply: impl FnOnce(&mut Shared)) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => apply(shared),
            None => {
                let mut detached = self.shared.detached();
                apply(&mut detached);
                self.shared = Arc::new(detached);
            }
        }
        self
    }

    /// Use a custom dialer (tests, pluggable proxies).
    pub fn with_dialer(self, dialer: Box<dyn Dialer>) -> Self {
        self.reconfigure(|shared| shared.dialer = Arc::from(dialer))
    }

    /// Trust extra root certificates.
    pub fn with_root_certificates(self, certs: Vec<Vec<u8>>) -> Self {
        self.reconfigure(|shared| shared.connector = shared.connector.clone().with_root_certificates(certs))
    }

    pub fn spec(&self) -> &ClientHelloSpec {
        &self.shared.spec
    }

    pub fn family(&self) -> BrowserFamily {
        self.shared.spec.family
    }

    /// Successful TLS handshakes performed so far.
    pub fn handshake_count(&self) -> usize {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    /// Protocol installed for `address` (`host:port`), if any.
    pub fn cached_protocol(&self, address: &str) -> Option<&'static str> {
        self.shared
            .existing_slot(address)
            .and_then(|slot| slot.get())
            .map(|t| t.protocol())
    }

    /// Dial routine exposed for callers that manage connections themselves.
    pub async fn dial_tls(&self, target: &Target, purpose: DialPurpose, timeouts: &Timeouts) -> DialOutcome {
        self.shared.dial_tls(target, purpose, timeouts).await
    }

    /// Execute one request.
    pub async fn round_trip(&self, req: &RawRequest, timeouts: &Timeouts) -> Result<RawResponse> {
        if let Some(h3) = &self.h3 {
            return h3.send(req, timeouts).await;
        }

        let target = Target::from_url(&req.url)?;
        let key = target.key();
        let cached = self.shared.existing_slot(&key).and_then(|slot| slot.get());
        let transport = match cached {
            Some(t) => {
                trace!("cache hit {} ({})", key, t.protocol());
                t
            }
            None => {
                trace!("cache miss {}", key);
                match self.shared.dial_tls(&target, DialPurpose::Install, timeouts).await {
                    DialOutcome::Negotiated(t) => t,
                    DialOutcome::Failed(e) => return Err(e),
                    DialOutcome::Fresh(_) => {
                        debug_assert!(false, "install dial returned an uncached connection");
                        return Err(Error::ProtocolInvariant(format!(
                            "install dial for {key} returned an uncached connection"
                        )));
                    }
                }
            }
        };

        let result = transport.send(req, timeouts).await;
        if let Err(e) = &result {
            if e.is_connection_lost() {
                self.shared.evict_if_same(&key, &transport);
            }
        }
        result
    }

    /// No address has a cache slot.
    pub fn is_idle(&self) -> bool {
        self.shared.slots.lock().map(|s| s.is_empty()).unwrap_or(true)
    }

    /// Drop every cached transport except the one for `keep` (`host:port`).
    pub fn close_idle_connections(&self, keep: Option<&str>) {
        let mut slots = match self.shared.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = slots.len();
        slots.retain(|key, _| Some(key.as_str()) == keep);
        debug!("closed {} idle connection slots", before - slots.len());
    }
}
