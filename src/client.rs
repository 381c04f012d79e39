//! Dispatch façade.
//!
//! [`Client::execute`] is the single request entry point. Fingerprint
//! compilation happens first and is the only failure returned as `Err`;
//! every other failure, a malformed URL included, comes back as a
//! [`Response`] carrying a classified synthetic status.
//!
//! ```rust,ignore
//! use mimic::{Client, RequestOptions};
//! use http::Method;
//!
//! let client = Client::builder().build();
//! let opts = RequestOptions {
//!     ja3: "771,4865-4866-4867-49195,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-21,29-23-24,0".into(),
//!     user_agent: "Mozilla/5.0 ... Chrome/120.0.0.0 Safari/537.36".into(),
//!     ..Default::default()
//! };
//! let response = client.execute("https://example.com/", &opts, Method::GET).await?;
//! println!("{} {}", response.status, response.text()?);
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{Method, Version};
use tracing::{debug, warn};
use url::Url;

use crate::classify::classify;
use crate::config::{ProfileKey, RequestOptions};
use crate::cookie::{Cookie, CookieJar};
use crate::error::{Error, Result};
use crate::fingerprint::extensions::EXT_SERVER_NAME;
use crate::fingerprint::{compile, compile_quic, CompileOptions, Http2Fingerprint, Ja4Fingerprint, Ja4Input};
use crate::headers::OrderedHeaders;
use crate::pool::WorkerPool;
use crate::response::Response;
use crate::timeouts::{within, Timeouts};
use crate::transport::{RawRequest, RoundTripper, RoundTripperConfig};

/// Redirects followed before giving up.
pub const MAX_REDIRECTS: u32 = 10;

/// Chrome 120 ClientHello, used when a request names no fingerprint.
pub const DEFAULT_JA3: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513-21,29-23-24,0";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Builder for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    timeouts: Timeouts,
    user_agent: String,
    max_redirects: u32,
    workers: usize,
    root_certs: Vec<Vec<u8>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::api_defaults(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_redirects: MAX_REDIRECTS,
            workers: crate::pool::DEFAULT_WORKERS,
            root_certs: Vec::new(),
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// User agent for requests that do not set one.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    /// Worker-pool capacity used by [`Client::queue`].
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Trust additional root certificates (DER or PEM).
    pub fn root_certificates(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.root_certs = certs;
        self
    }

    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                config: self,
                round_trippers: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct ClientInner {
    config: ClientBuilder,
    round_trippers: Mutex<HashMap<ProfileKey, RoundTripper>>,
}

/// Fingerprinting HTTP client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        ClientBuilder::default().build()
    }
}

fn http_version_token(v: Version) -> &'static str {
    match v {
        Version::HTTP_10 => "10",
        Version::HTTP_2 => "20",
        Version::HTTP_3 => "30",
        _ => "11",
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn user_agent<'a>(&'a self, opts: &'a RequestOptions) -> &'a str {
        if opts.user_agent.trim().is_empty() {
            &self.inner.config.user_agent
        } else {
            opts.user_agent.trim()
        }
    }

    /// Compile every fingerprint in `opts`. Errors here never touch the network.
    fn compile_profile(&self, opts: &RequestOptions) -> Result<RoundTripperConfig> {
        let user_agent = self.user_agent(opts);
        let fingerprint = match opts.tls_fingerprint() {
            "" => DEFAULT_JA3,
            fp => fp,
        };
        let spec = compile(
            fingerprint,
            &CompileOptions {
                user_agent,
                force_http1: opts.force_http1,
                disable_grease: opts.disable_grease,
            },
        )?;

        let http2 = match opts.http2_fingerprint.trim() {
            "" => Http2Fingerprint::for_family(spec.family),
            fp => Http2Fingerprint::parse(fp)?,
        };

        let quic = match opts.quic_fingerprint.trim() {
            "" => None,
            _ if !opts.force_http3 => None,
            fp => match compile_quic(fp, user_agent) {
                Ok(q) => Some(q),
                Err(e) => {
                    warn!("QUIC fingerprint rejected, HTTP/3 runs unfingerprinted: {}", e);
                    None
                }
            },
        };

        let mut config = RoundTripperConfig::new(spec);
        config.http2 = http2;
        config.quic = quic;
        config.force_http3 = opts.force_http3;
        config.insecure = opts.insecure_skip_verify;
        config.proxy = Some(opts.proxy.trim().to_string()).filter(|p| !p.is_empty());
        Ok(config)
    }

    /// Cached round-tripper for the profile, compiling it on first use.
    fn round_tripper(&self, opts: &RequestOptions) -> Result<RoundTripper> {
        let key = opts.profile_key();
        if let Some(rt) = self.inner.round_trippers.lock().ok().and_then(|m| m.get(&key).cloned()) {
            return Ok(rt);
        }

        let config = self.compile_profile(opts)?;
        let rt = RoundTripper::new(config)?.with_root_certificates(self.inner.config.root_certs.clone());
        let mut map = match self.inner.round_trippers.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(map.entry(key).or_insert(rt).clone())
    }

    /// Execute one request. Only fingerprint compilation errors are
    /// returned as `Err`.
    pub async fn execute(&self, url: &str, opts: &RequestOptions, method: Method) -> Result<Response> {
        // A cached round-tripper implies the profile already compiled.
        let rt = match self.round_tripper(opts) {
            Ok(rt) => rt,
            Err(e) if e.is_compilation() => return Err(e),
            Err(e) => return Ok(self.failure(&e, url, opts)),
        };
        let url = match Url::parse(url) {
            Ok(url) => url,
            Err(e) => return Ok(self.failure(&Error::from(e), url, opts)),
        };

        let mut timeouts = self.inner.config.timeouts.clone();
        if let Some(total) = opts.timeout() {
            timeouts.total = Some(total);
        }

        let outcome = within(
            timeouts.total,
            self.follow(&rt, url.clone(), opts, method, &timeouts),
            Error::TotalTimeout,
        )
        .await;

        match outcome {
            Ok(response) => Ok(response.with_request_id(opts.request_id.clone())),
            Err(e) if e.is_compilation() => Err(e),
            Err(e) => Ok(self.failure(&e, url.as_str(), opts)),
        }
    }

    fn failure(&self, err: &Error, url: &str, opts: &RequestOptions) -> Response {
        let record = classify(err);
        debug!("request to {} failed: {} (status {})", url, err, record.status_code);
        Response::from_error(err, record)
            .with_url(url)
            .with_request_id(opts.request_id.clone())
    }

    async fn follow(
        &self,
        rt: &RoundTripper,
        mut url: Url,
        opts: &RequestOptions,
        mut method: Method,
        timeouts: &Timeouts,
    ) -> Result<Response> {
        let user_agent = self.user_agent(opts);
        let mut jar = CookieJar::new();
        let mut body = Bytes::from(opts.body.clone());
        let mut redirects = 0u32;
        let mut dropped_body = false;

        loop {
            let from_jar: Vec<Cookie> = jar.cookies_for_url(&url).into_iter().cloned().collect();
            let mut cookies: Vec<Cookie> = opts
                .cookies
                .iter()
                .filter(|c| !from_jar.iter().any(|j| j.name == c.name))
                .cloned()
                .collect();
            cookies.extend(from_jar);

            let mut headers = OrderedHeaders::build(&opts.headers, &opts.header_order, user_agent, &cookies, rt.family());
            if dropped_body {
                headers.remove("content-type");
                headers.remove("content-length");
            }

            let request = RawRequest {
                method: method.clone(),
                url: url.clone(),
                headers: headers.into_vec(),
                body: body.clone(),
            };
            let raw = rt.round_trip(&request, timeouts).await?;
            let mut response = Response::from_raw(raw).with_url(url.as_str());
            response.ja4 = self.observe_ja4(rt, &request, &response);
            jar.store_set_cookies(response.get_headers("set-cookie"), &url);

            if opts.disable_redirect || !response.is_redirect() {
                return Ok(response);
            }
            let Some(location) = response.redirect_url() else {
                return Ok(response);
            };
            let next = url
                .join(location)
                .map_err(|e| Error::InvalidRedirectUrl(format!("{location}: {e}")))?;
            if redirects >= self.inner.config.max_redirects {
                return Err(Error::RedirectLimit { count: redirects });
            }
            redirects += 1;

            let to_get = (response.status == 303 && method != Method::HEAD)
                || (matches!(response.status, 301 | 302) && method == Method::POST);
            if to_get {
                method = Method::GET;
                body = Bytes::new();
                dropped_body = true;
            }
            debug!("redirect {} -> {} ({})", url, next, response.status);
            url = next;
        }
    }

    fn observe_ja4(&self, rt: &RoundTripper, request: &RawRequest, response: &Response) -> Option<Ja4Fingerprint> {
        let tls = response.tls.as_ref()?;
        let spec = rt.spec();
        let host_is_ip = request.url.host_str().is_some_and(|h| h.trim_matches(['[', ']']).parse::<IpAddr>().is_ok());
        let extensions = spec.extension_ids();
        let version = match response.http_version() {
            "HTTP/2" => Version::HTTP_2,
            "HTTP/3" => Version::HTTP_3,
            "HTTP/1.0" => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        Some(Ja4Fingerprint::observe(&Ja4Input {
            tls_version: tls.version.unwrap_or(spec.tls_version_max),
            cipher: tls.cipher.unwrap_or_default(),
            extensions: &extensions,
            sni: spec.has_extension(EXT_SERVER_NAME) && !host_is_ip,
            method: request.method.as_str(),
            http_version: http_version_token(version),
            headers: &request.headers,
        }))
    }

    /// Drop cached connections for every address except `keep` (`host:port`).
    ///
    /// Round-trippers left without any connection are forgotten, so a
    /// caller rotating proxies or user agents does not grow the cache.
    pub fn close_idle_connections(&self, keep: Option<&str>) {
        let mut map = match self.inner.round_trippers.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = map.len();
        map.retain(|_, rt| {
            rt.close_idle_connections(keep);
            !rt.is_idle()
        });
        if map.len() != before {
            debug!("dropped {} idle round-trippers", before - map.len());
        }
    }

    /// Number of cached round-trippers.
    pub fn round_tripper_count(&self) -> usize {
        self.inner.round_trippers.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Round-tripper already built for these options, if any.
    pub fn cached_round_tripper(&self, opts: &RequestOptions) -> Option<RoundTripper> {
        self.inner
            .round_trippers
            .lock()
            .ok()
            .and_then(|m| m.get(&opts.profile_key()).cloned())
    }

    /// Start a worker pool bound to this client.
    pub fn queue(&self) -> WorkerPool {
        WorkerPool::new(self.clone(), self.inner.config.workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FingerprintError;

    #[tokio::test]
    async fn test_compile_error_is_err() {
        let client = Client::default();
        let opts = RequestOptions {
            ja3: "771,4865,0-111111,29,0".into(),
            ..Default::default()
        };
        let err = client.execute("https://127.0.0.1:1/", &opts, Method::GET).await.unwrap_err();
        match err {
            Error::Fingerprint(FingerprintError::UnsupportedExtension { id }) => assert_eq!(id, "111111"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_http2_fingerprint_is_err() {
        let client = Client::default();
        let opts = RequestOptions {
            http2_fingerprint: "1:65536|0|0".into(),
            ..Default::default()
        };
        let err = client.execute("https://127.0.0.1:1/", &opts, Method::GET).await.unwrap_err();
        assert!(err.is_compilation());
    }

    #[tokio::test]
    async fn test_refused_becomes_502_response() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::default();
        let opts = RequestOptions {
            request_id: Some("job-7".into()),
            ..Default::default()
        };
        let response = client
            .execute(&format!("https://{addr}/"), &opts, Method::GET)
            .await
            .unwrap();
        assert_eq!(response.status, 502);
        assert_eq!(response.request_id.as_deref(), Some("job-7"));
        assert!(response.error.is_some());
        assert!(std::str::from_utf8(response.body()).unwrap().starts_with("Connection refused-> \n"));
    }

    #[tokio::test]
    async fn test_unsupported_proxy_is_response() {
        let client = Client::default();
        let opts = RequestOptions {
            proxy: "ftp://127.0.0.1:2121".into(),
            ..Default::default()
        };
        let response = client.execute("https://127.0.0.1:1/", &opts, Method::GET).await.unwrap();
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_malformed_url_is_response() {
        let client = Client::default();
        let opts = RequestOptions {
            request_id: Some("bad-url".into()),
            ..Default::default()
        };
        let response = client.execute("not a url", &opts, Method::GET).await.unwrap();
        assert!(response.is_error());
        assert_eq!(response.request_id.as_deref(), Some("bad-url"));
        let record = response.error.as_ref().unwrap();
        assert!(record.debug_detail.contains("URL parse error"), "{record:?}");
    }

    #[tokio::test]
    async fn test_malformed_url_still_reports_compile_error() {
        let client = Client::default();
        let opts = RequestOptions {
            ja3: "771,4865,0-111111,29,0".into(),
            ..Default::default()
        };
        assert!(client.execute("not a url", &opts, Method::GET).await.is_err());
    }

    #[test]
    fn test_close_idle_forgets_unused_profiles() {
        let client = Client::default();
        for i in 0..5 {
            let opts = RequestOptions {
                user_agent: format!("agent-{i}"),
                ..Default::default()
            };
            client.round_tripper(&opts).unwrap();
        }
        assert_eq!(client.round_tripper_count(), 5);
        client.close_idle_connections(None);
        assert_eq!(client.round_tripper_count(), 0);
    }

    #[test]
    fn test_profiles_are_cached() {
        let client = Client::default();
        let opts = RequestOptions::default();
        let a = client.round_tripper(&opts).unwrap();
        let b = client.round_tripper(&opts).unwrap();
        assert_eq!(a.handshake_count(), b.handshake_count());
        assert!(client.cached_round_tripper(&opts).is_some());
        assert!(client.cached_round_tripper(&RequestOptions { force_http1: true, ..Default::default() }).is_none());
    }
}
