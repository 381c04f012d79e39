//! Uniform response: `(status, body, headers)` for successes and failures alike.

use std::collections::HashMap;
use std::io::Read;

use bytes::Bytes;
use http::Version;

use crate::classify::ErrorRecord;
use crate::cookie::Cookie;
use crate::error::{Error, Result};
use crate::fingerprint::Ja4Fingerprint;
use crate::transport::{RawResponse, TlsInfo};

/// Separator used when a header repeats (notably `Set-Cookie`).
pub const HEADER_VALUE_SEPARATOR: &str = "/,/";

#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Caller-supplied id, echoed back by the worker pool.
    pub request_id: Option<String>,
    /// HTTP status, a synthetic failure code, or 0 when unclassified.
    pub status: u16,
    /// Lower-cased names; repeated values joined with [`HEADER_VALUE_SEPARATOR`].
    pub headers: HashMap<String, String>,
    /// Headers as received, in order.
    pub header_list: Vec<(String, String)>,
    body: Bytes,
    http_version: String,
    pub final_url: Option<String>,
    pub tls: Option<TlsInfo>,
    pub ja4: Option<Ja4Fingerprint>,
    /// Present when the request failed before a response arrived.
    pub error: Option<ErrorRecord>,
}

fn version_str(v: Version) -> &'static str {
    match v {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/1.1",
    }
}

impl Response {
    pub fn new(status: u16, header_list: Vec<(String, String)>, body: Bytes, http_version: impl Into<String>) -> Self {
        let mut headers: HashMap<String, String> = HashMap::new();
        for (k, v) in &header_list {
            headers
                .entry(k.to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(HEADER_VALUE_SEPARATOR);
                    existing.push_str(v);
                })
                .or_insert_with(|| v.clone());
        }
        Self {
            status,
            headers,
            header_list,
            body,
            http_version: http_version.into(),
            ..Default::default()
        }
    }

    pub fn from_raw(raw: RawResponse) -> Self {
        let mut response = Self::new(raw.status, raw.headers, raw.body, version_str(raw.version));
        response.tls = raw.tls;
        response
    }

    /// Synthetic response for a failed request. Body is `"{message}-> \n{error}"`.
    pub fn from_error(err: &Error, record: ErrorRecord) -> Self {
        let body = format!("{}-> \n{}", record.message, err);
        Self {
            status: record.status_code,
            body: Bytes::from(body),
            error: Some(record),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.final_url = Some(url.into());
        self
    }

    pub fn with_request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }

    pub fn http_version(&self) -> &str {
        &self.http_version
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// First value of a header, case-insensitive.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.header_list
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_headers(&self, name: &str) -> Vec<&str> {
        self.header_list
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn redirect_url(&self) -> Option<&str> {
        self.get_header("location")
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.get_header("content-encoding")
    }

    /// Parsed `Set-Cookie` headers; malformed ones are skipped.
    pub fn cookies(&self) -> Vec<Cookie> {
        self.get_headers("set-cookie")
            .into_iter()
            .filter_map(|v| Cookie::parse_set_cookie(v).ok())
            .collect()
    }

    /// Decode body based on Content-Encoding (gzip, deflate, br, zstd).
    pub fn decoded_body(&self) -> Result<Bytes> {
        match self.content_encoding().map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("gzip") | Some("x-gzip") => decode_gzip(&self.body),
            Some("deflate") => decode_deflate(&self.body),
            Some("br") => decode_brotli(&self.body),
            Some("zstd") => decode_zstd(&self.body),
            _ if self.body.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) => decode_zstd(&self.body),
            _ if self.body.starts_with(&[0x1f, 0x8b]) => decode_gzip(&self.body),
            _ => Ok(self.body.clone()),
        }
    }

    pub fn text(&self) -> Result<String> {
        let decoded = self.decoded_body()?;
        String::from_utf8(decoded.to_vec()).map_err(|e| Error::Decompression(format!("UTF-8 decode error: {}", e)))
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let text = self.text()?;
        serde_json::from_str(&text).map_err(Error::from)
    }
}

fn decode_gzip(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("gzip: {}", e)))?;
    Ok(Bytes::from(decoded))
}

/// Servers send both zlib-wrapped and raw deflate under this name.
fn decode_deflate(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    if flate2::read::ZlibDecoder::new(data).read_to_end(&mut decoded).is_ok() {
        return Ok(Bytes::from(decoded));
    }
    decoded.clear();
    flate2::read::DeflateDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("deflate: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_brotli(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    brotli::Decompressor::new(data, 4096)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("brotli: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_zstd(data: &[u8]) -> Result<Bytes> {
    zstd::stream::decode_all(data)
        .map(Bytes::from)
        .map_err(|e| Error::Decompression(format!("zstd: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use std::io::Write;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_repeated_headers_joined() {
        let r = Response::new(
            200,
            pairs(&[("Set-Cookie", "a=1; Path=/"), ("content-type", "text/plain"), ("set-cookie", "b=2")]),
            Bytes::new(),
            "HTTP/2",
        );
        assert_eq!(r.headers["set-cookie"], "a=1; Path=/".to_string() + HEADER_VALUE_SEPARATOR + "b=2");
        assert_eq!(r.headers["content-type"], "text/plain");
        let names: Vec<String> = r.cookies().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_from_error_body() {
        let err = Error::Dial {
            address: "127.0.0.1:1".into(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
        };
        let r = Response::from_error(&err, classify(&err));
        assert_eq!(r.status, 502);
        assert_eq!(
            std::str::from_utf8(r.body()).unwrap(),
            "Connection refused-> \ndial tcp 127.0.0.1:1: connection refused"
        );
        assert!(r.is_error());
    }

    #[test]
    fn test_unclassified_error_is_status_zero() {
        let err = Error::http_protocol("garbled");
        let r = Response::from_error(&err, classify(&err));
        assert_eq!(r.status, 0);
        assert!(std::str::from_utf8(r.body()).unwrap().ends_with("HTTP protocol error: garbled"));
    }

    #[test]
    fn test_gzip_decoding() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"hello").unwrap();
        let body = Bytes::from(enc.finish().unwrap());
        let r = Response::new(200, pairs(&[("Content-Encoding", "gzip")]), body, "HTTP/1.1");
        assert_eq!(r.text().unwrap(), "hello");
    }
}
