//! Error classification.
//!
//! Network failures are reported to callers as synthetic HTTP status codes
//! so that a caller inspecting only `(status, body)` sees every failure on
//! the same channel. These codes are not HTTP semantics:
//!
//! | condition                               | code |
//! |-----------------------------------------|------|
//! | deadline / timeout                      | 408  |
//! | certificate verification failed         | 495  |
//! | connection refused                      | 502  |
//! | status code embedded in the error text  | that |
//! | DNS resolution failed                   | 421  |
//! | address family / route unavailable      | 405  |
//! | other socket error during connect       | 401  |
//!
//! Anything else yields an unclassified record (`status_code == 0`).

use std::error::Error as StdError;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const STATUS_TIMEOUT: u16 = 408;
pub const STATUS_CERTIFICATE: u16 = 495;
pub const STATUS_REFUSED: u16 = 502;
pub const STATUS_DNS: u16 = 421;
pub const STATUS_ADDRESS: u16 = 405;
pub const STATUS_SYSCALL: u16 = 401;

/// Classification result. `status_code == 0` means unclassified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub status_code: u16,
    pub message: String,
    pub debug_detail: String,
    pub operation: String,
}

impl ErrorRecord {
    fn new(status_code: u16, message: &str, err: &Error, operation: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
            debug_detail: full_chain(err),
            operation: operation.to_string(),
        }
    }

    pub fn is_classified(&self) -> bool {
        self.status_code != 0
    }
}

/// Error text including every source in the chain.
fn full_chain(err: &Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        let s_text = s.to_string();
        if !text.contains(&s_text) {
            text.push_str(": ");
            text.push_str(&s_text);
        }
        source = s.source();
    }
    text
}

fn operation_of(err: &Error) -> &'static str {
    match err {
        Error::Dns { .. } => "lookup",
        Error::Dial { .. } | Error::ConnectTimeout(_) | Error::Proxy(_) => "dial",
        Error::Tls(_) | Error::HandshakeTimeout(_) => "handshake",
        Error::Quic(_) => "quic",
        Error::TtfbTimeout(_) | Error::ReadIdleTimeout(_) => "read",
        _ => "request",
    }
}

/// Pull a status code out of text such as `StatusCode:407` or `status code 429`.
fn embedded_status(text: &str) -> Option<u16> {
    let lower = text.to_ascii_lowercase();
    for marker in ["statuscode:", "status code", "status:"] {
        if let Some(idx) = lower.find(marker) {
            let digits: String = lower[idx + marker.len()..]
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(code) = digits.parse::<u16>() {
                if (100..=599).contains(&code) {
                    return Some(code);
                }
            }
        }
    }
    None
}

fn is_address_error(err: &Error, text: &str) -> bool {
    if let Error::Dial { source, .. } = err {
        if matches!(
            source.kind(),
            std::io::ErrorKind::AddrNotAvailable
                | std::io::ErrorKind::NetworkUnreachable
                | std::io::ErrorKind::HostUnreachable
        ) {
            return true;
        }
    }
    text.contains("address family")
        || text.contains("no route to host")
        || text.contains("network is unreachable")
        || text.contains("host is unreachable")
}

/// Map an error to its synthetic status code. First matching rule wins.
pub fn classify(err: &Error) -> ErrorRecord {
    let text = full_chain(err).to_ascii_lowercase();
    let op = operation_of(err);

    if err.is_timeout() {
        return ErrorRecord::new(STATUS_TIMEOUT, "Request has timed out", err, op);
    }

    if text.contains("certificate") || text.contains("expired") || text.contains("unknown authority") {
        return ErrorRecord::new(STATUS_CERTIFICATE, "SSL certificate error", err, op);
    }

    let refused = matches!(err, Error::Dial { source, .. } if source.kind() == std::io::ErrorKind::ConnectionRefused);
    if refused || text.contains("connection refused") {
        return ErrorRecord::new(STATUS_REFUSED, "Connection refused", err, op);
    }

    if text.contains("timeout") || text.contains("timed out") || text.contains("deadline") {
        return ErrorRecord::new(STATUS_TIMEOUT, "Request has timed out", err, op);
    }

    if let Error::HttpStatus { status, .. } = err {
        return ErrorRecord::new(*status, "Server returned an error status", err, op);
    }
    if let Some(code) = embedded_status(&text) {
        return ErrorRecord::new(code, "Server returned an error status", err, op);
    }

    if matches!(err, Error::Dns { .. }) || text.contains("no such host") || text.contains("lookup ") {
        return ErrorRecord::new(STATUS_DNS, "Cannot resolve host", err, op);
    }

    if is_address_error(err, &text) {
        return ErrorRecord::new(STATUS_ADDRESS, "Address or route unavailable", err, op);
    }

    if let Error::Dial { source, .. } = err {
        if source.raw_os_error().is_some() {
            return ErrorRecord::new(STATUS_SYSCALL, "Socket error during connect", err, op);
        }
    }

    ErrorRecord {
        debug_detail: full_chain(err),
        operation: op.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    fn dial(kind: io::ErrorKind, msg: &str) -> Error {
        Error::Dial {
            address: "10.0.0.1:443".into(),
            source: io::Error::new(kind, msg),
        }
    }

    #[test]
    fn test_timeouts_are_408() {
        for err in [
            Error::ConnectTimeout(Duration::from_secs(1)),
            Error::HandshakeTimeout(Duration::from_secs(1)),
            Error::TtfbTimeout(Duration::from_secs(1)),
            Error::TotalTimeout(Duration::from_secs(1)),
            Error::tls("read: i/o timeout"),
        ] {
            assert_eq!(classify(&err).status_code, 408, "{err}");
        }
    }

    #[test]
    fn test_certificate_is_495() {
        let err = Error::tls("TLS handshake failed: certificate verify failed (certificate has expired)");
        let record = classify(&err);
        assert_eq!(record.status_code, 495);
        assert_eq!(record.operation, "handshake");
        assert_eq!(classify(&Error::tls("x509: certificate signed by unknown authority")).status_code, 495);
    }

    #[test]
    fn test_refused_is_502() {
        assert_eq!(classify(&dial(io::ErrorKind::ConnectionRefused, "refused")).status_code, 502);
        assert_eq!(classify(&Error::connection("connect: connection refused")).status_code, 502);
    }

    #[test]
    fn test_embedded_status() {
        let err = Error::proxy("CONNECT example.com:443 failed: StatusCode:407 Proxy Authentication Required");
        assert_eq!(classify(&err).status_code, 407);
        assert_eq!(classify(&Error::http_status(429, "slow down")).status_code, 429);
    }

    #[test]
    fn test_dns_is_421() {
        let err = Error::Dns {
            host: "nope.invalid".into(),
            message: "failed to lookup address information".into(),
        };
        let record = classify(&err);
        assert_eq!(record.status_code, 421);
        assert_eq!(record.operation, "lookup");
    }

    #[test]
    fn test_address_is_405() {
        assert_eq!(classify(&dial(io::ErrorKind::NetworkUnreachable, "unreachable")).status_code, 405);
        assert_eq!(
            classify(&Error::connection("address family not supported by protocol")).status_code,
            405
        );
    }

    #[test]
    fn test_os_error_is_401() {
        let err = Error::Dial {
            address: "10.0.0.1:443".into(),
            source: io::Error::from_raw_os_error(98),
        };
        assert_eq!(classify(&err).status_code, 401);
    }

    #[test]
    fn test_unclassified() {
        let record = classify(&Error::http_protocol("malformed chunk"));
        assert!(!record.is_classified());
        assert_eq!(record.message, "");
        assert!(record.debug_detail.contains("malformed chunk"));
    }
}
