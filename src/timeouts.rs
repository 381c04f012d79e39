//! Per-phase timeout configuration.
//!
//! # Phases
//!
//! - **connect**: TCP dial (including DNS and proxy CONNECT)
//! - **handshake**: TLS handshake on an established socket
//! - **ttfb**: request sent until response headers arrive
//! - **read_idle**: longest gap between response body chunks (resets per chunk)
//! - **total**: absolute deadline for the whole call, redirects included
//!
//! Each phase fails with its own error variant; the classifier maps all of
//! them to 408. Timeouts abandon the attempt and are never retried.
//!
//! ```rust,ignore
//! use mimic::{Client, Timeouts};
//! use std::time::Duration;
//!
//! let client = Client::builder()
//!     .timeouts(Timeouts::api_defaults().handshake(Duration::from_secs(5)))
//!     .build()?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Timeout configuration for one request. `None` disables a phase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for the TCP connection (DNS + connect + proxy tunnel).
    pub connect: Option<Duration>,

    /// Deadline for the TLS handshake once the socket is up.
    pub handshake: Option<Duration>,

    /// Time-to-first-byte: request written until response headers received.
    pub ttfb: Option<Duration>,

    /// Maximum wait for the next body chunk. **Resets on every chunk.**
    pub read_idle: Option<Duration>,

    /// Absolute deadline for the whole call. **Does not reset.**
    pub total: Option<Duration>,
}

impl Timeouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for ordinary API calls.
    ///
    /// - connect: 10s
    /// - handshake: 10s
    /// - ttfb: 30s
    /// - read_idle: 30s
    /// - total: 120s
    pub fn api_defaults() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            handshake: Some(Duration::from_secs(10)),
            ttfb: Some(Duration::from_secs(30)),
            read_idle: Some(Duration::from_secs(30)),
            total: Some(Duration::from_secs(120)),
        }
    }

    pub fn connect(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self
    }

    pub fn handshake(mut self, timeout: Duration) -> Self {
        self.handshake = Some(timeout);
        self
    }

    pub fn ttfb(mut self, timeout: Duration) -> Self {
        self.ttfb = Some(timeout);
        self
    }

    pub fn read_idle(mut self, timeout: Duration) -> Self {
        self.read_idle = Some(timeout);
        self
    }

    pub fn total(mut self, timeout: Duration) -> Self {
        self.total = Some(timeout);
        self
    }

    pub fn no_total_timeout(mut self) -> Self {
        self.total = None;
        self
    }
}

/// Run `fut` under an optional deadline, mapping expiry with `on_timeout`.
pub(crate) async fn within<T, F>(
    limit: Option<Duration>,
    fut: F,
    on_timeout: fn(Duration) -> Error,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| on_timeout(d))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_defaults() {
        let t = Timeouts::api_defaults();
        assert_eq!(t.connect, Some(Duration::from_secs(10)));
        assert_eq!(t.handshake, Some(Duration::from_secs(10)));
        assert_eq!(t.ttfb, Some(Duration::from_secs(30)));
        assert_eq!(t.read_idle, Some(Duration::from_secs(30)));
        assert_eq!(t.total, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_builder_pattern() {
        let t = Timeouts::new()
            .connect(Duration::from_secs(5))
            .ttfb(Duration::from_secs(15))
            .read_idle(Duration::from_secs(60));

        assert_eq!(t.connect, Some(Duration::from_secs(5)));
        assert_eq!(t.ttfb, Some(Duration::from_secs(15)));
        assert_eq!(t.read_idle, Some(Duration::from_secs(60)));
        assert_eq!(t.handshake, None);
        assert_eq!(t.total, None);
    }

    #[tokio::test]
    async fn test_within_maps_expiry() {
        let err = within(
            Some(Duration::from_millis(10)),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Error::TtfbTimeout,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TtfbTimeout(_)));

        let ok: Result<u8> = within(None, async { Ok(7) }, Error::TtfbTimeout).await;
        assert_eq!(ok.unwrap(), 7);
    }
}
