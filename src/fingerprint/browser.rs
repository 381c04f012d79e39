//! Browser family inference from the User-Agent.

use super::http2::PseudoHeaderOrder;

/// Coarse browser family. Only decides GREASE policy and header ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BrowserFamily {
    Chrome,
    Firefox,
    #[default]
    Other,
}

impl BrowserFamily {
    /// Infer the family by case-insensitive substring match.
    ///
    /// Chromium derivatives (Edge, Opera, Brave) carry "Chrome" in their UA
    /// and are treated as Chrome.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if ua.contains("chrome") || ua.contains("crios") {
            Self::Chrome
        } else if ua.contains("firefox") || ua.contains("fxios") {
            Self::Firefox
        } else {
            Self::Other
        }
    }

    /// Whether GREASE values are inserted into the ClientHello.
    pub fn uses_grease(self) -> bool {
        matches!(self, Self::Chrome)
    }

    /// HTTP/2 pseudo-header order sent by this family.
    pub fn pseudo_header_order(self) -> PseudoHeaderOrder {
        match self {
            Self::Chrome => PseudoHeaderOrder::CHROME,
            Self::Firefox => PseudoHeaderOrder::FIREFOX,
            Self::Other => PseudoHeaderOrder::CHROME,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
            Self::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_inference() {
        let chrome = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/100.0.4896.75 Safari/537.36";
        let firefox = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
        let safari = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15";

        assert_eq!(BrowserFamily::from_user_agent(chrome), BrowserFamily::Chrome);
        assert_eq!(BrowserFamily::from_user_agent(firefox), BrowserFamily::Firefox);
        assert_eq!(BrowserFamily::from_user_agent(safari), BrowserFamily::Other);
        assert_eq!(BrowserFamily::from_user_agent(""), BrowserFamily::Other);
    }

    #[test]
    fn test_grease_policy() {
        assert!(BrowserFamily::Chrome.uses_grease());
        assert!(!BrowserFamily::Firefox.uses_grease());
        assert!(!BrowserFamily::Other.uses_grease());
    }
}
