//! HTTP/2 fingerprint configuration (SETTINGS frame, priority, pseudo-headers).
//!
//! Text form (Akamai style): `settings|window_or_dependency|exclusive|order`,
//! e.g. `1:65536,2:0,4:6291456,6:262144|15663105|0|m,a,s,p`.

use std::fmt;

use super::browser::BrowserFamily;
use crate::error::FingerprintError;

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 1;
pub const SETTINGS_ENABLE_PUSH: u16 = 2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 6;
pub const SETTINGS_ENABLE_CONNECT_PROTOCOL: u16 = 8;
pub const SETTINGS_NO_RFC7540_PRIORITIES: u16 = 9;

/// Default connection-level window before any WINDOW_UPDATE.
pub const DEFAULT_CONNECTION_WINDOW: u32 = 65_535;

/// HTTP/2 SETTINGS for fingerprinting.
///
/// Unset fields are not sent. `order` keeps the id order from the
/// fingerprint string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: Option<bool>,
    pub no_rfc7540_priorities: Option<bool>,
    pub order: Vec<u16>,
}

impl Http2Settings {
    fn set(&mut self, id: u16, value: u32) -> Result<(), FingerprintError> {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = Some(value),
            SETTINGS_ENABLE_PUSH => self.enable_push = Some(value != 0),
            SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
            SETTINGS_INITIAL_WINDOW_SIZE => self.initial_window_size = Some(value),
            SETTINGS_MAX_FRAME_SIZE => self.max_frame_size = Some(value),
            SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
            SETTINGS_ENABLE_CONNECT_PROTOCOL => self.enable_connect_protocol = Some(value != 0),
            SETTINGS_NO_RFC7540_PRIORITIES => self.no_rfc7540_priorities = Some(value != 0),
            other => {
                return Err(FingerprintError::InvalidHttp2(format!(
                    "unknown setting id {other}"
                )))
            }
        }
        self.order.push(id);
        Ok(())
    }

    /// Wire value of a setting, if the fingerprint carries it.
    pub fn get(&self, id: u16) -> Option<u32> {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => self.header_table_size,
            SETTINGS_ENABLE_PUSH => self.enable_push.map(u32::from),
            SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams,
            SETTINGS_INITIAL_WINDOW_SIZE => self.initial_window_size,
            SETTINGS_MAX_FRAME_SIZE => self.max_frame_size,
            SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size,
            SETTINGS_ENABLE_CONNECT_PROTOCOL => self.enable_connect_protocol.map(u32::from),
            SETTINGS_NO_RFC7540_PRIORITIES => self.no_rfc7540_priorities.map(u32::from),
            _ => None,
        }
    }
}

/// Request pseudo-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PseudoHeader {
    Method,
    Authority,
    Scheme,
    Path,
}

impl PseudoHeader {
    fn from_letter(c: char) -> Option<Self> {
        match c {
            'm' => Some(Self::Method),
            'a' => Some(Self::Authority),
            's' => Some(Self::Scheme),
            'p' => Some(Self::Path),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Self::Method => 'm',
            Self::Authority => 'a',
            Self::Scheme => 's',
            Self::Path => 'p',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Method => ":method",
            Self::Authority => ":authority",
            Self::Scheme => ":scheme",
            Self::Path => ":path",
        }
    }
}

/// Order of the four request pseudo-headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PseudoHeaderOrder(pub [PseudoHeader; 4]);

impl PseudoHeaderOrder {
    pub const CHROME: Self = Self([
        PseudoHeader::Method,
        PseudoHeader::Authority,
        PseudoHeader::Scheme,
        PseudoHeader::Path,
    ]);
    pub const FIREFOX: Self = Self([
        PseudoHeader::Method,
        PseudoHeader::Path,
        PseudoHeader::Authority,
        PseudoHeader::Scheme,
    ]);

    /// Parse `m,a,s,p` or `masp`; all four letters exactly once.
    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        let letters: Vec<char> = s.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
        let invalid = || FingerprintError::InvalidHttp2(format!("invalid pseudo-header order {s:?}"));
        if letters.len() != 4 {
            return Err(invalid());
        }
        let mut out = [PseudoHeader::Method; 4];
        for (slot, c) in out.iter_mut().zip(&letters) {
            *slot = PseudoHeader::from_letter(*c).ok_or_else(invalid)?;
        }
        for (i, h) in out.iter().enumerate() {
            if out[..i].contains(h) {
                return Err(invalid());
            }
        }
        Ok(Self(out))
    }

    pub fn iter(&self) -> impl Iterator<Item = PseudoHeader> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for PseudoHeaderOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letters: Vec<String> = self.0.iter().map(|h| h.letter().to_string()).collect();
        f.write_str(&letters.join(","))
    }
}

/// Parsed HTTP/2 fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Fingerprint {
    pub settings: Http2Settings,
    /// Second segment: stream dependency, doubling as the connection
    /// WINDOW_UPDATE increment in Akamai-style captures.
    pub stream_dependency: u32,
    pub exclusive: bool,
    pub weight: u16,
    pub pseudo_header_order: PseudoHeaderOrder,
}

impl Http2Fingerprint {
    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        let segments: Vec<&str> = s.trim().split('|').collect();
        if segments.len() != 4 {
            return Err(FingerprintError::InvalidHttp2(format!(
                "expected 4 '|'-separated segments, got {}",
                segments.len()
            )));
        }

        let mut settings = Http2Settings::default();
        for pair in segments[0].split(',').filter(|p| !p.trim().is_empty()) {
            let (id, value) = pair
                .split_once(':')
                .ok_or_else(|| FingerprintError::InvalidHttp2(format!("malformed setting {pair:?}")))?;
            let id: u16 = id.trim().parse().map_err(|_| FingerprintError::InvalidHttp2(format!("bad setting id {id:?}")))?;
            let value: u32 = value.trim().parse().map_err(|_| FingerprintError::InvalidHttp2(format!("bad setting value {value:?}")))?;
            settings.set(id, value)?;
        }

        let stream_dependency = segments[1]
            .trim()
            .parse::<u32>()
            .map_err(|_| FingerprintError::InvalidHttp2(format!("bad stream dependency {:?}", segments[1])))?;
        let exclusive = match segments[2].trim() {
            "0" => false,
            "1" => true,
            other => {
                return Err(FingerprintError::InvalidHttp2(format!(
                    "exclusive flag must be 0 or 1, got {other:?}"
                )))
            }
        };

        Ok(Self {
            settings,
            stream_dependency,
            exclusive,
            weight: 256,
            pseudo_header_order: PseudoHeaderOrder::parse(segments[3])?,
        })
    }

    /// Built-in fingerprint for a browser family.
    pub fn for_family(family: BrowserFamily) -> Self {
        let mut settings = Http2Settings::default();
        let (pairs, window, order): (&[(u16, u32)], u32, PseudoHeaderOrder) = match family {
            BrowserFamily::Firefox => (
                &[(1, 65_536), (2, 0), (4, 131_072), (5, 16_384)],
                12_517_377,
                PseudoHeaderOrder::FIREFOX,
            ),
            BrowserFamily::Chrome | BrowserFamily::Other => (
                &[(1, 65_536), (2, 0), (4, 6_291_456), (6, 262_144)],
                15_663_105,
                PseudoHeaderOrder::CHROME,
            ),
        };
        for (id, value) in pairs {
            // Ids above are all known settings.
            let _ = settings.set(*id, *value);
        }
        Self {
            settings,
            stream_dependency: window,
            exclusive: false,
            weight: 256,
            pseudo_header_order: order,
        }
    }

    /// Connection window after the initial WINDOW_UPDATE.
    pub fn connection_window_size(&self) -> u32 {
        DEFAULT_CONNECTION_WINDOW.saturating_add(self.stream_dependency)
    }
}

impl fmt::Display for Http2Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings: Vec<String> = self
            .settings
            .order
            .iter()
            .filter_map(|id| self.settings.get(*id).map(|v| format!("{id}:{v}")))
            .collect();
        write!(
            f,
            "{}|{}|{}|{}",
            settings.join(","),
            self.stream_dependency,
            u8::from(self.exclusive),
            self.pseudo_header_order
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME: &str = "1:65536,2:0,4:6291456,6:262144|15663105|0|m,a,s,p";

    #[test]
    fn test_parse_chrome() {
        let fp = Http2Fingerprint::parse(CHROME).unwrap();
        assert_eq!(fp.settings.header_table_size, Some(65536));
        assert_eq!(fp.settings.enable_push, Some(false));
        assert_eq!(fp.settings.initial_window_size, Some(6291456));
        assert_eq!(fp.settings.max_header_list_size, Some(262144));
        assert_eq!(fp.settings.max_concurrent_streams, None);
        assert_eq!(fp.settings.order, vec![1, 2, 4, 6]);
        assert_eq!(fp.stream_dependency, 15663105);
        assert!(!fp.exclusive);
        assert_eq!(fp.weight, 256);
        assert_eq!(fp.pseudo_header_order, PseudoHeaderOrder::CHROME);
    }

    #[test]
    fn test_display_round_trips() {
        assert_eq!(Http2Fingerprint::parse(CHROME).unwrap().to_string(), CHROME);
        let ff = "1:65536,2:0,4:131072,5:16384|12517377|1|m,p,a,s";
        assert_eq!(Http2Fingerprint::parse(ff).unwrap().to_string(), ff);
    }

    #[test]
    fn test_family_defaults() {
        assert_eq!(Http2Fingerprint::for_family(BrowserFamily::Chrome).to_string(), CHROME);
        let ff = Http2Fingerprint::for_family(BrowserFamily::Firefox);
        assert_eq!(ff.pseudo_header_order, PseudoHeaderOrder::FIREFOX);
        assert_eq!(ff.settings.max_frame_size, Some(16384));
        assert_eq!(ff.connection_window_size(), 65_535 + 12_517_377);
    }

    #[test]
    fn test_contiguous_letters() {
        let fp = Http2Fingerprint::parse("1:4096|0|0|mpas").unwrap();
        assert_eq!(fp.pseudo_header_order, PseudoHeaderOrder::FIREFOX);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Http2Fingerprint::parse("1:65536|0|0").is_err());
        assert!(Http2Fingerprint::parse("1:65536|0|0|m,a,s,p|x").is_err());
        assert!(Http2Fingerprint::parse("99:1|0|0|m,a,s,p").is_err());
        assert!(Http2Fingerprint::parse("1:abc|0|0|m,a,s,p").is_err());
        assert!(Http2Fingerprint::parse("1:1|0|2|m,a,s,p").is_err());
        assert!(Http2Fingerprint::parse("1:1|0|0|m,a,s").is_err());
        assert!(Http2Fingerprint::parse("1:1|0|0|m,a,a,p").is_err());
    }
}
