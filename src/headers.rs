//! Ordered request headers.
//!
//! Caller headers arrive as an unordered map. Wire order comes from the
//! caller's `header_order` first, then the browser family's habitual order,
//! then the remaining names alphabetically.

use std::collections::HashMap;

use crate::cookie::{cookie_header, Cookie};
use crate::fingerprint::BrowserFamily;

const CHROME_ORDER: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "cache-control",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-platform",
    "upgrade-insecure-requests",
    "user-agent",
    "content-type",
    "accept",
    "origin",
    "sec-fetch-site",
    "sec-fetch-mode",
    "sec-fetch-user",
    "sec-fetch-dest",
    "referer",
    "accept-encoding",
    "accept-language",
    "cookie",
    "priority",
];

const FIREFOX_ORDER: &[&str] = &[
    "host",
    "user-agent",
    "accept",
    "accept-language",
    "accept-encoding",
    "content-type",
    "content-length",
    "origin",
    "connection",
    "referer",
    "cookie",
    "upgrade-insecure-requests",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-user",
    "priority",
    "te",
];

fn family_order(family: BrowserFamily) -> &'static [&'static str] {
    match family {
        BrowserFamily::Firefox => FIREFOX_ORDER,
        BrowserFamily::Chrome | BrowserFamily::Other => CHROME_ORDER,
    }
}

/// Header list that keeps insertion order and matches names case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedHeaders(Vec<(String, String)>);

impl OrderedHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every header called `name`, keeping the first one's position.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(idx) => {
                self.0[idx].1 = value;
                let mut seen = false;
                self.0.retain(|(k, _)| {
                    if !k.eq_ignore_ascii_case(name) {
                        return true;
                    }
                    let keep = !seen;
                    seen = true;
                    keep
                });
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<(String, String)> {
        self.0
    }

    /// Build the wire header list for one request.
    pub fn build(
        headers: &HashMap<String, String>,
        header_order: &[String],
        user_agent: &str,
        cookies: &[Cookie],
        family: BrowserFamily,
    ) -> Self {
        let mut out = Self::new();
        for (k, v) in headers {
            out.set(k, v.clone());
        }
        if !user_agent.is_empty() && !out.contains("user-agent") {
            out.set("User-Agent", user_agent);
        }
        if let Some(extra) = cookie_header(cookies) {
            let value = match out.get("cookie") {
                Some(existing) if !existing.is_empty() => format!("{existing}; {extra}"),
                _ => extra,
            };
            out.set("Cookie", value);
        }
        out.sort(header_order, family);
        out
    }

    /// Sort by explicit order, then family order, then name.
    pub fn sort(&mut self, header_order: &[String], family: BrowserFamily) {
        let defaults = family_order(family);
        let rank = |name: &str| -> (usize, usize) {
            if let Some(i) = header_order.iter().position(|h| h.eq_ignore_ascii_case(name)) {
                return (0, i);
            }
            if let Some(i) = defaults.iter().position(|h| h.eq_ignore_ascii_case(name)) {
                return (1, i);
            }
            (2, 0)
        };
        self.0.sort_by(|(a, _), (b, _)| {
            rank(a)
                .cmp(&rank(b))
                .then_with(|| a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()))
        });
    }
}

impl From<Vec<(String, String)>> for OrderedHeaders {
    fn from(v: Vec<(String, String)>) -> Self {
        Self(v)
    }
}
