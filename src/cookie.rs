//! Cookies: the request/response cookie shape, `Set-Cookie` parsing and a
//! minimal jar used to carry cookies across redirects.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// A cookie as supplied by callers or parsed from `Set-Cookie`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
    /// The original `Set-Cookie` line, empty for caller-built cookies.
    pub raw: String,
    /// Attributes that were not recognised, verbatim.
    pub unparsed: Vec<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Parse one `Set-Cookie` header value.
    pub fn parse_set_cookie(header: &str) -> Result<Self> {
        let mut parts = header.split(';').map(str::trim);
        let first = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::CookieParse("Empty cookie header".to_string()))?;
        let (name, value) = first
            .split_once('=')
            .ok_or_else(|| Error::CookieParse("No = in cookie".to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::CookieParse("Empty cookie name".to_string()));
        }

        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
        cookie.raw = header.to_string();

        for attr in parts.filter(|a| !a.is_empty()) {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim())),
                None => (attr.to_ascii_lowercase(), None),
            };
            match (key.as_str(), val) {
                ("secure", None) => cookie.secure = true,
                ("httponly", None) => cookie.http_only = true,
                ("domain", Some(v)) if !v.is_empty() => cookie.domain = Some(normalize_domain(v)),
                ("path", Some(v)) if v.starts_with('/') => cookie.path = Some(v.to_string()),
                ("expires", Some(v)) => match parse_cookie_date(v) {
                    Some(dt) => cookie.expires = Some(dt),
                    None => cookie.unparsed.push(attr.to_string()),
                },
                ("max-age", Some(v)) => match v.parse() {
                    Ok(secs) => cookie.max_age = Some(secs),
                    Err(_) => cookie.unparsed.push(attr.to_string()),
                },
                ("samesite", Some(v)) => cookie.same_site = Some(v.to_string()),
                _ => cookie.unparsed.push(attr.to_string()),
            }
        }
        Ok(cookie)
    }

    /// Expired by `Max-Age<=0` or a past `Expires`. Max-Age wins.
    pub fn is_expired(&self) -> bool {
        match (self.max_age, self.expires) {
            (Some(age), _) => age <= 0,
            (None, Some(expires)) => expires < Utc::now(),
            (None, None) => false,
        }
    }

    pub fn matches_url(&self, url: &Url) -> bool {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        if self.secure && url.scheme() != "https" {
            return false;
        }
        if self.is_expired() {
            return false;
        }
        if let Some(domain) = &self.domain {
            if host != *domain && !host.ends_with(&format!(".{}", domain)) {
                return false;
            }
        }
        let cookie_path = self.path.as_deref().unwrap_or("/");
        let request_path = url.path();
        request_path == cookie_path
            || cookie_path == "/"
            || request_path.starts_with(&format!("{}/", cookie_path.trim_end_matches('/')))
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Render cookies as a single `Cookie` request header value.
pub fn cookie_header<'a>(cookies: impl IntoIterator<Item = &'a Cookie>) -> Option<String> {
    let pairs: Vec<String> = cookies.into_iter().map(|c| c.to_string()).collect();
    (!pairs.is_empty()).then(|| pairs.join("; "))
}

/// Cookies keyed by domain, then name.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: HashMap<String, HashMap<String, Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie received from `origin`. Host-only cookies take the
    /// origin's host; expired cookies delete any stored namesake.
    pub fn store(&mut self, mut cookie: Cookie, origin: &Url) {
        let Some(host) = origin.host_str() else { return };
        let domain = cookie.domain.clone().unwrap_or_else(|| normalize_domain(host));
        if cookie.domain.is_none() {
            cookie.domain = Some(domain.clone());
        }
        if cookie.is_expired() {
            if let Some(by_name) = self.cookies.get_mut(&domain) {
                by_name.remove(&cookie.name);
            }
            return;
        }
        self.cookies.entry(domain).or_default().insert(cookie.name.clone(), cookie);
    }

    /// Parse and store every `Set-Cookie` value; malformed ones are skipped.
    pub fn store_set_cookies<'a>(&mut self, values: impl IntoIterator<Item = &'a str>, origin: &Url) {
        for value in values {
            if let Ok(cookie) = Cookie::parse_set_cookie(value) {
                self.store(cookie, origin);
            }
        }
    }

    pub fn cookies_for_url(&self, url: &Url) -> Vec<&Cookie> {
        let mut out: Vec<&Cookie> = self
            .cookies
            .values()
            .flat_map(|m| m.values())
            .filter(|c| c.matches_url(url))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, domain: &str, name: &str) -> Option<&Cookie> {
        self.cookies.get(&normalize_domain(domain))?.get(name)
    }

    pub fn len(&self) -> usize {
        self.cookies.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.strip_prefix('.').unwrap_or(domain).to_ascii_lowercase()
}

fn parse_cookie_date(date_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%a, %d-%b-%Y %H:%M:%S GMT", "%a, %d-%b-%y %H:%M:%S GMT", "%A, %d-%b-%y %H:%M:%S GMT"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(date_str, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_set_cookie() {
        let raw = "sid=abc123; Path=/app; Domain=.Example.com; Expires=Wed, 21 Oct 2037 07:28:00 GMT; Max-Age=3600; Secure; HttpOnly; SameSite=Lax; Priority=High";
        let c = Cookie::parse_set_cookie(raw).unwrap();
        assert_eq!(c.name, "sid");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.path.as_deref(), Some("/app"));
        assert_eq!(c.domain.as_deref(), Some("example.com"));
        assert!(c.expires.is_some());
        assert_eq!(c.max_age, Some(3600));
        assert!(c.secure && c.http_only);
        assert_eq!(c.same_site.as_deref(), Some("Lax"));
        assert_eq!(c.raw, raw);
        assert_eq!(c.unparsed, vec!["Priority=High".to_string()]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Cookie::parse_set_cookie("").is_err());
        assert!(Cookie::parse_set_cookie("novalue").is_err());
        assert!(Cookie::parse_set_cookie("=x").is_err());
    }

    #[test]
    fn test_bad_expires_is_unparsed() {
        let c = Cookie::parse_set_cookie("a=1; Expires=someday").unwrap();
        assert!(c.expires.is_none());
        assert_eq!(c.unparsed, vec!["Expires=someday".to_string()]);
    }

    #[test]
    fn test_jar_host_only_and_matching() {
        let origin = Url::parse("https://www.example.com/login").unwrap();
        let mut jar = CookieJar::new();
        jar.store_set_cookies(["a=1; Path=/", "b=2; Secure", "c=3; Path=/admin"], &origin);
        assert_eq!(jar.len(), 3);

        let page = Url::parse("https://www.example.com/home").unwrap();
        let names: Vec<&str> = jar.cookies_for_url(&page).iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let plain = Url::parse("http://www.example.com/admin/x").unwrap();
        let names: Vec<&str> = jar.cookies_for_url(&plain).iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);

        let other = Url::parse("https://other.com/").unwrap();
        assert!(jar.cookies_for_url(&other).is_empty());
    }

    #[test]
    fn test_expired_cookie_deletes() {
        let origin = Url::parse("https://example.com/").unwrap();
        let mut jar = CookieJar::new();
        jar.store_set_cookies(["a=1"], &origin);
        jar.store_set_cookies(["a=; Max-Age=0"], &origin);
        assert!(jar.is_empty());
    }

    #[test]
    fn test_cookie_header() {
        let cookies = vec![Cookie::new("a", "1"), Cookie::new("b", "2")];
        assert_eq!(cookie_header(&cookies).as_deref(), Some("a=1; b=2"));
        assert_eq!(cookie_header(&Vec::new()), None);
    }

    #[test]
    fn test_cookie_json_shape() {
        let json = r#"{"name":"a","value":"1","httpOnly":true,"sameSite":"Strict"}"#;
        let c: Cookie = serde_json::from_str(json).unwrap();
        assert!(c.http_only);
        assert_eq!(c.same_site.as_deref(), Some("Strict"));
        assert!(c.unparsed.is_empty());
    }
}
