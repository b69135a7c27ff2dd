//! Sensitive header, cookie and query-parameter masking

use std::collections::HashSet;

use regex::RegexSet;

use crate::config::RedactionConfig;
use crate::har::parse::{decode_component, split_pair, split_url};
use crate::har::{Cookie, Entry, Header, QueryParam};
use crate::Result;

use super::glob::compile_set;

/// Placeholder substituted for sensitive values
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Masks configured sensitive fields
///
/// Names, presence and order of fields are preserved; only values change.
/// Applying a redactor twice yields the same output as applying it once.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    headers: HashSet<String>,
    cookies: HashSet<String>,
    query: Option<RegexSet>,
}

impl Redactor {
    /// Build from configuration
    ///
    /// # Errors
    ///
    /// Returns error if a query-parameter glob is invalid
    pub fn new(config: &RedactionConfig) -> Result<Self> {
        let lower = |names: &[String]| -> HashSet<String> {
            names.iter().map(|n| n.trim().to_ascii_lowercase()).collect()
        };
        let query = if config.sensitive_query_params.is_empty() {
            None
        } else {
            Some(compile_set(&config.sensitive_query_params)?)
        };

        Ok(Self {
            headers: lower(&config.sensitive_headers),
            cookies: lower(&config.sensitive_cookies),
            query,
        })
    }

    /// Whether this redactor never changes anything
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.headers.is_empty() && self.cookies.is_empty() && self.query.is_none()
    }

    fn is_sensitive_header(&self, name: &str) -> bool {
        self.headers.contains(&name.to_ascii_lowercase())
    }

    fn is_sensitive_cookie(&self, name: &str) -> bool {
        self.cookies.contains(&name.trim().to_ascii_lowercase())
    }

    fn is_sensitive_param(&self, name: &str) -> bool {
        self.query.as_ref().is_some_and(|set| set.is_match(name))
    }

    /// Mask sensitive headers; sensitive cookies inside `Cookie` and
    /// `Set-Cookie` values are masked as well
    #[must_use]
    pub fn redact_headers(&self, headers: &[Header]) -> Vec<Header> {
        headers
            .iter()
            .map(|h| {
                let value = if self.is_sensitive_header(&h.name) {
                    REDACTION_MARKER.to_string()
                } else if self.cookies.is_empty() {
                    h.value.clone()
                } else if h.name.eq_ignore_ascii_case("cookie") {
                    self.redact_cookie_header(&h.value)
                } else if h.name.eq_ignore_ascii_case("set-cookie") {
                    self.redact_set_cookie_header(&h.value)
                } else {
                    h.value.clone()
                };
                Header::new(h.name.clone(), value)
            })
            .collect()
    }

    /// Mask sensitive cookies
    #[must_use]
    pub fn redact_cookies(&self, cookies: &[Cookie]) -> Vec<Cookie> {
        cookies
            .iter()
            .map(|c| {
                let mut cookie = c.clone();
                if self.is_sensitive_cookie(&c.name) {
                    cookie.value = REDACTION_MARKER.to_string();
                }
                cookie
            })
            .collect()
    }

    /// Mask sensitive query parameters
    #[must_use]
    pub fn redact_query(&self, params: &[QueryParam]) -> Vec<QueryParam> {
        params
            .iter()
            .map(|p| QueryParam {
                name: p.name.clone(),
                value: if self.is_sensitive_param(&p.name) {
                    REDACTION_MARKER.to_string()
                } else {
                    p.value.clone()
                },
            })
            .collect()
    }

    /// Mask sensitive query parameters inline in `url`
    ///
    /// The marker is written unencoded so the URL and the structured query
    /// list show the identical value.
    #[must_use]
    pub fn redact_url(&self, url: &str) -> String {
        if self.query.is_none() {
            return url.to_string();
        }
        let parts = split_url(url);
        let Some(query) = parts.query else {
            return url.to_string();
        };

        let rewritten: Vec<String> = query
            .split('&')
            .map(|pair| {
                let (raw_name, _) = split_pair(pair);
                if !pair.is_empty() && self.is_sensitive_param(&decode_component(raw_name)) {
                    format!("{raw_name}={REDACTION_MARKER}")
                } else {
                    pair.to_string()
                }
            })
            .collect();

        format!("{}?{}{}", parts.base, rewritten.join("&"), parts.fragment)
    }

    fn redact_cookie_header(&self, value: &str) -> String {
        value
            .split(';')
            .map(|part| match part.split_once('=') {
                Some((name, _)) if self.is_sensitive_cookie(name) => {
                    format!("{name}={REDACTION_MARKER}")
                }
                _ => part.to_string(),
            })
            .collect::<Vec<_>>()
            .join(";")
    }

    fn redact_set_cookie_header(&self, value: &str) -> String {
        value
            .split('\n')
            .map(|line| {
                let (pair, attributes) = match line.find(';') {
                    Some(i) => (&line[..i], &line[i..]),
                    None => (line, ""),
                };
                match pair.split_once('=') {
                    Some((name, _)) if self.is_sensitive_cookie(name) => {
                        format!("{name}={REDACTION_MARKER}{attributes}")
                    }
                    _ => line.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Apply every configured mask to a finalized entry
    #[must_use]
    pub fn redact_entry(&self, mut entry: Entry) -> Entry {
        if self.is_noop() {
            return entry;
        }

        let request = &mut entry.request;
        request.url = self.redact_url(&request.url);
        request.headers = self.redact_headers(&request.headers);
        request.cookies = self.redact_cookies(&request.cookies);
        request.query_string = self.redact_query(&request.query_string);

        let response = &mut entry.response;
        response.headers = self.redact_headers(&response.headers);
        response.cookies = self.redact_cookies(&response.cookies);
        if !response.redirect_url.is_empty() {
            response.redirect_url = self.redact_url(&response.redirect_url);
        }

        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::har::parse::parse_query_string;
    use proptest::prelude::*;

    fn redactor(headers: &[&str], cookies: &[&str], query: &[&str]) -> Redactor {
        let owned = |v: &[&str]| -> Vec<String> { v.iter().map(|s| (*s).to_string()).collect() };
        Redactor::new(&RedactionConfig {
            sensitive_headers: owned(headers),
            sensitive_cookies: owned(cookies),
            sensitive_query_params: owned(query),
        })
        .unwrap()
    }

    #[test]
    fn test_header_redaction() {
        let r = redactor(&["Authorization"], &[], &[]);
        let headers = vec![
            Header::new("authorization", "Bearer abc"),
            Header::new("Accept", "*/*"),
        ];

        let out = r.redact_headers(&headers);
        assert_eq!(out[0].name, "authorization");
        assert_eq!(out[0].value, REDACTION_MARKER);
        assert_eq!(out[1].value, "*/*");
    }

    #[test]
    fn test_cookie_redaction_in_list_and_headers() {
        let r = redactor(&[], &["session_id"], &[]);
        let cookies = vec![Cookie::new("SESSION_ID", "abc"), Cookie::new("theme", "dark")];

        let out = r.redact_cookies(&cookies);
        assert_eq!(out[0].value, REDACTION_MARKER);
        assert_eq!(out[1].value, "dark");

        let headers = vec![
            Header::new("Cookie", "session_id=abc; theme=dark"),
            Header::new("Set-Cookie", "session_id=xyz; Path=/; HttpOnly\ntheme=light"),
        ];
        let out = r.redact_headers(&headers);
        assert_eq!(out[0].value, "session_id=[REDACTED]; theme=dark");
        assert_eq!(out[1].value, "session_id=[REDACTED]; Path=/; HttpOnly\ntheme=light");
    }

    #[test]
    fn test_query_glob_in_url_and_list() {
        let r = redactor(&[], &[], &["api_*"]);
        let url = "https://api.example.com/v1?api_key=sk-1&page=2#top";

        let redacted = r.redact_url(url);
        assert_eq!(
            redacted,
            "https://api.example.com/v1?api_key=[REDACTED]&page=2#top"
        );

        let list = r.redact_query(&parse_query_string(url));
        assert_eq!(list[0].value, REDACTION_MARKER);
        assert_eq!(list[1].value, "2");
        assert_eq!(parse_query_string(&redacted), list);
    }

    #[test]
    fn test_url_without_query_untouched() {
        let r = redactor(&[], &[], &["token"]);
        assert_eq!(r.redact_url("https://a.com/x"), "https://a.com/x");
        assert_eq!(r.redact_url("https://a.com/x?"), "https://a.com/x?");
    }

    #[test]
    fn test_encoded_param_name_matches() {
        let r = redactor(&[], &[], &["access token"]);
        assert_eq!(
            r.redact_url("https://a.com/?access%20token=t1&x=1"),
            "https://a.com/?access%20token=[REDACTED]&x=1"
        );
    }

    #[test]
    fn test_noop() {
        assert!(Redactor::default().is_noop());
        assert!(!redactor(&["x"], &[], &[]).is_noop());
    }

    #[test]
    fn test_entry_redaction_idempotent() {
        use crate::har::{Cache, Request, Response, Timings};
        use chrono::DateTime;

        let url = "https://api.example.com/v1?api_key=sk-1&page=2";
        let mut response = Response::empty();
        response.status = 302;
        response.headers = vec![
            Header::new("Set-Cookie", "session_id=xyz; Path=/; HttpOnly\ntheme=light"),
            Header::new("Location", "/next?token=t9"),
        ];
        response.cookies = vec![Cookie::new("session_id", "xyz"), Cookie::new("theme", "light")];
        response.redirect_url = "https://api.example.com/next?token=t9&x=1".to_string();

        let entry = Entry {
            page_ref: None,
            started_date_time: DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z").unwrap(),
            time: 0.0,
            request: Request {
                method: "GET".to_string(),
                url: url.to_string(),
                http_version: "HTTP/1.1".to_string(),
                cookies: vec![Cookie::new("SESSION_ID", "abc"), Cookie::new("theme", "dark")],
                headers: vec![
                    Header::new("Authorization", "Bearer abc"),
                    Header::new("Cookie", "session_id=abc; theme=dark"),
                    Header::new("Accept", "*/*"),
                ],
                query_string: parse_query_string(url),
                post_data: None,
                headers_size: -1,
                body_size: 0,
            },
            response,
            cache: Cache::default(),
            timings: Timings::default(),
            server_ip_address: None,
            comment: None,
        };

        let r = redactor(&["authorization"], &["session_id"], &["api_*", "token"]);
        let once = r.redact_entry(entry);
        assert_eq!(once.request.headers[0].value, REDACTION_MARKER);
        assert_eq!(once.request.headers[1].value, "session_id=[REDACTED]; theme=dark");
        assert_eq!(once.request.headers[2].value, "*/*");
        assert_eq!(once.request.cookies[0].value, REDACTION_MARKER);
        assert_eq!(
            once.response.headers[0].value,
            "session_id=[REDACTED]; Path=/; HttpOnly\ntheme=light"
        );
        assert_eq!(
            once.response.redirect_url,
            "https://api.example.com/next?token=[REDACTED]&x=1"
        );

        let twice = r.redact_entry(once.clone());
        assert_eq!(twice, once);
    }

    proptest! {
        #[test]
        fn prop_url_redaction_idempotent(
            names in proptest::collection::vec("[a-z_]{1,8}", 1..6),
            values in proptest::collection::vec("[a-zA-Z0-9%+-]{0,8}", 1..6),
        ) {
            let r = redactor(&[], &[], &["api_*", "token"]);
            let query: Vec<String> = names
                .iter()
                .zip(values.iter())
                .map(|(n, v)| format!("{n}={v}"))
                .collect();
            let url = format!("https://a.com/p?{}", query.join("&"));

            let once = r.redact_url(&url);
            let twice = r.redact_url(&once);
            prop_assert_eq!(&once, &twice);

            let list_once = r.redact_query(&parse_query_string(&url));
            prop_assert_eq!(r.redact_query(&list_once), list_once);
        }
    }
}
