//! Derivations from raw header and URL text: cookies, query strings, sizes

use std::borrow::Cow;

use super::model::{Cookie, Header, QueryParam};

/// A URL split around its query string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlParts<'a> {
    /// Everything before `?`
    pub base: &'a str,
    /// Raw query without the leading `?`, if present
    pub query: Option<&'a str>,
    /// Fragment including `#`, or empty
    pub fragment: &'a str,
}

/// Split `url` into base, query and fragment
#[must_use]
pub fn split_url(url: &str) -> UrlParts<'_> {
    let (rest, fragment) = match url.find('#') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, ""),
    };
    match rest.find('?') {
        Some(i) => UrlParts {
            base: &rest[..i],
            query: Some(&rest[i + 1..]),
            fragment,
        },
        None => UrlParts {
            base: rest,
            query: None,
            fragment,
        },
    }
}

/// Decode one query component (`+` is a space)
#[must_use]
pub fn decode_component(raw: &str) -> String {
    let spaced: Cow<'_, str> = if raw.contains('+') {
        Cow::Owned(raw.replace('+', " "))
    } else {
        Cow::Borrowed(raw)
    };
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced.into_owned(),
    }
}

/// Split a raw `name=value` query pair into its raw halves
#[must_use]
pub fn split_pair(pair: &str) -> (&str, Option<&str>) {
    match pair.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (pair, None),
    }
}

/// Parse the query string of `url` in order, duplicates preserved
#[must_use]
pub fn parse_query_string(url: &str) -> Vec<QueryParam> {
    let Some(query) = split_url(url).query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = split_pair(pair);
            QueryParam {
                name: decode_component(name),
                value: value.map(decode_component).unwrap_or_default(),
            }
        })
        .collect()
}

/// First value of header `name`, case-insensitive
#[must_use]
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Cookies from a request `Cookie` header value (`a=1; b=2`)
#[must_use]
pub fn parse_cookie_header(value: &str) -> Vec<Cookie> {
    value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((name, value)) => Cookie::new(name.trim(), value.trim()),
            None => Cookie::new(part, ""),
        })
        .collect()
}

/// Cookie from one `Set-Cookie` line
#[must_use]
pub fn parse_set_cookie(line: &str) -> Option<Cookie> {
    let mut parts = line.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie::new(name, value.trim());
    for attribute in parts {
        let (key, val) = match attribute.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (attribute.trim(), None),
        };
        match key.to_ascii_lowercase().as_str() {
            "path" => cookie.path = val.map(str::to_string),
            "domain" => cookie.domain = val.map(str::to_string),
            "expires" => cookie.expires = val.map(str::to_string),
            "httponly" => cookie.http_only = Some(true),
            "secure" => cookie.secure = Some(true),
            _ => {}
        }
    }
    Some(cookie)
}

/// Cookies sent with a request
#[must_use]
pub fn request_cookies(headers: &[Header]) -> Vec<Cookie> {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("cookie"))
        .flat_map(|h| parse_cookie_header(&h.value))
        .collect()
}

/// Cookies set by a response
///
/// Devtools sources fold repeated `Set-Cookie` headers into one value
/// joined by newlines, so each line is parsed separately.
#[must_use]
pub fn response_cookies(headers: &[Header]) -> Vec<Cookie> {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("set-cookie"))
        .flat_map(|h| h.value.lines().filter_map(parse_set_cookie).collect::<Vec<_>>())
        .collect()
}

fn header_block_len(headers: &[Header]) -> usize {
    // "name: value\r\n" per header plus the terminating blank line
    headers
        .iter()
        .map(|h| h.name.len() + h.value.len() + 4)
        .sum::<usize>()
        + 2
}

/// Size of a request line plus header block
#[must_use]
pub fn request_headers_size(method: &str, url: &str, http_version: &str, headers: &[Header]) -> i64 {
    let target = url
        .find("://")
        .and_then(|scheme_end| {
            let after = &url[scheme_end + 3..];
            after.find('/').map(|i| &after[i..])
        })
        .unwrap_or("/");
    let line = method.len() + 1 + target.len() + 1 + http_version.len() + 2;
    i64::try_from(line + header_block_len(headers)).unwrap_or(-1)
}

/// Size of a status line plus header block
#[must_use]
pub fn response_headers_size(
    http_version: &str,
    status: u16,
    status_text: &str,
    headers: &[Header],
) -> i64 {
    let line = http_version.len() + 1 + status.to_string().len() + 1 + status_text.len() + 2;
    i64::try_from(line + header_block_len(headers)).unwrap_or(-1)
}
