//! Response body retrieval scoping by MIME type

use std::collections::HashSet;

use crate::config::ResponseBodyScope;

const PAGES_AND_API_TYPES: &[&str] = &[
    "text/html",
    "application/json",
    "application/xml",
    "text/xml",
    "multipart/form-data",
    "application/x-www-form-urlencoded",
];

const TEXT_CONTENT_EXACT_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-javascript",
];

/// Decides whether a response body is fetched
#[derive(Debug, Clone)]
pub struct BodyScopeMatcher {
    scope: ResponseBodyScope,
    extra: HashSet<String>,
}

impl BodyScopeMatcher {
    /// Build from a scope and additive extra types
    #[must_use]
    pub fn new(scope: ResponseBodyScope, extra_mime_types: Option<&[String]>) -> Self {
        let extra = extra_mime_types
            .unwrap_or_default()
            .iter()
            .map(|m| normalize(m))
            .filter(|m| !m.is_empty())
            .collect();
        Self { scope, extra }
    }

    /// Whether the body for `mime_type` should be fetched
    ///
    /// A missing or empty type is fetched for the preset scopes.
    #[must_use]
    pub fn should_retrieve(&self, mime_type: Option<&str>) -> bool {
        let normalized = mime_type.map(normalize).filter(|m| !m.is_empty());

        match self.scope {
            ResponseBodyScope::All => true,
            ResponseBodyScope::None => normalized.is_some_and(|m| self.extra.contains(&m)),
            ResponseBodyScope::PagesAndApi | ResponseBodyScope::TextContent => {
                let Some(m) = normalized else {
                    return true;
                };
                self.matches_preset(&m) || self.extra.contains(&m)
            }
        }
    }

    fn matches_preset(&self, normalized: &str) -> bool {
        match self.scope {
            ResponseBodyScope::PagesAndApi => PAGES_AND_API_TYPES.contains(&normalized),
            ResponseBodyScope::TextContent => {
                normalized.starts_with("text/") || TEXT_CONTENT_EXACT_TYPES.contains(&normalized)
            }
            ResponseBodyScope::All | ResponseBodyScope::None => false,
        }
    }
}

impl Default for BodyScopeMatcher {
    fn default() -> Self {
        Self::new(ResponseBodyScope::All, None)
    }
}

/// Strip `;` parameters, trim and lowercase
fn normalize(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether `mime_type` is textual and can be stored without base64
#[must_use]
pub fn is_text_mime(mime_type: &str) -> bool {
    let m = normalize(mime_type);
    m.starts_with("text/")
        || TEXT_CONTENT_EXACT_TYPES.contains(&m.as_str())
        || m.ends_with("+json")
        || m.ends_with("+xml")
        || m == "application/x-www-form-urlencoded"
        || m == "image/svg+xml"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extra(types: &[&str]) -> Vec<String> {
        types.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_all_scope() {
        let matcher = BodyScopeMatcher::new(ResponseBodyScope::All, None);
        assert!(matcher.should_retrieve(Some("image/png")));
        assert!(matcher.should_retrieve(None));
    }

    #[test]
    fn test_pages_and_api() {
        let matcher = BodyScopeMatcher::new(ResponseBodyScope::PagesAndApi, None);
        assert!(!matcher.should_retrieve(Some("text/css")));
        assert!(matcher.should_retrieve(Some("application/json; charset=utf-8")));
        assert!(matcher.should_retrieve(Some("TEXT/HTML")));
        assert!(matcher.should_retrieve(Some("multipart/form-data; boundary=x")));
        assert!(!matcher.should_retrieve(Some("application/javascript")));
    }

    #[test]
    fn test_text_content() {
        let matcher = BodyScopeMatcher::new(ResponseBodyScope::TextContent, None);
        assert!(matcher.should_retrieve(Some("text/css")));
        assert!(matcher.should_retrieve(Some("text/plain; charset=utf-8")));
        assert!(matcher.should_retrieve(Some("application/x-javascript")));
        assert!(!matcher.should_retrieve(Some("image/webp")));
        assert!(!matcher.should_retrieve(Some("font/woff2")));
    }

    #[test]
    fn test_none_with_extra() {
        let types = extra(&["image/png"]);
        let matcher = BodyScopeMatcher::new(ResponseBodyScope::None, Some(&types));
        assert!(matcher.should_retrieve(Some("image/png")));
        assert!(!matcher.should_retrieve(Some("image/jpeg")));
        assert!(!matcher.should_retrieve(Some("text/html")));
        assert!(!matcher.should_retrieve(None));
    }

    #[test]
    fn test_extra_is_additive() {
        let types = extra(&["Image/SVG+XML"]);
        let matcher = BodyScopeMatcher::new(ResponseBodyScope::PagesAndApi, Some(&types));
        assert!(matcher.should_retrieve(Some("image/svg+xml; charset=utf-8")));
        assert!(matcher.should_retrieve(Some("text/html")));
        assert!(!matcher.should_retrieve(Some("text/css")));
    }

    #[test]
    fn test_missing_mime_is_retrieved() {
        for scope in [ResponseBodyScope::PagesAndApi, ResponseBodyScope::TextContent] {
            let matcher = BodyScopeMatcher::new(scope, None);
            assert!(matcher.should_retrieve(None));
            assert!(matcher.should_retrieve(Some("")));
            assert!(matcher.should_retrieve(Some("  ")));
        }
    }

    #[test]
    fn test_is_text_mime() {
        assert!(is_text_mime("text/html; charset=utf-8"));
        assert!(is_text_mime("application/ld+json"));
        assert!(!is_text_mime("image/png"));
        assert!(!is_text_mime("application/octet-stream"));
    }
}
