//! Configuration types for harcap

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::{Redactor, UrlFilter};
use crate::{HarError, Result};

/// Default creator name written into `log.creator`
pub const DEFAULT_CREATOR_NAME: &str = "harcap";

/// Default bound on waiting for outstanding body fetches at stop
pub const DEFAULT_BODY_WAIT_TIMEOUT_MS: u64 = 5000;

/// Default capacity of the source event channel
pub const DEFAULT_EVENT_BUFFER: usize = 4096;

/// Which response bodies are fetched from the instrumentation source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBodyScope {
    /// Fetch every body
    #[default]
    All,
    /// Documents and API payloads only
    PagesAndApi,
    /// Any textual content
    TextContent,
    /// Fetch nothing unless an extra MIME type matches
    None,
}

/// A single category of captured data
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureType {
    /// Request header list
    RequestHeaders,
    /// Request cookie list
    RequestCookies,
    /// Textual request post data
    RequestContent,
    /// Binary request post data
    RequestBinaryContent,
    /// Response header list
    ResponseHeaders,
    /// Response cookie list
    ResponseCookies,
    /// Textual response bodies
    ResponseContent,
    /// Binary (base64) response bodies
    ResponseBinaryContent,
    /// Timing breakdown
    Timings,
}

/// Set of [`CaptureType`] flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureTypes(BTreeSet<CaptureType>);

impl CaptureTypes {
    /// No categories at all: only method, URL, status and sizes are kept
    #[must_use]
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    /// Headers, cookies, text content and timings
    #[must_use]
    pub fn all_text() -> Self {
        Self::empty()
            .with(CaptureType::RequestHeaders)
            .with(CaptureType::RequestCookies)
            .with(CaptureType::RequestContent)
            .with(CaptureType::ResponseHeaders)
            .with(CaptureType::ResponseCookies)
            .with(CaptureType::ResponseContent)
            .with(CaptureType::Timings)
    }

    /// Everything including binary content
    #[must_use]
    pub fn all() -> Self {
        Self::all_text()
            .with(CaptureType::RequestBinaryContent)
            .with(CaptureType::ResponseBinaryContent)
    }

    /// Add a flag
    #[must_use]
    pub fn with(mut self, flag: CaptureType) -> Self {
        self.0.insert(flag);
        self
    }

    /// Remove a flag
    #[must_use]
    pub fn without(mut self, flag: CaptureType) -> Self {
        self.0.remove(&flag);
        self
    }

    /// Whether a flag is set
    #[must_use]
    pub fn contains(&self, flag: CaptureType) -> bool {
        self.0.contains(&flag)
    }

    /// Whether every flag of `other` is also set here
    #[must_use]
    pub fn contains_all(&self, other: &Self) -> bool {
        other.0.is_subset(&self.0)
    }

    /// Iterate the set flags in declaration order
    pub fn iter(&self) -> impl Iterator<Item = CaptureType> + '_ {
        self.0.iter().copied()
    }
}

impl Default for CaptureTypes {
    fn default() -> Self {
        Self::all_text()
    }
}

/// What `stop` does with body fetches still in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingBodyPolicy {
    /// Wait up to `body_wait_timeout_ms`, then abandon the rest
    #[default]
    Await,
    /// Abandon immediately; entries keep whatever was observed
    Abandon,
}

/// Browser metadata written into `log.browser`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserInfo {
    /// Browser name
    pub name: String,
    /// Browser version
    pub version: String,
}

/// Sensitive field names masked at finalization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Header names, exact and case-insensitive
    pub sensitive_headers: Vec<String>,
    /// Cookie names, exact and case-insensitive
    pub sensitive_cookies: Vec<String>,
    /// Query parameter names; `*` globs allowed
    pub sensitive_query_params: Vec<String>,
}

impl RedactionConfig {
    /// Whether any redaction is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sensitive_headers.is_empty()
            && self.sensitive_cookies.is_empty()
            && self.sensitive_query_params.is_empty()
    }
}

/// Capture session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Data categories to keep
    pub capture_types: CaptureTypes,
    /// `log.creator.name`
    pub creator_name: String,
    /// Optional `log.browser` override
    pub browser: Option<BrowserInfo>,
    /// Skip the devtools adapter even when an endpoint is configured
    pub force_listener: bool,
    /// DevTools WebSocket endpoint (`ws://` or `wss://`)
    pub devtools_url: Option<String>,
    /// Maximum response body size in bytes; 0 disables the limit
    pub max_response_body_size: u64,
    /// Glob patterns a URL must match (when set)
    pub url_include_patterns: Option<Vec<String>>,
    /// Glob patterns that exclude a URL
    pub url_exclude_patterns: Option<Vec<String>>,
    /// Body retrieval scope
    pub response_body_scope: ResponseBodyScope,
    /// Extra MIME types whose bodies are always retrieved
    pub response_body_mime_filter: Option<Vec<String>>,
    /// Redaction settings
    pub redaction: RedactionConfig,
    /// Behaviour for body fetches still running at stop
    pub pending_bodies: PendingBodyPolicy,
    /// Upper bound on waiting for body fetches at stop
    pub body_wait_timeout_ms: u64,
    /// Capacity of the source event channel
    pub event_buffer: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            capture_types: CaptureTypes::all_text(),
            creator_name: DEFAULT_CREATOR_NAME.to_string(),
            browser: None,
            force_listener: false,
            devtools_url: None,
            max_response_body_size: 0,
            url_include_patterns: None,
            url_exclude_patterns: None,
            response_body_scope: ResponseBodyScope::All,
            response_body_mime_filter: None,
            redaction: RedactionConfig::default(),
            pending_bodies: PendingBodyPolicy::Await,
            body_wait_timeout_ms: DEFAULT_BODY_WAIT_TIMEOUT_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl CaptureOptions {
    /// Load options from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HarError::ConfigError(format!("Failed to read config file: {e}")))?;

        let options: Self = toml::from_str(&content)
            .map_err(|e| HarError::ConfigError(format!("Failed to parse config: {e}")))?;

        options.validate()?;
        Ok(options)
    }

    /// Validate options, including that every glob compiles
    ///
    /// # Errors
    ///
    /// Returns error if options are inconsistent or a pattern is invalid
    pub fn validate(&self) -> Result<()> {
        if self.creator_name.trim().is_empty() {
            return Err(HarError::ConfigError(
                "creator_name cannot be empty".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(HarError::ConfigError(
                "event_buffer must be > 0".to_string(),
            ));
        }

        if let Some(url) = &self.devtools_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(HarError::ConfigError(format!(
                    "devtools_url must be a ws:// or wss:// endpoint, got '{url}'"
                )));
            }
        }

        if let Some(browser) = &self.browser {
            if browser.name.trim().is_empty() {
                return Err(HarError::ConfigError(
                    "browser.name cannot be empty".to_string(),
                ));
            }
        }

        UrlFilter::new(
            self.url_include_patterns.as_deref(),
            self.url_exclude_patterns.as_deref(),
        )?;
        Redactor::new(&self.redaction)?;

        Ok(())
    }

    /// Bound on waiting for outstanding body fetches
    #[must_use]
    pub fn body_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.body_wait_timeout_ms)
    }

    /// Set the captured data categories
    #[must_use]
    pub fn with_capture_types(mut self, types: CaptureTypes) -> Self {
        self.capture_types = types;
        self
    }

    /// Set the creator name
    #[must_use]
    pub fn with_creator_name(mut self, name: impl Into<String>) -> Self {
        self.creator_name = name.into();
        self
    }

    /// Override the browser metadata
    #[must_use]
    pub fn with_browser(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.browser = Some(BrowserInfo {
            name: name.into(),
            version: version.into(),
        });
        self
    }

    /// Use the devtools endpoint at `url`
    #[must_use]
    pub fn with_devtools_url(mut self, url: impl Into<String>) -> Self {
        self.devtools_url = Some(url.into());
        self
    }

    /// Always use the listener adapter
    #[must_use]
    pub fn force_listener(mut self) -> Self {
        self.force_listener = true;
        self
    }

    /// Limit captured response body size
    #[must_use]
    pub fn with_max_response_body_size(mut self, bytes: u64) -> Self {
        self.max_response_body_size = bytes;
        self
    }

    /// Only capture URLs matching one of `patterns`
    #[must_use]
    pub fn with_url_include_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.url_include_patterns = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Never capture URLs matching one of `patterns`
    #[must_use]
    pub fn with_url_exclude_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.url_exclude_patterns = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Set the body retrieval scope
    #[must_use]
    pub fn with_response_body_scope(mut self, scope: ResponseBodyScope) -> Self {
        self.response_body_scope = scope;
        self
    }

    /// Always retrieve bodies of these MIME types
    #[must_use]
    pub fn with_response_body_mime_filter<I, S>(mut self, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.response_body_mime_filter = Some(mime_types.into_iter().map(Into::into).collect());
        self
    }

    /// Mask these header values
    #[must_use]
    pub fn with_sensitive_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redaction.sensitive_headers = names.into_iter().map(Into::into).collect();
        self
    }

    /// Mask these cookie values
    #[must_use]
    pub fn with_sensitive_cookies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redaction.sensitive_cookies = names.into_iter().map(Into::into).collect();
        self
    }

    /// Mask these query parameter values (globs allowed)
    #[must_use]
    pub fn with_sensitive_query_params<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redaction.sensitive_query_params = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the pending-body policy and wait bound
    #[must_use]
    pub fn with_pending_bodies(mut self, policy: PendingBodyPolicy, timeout: Duration) -> Self {
        self.pending_bodies = policy;
        self.body_wait_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let options = CaptureOptions::default();

        assert_eq!(options.capture_types, CaptureTypes::all_text());
        assert_eq!(options.creator_name, DEFAULT_CREATOR_NAME);
        assert!(!options.force_listener);
        assert_eq!(options.max_response_body_size, 0);
        assert!(options.url_include_patterns.is_none());
        assert!(options.url_exclude_patterns.is_none());
        assert_eq!(options.response_body_scope, ResponseBodyScope::All);
        assert!(options.response_body_mime_filter.is_none());
        assert!(options.redaction.is_empty());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            creator_name = "suite"
            capture_types = ["request_headers", "response_headers", "timings"]
            response_body_scope = "pages_and_api"
            response_body_mime_filter = ["image/png"]
            url_exclude_patterns = ["**/*.png"]
            pending_bodies = "abandon"

            [redaction]
            sensitive_headers = ["Authorization"]
            sensitive_query_params = ["api_*"]
        "#;

        let options: CaptureOptions = toml::from_str(config_toml).unwrap();
        assert_eq!(options.creator_name, "suite");
        assert!(options.capture_types.contains(CaptureType::Timings));
        assert!(!options.capture_types.contains(CaptureType::ResponseContent));
        assert_eq!(options.response_body_scope, ResponseBodyScope::PagesAndApi);
        assert_eq!(options.pending_bodies, PendingBodyPolicy::Abandon);
        assert_eq!(options.redaction.sensitive_headers, vec!["Authorization"]);
        assert_eq!(options.event_buffer, DEFAULT_EVENT_BUFFER);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let config_toml = r#"
            devtools_url = "ws://127.0.0.1:9222/devtools/page/ABC"
            max_response_body_size = 1024
        "#;
        file.write_all(config_toml.as_bytes()).unwrap();

        let options = CaptureOptions::from_file(file.path()).unwrap();
        assert_eq!(options.max_response_body_size, 1024);
        assert!(options.devtools_url.is_some());
    }

    #[test]
    fn test_invalid_devtools_url() {
        let options = CaptureOptions::default().with_devtools_url("http://localhost:9222");
        assert!(matches!(options.validate(), Err(HarError::ConfigError(_))));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let options = CaptureOptions::default().with_url_include_patterns([""]);
        assert!(matches!(
            options.validate(),
            Err(HarError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_builder_chaining() {
        let options = CaptureOptions::default()
            .with_capture_types(CaptureTypes::all())
            .with_max_response_body_size(2_048_000)
            .with_creator_name("chained")
            .with_url_include_patterns(["https://api.example.com/**"])
            .with_sensitive_headers(["Authorization"])
            .with_sensitive_cookies(["session_id"])
            .with_sensitive_query_params(["api_*"])
            .with_browser("Chrome", "120.0")
            .force_listener();

        assert_eq!(options.capture_types, CaptureTypes::all());
        assert_eq!(options.max_response_body_size, 2_048_000);
        assert_eq!(options.creator_name, "chained");
        assert_eq!(
            options.url_include_patterns.as_deref(),
            Some(&["https://api.example.com/**".to_string()][..])
        );
        assert!(options.force_listener);
        assert_eq!(options.browser.as_ref().unwrap().name, "Chrome");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_capture_type_presets() {
        let text = CaptureTypes::all_text();
        let all = CaptureTypes::all();

        assert!(all.contains_all(&text));
        assert!(!text.contains(CaptureType::ResponseBinaryContent));
        assert!(all.contains(CaptureType::ResponseBinaryContent));

        let no_timings = text.clone().without(CaptureType::Timings);
        assert!(!no_timings.contains(CaptureType::Timings));
        assert_eq!(no_timings.iter().count(), text.iter().count() - 1);
    }
}
