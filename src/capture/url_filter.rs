//! URL include/exclude filtering

use regex::RegexSet;

use crate::Result;

use super::glob::compile_set;

/// Include/exclude glob filter over request URLs
///
/// Exclusion always wins. With no include set every non-excluded URL passes.
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    include: Option<RegexSet>,
    exclude: Option<RegexSet>,
}

impl UrlFilter {
    /// Compile the pattern sets
    ///
    /// # Errors
    ///
    /// Returns error if any pattern is invalid
    pub fn new(include: Option<&[String]>, exclude: Option<&[String]>) -> Result<Self> {
        // An empty include list is treated as "no include filter"
        let include = include
            .filter(|p| !p.is_empty())
            .map(compile_set)
            .transpose()?;
        let exclude = exclude.map(compile_set).transpose()?;
        Ok(Self { include, exclude })
    }

    /// Whether `url` should be captured
    #[must_use]
    pub fn is_included(&self, url: &str) -> bool {
        if self.exclude.as_ref().is_some_and(|set| set.is_match(url)) {
            return false;
        }
        self.include.as_ref().map_or(true, |set| set.is_match(url))
    }
}
