//! Glob patterns compiled to anchored regular expressions

use regex::{RegexSet, RegexSetBuilder};

use crate::{HarError, Result};

/// Translate a glob into a regex source string
///
/// `**` matches any run of characters, `*` any run without `/`. Everything
/// else is literal.
///
/// # Errors
///
/// Returns [`HarError::InvalidPattern`] for an empty pattern
pub fn glob_to_regex(pattern: &str) -> Result<String> {
    if pattern.trim().is_empty() {
        return Err(HarError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "pattern is empty".to_string(),
        });
    }

    let mut source = String::with_capacity(pattern.len() * 2 + 2);
    source.push('^');

    let mut chars = pattern.chars().peekable();
    let mut literal = String::new();
    while let Some(c) = chars.next() {
        if c != '*' {
            literal.push(c);
            continue;
        }
        source.push_str(&regex::escape(&literal));
        literal.clear();

        if chars.peek() == Some(&'*') {
            while chars.peek() == Some(&'*') {
                chars.next();
            }
            source.push_str(".*");
        } else {
            source.push_str("[^/]*");
        }
    }
    source.push_str(&regex::escape(&literal));
    source.push('$');

    Ok(source)
}

/// Compile globs into one case-insensitive set
///
/// # Errors
///
/// Returns [`HarError::InvalidPattern`] naming the first bad pattern
pub fn compile_set(patterns: &[String]) -> Result<RegexSet> {
    let sources = patterns
        .iter()
        .map(|p| glob_to_regex(p))
        .collect::<Result<Vec<_>>>()?;

    RegexSetBuilder::new(&sources)
        .case_insensitive(true)
        .build()
        .map_err(|e| HarError::InvalidPattern {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })
}
