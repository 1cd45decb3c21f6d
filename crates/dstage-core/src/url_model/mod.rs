//! Locator modeling for transfer endpoints.
//!
//! A locator is a URL-like string (`http://host/a`, `gsiftp://se/path`,
//! `file:/session/job/a`) optionally followed by transfer options appended to
//! the last path segment: `http://host/a;cache=no;overwrite=yes`. Options are
//! kept in order of appearance and reproduced by `Display`, so a locator read
//! from a file list round-trips unchanged.

mod options;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use options::split_options;

/// Error returned for strings that cannot be treated as a locator at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    #[error("empty locator")]
    Empty,
    #[error("locator has no scheme: {0}")]
    MissingScheme(String),
}

/// Transfer endpoint: base URL plus ordered `key=value` options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    base: String,
    options: Vec<(String, String)>,
}

impl Locator {
    pub fn parse(s: &str) -> Result<Self, LocatorError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocatorError::Empty);
        }
        let scheme_end = s
            .find(':')
            .ok_or_else(|| LocatorError::MissingScheme(s.to_string()))?;
        let scheme = &s[..scheme_end];
        if !is_valid_scheme(scheme) {
            return Err(LocatorError::MissingScheme(s.to_string()));
        }
        let (base, options) = split_options(s);
        Ok(Self { base, options })
    }

    /// Local file locator for an absolute path.
    pub fn for_path(path: &std::path::Path) -> Self {
        Self {
            base: format!("file:{}", path.display()),
            options: Vec::new(),
        }
    }

    pub fn scheme(&self) -> &str {
        self.base.split(':').next().unwrap_or("")
    }

    /// The locator without options.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn is_local(&self) -> bool {
        self.scheme().eq_ignore_ascii_case("file")
    }

    /// Filesystem path of a `file:` locator (`file:/a`, `file:///a`).
    pub fn local_path(&self) -> Option<PathBuf> {
        if !self.is_local() {
            return None;
        }
        let rest = &self.base[self.scheme().len() + 1..];
        let path = match rest.strip_prefix("//") {
            Some(stripped) if stripped.starts_with('/') => stripped,
            Some(_) => return None,
            None => rest,
        };
        Some(PathBuf::from(path))
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// Set an option, replacing any existing value for the same key.
    pub fn set_option(&mut self, key: &str, value: &str) {
        match self.options.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.options.push((key.to_string(), value.to_string())),
        }
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.set_option(key, value);
        self
    }

    /// True if the `overwrite` option is set to a yes value.
    pub fn overwrite(&self) -> bool {
        matches!(self.option("overwrite"), Some("yes" | "true" | "1"))
    }

    /// Option-free form normalised for comparison (scheme/host case, default ports).
    /// Two locators naming the same object compare equal here even when their
    /// options differ.
    pub fn canonical(&self) -> String {
        url::Url::parse(&self.base)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| self.base.clone())
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)?;
        for (k, v) in &self.options {
            write!(f, ";{}={}", k, v)?;
        }
        Ok(())
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Locator::parse(s)
    }
}
