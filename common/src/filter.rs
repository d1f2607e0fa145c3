//! Ignore patterns applied while indexing the source tree
//!
//! # Pattern Syntax
//!
//! - `name` matches any path containing `name` anywhere (directories are tested with a trailing
//!   separator, so `build/` only matches directories named `build`)
//! - `^name` matches paths (relative to the indexed root) starting with `name`
//! - `name$` matches paths ending with `name`
//! - `^name$` matches a path equal to `name`, i.e. an entry directly under the root
//!
//! Matching is case-sensitive.
//!
//! # Examples
//!
//! ```
//! use common::filter::IgnoreFilter;
//! use std::path::Path;
//!
//! let filter = IgnoreFilter::new(["^temp$", ".git"]).unwrap();
//! let root = Path::new("/data");
//! assert!(filter.is_ignored(root, Path::new("/data/temp"), true));
//! assert!(!filter.is_ignored(root, Path::new("/data/docs/temp"), true));
//! assert!(filter.is_ignored(root, Path::new("/data/src/.gitignore"), false));
//! ```

use std::path::{Path, MAIN_SEPARATOR};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("empty ignore pattern is not allowed")]
    Empty,
    #[error("ignore pattern {0:?} has nothing to match between its anchors")]
    BareAnchor(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IgnorePattern {
    Substring(String),
    Prefix(String),
    Suffix(String),
    Exact(String),
}

impl IgnorePattern {
    pub fn parse(pattern: &str) -> Result<Self, FilterError> {
        if pattern.is_empty() {
            return Err(FilterError::Empty);
        }
        let (anchored_start, rest) = match pattern.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        let (anchored_end, name) = match rest.strip_suffix('$') {
            Some(name) => (true, name),
            None => (false, rest),
        };
        if name.is_empty() {
            return Err(FilterError::BareAnchor(pattern.to_string()));
        }
        let name = name.to_string();
        Ok(match (anchored_start, anchored_end) {
            (true, true) => IgnorePattern::Exact(name),
            (true, false) => IgnorePattern::Prefix(name),
            (false, true) => IgnorePattern::Suffix(name),
            (false, false) => IgnorePattern::Substring(name),
        })
    }

    fn matches(&self, full: &str, relative: &str) -> bool {
        match self {
            IgnorePattern::Substring(name) => full.contains(name.as_str()),
            IgnorePattern::Prefix(name) => relative.starts_with(name.as_str()),
            IgnorePattern::Suffix(name) => relative.ends_with(name.as_str()),
            IgnorePattern::Exact(name) => relative == name,
        }
    }
}

impl std::str::FromStr for IgnorePattern {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for IgnorePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnorePattern::Substring(name) => write!(f, "{name}"),
            IgnorePattern::Prefix(name) => write!(f, "^{name}"),
            IgnorePattern::Suffix(name) => write!(f, "{name}$"),
            IgnorePattern::Exact(name) => write!(f, "^{name}$"),
        }
    }
}

/// A set of ignore patterns; an entry is ignored if any pattern matches it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IgnoreFilter {
    patterns: Vec<IgnorePattern>,
}

impl IgnoreFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| IgnorePattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    #[must_use]
    pub fn patterns(&self) -> &[IgnorePattern] {
        &self.patterns
    }

    /// Checks `path`, an entry somewhere below (or equal to) `root`.
    #[must_use]
    pub fn is_ignored(&self, root: &Path, path: &Path, is_dir: bool) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let mut full = path.to_string_lossy().into_owned();
        if is_dir && !full.ends_with(MAIN_SEPARATOR) {
            full.push(MAIN_SEPARATOR);
        }
        let relative = path.strip_prefix(root).unwrap_or(path).to_string_lossy();
        let ignored = self
            .patterns
            .iter()
            .any(|pattern| pattern.matches(&full, &relative));
        if ignored {
            tracing::debug!("ignoring {:?}", path);
        }
        ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pattern_kinds() {
        assert_eq!(
            IgnorePattern::parse("cache").unwrap(),
            IgnorePattern::Substring("cache".into())
        );
        assert_eq!(
            IgnorePattern::parse("^tmp").unwrap(),
            IgnorePattern::Prefix("tmp".into())
        );
        assert_eq!(
            IgnorePattern::parse(".bak$").unwrap(),
            IgnorePattern::Suffix(".bak".into())
        );
        assert_eq!(
            IgnorePattern::parse("^temp$").unwrap(),
            IgnorePattern::Exact("temp".into())
        );
    }

    #[test]
    fn rejects_empty_and_bare_anchors() {
        assert_eq!(IgnorePattern::parse(""), Err(FilterError::Empty));
        for bad in ["^", "$", "^$"] {
            assert_eq!(
                IgnorePattern::parse(bad),
                Err(FilterError::BareAnchor(bad.to_string()))
            );
        }
        assert!(IgnoreFilter::new(["ok", ""]).is_err());
    }

    #[test]
    fn display_matches_input() {
        for text in ["a", "^a", "a$", "^a$"] {
            assert_eq!(IgnorePattern::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn exact_anchor_only_matches_root_level() {
        let filter = IgnoreFilter::new(["^temp$"]).unwrap();
        let root = Path::new("/src");
        assert!(filter.is_ignored(root, Path::new("/src/temp"), true));
        assert!(filter.is_ignored(root, Path::new("/src/temp"), false));
        assert!(!filter.is_ignored(root, Path::new("/src/a/temp"), true));
        assert!(!filter.is_ignored(root, Path::new("/src/temporary"), false));
    }

    #[test]
    fn prefix_and_suffix_anchors() {
        let filter = IgnoreFilter::new(["^build", ".tmp$"]).unwrap();
        let root = Path::new("/src");
        assert!(filter.is_ignored(root, Path::new("/src/build"), true));
        assert!(filter.is_ignored(root, Path::new("/src/build-old"), true));
        assert!(!filter.is_ignored(root, Path::new("/src/a/build"), true));
        assert!(filter.is_ignored(root, Path::new("/src/a/b/file.tmp"), false));
        assert!(!filter.is_ignored(root, Path::new("/src/a/file.tmp.txt"), false));
    }

    #[test]
    fn substring_matches_full_path_case_sensitive() {
        let filter = IgnoreFilter::new(["node_modules/", "Thumbs"]).unwrap();
        let root = Path::new("/src");
        assert!(filter.is_ignored(root, Path::new("/src/web/node_modules"), true));
        assert!(!filter.is_ignored(root, Path::new("/src/web/node_modules"), false));
        assert!(filter.is_ignored(root, Path::new("/src/img/Thumbs.db"), false));
        assert!(!filter.is_ignored(root, Path::new("/src/img/thumbs.db"), false));
    }

    #[test]
    fn empty_filter_ignores_nothing() {
        let filter = IgnoreFilter::default();
        assert!(filter.is_empty());
        assert!(!filter.is_ignored(Path::new("/"), Path::new("/anything"), false));
    }
}
