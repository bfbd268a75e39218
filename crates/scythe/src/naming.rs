//! Module Name Normalization
//!
//! Module names arrive in two spellings: qualified (`app.model.Order`) and
//! path form (`app/model/Order`). Every identity comparison in the crate is
//! done on the path form, wrapped in [`CanonicalName`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used by canonical (path form) names
pub const PATH_SEPARATOR: char = '/';

/// Separator used by qualified names
pub const QUALIFIED_SEPARATOR: char = '.';

/// A module name in canonical path form
///
/// Construct through [`CanonicalName::new`] (or `From`), which normalizes the
/// input, so two values are equal exactly when they name the same module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalName(String);

impl CanonicalName {
    /// Normalize `name` into canonical form
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(normalize(name))
    }

    /// The canonical spelling
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the normalized name is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Qualified spelling of this name
    #[must_use]
    pub fn qualified(&self) -> String {
        to_qualified(&self.0)
    }

    /// Leading namespace segment, or `""` for a bare name
    #[must_use]
    pub fn package(&self) -> &str {
        self.0
            .split_once(PATH_SEPARATOR)
            .map_or("", |(package, _)| package)
    }

    /// Whether the name joins below any directory it is appended to
    ///
    /// False for empty names, a leading separator, empty or `..` segments
    /// and segments carrying a drive or platform separator.
    #[must_use]
    pub fn is_confined(&self) -> bool {
        !self.0.is_empty()
            && self.0.split(PATH_SEPARATOR).all(|segment| {
                !segment.is_empty()
                    && segment != ".."
                    && !segment.contains(['\\', ':', '\0'])
            })
    }

    /// Whether this name lives under `prefix` (compared in canonical form)
    #[must_use]
    pub fn starts_with(&self, prefix: &CanonicalName) -> bool {
        self.0.starts_with(prefix.as_str())
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanonicalName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CanonicalName {
    fn from(name: String) -> Self {
        Self::new(&name)
    }
}

impl AsRef<str> for CanonicalName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Trim `name` and convert qualified separators to path separators
#[must_use]
pub fn normalize(name: &str) -> String {
    name.trim().replace(QUALIFIED_SEPARATOR, "/")
}

/// Convert path separators to qualified separators
#[must_use]
pub fn to_qualified(name: &str) -> String {
    name.replace(PATH_SEPARATOR, ".")
}

/// Namespace before the first separator of the canonical form, or `""`
#[must_use]
pub fn package_of(name: &str) -> String {
    CanonicalName::new(name).package().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_confined_names() {
        assert!(CanonicalName::new("app.model.Order").is_confined());
        assert!(CanonicalName::new("Bare").is_confined());
        assert!(!CanonicalName::new(".etc.passwd").is_confined());
        assert!(!CanonicalName::new("/etc/passwd").is_confined());
        assert!(!CanonicalName::new("app..Order").is_confined());
        assert!(!CanonicalName::new("app/").is_confined());
        assert!(!CanonicalName::new("c:\\windows").is_confined());
        assert!(!CanonicalName::new("").is_confined());
    }

    #[test]
    fn test_to_qualified() {
        assert_eq!(to_qualified("some/random/Module"), "some.random.Module");
    }

    #[test]
    fn test_normalize_dots() {
        assert_eq!(normalize("some.random.Module"), "some/random/Module");
    }

    #[test]
    fn test_normalize_mixed_and_padded() {
        assert_eq!(normalize(" some/random.Module "), "some/random/Module");
    }

    #[test]
    fn test_package_of() {
        assert_eq!(package_of("some/random.Module"), "some");
        assert_eq!(package_of("some.random.Module"), "some");
        assert_eq!(package_of("Module"), "");
        assert_eq!(package_of(""), "");
    }

    #[test]
    fn test_canonical_equality_ignores_spelling() {
        assert_eq!(CanonicalName::new("a.b.C"), CanonicalName::new(" a/b/C"));
        assert_eq!(CanonicalName::new("a.b.C").qualified(), "a.b.C");
    }

    #[test]
    fn test_starts_with_uses_canonical_prefix() {
        let name = CanonicalName::new("internal.util.Foo");
        assert!(name.starts_with(&CanonicalName::new("internal.")));
        assert!(!name.starts_with(&CanonicalName::new("app/")));
    }

    #[test]
    fn test_display_and_empty() {
        assert_eq!(CanonicalName::new("x.Y").to_string(), "x/Y");
        assert!(CanonicalName::new("   ").is_empty());
    }

    mod property_tests {
        use super::*;

        proptest! {
            #[test]
            fn prop_normalize_idempotent(name in "[ a-zA-Z0-9_./$]{0,40}") {
                let once = normalize(&name);
                prop_assert_eq!(normalize(&once), once);
            }

            #[test]
            fn prop_qualified_round_trip(name in "[a-zA-Z0-9_$]{1,8}([./][a-zA-Z0-9_$]{1,8}){0,4}") {
                let canonical = normalize(&name);
                prop_assert_eq!(normalize(&to_qualified(&canonical)), canonical);
            }
        }
    }
}
