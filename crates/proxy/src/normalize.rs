//! Path template normalization for metric labels
//!
//! Raw request paths carry IDs, so using them as label values would make
//! cardinality unbounded. [`PathNormalizer`] maps a path to a template:
//!
//! ```text
//! /rest/api/1/locations/1234/rooms/a6e1c31d-9c6c-4297-9103-467e9bc3cb51
//!   -> /rest/api/1/locations/_/rooms/_
//! ```
//!
//! Paths outside the configured prefix, or matching an exclude pattern, have
//! no template and are not recorded.

use glob::{MatchOptions, Pattern};
use regex::Regex;

/// Replacement for UUIDs and digit runs
pub const PLACEHOLDER: &str = "_";

const UUID_PATTERN: &str = "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";
const DIGITS_PATTERN: &str = "[0-9]+";

/// Normalizes request paths under one prefix
///
/// Holds no mutable state; share it freely across requests.
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    prefix: String,
    has_version: bool,
    excluded: Vec<Pattern>,
    uuid: Regex,
    digits: Regex,
}

impl PathNormalizer {
    /// Create a normalizer for `prefix`
    ///
    /// The prefix is canonicalized to a leading `/` and no trailing `/`.
    /// With `has_version` the first segment after the prefix is kept as is.
    pub fn new(prefix: &str, has_version: bool, excluded: Vec<Pattern>) -> Result<Self, regex::Error> {
        Ok(Self {
            prefix: canonical_prefix(prefix),
            has_version,
            excluded,
            uuid: Regex::new(UUID_PATTERN)?,
            digits: Regex::new(DIGITS_PATTERN)?,
        })
    }

    /// Canonical prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Template for `path`, or `None` when the path must not be recorded
    pub fn normalize(&self, path: &str) -> Option<String> {
        let after_prefix = path.strip_prefix(self.prefix.as_str())?;

        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        if self.excluded.iter().any(|p| p.matches_with(path, options)) {
            return None;
        }

        let remainder = after_prefix.strip_prefix('/').unwrap_or(after_prefix);
        let mut template = self.prefix.clone();

        let rest = if self.has_version && !remainder.is_empty() {
            let (version, rest) = remainder.split_once('/').unwrap_or((remainder, ""));
            template.push('/');
            template.push_str(version);
            rest
        } else {
            remainder
        };

        // UUIDs first so their digit groups are not split into placeholders
        let rest = self.uuid.replace_all(rest, PLACEHOLDER);
        let rest = self.digits.replace_all(&rest, PLACEHOLDER);
        if !rest.is_empty() {
            template.push('/');
            template.push_str(&rest);
        }

        let trimmed = template.trim_end_matches('/');
        if trimmed.is_empty() {
            Some("/".to_string())
        } else {
            Some(trimmed.to_string())
        }
    }
}

fn canonical_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn api() -> PathNormalizer {
        PathNormalizer::new("/rest/api", true, Vec::new()).unwrap()
    }

    #[test]
    fn test_concrete_templates() {
        let n = api();
        let cases = [
            ("/rest/api/1", "/rest/api/1"),
            ("/rest/api/1/3", "/rest/api/1/_"),
            (
                "/rest/api/1/locations/1234/rooms/5678",
                "/rest/api/1/locations/_/rooms/_",
            ),
            (
                "/rest/api/1/f45c21e1-d363-4a02-825e-0d45a0eebc12",
                "/rest/api/1/_",
            ),
            (
                "/rest/api/1/locations/1234/rooms/a6e1c31d-9c6c-4297-9103-467e9bc3cb51",
                "/rest/api/1/locations/_/rooms/_",
            ),
        ];
        for (path, expected) in cases {
            assert_eq!(n.normalize(path).as_deref(), Some(expected), "path {path}");
        }
    }

    #[test]
    fn test_path_equal_to_prefix() {
        let n = api();
        assert_eq!(n.normalize("/rest/api").as_deref(), Some("/rest/api"));
        assert_eq!(n.normalize("/rest/api/").as_deref(), Some("/rest/api"));
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        assert_eq!(
            api().normalize("/rest/api/2/users/42/").as_deref(),
            Some("/rest/api/2/users/_")
        );
    }

    #[test]
    fn test_version_is_not_normalized() {
        assert_eq!(
            api().normalize("/rest/api/2024/items/7").as_deref(),
            Some("/rest/api/2024/items/_")
        );
    }

    #[test]
    fn test_without_version() {
        let n = PathNormalizer::new("/rest/api", false, Vec::new()).unwrap();
        assert_eq!(n.normalize("/rest/api/1/3").as_deref(), Some("/rest/api/_/_"));
    }

    #[test]
    fn test_digits_inside_segments() {
        assert_eq!(
            api().normalize("/rest/api/1/item-12a34").as_deref(),
            Some("/rest/api/1/item-_a_")
        );
    }

    #[test]
    fn test_prefix_is_canonicalized() {
        for prefix in ["rest/api", "/rest/api/", "rest/api/"] {
            let n = PathNormalizer::new(prefix, true, Vec::new()).unwrap();
            assert_eq!(n.prefix(), "/rest/api");
            assert_eq!(n.normalize("/rest/api/1/3").as_deref(), Some("/rest/api/1/_"));
        }
    }

    #[test]
    fn test_empty_prefix() {
        let n = PathNormalizer::new("", false, Vec::new()).unwrap();
        assert_eq!(n.normalize("/users/42").as_deref(), Some("/users/_"));
        assert_eq!(n.normalize("/").as_deref(), Some("/"));
    }

    #[test]
    fn test_prefix_mismatch() {
        let n = api();
        assert_eq!(n.normalize("/other/1"), None);
        assert_eq!(n.normalize("/rest"), None);
        assert_eq!(n.normalize(""), None);
    }

    #[test]
    fn test_prefix_is_a_plain_string_prefix() {
        assert_eq!(
            api().normalize("/rest/apix/1").as_deref(),
            Some("/rest/api/x/_")
        );
    }

    #[test]
    fn test_excluded_paths() {
        let excluded = vec![
            Pattern::new("/rest/api/*/health").unwrap(),
            Pattern::new("/rest/api/**/internal/*").unwrap(),
        ];
        let n = PathNormalizer::new("/rest/api", true, excluded).unwrap();

        assert_eq!(n.normalize("/rest/api/1/health"), None);
        assert_eq!(n.normalize("/rest/api/1/admin/internal/jobs"), None);
        // `*` does not cross a separator
        assert_eq!(
            n.normalize("/rest/api/1/x/health").as_deref(),
            Some("/rest/api/1/x/health")
        );
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z0-9-]{0,12}"
    }

    fn path_under_prefix() -> impl Strategy<Value = String> {
        prop::collection::vec(segment(), 0..6)
            .prop_map(|segments| format!("/rest/api/{}", segments.join("/")))
    }

    proptest! {
        #[test]
        fn prop_outside_prefix_is_rejected(path in "/[a-z0-9/]{0,30}") {
            prop_assume!(!path.starts_with("/rest/api"));
            prop_assert_eq!(api().normalize(&path), None);
        }

        #[test]
        fn prop_excluded_is_rejected(tail in "[a-z0-9]{1,10}") {
            let excluded = vec![Pattern::new("/rest/api/*/private/*").unwrap()];
            let n = PathNormalizer::new("/rest/api", true, excluded).unwrap();
            let path = format!("/rest/api/1/private/{tail}");
            prop_assert_eq!(n.normalize(&path), None);
        }

        #[test]
        fn prop_normalization_is_idempotent(path in path_under_prefix()) {
            let n = api();
            let once = n.normalize(&path).unwrap();
            let twice = n.normalize(&once).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_uuid_becomes_one_placeholder(
            uuid in "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            before in "[0-9]{0,6}",
            after in "[0-9]{0,6}",
        ) {
            let n = api();
            let path = format!("/rest/api/1/{before}/{uuid}/{after}");
            let expected = match (before.is_empty(), after.is_empty()) {
                (true, true) => "/rest/api/1//_".to_string(),
                (true, false) => "/rest/api/1//_/_".to_string(),
                (false, true) => "/rest/api/1/_/_".to_string(),
                (false, false) => "/rest/api/1/_/_/_".to_string(),
            };
            prop_assert_eq!(n.normalize(&path).unwrap(), expected);
        }
    }
}
