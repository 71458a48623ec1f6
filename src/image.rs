//! Structured image references.
//!
//! An image string like `registry.example.com/team/app:1.4` is decomposed
//! into registry, repository path and tag. Digest-pinned references
//! (`app@sha256:...` or a bare `sha256:...` id) carry no tag and are never
//! candidates for tag-based updates.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A parsed image reference: (registry, name, tag-or-digest).
///
/// Two references are equal iff every component agrees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Registry host, empty for the default registry.
    pub registry: String,
    /// Repository path, e.g. `library/redis` or `team/app`.
    pub name: String,
    /// Tag, when the reference is tag-addressed.
    pub tag: Option<String>,
    /// Digest, when the reference is digest-addressed.
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an image string as the daemon reports it.
    pub fn parse(image: &str) -> Self {
        // Bare image id, e.g. "sha256:4355...".
        if let Some(digest) = image.strip_prefix("sha256:") {
            return Self {
                registry: String::new(),
                name: String::new(),
                tag: None,
                digest: Some(format!("sha256:{digest}")),
            };
        }
        if let Some((name, digest)) = image.split_once('@') {
            let (registry, name) = split_registry(name);
            return Self {
                registry,
                name,
                tag: None,
                digest: Some(digest.to_string()),
            };
        }
        // The tag separator is the last ':' after the last '/', so a
        // registry port does not read as a tag.
        let slash = image.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name_part, tag) = match image[slash..].rfind(':') {
            Some(rel) => {
                let pos = slash + rel;
                (&image[..pos], Some(image[pos + 1..].to_string()))
            }
            None => (image, None),
        };
        let (registry, name) = split_registry(name_part);
        Self {
            registry,
            name,
            tag,
            digest: None,
        }
    }

    /// Whether the reference is pinned to a digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// `registry/name` without tag or digest.
    pub fn repository(&self) -> String {
        if self.registry.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.registry, self.name)
        }
    }

    /// The same reference with a different tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            name: self.name.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            // Bare digest form.
            return write!(f, "{}", self.digest.as_deref().unwrap_or(""));
        }
        write!(f, "{}", self.repository())?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{tag}")?;
        } else if let Some(ref digest) = self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Split `host/path` into (registry, path). The first component counts as a
/// registry only when it looks like a host (contains '.' or ':').
fn split_registry(name: &str) -> (String, String) {
    if let Some((head, rest)) = name.split_once('/') {
        if head.contains('.') || head.contains(':') || head == "localhost" {
            return (head.to_string(), rest.to_string());
        }
    }
    (String::new(), name.to_string())
}

/// Glob-style matcher for operator image filters: `*` matches any run of
/// characters, everything else is literal. `*` alone matches everything.
#[derive(Debug, Clone)]
pub struct ImagePattern {
    raw: String,
    regex: Regex,
}

impl ImagePattern {
    pub fn new(pattern: &str) -> Self {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex =
            Regex::new(&format!("^{body}$")).unwrap_or_else(|_| Regex::new("^$").unwrap());
        Self {
            raw: pattern.to_string(),
            regex,
        }
    }

    pub fn matches(&self, image: &str) -> bool {
        self.raw == "*" || self.regex.is_match(image)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let r = ImageRef::parse("redis");
        assert_eq!(r.registry, "");
        assert_eq!(r.name, "redis");
        assert_eq!(r.tag, None);
        assert!(!r.is_digest());
    }

    #[test]
    fn test_parse_tagged() {
        let r = ImageRef::parse("team/app:1.4");
        assert_eq!(r.name, "team/app");
        assert_eq!(r.tag.as_deref(), Some("1.4"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageRef::parse("registry.local:5000/team/app:1.4");
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.name, "team/app");
        assert_eq!(r.tag.as_deref(), Some("1.4"));
        assert_eq!(r.repository(), "registry.local:5000/team/app");
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageRef::parse("team/app@sha256:abc123");
        assert!(r.is_digest());
        assert_eq!(r.tag, None);

        let bare = ImageRef::parse(
            "sha256:4355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd865",
        );
        assert!(bare.is_digest());
        assert_eq!(bare.name, "");
    }

    #[test]
    fn test_with_tag_roundtrip() {
        let r = ImageRef::parse("testimage:1").with_tag("2");
        assert_eq!(r.to_string(), "testimage:2");
    }

    #[test]
    fn test_display_matches_parse() {
        for s in ["redis", "team/app:1.4", "registry.local:5000/team/app:2"] {
            assert_eq!(ImageRef::parse(s).to_string(), s);
        }
    }

    #[test]
    fn test_pattern_wildcard() {
        assert!(ImagePattern::new("*").matches("anything:1"));
        assert!(ImagePattern::new("testimage*").matches("testimage:1"));
        assert!(ImagePattern::new("*redis*").matches("library/redis:7"));
        assert!(!ImagePattern::new("testimage").matches("otherimage"));
        assert!(ImagePattern::new("testimage").matches("testimage"));
    }
}
