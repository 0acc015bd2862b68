//! Version parsing and ordering
//!
//! Accepts `MAJOR.MINOR.PATCH[.BUILD][-prerelease]`. A version carrying a
//! pre-release tail sorts below the same numeric version without one, and
//! two tails are compared with semver precedence.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::Prerelease;

/// A parsed application version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Major, minor, patch, build
    pub numbers: [u64; 4],
    /// Pre-release tail without the leading `-` (empty for releases)
    pub pre: Prerelease,
}

impl Version {
    /// Parse a version string, returning `None` for anything malformed
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        // Build metadata never participates in ordering
        let s = s.split('+').next().unwrap_or(s);

        let (core, pre) = match s.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (s, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return None;
        }

        let mut numbers = [0u64; 4];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            *slot = part.parse().ok()?;
        }

        let pre = match pre {
            Some(tail) if tail.is_empty() => return None,
            Some(tail) => Prerelease::new(tail).ok()?,
            None => Prerelease::EMPTY,
        };

        Some(Self { numbers, pre })
    }

    /// Whether this version carries a pre-release tail
    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    /// First identifier of the pre-release tail, lowercased
    pub fn prerelease_tag(&self) -> Option<String> {
        if self.pre.is_empty() {
            return None;
        }
        let first = self.pre.as_str().split('.').next().unwrap_or("");
        let tag: String = first
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        Some(tag.to_ascii_lowercase())
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s).ok_or_else(|| format!("Invalid version: {}", s))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch, build] = self.numbers;
        write!(f, "{}.{}.{}", major, minor, patch)?;
        if build != 0 {
            write!(f, ".{}", build)?;
        }
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre)?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numbers
            .cmp(&other.numbers)
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre.cmp(&other.pre),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Whether `candidate` is strictly newer than `current`.
///
/// Unparsable input on either side is never newer.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    match (Version::parse(candidate), Version::parse(current)) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let v = Version::parse("1.4.2").unwrap();
        assert_eq!(v.numbers, [1, 4, 2, 0]);
        assert!(!v.is_prerelease());

        let v = Version::parse("v2.0.1.17-beta.2").unwrap();
        assert_eq!(v.numbers, [2, 0, 1, 17]);
        assert_eq!(v.pre.as_str(), "beta.2");
        assert_eq!(v.prerelease_tag().as_deref(), Some("beta"));

        assert!(Version::parse("1.2").is_none());
        assert!(Version::parse("1.2.3.4.5").is_none());
        assert!(Version::parse("1.x.3").is_none());
        assert!(Version::parse("1.2.3-").is_none());
        assert!(Version::parse("").is_none());
        assert!(Version::parse("-1.2.3").is_none());
    }

    #[test]
    fn test_ordering() {
        assert!(is_newer("1.1.0", "1.0.9"));
        assert!(is_newer("1.0.0.1", "1.0.0"));
        assert!(is_newer("1.10.0", "1.9.0"));
        assert!(is_newer("1.1.0", "1.1.0-rc.1"));
        assert!(!is_newer("1.1.0-rc.1", "1.1.0"));
        assert!(is_newer("1.1.0-beta.11", "1.1.0-beta.2"));
        assert!(is_newer("1.1.0-beta", "1.1.0-alpha"));
        assert!(is_newer("1.0.0+build.5", "0.9.0"));
        assert!(!is_newer("1.0.0+build.5", "1.0.0"));
    }

    #[test]
    fn test_is_newer_is_irreflexive_and_antisymmetric() {
        let samples = [
            "0.1.0", "1.0.0", "1.0.0-alpha", "1.0.0-alpha.1", "1.0.0-beta",
            "1.0.0.3", "1.2.0", "2.0.0-rc.1", "garbage",
        ];
        for a in &samples {
            assert!(!is_newer(a, a), "{} newer than itself", a);
            for b in &samples {
                if is_newer(a, b) {
                    assert!(!is_newer(b, a), "{} and {} both newer", a, b);
                }
            }
        }
    }

    #[test]
    fn test_invalid_is_never_newer() {
        assert!(!is_newer("not-a-version", "1.0.0"));
        assert!(!is_newer("2.0.0", "broken"));
    }

    #[test]
    fn test_display_round_trips_meaningful_parts() {
        assert_eq!(Version::parse("v1.2.3").unwrap().to_string(), "1.2.3");
        assert_eq!(
            Version::parse("1.2.3.4-rc.1").unwrap().to_string(),
            "1.2.3.4-rc.1"
        );
    }
}
