use std::fmt;
use std::str::FromStr;

use semver::VersionReq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use semver::Version;

/// Error type for version and version pattern parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("Invalid version format '{input}': {reason}")]
    InvalidFormat { input: String, reason: String },
}

impl VersionError {
    fn invalid(input: &str, reason: impl Into<String>) -> Self {
        VersionError::InvalidFormat {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parses a concrete `major.minor.patch` version.
pub fn parse_version(input: &str) -> Result<Version, VersionError> {
    Version::parse(input.trim()).map_err(|e| VersionError::invalid(input, e.to_string()))
}

/// One position of a wildcard pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Literal(u64),
    Wildcard,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(value) => write!(f, "{}", value),
            Segment::Wildcard => write!(f, "x"),
        }
    }
}

#[derive(Debug, Clone)]
enum PatternKind {
    /// `1.x.x`, `2.4`, `*`
    Segments(Vec<Segment>),
    /// Operator constraints such as `^1.2` or `>=1.0, <2.0`
    Range(VersionReq),
}

/// A version requirement attached to a dependency.
///
/// Two spellings are accepted:
///
/// - wildcard patterns (`1.x.x`, `1.2.*`, `3`), where literal segments must
///   equal the candidate's segment at the same position and wildcards match
///   anything. Once a segment is wildcarded every following segment must be
///   a wildcard too, so `1.x.3` is rejected.
/// - semver constraints (`^1.2`, `~0.3`, `>=1.0, <2.0`), recognised by a
///   leading operator or a comma.
#[derive(Debug, Clone)]
pub struct VersionPattern {
    raw: String,
    kind: PatternKind,
}

impl VersionPattern {
    /// Parses a pattern string.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionError::invalid(input, "empty version pattern"));
        }

        if trimmed.starts_with(['^', '~', '=', '<', '>']) || trimmed.contains(',') {
            let req = VersionReq::parse(trimmed)
                .map_err(|e| VersionError::invalid(input, e.to_string()))?;
            return Ok(Self {
                raw: trimmed.to_string(),
                kind: PatternKind::Range(req),
            });
        }

        let mut segments = Vec::new();
        let mut seen_wildcard = false;
        for part in trimmed.split('.') {
            let segment = match part {
                "x" | "X" | "*" => Segment::Wildcard,
                "" => return Err(VersionError::invalid(input, "empty segment")),
                digits => {
                    let value = digits.parse::<u64>().map_err(|_| {
                        VersionError::invalid(input, format!("segment '{}' is neither a number nor a wildcard", digits))
                    })?;
                    if seen_wildcard {
                        return Err(VersionError::invalid(input, "literal segment after a wildcard"));
                    }
                    Segment::Literal(value)
                }
            };
            seen_wildcard |= segment == Segment::Wildcard;
            segments.push(segment);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            kind: PatternKind::Segments(segments),
        })
    }

    /// A pattern accepting every version.
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            kind: PatternKind::Segments(vec![Segment::Wildcard]),
        }
    }

    /// Checks whether `candidate` satisfies this pattern.
    pub fn matches(&self, candidate: &Version) -> bool {
        match &self.kind {
            PatternKind::Range(req) => req.matches(candidate),
            PatternKind::Segments(segments) => {
                let components = [candidate.major, candidate.minor, candidate.patch];
                segments.iter().enumerate().all(|(position, segment)| match segment {
                    Segment::Wildcard => true,
                    // Segments beyond the candidate's length always match
                    Segment::Literal(value) => components.get(position).is_none_or(|c| c == value),
                })
            }
        }
    }

    /// Returns the wildcard segments, or `None` for operator constraints.
    pub fn segments(&self) -> Option<&[Segment]> {
        match &self.kind {
            PatternKind::Segments(segments) => Some(segments),
            PatternKind::Range(_) => None,
        }
    }

    /// Returns the original pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Free-standing form of [`VersionPattern::matches`].
pub fn matches(candidate: &Version, pattern: &VersionPattern) -> bool {
    pattern.matches(candidate)
}

impl PartialEq for VersionPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for VersionPattern {}

impl fmt::Display for VersionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for VersionPattern {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionPattern::parse(s)
    }
}

impl Serialize for VersionPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for VersionPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        VersionPattern::parse(&raw).map_err(serde::de::Error::custom)
    }
}
