//! Patch path grammar.
//!
//! ```text
//! /-                 append to the collection
//! /{index}           item at index (remove target)
//! /{index}/{field}   field of the item at index (replace target)
//! ```
//!
//! Field names are escaped JSON-Pointer style: `~` → `~0`, `/` → `~1`.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Position encoded by an operation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatchPath {
    Append,
    Index(usize),
    Field { index: usize, field: String },
}

impl PatchPath {
    pub fn field_of(index: usize, field: impl Into<String>) -> Self {
        Self::Field {
            index,
            field: field.into(),
        }
    }

    /// Item index targeted by this path (`None` for append).
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Append => None,
            Self::Index(index) | Self::Field { index, .. } => Some(*index),
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Field { field, .. } => Some(field),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let rest = raw
            .strip_prefix('/')
            .ok_or_else(|| PathError::MissingLeadingSlash(raw.to_owned()))?;

        if rest == "-" {
            return Ok(Self::Append);
        }

        let mut segments = rest.split('/');
        let index_segment = segments.next().unwrap_or_default();
        let index = index_segment
            .parse::<usize>()
            .map_err(|_| PathError::InvalidIndex(index_segment.to_owned()))?;

        match (segments.next(), segments.next()) {
            (None, _) => Ok(Self::Index(index)),
            (Some(""), _) => Err(PathError::EmptyField(raw.to_owned())),
            (Some(field), None) => Ok(Self::Field {
                index,
                field: unescape(field),
            }),
            (Some(_), Some(_)) => Err(PathError::TooDeep(raw.to_owned())),
        }
    }
}

impl fmt::Display for PatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Append => f.write_str("/-"),
            Self::Index(index) => write!(f, "/{index}"),
            Self::Field { index, field } => write!(f, "/{index}/{}", escape(field)),
        }
    }
}

impl FromStr for PatchPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PatchPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PatchPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

fn escape(field: &str) -> String {
    field.replace('~', "~0").replace('/', "~1")
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Path parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    MissingLeadingSlash(String),
    InvalidIndex(String),
    EmptyField(String),
    TooDeep(String),
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingLeadingSlash(p) => write!(f, "Path must start with '/': {p:?}"),
            Self::InvalidIndex(s) => write!(f, "Invalid index segment: {s:?}"),
            Self::EmptyField(p) => write!(f, "Empty field segment in path {p:?}"),
            Self::TooDeep(p) => write!(f, "Path has more than two segments: {p:?}"),
        }
    }
}

impl std::error::Error for PathError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grammar() {
        assert_eq!(PatchPath::parse("/-").unwrap(), PatchPath::Append);
        assert_eq!(PatchPath::parse("/3").unwrap(), PatchPath::Index(3));
        assert_eq!(
            PatchPath::parse("/0/lat").unwrap(),
            PatchPath::field_of(0, "lat")
        );
    }

    #[test]
    fn test_display_matches_grammar() {
        assert_eq!(PatchPath::Append.to_string(), "/-");
        assert_eq!(PatchPath::Index(12).to_string(), "/12");
        assert_eq!(PatchPath::field_of(2, "model").to_string(), "/2/model");
    }

    #[test]
    fn test_field_escaping() {
        let path = PatchPath::field_of(1, "a/b~c");
        assert_eq!(path.to_string(), "/1/a~1b~0c");
        assert_eq!(PatchPath::parse("/1/a~1b~0c").unwrap(), path);
    }

    #[test]
    fn test_rejects_malformed_paths() {
        assert!(matches!(
            PatchPath::parse("0/lat"),
            Err(PathError::MissingLeadingSlash(_))
        ));
        assert!(matches!(
            PatchPath::parse("/x"),
            Err(PathError::InvalidIndex(_))
        ));
        assert!(matches!(
            PatchPath::parse("/1/"),
            Err(PathError::EmptyField(_))
        ));
        assert!(matches!(
            PatchPath::parse("/1/a/b"),
            Err(PathError::TooDeep(_))
        ));
        assert!(PatchPath::parse("").is_err());
    }

    #[test]
    fn test_accessors() {
        assert_eq!(PatchPath::Append.index(), None);
        assert_eq!(PatchPath::Index(4).index(), Some(4));
        assert_eq!(PatchPath::field_of(5, "lon").field(), Some("lon"));
        assert_eq!(PatchPath::Index(4).field(), None);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&PatchPath::field_of(0, "lat")).unwrap();
        assert_eq!(json, "\"/0/lat\"");
        let bad: Result<PatchPath, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
