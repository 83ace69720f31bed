//! Restricted JSONPath: `$`, dotted field names and `[i]` array indices

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

use crate::error::{Result, TransformError};

/// One dotted segment, e.g. `sensors[0][1]`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    /// Field name; empty when the segment only indexes the current value
    name: String,
    indices: Vec<usize>,
    /// Segment text as written, used in error messages
    raw: String,
}

/// Compiled extraction path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    source: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Path selecting the whole document
    pub fn root() -> Self {
        Self {
            source: "$".to_string(),
            segments: Vec::new(),
        }
    }

    pub fn parse(path: &str) -> Result<Self> {
        let invalid = |reason: String| TransformError::InvalidPath {
            path: path.to_string(),
            reason,
        };

        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty path".to_string()));
        }
        if trimmed == "$" {
            return Ok(Self::root());
        }

        let body = if let Some(rest) = trimmed.strip_prefix("$.") {
            rest
        } else if let Some(rest) = trimmed.strip_prefix('$') {
            // `$[0]` indexes a root array
            if !rest.starts_with('[') {
                return Err(invalid("expected '.' or '[' after '$'".to_string()));
            }
            rest
        } else {
            trimmed
        };

        let mut segments = Vec::new();
        for raw in body.split('.') {
            if raw.is_empty() {
                return Err(invalid("empty segment".to_string()));
            }
            segments.push(parse_segment(raw).map_err(invalid)?);
        }

        Ok(Self {
            source: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Walk the path, failing at the first unresolved segment
    pub fn resolve<'a>(&self, document: &'a Json) -> Result<&'a Json> {
        let mut current = document;
        for segment in &self.segments {
            if !segment.name.is_empty() {
                let object = current
                    .as_object()
                    .ok_or_else(|| TransformError::NotAnObject {
                        segment: segment.raw.clone(),
                    })?;
                current =
                    object
                        .get(&segment.name)
                        .ok_or_else(|| TransformError::MissingField {
                            segment: segment.raw.clone(),
                        })?;
            }

            for &index in &segment.indices {
                let array = current
                    .as_array()
                    .ok_or_else(|| TransformError::NotAnArray {
                        segment: segment.raw.clone(),
                    })?;
                current = array
                    .get(index)
                    .ok_or_else(|| TransformError::IndexOutOfRange {
                        segment: segment.raw.clone(),
                        index,
                        len: array.len(),
                    })?;
            }
        }
        Ok(current)
    }
}

fn parse_segment(raw: &str) -> std::result::Result<Segment, String> {
    let (name, mut rest) = match raw.find('[') {
        Some(pos) => (&raw[..pos], &raw[pos..]),
        None => (raw, ""),
    };

    if name.contains(']') {
        return Err(format!("unbalanced ']' in segment '{}'", raw));
    }
    if name.is_empty() && rest.is_empty() {
        return Err("empty segment".to_string());
    }

    let mut indices = Vec::new();
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('[')
            .ok_or_else(|| format!("unexpected text after index in segment '{}'", raw))?;
        let close = inner
            .find(']')
            .ok_or_else(|| format!("missing ']' in segment '{}'", raw))?;
        let digits = inner[..close].trim();
        let index = digits
            .parse::<usize>()
            .map_err(|_| format!("invalid array index '{}' in segment '{}'", digits, raw))?;
        indices.push(index);
        rest = &inner[close + 1..];
    }

    Ok(Segment {
        name: name.to_string(),
        indices,
        raw: raw.to_string(),
    })
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for JsonPath {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for JsonPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for JsonPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_forms() {
        assert!(JsonPath::parse("$").unwrap().is_root());
        assert_eq!(JsonPath::parse("$.a.b").unwrap().segments.len(), 2);
        assert_eq!(JsonPath::parse("a.b").unwrap().segments.len(), 2);

        let p = JsonPath::parse("$.grid[1][2]").unwrap();
        assert_eq!(p.segments[0].name, "grid");
        assert_eq!(p.segments[0].indices, vec![1, 2]);

        let p = JsonPath::parse("$[0].v").unwrap();
        assert_eq!(p.segments[0].name, "");
        assert_eq!(p.segments[0].indices, vec![0]);
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        for bad in ["", "$.", "$.a..b", "$.a[", "$.a[x]", "$.a[-1]", "$.a[0]b", "$x", "$.a]"] {
            assert!(
                matches!(JsonPath::parse(bad), Err(TransformError::InvalidPath { .. })),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_resolve_names_failing_segment() {
        let doc = json!({"data": {"sensors": [1, 2]}, "flag": true});

        let err = JsonPath::parse("$.data.missing").unwrap().resolve(&doc).unwrap_err();
        assert_eq!(
            err,
            TransformError::MissingField {
                segment: "missing".into()
            }
        );

        let err = JsonPath::parse("$.flag.x").unwrap().resolve(&doc).unwrap_err();
        assert_eq!(err.segment(), Some("x"));
        assert!(matches!(err, TransformError::NotAnObject { .. }));

        let err = JsonPath::parse("$.data[0]").unwrap().resolve(&doc).unwrap_err();
        assert!(matches!(err, TransformError::NotAnArray { ref segment } if segment == "data[0]"));

        let err = JsonPath::parse("$.data.sensors[5]").unwrap().resolve(&doc).unwrap_err();
        assert_eq!(
            err,
            TransformError::IndexOutOfRange {
                segment: "sensors[5]".into(),
                index: 5,
                len: 2
            }
        );
    }

    #[test]
    fn test_serde_as_string() {
        let p: JsonPath = serde_json::from_str("\"$.a[1]\"").unwrap();
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"$.a[1]\"");
        assert!(serde_json::from_str::<JsonPath>("\"$.a[\"").is_err());
    }
}
