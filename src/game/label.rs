//! Match label published for discovery, and the query language over it

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// `{ "open": 0|1, "fast": 0|1 }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchLabel {
    #[serde(with = "flag")]
    pub open: bool,
    #[serde(with = "flag")]
    pub fast: bool,
}

impl MatchLabel {
    /// Labels start open; nothing closes them yet
    pub fn new(fast: bool) -> Self {
        Self { open: true, fast }
    }

    /// Value of a label field by name, as published (`0` or `1`)
    pub fn field(&self, key: &str) -> Option<u8> {
        match key {
            "open" => Some(self.open as u8),
            "fast" => Some(self.fast as u8),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Booleans travel as `0`/`1` in labels
mod flag {
    use super::*;

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*value as u8)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(serde::de::Error::custom(format!(
                "label flag must be 0 or 1, got {}",
                other
            ))),
        }
    }
}

/// One `+label.<key>:<value>` (must match) or `-label.<key>:<value>` (must not) term
#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    required: bool,
    key: String,
    value: u8,
}

/// Conjunction of label terms, e.g. `+label.open:1 +label.fast:0`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelQuery {
    terms: Vec<Term>,
}

impl LabelQuery {
    /// Open matches of the given speed
    pub fn open_matches(fast: bool) -> Self {
        Self::default().require("open", 1).require("fast", fast as u8)
    }

    pub fn require(mut self, key: &str, value: u8) -> Self {
        self.terms.push(Term {
            required: true,
            key: key.to_string(),
            value,
        });
        self
    }

    pub fn matches(&self, label: &MatchLabel) -> bool {
        self.terms.iter().all(|term| {
            let hit = label.field(&term.key) == Some(term.value);
            hit == term.required
        })
    }
}

impl fmt::Display for LabelQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let sign = if term.required { '+' } else { '-' };
            write!(f, "{}label.{}:{}", sign, term.key, term.value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label query term: {0}")]
pub struct QueryError(pub String);

impl FromStr for LabelQuery {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut query = Self::default();
        for raw in s.split_whitespace() {
            let bad = || QueryError(raw.to_string());

            let (required, rest) = if let Some(rest) = raw.strip_prefix('+') {
                (true, rest)
            } else if let Some(rest) = raw.strip_prefix('-') {
                (false, rest)
            } else {
                return Err(bad());
            };
            let path = rest.strip_prefix("label.").ok_or_else(bad)?;
            let (key, value) = path.split_once(':').ok_or_else(bad)?;
            if key.is_empty() {
                return Err(bad());
            }
            let value: u8 = value.parse().map_err(|_| bad())?;

            query.terms.push(Term {
                required,
                key: key.to_string(),
                value,
            });
        }
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_serializes_flags_as_integers() {
        assert_eq!(MatchLabel::new(true).to_json(), r#"{"open":1,"fast":1}"#);
        assert_eq!(MatchLabel::new(false).to_json(), r#"{"open":1,"fast":0}"#);
    }

    #[test]
    fn label_rejects_non_flag_values() {
        assert!(serde_json::from_str::<MatchLabel>(r#"{"open":1,"fast":2}"#).is_err());
        let label: MatchLabel = serde_json::from_str(r#"{"open":0,"fast":1}"#).unwrap();
        assert!(!label.open);
        assert!(label.fast);
    }

    #[test]
    fn field_lookup() {
        let label = MatchLabel::new(true);
        assert_eq!(label.field("open"), Some(1));
        assert_eq!(label.field("fast"), Some(1));
        assert_eq!(label.field("mode"), None);
    }

    #[test]
    fn open_match_query_string() {
        assert_eq!(
            LabelQuery::open_matches(false).to_string(),
            "+label.open:1 +label.fast:0"
        );
        assert_eq!(
            LabelQuery::open_matches(true).to_string(),
            "+label.open:1 +label.fast:1"
        );
    }

    #[test]
    fn query_filters_by_mode() {
        let query: LabelQuery = "+label.open:1 +label.fast:1".parse().unwrap();
        assert!(query.matches(&MatchLabel::new(true)));
        assert!(!query.matches(&MatchLabel::new(false)));

        let closed = MatchLabel {
            open: false,
            fast: true,
        };
        assert!(!query.matches(&closed));
    }

    #[test]
    fn excluded_terms_and_unknown_keys() {
        let query: LabelQuery = "-label.fast:1".parse().unwrap();
        assert!(query.matches(&MatchLabel::new(false)));
        assert!(!query.matches(&MatchLabel::new(true)));

        let query = LabelQuery::default().require("region", 1);
        assert!(!query.matches(&MatchLabel::new(false)));
    }

    #[test]
    fn empty_query_matches_everything() {
        let query: LabelQuery = "".parse().unwrap();
        assert!(query.matches(&MatchLabel::new(true)));
    }

    #[test]
    fn malformed_terms_are_rejected() {
        for bad in ["label.open:1", "+open:1", "+label.open", "+label.open:yes", "+label.:1", "+"] {
            assert!(bad.parse::<LabelQuery>().is_err(), "{} should not parse", bad);
        }
    }
}
