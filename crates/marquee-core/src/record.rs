use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of entity a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Movie,
    Review,
    Sales,
    Credit,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Movie => "movie",
            EntityKind::Review => "review",
            EntityKind::Sales => "sales",
            EntityKind::Credit => "credit",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "movie" => Ok(EntityKind::Movie),
            "review" => Ok(EntityKind::Review),
            "sales" => Ok(EntityKind::Sales),
            "credit" => Ok(EntityKind::Credit),
            _ => Err(format!("Unknown entity kind: {s}")),
        }
    }
}

/// One extracted entity.
///
/// Every declared field is present from construction on — extraction fills
/// values in and whatever stays unfilled is an explicit `Null`, never a
/// missing key. Records are immutable once handed to a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub entity: EntityKind,
    pub fields: BTreeMap<String, Value>,
}

impl EntityRecord {
    /// New record with every declared field set to `Null`.
    pub fn new<S: AsRef<str>>(entity: EntityKind, declared: impl IntoIterator<Item = S>) -> Self {
        let fields = declared
            .into_iter()
            .map(|name| (name.as_ref().to_string(), Value::Null))
            .collect();
        Self { entity, fields }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// True if the field is declared but still null.
    pub fn is_unfilled(&self, key: &str) -> bool {
        matches!(self.fields.get(key), Some(Value::Null))
    }

    /// Fill a declared-but-null field. Does nothing for undeclared keys or
    /// fields extraction already populated.
    pub fn fill_missing(&mut self, key: &str, value: &str) {
        if self.is_unfilled(key) {
            self.fields
                .insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    /// Non-empty string value of the identity field, if resolvable. A record
    /// whose identity is null or blank must be dropped, not emitted.
    pub fn identity(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_kind_roundtrip() {
        for kind in [
            EntityKind::Movie,
            EntityKind::Review,
            EntityKind::Sales,
            EntityKind::Credit,
        ] {
            let parsed: EntityKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_declared_fields_start_null() {
        let record = EntityRecord::new(EntityKind::Movie, ["movie_id", "title", "genres"]);
        assert_eq!(record.fields.len(), 3);
        assert!(record.is_unfilled("title"));
        assert!(record.is_unfilled("genres"));
        assert_eq!(record.get("movie_id"), Some(&Value::Null));
    }

    #[test]
    fn test_fill_missing_only_touches_null_declared_fields() {
        let mut record = EntityRecord::new(EntityKind::Review, ["movie_id", "review_text"]);
        record.set("review_text", json!("great"));

        record.fill_missing("review_text", "overwritten");
        record.fill_missing("movie_id", "tt0001");
        record.fill_missing("not_declared", "x");

        assert_eq!(record.get("review_text"), Some(&json!("great")));
        assert_eq!(record.get("movie_id"), Some(&json!("tt0001")));
        assert!(record.get("not_declared").is_none());
    }

    #[test]
    fn test_identity_requires_non_empty_string() {
        let mut record = EntityRecord::new(EntityKind::Movie, ["movie_id"]);
        assert_eq!(record.identity("movie_id"), None);

        record.set("movie_id", json!(""));
        assert_eq!(record.identity("movie_id"), None);

        record.set("movie_id", json!("tt0001"));
        assert_eq!(record.identity("movie_id"), Some("tt0001"));
    }

    #[test]
    fn test_serializes_with_explicit_nulls() {
        let record = EntityRecord::new(EntityKind::Sales, ["movie_id", "budget"]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""budget":null"#));
    }
}
