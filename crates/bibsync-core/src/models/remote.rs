//! Lenient deserializers for remote payload quirks.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Parent references arrive as a key string or `false`.
pub fn optional_key<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(key)) if !key.trim().is_empty() => Some(key),
        _ => None,
    })
}

/// Trash flags arrive as booleans, numbers or strings.
pub fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(flag)) => flag,
        Some(Value::Number(number)) => number.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(text)) => matches!(text.trim(), "1" | "true"),
        _ => false,
    })
}

/// Relation values arrive as a single URI or a list of URIs.
pub fn relations<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut relations = BTreeMap::new();
    for (predicate, value) in raw {
        let mut objects: Vec<String> = match value {
            Value::String(uri) => vec![uri],
            Value::Array(values) => values
                .into_iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        objects.sort();
        objects.dedup();
        if !objects.is_empty() {
            relations.insert(predicate, objects);
        }
    }
    Ok(relations)
}

/// Relations serialized the way the API accepts them.
pub fn relations_value(relations: &BTreeMap<String, Vec<String>>) -> Value {
    let map = relations
        .iter()
        .map(|(predicate, objects)| {
            let value = if objects.len() == 1 {
                Value::from(objects[0].clone())
            } else {
                Value::from(objects.clone())
            };
            (predicate.clone(), value)
        })
        .collect();
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(default, deserialize_with = "optional_key")]
        parent: Option<String>,
        #[serde(default, deserialize_with = "truthy")]
        deleted: bool,
        #[serde(default, deserialize_with = "relations")]
        relations: BTreeMap<String, Vec<String>>,
    }

    #[test]
    fn parses_loose_remote_shapes() {
        let sample: Sample = serde_json::from_str(
            r#"{"parent": false, "deleted": 1, "relations": {"dc:replaces": "a", "owl:sameAs": ["c", "b"]}}"#,
        )
        .unwrap();
        assert_eq!(sample.parent, None);
        assert!(sample.deleted);
        assert_eq!(sample.relations["dc:replaces"], vec!["a".to_string()]);
        assert_eq!(
            sample.relations["owl:sameAs"],
            vec!["b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn missing_values_use_defaults() {
        let sample: Sample = serde_json::from_str(r#"{"parent": "ABCD2345"}"#).unwrap();
        assert_eq!(sample.parent.as_deref(), Some("ABCD2345"));
        assert!(!sample.deleted);
        assert!(sample.relations.is_empty());
    }
}
