use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Display;

pub const DEFAULT_EVENT_TYPE: &str = "event";

/// A structured piece of data flowing through a pipeline
///
/// The payload is a JSON object. Fields are addressed with slash separated paths:
/// `"/a/b"`, `"a/b"` both designate the field `b` of the object `a`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    data: Map<String, Value>,
    event_type: String,
    tags: BTreeSet<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum EventError {
    #[error("An event must be a JSON object, not: {0}")]
    NotAnObject(String),

    #[error("Invalid event key: {0:?}")]
    InvalidKey(String),

    #[error("Cannot set {key}: {parent} is not an object")]
    NotAnObjectField { key: String, parent: String },

    #[error(transparent)]
    InvalidJson(#[from] serde_json::Error),
}

impl Default for Event {
    fn default() -> Self {
        Event::from_map(Map::new())
    }
}

impl Event {
    pub fn from_map(data: Map<String, Value>) -> Self {
        Event {
            data,
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            tags: BTreeSet::new(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, EventError> {
        let value: Value = serde_json::from_str(json)?;
        Event::try_from(value)
    }

    pub fn with_event_type(self, event_type: impl Into<String>) -> Self {
        Event {
            event_type: event_type.into(),
            ..self
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Return the value at the given path, if any
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut segments = path_segments(key);
        let first = segments.next()?;
        let mut value = self.data.get(first)?;
        for segment in segments {
            value = value.as_object()?.get(segment)?;
        }
        Some(value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set the value at the given path, creating the missing intermediate objects
    pub fn put(&mut self, key: &str, value: impl Into<Value>) -> Result<(), EventError> {
        let segments: Vec<&str> = path_segments(key).collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(EventError::InvalidKey(key.to_string()));
        };

        let mut target = &mut self.data;
        for (i, parent) in parents.iter().enumerate() {
            let entry = target
                .entry(parent.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            target = match entry {
                Value::Object(object) => object,
                _ => {
                    return Err(EventError::NotAnObjectField {
                        key: key.to_string(),
                        parent: parents[..=i].join("/"),
                    })
                }
            };
        }
        target.insert(last.to_string(), value.into());
        Ok(())
    }

    /// Remove the value at the given path, returning it if any
    pub fn delete(&mut self, key: &str) -> Option<Value> {
        let segments: Vec<&str> = path_segments(key).collect();
        let (last, parents) = segments.split_last()?;
        let mut target = &mut self.data;
        for parent in parents {
            target = target.get_mut(*parent)?.as_object_mut()?;
        }
        target.remove(*last)
    }

    pub fn to_map(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.data
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.data.clone())
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into))
    }
}

fn path_segments(key: &str) -> impl Iterator<Item = &str> {
    key.split('/').filter(|segment| !segment.is_empty())
}

impl From<Map<String, Value>> for Event {
    fn from(data: Map<String, Value>) -> Self {
        Event::from_map(data)
    }
}

impl TryFrom<Value> for Event {
    type Error = EventError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(data) => Ok(Event::from_map(data)),
            other => Err(EventError::NotAnObject(other.to_string())),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.data.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    fn event(value: Value) -> Event {
        Event::try_from(value).unwrap()
    }

    #[test_case("status", Some(json!(200)) ; "top level field")]
    #[test_case("/status", Some(json!(200)) ; "leading slash")]
    #[test_case("/http/method", Some(json!("GET")) ; "nested field")]
    #[test_case("http/method", Some(json!("GET")) ; "nested field without leading slash")]
    #[test_case("/http/missing", None ; "missing nested field")]
    #[test_case("/status/code", None ; "field of a non object")]
    #[test_case("", None ; "empty key")]
    fn get_values(key: &str, expected: Option<Value>) {
        let event = event(json!({"status": 200, "http": {"method": "GET"}}));
        assert_eq!(event.get(key).cloned(), expected);
    }

    #[test]
    fn put_creates_intermediate_objects() {
        let mut event = Event::default();
        event.put("/a/b/c", 42).unwrap();
        event.put("d", "x").unwrap();

        assert_eq!(event.to_json(), json!({"a": {"b": {"c": 42}}, "d": "x"}));
    }

    #[test]
    fn put_rejects_non_object_parents() {
        let mut event = event(json!({"a": 1}));
        assert_matches!(
            event.put("/a/b", 2),
            Err(EventError::NotAnObjectField { parent, .. }) if parent == "a"
        );
        assert_matches!(event.put("/", 2), Err(EventError::InvalidKey(_)));
    }

    #[test]
    fn delete_returns_removed_value() {
        let mut event = event(json!({"a": {"b": 1, "c": 2}}));
        assert_eq!(event.delete("/a/b"), Some(json!(1)));
        assert_eq!(event.delete("/a/b"), None);
        assert_eq!(event.to_json(), json!({"a": {"c": 2}}));
    }

    #[test]
    fn only_objects_are_events() {
        assert_matches!(Event::from_json_str("[1,2]"), Err(EventError::NotAnObject(_)));
        assert_matches!(Event::from_json_str("{"), Err(EventError::InvalidJson(_)));
        assert!(Event::from_json_str(r#"{"a":1}"#).is_ok());
    }

    #[test]
    fn tags_are_kept_in_metadata() {
        let mut event = event(json!({"a": 1}));
        event.add_tags(["aggregated"]);

        assert!(event.has_tag("aggregated"));
        assert_eq!(event.to_json(), json!({"a": 1}));
        assert_eq!(event.event_type(), DEFAULT_EVENT_TYPE);
    }
}
