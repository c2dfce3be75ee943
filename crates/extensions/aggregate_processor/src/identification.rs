use prepper_api::Event;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::hash::Hash;
use std::hash::Hasher;

/// Computes the identity of the group an event belongs to
#[derive(Clone, Debug)]
pub struct IdentificationKeysHasher {
    identification_keys: Vec<String>,
}

/// The values of the identification keys of an event
///
/// Two maps are equal and hash the same when they hold the same key/value pairs,
/// whatever the order of the identification keys or of the fields of nested objects.
/// A key missing from the event is mapped to `null`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentificationKeysMap {
    keys: BTreeMap<String, Value>,
}

impl IdentificationKeysHasher {
    pub fn new(identification_keys: Vec<String>) -> Self {
        IdentificationKeysHasher {
            identification_keys,
        }
    }

    pub fn identification_keys(&self) -> &[String] {
        &self.identification_keys
    }

    pub fn create_identification_keys_map_from_event(&self, event: &Event) -> IdentificationKeysMap {
        let keys = self
            .identification_keys
            .iter()
            .map(|key| (key.clone(), event.get(key).cloned().unwrap_or(Value::Null)))
            .collect();
        IdentificationKeysMap { keys }
    }
}

impl IdentificationKeysMap {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.keys.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The identification keys laid out as event fields
    ///
    /// Keys given as paths, as `"/http/method"`, are expanded into nested objects.
    pub fn to_event(&self) -> Event {
        let mut event = Event::default();
        for (key, value) in &self.keys {
            if event.put(key, value.clone()).is_err() {
                // Conflicting paths such as "a" and "a/b": keep the flat key
                let mut data = event.into_map();
                data.insert(key.clone(), value.clone());
                event = Event::from_map(data);
            }
        }
        event
    }

    pub fn to_map(&self) -> Map<String, Value> {
        self.to_event().into_map()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for IdentificationKeysMap {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        IdentificationKeysMap {
            keys: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl Hash for IdentificationKeysMap {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.keys.len());
        for (key, value) in &self.keys {
            key.hash(state);
            hash_json(value, state);
        }
    }
}

impl Display for IdentificationKeysMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut separator = "";
        write!(f, "{{")?;
        for (key, value) in &self.keys {
            write!(f, "{separator}{key}={value}")?;
            separator = ", ";
        }
        write!(f, "}}")
    }
}

/// Hash a JSON value consistently with its equality
fn hash_json<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => state.write_u8(0),
        Value::Bool(b) => {
            state.write_u8(1);
            b.hash(state);
        }
        Value::Number(n) => {
            state.write_u8(2);
            if let Some(u) = n.as_u64() {
                state.write_u8(0);
                u.hash(state);
            } else if let Some(i) = n.as_i64() {
                state.write_u8(1);
                i.hash(state);
            } else {
                state.write_u8(2);
                let f = n.as_f64().unwrap_or_default();
                // 0.0 == -0.0
                let f = if f == 0.0 { 0.0 } else { f };
                f.to_bits().hash(state);
            }
        }
        Value::String(s) => {
            state.write_u8(3);
            s.hash(state);
        }
        Value::Array(items) => {
            state.write_u8(4);
            state.write_usize(items.len());
            for item in items {
                hash_json(item, state);
            }
        }
        Value::Object(fields) => {
            state.write_u8(5);
            state.write_usize(fields.len());
            let mut fields: Vec<_> = fields.iter().collect();
            fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
            for (key, value) in fields {
                key.hash(state);
                hash_json(value, state);
            }
        }
    }
}
