//! Persisted plugin records and manifests.

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Manifest key holding the content hash used to skip unchanged updates.
pub const HASH_KEY: &str = "hash";
/// Manifest key holding the display name.
pub const NAME_KEY: &str = "name";

/// String-to-string plugin manifest.
///
/// Non-string values in a fetched manifest are kept as their JSON text; nulls
/// are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Manifest(BTreeMap<String, String>);

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn hash(&self) -> Option<&str> {
        self.get(HASH_KEY)
    }

    pub fn name(&self) -> Option<&str> {
        self.get(NAME_KEY)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ManifestVisitor;

        impl<'de> Visitor<'de> for ManifestVisitor {
            type Value = Manifest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a manifest object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Manifest, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, Value>()? {
                    match value {
                        Value::Null => {}
                        Value::String(s) => {
                            entries.insert(key, s);
                        }
                        other => {
                            entries.insert(key, other.to_string());
                        }
                    }
                }
                Ok(Manifest(entries))
            }
        }

        deserializer.deserialize_map(ManifestVisitor)
    }
}

/// One installed plugin. The id is the registry key and is not stored here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginRecord {
    pub enabled: bool,
    pub code: String,
    pub update_source: Option<String>,
    /// Whether `update_source` is polled for new versions.
    pub update: bool,
    pub manifest: Manifest,
}

impl PluginRecord {
    /// A plugin installed from local code; never updated.
    pub fn local(code: impl Into<String>, manifest: Manifest) -> Self {
        Self {
            code: code.into(),
            manifest,
            ..Self::default()
        }
    }

    /// Placeholder for a plugin fetched from `source`; filled in by update.
    pub fn remote(source: impl Into<String>, update: bool) -> Self {
        Self {
            update_source: Some(source.into()),
            update,
            ..Self::default()
        }
    }

    /// Source to poll, if this record takes updates.
    pub fn poll_source(&self) -> Option<&str> {
        if self.update {
            self.update_source.as_deref()
        } else {
            None
        }
    }
}
