use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{CropdxError, Result};
use crate::io::write_atomic;

/// Mapping from model output position to class name.
///
/// Built once from the sorted class directory names. Inference callers must
/// use the exact same mapping the model was trained with, so it is persisted
/// next to the model artifact as a flat JSON object:
///
/// ```json
/// { "0": "Apple_Scab", "1": "Corn_Rust" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "HashMap<String, String>")]
pub struct ClassIndexMap {
    names: Vec<String>,
}

impl ClassIndexMap {
    /// Creates a map where `names[i]` is the class at output position `i`.
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if no classes are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Class name for an output index.
    #[must_use]
    pub fn label(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Output index for a class name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Class names in index order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Iterates `(index, name)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }

    /// Renders the map as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a map from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CropdxError::Artifact(format!("label map: {e}")))
    }

    /// Atomically writes the map to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_json()?.as_bytes())
    }

    /// Reads a map previously written with [`ClassIndexMap::save`].
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl Serialize for ClassIndexMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        // Emit keys in numeric order; a string-keyed map would put "10" before "2".
        let mut map = serializer.serialize_map(Some(self.names.len()))?;
        for (index, name) in self.names.iter().enumerate() {
            map.serialize_entry(&index.to_string(), name)?;
        }
        map.end()
    }
}

impl TryFrom<HashMap<String, String>> for ClassIndexMap {
    type Error = String;

    fn try_from(raw: HashMap<String, String>) -> std::result::Result<Self, Self::Error> {
        let mut slots: Vec<Option<String>> = vec![None; raw.len()];
        for (key, name) in raw {
            let index: usize = key
                .parse()
                .map_err(|_| format!("key {key:?} is not a class index"))?;
            let slot = slots
                .get_mut(index)
                .ok_or_else(|| format!("class index {index} is out of range"))?;
            *slot = Some(name);
        }
        let names = slots
            .into_iter()
            .enumerate()
            .map(|(i, n)| n.ok_or_else(|| format!("class index {i} is missing")))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { names })
    }
}

impl fmt::Display for ClassIndexMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, name) in self.names.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{i}={name}")?;
        }
        write!(f, "]")
    }
}
