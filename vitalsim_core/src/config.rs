//! The Configuration Tree - layered, write-once-per-layer settings
//!
//! Every leaf holds one value per named layer. Readers always see the value
//! from the highest-priority layer that has one, so component defaults can sit
//! underneath model-specific and user overrides without anyone mutating
//! anyone else's value.
//!
//! ```text
//! override          ─┐
//! model_override     │  first present value wins
//! component_configs  │
//! base              ─┘
//! ```
//!
//! After setup the engine freezes the tree; later writes fail.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

/// Layers used by the engine, lowest priority first.
pub const DEFAULT_LAYERS: [&str; 4] = ["base", "component_configs", "model_override", "override"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A layer may set a given key at most once.
    #[error("duplicated configuration value for {key} in layer {layer} (already set by {existing_source}, now by {new_source})")]
    Duplicated {
        key: String,
        layer: String,
        existing_source: String,
        new_source: String,
    },

    #[error("configuration key not found: {0}")]
    KeyNotFound(String),

    #[error("configuration is frozen; cannot update {0}")]
    Frozen(String),

    #[error("unknown configuration layer {layer} (known layers: {known})")]
    UnknownLayer { layer: String, known: String },

    /// A mapping was written where a value lives, or the other way round.
    #[error("type clash at {key}: {message}")]
    TypeClash { key: String, message: String },

    #[error("cannot read {key} as the requested type: {message}")]
    Conversion { key: String, message: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to read configuration file {path}: {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },
}

/// A value set in one layer, with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerValue {
    pub layer: String,
    pub value: Value,
    pub source: String,
}

/// A leaf of the configuration tree.
#[derive(Debug)]
pub struct ConfigNode {
    layers: Rc<[String]>,
    values: IndexMap<String, LayerValue>,
    accessed: Cell<bool>,
}

impl ConfigNode {
    fn new(layers: Rc<[String]>) -> Self {
        Self {
            layers,
            values: IndexMap::new(),
            accessed: Cell::new(false),
        }
    }

    fn set(&mut self, key: &str, layer: &str, value: Value, source: &str) -> Result<(), ConfigurationError> {
        if let Some(existing) = self.values.get(layer) {
            return Err(ConfigurationError::Duplicated {
                key: key.to_string(),
                layer: layer.to_string(),
                existing_source: existing.source.clone(),
                new_source: source.to_string(),
            });
        }
        self.values.insert(
            layer.to_string(),
            LayerValue {
                layer: layer.to_string(),
                value,
                source: source.to_string(),
            },
        );
        Ok(())
    }

    /// Returns the value from `layer`, or from the highest layer that has one.
    fn get(&self, layer: Option<&str>) -> Option<&Value> {
        let found = match layer {
            Some(layer) => self.values.get(layer),
            None => self
                .layers
                .iter()
                .rev()
                .find_map(|layer| self.values.get(layer.as_str())),
        };
        if found.is_some() {
            self.accessed.set(true);
        }
        found.map(|v| &v.value)
    }

    fn peek(&self) -> Option<&Value> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| self.values.get(layer.as_str()))
            .map(|v| &v.value)
    }

    /// Values in priority order, lowest first.
    fn history(&self) -> Vec<LayerValue> {
        self.layers
            .iter()
            .filter_map(|layer| self.values.get(layer.as_str()).cloned())
            .collect()
    }
}

#[derive(Debug)]
enum ConfigEntry {
    Node(ConfigNode),
    Tree(ConfigTree),
}

/// A nested namespace of layered configuration values.
#[derive(Debug)]
pub struct ConfigTree {
    layers: Rc<[String]>,
    children: IndexMap<String, ConfigEntry>,
    frozen: bool,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::new(&DEFAULT_LAYERS)
    }
}

impl ConfigTree {
    /// Creates an empty tree with the given layers, lowest priority first.
    pub fn new<S: AsRef<str>>(layers: &[S]) -> Self {
        let layers: Rc<[String]> = layers.iter().map(|l| l.as_ref().to_string()).collect();
        Self::with_layers(layers)
    }

    fn with_layers(layers: Rc<[String]>) -> Self {
        Self {
            layers,
            children: IndexMap::new(),
            frozen: false,
        }
    }

    /// Returns the layer names, lowest priority first.
    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    /// Returns true once `freeze` has been called.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns the names of the direct children of this tree.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Merges a nested mapping into the tree at `layer`.
    ///
    /// `layer` defaults to the highest-priority layer. Each leaf records
    /// `source` as its provenance.
    pub fn update(
        &mut self,
        data: &Value,
        layer: Option<&str>,
        source: Option<&str>,
    ) -> Result<(), ConfigurationError> {
        if self.frozen {
            return Err(ConfigurationError::Frozen("<root>".to_string()));
        }
        let layer = self.resolve_layer(layer)?;
        let source = source.unwrap_or("unknown");
        match data {
            Value::Mapping(_) => self.update_at("", data, &layer, source),
            Value::Null => Ok(()),
            _ => Err(ConfigurationError::TypeClash {
                key: "<root>".to_string(),
                message: "configuration updates must be mappings".to_string(),
            }),
        }
    }

    /// Parses YAML text and merges it into the tree.
    pub fn update_yaml_str(
        &mut self,
        text: &str,
        layer: Option<&str>,
        source: Option<&str>,
    ) -> Result<(), ConfigurationError> {
        let data: Value = serde_yaml::from_str(text)?;
        self.update(&data, layer, source.or(Some("<yaml>")))
    }

    /// Reads and merges a YAML file; the path becomes the provenance.
    pub fn update_yaml_file(
        &mut self,
        path: impl AsRef<Path>,
        layer: Option<&str>,
    ) -> Result<(), ConfigurationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|error| ConfigurationError::Io {
            path: path.display().to_string(),
            error,
        })?;
        let source = path.display().to_string();
        self.update_yaml_str(&text, layer, Some(&source))
    }

    fn resolve_layer(&self, layer: Option<&str>) -> Result<String, ConfigurationError> {
        match layer {
            None => self
                .layers
                .last()
                .cloned()
                .ok_or_else(|| ConfigurationError::UnknownLayer {
                    layer: "<none>".to_string(),
                    known: String::new(),
                }),
            Some(layer) if self.layers.iter().any(|l| l == layer) => Ok(layer.to_string()),
            Some(layer) => Err(ConfigurationError::UnknownLayer {
                layer: layer.to_string(),
                known: self.layers.join(", "),
            }),
        }
    }

    fn update_at(
        &mut self,
        prefix: &str,
        data: &Value,
        layer: &str,
        source: &str,
    ) -> Result<(), ConfigurationError> {
        let Value::Mapping(mapping) = data else {
            return Err(ConfigurationError::TypeClash {
                key: prefix.to_string(),
                message: "expected a mapping".to_string(),
            });
        };

        for (key, value) in mapping {
            let key = key_to_string(key)?;
            let path = join_path(prefix, &key);
            if self.frozen {
                return Err(ConfigurationError::Frozen(path));
            }

            match value {
                Value::Mapping(_) => {
                    let layers = Rc::clone(&self.layers);
                    let entry = self
                        .children
                        .entry(key)
                        .or_insert_with(|| ConfigEntry::Tree(ConfigTree::with_layers(layers)));
                    match entry {
                        ConfigEntry::Tree(tree) => tree.update_at(&path, value, layer, source)?,
                        ConfigEntry::Node(_) => {
                            return Err(ConfigurationError::TypeClash {
                                key: path,
                                message: "cannot replace a value with a mapping".to_string(),
                            })
                        }
                    }
                }
                _ => {
                    let layers = Rc::clone(&self.layers);
                    let entry = self
                        .children
                        .entry(key)
                        .or_insert_with(|| ConfigEntry::Node(ConfigNode::new(layers)));
                    match entry {
                        ConfigEntry::Node(node) => node.set(&path, layer, value.clone(), source)?,
                        ConfigEntry::Tree(_) => {
                            return Err(ConfigurationError::TypeClash {
                                key: path,
                                message: "cannot replace a mapping with a value".to_string(),
                            })
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Marks this tree and every descendant read-only.
    pub fn freeze(&mut self) {
        self.frozen = true;
        for entry in self.children.values_mut() {
            if let ConfigEntry::Tree(tree) = entry {
                tree.freeze();
            }
        }
    }

    fn entry(&self, path: &str) -> Option<&ConfigEntry> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut entry = self.children.get(first)?;
        for part in parts {
            match entry {
                ConfigEntry::Tree(tree) => entry = tree.children.get(part)?,
                ConfigEntry::Node(_) => return None,
            }
        }
        Some(entry)
    }

    fn node(&self, path: &str) -> Result<&ConfigNode, ConfigurationError> {
        match self.entry(path) {
            Some(ConfigEntry::Node(node)) => Ok(node),
            Some(ConfigEntry::Tree(_)) => Err(ConfigurationError::TypeClash {
                key: path.to_string(),
                message: "is a subtree, not a value".to_string(),
            }),
            None => Err(ConfigurationError::KeyNotFound(path.to_string())),
        }
    }

    /// Returns true if `path` names a value or a subtree.
    pub fn contains(&self, path: &str) -> bool {
        self.entry(path).is_some()
    }

    /// Resolves a dotted key, from `layer` or from the highest layer that has it.
    pub fn get_from_layer(&self, path: &str, layer: Option<&str>) -> Result<&Value, ConfigurationError> {
        if let Some(layer) = layer {
            self.resolve_layer(Some(layer))?;
        }
        self.node(path)?
            .get(layer)
            .ok_or_else(|| ConfigurationError::KeyNotFound(path.to_string()))
    }

    /// Resolves a dotted key from the highest layer that has it.
    pub fn get(&self, path: &str) -> Result<&Value, ConfigurationError> {
        self.get_from_layer(path, None)
    }

    /// Resolves a dotted key and deserializes it.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConfigurationError> {
        let value = self.get(path)?;
        serde_yaml::from_value(value.clone()).map_err(|e| ConfigurationError::Conversion {
            key: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Returns the subtree at `path`.
    pub fn get_tree(&self, path: &str) -> Result<&ConfigTree, ConfigurationError> {
        match self.entry(path) {
            Some(ConfigEntry::Tree(tree)) => Ok(tree),
            Some(ConfigEntry::Node(_)) => Err(ConfigurationError::TypeClash {
                key: path.to_string(),
                message: "is a value, not a subtree".to_string(),
            }),
            None => Err(ConfigurationError::KeyNotFound(path.to_string())),
        }
    }

    /// Returns every layer's value for `path` with its source, lowest first.
    pub fn provenance(&self, path: &str) -> Result<Vec<LayerValue>, ConfigurationError> {
        Ok(self.node(path)?.history())
    }

    /// Lists dotted paths whose value was never read.
    pub fn unused_keys(&self) -> Vec<String> {
        let mut unused = Vec::new();
        self.collect_unused("", &mut unused);
        unused
    }

    fn collect_unused(&self, prefix: &str, unused: &mut Vec<String>) {
        for (key, entry) in &self.children {
            let path = join_path(prefix, key);
            match entry {
                ConfigEntry::Node(node) if !node.accessed.get() => unused.push(path),
                ConfigEntry::Node(_) => {}
                ConfigEntry::Tree(tree) => tree.collect_unused(&path, unused),
            }
        }
    }

    /// Returns the effective values as a nested mapping without marking them read.
    pub fn to_value(&self) -> Value {
        let mut mapping = serde_yaml::Mapping::new();
        for (key, entry) in &self.children {
            let value = match entry {
                ConfigEntry::Node(node) => node.peek().cloned().unwrap_or(Value::Null),
                ConfigEntry::Tree(tree) => tree.to_value(),
            };
            mapping.insert(Value::String(key.clone()), value);
        }
        Value::Mapping(mapping)
    }
}

fn key_to_string(key: &Value) -> Result<String, ConfigurationError> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ConfigurationError::TypeClash {
            key: format!("{:?}", other),
            message: "configuration keys must be scalars".to_string(),
        }),
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}
