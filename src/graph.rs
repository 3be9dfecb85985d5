//! Flat task graphs.
//!
//! A [`Graph`] maps every [`Key`] to the [`Task`] that computes it. Edges are
//! implicit: a task depends on every key it references.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::core::{Blake3Hasher, Hash32, Key};
use crate::error::LayerError;
use crate::task::{Task, rewrite_task};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Graph(BTreeMap<Key, Task>);

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<Key>, task: Task) -> Option<Task> {
        self.0.insert(key.into(), task)
    }

    pub fn get(&self, key: &Key) -> Option<&Task> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Task)> {
        self.0.iter()
    }

    /// The keys each entry depends on.
    pub fn dependencies(&self) -> BTreeMap<Key, BTreeSet<Key>> {
        self.0
            .iter()
            .map(|(key, task)| (key.clone(), task.dependencies()))
            .collect()
    }

    /// Whether every call in the graph is a no-op.
    pub fn is_inert(&self) -> bool {
        self.0.values().all(Task::is_inert)
    }

    /// Hash of the graph's shape: keys, literals, references and nesting.
    /// Operation symbols are left out, so rewriting a graph to no-ops keeps
    /// its fingerprint.
    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        self.hash_shape(&mut hasher);
        hasher.into()
    }

    pub(crate) fn hash_shape(&self, hasher: &mut Blake3Hasher) {
        hasher.tag(b'g').count(self.0.len());
        for (key, task) in &self.0 {
            hasher.key(key);
            task.hash_shape(hasher);
        }
    }

    /// Decodes a graph from JSON. Accepts either an array of `[key, task]`
    /// pairs, or an object when every key is a plain name.
    pub fn from_json(value: &Value) -> Result<Self, LayerError> {
        let decode = |key: Key, task: &Value| {
            Task::from_json(task)
                .map(|task| (key.clone(), task))
                .map_err(|err| LayerError::MalformedTask(key, err))
        };

        match value {
            Value::Object(map) => map
                .iter()
                .map(|(key, task)| decode(Key::name(key.as_str()), task))
                .collect(),
            Value::Array(entries) => entries
                .iter()
                .map(|entry| {
                    let Some([key, task]) = entry.as_array().map(Vec::as_slice) else {
                        return Err(LayerError::MalformedEntry(entry.clone()));
                    };
                    let key = Key::from_json(key)
                        .map_err(|_| LayerError::MalformedEntry(entry.clone()))?;
                    decode(key, task)
                })
                .collect(),
            _ => Err(LayerError::MalformedEntry(value.clone())),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|(key, task)| Value::Array(vec![key.to_json(), task.to_json()]))
                .collect(),
        )
    }
}

impl FromIterator<(Key, Task)> for Graph {
    fn from_iter<T: IntoIterator<Item = (Key, Task)>>(iter: T) -> Self {
        Graph(iter.into_iter().collect())
    }
}

impl Extend<(Key, Task)> for Graph {
    fn extend<T: IntoIterator<Item = (Key, Task)>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

impl<'a> IntoIterator for &'a Graph {
    type Item = (&'a Key, &'a Task);
    type IntoIter = std::collections::btree_map::Iter<'a, Key, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Rewrites every task of `graph` to a no-op, keeping the key set intact.
pub fn rewrite_graph(graph: &Graph) -> Graph {
    graph
        .iter()
        .map(|(key, task)| (key.clone(), rewrite_task(task)))
        .collect()
}
