//! Multi-layer task graphs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::core::{ArcStr, Blake3Hasher, Hash32, Key};
use crate::error::{GraphError, LayerError};
use crate::graph::Graph;
use crate::layer::Layer;

/// A task graph split into named layers.
///
/// Layers only refer to each other through task keys. The dependency table
/// records, for every layer, the names of the layers whose keys it uses.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HighLevelGraph {
    layers: BTreeMap<ArcStr, Layer>,
    dependencies: BTreeMap<ArcStr, BTreeSet<ArcStr>>,
}

impl HighLevelGraph {
    /// Assembles a graph, checking that the dependency table only names
    /// known layers. Layers missing from the table depend on nothing.
    pub fn new(
        layers: BTreeMap<ArcStr, Layer>,
        mut dependencies: BTreeMap<ArcStr, BTreeSet<ArcStr>>,
    ) -> Result<Self, GraphError> {
        for (name, deps) in &dependencies {
            if !layers.contains_key(name) {
                return Err(GraphError::UnknownLayer(name.clone()));
            }
            if let Some(dep) = deps.iter().find(|dep| !layers.contains_key(*dep)) {
                return Err(GraphError::UnknownDependency(name.clone(), dep.clone()));
            }
        }

        for name in layers.keys() {
            dependencies.entry(name.clone()).or_default();
        }

        Ok(Self {
            layers,
            dependencies,
        })
    }

    pub fn from_layer(name: impl Into<ArcStr>, layer: impl Into<Layer>) -> Self {
        let name = name.into();

        Self {
            layers: BTreeMap::from([(name.clone(), layer.into())]),
            dependencies: BTreeMap::from([(name, BTreeSet::new())]),
        }
    }

    pub fn layers(&self) -> &BTreeMap<ArcStr, Layer> {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn dependencies(&self) -> &BTreeMap<ArcStr, BTreeSet<ArcStr>> {
        &self.dependencies
    }

    /// Same dependency table, different layers. The caller keeps the layer
    /// names intact.
    pub(crate) fn with_layers(&self, layers: BTreeMap<ArcStr, Layer>) -> Self {
        debug_assert!(layers.keys().eq(self.layers.keys()));

        Self {
            layers,
            dependencies: self.dependencies.clone(),
        }
    }

    /// Flattens every layer into a single graph.
    pub fn materialize(&self) -> Result<Graph, GraphError> {
        let mut graph = Graph::new();

        for (name, layer) in &self.layers {
            let tasks = layer
                .materialize()
                .map_err(|err| GraphError::Layer(name.clone(), LayerError::Blockwise(err)))?;

            graph.extend(tasks.iter().map(|(key, task)| (key.clone(), task.clone())));
        }

        Ok(graph)
    }

    /// Key-level dependency graph, with an edge from every dependency to
    /// its dependent. References to keys outside the graph are skipped.
    pub fn dependency_graph(&self) -> Result<DiGraph<Key, ()>, GraphError> {
        let graph = self.materialize()?;
        let mut dag = DiGraph::with_capacity(graph.len(), graph.len());

        let nodes: HashMap<&Key, NodeIndex> = graph
            .keys()
            .map(|key| (key, dag.add_node(key.clone())))
            .collect();

        for (key, task) in &graph {
            let target = nodes[key];
            for dependency in task.dependencies() {
                if let Some(&source) = nodes.get(&dependency) {
                    dag.add_edge(source, target, ());
                }
            }
        }

        Ok(dag)
    }

    /// Shape fingerprint of the whole graph: layer names, the dependency
    /// table and the shape of every materialized layer.
    pub fn fingerprint(&self) -> Result<Hash32, GraphError> {
        let mut hasher = Blake3Hasher::default();

        for (name, deps) in &self.dependencies {
            hasher.tag(b'd').bytes(name.as_bytes()).count(deps.len());
            for dep in deps {
                hasher.bytes(dep.as_bytes());
            }
        }

        for (name, layer) in &self.layers {
            let tasks = layer
                .materialize()
                .map_err(|err| GraphError::Layer(name.clone(), LayerError::Blockwise(err)))?;

            hasher.tag(b'L').bytes(name.as_bytes());
            tasks.hash_shape(&mut hasher);
        }

        Ok(hasher.into())
    }

    /// Decodes `{"layers": {name: layer}, "dependencies": {name: [name]}}`.
    pub fn from_json(value: &Value) -> Result<Self, GraphError> {
        let raw = RawGraph::deserialize(value)?;

        let layers = raw
            .layers
            .iter()
            .map(|(name, layer)| {
                let name = ArcStr::from(name.as_str());
                Layer::from_json(layer)
                    .map(|layer| (name.clone(), layer))
                    .map_err(|err| GraphError::Layer(name, err))
            })
            .collect::<Result<_, _>>()?;

        let dependencies = raw
            .dependencies
            .into_iter()
            .map(|(name, deps)| (name.into(), deps.into_iter().map(Into::into).collect()))
            .collect();

        Self::new(layers, dependencies)
    }

    pub fn to_json(&self) -> Value {
        let layers: Map<String, Value> = self
            .layers
            .iter()
            .map(|(name, layer)| (name.to_string(), layer.to_json()))
            .collect();

        let dependencies: BTreeMap<String, Vec<String>> = self
            .dependencies
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|dep| dep.to_string()).collect(),
                )
            })
            .collect();

        json!({
            "layers": layers,
            "dependencies": dependencies,
        })
    }
}

#[derive(Deserialize)]
struct RawGraph {
    layers: BTreeMap<String, Value>,
    #[serde(default)]
    dependencies: BTreeMap<String, BTreeSet<String>>,
}
