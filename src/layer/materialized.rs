use serde_json::{Value, json};

use crate::error::LayerError;
use crate::graph::{Graph, rewrite_graph};
use crate::layer::Annotations;

/// A layer whose tasks are spelled out one by one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaterializedLayer {
    graph: Graph,
    annotations: Annotations,
}

impl MaterializedLayer {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            annotations: Annotations::new(),
        }
    }

    pub fn with_annotations(graph: Graph, annotations: Annotations) -> Self {
        Self { graph, annotations }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub(crate) fn rewrite_noop(&self) -> Self {
        Self {
            graph: rewrite_graph(&self.graph),
            annotations: self.annotations.clone(),
        }
    }

    pub(crate) fn from_json(value: &Value) -> Result<Self, LayerError> {
        let graph = match value.get("graph") {
            Some(graph) => Graph::from_json(graph)?,
            None => Graph::new(),
        };

        let annotations = match value.get("annotations") {
            Some(annotations) => serde_json::from_value(annotations.clone())?,
            None => Annotations::new(),
        };

        Ok(Self { graph, annotations })
    }

    pub(crate) fn to_json(&self) -> Value {
        json!({
            "kind": "materialized",
            "graph": self.graph.to_json(),
            "annotations": self.annotations,
        })
    }
}
