use std::sync::Arc;

use petgraph::graph::DiGraph;
use serde_json::{Value, json};

use crate::core::Key;
use crate::error::GraphError;
use crate::hlg::HighLevelGraph;

/// Anything that can hand out a task graph together with the key of its
/// result, e.g. a lazy array or a delayed value.
pub trait Lazy {
    /// The graph computing this object.
    fn graph(&self) -> &Arc<HighLevelGraph>;

    /// The key under which the result is produced.
    fn key(&self) -> &Key;
}

/// Handle to a single lazily computed value.
///
/// The graph is shared: cloning a `Delayed`, or building several handles on
/// top of one graph, never copies the layers.
#[derive(Clone, Debug, PartialEq)]
pub struct Delayed {
    key: Key,
    graph: Arc<HighLevelGraph>,
}

impl Delayed {
    pub fn new(key: impl Into<Key>, graph: impl Into<Arc<HighLevelGraph>>) -> Self {
        Self {
            key: key.into(),
            graph: graph.into(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn graph(&self) -> &Arc<HighLevelGraph> {
        &self.graph
    }

    pub fn dependency_graph(&self) -> Result<DiGraph<Key, ()>, GraphError> {
        self.graph.dependency_graph()
    }

    /// Decodes `{"key": key, "graph": graph}`.
    pub fn from_json(value: &Value) -> Result<Self, GraphError> {
        let key = value.get("key").unwrap_or(&Value::Null);
        let key = Key::from_json(key).map_err(GraphError::OutputKey)?;
        let Some(graph) = value.get("graph") else {
            return Err(GraphError::Json(serde::de::Error::missing_field("graph")));
        };

        Ok(Self::new(key, HighLevelGraph::from_json(graph)?))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "key": self.key.to_json(),
            "graph": self.graph.to_json(),
        })
    }
}

impl Lazy for Delayed {
    fn graph(&self) -> &Arc<HighLevelGraph> {
        &self.graph
    }

    fn key(&self) -> &Key {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::graph::Graph;
    use crate::task::Task;

    #[test]
    fn test_shared_graph() {
        let mut graph = Graph::new();
        graph.insert("x", Task::literal(1));
        graph.insert("y", Task::call("inc", [Task::reference("x")]));
        let graph = Arc::new(HighLevelGraph::from_layer("xy", graph));

        let x = Delayed::new("x", graph.clone());
        let y = Delayed::new("y", graph.clone());

        assert!(Arc::ptr_eq(x.graph(), y.graph()));
        assert_eq!(Arc::strong_count(&graph), 3);
    }

    #[test]
    fn test_json() {
        let value = serde_json::json!({
            "key": ["total", 0],
            "graph": {
                "layers": {
                    "total": {
                        "kind": "materialized",
                        "graph": [[["total", 0], {"op": "sum", "args": [[1, 2, 3]]}]]
                    }
                }
            }
        });

        let delayed = Delayed::from_json(&value).unwrap();

        assert_eq!(delayed.key(), &Key::block("total", vec![0]));
        assert_eq!(Delayed::from_json(&delayed.to_json()).unwrap(), delayed);
    }

    #[test]
    fn test_json_missing_graph() {
        let err = Delayed::from_json(&serde_json::json!({"key": "x"})).unwrap_err();

        assert!(matches!(err, GraphError::Json(_)));
        assert!(err.to_string().contains("graph"));
    }

    #[test]
    fn test_json_bad_key() {
        let err = Delayed::from_json(&serde_json::json!({"key": 5})).unwrap_err();
        assert!(matches!(err, GraphError::OutputKey(TaskError::InvalidKey(_))));
    }
}
