//! Layers of a high-level graph.
//!
//! The set of layer kinds is closed: a layer is either spelled out task by
//! task ([`MaterializedLayer`]) or generated from a template ([`Blockwise`]).
//! Adding a kind means extending [`Layer`], and the compiler then points at
//! every place that has to learn about it.

mod blockwise;
mod materialized;

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde_json::Value;

pub use crate::layer::blockwise::{
    Blockwise, BlockwiseArg, BlockwiseBuilder, CONCATENATE_AXES, Concatenate, IoDep, Sentinel,
    blockwise_token,
};
pub use crate::layer::materialized::MaterializedLayer;

use crate::error::{BlockwiseError, LayerError};
use crate::graph::Graph;

/// Free-form metadata attached to a layer, e.g. scheduling hints. Passed
/// through untouched.
pub type Annotations = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub enum Layer {
    Materialized(MaterializedLayer),
    Blockwise(Blockwise),
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Materialized(_) => "materialized",
            Layer::Blockwise(_) => "blockwise",
        }
    }

    pub fn annotations(&self) -> &Annotations {
        match self {
            Layer::Materialized(layer) => layer.annotations(),
            Layer::Blockwise(layer) => layer.annotations(),
        }
    }

    /// Every task of the layer, spelled out.
    pub fn materialize(&self) -> Result<Cow<'_, Graph>, BlockwiseError> {
        match self {
            Layer::Materialized(layer) => Ok(Cow::Borrowed(layer.graph())),
            Layer::Blockwise(layer) => layer.materialize().map(Cow::Owned),
        }
    }

    /// Decodes a layer, dispatching on its `"kind"` field.
    pub fn from_json(value: &Value) -> Result<Self, LayerError> {
        match value.get("kind") {
            Some(Value::String(kind)) if kind == "materialized" => {
                MaterializedLayer::from_json(value).map(Layer::Materialized)
            }
            Some(Value::String(kind)) if kind == "blockwise" => {
                Blockwise::from_json(value).map(Layer::Blockwise)
            }
            Some(Value::String(kind)) => Err(LayerError::UnsupportedLayerKind(kind.clone())),
            Some(other) => Err(LayerError::UnsupportedLayerKind(other.to_string())),
            None => Err(LayerError::UnsupportedLayerKind("<missing>".into())),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Layer::Materialized(layer) => layer.to_json(),
            Layer::Blockwise(layer) => layer.to_json(),
        }
    }
}

impl From<MaterializedLayer> for Layer {
    fn from(value: MaterializedLayer) -> Self {
        Layer::Materialized(value)
    }
}

impl From<Blockwise> for Layer {
    fn from(value: Blockwise) -> Self {
        Layer::Blockwise(value)
    }
}

impl From<Graph> for Layer {
    fn from(value: Graph) -> Self {
        Layer::Materialized(MaterializedLayer::new(value))
    }
}

/// Rewrites a layer so that every operation in it is a no-op.
///
/// Materialized layers have their mapping rewritten. Blockwise layers have
/// only their template rewritten, every other field is carried over, and a
/// truthy concatenation setting is replaced by a fresh sentinel.
pub fn rewrite_layer(layer: &Layer) -> Result<Layer, LayerError> {
    match layer {
        Layer::Materialized(layer) => Ok(Layer::Materialized(layer.rewrite_noop())),
        Layer::Blockwise(layer) => Ok(Layer::Blockwise(layer.rewrite_noop()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Key;
    use crate::task::{Op, Task};
    use serde_json::json;

    #[test]
    fn test_rewrite_materialized_keeps_annotations() {
        let mut graph = Graph::new();
        graph.insert("x", Task::call("load", [Task::literal("data.csv")]));

        let annotations = Annotations::from([("workers".to_string(), json!(["w1"]))]);
        let layer = Layer::from(MaterializedLayer::with_annotations(graph, annotations.clone()));

        let rewritten = rewrite_layer(&layer).unwrap();

        assert_eq!(rewritten.kind(), "materialized");
        assert_eq!(rewritten.annotations(), &annotations);
        assert_eq!(
            rewritten.materialize().unwrap().get(&Key::name("x")),
            Some(&Task::call(Op::Noop, [Task::literal("data.csv")]))
        );
    }

    #[test]
    fn test_rewrite_blockwise_dispatch() {
        let mut template = Graph::new();
        template.insert("out", Task::call("neg", [Task::reference("_0")]));

        let layer = Layer::from(
            Blockwise::builder("out", ["i"], template)
                .input("A", ["i"])
                .numblocks("A", [4])
                .concatenate(Concatenate::On)
                .annotation("fuse", false)
                .build()
                .unwrap(),
        );

        let rewritten = rewrite_layer(&layer).unwrap();

        let Layer::Blockwise(blockwise) = &rewritten else {
            panic!("expected a blockwise layer");
        };
        assert!(matches!(blockwise.concatenate(), Concatenate::Suppressed(_)));
        assert_eq!(rewritten.annotations(), layer.annotations());
        assert!(rewritten.materialize().unwrap().is_inert());
        assert_eq!(
            rewritten.materialize().unwrap().dependencies(),
            layer.materialize().unwrap().dependencies()
        );
    }

    #[test]
    fn test_json_unsupported_kind() {
        let err = Layer::from_json(&json!({"kind": "shuffle", "npartitions": 8})).unwrap_err();
        assert!(matches!(err, LayerError::UnsupportedLayerKind(ref kind) if kind == "shuffle"));

        let err = Layer::from_json(&json!({"graph": []})).unwrap_err();
        assert!(matches!(err, LayerError::UnsupportedLayerKind(_)));
    }

    #[test]
    fn test_json_materialized() {
        let layer = Layer::from_json(&json!({
            "kind": "materialized",
            "graph": {"x": {"op": "inc", "args": [1]}},
            "annotations": {"priority": 10}
        }))
        .unwrap();

        assert_eq!(layer.annotations()["priority"], json!(10));
        assert_eq!(Layer::from_json(&layer.to_json()).unwrap(), layer);
    }

    #[test]
    fn test_json_malformed_task() {
        let err = Layer::from_json(&json!({
            "kind": "materialized",
            "graph": {"x": {"op": ["inc"]}}
        }))
        .unwrap_err();

        assert!(matches!(err, LayerError::MalformedTask(ref key, _) if key == &Key::name("x")));
    }
}
