use std::collections::BTreeMap;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::core::ArcStr;
use crate::delayed::{Delayed, Lazy};
use crate::error::GraphError;
use crate::hlg::HighLevelGraph;
use crate::layer::{Layer, rewrite_layer};

/// Turns graphs into no-op graphs of the same shape.
///
/// # Example
///
/// ```rust
/// use noopgraph::{Delayed, Graph, HighLevelGraph, Rewriter, Task};
///
/// let mut graph = Graph::new();
/// graph.insert("x", Task::call("add", [Task::literal(1), Task::literal(2)]));
///
/// let handle = Delayed::new("x", HighLevelGraph::from_layer("x", graph));
/// let noop = Rewriter::new().parallel(false).rewrite(&handle)?;
///
/// assert_eq!(noop.key(), handle.key());
/// # Ok::<(), noopgraph::GraphError>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Rewriter {
    parallel: bool,
}

impl Rewriter {
    pub fn new() -> Self {
        Self { parallel: true }
    }

    /// Rewrite layers on the rayon thread pool. Enabled by default.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Rewrites every layer of `graph`, keeping layer names and the
    /// dependency table. Fails as a whole if any layer fails.
    pub fn rewrite_graph(&self, graph: &HighLevelGraph) -> Result<HighLevelGraph, GraphError> {
        let span = tracing::info_span!("rewrite_noop", layers = graph.layers().len());
        let _enter = span.enter();

        let rewrite = |(name, layer): (&ArcStr, &Layer)| {
            let _span = tracing::debug_span!(
                parent: &span,
                "rewrite_layer",
                layer = %name,
                kind = layer.kind()
            )
            .entered();

            rewrite_layer(layer)
                .map(|layer| (name.clone(), layer))
                .map_err(|err| GraphError::Layer(name.clone(), err))
        };

        let layers: BTreeMap<ArcStr, Layer> = if self.parallel {
            graph.layers().par_iter().map(rewrite).collect::<Result<_, _>>()?
        } else {
            graph.layers().iter().map(rewrite).collect::<Result<_, _>>()?
        };

        tracing::info!("rewrote {} layers", layers.len());

        Ok(graph.with_layers(layers))
    }

    /// A new handle with the same output key whose graph does no work.
    pub fn rewrite<L>(&self, obj: &L) -> Result<Delayed, GraphError>
    where
        L: Lazy + ?Sized,
    {
        let graph = self.rewrite_graph(obj.graph())?;
        Ok(Delayed::new(obj.key().clone(), graph))
    }
}

impl Default for Rewriter {
    fn default() -> Self {
        Self::new()
    }
}
