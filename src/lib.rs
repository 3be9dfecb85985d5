#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod delayed;
mod error;
mod graph;
mod hlg;
pub mod layer;
mod rewrite;
mod task;
#[cfg(feature = "logging")]
mod utils;

pub use crate::core::{ArcStr, Hash32, Key};
pub use crate::delayed::{Delayed, Lazy};
pub use crate::error::*;
pub use crate::graph::{Graph, rewrite_graph};
pub use crate::hlg::HighLevelGraph;
pub use crate::layer::{Layer, rewrite_layer};
pub use crate::rewrite::Rewriter;
pub use crate::task::{NOOP, Op, Task, Walk, rewrite_task};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

/// A [`Delayed`] with the same graph structure as `obj`, where every
/// operation is replaced with a no-op.
///
/// The result shares nothing with `obj`: every layer is rebuilt, and the
/// output key and the dependencies between keys stay exactly as they were.
/// Running it measures what the scheduler costs on its own.
pub fn as_noop<L>(obj: &L) -> Result<Delayed, GraphError>
where
    L: Lazy + ?Sized,
{
    Rewriter::default().rewrite(obj)
}
