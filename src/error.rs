use serde_json::Value;
use thiserror::Error;

use crate::core::{ArcStr, Key};

/// A task description that doesn't follow the task grammar.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Operation symbol must be a string, found {0}")]
    InvalidOp(Value),

    #[error("Call arguments must be an array, found {0}")]
    InvalidArgs(Value),

    #[error("Invalid key {0}")]
    InvalidKey(Value),
}

#[derive(Debug, Error)]
pub enum BlockwiseError {
    #[error("Template has no entry for output '{0}'")]
    MissingTemplate(ArcStr),

    #[error("Template references input {0}, but only {1} inputs are declared")]
    UnknownPlaceholder(usize, usize),

    #[error("Input '{0}' has no block counts")]
    MissingNumblocks(ArcStr),

    #[error("Input '{0}' is indexed by {1} labels but has {2} block counts")]
    RankMismatch(ArcStr, usize, usize),

    #[error("Index '{0}' has inconsistent block counts ({1} and {2})")]
    InconsistentBlocks(ArcStr, usize, usize),

    #[error("Output index '{0}' doesn't appear in any input or new axis")]
    UnknownOutputIndex(ArcStr),

    #[error("I/O input '{0}' has no block {1:?}")]
    MissingIoBlock(ArcStr, Vec<usize>),

    #[error("Template entry {0} depends on itself")]
    TemplateCycle(Key),

    #[error("Invalid concatenation setting {0}")]
    InvalidConcatenate(Value),

    #[error("No concatenation sentinels left")]
    SentinelsExhausted,
}

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("Unsupported layer kind '{0}'")]
    UnsupportedLayerKind(String),

    #[error("Task {0}:\n{1}")]
    MalformedTask(Key, TaskError),

    #[error("Malformed graph entry {0}")]
    MalformedEntry(Value),

    #[error(transparent)]
    Blockwise(#[from] BlockwiseError),

    #[error("Couldn't decode layer.\n{0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Layer '{0}':\n{1}")]
    Layer(ArcStr, LayerError),

    #[error("Layer '{0}' depends on unknown layer '{1}'")]
    UnknownDependency(ArcStr, ArcStr),

    #[error("Dependencies listed for unknown layer '{0}'")]
    UnknownLayer(ArcStr),

    #[error("Output key:\n{0}")]
    OutputKey(TaskError),

    #[error("Couldn't decode graph.\n{0}")]
    Json(#[from] serde_json::Error),
}
