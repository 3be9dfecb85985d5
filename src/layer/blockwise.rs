//! Templated block-parallel layers.
//!
//! A [`Blockwise`] layer doesn't enumerate its tasks. It stores one template
//! task, keyed by the output name, together with enough shape information to
//! stamp that template out once per output block. The template refers to its
//! inputs through placeholder keys `_0`, `_1`, ..., one for each entry of the
//! input declarations.
//!
//! ```text
//! output_indices  = (i, j)
//! template        = { "out": (matmul, _0, _1) }
//! indices         = [("A", (i, k)), ("B", (k, j))]
//! numblocks       = { "A": (2, 3), "B": (3, 2) }
//! ```
//!
//! Label `k` is absent from the output, so it is contracted: block
//! `("out", 0, 1)` receives the lists `[("A", 0, 0), ("A", 0, 1), ("A", 0, 2)]`
//! and `[("B", 0, 1), ("B", 1, 1), ("B", 2, 1)]`. When concatenation is on,
//! each list is wrapped in a `concatenate_axes` call first.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::{Value, json};

use crate::core::{ArcStr, Key};
use crate::error::{BlockwiseError, LayerError};
use crate::graph::{Graph, rewrite_graph};
use crate::layer::Annotations;
use crate::task::Task;

/// Operation inserted around contracted inputs when concatenation is on.
pub const CONCATENATE_AXES: &str = "concatenate_axes";

/// Placeholder key under which the template refers to the `i`-th input.
pub fn blockwise_token(i: usize) -> Key {
    Key::name(format!("_{i}"))
}

fn placeholder(key: &Key) -> Option<usize> {
    match key {
        Key::Name(name) => name.strip_prefix('_')?.parse().ok(),
        Key::Block(..) => None,
    }
}

/// One input of a blockwise layer.
#[derive(Clone, Debug, PartialEq)]
pub enum BlockwiseArg {
    /// Blocks of the collection `name`, indexed by the given labels.
    Blocked { name: ArcStr, indices: Vec<ArcStr> },
    /// A task passed verbatim to every block.
    Plain(Task),
}

impl BlockwiseArg {
    fn to_json(&self) -> Value {
        match self {
            BlockwiseArg::Blocked { name, indices } => json!({
                "name": &**name,
                "indices": indices.iter().map(|label| &**label).collect::<Vec<_>>(),
            }),
            BlockwiseArg::Plain(task) => json!({ "value": task.to_json() }),
        }
    }
}

/// Blocks read straight from external storage instead of being computed.
/// Each block is an opaque value, e.g. a file path or a byte range.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IoDep {
    numblocks: Vec<usize>,
    blocks: BTreeMap<Vec<usize>, Value>,
}

impl IoDep {
    pub fn new(numblocks: impl IntoIterator<Item = usize>) -> Self {
        Self {
            numblocks: numblocks.into_iter().collect(),
            blocks: BTreeMap::new(),
        }
    }

    pub fn with_block(mut self, index: impl Into<Vec<usize>>, value: impl Into<Value>) -> Self {
        self.blocks.insert(index.into(), value.into());
        self
    }

    pub fn numblocks(&self) -> &[usize] {
        &self.numblocks
    }

    pub fn block(&self, index: &[usize]) -> Option<&Value> {
        self.blocks.get(index)
    }
}

static NEXT_SENTINEL: AtomicU64 = AtomicU64::new(1);

/// Process-unique marker for a suppressed concatenation setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Sentinel(u64);

impl Sentinel {
    // The counter never wraps, once it reaches `u64::MAX` no id is left.
    fn next() -> Result<Self, BlockwiseError> {
        NEXT_SENTINEL
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map(Sentinel)
            .map_err(|_| BlockwiseError::SentinelsExhausted)
    }

    // Decoded sentinels keep their identity, fresh ones must never reuse it.
    // `id` is below `u64::MAX`, see `Concatenate::from_json`.
    fn restore(id: u64) -> Self {
        NEXT_SENTINEL.fetch_max(id + 1, Ordering::Relaxed);
        Sentinel(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Whether the blocks of contracted inputs get concatenated before they are
/// handed to the template.
///
/// Only [`Concatenate::On`] is truthy. Layer fusion compares these values
/// for equality, so `Default` and `Off` are kept apart, and every
/// `Suppressed` value differs from all others.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Concatenate {
    /// Not set.
    #[default]
    Default,
    Off,
    On,
    /// Was `On` before the layer was rewritten to no-ops.
    Suppressed(Sentinel),
}

impl Concatenate {
    pub fn is_enabled(self) -> bool {
        matches!(self, Concatenate::On)
    }

    /// A fresh falsey setting that compares unequal to every other setting.
    pub fn suppressed() -> Result<Self, BlockwiseError> {
        Sentinel::next().map(Concatenate::Suppressed)
    }

    fn from_json(value: &Value) -> Result<Self, BlockwiseError> {
        match value {
            Value::Null => Ok(Concatenate::Default),
            Value::Bool(false) => Ok(Concatenate::Off),
            Value::Bool(true) => Ok(Concatenate::On),
            _ => value
                .get("suppressed")
                .and_then(Value::as_u64)
                .filter(|&id| id < u64::MAX)
                .map(|id| Concatenate::Suppressed(Sentinel::restore(id)))
                .ok_or_else(|| BlockwiseError::InvalidConcatenate(value.clone())),
        }
    }

    fn to_json(self) -> Value {
        match self {
            Concatenate::Default => Value::Null,
            Concatenate::Off => Value::Bool(false),
            Concatenate::On => Value::Bool(true),
            Concatenate::Suppressed(sentinel) => json!({ "suppressed": sentinel.id() }),
        }
    }
}

/// A templated block-parallel layer. Build one with [`Blockwise::builder`].
#[derive(Clone, Debug, PartialEq)]
pub struct Blockwise {
    output: ArcStr,
    output_indices: Vec<ArcStr>,
    template: Graph,
    indices: Vec<BlockwiseArg>,
    numblocks: BTreeMap<ArcStr, Vec<usize>>,
    concatenate: Concatenate,
    new_axes: BTreeMap<ArcStr, usize>,
    output_blocks: Option<BTreeSet<Vec<usize>>>,
    annotations: Annotations,
    io_deps: BTreeMap<ArcStr, IoDep>,
}

impl Blockwise {
    pub fn builder<L>(
        output: impl Into<ArcStr>,
        output_indices: impl IntoIterator<Item = L>,
        template: Graph,
    ) -> BlockwiseBuilder
    where
        L: Into<ArcStr>,
    {
        BlockwiseBuilder {
            output: output.into(),
            output_indices: output_indices.into_iter().map(Into::into).collect(),
            template,
            indices: Vec::new(),
            numblocks: BTreeMap::new(),
            concatenate: Concatenate::Default,
            new_axes: BTreeMap::new(),
            output_blocks: None,
            annotations: Annotations::new(),
            io_deps: BTreeMap::new(),
        }
    }

    pub fn output(&self) -> &ArcStr {
        &self.output
    }

    pub fn output_indices(&self) -> &[ArcStr] {
        &self.output_indices
    }

    pub fn template(&self) -> &Graph {
        &self.template
    }

    pub fn indices(&self) -> &[BlockwiseArg] {
        &self.indices
    }

    pub fn numblocks(&self) -> &BTreeMap<ArcStr, Vec<usize>> {
        &self.numblocks
    }

    pub fn concatenate(&self) -> Concatenate {
        self.concatenate
    }

    pub fn new_axes(&self) -> &BTreeMap<ArcStr, usize> {
        &self.new_axes
    }

    pub fn output_blocks(&self) -> Option<&BTreeSet<Vec<usize>>> {
        self.output_blocks.as_ref()
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn io_deps(&self) -> &BTreeMap<ArcStr, IoDep> {
        &self.io_deps
    }

    /// A new layer with the same instantiation pattern and a no-op template.
    ///
    /// A truthy concatenation setting becomes a fresh [`Sentinel`]: the
    /// materialized blocks get no `concatenate_axes` call, and the layer
    /// can't be fused with any layer it couldn't be fused with before.
    pub(crate) fn rewrite_noop(&self) -> Result<Self, BlockwiseError> {
        let concatenate = if self.concatenate.is_enabled() {
            let suppressed = Concatenate::suppressed()?;
            tracing::debug!(output = %self.output, ?suppressed, "suppressing concatenation");
            suppressed
        } else {
            self.concatenate
        };

        BlockwiseBuilder {
            output: self.output.clone(),
            output_indices: self.output_indices.clone(),
            template: rewrite_graph(&self.template),
            indices: self.indices.clone(),
            numblocks: self.numblocks.clone(),
            concatenate,
            new_axes: self.new_axes.clone(),
            output_blocks: self.output_blocks.clone(),
            annotations: self.annotations.clone(),
            io_deps: self.io_deps.clone(),
        }
        .build()
    }

    /// Block counts of an input, from the block table or its I/O declaration.
    fn block_counts(&self, name: &ArcStr) -> Result<&[usize], BlockwiseError> {
        self.numblocks
            .get(name)
            .map(Vec::as_slice)
            .or_else(|| self.io_deps.get(name).map(IoDep::numblocks))
            .ok_or_else(|| BlockwiseError::MissingNumblocks(name.clone()))
    }

    /// Number of blocks along every index label. A count of 1 broadcasts.
    fn dims(&self) -> Result<BTreeMap<ArcStr, usize>, BlockwiseError> {
        let mut dims = BTreeMap::new();

        for arg in &self.indices {
            let BlockwiseArg::Blocked { name, indices } = arg else {
                continue;
            };

            for (label, &count) in indices.iter().zip(self.block_counts(name)?) {
                match dims.entry(label.clone()) {
                    Entry::Vacant(entry) => {
                        entry.insert(count);
                    }
                    Entry::Occupied(mut entry) => {
                        let current = *entry.get();
                        if current == 1 {
                            entry.insert(count);
                        } else if count != 1 && count != current {
                            return Err(BlockwiseError::InconsistentBlocks(
                                label.clone(),
                                current,
                                count,
                            ));
                        }
                    }
                }
            }
        }

        for label in self.new_axes.keys() {
            dims.entry(label.clone()).or_insert(1);
        }

        Ok(dims)
    }

    /// Expands the layer into one task per output block.
    pub fn materialize(&self) -> Result<Graph, BlockwiseError> {
        let dims = self.dims()?;
        let shape = self
            .output_indices
            .iter()
            .map(|label| {
                dims.get(label)
                    .copied()
                    .ok_or_else(|| BlockwiseError::UnknownOutputIndex(label.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let template = self.resolve(
            &Key::Name(self.output.clone()),
            &mut Vec::new(),
            &mut BTreeMap::new(),
        )?;

        let mut graph = Graph::new();

        for coords in grid(&shape) {
            if let Some(selection) = &self.output_blocks
                && !selection.contains(&coords)
            {
                continue;
            }

            let bound: BTreeMap<&ArcStr, usize> =
                self.output_indices.iter().zip(coords.iter().copied()).collect();

            let args = self
                .indices
                .iter()
                .map(|arg| self.argument(arg, &bound, &dims))
                .collect::<Result<Vec<_>, _>>()?;

            let task = template.substitute(|key| placeholder(key).and_then(|i| args.get(i).cloned()));
            graph.insert(Key::block(self.output.clone(), coords), task);
        }

        Ok(graph)
    }

    /// The template entry under `key` with every other template entry it
    /// refers to inlined.
    fn resolve(
        &self,
        key: &Key,
        active: &mut Vec<Key>,
        resolved: &mut BTreeMap<Key, Task>,
    ) -> Result<Task, BlockwiseError> {
        if let Some(task) = resolved.get(key) {
            return Ok(task.clone());
        }
        if active.contains(key) {
            return Err(BlockwiseError::TemplateCycle(key.clone()));
        }
        let Some(task) = self.template.get(key) else {
            return Err(BlockwiseError::MissingTemplate(self.output.clone()));
        };

        active.push(key.clone());
        let mut inlined = BTreeMap::new();
        for dependency in task.dependencies() {
            if placeholder(&dependency).is_none() && self.template.contains_key(&dependency) {
                let task = self.resolve(&dependency, active, resolved)?;
                inlined.insert(dependency, task);
            }
        }
        active.pop();

        let task = task.substitute(|key| inlined.get(key).cloned());
        resolved.insert(key.clone(), task.clone());
        Ok(task)
    }

    /// The value one input contributes to the output block bound in `bound`.
    fn argument(
        &self,
        arg: &BlockwiseArg,
        bound: &BTreeMap<&ArcStr, usize>,
        dims: &BTreeMap<ArcStr, usize>,
    ) -> Result<Task, BlockwiseError> {
        let (name, indices) = match arg {
            BlockwiseArg::Plain(task) => return Ok(task.clone()),
            BlockwiseArg::Blocked { name, indices } => (name, indices),
        };

        let counts = self.block_counts(name)?;
        let contracted: Vec<(usize, usize)> = indices
            .iter()
            .enumerate()
            .filter(|(_, label)| !bound.contains_key(label))
            .map(|(dim, label)| (dim, dims.get(label).copied().unwrap_or(counts[dim])))
            .collect();

        let mut coords: Vec<usize> = indices
            .iter()
            .zip(counts)
            .map(|(label, &count)| match count {
                1 => 0,
                _ => bound.get(label).copied().unwrap_or(0),
            })
            .collect();

        let task = self.contracted(name, counts, &contracted, &mut coords)?;

        if !contracted.is_empty() && self.concatenate.is_enabled() {
            let axes = contracted.iter().map(|&(dim, _)| Value::from(dim)).collect();
            return Ok(Task::call(
                CONCATENATE_AXES,
                [task, Task::Literal(Value::Array(axes))],
            ));
        }

        Ok(task)
    }

    /// Nested sequences over every contracted `(dimension, size)`, in order.
    /// The size is the label's size across all inputs, so an input with a
    /// single block along a contracted label repeats that block.
    fn contracted(
        &self,
        name: &ArcStr,
        counts: &[usize],
        contracted: &[(usize, usize)],
        coords: &mut [usize],
    ) -> Result<Task, BlockwiseError> {
        let Some((&(dim, size), rest)) = contracted.split_first() else {
            return self.block(name, coords);
        };

        let items = (0..size)
            .map(|i| {
                coords[dim] = if counts[dim] == 1 { 0 } else { i };
                self.contracted(name, counts, rest, coords)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Task::Seq(items))
    }

    fn block(&self, name: &ArcStr, coords: &[usize]) -> Result<Task, BlockwiseError> {
        match self.io_deps.get(name) {
            Some(dep) => dep
                .block(coords)
                .cloned()
                .map(Task::Literal)
                .ok_or_else(|| BlockwiseError::MissingIoBlock(name.clone(), coords.to_vec())),
            None => Ok(Task::Ref(Key::block(name.clone(), coords))),
        }
    }

    pub(crate) fn from_json(value: &Value) -> Result<Self, LayerError> {
        let raw = RawBlockwise::deserialize(value)?;
        let output: ArcStr = raw.output.into();

        let indices = raw
            .indices
            .into_iter()
            .map(|arg| match arg {
                RawArg::Blocked { name, indices } => Ok(BlockwiseArg::Blocked {
                    name: name.into(),
                    indices: indices.into_iter().map(Into::into).collect(),
                }),
                RawArg::Plain { value } => Task::from_json(&value)
                    .map(BlockwiseArg::Plain)
                    .map_err(|err| LayerError::MalformedTask(Key::Name(output.clone()), err)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let io_deps = raw
            .io_deps
            .into_iter()
            .map(|(name, dep)| {
                let dep = IoDep {
                    numblocks: dep.numblocks,
                    blocks: dep.blocks.into_iter().collect(),
                };
                (ArcStr::from(name), dep)
            })
            .collect();

        let layer = BlockwiseBuilder {
            output: output.clone(),
            output_indices: raw.output_indices.into_iter().map(Into::into).collect(),
            template: Graph::from_json(&raw.template)?,
            indices,
            numblocks: raw
                .numblocks
                .into_iter()
                .map(|(name, counts)| (name.into(), counts))
                .collect(),
            concatenate: Concatenate::from_json(&raw.concatenate)?,
            new_axes: raw
                .new_axes
                .into_iter()
                .map(|(label, size)| (label.into(), size))
                .collect(),
            output_blocks: raw.output_blocks.map(|blocks| blocks.into_iter().collect()),
            annotations: raw.annotations,
            io_deps,
        }
        .build()?;

        Ok(layer)
    }

    pub(crate) fn to_json(&self) -> Value {
        let labels = |labels: &[ArcStr]| labels.iter().map(|l| l.to_string()).collect::<Vec<_>>();

        json!({
            "kind": "blockwise",
            "output": &*self.output,
            "output_indices": labels(&self.output_indices),
            "template": self.template.to_json(),
            "indices": self.indices.iter().map(BlockwiseArg::to_json).collect::<Vec<_>>(),
            "numblocks": self
                .numblocks
                .iter()
                .map(|(name, counts)| (name.to_string(), counts))
                .collect::<BTreeMap<_, _>>(),
            "concatenate": self.concatenate.to_json(),
            "new_axes": self
                .new_axes
                .iter()
                .map(|(label, size)| (label.to_string(), size))
                .collect::<BTreeMap<_, _>>(),
            "output_blocks": self.output_blocks,
            "annotations": self.annotations,
            "io_deps": self
                .io_deps
                .iter()
                .map(|(name, dep)| {
                    let blocks = dep.blocks.iter().collect::<Vec<_>>();
                    (name.to_string(), json!({ "numblocks": dep.numblocks, "blocks": blocks }))
                })
                .collect::<BTreeMap<_, _>>(),
        })
    }
}

/// Every coordinate of a block grid, in row-major order.
fn grid(shape: &[usize]) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    if shape.contains(&0) {
        return out;
    }

    let mut coords = vec![0; shape.len()];
    loop {
        out.push(coords.clone());

        let mut dim = shape.len();
        loop {
            if dim == 0 {
                return out;
            }
            dim -= 1;
            coords[dim] += 1;
            if coords[dim] < shape[dim] {
                break;
            }
            coords[dim] = 0;
        }
    }
}

/// Builder for [`Blockwise`] layers. Nothing is validated until
/// [`BlockwiseBuilder::build`].
#[derive(Debug)]
pub struct BlockwiseBuilder {
    output: ArcStr,
    output_indices: Vec<ArcStr>,
    template: Graph,
    indices: Vec<BlockwiseArg>,
    numblocks: BTreeMap<ArcStr, Vec<usize>>,
    concatenate: Concatenate,
    new_axes: BTreeMap<ArcStr, usize>,
    output_blocks: Option<BTreeSet<Vec<usize>>>,
    annotations: Annotations,
    io_deps: BTreeMap<ArcStr, IoDep>,
}

impl BlockwiseBuilder {
    /// Adds an input made of the blocks of `name`, indexed by `indices`.
    pub fn input<L>(mut self, name: impl Into<ArcStr>, indices: impl IntoIterator<Item = L>) -> Self
    where
        L: Into<ArcStr>,
    {
        self.indices.push(BlockwiseArg::Blocked {
            name: name.into(),
            indices: indices.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Adds an input passed as is to every block.
    pub fn plain(mut self, task: Task) -> Self {
        self.indices.push(BlockwiseArg::Plain(task));
        self
    }

    pub fn numblocks(mut self, name: impl Into<ArcStr>, counts: impl IntoIterator<Item = usize>) -> Self {
        self.numblocks.insert(name.into(), counts.into_iter().collect());
        self
    }

    pub fn concatenate(mut self, concatenate: Concatenate) -> Self {
        self.concatenate = concatenate;
        self
    }

    pub fn new_axis(mut self, label: impl Into<ArcStr>, size: usize) -> Self {
        self.new_axes.insert(label.into(), size);
        self
    }

    /// Restricts the layer to the listed output blocks.
    pub fn output_blocks(mut self, blocks: impl IntoIterator<Item = Vec<usize>>) -> Self {
        self.output_blocks = Some(blocks.into_iter().collect());
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn io_dep(mut self, name: impl Into<ArcStr>, dep: IoDep) -> Self {
        self.io_deps.insert(name.into(), dep);
        self
    }

    pub fn build(self) -> Result<Blockwise, BlockwiseError> {
        if !self.template.contains_key(&Key::Name(self.output.clone())) {
            return Err(BlockwiseError::MissingTemplate(self.output));
        }

        for (_, task) in &self.template {
            for key in task.dependencies() {
                if let Some(i) = placeholder(&key)
                    && i >= self.indices.len()
                {
                    return Err(BlockwiseError::UnknownPlaceholder(i, self.indices.len()));
                }
            }
        }

        for arg in &self.indices {
            let BlockwiseArg::Blocked { name, indices } = arg else {
                continue;
            };

            let counts = self
                .numblocks
                .get(name)
                .map(Vec::len)
                .or_else(|| self.io_deps.get(name).map(|dep| dep.numblocks.len()))
                .ok_or_else(|| BlockwiseError::MissingNumblocks(name.clone()))?;

            if counts != indices.len() {
                return Err(BlockwiseError::RankMismatch(
                    name.clone(),
                    indices.len(),
                    counts,
                ));
            }
        }

        Ok(Blockwise {
            output: self.output,
            output_indices: self.output_indices,
            template: self.template,
            indices: self.indices,
            numblocks: self.numblocks,
            concatenate: self.concatenate,
            new_axes: self.new_axes,
            output_blocks: self.output_blocks,
            annotations: self.annotations,
            io_deps: self.io_deps,
        })
    }
}

#[derive(Deserialize)]
struct RawBlockwise {
    output: String,
    output_indices: Vec<String>,
    template: Value,
    #[serde(default)]
    indices: Vec<RawArg>,
    #[serde(default)]
    numblocks: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    concatenate: Value,
    #[serde(default)]
    new_axes: BTreeMap<String, usize>,
    #[serde(default)]
    output_blocks: Option<Vec<Vec<usize>>>,
    #[serde(default)]
    annotations: Annotations,
    #[serde(default)]
    io_deps: BTreeMap<String, RawIoDep>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawArg {
    Blocked { name: String, indices: Vec<String> },
    Plain { value: Value },
}

#[derive(Deserialize)]
struct RawIoDep {
    numblocks: Vec<usize>,
    #[serde(default)]
    blocks: Vec<(Vec<usize>, Value)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Op;
    use serde_json::json;

    fn template(op: &str) -> Graph {
        let mut template = Graph::new();
        template.insert(
            "out",
            Task::call(op, [Task::reference("_0"), Task::reference("_1")]),
        );
        template
    }

    /// `out[i, j] = matmul(A[i, k], B[k, j])`, contracted over `k`.
    fn matmul(concatenate: Concatenate) -> Blockwise {
        Blockwise::builder("out", ["i", "j"], template("matmul"))
            .input("A", ["i", "k"])
            .input("B", ["k", "j"])
            .numblocks("A", [2, 3])
            .numblocks("B", [3, 2])
            .concatenate(concatenate)
            .build()
            .unwrap()
    }

    /// `out[i, j] = matmul(A[i, j], B[i, j])` over a 4x4 block grid.
    fn elementwise(concatenate: Concatenate) -> Blockwise {
        Blockwise::builder("out", ["i", "j"], template("matmul"))
            .input("A", ["i", "j"])
            .input("B", ["i", "j"])
            .numblocks("A", [4, 4])
            .numblocks("B", [4, 4])
            .concatenate(concatenate)
            .build()
            .unwrap()
    }

    fn a(i: usize, k: usize) -> Task {
        Task::reference(Key::block("A", vec![i, k]))
    }

    fn b(k: usize, j: usize) -> Task {
        Task::reference(Key::block("B", vec![k, j]))
    }

    #[test]
    fn test_rewrite_replaces_template() {
        let layer = elementwise(Concatenate::On);
        let rewritten = layer.rewrite_noop().unwrap();

        assert_eq!(
            rewritten.template().get(&Key::name("out")),
            Some(&Task::call(
                Op::Noop,
                [Task::reference("_0"), Task::reference("_1")]
            ))
        );
        assert_eq!(rewritten.numblocks(), layer.numblocks());
        assert_eq!(rewritten.indices(), layer.indices());
        assert_eq!(rewritten.output(), layer.output());
        assert_eq!(rewritten.output_indices(), layer.output_indices());
    }

    #[test]
    fn test_rewrite_suppresses_concatenation() {
        let first = elementwise(Concatenate::On).rewrite_noop().unwrap();
        let second = elementwise(Concatenate::On).rewrite_noop().unwrap();

        for rewritten in [&first, &second] {
            assert!(!rewritten.concatenate().is_enabled());
            assert!(matches!(rewritten.concatenate(), Concatenate::Suppressed(_)));
            assert_ne!(rewritten.concatenate(), Concatenate::On);
            assert_ne!(rewritten.concatenate(), Concatenate::Off);
            assert_ne!(rewritten.concatenate(), Concatenate::Default);
        }

        assert_ne!(first.concatenate(), second.concatenate());
    }

    #[test]
    fn test_rewrite_keeps_falsey_concatenation() {
        let off = elementwise(Concatenate::Off).rewrite_noop().unwrap();
        let unset = elementwise(Concatenate::Default).rewrite_noop().unwrap();
        let on = elementwise(Concatenate::On).rewrite_noop().unwrap();

        assert_eq!(off.concatenate(), Concatenate::Off);
        assert_eq!(unset.concatenate(), Concatenate::Default);
        assert_ne!(on.concatenate(), off.concatenate());
        assert_ne!(on.concatenate(), unset.concatenate());
    }

    #[test]
    fn test_rewrite_preserves_fields() {
        let layer = Blockwise::builder("out", ["i", "n"], template("load"))
            .input("files", ["i"])
            .plain(Task::literal("csv"))
            .io_dep(
                "files",
                IoDep::new([2])
                    .with_block([0], "a.csv")
                    .with_block([1], "b.csv"),
            )
            .new_axis("n", 5)
            .output_blocks([vec![1, 0]])
            .annotation("retries", 3)
            .annotation("resources", json!({"GPU": 1}))
            .build()
            .unwrap();

        let rewritten = layer.rewrite_noop().unwrap();

        assert_eq!(rewritten.indices(), layer.indices());
        assert_eq!(rewritten.new_axes(), layer.new_axes());
        assert_eq!(rewritten.output_blocks(), layer.output_blocks());
        assert_eq!(rewritten.annotations(), layer.annotations());
        assert_eq!(rewritten.io_deps(), layer.io_deps());
        assert_eq!(rewritten.concatenate(), layer.concatenate());
        assert_eq!(rewritten.template().fingerprint(), layer.template().fingerprint());
        assert!(rewritten.template().is_inert());
    }

    #[test]
    fn test_materialize_contraction() {
        let graph = matmul(Concatenate::Off).materialize().unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(
            graph.get(&Key::block("out", vec![0, 1])),
            Some(&Task::call(
                "matmul",
                [
                    Task::seq([a(0, 0), a(0, 1), a(0, 2)]),
                    Task::seq([b(0, 1), b(1, 1), b(2, 1)]),
                ]
            ))
        );
    }

    #[test]
    fn test_materialize_concatenation() {
        let graph = matmul(Concatenate::On).materialize().unwrap();

        assert_eq!(
            graph.get(&Key::block("out", vec![1, 0])),
            Some(&Task::call(
                "matmul",
                [
                    Task::call(
                        CONCATENATE_AXES,
                        [Task::seq([a(1, 0), a(1, 1), a(1, 2)]), Task::literal(json!([1]))]
                    ),
                    Task::call(
                        CONCATENATE_AXES,
                        [Task::seq([b(0, 0), b(1, 0), b(2, 0)]), Task::literal(json!([0]))]
                    ),
                ]
            ))
        );
    }

    #[test]
    fn test_materialize_rewritten_has_no_concatenation() {
        let layer = matmul(Concatenate::On);
        let original = layer.materialize().unwrap();
        let rewritten = layer.rewrite_noop().unwrap().materialize().unwrap();

        assert!(rewritten.is_inert());
        assert_eq!(rewritten.dependencies(), original.dependencies());
        assert!(rewritten.iter().all(|(_, task)| task.walk().all(|task| match task {
            Task::Call(op, _) => op.as_str() != CONCATENATE_AXES,
            _ => true,
        })));
    }

    #[test]
    fn test_materialize_broadcast() {
        let layer = Blockwise::builder("out", ["i", "j"], template("add"))
            .input("A", ["i", "j"])
            .input("B", ["i", "j"])
            .numblocks("A", [2, 1])
            .numblocks("B", [2, 3])
            .build()
            .unwrap();

        let graph = layer.materialize().unwrap();

        assert_eq!(graph.len(), 6);
        assert_eq!(
            graph.get(&Key::block("out", vec![1, 2])),
            Some(&Task::call("add", [a(1, 0), b(1, 2)]))
        );
    }

    #[test]
    fn test_materialize_broadcast_contraction() {
        let layer = Blockwise::builder("out", ["i"], template("matmul"))
            .input("A", ["i", "k"])
            .input("B", ["k"])
            .numblocks("A", [2, 1])
            .numblocks("B", [3])
            .build()
            .unwrap();

        let graph = layer.materialize().unwrap();
        let bk = |k: usize| Task::reference(Key::block("B", vec![k]));

        assert_eq!(graph.len(), 2);
        assert_eq!(
            graph.get(&Key::block("out", vec![1])),
            Some(&Task::call(
                "matmul",
                [
                    Task::seq([a(1, 0), a(1, 0), a(1, 0)]),
                    Task::seq([bk(0), bk(1), bk(2)]),
                ]
            ))
        );
    }

    #[test]
    fn test_materialize_io_deps() {
        let mut template = Graph::new();
        template.insert("out", Task::call("read", [Task::reference("_0")]));

        let layer = Blockwise::builder("out", ["i"], template)
            .input("files", ["i"])
            .io_dep(
                "files",
                IoDep::new([2])
                    .with_block([0], "a.csv")
                    .with_block([1], "b.csv"),
            )
            .build()
            .unwrap();

        let graph = layer.materialize().unwrap();

        assert_eq!(
            graph.get(&Key::block("out", vec![1])),
            Some(&Task::call("read", [Task::literal("b.csv")]))
        );
        assert!(graph.dependencies().values().all(|deps| deps.is_empty()));
    }

    #[test]
    fn test_materialize_missing_io_block() {
        let mut template = Graph::new();
        template.insert("out", Task::call("read", [Task::reference("_0")]));

        let layer = Blockwise::builder("out", ["i"], template)
            .input("files", ["i"])
            .io_dep("files", IoDep::new([2]).with_block([0], "a.csv"))
            .build()
            .unwrap();

        assert!(matches!(
            layer.materialize(),
            Err(BlockwiseError::MissingIoBlock(name, block)) if &*name == "files" && block == vec![1]
        ));
    }

    #[test]
    fn test_materialize_output_blocks_and_new_axes() {
        let layer = Blockwise::builder("out", ["i", "n"], template("stack"))
            .input("A", ["i"])
            .plain(Task::literal(0))
            .numblocks("A", [3])
            .new_axis("n", 10)
            .output_blocks([vec![0, 0], vec![2, 0]])
            .build()
            .unwrap();

        let graph = layer.materialize().unwrap();

        assert_eq!(
            graph.keys().cloned().collect::<Vec<_>>(),
            vec![Key::block("out", vec![0, 0]), Key::block("out", vec![2, 0])]
        );
        assert_eq!(
            graph.get(&Key::block("out", vec![2, 0])),
            Some(&Task::call(
                "stack",
                [Task::reference(Key::block("A", vec![2])), Task::literal(0)]
            ))
        );
    }

    #[test]
    fn test_materialize_inlines_template_entries() {
        let mut template = Graph::new();
        template.insert(
            "out",
            Task::call("sum", [Task::reference("tmp"), Task::reference("tmp")]),
        );
        template.insert("tmp", Task::call("inc", [Task::reference("_0")]));

        let layer = Blockwise::builder("out", ["i"], template)
            .input("A", ["i"])
            .numblocks("A", [1])
            .build()
            .unwrap();

        let inc = Task::call("inc", [Task::reference(Key::block("A", vec![0]))]);
        assert_eq!(
            layer.materialize().unwrap().get(&Key::block("out", vec![0])),
            Some(&Task::call("sum", [inc.clone(), inc]))
        );
    }

    #[test]
    fn test_template_cycle() {
        let mut template = Graph::new();
        template.insert("out", Task::call("f", [Task::reference("loop")]));
        template.insert("loop", Task::call("g", [Task::reference("loop")]));

        let layer = Blockwise::builder("out", Vec::<&str>::new(), template)
            .build()
            .unwrap();

        assert!(matches!(
            layer.materialize(),
            Err(BlockwiseError::TemplateCycle(key)) if key == Key::name("loop")
        ));
    }

    #[test]
    fn test_build_errors() {
        assert!(matches!(
            Blockwise::builder("other", ["i"], template("f")).build(),
            Err(BlockwiseError::MissingTemplate(_))
        ));
        assert!(matches!(
            Blockwise::builder("out", ["i"], template("f"))
                .input("A", ["i"])
                .numblocks("A", [2])
                .build(),
            Err(BlockwiseError::UnknownPlaceholder(1, 1))
        ));
        assert!(matches!(
            Blockwise::builder("out", ["i"], template("f"))
                .input("A", ["i"])
                .input("B", ["i"])
                .numblocks("A", [2])
                .build(),
            Err(BlockwiseError::MissingNumblocks(name)) if &*name == "B"
        ));
        assert!(matches!(
            Blockwise::builder("out", ["i"], template("f"))
                .input("A", ["i"])
                .input("B", ["i"])
                .numblocks("A", [2])
                .numblocks("B", [2, 2])
                .build(),
            Err(BlockwiseError::RankMismatch(_, 1, 2))
        ));
    }

    #[test]
    fn test_inconsistent_blocks() {
        let layer = Blockwise::builder("out", ["i"], template("f"))
            .input("A", ["i"])
            .input("B", ["i"])
            .numblocks("A", [2])
            .numblocks("B", [3])
            .build()
            .unwrap();

        assert!(matches!(
            layer.materialize(),
            Err(BlockwiseError::InconsistentBlocks(_, 2, 3))
        ));
    }

    #[test]
    fn test_json_keeps_sentinel() {
        let rewritten = elementwise(Concatenate::On).rewrite_noop().unwrap();
        let decoded = Blockwise::from_json(&rewritten.to_json()).unwrap();

        assert_eq!(decoded, rewritten);
        assert_ne!(Concatenate::suppressed().unwrap(), decoded.concatenate());
    }

    #[test]
    fn test_json_rejects_last_sentinel() {
        let mut value = elementwise(Concatenate::Off).to_json();
        value["concatenate"] = json!({ "suppressed": u64::MAX });

        let err = Blockwise::from_json(&value).unwrap_err();
        assert!(matches!(
            err,
            LayerError::Blockwise(BlockwiseError::InvalidConcatenate(_))
        ));

        let a = Concatenate::suppressed().unwrap();
        let b = Concatenate::suppressed().unwrap();
        assert_ne!(a, b);
        assert!(matches!(a, Concatenate::Suppressed(s) if s.id() < u64::MAX));
    }

    #[test]
    fn test_json_restored_sentinel_is_not_reissued() {
        let mut value = elementwise(Concatenate::Off).to_json();
        value["concatenate"] = json!({ "suppressed": 1_000_000 });

        let decoded = Blockwise::from_json(&value).unwrap();
        let fresh = Concatenate::suppressed().unwrap();

        assert_ne!(fresh, decoded.concatenate());
        assert!(matches!(fresh, Concatenate::Suppressed(s) if s.id() > 1_000_000));
    }

    #[test]
    fn test_json_decode() {
        let layer = Blockwise::from_json(&json!({
            "kind": "blockwise",
            "output": "out",
            "output_indices": ["i"],
            "template": {"out": {"op": "add", "args": [{"ref": "_0"}, {"ref": "_1"}]}},
            "indices": [{"name": "A", "indices": ["i"]}, {"value": 10}],
            "numblocks": {"A": [3]},
            "concatenate": true
        }))
        .unwrap();

        assert_eq!(layer.concatenate(), Concatenate::On);
        assert_eq!(
            layer.indices()[1],
            BlockwiseArg::Plain(Task::literal(10))
        );
        assert_eq!(layer.materialize().unwrap().len(), 3);
    }

    #[test]
    fn test_grid() {
        assert_eq!(grid(&[]), vec![Vec::<usize>::new()]);
        assert_eq!(grid(&[2, 0]), Vec::<Vec<usize>>::new());
        assert_eq!(
            grid(&[2, 2]),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
    }
}
