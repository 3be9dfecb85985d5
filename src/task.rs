//! Task descriptions and the no-op rewrite.
//!
//! A [`Task`] is one node's computation in a graph. Tasks nest: the arguments
//! of a call are tasks themselves, and so are the items of a sequence. Graphs
//! produced by real workloads can nest very deeply (long reduction chains,
//! recursive data structures), so every walk over a task in this module runs
//! on an explicit work stack instead of the call stack.

use std::collections::BTreeSet;
use std::fmt::{Debug, Display};

use serde_json::{Map, Value};

use crate::core::{ArcStr, Blake3Hasher, Key};
use crate::error::TaskError;

/// Name under which the no-op operation is written in the JSON encoding.
pub const NOOP: &str = "noop";

/// Operation symbol of a call.
///
/// `Op::Noop` is the inert placeholder: it accepts any arguments and
/// produces nothing meaningful. It carries no state, so every rewritten call
/// shares the same symbol.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Noop,
    Named(ArcStr),
}

impl Op {
    pub fn named(name: impl Into<ArcStr>) -> Self {
        let name = name.into();
        if &*name == NOOP {
            Op::Noop
        } else {
            Op::Named(name)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Op::Noop => NOOP,
            Op::Named(name) => name,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Op::Noop)
    }
}

impl From<&str> for Op {
    fn from(value: &str) -> Self {
        Op::named(value)
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Op({})", self.as_str())
    }
}

/// A single task description.
pub enum Task {
    /// Opaque value, never interpreted.
    Literal(Value),
    /// The result of another task.
    Ref(Key),
    /// An operation applied to positional arguments.
    Call(Op, Vec<Task>),
    /// An ordered collection of sub-tasks.
    Seq(Vec<Task>),
}

impl Task {
    pub fn literal(value: impl Into<Value>) -> Self {
        Task::Literal(value.into())
    }

    pub fn reference(key: impl Into<Key>) -> Self {
        Task::Ref(key.into())
    }

    pub fn call(op: impl Into<Op>, args: impl IntoIterator<Item = Task>) -> Self {
        Task::Call(op.into(), args.into_iter().collect())
    }

    pub fn seq(items: impl IntoIterator<Item = Task>) -> Self {
        Task::Seq(items.into_iter().collect())
    }

    /// Iterates over this task and every task nested in it, in pre-order.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    /// All keys this task depends on.
    pub fn dependencies(&self) -> BTreeSet<Key> {
        self.walk()
            .filter_map(|task| match task {
                Task::Ref(key) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether every call within this task is a no-op.
    pub fn is_inert(&self) -> bool {
        self.walk().all(|task| match task {
            Task::Call(op, _) => op.is_noop(),
            _ => true,
        })
    }

    /// Replaces every reference for which `lookup` returns a task. The
    /// replacement is inserted as is, it isn't walked again.
    pub fn substitute(&self, mut lookup: impl FnMut(&Key) -> Option<Task>) -> Task {
        self.transform(
            |task| match task {
                Task::Ref(key) => lookup(key).unwrap_or_else(|| task.clone()),
                _ => task.clone(),
            },
            Op::clone,
        )
    }

    /// Rebuilds the task bottom-up. Leaves (literals and references) go
    /// through `leaf`, the symbol of every call goes through `op`; the
    /// argument structure is kept as is.
    fn transform(
        &self,
        mut leaf: impl FnMut(&Task) -> Task,
        mut op: impl FnMut(&Op) -> Op,
    ) -> Task {
        enum Step<'a> {
            Visit(&'a Task),
            Call(&'a Op, usize),
            Seq(usize),
        }

        let mut work = vec![Step::Visit(self)];
        let mut done: Vec<Task> = Vec::new();

        while let Some(step) = work.pop() {
            match step {
                Step::Visit(Task::Call(symbol, args)) => {
                    work.push(Step::Call(symbol, args.len()));
                    work.extend(args.iter().rev().map(Step::Visit));
                }
                Step::Visit(Task::Seq(items)) => {
                    work.push(Step::Seq(items.len()));
                    work.extend(items.iter().rev().map(Step::Visit));
                }
                Step::Visit(task) => done.push(leaf(task)),
                Step::Call(symbol, len) => {
                    let args = done.split_off(done.len() - len);
                    done.push(Task::Call(op(symbol), args));
                }
                Step::Seq(len) => {
                    let items = done.split_off(done.len() - len);
                    done.push(Task::Seq(items));
                }
            }
        }

        done.pop().expect("task walk always yields exactly one root")
    }

    pub(crate) fn hash_shape(&self, hasher: &mut Blake3Hasher) {
        for task in self.walk() {
            match task {
                Task::Literal(value) => {
                    hasher.tag(b'l').bytes(value.to_string().as_bytes());
                }
                Task::Ref(key) => {
                    hasher.tag(b'r').key(key);
                }
                Task::Call(_, args) => {
                    hasher.tag(b'c').count(args.len());
                }
                Task::Seq(items) => {
                    hasher.tag(b's').count(items.len());
                }
            }
        }
    }

    /// Decodes a task from JSON.
    ///
    /// * `{"op": "add", "args": [...]}` is a call,
    /// * `{"ref": "x"}` is a reference,
    /// * `{"lit": ...}` is an explicit literal,
    /// * an array is a sequence,
    /// * anything else is a literal.
    pub fn from_json(value: &Value) -> Result<Self, TaskError> {
        match value {
            Value::Array(items) => Ok(Task::Seq(
                items
                    .iter()
                    .map(Task::from_json)
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => {
                if let Some(op) = map.get("op") {
                    let Value::String(op) = op else {
                        return Err(TaskError::InvalidOp(op.clone()));
                    };

                    let args = match map.get("args") {
                        None => Vec::new(),
                        Some(Value::Array(args)) => args
                            .iter()
                            .map(Task::from_json)
                            .collect::<Result<_, _>>()?,
                        Some(other) => return Err(TaskError::InvalidArgs(other.clone())),
                    };

                    Ok(Task::Call(Op::named(op.as_str()), args))
                } else if let Some(key) = map.get("ref") {
                    Ok(Task::Ref(Key::from_json(key)?))
                } else if let Some(literal) = map.get("lit") {
                    Ok(Task::Literal(literal.clone()))
                } else {
                    Ok(Task::Literal(value.clone()))
                }
            }
            _ => Ok(Task::Literal(value.clone())),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Task::Literal(value) => {
                let ambiguous = match value {
                    Value::Array(_) => true,
                    Value::Object(map) => ["op", "ref", "lit"]
                        .iter()
                        .any(|field| map.contains_key(*field)),
                    _ => false,
                };

                if ambiguous {
                    let mut map = Map::new();
                    map.insert("lit".into(), value.clone());
                    Value::Object(map)
                } else {
                    value.clone()
                }
            }
            Task::Ref(key) => {
                let mut map = Map::new();
                map.insert("ref".into(), key.to_json());
                Value::Object(map)
            }
            Task::Call(op, args) => {
                let mut map = Map::new();
                map.insert("op".into(), Value::String(op.as_str().into()));
                map.insert(
                    "args".into(),
                    Value::Array(args.iter().map(Task::to_json).collect()),
                );
                Value::Object(map)
            }
            Task::Seq(items) => Value::Array(items.iter().map(Task::to_json).collect()),
        }
    }
}

impl Clone for Task {
    fn clone(&self) -> Self {
        match self {
            Task::Literal(value) => Task::Literal(value.clone()),
            Task::Ref(key) => Task::Ref(key.clone()),
            _ => self.transform(Task::clone, Op::clone),
        }
    }
}

// Pre-order walks of two tasks line up node by node exactly when the tasks
// have the same shape, given that every node also agrees on its arity.
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        let mut left = self.walk();
        let mut right = other.walk();

        loop {
            match (left.next(), right.next()) {
                (None, None) => return true,
                (Some(a), Some(b)) => {
                    let same = match (a, b) {
                        (Task::Literal(a), Task::Literal(b)) => a == b,
                        (Task::Ref(a), Task::Ref(b)) => a == b,
                        (Task::Call(a, a_args), Task::Call(b, b_args)) => {
                            a == b && a_args.len() == b_args.len()
                        }
                        (Task::Seq(a), Task::Seq(b)) => a.len() == b.len(),
                        _ => false,
                    };
                    if !same {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        enum Piece<'a> {
            Task(&'a Task),
            Text(&'static str),
        }

        fn push_items<'a>(stack: &mut Vec<Piece<'a>>, items: &'a [Task]) {
            stack.push(Piece::Text("])"));
            for (i, item) in items.iter().enumerate().rev() {
                stack.push(Piece::Task(item));
                if i > 0 {
                    stack.push(Piece::Text(", "));
                }
            }
        }

        let mut stack = vec![Piece::Task(self)];

        while let Some(piece) = stack.pop() {
            match piece {
                Piece::Text(text) => f.write_str(text)?,
                Piece::Task(Task::Literal(value)) => write!(f, "Literal({value})")?,
                Piece::Task(Task::Ref(key)) => write!(f, "Ref({key})")?,
                Piece::Task(Task::Call(op, args)) => {
                    write!(f, "Call({op}, [")?;
                    push_items(&mut stack, args);
                }
                Piece::Task(Task::Seq(items)) => {
                    f.write_str("Seq([")?;
                    push_items(&mut stack, items);
                }
            }
        }

        Ok(())
    }
}

// Nested tasks are torn down iteratively, the derived drop glue would
// recurse once per nesting level.
impl Drop for Task {
    fn drop(&mut self) {
        let mut stack = match self {
            Task::Call(_, children) | Task::Seq(children) => std::mem::take(children),
            _ => return,
        };

        while let Some(mut task) = stack.pop() {
            if let Task::Call(_, children) | Task::Seq(children) = &mut task {
                stack.append(children);
            }
        }
    }
}

/// Pre-order iterator over a task and its nested tasks.
pub struct Walk<'a> {
    stack: Vec<&'a Task>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Task;

    fn next(&mut self) -> Option<Self::Item> {
        let task = self.stack.pop()?;

        if let Task::Call(_, children) | Task::Seq(children) = task {
            self.stack.extend(children.iter().rev());
        }

        Some(task)
    }
}

/// Replaces the operation symbol of every call in `task` with [`Op::Noop`].
///
/// Literals and references are returned unchanged, sequences and call
/// arguments keep their length and order.
pub fn rewrite_task(task: &Task) -> Task {
    task.transform(Task::clone, |_| Op::Noop)
}
