use std::fmt::{Debug, Display};
use std::sync::Arc;

use serde_json::Value;

use crate::error::TaskError;

/// Atomic reference-counted string type used for identifiers.
pub type ArcStr = Arc<str>;

/// Identifier of a single task within a graph.
///
/// Keys come in two shapes, mirroring the way lazy collections name their
/// tasks: a plain name (`"x"`) and a name paired with a block index
/// (`("x", 0, 1)`). Blockwise layers always produce the latter.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Name(ArcStr),
    Block(ArcStr, Box<[usize]>),
}

impl Key {
    pub fn name(name: impl Into<ArcStr>) -> Self {
        Key::Name(name.into())
    }

    pub fn block(name: impl Into<ArcStr>, index: impl Into<Box<[usize]>>) -> Self {
        Key::Block(name.into(), index.into())
    }

    /// The name part of the key, regardless of its shape.
    pub fn label(&self) -> &str {
        match self {
            Key::Name(name) => name,
            Key::Block(name, _) => name,
        }
    }

    /// Decodes a key from its JSON form: either a string or an array of a
    /// string followed by block indices.
    pub fn from_json(value: &Value) -> Result<Self, TaskError> {
        match value {
            Value::String(name) => Ok(Key::name(name.as_str())),
            Value::Array(items) => {
                let Some((Value::String(name), rest)) = items.split_first() else {
                    return Err(TaskError::InvalidKey(value.clone()));
                };

                let index = rest
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|i| usize::try_from(i).ok())
                            .ok_or_else(|| TaskError::InvalidKey(value.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(Key::block(name.as_str(), index))
            }
            _ => Err(TaskError::InvalidKey(value.clone())),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Key::Name(name) => Value::String(name.to_string()),
            Key::Block(name, index) => {
                let mut items = Vec::with_capacity(index.len() + 1);
                items.push(Value::String(name.to_string()));
                items.extend(index.iter().map(|&i| Value::from(i)));
                Value::Array(items)
            }
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::name(value)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Name(name) => write!(f, "'{name}'"),
            Key::Block(name, index) => {
                write!(f, "('{name}'")?;
                for i in index.iter() {
                    write!(f, ", {i}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({self})")
    }
}

/// A 32-byte BLAKE3 hash.
///
/// Used as a structural fingerprint of graphs: two graphs with the same
/// fingerprint have the same keys, the same literals, the same references
/// and the same nesting, though their operations may differ.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental hasher feeding the structural fingerprints.
///
/// Every write is tagged, so that e.g. a literal `"x"` and a reference to
/// `"x"` never collide.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn tag(&mut self, tag: u8) -> &mut Self {
        self.0.update(&[tag]);
        self
    }

    pub(crate) fn count(&mut self, value: usize) -> &mut Self {
        self.0.update(&(value as u64).to_le_bytes());
        self
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.count(bytes.len());
        self.0.update(bytes);
        self
    }

    pub(crate) fn key(&mut self, key: &Key) -> &mut Self {
        match key {
            Key::Name(name) => self.tag(b'n').bytes(name.as_bytes()),
            Key::Block(name, index) => {
                self.tag(b'b').bytes(name.as_bytes()).count(index.len());
                for &i in index.iter() {
                    self.count(i);
                }
                self
            }
        }
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}
