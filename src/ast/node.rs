use std::cell::Cell;

use super::kind::{NodeKind, PredefinedSym};
use super::ValueFormat;
use crate::stream::{StreamKind, StreamType};
use crate::IntType;

/// Index of a node inside its owning [`super::SymbolTable`] arena.
/// Only meaningful within that table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub(crate) u32);

impl NodeRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a uniqued symbol inside its owning symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub(crate) u32);

impl SymbolId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Value carried by an integer literal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntegerValue {
    pub value: IntType,
    pub format: ValueFormat,
    /// Default-constructed literal; serialized without an explicit value.
    pub is_default: bool,
}

impl IntegerValue {
    pub fn new(value: IntType, format: ValueFormat) -> Self {
        Self {
            value,
            format,
            is_default: false,
        }
    }

    pub fn default_of(kind: NodeKind) -> Self {
        Self {
            value: kind.default_value(),
            format: ValueFormat::Decimal,
            is_default: true,
        }
    }
}

/// Kind-specific payload of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    None,
    Int(IntegerValue),
    Symbol(SymbolId),
    Stream(StreamKind, StreamType),
}

pub(crate) struct NodeData {
    pub(crate) kind: NodeKind,
    pub(crate) kids: Vec<NodeRef>,
    pub(crate) payload: Payload,
    pub(crate) creation_index: u32,
}

/// One uniqued named identifier. The definition links are caches filled
/// in by the install pass and cleared when it reruns.
pub(crate) struct SymbolData {
    pub(crate) name: String,
    pub(crate) predefined: PredefinedSym,
    /// The unique `Symbol` node referencing this entry.
    pub(crate) node: NodeRef,
    pub(crate) define: Cell<Option<NodeRef>>,
    pub(crate) literal: Cell<Option<NodeRef>>,
    pub(crate) literal_action: Cell<Option<NodeRef>>,
}
