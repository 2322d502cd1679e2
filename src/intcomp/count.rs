use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use super::flags::CompressionFlags;
use super::huffman::HuffSymbol;
use crate::ast::PredefinedSym;
use crate::interp::{IntEntry, IntStream};
use crate::IntType;

/// What a count node stands for in the observed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CountKind {
    Root,
    BlockEnter,
    BlockExit,
    /// One value transmitted without an abbreviation.
    DefaultSingle,
    /// A run of values transmitted without abbreviations.
    DefaultMultiple,
    Align,
    /// A single integer value.
    Singleton,
    /// An integer sequence of length ≥ 2.
    Sequence,
}

pub type CountNodeRc = Rc<CountNode>;

/// One node of the integer-pattern trie. Children are owned through
/// the successor map; the parent link is weak so walkers can rebuild a
/// node's value sequence without a reference cycle.
pub struct CountNode {
    kind: CountKind,
    value: IntType,
    path_length: usize,
    count: Cell<u64>,
    parent: Weak<CountNode>,
    successors: RefCell<BTreeMap<IntType, CountNodeRc>>,
    abbrev_index: Cell<Option<IntType>>,
    huffman: RefCell<Option<Rc<HuffSymbol>>>,
}

impl CountNode {
    fn sentinel(kind: CountKind) -> CountNodeRc {
        Rc::new(Self {
            kind,
            value: 0,
            path_length: 1,
            count: Cell::new(0),
            parent: Weak::new(),
            successors: RefCell::new(BTreeMap::new()),
            abbrev_index: Cell::new(None),
            huffman: RefCell::new(None),
        })
    }

    pub fn kind(&self) -> CountKind {
        self.kind
    }

    pub fn value(&self) -> IntType {
        self.value
    }

    pub fn path_length(&self) -> usize {
        self.path_length
    }

    pub fn count(&self) -> u64 {
        self.count.get()
    }

    pub fn increment(&self) {
        self.count.set(self.count.get() + 1);
    }

    pub fn set_count(&self, count: u64) {
        self.count.set(count);
    }

    pub fn parent(&self) -> Option<CountNodeRc> {
        self.parent.upgrade()
    }

    pub fn is_int(&self) -> bool {
        matches!(self.kind, CountKind::Singleton | CountKind::Sequence)
    }

    /// Weight of keeping this pattern: its count scaled by how much
    /// input one occurrence covers.
    pub fn weight(&self, flags: &CompressionFlags) -> u64 {
        match self.kind {
            CountKind::Sequence => {
                self.count() * (self.path_length * flags.pattern_length_multiplier) as u64
            }
            _ => self.count(),
        }
    }

    /// Whether this node survives the small-value penalty and cutoffs.
    pub fn keep(&self, flags: &CompressionFlags) -> bool {
        if self.kind == CountKind::Singleton
            && self.value <= flags.small_value_max
            && self.count() < flags.small_value_count_cutoff
        {
            return false;
        }
        if self.is_int() {
            self.count() >= flags.count_cutoff && self.weight(flags) >= flags.weight_cutoff
        } else {
            self.count() > 0
        }
    }

    /// The successor of `node` for `value`, created on first sight.
    pub fn lookup(node: &CountNodeRc, value: IntType) -> CountNodeRc {
        if let Some(found) = node.successors.borrow().get(&value) {
            return Rc::clone(found);
        }
        let at_root = node.kind == CountKind::Root;
        let successor = Rc::new(Self {
            kind: if at_root {
                CountKind::Singleton
            } else {
                CountKind::Sequence
            },
            value,
            path_length: if at_root { 1 } else { node.path_length + 1 },
            count: Cell::new(0),
            parent: if at_root {
                Weak::new()
            } else {
                Rc::downgrade(node)
            },
            successors: RefCell::new(BTreeMap::new()),
            abbrev_index: Cell::new(None),
            huffman: RefCell::new(None),
        });
        node.successors
            .borrow_mut()
            .insert(value, Rc::clone(&successor));
        successor
    }

    pub fn get_successor(&self, value: IntType) -> Option<CountNodeRc> {
        self.successors.borrow().get(&value).cloned()
    }

    pub fn successors(&self) -> Vec<CountNodeRc> {
        self.successors.borrow().values().cloned().collect()
    }

    /// The integer sequence this node stands for, front first.
    pub fn sequence_values(&self) -> Vec<IntType> {
        let mut values = vec![self.value];
        let mut cursor = self.parent();
        while let Some(node) = cursor {
            values.push(node.value());
            cursor = node.parent();
        }
        values.reverse();
        values
    }

    pub fn abbrev_index(&self) -> Option<IntType> {
        self.abbrev_index.get()
    }

    pub fn has_abbrev_index(&self) -> bool {
        self.abbrev_index.get().is_some()
    }

    pub fn set_abbrev_index(&self, index: IntType) {
        self.abbrev_index.set(Some(index));
    }

    pub fn clear_abbrev_index(&self) {
        self.abbrev_index.set(None);
        *self.huffman.borrow_mut() = None;
    }

    pub fn huffman_symbol(&self) -> Option<Rc<HuffSymbol>> {
        self.huffman.borrow().clone()
    }

    pub fn set_huffman_symbol(&self, symbol: Rc<HuffSymbol>) {
        *self.huffman.borrow_mut() = Some(symbol);
    }
}

impl std::fmt::Debug for CountNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            CountKind::Singleton | CountKind::Sequence => write!(
                f,
                "{:?}{:?} x{}",
                self.kind,
                self.sequence_values(),
                self.count()
            ),
            kind => write!(f, "{:?} x{}", kind, self.count()),
        }
    }
}

/// The trie root plus the top-level sentinel counters.
pub struct CountRoot {
    root: CountNodeRc,
    block_enter: CountNodeRc,
    block_exit: CountNodeRc,
    default_single: CountNodeRc,
    default_multiple: CountNodeRc,
    align: CountNodeRc,
}

impl CountRoot {
    pub fn new() -> Self {
        Self {
            root: CountNode::sentinel(CountKind::Root),
            block_enter: CountNode::sentinel(CountKind::BlockEnter),
            block_exit: CountNode::sentinel(CountKind::BlockExit),
            default_single: CountNode::sentinel(CountKind::DefaultSingle),
            default_multiple: CountNode::sentinel(CountKind::DefaultMultiple),
            align: CountNode::sentinel(CountKind::Align),
        }
    }

    pub fn root(&self) -> &CountNodeRc {
        &self.root
    }

    pub fn block_enter(&self) -> &CountNodeRc {
        &self.block_enter
    }

    pub fn block_exit(&self) -> &CountNodeRc {
        &self.block_exit
    }

    pub fn default_single(&self) -> &CountNodeRc {
        &self.default_single
    }

    pub fn default_multiple(&self) -> &CountNodeRc {
        &self.default_multiple
    }

    pub fn align(&self) -> &CountNodeRc {
        &self.align
    }

    /// The non-trie sentinels, in a stable order.
    pub fn others(&self) -> Vec<CountNodeRc> {
        vec![
            Rc::clone(&self.block_enter),
            Rc::clone(&self.block_exit),
            Rc::clone(&self.default_single),
            Rc::clone(&self.default_multiple),
            Rc::clone(&self.align),
        ]
    }

    /// Scan a stream once, counting every window of length 1 to the
    /// pattern limit at each position. Patterns never span block
    /// boundaries or alignment points.
    pub fn add_stream(&self, stream: &IntStream, flags: &CompressionFlags) {
        let mut actives: Vec<CountNodeRc> = Vec::new();
        for entry in stream.entries() {
            match *entry {
                IntEntry::Value(value) => {
                    let mut next = Vec::with_capacity(actives.len() + 1);
                    let first = CountNode::lookup(&self.root, value);
                    first.increment();
                    next.push(first);
                    for active in &actives {
                        if active.path_length() >= flags.pattern_length_limit {
                            continue;
                        }
                        let node = CountNode::lookup(active, value);
                        node.increment();
                        next.push(node);
                    }
                    actives = next;
                }
                IntEntry::Action(action) => {
                    self.count_action(action);
                    actives.clear();
                }
                IntEntry::Header(..) => actives.clear(),
            }
        }
    }

    fn count_action(&self, action: IntType) {
        let sym = u32::try_from(action)
            .ok()
            .and_then(|raw| PredefinedSym::try_from(raw).ok());
        match sym {
            Some(PredefinedSym::BlockEnter | PredefinedSym::BlockEnterWriteonly) => {
                self.block_enter.increment();
            }
            Some(PredefinedSym::BlockExit | PredefinedSym::BlockExitWriteonly) => {
                self.block_exit.increment();
            }
            Some(PredefinedSym::Align) => self.align.increment(),
            _ => {}
        }
    }
}

impl Default for CountRoot {
    fn default() -> Self {
        Self::new()
    }
}
