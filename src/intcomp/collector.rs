use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

use anyhow::Result;

use super::count::{CountNodeRc, CountRoot};
use super::flags::CompressionFlags;
use super::huffman::{HuffNode, HuffmanEncoder};
use crate::trace::TraceSink;

/// Which parts of the trie a collection pass walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionScope {
    /// Sentinels and singleton values only.
    TopLevel,
    /// Multi-value sequence paths only.
    IntPaths,
    All,
}

impl CollectionScope {
    fn top_level(self) -> bool {
        matches!(self, Self::TopLevel | Self::All)
    }

    fn int_paths(self) -> bool {
        matches!(self, Self::IntPaths | Self::All)
    }
}

struct HeapEntry {
    weight: u64,
    node: CountNodeRc,
}

impl HeapEntry {
    fn tiebreak(&self) -> (usize, u64, super::count::CountKind) {
        (self.node.path_length(), self.node.value(), self.node.kind())
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Max-heap by weight; the remaining keys only pin a stable order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.tiebreak().cmp(&self.tiebreak()))
    }
}

/// Walks the trie collecting candidate patterns under the configured
/// cutoffs, and orders them on a weight heap.
pub struct CountNodeCollector<'a> {
    root: &'a CountRoot,
    flags: &'a CompressionFlags,
    values: Vec<CountNodeRc>,
    heap: BinaryHeap<HeapEntry>,
    pub weight_total: u64,
    pub count_total: u64,
    pub weight_reported: u64,
    pub count_reported: u64,
}

impl<'a> CountNodeCollector<'a> {
    pub fn new(root: &'a CountRoot, flags: &'a CompressionFlags) -> Self {
        Self {
            root,
            flags,
            values: Vec::new(),
            heap: BinaryHeap::new(),
            weight_total: 0,
            count_total: 0,
            weight_reported: 0,
            count_reported: 0,
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.heap.clear();
    }

    pub fn collect(&mut self, scope: CollectionScope) {
        if scope.top_level() {
            for sentinel in self.root.others() {
                self.consider(sentinel, scope);
            }
        }
        for node in self.root.root().successors() {
            self.collect_node(node, scope);
        }
    }

    fn collect_node(&mut self, node: CountNodeRc, scope: CollectionScope) {
        let mut to_visit = vec![node];
        while let Some(node) = to_visit.pop() {
            to_visit.extend(node.successors());
            self.consider(node, scope);
        }
    }

    fn consider(&mut self, node: CountNodeRc, scope: CollectionScope) {
        let is_singleton_level = !matches!(node.kind(), super::count::CountKind::Sequence);
        let in_scope = if is_singleton_level {
            scope.top_level()
        } else {
            scope.int_paths()
        };
        if !in_scope {
            return;
        }
        let weight = node.weight(self.flags);
        self.count_total += node.count();
        self.weight_total += weight;
        if !node.keep(self.flags) {
            return;
        }
        self.count_reported += node.count();
        self.weight_reported += weight;
        self.values.push(node);
    }

    pub fn build_heap(&mut self) {
        self.heap.clear();
        for node in &self.values {
            self.heap.push(HeapEntry {
                weight: node.weight(self.flags),
                node: Rc::clone(node),
            });
        }
    }

    pub fn pop_heap(&mut self) -> Option<CountNodeRc> {
        self.heap.pop().map(|entry| entry.node)
    }

    pub fn values(&self) -> &[CountNodeRc] {
        &self.values
    }
}

/// Assigns abbreviation indices to the heaviest candidates, under the
/// abbreviation budget and the cost of encoding the index itself.
pub struct AbbreviationsCollector<'a> {
    collector: CountNodeCollector<'a>,
    flags: &'a CompressionFlags,
    trace: TraceSink,
}

impl<'a> AbbreviationsCollector<'a> {
    pub fn new(root: &'a CountRoot, flags: &'a CompressionFlags) -> Self {
        Self {
            collector: CountNodeCollector::new(root, flags),
            flags,
            trace: TraceSink::off(),
        }
    }

    pub fn set_trace(&mut self, trace: TraceSink) {
        self.trace = trace;
    }

    /// Select and number the abbreviations. Sentinels always get one;
    /// trie patterns must pay for their index.
    pub fn assign_abbreviations(&mut self) -> Vec<CountNodeRc> {
        let mut assignments: Vec<CountNodeRc> = Vec::new();
        for sentinel in self.collector.root.others() {
            Self::add_abbreviation(&mut assignments, sentinel, &self.trace);
        }
        self.collector.collect(CollectionScope::All);
        self.collector.build_heap();
        while assignments.len() < self.flags.max_abbreviations {
            let Some(node) = self.collector.pop_heap() else {
                break;
            };
            if node.has_abbrev_index() {
                continue;
            }
            let weight = node.weight(self.flags);
            if node.is_int() && weight < self.flags.weight_cutoff {
                self.trace.note(|| format!("dropping {node:?}: weight cutoff"));
                continue;
            }
            let next_index = assignments.len() as u64;
            let space = self.flags.abbrev_format.byte_size(next_index) as u64;
            if space <= weight {
                Self::add_abbreviation(&mut assignments, node, &self.trace);
            }
        }
        assignments
    }

    fn add_abbreviation(
        assignments: &mut Vec<CountNodeRc>,
        node: CountNodeRc,
        trace: &TraceSink,
    ) {
        if node.has_abbrev_index() {
            return;
        }
        let index = assignments.len() as u64;
        trace.note(|| format!("abbreviation {index}: {node:?}"));
        node.set_abbrev_index(index);
        assignments.push(node);
    }

    /// Turn the assigned abbreviations into a Huffman alphabet keyed by
    /// their observed counts.
    pub fn assign_huffman_encoding(
        &mut self,
        assignments: &[CountNodeRc],
    ) -> Result<Option<HuffNode>> {
        let mut encoder = HuffmanEncoder::new();
        encoder.set_max_path_length(self.flags.max_path_length);
        for node in assignments {
            let symbol = encoder.create_symbol(node.count().max(1));
            node.set_huffman_symbol(symbol);
        }
        encoder.encode_symbols()
    }
}
