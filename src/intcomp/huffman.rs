use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

use anyhow::{anyhow, Result};

/// Hard cap on code length: paths must fit one integer.
pub const MAX_PATH_LENGTH: u32 = 64;

/// One alphabet symbol. The path and bit count are assigned when the
/// finished tree installs its codes; paths are recorded leaf-to-root,
/// first branch choice in the least significant bit.
pub struct HuffSymbol {
    id: usize,
    weight: u64,
    path: Cell<u64>,
    num_bits: Cell<u32>,
}

impl HuffSymbol {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn path(&self) -> u64 {
        self.path.get()
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits.get()
    }
}

/// Internal selector of the code tree.
pub struct HuffSelector {
    id: usize,
    weight: Cell<u64>,
    size: Cell<usize>,
    kids: RefCell<[HuffNode; 2]>,
}

impl HuffSelector {
    pub fn kid(&self, index: usize) -> HuffNode {
        self.kids.borrow()[index].clone()
    }

    fn fix_fields(&self) {
        let kids = self.kids.borrow();
        self.weight.set(kids[0].weight() + kids[1].weight());
        self.size.set(kids[0].node_size() + kids[1].node_size());
    }
}

#[derive(Clone)]
pub enum HuffNode {
    Symbol(Rc<HuffSymbol>),
    Selector(Rc<HuffSelector>),
}

impl HuffNode {
    pub fn weight(&self) -> u64 {
        match self {
            Self::Symbol(sym) => sym.weight,
            Self::Selector(sel) => sel.weight.get(),
        }
    }

    fn node_size(&self) -> usize {
        match self {
            Self::Symbol(_) => 1,
            Self::Selector(sel) => sel.size.get(),
        }
    }

    /// Total ordering by weight, symbols after selectors of the same
    /// weight, ids as the final tiebreak.
    fn compare(&self, other: &Self) -> Ordering {
        self.weight()
            .cmp(&other.weight())
            .then_with(|| match (self, other) {
                (Self::Selector(_), Self::Symbol(_)) => Ordering::Less,
                (Self::Symbol(_), Self::Selector(_)) => Ordering::Greater,
                (Self::Symbol(a), Self::Symbol(b)) => a.id.cmp(&b.id),
                (Self::Selector(a), Self::Selector(b)) => a
                    .size
                    .get()
                    .cmp(&b.size.get())
                    .then_with(|| a.id.cmp(&b.id)),
            })
    }

    pub fn leaves(&self) -> Vec<Rc<HuffSymbol>> {
        let mut leaves = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            match node {
                Self::Symbol(sym) => leaves.push(sym),
                Self::Selector(sel) => {
                    stack.push(sel.kid(0));
                    stack.push(sel.kid(1));
                }
            }
        }
        leaves
    }
}

struct MinOrdered(HuffNode);

impl PartialEq for MinOrdered {
    fn eq(&self, other: &Self) -> bool {
        self.0.compare(&other.0) == Ordering::Equal
    }
}

impl Eq for MinOrdered {}

impl PartialOrd for MinOrdered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MinOrdered {
    // Reversed so the binary heap pops the lightest node first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.compare(&other.0).reverse()
    }
}

/// Weighted-alphabet Huffman encoder with a configurable maximum code
/// length. When a natural code overruns the bound, the offending
/// subtree is replaced by the most balanced tree over the same leaves
/// (lightest symbols deepest); if even that cannot fit, the failure
/// propagates to the parent, which flattens in turn.
pub struct HuffmanEncoder {
    alphabet: Vec<Rc<HuffSymbol>>,
    max_allowed_path: u32,
    next_selector_id: usize,
}

impl HuffmanEncoder {
    pub fn new() -> Self {
        Self {
            alphabet: Vec::new(),
            max_allowed_path: MAX_PATH_LENGTH,
            next_selector_id: 0,
        }
    }

    pub fn set_max_path_length(&mut self, length: u32) {
        debug_assert!(length <= MAX_PATH_LENGTH);
        self.max_allowed_path = length.min(MAX_PATH_LENGTH);
    }

    pub fn create_symbol(&mut self, weight: u64) -> Rc<HuffSymbol> {
        let symbol = Rc::new(HuffSymbol {
            id: self.alphabet.len(),
            weight,
            path: Cell::new(0),
            num_bits: Cell::new(0),
        });
        self.alphabet.push(Rc::clone(&symbol));
        symbol
    }

    pub fn alphabet(&self) -> &[Rc<HuffSymbol>] {
        &self.alphabet
    }

    fn new_selector(&mut self, kid1: HuffNode, kid2: HuffNode) -> HuffNode {
        let id = self.next_selector_id;
        self.next_selector_id += 1;
        let selector = Rc::new(HuffSelector {
            id,
            weight: Cell::new(0),
            size: Cell::new(0),
            kids: RefCell::new([kid1, kid2]),
        });
        selector.fix_fields();
        HuffNode::Selector(selector)
    }

    /// Build the code tree and install a path in every symbol. Returns
    /// `None` for an empty alphabet; a one-symbol alphabet gets a
    /// single leaf with a zero-length code.
    pub fn encode_symbols(&mut self) -> Result<Option<HuffNode>> {
        if self.alphabet.is_empty() {
            return Ok(None);
        }
        let mut heap: BinaryHeap<MinOrdered> = self
            .alphabet
            .iter()
            .map(|sym| MinOrdered(HuffNode::Symbol(Rc::clone(sym))))
            .collect();
        while heap.len() >= 2 {
            let (Some(first), Some(second)) = (heap.pop(), heap.pop()) else {
                break;
            };
            let selector = self.new_selector(second.0, first.0);
            heap.push(MinOrdered(selector));
        }
        let root = heap
            .pop()
            .map(|entry| entry.0)
            .ok_or_else(|| anyhow!("Can't build Huffman encoding for alphabet"))?;
        self.install_paths(&root, 0, 0)
            .ok_or_else(|| anyhow!("Can't build Huffman encoding for alphabet"))
            .map(Some)
    }

    /// Assign paths below `node`. Returns the (possibly rebuilt)
    /// subtree, or `None` when it cannot fit under the length bound.
    fn install_paths(&mut self, node: &HuffNode, path: u64, num_bits: u32) -> Option<HuffNode> {
        match node {
            HuffNode::Symbol(sym) => {
                if num_bits > self.max_allowed_path {
                    return None;
                }
                sym.path.set(path);
                sym.num_bits.set(num_bits);
                Some(node.clone())
            }
            HuffNode::Selector(_) => {
                let mut current = node.clone();
                for attempt in 0..2 {
                    let HuffNode::Selector(sel) = current.clone() else {
                        // Flattening collapsed to a single leaf.
                        return self.install_paths(&current, path, num_bits);
                    };
                    let kid_bits = num_bits + 1;
                    let k1 = self.install_paths(&sel.kid(0), path, kid_bits);
                    let k2 = self.install_paths(&sel.kid(1), path | (1 << num_bits), kid_bits);
                    if let (Some(k1), Some(k2)) = (k1, k2) {
                        *sel.kids.borrow_mut() = [k1, k2];
                        sel.fix_fields();
                        return Some(HuffNode::Selector(sel));
                    }
                    if attempt == 1 {
                        break;
                    }
                    // Too deep: try the most balanced tree over the
                    // same leaves.
                    let size = current.node_size().max(1) as u64;
                    let bits_needed = size.next_power_of_two().trailing_zeros();
                    if num_bits + bits_needed > self.max_allowed_path {
                        break;
                    }
                    current = self.flatten_subtree(&current)?;
                }
                None
            }
        }
    }

    /// Rebuild a subtree as a right-leaning balanced tree, pairing
    /// lightest leaves first so heavier symbols land on shorter paths.
    /// `None` only for a leafless subtree, which fails to the parent.
    fn flatten_subtree(&mut self, node: &HuffNode) -> Option<HuffNode> {
        let mut ply: Vec<HuffNode> = node
            .leaves()
            .into_iter()
            .map(HuffNode::Symbol)
            .collect();
        ply.sort_by(|a, b| a.compare(b));
        let mut next = Vec::new();
        while ply.len() > 1 {
            ply.reverse();
            while ply.len() >= 2 {
                let (Some(n1), Some(n2)) = (ply.pop(), ply.pop()) else {
                    return None;
                };
                next.push(self.new_selector(n2, n1));
            }
            if let Some(last) = ply.pop() {
                next.push(last);
            }
            std::mem::swap(&mut ply, &mut next);
        }
        ply.pop()
    }
}

impl Default for HuffmanEncoder {
    fn default() -> Self {
        Self::new()
    }
}
