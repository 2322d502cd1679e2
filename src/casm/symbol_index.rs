use std::collections::HashMap;

use crate::ast::{NodeKind, NodeRef, SymbolId, SymbolTable};

/// Dense indexing of the symbols an algorithm references, in first-use
/// preorder. The flattener writes names in index order; the inflater
/// rebuilds the same table from the names block, so indices agree on
/// both sides by construction.
#[derive(Debug, Default)]
pub struct SymbolIndex {
    symbols: Vec<SymbolId>,
    index_of: HashMap<SymbolId, usize>,
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every symbol reachable from `root`.
    pub fn install(&mut self, symtab: &SymbolTable, root: NodeRef) {
        self.symbols.clear();
        self.index_of.clear();
        self.collect(symtab, root);
    }

    fn collect(&mut self, symtab: &SymbolTable, nd: NodeRef) {
        if symtab.kind(nd) == NodeKind::Symbol {
            if let Some(id) = symtab.symbol_id(nd) {
                self.add(id);
            }
            return;
        }
        for index in 0..symtab.num_kids(nd) {
            self.collect(symtab, symtab.kid(nd, index));
        }
    }

    /// Register a symbol, keeping the first index it got.
    pub fn add(&mut self, id: SymbolId) -> usize {
        if let Some(&index) = self.index_of.get(&id) {
            return index;
        }
        let index = self.symbols.len();
        self.symbols.push(id);
        self.index_of.insert(id, index);
        index
    }

    pub fn index_of(&self, id: SymbolId) -> Option<usize> {
        self.index_of.get(&id).copied()
    }

    pub fn get(&self, index: usize) -> Option<SymbolId> {
        self.symbols.get(index).copied()
    }

    pub fn symbols(&self) -> &[SymbolId] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
