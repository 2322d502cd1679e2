use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use anyhow::{anyhow, ensure, Context, Result};

use super::kind::{Arity, NodeKind, PredefinedSym};
use super::node::{IntegerValue, NodeData, NodeRef, Payload, SymbolData, SymbolId};
use super::ValueFormat;
use crate::stream::{StreamKind, StreamType};
use crate::IntType;

const MAX_OPCODE_WIDTH: u32 = 64;

fn width_mask(width: u32) -> IntType {
    if width == 0 {
        0
    } else {
        IntType::MAX >> (MAX_OPCODE_WIDTH - width)
    }
}

/// One disjoint `[min, max]` interval of the opcode dispatch table,
/// with the shift separating the selector from the case payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WriteRange {
    pub min: IntType,
    pub max: IntType,
    pub shift: u32,
    pub case: NodeRef,
}

impl WriteRange {
    pub fn mask(&self) -> IntType {
        width_mask(self.shift)
    }
}

/// Owner, factory and scope for one filter AST.
///
/// All nodes live in the table's arena and are addressed by [`NodeRef`].
/// Mergable integer literals are canonicalized on
/// `(kind, value, format, is_default)`; symbols are uniqued by name.
/// After building (or editing) a tree, [`SymbolTable::install`] must run
/// before the tree is interpreted: it clears caches, links definitions
/// and validates scoping, then rebuilds the dispatch caches.
pub struct SymbolTable {
    nodes: Vec<NodeData>,
    symbols: Vec<SymbolData>,
    symbol_map: BTreeMap<String, SymbolId>,
    int_map: HashMap<(NodeKind, IntType, ValueFormat, bool), NodeRef>,
    predefined: Vec<SymbolId>,
    algorithm: Option<NodeRef>,
    enclosing: Option<Rc<SymbolTable>>,
    cases: HashMap<NodeRef, BTreeMap<IntType, NodeRef>>,
    opcode_ranges: HashMap<NodeRef, Vec<WriteRange>>,
    next_creation_index: u32,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::with_scope(None)
    }

    pub fn with_enclosing(enclosing: Rc<SymbolTable>) -> Self {
        Self::with_scope(Some(enclosing))
    }

    fn with_scope(enclosing: Option<Rc<SymbolTable>>) -> Self {
        let mut table = Self {
            nodes: Vec::new(),
            symbols: Vec::new(),
            symbol_map: BTreeMap::new(),
            int_map: HashMap::new(),
            predefined: Vec::new(),
            algorithm: None,
            enclosing,
            cases: HashMap::new(),
            opcode_ranges: HashMap::new(),
            next_creation_index: 0,
        };
        for sym in PredefinedSym::all() {
            let id = table.symbol(sym.name());
            table.symbols[id.index()].predefined = sym;
            table.predefined.push(id);
        }
        table
    }

    fn alloc(&mut self, kind: NodeKind, kids: Vec<NodeRef>, payload: Payload) -> NodeRef {
        let nd = NodeRef(self.nodes.len() as u32);
        let creation_index = self.next_creation_index;
        self.next_creation_index += 1;
        self.nodes.push(NodeData {
            kind,
            kids,
            payload,
            creation_index,
        });
        nd
    }

    /// Create a structural node. Literal kinds go through
    /// [`SymbolTable::int`] and symbols through [`SymbolTable::symbol`].
    pub fn create(&mut self, kind: NodeKind, kids: Vec<NodeRef>) -> NodeRef {
        debug_assert!(match kind.arity() {
            Arity::Nullary => kids.is_empty(),
            Arity::Unary => kids.len() == 1,
            Arity::Binary => kids.len() == 2,
            Arity::Ternary => kids.len() == 3,
            Arity::Nary => true,
            Arity::Integer | Arity::Symbol => false,
        });
        self.alloc(kind, kids, Payload::None)
    }

    /// Canonicalized integer literal.
    pub fn int(&mut self, kind: NodeKind, value: IntType, format: ValueFormat) -> NodeRef {
        debug_assert!(kind.is_integer());
        let payload = Payload::Int(IntegerValue::new(value, format));
        if !kind.is_mergable() {
            return self.alloc(kind, Vec::new(), payload);
        }
        let key = (kind, value, format, false);
        if let Some(&nd) = self.int_map.get(&key) {
            return nd;
        }
        let nd = self.alloc(kind, Vec::new(), payload);
        self.int_map.insert(key, nd);
        nd
    }

    /// Default-valued literal of `kind` (e.g. `(params)` meaning zero,
    /// `(varuint32)` meaning the natural width).
    pub fn int_default(&mut self, kind: NodeKind) -> NodeRef {
        debug_assert!(kind.is_integer());
        let value = IntegerValue::default_of(kind);
        let key = (kind, value.value, value.format, true);
        if let Some(&nd) = self.int_map.get(&key) {
            return nd;
        }
        let nd = self.alloc(kind, Vec::new(), Payload::Int(value));
        self.int_map.insert(key, nd);
        nd
    }

    pub fn stream(&mut self, kind: StreamKind, typ: StreamType) -> NodeRef {
        self.alloc(NodeKind::Stream, Vec::new(), Payload::Stream(kind, typ))
    }

    /// The uniqued symbol named `name`.
    pub fn symbol(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.symbol_map.get(name) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        let node = self.alloc(NodeKind::Symbol, Vec::new(), Payload::Symbol(id));
        self.symbols.push(SymbolData {
            name: name.to_string(),
            predefined: PredefinedSym::Unknown,
            node,
            define: Default::default(),
            literal: Default::default(),
            literal_action: Default::default(),
        });
        self.symbol_map.insert(name.to_string(), id);
        id
    }

    /// The unique `Symbol` node of `name`.
    pub fn symbol_node(&mut self, name: &str) -> NodeRef {
        let id = self.symbol(name);
        self.symbols[id.index()].node
    }

    pub fn node_of_symbol(&self, id: SymbolId) -> NodeRef {
        self.symbols[id.index()].node
    }

    pub fn predefined(&self, sym: PredefinedSym) -> SymbolId {
        self.predefined[u32::from(sym) as usize]
    }

    pub fn predefined_node(&self, sym: PredefinedSym) -> NodeRef {
        self.node_of_symbol(self.predefined(sym))
    }

    pub fn predefined_of(&self, id: SymbolId) -> PredefinedSym {
        self.symbols[id.index()].predefined
    }

    pub fn lookup_symbol(&self, name: &str) -> Option<SymbolId> {
        self.symbol_map.get(name).copied()
    }

    // Node accessors.

    pub fn kind(&self, nd: NodeRef) -> NodeKind {
        self.nodes[nd.index()].kind
    }

    pub fn kids(&self, nd: NodeRef) -> &[NodeRef] {
        &self.nodes[nd.index()].kids
    }

    pub fn num_kids(&self, nd: NodeRef) -> usize {
        self.nodes[nd.index()].kids.len()
    }

    pub fn kid(&self, nd: NodeRef, index: usize) -> NodeRef {
        self.nodes[nd.index()].kids[index]
    }

    pub fn payload(&self, nd: NodeRef) -> Payload {
        self.nodes[nd.index()].payload
    }

    pub fn int_value(&self, nd: NodeRef) -> Option<IntegerValue> {
        match self.nodes[nd.index()].payload {
            Payload::Int(value) => Some(value),
            _ => None,
        }
    }

    pub fn symbol_id(&self, nd: NodeRef) -> Option<SymbolId> {
        match self.nodes[nd.index()].payload {
            Payload::Symbol(id) => Some(id),
            _ => None,
        }
    }

    pub fn symbol_name(&self, id: SymbolId) -> &str {
        &self.symbols[id.index()].name
    }

    pub fn creation_index(&self, nd: NodeRef) -> u32 {
        self.nodes[nd.index()].creation_index
    }

    pub(crate) fn append_kid(&mut self, nd: NodeRef, kid: NodeRef) {
        debug_assert_eq!(self.nodes[nd.index()].kind.arity(), Arity::Nary);
        self.nodes[nd.index()].kids.push(kid);
    }

    // Definition links.

    pub fn define_of(&self, id: SymbolId) -> Option<NodeRef> {
        self.symbols[id.index()].define.get()
    }

    pub fn literal_of(&self, id: SymbolId) -> Option<NodeRef> {
        self.symbols[id.index()].literal.get()
    }

    pub fn literal_action_of(&self, id: SymbolId) -> Option<NodeRef> {
        self.symbols[id.index()].literal_action.get()
    }

    pub fn set_algorithm(&mut self, nd: NodeRef) {
        debug_assert_eq!(self.kind(nd), NodeKind::Algorithm);
        self.algorithm = Some(nd);
    }

    pub fn algorithm(&self) -> Option<NodeRef> {
        self.algorithm
    }

    /// Header the input must match before this algorithm applies: the
    /// read header when present, the source header otherwise.
    pub fn target_header(&self) -> Option<NodeRef> {
        let algorithm = self.algorithm?;
        let mut source = None;
        for &kid in self.kids(algorithm) {
            match self.kind(kid) {
                NodeKind::ReadHeader => return Some(kid),
                NodeKind::SourceHeader if source.is_none() => source = Some(kid),
                _ => {}
            }
        }
        source
    }

    /// Header mirrored to the output while this algorithm runs.
    pub fn write_header(&self) -> Option<NodeRef> {
        let algorithm = self.algorithm?;
        self.kids(algorithm)
            .iter()
            .copied()
            .find(|&kid| self.kind(kid) == NodeKind::WriteHeader)
    }

    /// The `file` entry point define, if the algorithm declares one.
    pub fn file_define(&self) -> Option<NodeRef> {
        self.define_of(self.predefined(PredefinedSym::File))
    }

    // Define-node helpers; shapes were validated at install.

    pub fn define_symbol(&self, define: NodeRef) -> Option<SymbolId> {
        self.symbol_id(self.kid(define, 0))
    }

    pub fn define_num_params(&self, define: NodeRef) -> IntType {
        self.int_value(self.kid(define, 1))
            .map(|value| value.value)
            .unwrap_or(0)
    }

    pub fn define_num_locals(&self, define: NodeRef) -> IntType {
        let third = self.kid(define, 2);
        if self.kind(third) == NodeKind::Locals {
            self.int_value(third).map(|value| value.value).unwrap_or(0)
        } else {
            0
        }
    }

    pub fn define_body(&self, define: NodeRef) -> NodeRef {
        let third = self.kid(define, 2);
        if self.kind(third) == NodeKind::Locals {
            self.kid(define, 3)
        } else {
            third
        }
    }

    // Dispatch caches.

    pub fn get_case(&self, select: NodeRef, key: IntType) -> Option<NodeRef> {
        self.cases.get(&select)?.get(&key).copied()
    }

    pub fn opcode_ranges(&self, opcode: NodeRef) -> Option<&[WriteRange]> {
        self.opcode_ranges.get(&opcode).map(|ranges| &ranges[..])
    }

    /// Case covering `value` when writing a multi-byte opcode, along
    /// with the selector shift and payload mask.
    pub fn get_write_case(&self, opcode: NodeRef, value: IntType) -> Option<WriteRange> {
        let ranges = self.opcode_ranges.get(&opcode)?;
        let index = ranges.partition_point(|range| range.max < value);
        let range = ranges.get(index)?;
        (value >= range.min && value <= range.max).then_some(*range)
    }

    /// Dispatch key of a `case` node, resolving `literal.use` through the
    /// symbol's literal definition.
    pub fn case_key(&self, case: NodeRef) -> Result<IntType> {
        let mut key = self.kid(case, 0);
        if self.kind(key) == NodeKind::LiteralUse {
            let sym = self
                .symbol_id(self.kid(key, 0))
                .ok_or_else(|| anyhow!("Malformed literal.use in case"))?;
            let def = self
                .literal_of(sym)
                .ok_or_else(|| anyhow!("Undefined literal: {}", self.symbol_name(sym)))?;
            key = self.kid(def, 1);
        }
        self.int_value(key)
            .map(|value| value.value)
            .ok_or_else(|| anyhow!("Case key is not an integer literal"))
    }

    /// Value of a `literal.action.use` or plain callback symbol.
    pub fn action_value(&self, nd: NodeRef) -> Result<IntType> {
        match self.kind(nd) {
            NodeKind::Symbol => {
                let id = self
                    .symbol_id(nd)
                    .ok_or_else(|| anyhow!("Symbol node without a symbol id"))?;
                match self.predefined_of(id) {
                    PredefinedSym::Unknown => Err(anyhow!(
                        "Callback symbol {} has no action value",
                        self.symbol_name(id)
                    )),
                    sym => Ok(sym.action_value()),
                }
            }
            NodeKind::LiteralActionUse => {
                let sym = self
                    .symbol_id(self.kid(nd, 0))
                    .ok_or_else(|| anyhow!("Malformed literal.action.use"))?;
                match self.literal_action_of(sym) {
                    Some(def) => self
                        .int_value(self.kid(def, 1))
                        .map(|value| value.value)
                        .ok_or_else(|| anyhow!("Malformed literal.action.def")),
                    // Predefined actions need no definition.
                    None => self.action_value(self.kid(nd, 0)),
                }
            }
            kind => Err(anyhow!("Not an action expression: {}", kind.sexp_name())),
        }
    }

    // Installation.

    /// Validate the algorithm and (re)build all lookup caches. Safe to
    /// call again after the tree was edited.
    pub fn install(&mut self) -> Result<()> {
        let root = self
            .algorithm
            .ok_or_else(|| anyhow!("No algorithm to install"))?;
        // Pass 1: drop every cache a previous install may have built.
        self.cases.clear();
        self.opcode_ranges.clear();
        for sym in &self.symbols {
            sym.define.set(None);
            sym.literal.set(None);
            sym.literal_action.set(None);
        }
        // Pass 2: link definitions.
        self.install_definitions(root)?;
        self.import_enclosing_defines()?;
        // Pass 3: validate scopes and build dispatch caches.
        let mut parents = Vec::new();
        self.validate_subtree(root, &mut parents)?;
        for id in 0..self.symbols.len() {
            let sym = SymbolId(id as u32);
            if let Some(define) = self.define_of(sym) {
                self.validate_subtree(define, &mut parents)?;
            }
        }
        Ok(())
    }

    fn install_definitions(&mut self, nd: NodeRef) -> Result<()> {
        match self.kind(nd) {
            NodeKind::Algorithm | NodeKind::Section => {
                for index in 0..self.num_kids(nd) {
                    self.install_definitions(self.kid(nd, index))?;
                }
                Ok(())
            }
            NodeKind::Define => {
                ensure!(
                    self.num_kids(nd) >= 3,
                    "Malformed define: expected (symbol params [locals] body)"
                );
                let sym = self
                    .symbol_id(self.kid(nd, 0))
                    .ok_or_else(|| anyhow!("Malformed define: first kid is not a symbol"))?;
                ensure!(
                    self.kind(self.kid(nd, 1)) == NodeKind::Params,
                    "Malformed define: missing params declaration"
                );
                self.symbols[sym.index()].define.set(Some(nd));
                Ok(())
            }
            NodeKind::LiteralDef => {
                let sym = self
                    .symbol_id(self.kid(nd, 0))
                    .ok_or_else(|| anyhow!("Malformed literal.def"))?;
                self.symbols[sym.index()].literal.set(Some(nd));
                Ok(())
            }
            NodeKind::LiteralActionDef => {
                let sym = self
                    .symbol_id(self.kid(nd, 0))
                    .ok_or_else(|| anyhow!("Malformed literal.action.def"))?;
                self.symbols[sym.index()].literal_action.set(Some(nd));
                Ok(())
            }
            NodeKind::Rename => {
                let old = self
                    .symbol_id(self.kid(nd, 0))
                    .ok_or_else(|| anyhow!("Malformed rename"))?;
                let new = self
                    .symbol_id(self.kid(nd, 1))
                    .ok_or_else(|| anyhow!("Malformed rename"))?;
                // A rename may capture an enclosing definition before a
                // local define overrides the old name.
                let def = match self.define_of(old) {
                    Some(def) => def,
                    None => {
                        let name = self.symbol_name(old).to_string();
                        let enclosing = self.enclosing.clone().ok_or_else(|| {
                            anyhow!("Rename of undefined symbol: {name}")
                        })?;
                        let other = enclosing
                            .lookup_symbol(&name)
                            .and_then(|id| enclosing.define_of(id))
                            .ok_or_else(|| {
                                anyhow!("Rename of undefined symbol: {name}")
                            })?;
                        let mut copied = HashMap::new();
                        self.import_node(&enclosing, other, &mut copied)?
                    }
                };
                self.symbols[new.index()].define.set(Some(def));
                Ok(())
            }
            NodeKind::Undefine => {
                let sym = self
                    .symbol_id(self.kid(nd, 0))
                    .ok_or_else(|| anyhow!("Malformed undefine"))?;
                self.symbols[sym.index()].define.set(None);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Pull definitions for still-unresolved symbols out of the
    /// enclosing scope, copying the subtrees into this arena.
    fn import_enclosing_defines(&mut self) -> Result<()> {
        let Some(enclosing) = self.enclosing.clone() else {
            return Ok(());
        };
        let names: Vec<String> = self
            .symbol_map
            .iter()
            .filter(|(_, id)| self.define_of(**id).is_none())
            .map(|(name, _)| name.clone())
            .collect();
        let mut copied = HashMap::new();
        for name in names {
            let Some(other_id) = enclosing.lookup_symbol(&name) else {
                continue;
            };
            let Some(other_def) = enclosing.define_of(other_id) else {
                continue;
            };
            let local = self.import_node(&enclosing, other_def, &mut copied)?;
            let id = self.symbol(&name);
            self.symbols[id.index()].define.set(Some(local));
        }
        Ok(())
    }

    fn import_node(
        &mut self,
        other: &SymbolTable,
        nd: NodeRef,
        copied: &mut HashMap<NodeRef, NodeRef>,
    ) -> Result<NodeRef> {
        if let Some(&local) = copied.get(&nd) {
            return Ok(local);
        }
        let local = match other.payload(nd) {
            Payload::Symbol(id) => self.symbol_node(other.symbol_name(id)),
            Payload::Int(value) if value.is_default => self.int_default(other.kind(nd)),
            Payload::Int(value) => self.int(other.kind(nd), value.value, value.format),
            Payload::Stream(kind, typ) => self.stream(kind, typ),
            Payload::None => {
                let mut kids = Vec::with_capacity(other.num_kids(nd));
                for index in 0..other.num_kids(nd) {
                    kids.push(self.import_node(other, other.kid(nd, index), copied)?);
                }
                self.create(other.kind(nd), kids)
            }
        };
        copied.insert(nd, local);
        Ok(local)
    }

    fn validate_subtree(&mut self, nd: NodeRef, parents: &mut Vec<NodeRef>) -> Result<()> {
        self.validate_node(nd, parents)?;
        if self.num_kids(nd) > 0 {
            parents.push(nd);
            for index in 0..self.num_kids(nd) {
                self.validate_subtree(self.kid(nd, index), parents)?;
            }
            parents.pop();
        }
        Ok(())
    }

    fn validate_node(&mut self, nd: NodeRef, parents: &[NodeRef]) -> Result<()> {
        match self.kind(nd) {
            NodeKind::Param => {
                let index = self
                    .int_value(nd)
                    .ok_or_else(|| anyhow!("Param without an index"))?
                    .value;
                let define = parents
                    .iter()
                    .rev()
                    .copied()
                    .find(|&parent| self.kind(parent) == NodeKind::Define)
                    .ok_or_else(|| anyhow!("Param {index} outside any define"))?;
                let count = self.define_num_params(define);
                ensure!(
                    index < count,
                    "Param {index} not defined for method {}",
                    self.define_symbol(define)
                        .map(|sym| self.symbol_name(sym).to_string())
                        .unwrap_or_default()
                );
                Ok(())
            }
            NodeKind::Switch | NodeKind::Map => self.install_case_map(nd),
            NodeKind::Opcode => {
                self.install_case_map(nd)?;
                self.install_case_ranges(nd)
                    .context("Installing opcode case ranges")
            }
            _ => Ok(()),
        }
    }

    fn install_case_map(&mut self, nd: NodeRef) -> Result<()> {
        let mut map = BTreeMap::new();
        for index in 0..self.num_kids(nd) {
            let kid = self.kid(nd, index);
            if self.kind(kid) != NodeKind::Case {
                continue;
            }
            let key = self.case_key(kid)?;
            ensure!(
                map.insert(key, kid).is_none(),
                "Duplicate case key {key} in {}",
                self.kind(nd).sexp_name()
            );
        }
        self.cases.insert(nd, map);
        Ok(())
    }

    /// Width in bits of an opcode selector format node.
    fn case_selector_width(&self, nd: NodeRef) -> Result<u32> {
        ensure!(
            self.kind(nd).is_fixed_format(),
            "Non-fixed-width opcode selector: {}",
            self.kind(nd).sexp_name()
        );
        let value = self
            .int_value(nd)
            .ok_or_else(|| anyhow!("Format node without an integer value"))?;
        let width = if value.is_default {
            self.kind(nd)
                .natural_bits()
                .ok_or_else(|| anyhow!("Fixed format without a natural width"))?
        } else {
            u32::try_from(value.value).unwrap_or(MAX_OPCODE_WIDTH)
        };
        ensure!(
            width > 0 && width < MAX_OPCODE_WIDTH,
            "Opcode selector width {width} out of range"
        );
        Ok(width)
    }

    fn collect_case_widths(
        &self,
        key: IntType,
        nd: NodeRef,
        widths: &mut BTreeSet<u32>,
    ) -> Result<()> {
        match self.kind(nd) {
            NodeKind::Opcode => {
                if self.kind(self.kid(nd, 0)) == NodeKind::LastRead {
                    // Nested dispatch reusing the outer read.
                    for index in 1..self.num_kids(nd) {
                        let case = self.kid(nd, index);
                        let case_key = self.case_key(case)?;
                        if case_key == key {
                            continue;
                        }
                        self.collect_case_widths(case_key, self.kid(case, 1), widths)?;
                    }
                } else {
                    let width = self.case_selector_width(self.kid(nd, 0))?;
                    widths.insert(width);
                    for index in 1..self.num_kids(nd) {
                        let case = self.kid(nd, index);
                        let case_key = self.case_key(case)?;
                        let mut local = BTreeSet::new();
                        self.collect_case_widths(case_key, self.kid(case, 1), &mut local)?;
                        for case_width in local {
                            let combined = width + case_width;
                            ensure!(
                                combined < MAX_OPCODE_WIDTH,
                                "Opcode bit widths too big: {combined}"
                            );
                            widths.insert(combined);
                        }
                    }
                }
                Ok(())
            }
            _ => {
                widths.insert(self.case_selector_width(nd)?);
                Ok(())
            }
        }
    }

    fn install_case_ranges(&mut self, nd: NodeRef) -> Result<()> {
        let initial_width = self.case_selector_width(self.kid(nd, 0))?;
        let mut ranges = Vec::new();
        for index in 1..self.num_kids(nd) {
            let case = self.kid(nd, index);
            ensure!(
                self.kind(case) == NodeKind::Case,
                "Opcode kids must be cases"
            );
            let key = self.case_key(case)?;
            let mut widths = BTreeSet::new();
            self.collect_case_widths(key, self.kid(case, 1), &mut widths)?;
            for nested in widths {
                let total = initial_width + nested;
                ensure!(
                    total <= MAX_OPCODE_WIDTH,
                    "Opcode bit widths too big: {total}"
                );
                let min = key << nested;
                let max = min + width_mask(nested);
                ranges.push(WriteRange {
                    min,
                    max,
                    shift: nested,
                    case,
                });
            }
        }
        ranges.sort();
        for pair in ranges.windows(2) {
            ensure!(
                pair[0].max < pair[1].min,
                "Opcode case ranges overlap: [{:#x}..{:#x}] and [{:#x}..{:#x}]",
                pair[0].min,
                pair[0].max,
                pair[1].min,
                pair[1].max
            );
        }
        self.opcode_ranges.insert(nd, ranges);
        Ok(())
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable")
            .field("nodes", &self.nodes.len())
            .field("symbols", &self.symbols.len())
            .field("algorithm", &self.algorithm)
            .finish()
    }
}
