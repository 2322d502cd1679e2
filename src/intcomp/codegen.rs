use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use anyhow::Result;

use super::count::{CountKind, CountNodeRc};
use super::flags::CompressionFlags;
use super::huffman::HuffNode;
use crate::ast::{NodeKind, NodeRef, PredefinedSym, SymbolTable, ValueFormat};
use crate::{
    CASM_BINARY_MAGIC, CASM_BINARY_VERSION, CISM_BINARY_MAGIC, CISM_BINARY_VERSION,
    IntType, WASM_BINARY_MAGIC,
};

// Well-known category codes of the CISM model. Abbreviations colliding
// with these are renamed to the lowest free indices, in ascending
// index order, so the remap is deterministic.
const CISM_DEFAULT_MULTIPLE_VALUE: IntType = 16766;
const CISM_DEFAULT_SINGLE_VALUE: IntType = 16767;
const CISM_BLOCK_ENTER_VALUE: IntType = 16768;
const CISM_BLOCK_EXIT_VALUE: IntType = 16769;
const CISM_ALIGN_VALUE: IntType = 16770;

const SPECIAL_VALUES: [IntType; 5] = [
    CISM_DEFAULT_SINGLE_VALUE,
    CISM_DEFAULT_MULTIPLE_VALUE,
    CISM_BLOCK_ENTER_VALUE,
    CISM_BLOCK_EXIT_VALUE,
    CISM_ALIGN_VALUE,
];

const CATEGORIZE_NAME: &str = "categorize";
const OPCODE_NAME: &str = "opcode";
const PROCESS_NAME: &str = "process";
const VALUES_NAME: &str = "values";
const OLD_SUFFIX: &str = ".old";
const ENCLOSING_NAME: &str = "cism";

/// Synthesizes the filter algorithm that decodes (or re-encodes) a set
/// of selected abbreviations.
pub struct AbbreviationCodegen<'a> {
    flags: &'a CompressionFlags,
    assignments: &'a [CountNodeRc],
    encoding_root: Option<&'a HuffNode>,
    /// True for the decoding direction (abbreviations in, values out).
    to_read: bool,
}

impl<'a> AbbreviationCodegen<'a> {
    pub fn new(
        flags: &'a CompressionFlags,
        assignments: &'a [CountNodeRc],
        encoding_root: Option<&'a HuffNode>,
        to_read: bool,
    ) -> Self {
        Self {
            flags,
            assignments,
            encoding_root,
            to_read,
        }
    }

    /// Build and install the generated algorithm.
    pub fn generate(&self, wasm_version: u32) -> Result<Rc<SymbolTable>> {
        let mut symtab = SymbolTable::new();
        let mut kids = Vec::new();
        kids.push(self.generate_header(
            &mut symtab,
            NodeKind::SourceHeader,
            &[CASM_BINARY_MAGIC, CASM_BINARY_VERSION, wasm_version],
        ));
        let cism = [CISM_BINARY_MAGIC, CISM_BINARY_VERSION];
        let wasm = [WASM_BINARY_MAGIC, wasm_version];
        if self.to_read {
            kids.push(self.generate_header(&mut symtab, NodeKind::ReadHeader, &cism));
            kids.push(self.generate_header(&mut symtab, NodeKind::WriteHeader, &wasm));
        } else {
            kids.push(self.generate_header(&mut symtab, NodeKind::ReadHeader, &wasm));
            kids.push(self.generate_header(&mut symtab, NodeKind::WriteHeader, &cism));
        }
        if self.flags.use_cism_model {
            kids.push(self.generate_enclosing(&mut symtab));
            if !self.to_read {
                kids.push(self.generate_rename(&mut symtab, PROCESS_NAME));
                kids.push(self.generate_process_function(&mut symtab));
                kids.push(self.generate_values_function(&mut symtab));
            }
            kids.push(self.generate_opcode_function(&mut symtab));
            kids.push(self.generate_categorize_function(&mut symtab));
        } else {
            kids.push(self.generate_start_function(&mut symtab));
        }
        let algorithm = symtab.create(NodeKind::Algorithm, kids);
        symtab.set_algorithm(algorithm);
        symtab.install()?;
        Ok(Rc::new(symtab))
    }

    fn generate_header(
        &self,
        symtab: &mut SymbolTable,
        kind: NodeKind,
        values: &[u32],
    ) -> NodeRef {
        let kids = values
            .iter()
            .map(|&value| {
                symtab.int(
                    NodeKind::U32Const,
                    IntType::from(value),
                    ValueFormat::Hexadecimal,
                )
            })
            .collect();
        symtab.create(kind, kids)
    }

    fn generate_enclosing(&self, symtab: &mut SymbolTable) -> NodeRef {
        let name = symtab.symbol_node(ENCLOSING_NAME);
        symtab.create(NodeKind::EnclosingAlgorithms, vec![name])
    }

    fn generate_rename(&self, symtab: &mut SymbolTable, name: &str) -> NodeRef {
        let from = symtab.symbol_node(name);
        let to = symtab.symbol_node(&format!("{name}{OLD_SUFFIX}"));
        symtab.create(NodeKind::Rename, vec![from, to])
    }

    fn align_after_abbrevs(&self) -> bool {
        // Huffman codes leave the cursor mid-byte; realigning after
        // each unit keeps the loop's eob check on byte boundaries.
        self.flags.align_opcodes || self.flags.use_huffman_encoding
    }

    fn generate_start_function(&self, symtab: &mut SymbolTable) -> NodeRef {
        let file = symtab.predefined_node(PredefinedSym::File);
        let params = symtab.int_default(NodeKind::Params);
        let locals = symtab.int_default(NodeKind::Locals);
        let mut step = self.generate_switch_statement(symtab);
        if self.align_after_abbrevs() {
            let align = self.generate_callback(symtab, PredefinedSym::Align);
            step = symtab.create(NodeKind::Sequence, vec![step, align]);
        }
        let body = symtab.create(NodeKind::LoopUnbounded, vec![step]);
        symtab.create(NodeKind::Define, vec![file, params, locals, body])
    }

    fn generate_switch_statement(&self, symtab: &mut SymbolTable) -> NodeRef {
        let selector = self.generate_abbreviation_read(symtab);
        let mut kids = vec![selector, symtab.create(NodeKind::Error, Vec::new())];
        for node in self.assignments {
            let Some(index) = node.abbrev_index() else {
                continue;
            };
            let action = self.generate_action(symtab, node);
            kids.push(self.generate_case(symtab, index, action));
        }
        symtab.create(NodeKind::Switch, kids)
    }

    fn generate_case(&self, symtab: &mut SymbolTable, key: IntType, body: NodeRef) -> NodeRef {
        let key = symtab.int(NodeKind::U64Const, key, ValueFormat::Decimal);
        symtab.create(NodeKind::Case, vec![key, body])
    }

    fn generate_abbreviation_read(&self, symtab: &mut SymbolTable) -> NodeRef {
        let format = match self.encoding_root {
            Some(root) => {
                let tree = self.generate_huffman_encoding(symtab, root);
                symtab.create(NodeKind::BinaryEval, vec![tree])
            }
            None => symtab.int_default(self.flags.abbrev_format.to_kind()),
        };
        if self.to_read {
            symtab.create(NodeKind::Read, vec![format])
        } else {
            format
        }
    }

    fn generate_huffman_encoding(&self, symtab: &mut SymbolTable, node: &HuffNode) -> NodeRef {
        match node {
            HuffNode::Selector(selector) => {
                let kid1 = self.generate_huffman_encoding(symtab, &selector.kid(0));
                let kid2 = self.generate_huffman_encoding(symtab, &selector.kid(1));
                symtab.create(NodeKind::BinarySelect, vec![kid1, kid2])
            }
            HuffNode::Symbol(symbol) => symtab.int(
                NodeKind::BinaryAccept,
                symbol.id() as IntType,
                ValueFormat::Decimal,
            ),
        }
    }

    fn generate_action(&self, symtab: &mut SymbolTable, node: &CountNodeRc) -> NodeRef {
        match node.kind() {
            CountKind::Singleton | CountKind::Sequence => {
                self.generate_int_lit_action(symtab, node)
            }
            CountKind::BlockEnter => self.generate_callback(
                symtab,
                if self.to_read {
                    PredefinedSym::BlockEnter
                } else {
                    PredefinedSym::BlockEnterWriteonly
                },
            ),
            CountKind::BlockExit => self.generate_callback(
                symtab,
                if self.to_read {
                    PredefinedSym::BlockExit
                } else {
                    PredefinedSym::BlockExitWriteonly
                },
            ),
            CountKind::DefaultSingle => self.generate_default_single_action(symtab),
            CountKind::DefaultMultiple => self.generate_default_multiple_action(symtab),
            CountKind::Align => self.generate_callback(symtab, PredefinedSym::Align),
            CountKind::Root => symtab.create(NodeKind::Error, Vec::new()),
        }
    }

    fn generate_callback(&self, symtab: &mut SymbolTable, sym: PredefinedSym) -> NodeRef {
        let symbol = symtab.predefined_node(sym);
        let action = symtab.create(NodeKind::LiteralActionUse, vec![symbol]);
        symtab.create(NodeKind::Callback, vec![action])
    }

    fn generate_default_single_action(&self, symtab: &mut SymbolTable) -> NodeRef {
        symtab.int_default(NodeKind::Varint64)
    }

    fn generate_default_multiple_action(&self, symtab: &mut SymbolTable) -> NodeRef {
        let mut size = symtab.int_default(NodeKind::Varuint64);
        if self.to_read {
            size = symtab.create(NodeKind::Read, vec![size]);
        }
        let body = self.generate_default_single_action(symtab);
        symtab.create(NodeKind::Loop, vec![size, body])
    }

    /// Decoding a sequence abbreviation writes the original values out.
    fn generate_int_lit_action(&self, symtab: &mut SymbolTable, node: &CountNodeRc) -> NodeRef {
        if !self.to_read {
            return symtab.create(NodeKind::Void, Vec::new());
        }
        let mut kids = vec![symtab.int_default(NodeKind::Varuint64)];
        for value in node.sequence_values() {
            kids.push(symtab.int(NodeKind::U64Const, value, ValueFormat::Decimal));
        }
        symtab.create(NodeKind::Write, kids)
    }

    // CISM model functions.

    fn generate_values_function(&self, symtab: &mut SymbolTable) -> NodeRef {
        let name = symtab.symbol_node(VALUES_NAME);
        let params = symtab.int_default(NodeKind::Params);
        let locals = symtab.int_default(NodeKind::Locals);
        let size = symtab.int_default(NodeKind::Varuint64);
        let value = symtab.int_default(NodeKind::Varint64);
        let body = symtab.create(NodeKind::Loop, vec![size, value]);
        symtab.create(NodeKind::Define, vec![name, params, locals, body])
    }

    fn generate_process_function(&self, symtab: &mut SymbolTable) -> NodeRef {
        let name = symtab.symbol_node(PROCESS_NAME);
        let params = symtab.int(NodeKind::Params, 1, ValueFormat::Decimal);
        let locals = symtab.int_default(NodeKind::Locals);
        let selector = symtab.int(NodeKind::Param, 0, ValueFormat::Decimal);
        let old = symtab.symbol_node(&format!("{PROCESS_NAME}{OLD_SUFFIX}"));
        let arg = symtab.int(NodeKind::Param, 0, ValueFormat::Decimal);
        let default = symtab.create(NodeKind::Eval, vec![old, arg]);
        let enter_case = {
            let body =
                self.generate_callback(symtab, PredefinedSym::BlockEnterWriteonly);
            self.generate_case(symtab, CISM_BLOCK_ENTER_VALUE, body)
        };
        let exit_case = {
            let body = self.generate_callback(symtab, PredefinedSym::BlockExitWriteonly);
            self.generate_case(symtab, CISM_BLOCK_EXIT_VALUE, body)
        };
        let switch = symtab.create(
            NodeKind::Switch,
            vec![selector, default, enter_case, exit_case],
        );
        symtab.create(NodeKind::Define, vec![name, params, locals, switch])
    }

    fn generate_opcode_function(&self, symtab: &mut SymbolTable) -> NodeRef {
        let name = symtab.symbol_node(OPCODE_NAME);
        let params = symtab.int_default(NodeKind::Params);
        let read = self.generate_abbreviation_read(symtab);
        if !self.flags.align_opcodes {
            let locals = symtab.int_default(NodeKind::Locals);
            return symtab.create(NodeKind::Define, vec![name, params, locals, read]);
        }
        // Keep the value in a local across the alignment callback.
        let locals = symtab.int(NodeKind::Locals, 1, ValueFormat::Decimal);
        let slot = symtab.int(NodeKind::Local, 0, ValueFormat::Decimal);
        let set = symtab.create(NodeKind::Set, vec![slot, read]);
        let align = self.generate_callback(symtab, PredefinedSym::Align);
        let result = symtab.int(NodeKind::Local, 0, ValueFormat::Decimal);
        let body = symtab.create(NodeKind::Sequence, vec![set, align, result]);
        symtab.create(NodeKind::Define, vec![name, params, locals, body])
    }

    fn generate_categorize_function(&self, symtab: &mut SymbolTable) -> NodeRef {
        let name = symtab.symbol_node(CATEGORIZE_NAME);
        let params = symtab.int(NodeKind::Params, 1, ValueFormat::Decimal);
        let locals = symtab.int_default(NodeKind::Locals);
        let selector = symtab.int(NodeKind::Param, 0, ValueFormat::Decimal);
        let mut kids = vec![selector];
        for (index, category) in self.categorize_map() {
            let body = symtab.int(NodeKind::U64Const, category, ValueFormat::Decimal);
            kids.push(self.generate_case(symtab, index, body));
        }
        let map = symtab.create(NodeKind::Map, kids);
        symtab.create(NodeKind::Define, vec![name, params, locals, map])
    }

    /// Abbreviation index → category code. Indices that collide with a
    /// special code are renamed to the lowest free index.
    fn categorize_map(&self) -> BTreeMap<IntType, IntType> {
        let used: BTreeSet<IntType> = self
            .assignments
            .iter()
            .filter_map(|node| node.abbrev_index())
            .collect();
        let mut fix_map = BTreeMap::new();
        let mut next_avail = 0;
        for special in SPECIAL_VALUES {
            if used.contains(&special) {
                while used.contains(&next_avail) || fix_map.values().any(|&v| v == next_avail) {
                    next_avail += 1;
                }
            }
            fix_map.insert(special, next_avail);
            next_avail += 1;
        }
        let mut map = BTreeMap::new();
        for node in self.assignments {
            let Some(index) = node.abbrev_index() else {
                continue;
            };
            if let Some(&fixed) = fix_map.get(&index) {
                map.insert(index, fixed);
                continue;
            }
            let category = match node.kind() {
                CountKind::DefaultSingle => Some(CISM_DEFAULT_SINGLE_VALUE),
                CountKind::DefaultMultiple => Some(CISM_DEFAULT_MULTIPLE_VALUE),
                CountKind::BlockEnter => Some(CISM_BLOCK_ENTER_VALUE),
                CountKind::BlockExit => Some(CISM_BLOCK_EXIT_VALUE),
                CountKind::Align => Some(CISM_ALIGN_VALUE),
                _ => None,
            };
            if let Some(category) = category {
                map.insert(index, category);
            }
        }
        map
    }
}
