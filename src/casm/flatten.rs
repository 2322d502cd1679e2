use anyhow::{anyhow, Result};

use super::symbol_index::SymbolIndex;
use crate::ast::{Arity, NodeKind, NodeRef, Payload, PredefinedSym, SymbolTable};
use crate::interp::{IntEntry, IntStreamRef, IntTypeFormat};
use crate::stream::pack_stream;
use crate::IntType;

/// Serialize an installed algorithm into a linear integer stream.
///
/// Nodes are written kid-first (postorder) with their opcode last;
/// selection points are framed with the predefined callback actions so
/// the inflater can reassemble the tree shape without storing it.
pub struct FlattenAst<'a> {
    symtab: &'a SymbolTable,
    output: IntStreamRef,
    sym_index: SymbolIndex,
}

impl<'a> FlattenAst<'a> {
    pub fn new(symtab: &'a SymbolTable, output: IntStreamRef) -> Self {
        Self {
            symtab,
            output,
            sym_index: SymbolIndex::new(),
        }
    }

    /// Flatten the installed algorithm and freeze the output stream.
    pub fn flatten(mut self) -> Result<()> {
        let root = self
            .symtab
            .algorithm()
            .ok_or_else(|| anyhow!("No algorithm to flatten"))?;
        self.flatten_node(root)?;
        self.output.borrow_mut().freeze();
        Ok(())
    }

    fn write(&mut self, value: IntType) -> Result<()> {
        self.output
            .borrow_mut()
            .push(IntEntry::Value(value))
            .map_err(|error| anyhow!("{error}"))
    }

    fn write_action(&mut self, action: PredefinedSym) -> Result<()> {
        self.output
            .borrow_mut()
            .push(IntEntry::Action(action.action_value()))
            .map_err(|error| anyhow!("{error}"))
    }

    fn write_header_value(&mut self, value: IntType, format: IntTypeFormat) -> Result<()> {
        self.output
            .borrow_mut()
            .push(IntEntry::Header(value, format))
            .map_err(|error| anyhow!("{error}"))
    }

    fn opcode(&self, kind: NodeKind) -> IntType {
        IntType::from(u32::from(kind))
    }

    fn flatten_node(&mut self, nd: NodeRef) -> Result<()> {
        let kind = self.symtab.kind(nd);
        match kind.arity() {
            Arity::Integer => {
                let value = self
                    .symtab
                    .int_value(nd)
                    .ok_or_else(|| anyhow!("Integer node without a value"))?;
                self.write(self.opcode(kind))?;
                self.write_action(PredefinedSym::IntValueBegin)?;
                if value.is_default {
                    self.write(0)?;
                } else {
                    self.write(value.format.into_raw() + 1)?;
                    self.write(value.value)?;
                }
                self.write_action(PredefinedSym::IntValueEnd)
            }
            Arity::Symbol => {
                let id = self
                    .symtab
                    .symbol_id(nd)
                    .ok_or_else(|| anyhow!("Symbol node without a symbol id"))?;
                let index = self
                    .sym_index
                    .index_of(id)
                    .ok_or_else(|| anyhow!("Symbol not indexed: {}", self.symtab.symbol_name(id)))?;
                self.write(self.opcode(kind))?;
                self.write(index as IntType)?;
                self.write_action(PredefinedSym::SymbolLookup)
            }
            Arity::Nullary if kind == NodeKind::Stream => {
                let Payload::Stream(stream_kind, stream_type) = self.symtab.payload(nd) else {
                    return Err(anyhow!("Stream node without stream payload"));
                };
                self.write(self.opcode(kind))?;
                self.write(pack_stream(stream_kind, stream_type))?;
                self.write_action(PredefinedSym::NaryInst)
            }
            Arity::Nullary | Arity::Unary | Arity::Binary | Arity::Ternary => {
                for index in 0..self.symtab.num_kids(nd) {
                    self.flatten_node(self.symtab.kid(nd, index))?;
                }
                self.write(self.opcode(kind))?;
                self.write_action(PredefinedSym::PostorderInst)
            }
            Arity::Nary if kind == NodeKind::Algorithm => self.flatten_algorithm(nd),
            Arity::Nary => {
                for index in 0..self.symtab.num_kids(nd) {
                    self.flatten_node(self.symtab.kid(nd, index))?;
                }
                self.write(self.opcode(kind))?;
                self.write(self.symtab.num_kids(nd) as IntType)?;
                self.write_action(PredefinedSym::NaryInst)
            }
        }
    }

    fn flatten_algorithm(&mut self, nd: NodeRef) -> Result<()> {
        let num_kids = self.symtab.num_kids(nd);
        if num_kids < 1 || self.symtab.kind(self.symtab.kid(nd, 0)) != NodeKind::SourceHeader {
            return Err(anyhow!("Algorithm doesn't begin with a source header"));
        }
        // The source header goes out raw; the reader knows its shape
        // and rebuilds the node while checking the constants.
        let header = self.symtab.kid(nd, 0);
        for index in 0..self.symtab.num_kids(header) {
            let lit = self.symtab.kid(header, index);
            let value = self
                .symtab
                .int_value(lit)
                .ok_or_else(|| anyhow!("Unrecognized literal constant in source header"))?;
            let format = IntTypeFormat::from_kind(self.symtab.kind(lit))
                .ok_or_else(|| anyhow!("Bad literal constant in source header"))?;
            self.write_header_value(value.value, format)?;
        }

        // The rest of the algorithm lives in a sized block, beginning
        // with the symbol-name table.
        self.write_action(PredefinedSym::BlockEnter)?;
        self.sym_index.install(self.symtab, nd);
        let count = self.sym_index.len();
        self.write(count as IntType)?;
        for position in 0..count {
            let id = self
                .sym_index
                .get(position)
                .ok_or_else(|| anyhow!("Symbol index out of range: {position}"))?;
            let name = self.symtab.symbol_name(id).to_string();
            self.write(name.len() as IntType)?;
            self.write_action(PredefinedSym::SymbolNameBegin)?;
            for byte in name.bytes() {
                self.write(IntType::from(byte))?;
            }
            self.write_action(PredefinedSym::SymbolNameEnd)?;
        }

        for index in 1..num_kids {
            self.flatten_node(self.symtab.kid(nd, index))?;
        }

        self.write(self.opcode(NodeKind::Algorithm))?;
        self.write(num_kids as IntType)?;
        self.write_action(PredefinedSym::NaryInst)?;
        self.write_action(PredefinedSym::BlockExit)
    }
}
