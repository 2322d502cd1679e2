use anyhow::{anyhow, Result};

use super::symbol_index::SymbolIndex;
use crate::ast::{Arity, NodeKind, NodeRef, PredefinedSym, SymbolTable, ValueFormat};
use crate::interp::thrown::TResult;
use crate::interp::{IntTypeFormat, StreamOutput, Thrown};
use crate::stream::{unpack_stream, StreamType};
use crate::IntType;

/// Writer that reassembles an AST from a flattened integer stream.
///
/// Every written integer lands on a value stack; the predefined
/// callback actions tell the inflater when to fold stack prefixes into
/// nodes. The final `Algorithm` action installs the finished tree.
pub struct InflateAst {
    symtab: Option<SymbolTable>,
    sym_index: SymbolIndex,
    values: Vec<IntType>,
    asts: Vec<NodeRef>,
    value_marker: usize,
    symbol_name_size: usize,
    install_during_inflation: bool,
}

impl InflateAst {
    pub fn new() -> Self {
        Self {
            symtab: Some(SymbolTable::new()),
            sym_index: SymbolIndex::new(),
            values: Vec::new(),
            asts: Vec::new(),
            value_marker: 0,
            symbol_name_size: 0,
            install_during_inflation: true,
        }
    }

    pub fn with_enclosing(enclosing: std::rc::Rc<SymbolTable>) -> Self {
        let mut inflater = Self::new();
        inflater.symtab = Some(SymbolTable::with_enclosing(enclosing));
        inflater
    }

    pub fn set_install_during_inflation(&mut self, install: bool) {
        self.install_during_inflation = install;
    }

    /// Hand out the rebuilt table. Fails when no complete algorithm was
    /// assembled.
    pub fn into_symtab(mut self) -> Result<SymbolTable> {
        let symtab = self
            .symtab
            .take()
            .ok_or_else(|| anyhow!("Inflater already consumed"))?;
        if symtab.algorithm().is_none() {
            return Err(anyhow!("Unable to read (inflate) algorithm"));
        }
        if self.asts.len() != 1 {
            return Err(anyhow!(
                "Malformed algorithm stream: {} dangling trees",
                self.asts.len()
            ));
        }
        Ok(symtab)
    }

    fn symtab_mut(&mut self) -> TResult<&mut SymbolTable> {
        self.symtab
            .as_mut()
            .ok_or_else(|| Thrown::fatal("Inflater already consumed"))
    }

    fn fail_malformed(&self, context: &str) -> Thrown {
        Thrown::malformed(format!("Input malformed: {context}"))
    }

    fn push(&mut self, value: IntType) -> TResult<()> {
        self.values.push(value);
        Ok(())
    }

    fn pop_value(&mut self) -> TResult<IntType> {
        self.values
            .pop()
            .ok_or_else(|| self.fail_malformed("value stack underflow"))
    }

    fn pop_ast(&mut self) -> TResult<NodeRef> {
        self.asts
            .pop()
            .ok_or_else(|| self.fail_malformed("tree stack underflow"))
    }

    fn apply_op(&mut self, op: IntType) -> TResult<()> {
        let kind = u32::try_from(op)
            .ok()
            .and_then(|raw| NodeKind::try_from(raw).ok())
            .ok_or_else(|| self.fail_malformed("unknown opcode"))?;
        match kind.arity() {
            Arity::Nullary if kind == NodeKind::Stream => {
                let packed = self.pop_value()?;
                self.pop_value()?; // opcode
                let (stream_kind, stream_type) =
                    unpack_stream(packed).map_err(|error| Thrown::malformed(error.to_string()))?;
                let nd = self.symtab_mut()?.stream(stream_kind, stream_type);
                self.asts.push(nd);
                Ok(())
            }
            Arity::Nullary => {
                self.pop_value()?; // opcode
                let nd = self.symtab_mut()?.create(kind, Vec::new());
                self.asts.push(nd);
                Ok(())
            }
            Arity::Unary => {
                self.pop_value()?;
                let arg = self.pop_ast()?;
                let nd = self.symtab_mut()?.create(kind, vec![arg]);
                self.asts.push(nd);
                Ok(())
            }
            Arity::Binary => {
                self.pop_value()?;
                let arg2 = self.pop_ast()?;
                let arg1 = self.pop_ast()?;
                let nd = self.symtab_mut()?.create(kind, vec![arg1, arg2]);
                self.asts.push(nd);
                Ok(())
            }
            Arity::Ternary => {
                self.pop_value()?;
                let arg3 = self.pop_ast()?;
                let arg2 = self.pop_ast()?;
                let arg1 = self.pop_ast()?;
                let nd = self.symtab_mut()?.create(kind, vec![arg1, arg2, arg3]);
                self.asts.push(nd);
                Ok(())
            }
            Arity::Nary => {
                let num_args = self.pop_value()? as usize;
                self.pop_value()?;
                if num_args > self.asts.len() {
                    return Err(self.fail_malformed("nary child count exceeds built trees"));
                }
                let kids = self.asts.split_off(self.asts.len() - num_args);
                let nd = self.symtab_mut()?.create(kind, kids);
                self.asts.push(nd);
                if kind == NodeKind::Algorithm {
                    let symtab = self.symtab_mut()?;
                    symtab.set_algorithm(nd);
                    if self.install_during_inflation {
                        self.symtab_mut()?
                            .install()
                            .map_err(|error| Thrown::malformed(error.to_string()))?;
                    }
                }
                Ok(())
            }
            Arity::Symbol => {
                let index = self.pop_value()? as usize;
                self.pop_value()?;
                let id = self
                    .sym_index
                    .get(index)
                    .ok_or_else(|| self.fail_malformed("symbol index out of range"))?;
                let nd = self.symtab_mut()?.node_of_symbol(id);
                self.asts.push(nd);
                Ok(())
            }
            Arity::Integer => Err(self.fail_malformed("integer opcode outside value protocol")),
        }
    }

    fn apply_int_value_end(&mut self) -> TResult<()> {
        if self.values.len() < self.value_marker {
            return Err(self.fail_malformed("value marker out of range"));
        }
        let (is_default, value, format) = match self.values.len() - self.value_marker {
            1 => {
                if self.pop_value()? != 0 {
                    return Err(self.fail_malformed("expected default literal marker"));
                }
                (true, 0, ValueFormat::Decimal)
            }
            2 => {
                let value = self.pop_value()?;
                let raw = self.pop_value()?;
                let format = raw
                    .checked_sub(1)
                    .ok_or_else(|| self.fail_malformed("bad literal format"))
                    .and_then(|raw| {
                        ValueFormat::from_raw(raw)
                            .map_err(|error| Thrown::malformed(error.to_string()))
                    })?;
                (false, value, format)
            }
            _ => return Err(self.fail_malformed("unexpected literal value count")),
        };
        let op = self.pop_value()?;
        let kind = u32::try_from(op)
            .ok()
            .and_then(|raw| NodeKind::try_from(raw).ok())
            .filter(|kind| kind.is_integer())
            .ok_or_else(|| self.fail_malformed("bad integer opcode"))?;
        let symtab = self.symtab_mut()?;
        let nd = if is_default {
            symtab.int_default(kind)
        } else {
            symtab.int(kind, value, format)
        };
        self.asts.push(nd);
        Ok(())
    }

    fn apply_symbol_name_end(&mut self) -> TResult<()> {
        if self.values.len() < self.symbol_name_size {
            return Err(self.fail_malformed("symbol name longer than value stack"));
        }
        let start = self.values.len() - self.symbol_name_size;
        let name: String = self.values[start..]
            .iter()
            .map(|&byte| char::from(byte as u8))
            .collect();
        self.values.truncate(start);
        self.symbol_name_size = 0;
        let id = self.symtab_mut()?.symbol(&name);
        self.sym_index.add(id);
        Ok(())
    }
}

impl Default for InflateAst {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamOutput for InflateAst {
    fn stream_type(&self) -> StreamType {
        StreamType::Int
    }

    fn write_u8(&mut self, value: u8) -> TResult<()> {
        self.push(IntType::from(value))
    }

    fn write_u32(&mut self, value: u32) -> TResult<()> {
        self.push(IntType::from(value))
    }

    fn write_u64(&mut self, value: u64) -> TResult<()> {
        self.push(value)
    }

    fn write_varint32(&mut self, value: i32) -> TResult<()> {
        self.push(value as i64 as IntType)
    }

    fn write_varint64(&mut self, value: i64) -> TResult<()> {
        self.push(value as IntType)
    }

    fn write_varuint32(&mut self, value: u32) -> TResult<()> {
        self.push(IntType::from(value))
    }

    fn write_varuint64(&mut self, value: u64) -> TResult<()> {
        self.push(value)
    }

    fn write_bit(&mut self, value: u8) -> TResult<()> {
        self.push(IntType::from(value & 1))
    }

    fn write_bits(&mut self, value: u64, _count: u32) -> TResult<()> {
        self.push(value)
    }

    fn align_to_byte(&mut self) -> TResult<()> {
        Ok(())
    }

    fn write_block_enter(&mut self) -> TResult<()> {
        Ok(())
    }

    fn write_block_exit(&mut self) -> TResult<()> {
        Ok(())
    }

    fn write_value(&mut self, value: IntType, _kind: NodeKind, _width: Option<u32>) -> TResult<()> {
        self.push(value)
    }

    fn write_header_value(&mut self, value: IntType, format: IntTypeFormat) -> TResult<()> {
        // Header constants assemble the source header node directly.
        if self.asts.is_empty() {
            let nd = self.symtab_mut()?.create(NodeKind::SourceHeader, Vec::new());
            self.asts.push(nd);
        }
        if self.asts.len() != 1 {
            return Err(self.fail_malformed("header value outside file header"));
        }
        let const_kind = match format {
            IntTypeFormat::Uint8 => NodeKind::U8Const,
            IntTypeFormat::Uint32 => NodeKind::U32Const,
            IntTypeFormat::Uint64 => NodeKind::U64Const,
            _ => return Err(self.fail_malformed("header value format")),
        };
        let header = self.asts[0];
        let symtab = self.symtab_mut()?;
        let lit = symtab.int(const_kind, value, ValueFormat::Hexadecimal);
        symtab.append_kid(header, lit);
        Ok(())
    }

    fn write_action(&mut self, action: IntType) -> TResult<bool> {
        let sym = u32::try_from(action)
            .ok()
            .and_then(|raw| PredefinedSym::try_from(raw).ok());
        match sym {
            Some(PredefinedSym::IntValueBegin) => {
                self.value_marker = self.values.len();
                Ok(true)
            }
            Some(PredefinedSym::IntValueEnd) => {
                self.apply_int_value_end()?;
                Ok(true)
            }
            Some(PredefinedSym::SymbolNameBegin) => {
                self.symbol_name_size = self.pop_value()? as usize;
                Ok(true)
            }
            Some(PredefinedSym::SymbolNameEnd) => {
                self.apply_symbol_name_end()?;
                Ok(true)
            }
            Some(PredefinedSym::SymbolLookup) | Some(PredefinedSym::NaryInst) => {
                if self.values.len() < 2 {
                    return Err(self.fail_malformed("instruction needs opcode and operand"));
                }
                let op = self.values[self.values.len() - 2];
                self.apply_op(op)?;
                Ok(true)
            }
            Some(PredefinedSym::PostorderInst) => {
                let op = *self
                    .values
                    .last()
                    .ok_or_else(|| self.fail_malformed("instruction needs an opcode"))?;
                self.apply_op(op)?;
                Ok(true)
            }
            Some(PredefinedSym::BlockEnter | PredefinedSym::BlockExit) => Ok(true),
            _ => Ok(true),
        }
    }

    fn write_freeze_eof(&mut self) -> TResult<()> {
        Ok(())
    }
}
