use std::rc::Rc;

use anyhow::{anyhow, ensure, Context, Result};

use super::inflate::InflateAst;
use crate::ast::{Arity, NodeKind, PredefinedSym, SymbolTable};
use crate::interp::{IntTypeFormat, StreamOutput};
use crate::stream::{QueueRef, ReadCursor, ReadFormats};
use crate::{CASM_BINARY_MAGIC, CASM_BINARY_VERSION};

/// Reader of CASM (binary compressed algorithm) files.
///
/// Walks the flattened grammar directly and drives an [`InflateAst`]
/// through the same value/action protocol the interpreter-driven path
/// uses, so either driver reassembles identical trees.
pub struct CasmReader {
    install: bool,
}

impl CasmReader {
    pub fn new() -> Self {
        Self { install: true }
    }

    pub fn set_install(&mut self, install: bool) -> &mut Self {
        self.install = install;
        self
    }

    /// Probe whether `queue` starts with a plausible CASM header.
    pub fn has_binary_header(queue: &QueueRef) -> bool {
        let mut pos = ReadCursor::new(QueueRef::clone(queue));
        match (pos.read_u32(), pos.read_u32(), pos.read_u32()) {
            (Ok(magic), Ok(casm_version), _) => {
                magic == CASM_BINARY_MAGIC && casm_version == CASM_BINARY_VERSION
            }
            _ => false,
        }
    }

    pub fn read_binary(&self, queue: QueueRef) -> Result<SymbolTable> {
        self.read_binary_with_scope(queue, None)
    }

    /// Read with an enclosing scope whose definitions resolve symbols
    /// the algorithm leaves abstract.
    pub fn read_binary_with_scope(
        &self,
        queue: QueueRef,
        enclosing: Option<Rc<SymbolTable>>,
    ) -> Result<SymbolTable> {
        let mut pos = ReadCursor::new(queue);
        self.read_from(&mut pos, enclosing)
    }

    /// Probe whether the bytes at `pos` look like a CASM header,
    /// without consuming them.
    pub fn header_at(pos: &ReadCursor) -> bool {
        let mut probe = pos.clone();
        match (probe.read_u32(), probe.read_u32()) {
            (Ok(magic), Ok(casm_version)) => {
                magic == CASM_BINARY_MAGIC && casm_version == CASM_BINARY_VERSION
            }
            _ => false,
        }
    }

    /// Read one algorithm starting at `pos`, leaving the cursor after
    /// it so trailing data (or further algorithms) can follow.
    pub fn read_from(
        &self,
        pos: &mut ReadCursor,
        enclosing: Option<Rc<SymbolTable>>,
    ) -> Result<SymbolTable> {
        let mut inflater = match enclosing {
            Some(scope) => InflateAst::with_enclosing(scope),
            None => InflateAst::new(),
        };
        inflater.set_install_during_inflation(self.install);

        let magic = pos.read_u32()?;
        ensure!(
            magic == CASM_BINARY_MAGIC,
            "Not a casm file, bad magic: {magic:#010x}"
        );
        let casm_version = pos.read_u32()?;
        ensure!(
            casm_version == CASM_BINARY_VERSION,
            "Unknown casm version: {casm_version:#x}"
        );
        let wasm_version = pos.read_u32()?;
        for value in [magic, casm_version, wasm_version] {
            inflater
                .write_header_value(u64::from(value), IntTypeFormat::Uint32)
                .map_err(|error| anyhow!("{error}"))?;
        }

        let size = pos.read_varuint32()?;
        pos.push_eob(u64::from(size));

        self.read_symbol_names(pos, &mut inflater)
            .context("Reading casm symbol table")?;
        self.read_body(pos, &mut inflater)
            .context("Reading casm algorithm body")?;

        ensure!(pos.at_eob(), "Trailing bytes after algorithm");
        pos.pop_eob();
        inflater.into_symtab()
    }

    fn read_symbol_names(&self, pos: &mut ReadCursor, inflater: &mut InflateAst) -> Result<()> {
        let count = pos.read_varuint64()?;
        for _ in 0..count {
            let len = pos.read_varuint64()?;
            inflater
                .write_varuint64(len)
                .and_then(|()| {
                    inflater.write_action(PredefinedSym::SymbolNameBegin.action_value())
                })
                .map_err(|error| anyhow!("{error}"))?;
            for _ in 0..len {
                let byte = pos.read_varuint64()?;
                inflater
                    .write_varuint64(byte)
                    .map_err(|error| anyhow!("{error}"))?;
            }
            inflater
                .write_action(PredefinedSym::SymbolNameEnd.action_value())
                .map_err(|error| anyhow!("{error}"))?;
        }
        Ok(())
    }

    fn read_body(&self, pos: &mut ReadCursor, inflater: &mut InflateAst) -> Result<()> {
        loop {
            let op = pos.read_varuint64()?;
            let kind = u32::try_from(op)
                .ok()
                .and_then(|raw| NodeKind::try_from(raw).ok())
                .ok_or_else(|| anyhow!("Unknown opcode in casm stream: {op}"))?;
            inflater
                .write_varuint64(op)
                .map_err(|error| anyhow!("{error}"))?;
            let action = match kind.arity() {
                Arity::Integer => {
                    inflater
                        .write_action(PredefinedSym::IntValueBegin.action_value())
                        .map_err(|error| anyhow!("{error}"))?;
                    let tag = pos.read_varuint64()?;
                    inflater
                        .write_varuint64(tag)
                        .map_err(|error| anyhow!("{error}"))?;
                    if tag != 0 {
                        let value = pos.read_varuint64()?;
                        inflater
                            .write_varuint64(value)
                            .map_err(|error| anyhow!("{error}"))?;
                    }
                    PredefinedSym::IntValueEnd
                }
                Arity::Symbol => {
                    let index = pos.read_varuint64()?;
                    inflater
                        .write_varuint64(index)
                        .map_err(|error| anyhow!("{error}"))?;
                    PredefinedSym::SymbolLookup
                }
                Arity::Nullary if kind == NodeKind::Stream => {
                    let packed = pos.read_varuint64()?;
                    inflater
                        .write_varuint64(packed)
                        .map_err(|error| anyhow!("{error}"))?;
                    PredefinedSym::NaryInst
                }
                Arity::Nullary | Arity::Unary | Arity::Binary | Arity::Ternary => {
                    PredefinedSym::PostorderInst
                }
                Arity::Nary => {
                    let num_kids = pos.read_varuint64()?;
                    inflater
                        .write_varuint64(num_kids)
                        .map_err(|error| anyhow!("{error}"))?;
                    PredefinedSym::NaryInst
                }
            };
            inflater
                .write_action(action.action_value())
                .map_err(|error| anyhow!("{error}"))?;
            if kind == NodeKind::Algorithm {
                return Ok(());
            }
        }
    }
}

impl Default for CasmReader {
    fn default() -> Self {
        Self::new()
    }
}
