use anyhow::{anyhow, Result};

use super::flatten::FlattenAst;
use crate::ast::{PredefinedSym, SymbolTable};
use crate::interp::{ByteOutput, IntEntry, IntStream, IntStreamRef, StreamOutput};
use crate::stream::QueueRef;

/// Serializer from a flattened integer stream to CASM bytes: the raw
/// header triple, then LEB128-encoded opcodes and operands inside a
/// back-patched block. Structural actions occupy no bytes; the reader
/// regenerates them from the grammar.
pub struct CasmWriter {
    minimize_block_size: bool,
    /// Freeze the output queue once written; off when more data (e.g.
    /// an abbreviated body) follows the algorithm.
    freeze_on_finish: bool,
}

impl CasmWriter {
    pub fn new() -> Self {
        Self {
            minimize_block_size: true,
            freeze_on_finish: true,
        }
    }

    pub fn set_minimize_block_size(&mut self, minimize: bool) -> &mut Self {
        self.minimize_block_size = minimize;
        self
    }

    pub fn set_freeze_on_finish(&mut self, freeze: bool) -> &mut Self {
        self.freeze_on_finish = freeze;
        self
    }

    /// Flatten `symtab`'s algorithm and serialize it into `output`.
    pub fn write_symtab(&self, symtab: &SymbolTable, output: QueueRef) -> Result<()> {
        let stream = IntStream::new();
        FlattenAst::new(symtab, IntStreamRef::clone(&stream)).flatten()?;
        let stream = stream.borrow();
        self.write_stream(&stream, output)
    }

    /// Serialize an already-flattened stream into `output`.
    pub fn write_stream(&self, stream: &IntStream, output: QueueRef) -> Result<()> {
        let mut out = ByteOutput::new(output);
        out.set_minimize_block_size(self.minimize_block_size);
        for entry in stream.entries() {
            match *entry {
                IntEntry::Header(value, format) => out
                    .write_header_value(value, format)
                    .map_err(|error| anyhow!("{error}"))?,
                IntEntry::Value(value) => out
                    .write_varuint64(value)
                    .map_err(|error| anyhow!("{error}"))?,
                IntEntry::Action(action) => {
                    self.write_action(&mut out, action)?;
                }
            }
        }
        if self.freeze_on_finish {
            out.write_freeze_eof().map_err(|error| anyhow!("{error}"))?;
        }
        Ok(())
    }

    fn write_action(&self, out: &mut ByteOutput, action: u64) -> Result<()> {
        let sym = u32::try_from(action)
            .ok()
            .and_then(|raw| PredefinedSym::try_from(raw).ok());
        match sym {
            Some(PredefinedSym::BlockEnter | PredefinedSym::BlockEnterWriteonly) => {
                out.write_block_enter().map_err(|error| anyhow!("{error}"))
            }
            Some(PredefinedSym::BlockExit | PredefinedSym::BlockExitWriteonly) => {
                out.write_block_exit().map_err(|error| anyhow!("{error}"))
            }
            Some(PredefinedSym::Align) => {
                out.align_to_byte().map_err(|error| anyhow!("{error}"))
            }
            // Everything else frames the stream without taking space.
            _ => Ok(()),
        }
    }
}

impl Default for CasmWriter {
    fn default() -> Self {
        Self::new()
    }
}
